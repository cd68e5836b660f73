use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clients::UserProfile;

/// Lock ownership as seen by one session. Derived from `lockedBy`, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockState {
    Free,
    HeldBySelf,
    HeldByOther { holder: String },
}

impl LockState {
    /// Classify a `lockedBy` value from the point of view of `user_id`.
    pub fn classify(locked_by: Option<&str>, user_id: &str) -> Self {
        match locked_by {
            None => LockState::Free,
            Some(holder) if holder == user_id => LockState::HeldBySelf,
            Some(holder) => LockState::HeldByOther {
                holder: holder.to_string(),
            },
        }
    }

    pub fn is_held_by_self(&self) -> bool {
        matches!(self, LockState::HeldBySelf)
    }

    pub fn is_held_by_other(&self) -> bool {
        matches!(self, LockState::HeldByOther { .. })
    }

    /// Only the holder may edit; a session waiting on a free lock is read-only
    /// until its acquire lands.
    pub fn is_read_only(&self) -> bool {
        !self.is_held_by_self()
    }

    pub fn holder(&self) -> Option<&str> {
        match self {
            LockState::HeldByOther { holder } => Some(holder),
            _ => None,
        }
    }
}

/// Locally known lock state plus what the shell needs to render it.
#[derive(Debug, Clone, PartialEq)]
pub struct LockStatus {
    pub state: LockState,
    /// Resolved identity of the other holder, present in `HeldByOther`.
    pub holder: Option<UserProfile>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockStatus {
    pub fn free() -> Self {
        Self {
            state: LockState::Free,
            holder: None,
            locked_at: None,
        }
    }
}

/// Holder identity in API responses
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockHolderResponse {
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Response for the lock status of a document
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockInfoResponse {
    pub document_id: Uuid,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub holder: Option<LockHolderResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_covers_all_three_states() {
        assert_eq!(LockState::classify(None, "alice"), LockState::Free);
        assert_eq!(LockState::classify(Some("alice"), "alice"), LockState::HeldBySelf);
        assert_eq!(
            LockState::classify(Some("bob"), "alice"),
            LockState::HeldByOther { holder: "bob".into() }
        );
    }

    #[test]
    fn only_the_holder_is_writable() {
        assert!(LockState::Free.is_read_only());
        assert!(!LockState::HeldBySelf.is_read_only());
        assert!(LockState::HeldByOther { holder: "bob".into() }.is_read_only());
    }

    #[test]
    fn lock_state_serializes_with_a_state_tag() {
        let json = serde_json::to_value(LockState::HeldByOther { holder: "bob".into() }).unwrap();
        assert_eq!(json["state"], "HELD_BY_OTHER");
        assert_eq!(json["holder"], "bob");
    }
}
