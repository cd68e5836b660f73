//! User directory: resolves a user id to the identity shown in
//! "locked by X" banners.

pub mod user_directory_client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::DirectoryError;

pub use user_directory_client::HttpUserDirectory;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl UserProfile {
    /// Stand-in used when the directory cannot resolve the user.
    pub fn anonymous(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            avatar: None,
        }
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<UserProfile, DirectoryError>;

    /// Profiles currently held in a local cache, if the directory keeps one.
    fn cached_profiles(&self) -> u64 {
        0
    }
}

/// Fixed set of profiles, for deployments without a directory service.
#[derive(Debug, Default, Clone)]
pub struct StaticUserDirectory {
    profiles: HashMap<String, UserProfile>,
}

impl StaticUserDirectory {
    pub fn new(profiles: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            profiles: profiles
                .into_iter()
                .map(|p| (p.user_id.clone(), p))
                .collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn resolve(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        self.profiles
            .get(user_id)
            .cloned()
            .ok_or_else(|| DirectoryError::UserNotFound(user_id.to_string()))
    }
}
