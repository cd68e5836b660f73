use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use moka::future::Cache;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{UserDirectory, UserProfile};
use crate::error::DirectoryError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "type")]
    type_: String,
    exp: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    display_name: String,
    avatar: Option<String>,
}

/// Directory backed by the workspace's user service, authenticated with a
/// short-lived service JWT. Resolved profiles are cached for five minutes of
/// inactivity.
pub struct HttpUserDirectory {
    client: Client,
    base_url: String,
    jwt_secret: String,
    service_name: String,
    cache: Cache<String, UserProfile>,
}

impl HttpUserDirectory {
    pub fn new(base_url: String, jwt_secret: String, service_name: String) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;

        let cache = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(std::time::Duration::from_secs(5 * 60))
            .build();

        Ok(Self {
            client,
            base_url,
            jwt_secret,
            service_name,
            cache,
        })
    }

    fn generate_token(&self) -> Result<String, DirectoryError> {
        // 1 minute expiration
        let expiration = (Utc::now() + Duration::seconds(60)).timestamp();

        let claims = Claims {
            sub: self.service_name.clone(),
            type_: "service".to_string(),
            exp: expiration as usize,
        };

        Ok(encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?)
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        let token = self.generate_token()?;
        let url = format!("{}/users/{}", self.base_url.trim_end_matches('/'), user_id);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(DirectoryError::UserNotFound(user_id.to_string()));
        }

        let record: UserRecord = response.error_for_status()?.json().await?;
        Ok(UserProfile {
            user_id: user_id.to_string(),
            display_name: record.display_name,
            avatar: record.avatar,
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn resolve(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        if let Some(profile) = self.cache.get(user_id).await {
            return Ok(profile);
        }

        info!("User profile cache miss for uid {}. Refreshing from user service.", user_id);
        let profile = self.fetch_profile(user_id).await.map_err(|e| {
            error!("Failed to resolve user {}: {}", user_id, e);
            e
        })?;

        self.cache.insert(user_id.to_string(), profile.clone()).await;
        Ok(profile)
    }

    fn cached_profiles(&self) -> u64 {
        self.cache.entry_count()
    }
}
