//! Device token resolution for push delivery.
//!
//! The resolver is the seam between delivery and the user/device data.
//! Zero tokens is a valid outcome, not an error; the dispatcher decides
//! what an empty result means for a job.

use std::sync::Arc;

use async_trait::async_trait;
use pushline_core::{models::DeviceToken, storage::Storage, UserId};

use crate::error::{DeliveryError, Result};

/// Resolves a user's registered device tokens.
#[async_trait]
pub trait TokenResolver: Send + Sync + 'static {
    /// Returns the user's registered tokens, oldest registration first.
    ///
    /// An empty vector means the user has no registered devices.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if the lookup fails.
    async fn tokens_for(&self, user_id: UserId) -> Result<Vec<DeviceToken>>;
}

/// Production resolver backed by the device_tokens repository.
pub struct StorageTokenResolver {
    storage: Arc<Storage>,
}

impl StorageTokenResolver {
    /// Creates a resolver over the given storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TokenResolver for StorageTokenResolver {
    async fn tokens_for(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
        self.storage
            .device_tokens
            .find_by_user(user_id)
            .await
            .map_err(|e| DeliveryError::database(format!("token lookup failed: {e}")))
    }
}

pub mod mock {
    //! Static in-memory resolver for testing.

    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::Utc;
    use pushline_core::models::{DeviceToken, Platform, UserId};
    use tokio::sync::RwLock;
    use uuid::Uuid;

    use super::TokenResolver;
    use crate::error::{DeliveryError, Result};

    /// Resolver returning preconfigured tokens per user.
    pub struct StaticTokenResolver {
        tokens: RwLock<HashMap<UserId, Vec<DeviceToken>>>,
        error: RwLock<Option<String>>,
    }

    impl StaticTokenResolver {
        /// Creates an empty resolver; every lookup returns no tokens.
        pub fn new() -> Self {
            Self { tokens: RwLock::new(HashMap::new()), error: RwLock::new(None) }
        }

        /// Registers a token for a user.
        pub async fn register(&self, user_id: UserId, token: &str, platform: Platform) {
            let entry = DeviceToken {
                id: Uuid::new_v4(),
                user_id,
                token: token.to_string(),
                platform,
                created_at: Utc::now(),
            };
            self.tokens.write().await.entry(user_id).or_default().push(entry);
        }

        /// Injects an error for the next lookup.
        pub async fn inject_error(&self, error: String) {
            *self.error.write().await = Some(error);
        }
    }

    impl Default for StaticTokenResolver {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl TokenResolver for StaticTokenResolver {
        async fn tokens_for(&self, user_id: UserId) -> Result<Vec<DeviceToken>> {
            let error = self.error.write().await.take();
            if let Some(error) = error {
                return Err(DeliveryError::database(error));
            }

            Ok(self.tokens.read().await.get(&user_id).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use pushline_core::models::Platform;

    use super::{mock::StaticTokenResolver, *};

    #[tokio::test]
    async fn unknown_user_resolves_to_empty() {
        let resolver = StaticTokenResolver::new();
        let tokens = resolver.tokens_for(UserId::new()).await.unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn registered_tokens_are_returned_in_order() {
        let resolver = StaticTokenResolver::new();
        let user = UserId::new();

        resolver.register(user, "token-a", Platform::Android).await;
        resolver.register(user, "token-b", Platform::Ios).await;

        let tokens = resolver.tokens_for(user).await.unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].token, "token-a");
        assert_eq!(tokens[1].token, "token-b");
    }

    #[tokio::test]
    async fn injected_error_surfaces_once() {
        let resolver = StaticTokenResolver::new();
        resolver.inject_error("connection lost".to_string()).await;

        assert!(resolver.tokens_for(UserId::new()).await.is_err());
        assert!(resolver.tokens_for(UserId::new()).await.is_ok());
    }
}
