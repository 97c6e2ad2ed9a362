pub mod gateway;
pub mod memory;

use crate::errors::SyncResult;
use crate::models::{ChangeEvent, Entity, EntityType, FetchHints, SubscriptionTier};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// The backend's query and push API. Every call carries the opaque session token.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Entities the principal participates in. Backends scope by their own
    /// participant relation; `hints` is advisory.
    async fn query(
        &self,
        entity_type: EntityType,
        principal_id: &str,
        token: &str,
        hints: &FetchHints,
    ) -> SyncResult<Vec<Entity>>;

    async fn fetch_one(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        principal_id: &str,
        token: &str,
    ) -> SyncResult<Option<Entity>>;

    /// Opens a push channel for one entity type. The channel ends when the
    /// backend drops the connection.
    async fn open_channel(
        &self,
        entity_type: EntityType,
        token: &str,
    ) -> SyncResult<mpsc::Receiver<ChangeEvent>>;
}

#[async_trait]
pub trait TierSource: Send + Sync {
    async fn get_tier(&self, principal_id: &str, token: &str) -> SyncResult<SubscriptionTier>;
}

/// Shared handle to the session token. The authentication layer rotates it;
/// the gateway reads it on every call.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<String>>,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.into())),
        }
    }

    pub fn token(&self) -> String {
        self.token.read().expect("credentials read lock").clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        let mut writer = self.token.write().expect("credentials write lock");
        *writer = token.into();
    }
}
