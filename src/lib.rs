//! Client-side synchronization for the marketplace dashboard: a per-principal
//! entity cache kept current by push events, filtered and tier-gated into view
//! models for the deals, documents and activity screens.

pub mod cache;
pub mod config;
pub mod errors;
pub mod filter;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod reconciler;
pub mod redaction;
pub mod remote;

pub use crate::cache::{CacheEntry, EntityCache};
pub use crate::config::SyncSettings;
pub use crate::errors::{SyncError, SyncResult};
pub use crate::filter::{DocumentProgress, FilterPipeline};
pub use crate::models::{
    ActivityRecord, ChangeEvent, ChangeOperation, DealRecord, DocumentRecord, Entity, EntityPayload,
    EntityType, FilterPatch, FilterState, Principal, SubscriptionTier, SyncState, ViewModel,
};
pub use crate::orchestrator::SyncOrchestrator;
pub use crate::policy::{AccessPolicy, VisibleSlice};
pub use crate::reconciler::ChangeReconciler;
pub use crate::remote::gateway::{RemoteGateway, Subscription};
pub use crate::remote::memory::InMemoryRemote;
pub use crate::remote::{Credentials, RemoteSource, TierSource};
