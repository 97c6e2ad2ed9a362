use crate::cache::{EntityCache, UpsertOutcome};
use crate::errors::{SyncError, SyncResult};
use crate::models::{ChangeEvent, ChangeOperation, Entity, EntityType};
use crate::remote::gateway::RemoteGateway;
use chrono::{DateTime, Utc};

/// What a change event means for one principal's cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Upsert(Entity),
    Remove {
        entity_type: EntityType,
        entity_id: String,
    },
    /// The principal can no longer see the entity. `as_of` is absent when the
    /// backend returned nothing for a point fetch.
    Revoke {
        entity_type: EntityType,
        entity_id: String,
        as_of: Option<DateTime<Utc>>,
    },
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Changed,
    Unchanged,
    /// The key has no cache entry; the caller should refetch it.
    MissingEntry,
}

/// Decides relevance of push events for one principal and merges them into the cache.
#[derive(Clone)]
pub struct ChangeReconciler {
    gateway: RemoteGateway,
    principal_id: String,
}

impl ChangeReconciler {
    pub fn new(gateway: RemoteGateway, principal_id: impl Into<String>) -> Self {
        Self {
            gateway,
            principal_id: principal_id.into(),
        }
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// The only suspension point is the point fetch for id-only events.
    /// Rejected credentials surface as `Unauthorized`; any other point-fetch
    /// failure as `RelevanceFetchFailed`.
    pub async fn resolve(&self, event: ChangeEvent) -> SyncResult<Resolution> {
        let ChangeEvent {
            entity_type,
            operation,
            entity_id,
            payload,
        } = event;

        if operation == ChangeOperation::Delete {
            return Ok(Resolution::Remove {
                entity_type,
                entity_id,
            });
        }

        let entity = match payload {
            Some(entity) => Some(entity),
            None => self
                .gateway
                .fetch_one(entity_type, &entity_id, &self.principal_id)
                .await
                .map_err(|error| match error {
                    SyncError::Unauthorized(message) => {
                        SyncError::Unauthorized(self.gateway.redactor().scrub(message))
                    }
                    other => SyncError::RelevanceFetchFailed(format!(
                        "{} {}: {}",
                        entity_type,
                        entity_id,
                        self.gateway.redactor().scrub(&other)
                    )),
                })?,
        };

        let Some(entity) = entity else {
            return Ok(Resolution::Revoke {
                entity_type,
                entity_id,
                as_of: None,
            });
        };

        if entity.entity_type() != entity_type || entity.id != entity_id {
            tracing::warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                payload_type = %entity.entity_type(),
                "change event payload does not match its header"
            );
            return Ok(Resolution::Ignore);
        }

        if entity.is_visible_to(&self.principal_id) {
            Ok(Resolution::Upsert(entity))
        } else {
            Ok(Resolution::Revoke {
                entity_type,
                entity_id,
                as_of: Some(entity.updated_at),
            })
        }
    }

    pub fn apply(&self, cache: &mut EntityCache, resolution: Resolution) -> ReconcileOutcome {
        match resolution {
            Resolution::Upsert(entity) => {
                let entity_type = entity.entity_type();
                match cache.upsert(entity_type, &self.principal_id, entity) {
                    UpsertOutcome::NoEntry => ReconcileOutcome::MissingEntry,
                    outcome if outcome.changed() => ReconcileOutcome::Changed,
                    _ => ReconcileOutcome::Unchanged,
                }
            }
            Resolution::Remove {
                entity_type,
                entity_id,
            } => changed_if(cache.remove(entity_type, &self.principal_id, &entity_id)),
            Resolution::Revoke {
                entity_type,
                entity_id,
                as_of,
            } => {
                let cached_is_newer = cache
                    .get(entity_type, &self.principal_id)
                    .and_then(|entry| entry.find(&entity_id))
                    .zip(as_of)
                    .is_some_and(|(cached, as_of)| cached.updated_at > as_of);
                if cached_is_newer {
                    return ReconcileOutcome::Unchanged;
                }
                changed_if(cache.remove(entity_type, &self.principal_id, &entity_id))
            }
            Resolution::Ignore => ReconcileOutcome::Unchanged,
        }
    }

    pub async fn reconcile(&self, cache: &mut EntityCache, event: ChangeEvent) -> SyncResult<ReconcileOutcome> {
        let resolution = self.resolve(event).await?;
        Ok(self.apply(cache, resolution))
    }
}

fn changed_if(changed: bool) -> ReconcileOutcome {
    if changed {
        ReconcileOutcome::Changed
    } else {
        ReconcileOutcome::Unchanged
    }
}
