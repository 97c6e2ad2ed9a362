use crate::cache::display_order;
use crate::errors::{SyncError, SyncResult};
use crate::models::{ChangeEvent, ChangeOperation, Entity, EntityType, FetchHints, SubscriptionTier};
use crate::remote::{RemoteSource, TierSource};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryState {
    entities: HashMap<EntityType, BTreeMap<String, Entity>>,
    tiers: HashMap<String, SubscriptionTier>,
    channels: HashMap<EntityType, Vec<mpsc::Sender<ChangeEvent>>>,
    channel_opens: HashMap<EntityType, usize>,
    required_token: Option<String>,
    failing_queries: u32,
    failing_point_fetches: u32,
    hang_queries: bool,
    query_delay: Option<Duration>,
    query_count: usize,
}

impl MemoryState {
    fn check_token(&self, token: &str) -> SyncResult<()> {
        match &self.required_token {
            Some(required) if required != token => {
                Err(SyncError::Unauthorized("session token rejected".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Process-local backend: a participant-scoped entity store with a push
/// broadcast per entity type and switches for simulating outages.
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<MemoryState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entity without notifying subscribers.
    pub async fn seed(&self, entity: Entity) {
        let mut state = self.state.lock().await;
        state
            .entities
            .entry(entity.entity_type())
            .or_default()
            .insert(entity.id.clone(), entity);
    }

    pub async fn set_tier(&self, principal_id: &str, tier: SubscriptionTier) {
        let mut state = self.state.lock().await;
        state.tiers.insert(principal_id.to_string(), tier);
    }

    pub async fn require_token(&self, token: &str) {
        self.state.lock().await.required_token = Some(token.to_string());
    }

    pub async fn fail_next_queries(&self, count: u32) {
        self.state.lock().await.failing_queries = count;
    }

    pub async fn fail_next_point_fetches(&self, count: u32) {
        self.state.lock().await.failing_point_fetches = count;
    }

    pub async fn hang_queries(&self, hang: bool) {
        self.state.lock().await.hang_queries = hang;
    }

    /// Queries read the store immediately but answer only after `delay`,
    /// so changes published meanwhile are missing from the result.
    pub async fn delay_queries(&self, delay: Option<Duration>) {
        self.state.lock().await.query_delay = delay;
    }

    pub async fn query_count(&self) -> usize {
        self.state.lock().await.query_count
    }

    pub async fn channel_opens(&self, entity_type: EntityType) -> usize {
        let state = self.state.lock().await;
        state.channel_opens.get(&entity_type).copied().unwrap_or(0)
    }

    /// Applies the change to the store and pushes it to every open channel.
    pub async fn publish(&self, event: ChangeEvent) {
        let senders = {
            let mut state = self.state.lock().await;
            let collection = state.entities.entry(event.entity_type).or_default();
            match (event.operation, &event.payload) {
                (ChangeOperation::Delete, _) => {
                    collection.remove(&event.entity_id);
                }
                (_, Some(entity)) => {
                    collection.insert(entity.id.clone(), entity.clone());
                }
                (_, None) => {}
            }
            let senders = state.channels.entry(event.entity_type).or_default();
            senders.retain(|sender| !sender.is_closed());
            senders.clone()
        };

        for sender in senders {
            if sender.send(event.clone()).await.is_err() {
                tracing::debug!(entity_type = %event.entity_type, "push receiver already gone");
            }
        }
    }

    /// Simulates the backend dropping every connection for a type.
    pub async fn drop_channels(&self, entity_type: EntityType) {
        let mut state = self.state.lock().await;
        state.channels.remove(&entity_type);
    }

    pub async fn open_channel_count(&self, entity_type: EntityType) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .get(&entity_type)
            .map(|senders| senders.iter().filter(|sender| !sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub async fn wait_for_channels(&self, entity_type: EntityType, count: usize) {
        while self.open_channel_count(entity_type).await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn query(
        &self,
        entity_type: EntityType,
        principal_id: &str,
        token: &str,
        hints: &FetchHints,
    ) -> SyncResult<Vec<Entity>> {
        let hang = {
            let mut state = self.state.lock().await;
            state.query_count += 1;
            state.check_token(token)?;
            if state.failing_queries > 0 {
                state.failing_queries -= 1;
                return Err(SyncError::RemoteUnavailable("connection reset by peer".to_string()));
            }
            state.hang_queries
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().await;
        let delay = state.query_delay;
        let mut entities = state
            .entities
            .get(&entity_type)
            .map(|collection| {
                collection
                    .values()
                    .filter(|entity| entity.is_visible_to(principal_id))
                    .filter(|entity| {
                        hints
                            .status
                            .as_deref()
                            .map(|status| entity.status() == status)
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        drop(state);
        entities.sort_by(display_order);
        if let Some(limit) = hints.limit {
            entities.truncate(limit);
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(entities)
    }

    async fn fetch_one(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        _principal_id: &str,
        token: &str,
    ) -> SyncResult<Option<Entity>> {
        let mut state = self.state.lock().await;
        state.check_token(token)?;
        if state.failing_point_fetches > 0 {
            state.failing_point_fetches -= 1;
            return Err(SyncError::RemoteUnavailable("point fetch failed".to_string()));
        }
        Ok(state
            .entities
            .get(&entity_type)
            .and_then(|collection| collection.get(entity_id))
            .cloned())
    }

    async fn open_channel(
        &self,
        entity_type: EntityType,
        token: &str,
    ) -> SyncResult<mpsc::Receiver<ChangeEvent>> {
        let mut state = self.state.lock().await;
        state.check_token(token)?;
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        state.channels.entry(entity_type).or_default().push(sender);
        *state.channel_opens.entry(entity_type).or_insert(0) += 1;
        Ok(receiver)
    }
}

#[async_trait]
impl TierSource for InMemoryRemote {
    async fn get_tier(&self, principal_id: &str, token: &str) -> SyncResult<SubscriptionTier> {
        let state = self.state.lock().await;
        state.check_token(token)?;
        Ok(state.tiers.get(principal_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentRecord, EntityPayload};
    use chrono::Utc;

    fn document(id: &str, scope: &[&str], status: &str) -> Entity {
        Entity::new(
            id,
            Utc::now(),
            scope.iter().map(|s| s.to_string()).collect(),
            EntityPayload::Document(DocumentRecord {
                name: format!("Doc {id}"),
                status: status.to_string(),
                ..DocumentRecord::default()
            }),
        )
    }

    #[tokio::test]
    async fn query_is_scoped_to_participants() {
        let remote = InMemoryRemote::new();
        remote.seed(document("mine", &["u-1"], "draft")).await;
        remote.seed(document("shared", &["u-1", "u-2"], "final")).await;
        remote.seed(document("theirs", &["u-2"], "final")).await;

        let mut ids = remote
            .query(EntityType::Document, "u-1", "", &FetchHints::default())
            .await
            .expect("query")
            .into_iter()
            .map(|e| e.id)
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["mine", "shared"]);

        let hinted = remote
            .query(
                EntityType::Document,
                "u-1",
                "",
                &FetchHints {
                    status: Some("final".to_string()),
                    limit: None,
                },
            )
            .await
            .expect("query");
        assert_eq!(hinted.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let remote = InMemoryRemote::new();
        remote.fail_next_queries(1).await;
        assert!(remote
            .query(EntityType::Deal, "u-1", "", &FetchHints::default())
            .await
            .is_err());
        assert!(remote
            .query(EntityType::Deal, "u-1", "", &FetchHints::default())
            .await
            .is_ok());
        assert_eq!(remote.query_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_query_answers_from_its_snapshot() {
        let remote = std::sync::Arc::new(InMemoryRemote::new());
        remote.seed(document("early", &["u-1"], "draft")).await;
        remote.delay_queries(Some(Duration::from_millis(200))).await;

        let pending = {
            let remote = remote.clone();
            tokio::spawn(async move {
                remote
                    .query(EntityType::Document, "u-1", "", &FetchHints::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        remote.seed(document("late", &["u-1"], "draft")).await;

        let ids = pending
            .await
            .expect("query task")
            .expect("query")
            .into_iter()
            .map(|e| e.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["early"]);
    }

    #[tokio::test]
    async fn publish_updates_store_and_channels() {
        let remote = InMemoryRemote::new();
        let mut receiver = remote.open_channel(EntityType::Document, "").await.expect("open");
        let doc = document("d", &["u-1"], "draft");
        remote
            .publish(ChangeEvent::upserted(ChangeOperation::Insert, doc.clone()))
            .await;

        let event = receiver.recv().await.expect("event");
        assert_eq!(event.entity_id, "d");
        let stored = remote
            .fetch_one(EntityType::Document, "d", "u-1", "")
            .await
            .expect("fetch");
        assert_eq!(stored, Some(doc));

        remote
            .publish(ChangeEvent::id_only(EntityType::Document, ChangeOperation::Delete, "d"))
            .await;
        assert!(remote
            .fetch_one(EntityType::Document, "d", "u-1", "")
            .await
            .expect("fetch")
            .is_none());
    }
}
