use crate::cache::display_order;
use crate::config::{ReconnectPolicy, SyncSettings};
use crate::errors::{SyncError, SyncResult};
use crate::models::{ChangeEvent, ChangeOperation, Entity, EntityType, FetchHints};
use crate::redaction::Redactor;
use crate::remote::{Credentials, RemoteSource};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

type DedupeKey = (String, ChangeOperation, DateTime<Utc>);

/// Remembers the most recent `(entity id, operation, updated_at)` keys
/// delivered on a channel so a replay after reconnect is not delivered twice.
#[derive(Debug)]
struct DedupeWindow {
    seen: HashSet<DedupeKey>,
    order: VecDeque<DedupeKey>,
    capacity: usize,
}

impl DedupeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false when the key was already delivered.
    fn insert(&mut self, key: DedupeKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// A live push channel. Dropping it closes the channel as well.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    entity_type: EntityType,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.handle.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(subscription_id = %self.id, entity_type = %self.entity_type, "push channel closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Clone)]
pub struct RemoteGateway {
    source: Arc<dyn RemoteSource>,
    credentials: Credentials,
    fetch_timeout: Duration,
    reconnect: ReconnectPolicy,
    dedupe_window: usize,
}

impl RemoteGateway {
    pub fn new(source: Arc<dyn RemoteSource>, credentials: Credentials, settings: &SyncSettings) -> Self {
        Self {
            source,
            credentials,
            fetch_timeout: settings.fetch_timeout(),
            reconnect: settings.reconnect_policy(),
            dedupe_window: settings.dedupe_window,
        }
    }

    pub fn redactor(&self) -> Redactor {
        Redactor::new(Some(self.credentials.token()))
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Scoped query, newest first, bounded by the configured timeout.
    pub async fn fetch(
        &self,
        entity_type: EntityType,
        principal_id: &str,
        hints: Option<&FetchHints>,
    ) -> SyncResult<Vec<Entity>> {
        self.fetch_with_timeout(entity_type, principal_id, hints, self.fetch_timeout)
            .await
    }

    pub async fn fetch_with_timeout(
        &self,
        entity_type: EntityType,
        principal_id: &str,
        hints: Option<&FetchHints>,
        limit: Duration,
    ) -> SyncResult<Vec<Entity>> {
        let token = self.credentials.token();
        let default_hints = FetchHints::default();
        let hints = hints.unwrap_or(&default_hints);
        let mut entities = timeout(limit, self.source.query(entity_type, principal_id, &token, hints))
            .await
            .map_err(|_| {
                SyncError::RemoteUnavailable(format!(
                    "{} query timed out after {}ms",
                    entity_type,
                    limit.as_millis()
                ))
            })??;
        entities.retain(|entity| entity.entity_type() == entity_type);
        entities.sort_by(display_order);
        tracing::debug!(entity_type = %entity_type, count = entities.len(), "fetched entities");
        Ok(entities)
    }

    /// Single-entity read that never touches the list cache.
    pub async fn fetch_one(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        principal_id: &str,
    ) -> SyncResult<Option<Entity>> {
        let token = self.credentials.token();
        timeout(
            self.fetch_timeout,
            self.source.fetch_one(entity_type, entity_id, principal_id, &token),
        )
        .await
        .map_err(|_| {
            SyncError::RemoteUnavailable(format!(
                "{} {} point fetch timed out after {}ms",
                entity_type,
                entity_id,
                self.fetch_timeout.as_millis()
            ))
        })?
    }

    /// Opens the push channel for `entity_type` and keeps it open across
    /// drops until the returned subscription is closed. `on_rejected` runs
    /// once if the backend refuses the credentials; the channel stays closed.
    pub fn subscribe<F, R>(&self, entity_type: EntityType, on_event: F, on_rejected: R) -> Subscription
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
        R: FnOnce(SyncError) + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let closed = Arc::new(AtomicBool::new(false));
        let gateway = self.clone();
        let task_closed = closed.clone();
        let subscription_id = id.clone();

        let handle = tokio::spawn(async move {
            gateway
                .run_channel(entity_type, &subscription_id, task_closed, on_event, on_rejected)
                .await;
        });

        Subscription {
            id,
            entity_type,
            closed,
            handle: Some(handle),
        }
    }

    async fn run_channel<F, R>(
        &self,
        entity_type: EntityType,
        subscription_id: &str,
        closed: Arc<AtomicBool>,
        on_event: F,
        on_rejected: R,
    ) where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
        R: FnOnce(SyncError) + Send + 'static,
    {
        let mut delivered = DedupeWindow::new(self.dedupe_window);
        let mut consecutive_failures = 0u32;

        while !closed.load(Ordering::SeqCst) {
            let token = self.credentials.token();
            match self.source.open_channel(entity_type, &token).await {
                Ok(mut receiver) => {
                    consecutive_failures = 0;
                    tracing::info!(subscription_id, entity_type = %entity_type, "push channel open");
                    while let Some(event) = receiver.recv().await {
                        if closed.load(Ordering::SeqCst) {
                            return;
                        }
                        if event.entity_type != entity_type {
                            continue;
                        }
                        if let Some(key) = event.dedupe_key() {
                            if !delivered.insert(key) {
                                tracing::debug!(
                                    subscription_id,
                                    entity_id = %event.entity_id,
                                    "dropping replayed change event"
                                );
                                continue;
                            }
                        }
                        on_event(event);
                    }
                    tracing::warn!(subscription_id, entity_type = %entity_type, "push channel dropped");
                }
                Err(SyncError::Unauthorized(message)) => {
                    let message = self.redactor().scrub(&message);
                    tracing::error!(
                        subscription_id,
                        entity_type = %entity_type,
                        error = %message,
                        "push channel rejected credentials; not reconnecting"
                    );
                    closed.store(true, Ordering::SeqCst);
                    on_rejected(SyncError::Unauthorized(message));
                    return;
                }
                Err(error) => {
                    tracing::warn!(
                        subscription_id,
                        entity_type = %entity_type,
                        error = %self.redactor().scrub(&error),
                        "failed to open push channel"
                    );
                }
            }

            if closed.load(Ordering::SeqCst) {
                return;
            }
            consecutive_failures = consecutive_failures.saturating_add(1);
            let delay = self.reconnect.delay(consecutive_failures);
            tracing::info!(
                subscription_id,
                entity_type = %entity_type,
                attempt = consecutive_failures,
                delay_ms = delay.as_millis() as u64,
                "reconnecting push channel"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOperation, DealRecord, EntityPayload, SubscriptionTier};
    use crate::remote::memory::InMemoryRemote;
    use std::sync::Mutex as StdMutex;

    const PRINCIPAL: &str = "buyer-1";

    fn deal(id: &str, updated_at: DateTime<Utc>) -> Entity {
        Entity::new(
            id,
            updated_at,
            vec![PRINCIPAL.to_string()],
            EntityPayload::Deal(DealRecord {
                business_name: format!("Shop {id}"),
                status: "negotiation".to_string(),
                ..DealRecord::default()
            }),
        )
    }

    fn gateway(remote: &Arc<InMemoryRemote>) -> RemoteGateway {
        RemoteGateway::new(remote.clone(), Credentials::new("token-1"), &SyncSettings::default())
    }

    #[test]
    fn dedupe_window_forgets_oldest() {
        let at = Utc::now();
        let key = |id: &str| (id.to_string(), ChangeOperation::Update, at);
        let mut window = DedupeWindow::new(2);
        assert!(window.insert(key("a")));
        assert!(!window.insert(key("a")));
        assert!(window.insert(key("b")));
        assert!(window.insert(key("c")));
        assert!(window.insert(key("a")));
    }

    #[tokio::test]
    async fn fetch_orders_newest_first() {
        let remote = Arc::new(InMemoryRemote::new());
        let at = Utc::now();
        remote.seed(deal("old", at - chrono::Duration::minutes(5))).await;
        remote.seed(deal("new", at)).await;
        remote.set_tier(PRINCIPAL, SubscriptionTier::free()).await;

        let entities = gateway(&remote)
            .fetch(EntityType::Deal, PRINCIPAL, None)
            .await
            .expect("fetch");
        let ids = entities.iter().map(|e| e.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_as_remote_unavailable() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.hang_queries(true).await;

        let err = gateway(&remote)
            .fetch_with_timeout(EntityType::Deal, PRINCIPAL, None, Duration::from_millis(250))
            .await
            .expect_err("hung query times out");
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn rejected_token_surfaces_unauthorized() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.require_token("token-2").await;
        let err = gateway(&remote)
            .fetch(EntityType::Deal, PRINCIPAL, None)
            .await
            .expect_err("token mismatch");
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_does_not_redeliver_replayed_events() {
        let remote = Arc::new(InMemoryRemote::new());
        let received = Arc::new(StdMutex::new(Vec::new()));
        let sink = received.clone();
        let mut subscription = gateway(&remote).subscribe(
            EntityType::Deal,
            move |event| sink.lock().expect("sink lock").push(event),
            |_| {},
        );

        remote.wait_for_channels(EntityType::Deal, 1).await;
        let event = ChangeEvent::upserted(ChangeOperation::Insert, deal("1", Utc::now()));
        remote.publish(event.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        remote.drop_channels(EntityType::Deal).await;
        remote.wait_for_channels(EntityType::Deal, 1).await;
        remote.publish(event.clone()).await;
        let fresh = ChangeEvent::upserted(ChangeOperation::Update, deal("1", Utc::now() + chrono::Duration::seconds(1)));
        remote.publish(fresh.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let delivered = received.lock().expect("sink lock").clone();
        assert_eq!(delivered, vec![event, fresh]);
        assert_eq!(remote.channel_opens(EntityType::Deal).await, 2);

        subscription.close();
        assert!(subscription.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_channel_stops_reconnecting() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.require_token("other").await;
        let (rejected_tx, rejected_rx) = tokio::sync::oneshot::channel();
        let subscription = gateway(&remote).subscribe(EntityType::Document, |_| {}, move |error| {
            let _ = rejected_tx.send(error);
        });
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(subscription.is_closed());
        assert_eq!(remote.channel_opens(EntityType::Document).await, 0);
        let error = rejected_rx.await.expect("rejection reported");
        assert!(matches!(error, SyncError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn delete_carrying_last_row_is_not_taken_for_a_replay() {
        let remote = Arc::new(InMemoryRemote::new());
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = gateway(&remote).subscribe(
            EntityType::Deal,
            move |event| {
                let _ = sender.send(event);
            },
            |_| {},
        );
        remote.wait_for_channels(EntityType::Deal, 1).await;

        let last_row = deal("x", Utc::now());
        remote
            .publish(ChangeEvent::upserted(ChangeOperation::Update, last_row.clone()))
            .await;
        remote
            .publish(ChangeEvent::upserted(ChangeOperation::Delete, last_row))
            .await;

        let mut operations = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("event in time")
                .expect("subscription alive");
            operations.push(event.operation);
        }
        assert_eq!(operations, vec![ChangeOperation::Update, ChangeOperation::Delete]);
    }
}
