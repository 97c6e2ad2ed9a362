use crate::cache::EntityCache;
use crate::config::SyncSettings;
use crate::errors::{SyncError, SyncResult};
use crate::filter::{document_progress, DocumentProgress, FilterPipeline};
use crate::models::{
    ChangeEvent, Entity, EntityType, FilterPatch, FilterState, Principal, SubscriptionTier, SyncState,
    ViewModel,
};
use crate::policy::{AccessPolicy, FilterOperator};
use crate::reconciler::{ChangeReconciler, ReconcileOutcome};
use crate::remote::gateway::{RemoteGateway, Subscription};
use crate::remote::{Credentials, RemoteSource, TierSource};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

pub type ViewModelListener = Arc<dyn Fn(&ViewModel) + Send + Sync>;

enum ChannelMessage {
    Event(ChangeEvent),
    Rejected(SyncError),
}

/// One watched entity type: its push subscription and the task that feeds
/// events to the reconciler in arrival order.
struct ChannelWorker {
    subscription: Subscription,
    worker: JoinHandle<()>,
}

impl ChannelWorker {
    fn close(mut self) {
        self.subscription.close();
        self.worker.abort();
    }
}

struct Session {
    state: SyncState,
    generation: u64,
    principal: Option<Principal>,
    tier: SubscriptionTier,
    cache: EntityCache,
    filters: HashMap<EntityType, FilterState>,
    error: Option<String>,
    reauth_required: bool,
    channels: Vec<ChannelWorker>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SyncState::Uninitialized,
            generation: 0,
            principal: None,
            tier: SubscriptionTier::default(),
            cache: EntityCache::new(),
            filters: HashMap::new(),
            error: None,
            reauth_required: false,
            channels: Vec::new(),
        }
    }

    fn close_channels(&mut self) {
        for channel in self.channels.drain(..) {
            channel.close();
        }
    }

    fn principal_id(&self) -> Option<String> {
        self.principal.as_ref().map(|principal| principal.id.clone())
    }
}

struct InitialLoad {
    tier: SubscriptionTier,
    issued_at: DateTime<Utc>,
    collections: Vec<(EntityType, Vec<Entity>)>,
}

/// Owns the cache, filters and subscriptions for one signed-in principal and
/// publishes a projected view model per watched entity type.
pub struct SyncOrchestrator {
    gateway: RemoteGateway,
    tiers: Arc<dyn TierSource>,
    credentials: Credentials,
    settings: SyncSettings,
    policy: AccessPolicy,
    session: Mutex<Session>,
    /// Taken before the session lock is released so listeners see views in
    /// the order they were projected.
    delivery: Mutex<()>,
    listeners: RwLock<Vec<(String, ViewModelListener)>>,
    this: Weak<SyncOrchestrator>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        tiers: Arc<dyn TierSource>,
        credentials: Credentials,
        settings: SyncSettings,
    ) -> SyncResult<Arc<Self>> {
        settings.validate()?;
        let gateway = RemoteGateway::new(source, credentials.clone(), &settings);
        Ok(Arc::new_cyclic(|this| Self {
            gateway,
            tiers,
            credentials,
            settings,
            policy: AccessPolicy::new(),
            session: Mutex::new(Session::new()),
            delivery: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            this: this.clone(),
        }))
    }

    pub fn watched(&self) -> &[EntityType] {
        &self.settings.watched
    }

    /// Registers a listener and returns its id for `remove_listener`.
    pub fn on_view_model_changed<F>(&self, listener: F) -> String
    where
        F: Fn(&ViewModel) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4().to_string();
        self.listeners
            .write()
            .expect("listener write lock")
            .push((id.clone(), Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, listener_id: &str) -> bool {
        let mut listeners = self.listeners.write().expect("listener write lock");
        let before = listeners.len();
        listeners.retain(|(id, _)| id != listener_id);
        listeners.len() != before
    }

    pub async fn state(&self) -> SyncState {
        self.session.lock().await.state
    }

    pub async fn tier(&self) -> SubscriptionTier {
        self.session.lock().await.tier.clone()
    }

    pub async fn filter(&self, entity_type: EntityType) -> FilterState {
        let session = self.session.lock().await;
        session.filters.get(&entity_type).cloned().unwrap_or_default()
    }

    pub async fn available_filters(&self) -> BTreeSet<FilterOperator> {
        let session = self.session.lock().await;
        self.policy.available_filters(&session.tier)
    }

    /// Whether the principal's tier allows another entity of this type.
    pub async fn can_create(&self, entity_type: EntityType) -> bool {
        let session = self.session.lock().await;
        let count = session
            .principal
            .as_ref()
            .and_then(|principal| session.cache.get(entity_type, &principal.id))
            .map(|entry| entry.entities().len())
            .unwrap_or(0);
        self.policy.can_create(&session.tier, count)
    }

    /// Paperwork completion for one deal over the cached documents.
    pub async fn document_progress(&self, deal_id: &str) -> DocumentProgress {
        let session = self.session.lock().await;
        let documents = session
            .principal
            .as_ref()
            .and_then(|principal| session.cache.get(EntityType::Document, &principal.id))
            .map(|entry| entry.entities())
            .unwrap_or(&[]);
        document_progress(documents, deal_id)
    }

    /// Loads every watched type for `principal`. Never fails: exhaustion or
    /// rejected credentials land in `Degraded`. A later `start` supersedes an
    /// earlier one still in flight.
    pub async fn start(&self, principal: Principal) -> SyncState {
        let generation = {
            let mut session = self.session.lock().await;
            session.generation += 1;
            session.close_channels();
            if let Some(previous) = session.principal_id() {
                if previous != principal.id {
                    session.cache.evict_principal(&previous);
                }
            }
            session.state = SyncState::Initializing;
            session.principal = Some(principal.clone());
            session.error = None;
            session.reauth_required = false;
            session.generation
        };
        tracing::info!(principal_id = %principal.id, generation, "sync starting");
        self.emit_all().await;

        let outcome = self.initial_load(&principal, generation).await;

        let state = {
            let mut session = self.session.lock().await;
            if session.generation != generation {
                tracing::debug!(principal_id = %principal.id, generation, "discarding superseded start");
                return session.state;
            }
            match outcome {
                Ok(load) => {
                    session.tier = load.tier;
                    let ttl = self.settings.cache_ttl();
                    for (entity_type, entities) in load.collections {
                        session
                            .cache
                            .merge_fetched(entity_type, &principal.id, entities, ttl, load.issued_at);
                    }
                    session.state = SyncState::Ready;
                    session.channels = self.open_channels(&principal.id, generation);
                    tracing::info!(principal_id = %principal.id, tier = %session.tier.slug, "sync ready");
                }
                Err(error) => self.degrade(&mut session, &error),
            }
            session.state
        };
        self.emit_all().await;
        state
    }

    async fn initial_load(&self, principal: &Principal, generation: u64) -> SyncResult<InitialLoad> {
        let attempts = self.settings.initial_load_attempts;
        let mut last_error = SyncError::Internal("initial load never attempted".to_string());

        for attempt in 1..=attempts {
            if !self.is_current(generation).await {
                return Err(SyncError::Internal("superseded by a newer start".to_string()));
            }
            match self.load_once(principal).await {
                Ok(load) => return Ok(load),
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) => {
                    tracing::warn!(
                        principal_id = %principal.id,
                        attempt,
                        max_attempts = attempts,
                        error = %self.gateway.redactor().scrub(&error),
                        "initial load failed"
                    );
                    last_error = error;
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.initial_backoff(attempt)).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn load_once(&self, principal: &Principal) -> SyncResult<InitialLoad> {
        let token = self.credentials.token();
        let tier = timeout(self.gateway.fetch_timeout(), self.tiers.get_tier(&principal.id, &token))
            .await
            .map_err(|_| SyncError::RemoteUnavailable("subscription tier lookup timed out".to_string()))??;

        let issued_at = Utc::now();
        let mut collections = Vec::with_capacity(self.settings.watched.len());
        for entity_type in &self.settings.watched {
            let entities = self.gateway.fetch(*entity_type, &principal.id, None).await?;
            collections.push((*entity_type, entities));
        }
        Ok(InitialLoad {
            tier,
            issued_at,
            collections,
        })
    }

    /// Refetches every watched type. The current view stays visible while
    /// the fetch runs and is kept if it fails.
    pub async fn refresh(&self) -> SyncState {
        let watched = self.settings.watched.clone();
        self.refresh_types(watched).await
    }

    async fn refresh_types(&self, entity_types: Vec<EntityType>) -> SyncState {
        let (principal_id, generation, resume_state) = {
            let mut session = self.session.lock().await;
            let Some(principal_id) = session.principal_id() else {
                return session.state;
            };
            if session.reauth_required
                || !matches!(session.state, SyncState::Ready | SyncState::Degraded)
            {
                return session.state;
            }
            let resume_state = session.state;
            session.state = SyncState::Refreshing;
            (principal_id, session.generation, resume_state)
        };
        self.emit_types(&entity_types).await;

        let issued_at = Utc::now();
        let mut results = Vec::with_capacity(entity_types.len());
        for entity_type in &entity_types {
            let result = self.gateway.fetch(*entity_type, &principal_id, None).await;
            results.push((*entity_type, result));
        }

        let state = {
            let mut session = self.session.lock().await;
            if session.generation != generation {
                return session.state;
            }
            let ttl = self.settings.cache_ttl();
            let mut failure = None;
            for (entity_type, result) in results {
                match result {
                    Ok(entities) => {
                        session
                            .cache
                            .merge_fetched(entity_type, &principal_id, entities, ttl, issued_at);
                    }
                    Err(error) => {
                        tracing::warn!(
                            entity_type = %entity_type,
                            error = %self.gateway.redactor().scrub(&error),
                            "refresh failed; keeping cached view"
                        );
                        if failure.is_none() || matches!(error, SyncError::Unauthorized(_)) {
                            failure = Some(error);
                        }
                    }
                }
            }

            match failure {
                Some(error @ SyncError::Unauthorized(_)) => self.degrade(&mut session, &error),
                Some(_) => session.state = resume_state,
                None => {
                    session.state = SyncState::Ready;
                    session.error = None;
                    if session.channels.is_empty() {
                        session.channels = self.open_channels(&principal_id, generation);
                    }
                }
            }
            session.state
        };
        self.emit_all().await;
        state
    }

    /// Merges `patch` into the type's filter and re-projects. Unknown value
    /// ranges and operators the tier lacks are rejected; the filter is unchanged.
    pub async fn set_filter(&self, entity_type: EntityType, patch: FilterPatch) -> SyncResult<ViewModel> {
        let mut session = self.session.lock().await;
        let mut next = session.filters.get(&entity_type).cloned().unwrap_or_default();
        next.merge(patch);
        FilterPipeline::new(entity_type).validate(&next)?;
        self.policy.validate_filter(&next, &session.tier)?;
        session.filters.insert(entity_type, next);
        let view = self.project(&session, entity_type);
        self.deliver(session, vec![view.clone()]).await;
        Ok(view)
    }

    /// Current projection. A stale cache entry is still returned, and a
    /// background refetch is started for it.
    pub async fn view_model(&self, entity_type: EntityType) -> ViewModel {
        let (view, refetch) = {
            let session = self.session.lock().await;
            let refetch = session.state == SyncState::Ready
                && session
                    .principal
                    .as_ref()
                    .is_some_and(|principal| session.cache.is_stale(entity_type, &principal.id));
            (self.project(&session, entity_type), refetch)
        };
        if refetch {
            self.spawn_refresh(entity_type);
        }
        view
    }

    /// Live single-entity read for a detail view; bypasses the list cache.
    pub async fn select_entity(&self, entity_type: EntityType, entity_id: &str) -> SyncResult<Entity> {
        let principal_id = self
            .session
            .lock()
            .await
            .principal_id()
            .ok_or_else(|| SyncError::Policy("no principal is signed in".to_string()))?;

        let entity = self
            .gateway
            .fetch_one(entity_type, entity_id, &principal_id)
            .await
            .map_err(|error| match error {
                SyncError::Unauthorized(message) => {
                    SyncError::Unauthorized(self.gateway.redactor().scrub(message))
                }
                other => other,
            })?;
        match entity {
            Some(entity) if entity.is_visible_to(&principal_id) => Ok(entity),
            _ => Err(SyncError::NotFound(format!("{} {}", entity_type, entity_id))),
        }
    }

    /// Closes every subscription and drops the principal's cache entries.
    pub async fn cleanup(&self) {
        {
            let mut session = self.session.lock().await;
            session.generation += 1;
            session.close_channels();
            if let Some(principal_id) = session.principal_id() {
                let evicted = session.cache.evict_principal(&principal_id);
                tracing::info!(principal_id = %principal_id, evicted, "sync cleaned up");
            }
            session.principal = None;
            session.state = SyncState::Closed;
            session.error = None;
            session.reauth_required = false;
        }
        self.emit_all().await;
    }

    fn degrade(&self, session: &mut Session, error: &SyncError) {
        let message = self.gateway.redactor().scrub(error);
        session.reauth_required = matches!(error, SyncError::Unauthorized(_));
        if session.reauth_required {
            session.close_channels();
        }
        session.state = SyncState::Degraded;
        session.error = Some(message.clone());
        tracing::error!(reauth_required = session.reauth_required, error = %message, "sync degraded");
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.session.lock().await.generation == generation
    }

    fn open_channels(&self, principal_id: &str, generation: u64) -> Vec<ChannelWorker> {
        self.settings
            .watched
            .iter()
            .map(|entity_type| self.open_channel(*entity_type, principal_id, generation))
            .collect()
    }

    fn open_channel(&self, entity_type: EntityType, principal_id: &str, generation: u64) -> ChannelWorker {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ChannelMessage>();
        let rejected = sender.clone();
        let subscription = self.gateway.subscribe(
            entity_type,
            move |event| {
                if sender.send(ChannelMessage::Event(event)).is_err() {
                    tracing::debug!("change event arrived after worker shutdown");
                }
            },
            move |error| {
                let _ = rejected.send(ChannelMessage::Rejected(error));
            },
        );

        let reconciler = ChangeReconciler::new(self.gateway.clone(), principal_id);
        let this = self.this.clone();
        let worker = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let Some(orchestrator) = this.upgrade() else {
                    break;
                };
                match message {
                    ChannelMessage::Event(event) => {
                        orchestrator.handle_event(&reconciler, generation, event).await;
                    }
                    ChannelMessage::Rejected(error) => orchestrator.spawn_reauth(generation, error),
                }
            }
        });

        ChannelWorker {
            subscription,
            worker,
        }
    }

    async fn handle_event(&self, reconciler: &ChangeReconciler, generation: u64, event: ChangeEvent) {
        let entity_type = event.entity_type;
        let entity_id = event.entity_id.clone();

        let resolution = match reconciler.resolve(event).await {
            Ok(resolution) => resolution,
            Err(error @ SyncError::Unauthorized(_)) => {
                self.spawn_reauth(generation, error);
                return;
            }
            Err(error) => {
                tracing::warn!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    error = %error,
                    "dropping change event"
                );
                return;
            }
        };

        let mut session = self.session.lock().await;
        if session.generation != generation || session.state == SyncState::Closed {
            return;
        }
        match reconciler.apply(&mut session.cache, resolution) {
            ReconcileOutcome::Changed => {
                tracing::debug!(entity_type = %entity_type, entity_id = %entity_id, "applied change event");
                let view = self.project(&session, entity_type);
                self.deliver(session, vec![view]).await;
            }
            ReconcileOutcome::Unchanged => {}
            ReconcileOutcome::MissingEntry => {
                drop(session);
                self.spawn_refresh(entity_type);
            }
        }
    }

    /// Runs outside the channel worker, since degrading aborts every worker.
    fn spawn_reauth(&self, generation: u64, error: SyncError) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.require_reauth(generation, error).await;
        });
    }

    async fn require_reauth(&self, generation: u64, error: SyncError) {
        let mut session = self.session.lock().await;
        if session.generation != generation
            || session.state == SyncState::Closed
            || session.reauth_required
        {
            return;
        }
        self.degrade(&mut session, &error);
        let views = self
            .settings
            .watched
            .iter()
            .map(|entity_type| self.project(&session, *entity_type))
            .collect();
        self.deliver(session, views).await;
    }

    fn spawn_refresh(&self, entity_type: EntityType) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            this.refresh_types(vec![entity_type]).await;
        });
    }

    fn project(&self, session: &Session, entity_type: EntityType) -> ViewModel {
        let entities = session
            .principal
            .as_ref()
            .and_then(|principal| session.cache.get(entity_type, &principal.id))
            .map(|entry| entry.entities())
            .unwrap_or(&[]);
        let filter = session.filters.get(&entity_type).cloned().unwrap_or_default();
        let mut error = session.error.clone();

        let filtered = match FilterPipeline::new(entity_type).apply(entities, &filter) {
            Ok(filtered) => filtered,
            Err(filter_error) => {
                error = Some(filter_error.to_string());
                Vec::new()
            }
        };
        let slice = self.policy.visible_slice(&filtered, &session.tier);

        ViewModel {
            entity_type,
            shown: slice.shown,
            hidden_count: slice.hidden_count,
            is_loading: matches!(session.state, SyncState::Initializing | SyncState::Refreshing),
            state: session.state,
            error,
            reauth_required: session.reauth_required,
        }
    }

    async fn emit_all(&self) {
        let watched = self.settings.watched.clone();
        self.emit_types(&watched).await;
    }

    async fn emit_types(&self, entity_types: &[EntityType]) {
        let session = self.session.lock().await;
        let views = entity_types
            .iter()
            .map(|entity_type| self.project(&session, *entity_type))
            .collect::<Vec<_>>();
        self.deliver(session, views).await;
    }

    /// Hands the views to listeners in projection order. The session lock is
    /// released once delivery is queued.
    async fn deliver(&self, session: MutexGuard<'_, Session>, views: Vec<ViewModel>) {
        let _delivery = self.delivery.lock().await;
        drop(session);
        self.notify(&views);
    }

    fn notify(&self, views: &[ViewModel]) {
        let listeners = self
            .listeners
            .read()
            .expect("listener read lock")
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for view in views {
            for listener in &listeners {
                listener(view);
            }
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            session.close_channels();
        }
    }
}
