use crate::models::{Entity, EntityType};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity_type: EntityType,
    pub principal_id: String,
}

impl CacheKey {
    pub fn new(entity_type: EntityType, principal_id: &str) -> Self {
        Self {
            entity_type,
            principal_id: principal_id.to_string(),
        }
    }
}

/// A mutation applied from the push channel since the last full fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalChange {
    at: DateTime<Utc>,
    removed: bool,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    entities: Vec<Entity>,
    fetched_at: DateTime<Utc>,
    ttl: chrono::Duration,
    local_changes: HashMap<String, LocalChange>,
}

impl CacheEntry {
    fn new(mut entities: Vec<Entity>, fetched_at: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        entities.sort_by(display_order);
        Self {
            entities,
            fetched_at,
            ttl,
            local_changes: HashMap::new(),
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn find(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.iter().find(|entity| entity.id == entity_id)
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) > self.ttl
    }
}

/// Most recently updated first, ties broken by id so output is deterministic.
pub fn display_order(a: &Entity, b: &Entity) -> Ordering {
    b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// The cached copy is newer; nothing changed.
    Superseded,
    /// No entry for the key; the next fetch will bring the entity in.
    NoEntry,
}

impl UpsertOutcome {
    pub fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Replaced)
    }
}

/// Entity collections keyed by `(entity type, principal)`.
#[derive(Debug, Default)]
pub struct EntityCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_type: EntityType, principal_id: &str) -> Option<&CacheEntry> {
        self.entries.get(&CacheKey::new(entity_type, principal_id))
    }

    pub fn put(
        &mut self,
        entity_type: EntityType,
        principal_id: &str,
        entities: Vec<Entity>,
        ttl: chrono::Duration,
    ) {
        self.put_at(entity_type, principal_id, entities, ttl, Utc::now());
    }

    pub fn put_at(
        &mut self,
        entity_type: EntityType,
        principal_id: &str,
        entities: Vec<Entity>,
        ttl: chrono::Duration,
        fetched_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            CacheKey::new(entity_type, principal_id),
            CacheEntry::new(entities, fetched_at, ttl),
        );
    }

    /// Inserts or replaces one entity by id. The newer `updated_at` wins; on a
    /// tie the incoming copy replaces the cached one. `fetched_at` is untouched.
    pub fn upsert(&mut self, entity_type: EntityType, principal_id: &str, entity: Entity) -> UpsertOutcome {
        let Some(entry) = self.entries.get_mut(&CacheKey::new(entity_type, principal_id)) else {
            return UpsertOutcome::NoEntry;
        };

        let entity_id = entity.id.clone();
        let outcome = match entry.entities.iter().position(|cached| cached.id == entity.id) {
            Some(index) if entry.entities[index].updated_at > entity.updated_at => {
                return UpsertOutcome::Superseded;
            }
            Some(index) => {
                entry.entities[index] = entity;
                UpsertOutcome::Replaced
            }
            None => {
                entry.entities.push(entity);
                UpsertOutcome::Inserted
            }
        };
        entry.entities.sort_by(display_order);
        entry.local_changes.insert(
            entity_id,
            LocalChange {
                at: Utc::now(),
                removed: false,
            },
        );
        outcome
    }

    /// Returns whether an entity was actually dropped.
    pub fn remove(&mut self, entity_type: EntityType, principal_id: &str, entity_id: &str) -> bool {
        let Some(entry) = self.entries.get_mut(&CacheKey::new(entity_type, principal_id)) else {
            return false;
        };
        entry.local_changes.insert(
            entity_id.to_string(),
            LocalChange {
                at: Utc::now(),
                removed: true,
            },
        );
        let before = entry.entities.len();
        entry.entities.retain(|entity| entity.id != entity_id);
        entry.entities.len() != before
    }

    pub fn invalidate(&mut self, entity_type: EntityType, principal_id: &str) {
        self.entries.remove(&CacheKey::new(entity_type, principal_id));
    }

    pub fn evict_principal(&mut self, principal_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.principal_id != principal_id);
        before - self.entries.len()
    }

    /// Absent entries count as stale.
    pub fn is_stale(&self, entity_type: EntityType, principal_id: &str) -> bool {
        self.is_stale_at(entity_type, principal_id, Utc::now())
    }

    pub fn is_stale_at(&self, entity_type: EntityType, principal_id: &str, now: DateTime<Utc>) -> bool {
        self.get(entity_type, principal_id)
            .map(|entry| entry.is_stale_at(now))
            .unwrap_or(true)
    }

    /// Installs the result of a full fetch issued at `issued_at` without losing
    /// push changes applied while it was in flight.
    pub fn merge_fetched(
        &mut self,
        entity_type: EntityType,
        principal_id: &str,
        fetched: Vec<Entity>,
        ttl: chrono::Duration,
        issued_at: DateTime<Utc>,
    ) {
        let key = CacheKey::new(entity_type, principal_id);
        let Some(previous) = self.entries.remove(&key) else {
            self.entries.insert(key, CacheEntry::new(fetched, Utc::now(), ttl));
            return;
        };

        let changed_since_issue = |id: &str| {
            previous
                .local_changes
                .get(id)
                .filter(|change| change.at >= issued_at)
                .copied()
        };

        let mut cached_by_id = previous
            .entities
            .iter()
            .map(|entity| (entity.id.as_str(), entity))
            .collect::<HashMap<_, _>>();

        let mut merged = Vec::with_capacity(fetched.len());
        for incoming in fetched {
            if changed_since_issue(&incoming.id).is_some_and(|change| change.removed) {
                continue;
            }
            match cached_by_id.remove(incoming.id.as_str()) {
                Some(cached) if cached.updated_at >= incoming.updated_at => merged.push(cached.clone()),
                _ => merged.push(incoming),
            }
        }
        merged.extend(
            cached_by_id
                .into_values()
                .filter(|cached| changed_since_issue(&cached.id).is_some_and(|change| !change.removed))
                .cloned(),
        );

        self.entries.insert(key, CacheEntry::new(merged, Utc::now(), ttl));
    }
}
