use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Deal,
    Document,
    Activity,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Deal, Self::Document, Self::Activity];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deal => "deal",
            Self::Document => "document",
            Self::Activity => "activity",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealRecord {
    pub deal_number: String,
    pub business_name: String,
    pub business_type: String,
    pub location: String,
    pub status: String,
    pub asking_price: Option<f64>,
    pub negotiated_price: Option<f64>,
    pub progress_percentage: Option<u8>,
    pub expected_closing: Option<NaiveDate>,
}

impl DealRecord {
    /// Stored progress, or the stage default when the backend left it empty.
    pub fn effective_progress(&self) -> u8 {
        if let Some(progress) = self.progress_percentage {
            return progress.min(100);
        }
        match self.status.as_str() {
            "initial_interest" => 15,
            "due_diligence" => 35,
            "negotiation" => 55,
            "financing" => 75,
            "legal_review" => 85,
            "closing" => 95,
            _ => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub status: String,
    pub size_bytes: Option<u64>,
    /// Absent for templates that belong to no deal.
    #[serde(default)]
    pub deal_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub deal_id: String,
    pub title: String,
    pub description: String,
    pub activity_type: String,
    pub actor_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "data", rename_all = "kebab-case")]
pub enum EntityPayload {
    Deal(DealRecord),
    Document(DocumentRecord),
    Activity(ActivityRecord),
}

impl EntityPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Deal(_) => EntityType::Deal,
            Self::Document(_) => EntityType::Document,
            Self::Activity(_) => EntityType::Activity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub updated_at: DateTime<Utc>,
    pub visibility_scope: Vec<String>,
    pub payload: EntityPayload,
}

impl Entity {
    pub fn new(
        id: impl Into<String>,
        updated_at: DateTime<Utc>,
        visibility_scope: Vec<String>,
        payload: EntityPayload,
    ) -> Self {
        Self {
            id: id.into(),
            updated_at,
            visibility_scope,
            payload,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn is_visible_to(&self, principal_id: &str) -> bool {
        self.visibility_scope.iter().any(|scope| scope == principal_id)
    }

    /// The deal this entity belongs to; a deal belongs to itself.
    pub fn deal_id(&self) -> Option<&str> {
        match &self.payload {
            EntityPayload::Deal(_) => Some(self.id.as_str()),
            EntityPayload::Document(document) => document.deal_id.as_deref(),
            EntityPayload::Activity(activity) => Some(activity.deal_id.as_str()),
        }
    }

    pub fn status(&self) -> &str {
        match &self.payload {
            EntityPayload::Deal(deal) => &deal.status,
            EntityPayload::Document(document) => &document.status,
            EntityPayload::Activity(activity) => &activity.activity_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub operation: ChangeOperation,
    pub entity_id: String,
    pub payload: Option<Entity>,
}

impl ChangeEvent {
    pub fn upserted(operation: ChangeOperation, entity: Entity) -> Self {
        Self {
            entity_type: entity.entity_type(),
            operation,
            entity_id: entity.id.clone(),
            payload: Some(entity),
        }
    }

    pub fn id_only(entity_type: EntityType, operation: ChangeOperation, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            operation,
            entity_id: entity_id.into(),
            payload: None,
        }
    }

    /// Identity of the logical change, when the transport carried a timestamp.
    /// A delete carrying the last row shares its timestamp with the update
    /// before it, so the operation is part of the key.
    pub fn dedupe_key(&self) -> Option<(String, ChangeOperation, DateTime<Utc>)> {
        self.payload
            .as_ref()
            .map(|entity| (self.entity_id.clone(), self.operation, entity.updated_at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterState {
    pub search: String,
    pub status: Option<String>,
    pub value_range: Option<String>,
    pub category: Option<String>,
    pub deal_id: Option<String>,
}

/// Category tab that shows every document.
pub const ALL_CATEGORIES: &str = "all";

impl FilterState {
    pub fn is_active(&self) -> bool {
        !self.search.is_empty()
            || self.status.is_some()
            || self.value_range.is_some()
            || self.category.is_some()
            || self.deal_id.is_some()
    }

    /// Fields set in the patch overwrite. An empty string clears every field
    /// but search; category `all` clears the category.
    pub fn merge(&mut self, patch: FilterPatch) {
        if let Some(search) = patch.search {
            self.search = search;
        }
        if let Some(status) = patch.status {
            self.status = non_empty(status);
        }
        if let Some(value_range) = patch.value_range {
            self.value_range = non_empty(value_range);
        }
        if let Some(category) = patch.category {
            self.category = non_empty(category).filter(|category| category != ALL_CATEGORIES);
        }
        if let Some(deal_id) = patch.deal_id {
            self.deal_id = non_empty(deal_id);
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    pub search: Option<String>,
    pub status: Option<String>,
    pub value_range: Option<String>,
    pub category: Option<String>,
    pub deal_id: Option<String>,
}

impl FilterPatch {
    pub fn search(value: impl Into<String>) -> Self {
        Self {
            search: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn status(value: impl Into<String>) -> Self {
        Self {
            status: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn value_range(value: impl Into<String>) -> Self {
        Self {
            value_range: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn category(value: impl Into<String>) -> Self {
        Self {
            category: Some(value.into()),
            ..Self::default()
        }
    }

    /// Narrows the view to one deal's own records.
    pub fn deal(deal_id: impl Into<String>) -> Self {
        Self {
            deal_id: Some(deal_id.into()),
            ..Self::default()
        }
    }

    pub fn cleared() -> Self {
        Self {
            search: Some(String::new()),
            status: Some(String::new()),
            value_range: Some(String::new()),
            category: Some(String::new()),
            deal_id: Some(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTier {
    pub slug: String,
    /// `None` means unlimited.
    pub max_visible_entities: Option<usize>,
}

pub const FREE_TIER_SLUG: &str = "free";
pub const FREE_TIER_MAX_VISIBLE: usize = 3;

impl SubscriptionTier {
    pub fn free() -> Self {
        Self {
            slug: FREE_TIER_SLUG.to_string(),
            max_visible_entities: Some(FREE_TIER_MAX_VISIBLE),
        }
    }

    pub fn unlimited(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            max_visible_entities: None,
        }
    }

    pub fn limited(slug: impl Into<String>, max_visible_entities: usize) -> Self {
        Self {
            slug: slug.into(),
            max_visible_entities: Some(max_visible_entities),
        }
    }

    pub fn is_free(&self) -> bool {
        self.slug == FREE_TIER_SLUG
    }
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::free()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Server-side narrowing passed along with a scoped query. Backends may ignore it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchHints {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Uninitialized,
    Initializing,
    Ready,
    Refreshing,
    Degraded,
    Closed,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Refreshing => "refreshing",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewModel {
    pub entity_type: EntityType,
    pub shown: Vec<Entity>,
    pub hidden_count: usize,
    pub is_loading: bool,
    pub state: SyncState,
    pub error: Option<String>,
    pub reauth_required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_falls_back_to_stage_defaults() {
        let mut deal = DealRecord {
            status: "negotiation".to_string(),
            ..DealRecord::default()
        };
        assert_eq!(deal.effective_progress(), 55);

        deal.status = "unknown_stage".to_string();
        assert_eq!(deal.effective_progress(), 10);

        deal.progress_percentage = Some(120);
        assert_eq!(deal.effective_progress(), 100);
    }

    #[test]
    fn filter_patch_clears_with_empty_strings() {
        let mut filter = FilterState::default();
        filter.merge(FilterPatch::status("negotiation"));
        filter.merge(FilterPatch::value_range("0-250000"));
        assert_eq!(filter.status.as_deref(), Some("negotiation"));
        assert!(filter.is_active());

        filter.merge(FilterPatch::search("tire"));
        assert_eq!(filter.status.as_deref(), Some("negotiation"));
        assert_eq!(filter.search, "tire");

        filter.merge(FilterPatch::cleared());
        assert_eq!(filter, FilterState::default());
        assert!(!filter.is_active());
    }

    #[test]
    fn entity_serializes_with_type_tag() {
        let entity = Entity::new(
            "d-1",
            Utc::now(),
            vec!["u-1".to_string()],
            EntityPayload::Deal(DealRecord {
                business_name: "Main Street Auto".to_string(),
                ..DealRecord::default()
            }),
        );
        let value = serde_json::to_value(&entity).expect("serialize entity");
        assert_eq!(value["payload"]["entityType"], "deal");
        assert_eq!(value["payload"]["data"]["businessName"], "Main Street Auto");
        assert_eq!(value["visibilityScope"][0], "u-1");

        let back: Entity = serde_json::from_value(value).expect("deserialize entity");
        assert_eq!(back, entity);
    }

    #[test]
    fn id_only_events_have_no_dedupe_key() {
        let event = ChangeEvent::id_only(EntityType::Deal, ChangeOperation::Update, "d-1");
        assert!(event.dedupe_key().is_none());
    }

    #[test]
    fn delete_with_last_row_is_a_distinct_change() {
        let entity = Entity::new("d-1", Utc::now(), vec![], EntityPayload::Deal(DealRecord::default()));
        let update = ChangeEvent::upserted(ChangeOperation::Update, entity.clone());
        let delete = ChangeEvent::upserted(ChangeOperation::Delete, entity);
        assert_ne!(update.dedupe_key(), delete.dedupe_key());
    }

    #[test]
    fn all_category_and_blank_deal_clear_scope() {
        let mut filter = FilterState::default();
        filter.merge(FilterPatch::category("legal"));
        filter.merge(FilterPatch::deal("d-9"));
        assert_eq!(filter.category.as_deref(), Some("legal"));
        assert_eq!(filter.deal_id.as_deref(), Some("d-9"));

        filter.merge(FilterPatch::category(ALL_CATEGORIES));
        filter.merge(FilterPatch::deal(""));
        assert_eq!(filter, FilterState::default());
    }

    #[test]
    fn entities_report_their_deal() {
        let at = Utc::now();
        let deal = Entity::new("d-1", at, vec![], EntityPayload::Deal(DealRecord::default()));
        let template = Entity::new("t-1", at, vec![], EntityPayload::Document(DocumentRecord::default()));
        let note = Entity::new(
            "a-1",
            at,
            vec![],
            EntityPayload::Activity(ActivityRecord {
                deal_id: "d-1".to_string(),
                ..ActivityRecord::default()
            }),
        );
        assert_eq!(deal.deal_id(), Some("d-1"));
        assert_eq!(template.deal_id(), None);
        assert_eq!(note.deal_id(), Some("d-1"));
    }
}
