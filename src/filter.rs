use crate::errors::{SyncError, SyncResult};
use crate::models::{Entity, EntityPayload, EntityType, FilterState};
use serde::{Deserialize, Serialize};

/// Half-open numeric bin `[min, max)`; `max = None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBin {
    pub key: &'static str,
    pub min: f64,
    pub max: Option<f64>,
}

impl ValueBin {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && self.max.map(|max| value < max).unwrap_or(true)
    }
}

const DEAL_PRICE_BINS: &[ValueBin] = &[
    ValueBin {
        key: "0-250000",
        min: 0.0,
        max: Some(250_000.0),
    },
    ValueBin {
        key: "250000-500000",
        min: 250_000.0,
        max: Some(500_000.0),
    },
    ValueBin {
        key: "500000-1000000",
        min: 500_000.0,
        max: Some(1_000_000.0),
    },
    ValueBin {
        key: "1000000+",
        min: 1_000_000.0,
        max: None,
    },
];

const DOCUMENT_SIZE_BINS: &[ValueBin] = &[
    ValueBin {
        key: "0-1000000",
        min: 0.0,
        max: Some(1_000_000.0),
    },
    ValueBin {
        key: "1000000-10000000",
        min: 1_000_000.0,
        max: Some(10_000_000.0),
    },
    ValueBin {
        key: "10000000+",
        min: 10_000_000.0,
        max: None,
    },
];

pub fn value_bins(entity_type: EntityType) -> &'static [ValueBin] {
    match entity_type {
        EntityType::Deal => DEAL_PRICE_BINS,
        EntityType::Document => DOCUMENT_SIZE_BINS,
        EntityType::Activity => &[],
    }
}

fn searchable_fields(entity: &Entity) -> Vec<&str> {
    match &entity.payload {
        EntityPayload::Deal(deal) => vec![
            deal.business_name.as_str(),
            deal.location.as_str(),
            deal.business_type.as_str(),
            deal.deal_number.as_str(),
        ],
        EntityPayload::Document(document) => {
            let mut fields = vec![
                document.name.as_str(),
                document.description.as_str(),
                document.category.as_str(),
            ];
            fields.extend(document.tags.iter().map(String::as_str));
            fields
        }
        EntityPayload::Activity(activity) => {
            let mut fields = vec![activity.title.as_str(), activity.description.as_str()];
            if let Some(actor) = &activity.actor_name {
                fields.push(actor.as_str());
            }
            fields
        }
    }
}

fn category(entity: &Entity) -> Option<&str> {
    match &entity.payload {
        EntityPayload::Document(document) => Some(document.category.as_str()),
        _ => None,
    }
}

fn range_value(entity: &Entity) -> Option<f64> {
    match &entity.payload {
        EntityPayload::Deal(deal) => Some(deal.asking_price.unwrap_or(0.0)),
        EntityPayload::Document(document) => Some(document.size_bytes.unwrap_or(0) as f64),
        EntityPayload::Activity(_) => None,
    }
}

/// Search, status, value-range, category and deal predicates for one entity
/// type, ANDed together.
#[derive(Debug, Clone, Copy)]
pub struct FilterPipeline {
    entity_type: EntityType,
}

impl FilterPipeline {
    pub fn new(entity_type: EntityType) -> Self {
        Self { entity_type }
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// Unknown keys are an error; they never fall back to matching everything.
    pub fn resolve_bin(&self, key: &str) -> SyncResult<ValueBin> {
        value_bins(self.entity_type)
            .iter()
            .find(|bin| bin.key == key)
            .copied()
            .ok_or_else(|| {
                SyncError::InvalidFilterValue(format!(
                    "'{}' is not a value range for {} entities",
                    key, self.entity_type
                ))
            })
    }

    pub fn validate(&self, filter: &FilterState) -> SyncResult<()> {
        if let Some(key) = &filter.value_range {
            self.resolve_bin(key)?;
        }
        if filter.category.is_some() && self.entity_type != EntityType::Document {
            return Err(SyncError::InvalidFilterValue(format!(
                "{} entities have no category",
                self.entity_type
            )));
        }
        Ok(())
    }

    pub fn apply(&self, entities: &[Entity], filter: &FilterState) -> SyncResult<Vec<Entity>> {
        self.validate(filter)?;
        let bin = filter
            .value_range
            .as_deref()
            .map(|key| self.resolve_bin(key))
            .transpose()?;
        let needle = filter.search.to_lowercase();
        let status = filter.status.as_deref().filter(|status| !status.is_empty());
        let wanted_category = filter.category.as_deref();
        let deal_id = filter.deal_id.as_deref();

        Ok(entities
            .iter()
            .filter(|entity| matches_search(entity, &needle))
            .filter(|entity| status.map(|status| entity.status() == status).unwrap_or(true))
            .filter(|entity| match &bin {
                Some(bin) => range_value(entity).is_some_and(|value| bin.contains(value)),
                None => true,
            })
            .filter(|entity| wanted_category.map(|wanted| category(entity) == Some(wanted)).unwrap_or(true))
            .filter(|entity| deal_id.map(|deal_id| entity.deal_id() == Some(deal_id)).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// Completion of a deal's paperwork, counted over its documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentProgress {
    pub total: usize,
    pub completed: usize,
    pub pending: usize,
    /// Rounded; 0 when the deal has no documents.
    pub percentage: u8,
}

pub const COMPLETED_DOCUMENT_STATUS: &str = "completed";

pub fn document_progress(entities: &[Entity], deal_id: &str) -> DocumentProgress {
    let documents = entities
        .iter()
        .filter(|entity| entity.entity_type() == EntityType::Document)
        .filter(|entity| entity.deal_id() == Some(deal_id))
        .collect::<Vec<_>>();
    let total = documents.len();
    let completed = documents
        .iter()
        .filter(|entity| entity.status() == COMPLETED_DOCUMENT_STATUS)
        .count();
    let percentage = if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as u8
    };
    DocumentProgress {
        total,
        completed,
        pending: total - completed,
        percentage,
    }
}

fn matches_search(entity: &Entity, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    searchable_fields(entity)
        .into_iter()
        .any(|field| field.to_lowercase().contains(needle))
}
