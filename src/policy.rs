use crate::errors::{SyncError, SyncResult};
use crate::models::{Entity, FilterState, SubscriptionTier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOperator {
    Search,
    Status,
    ValueRange,
    Category,
    DealScope,
}

impl FilterOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Status => "status",
            Self::ValueRange => "value-range",
            Self::Category => "category",
            Self::DealScope => "deal-scope",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleSlice {
    pub shown: Vec<Entity>,
    pub hidden_count: usize,
}

/// Tier gating for list views: how many entities a principal may see and which
/// filter operators the tier unlocks.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy;

impl AccessPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Truncates to the tier limit, keeping the input order.
    pub fn visible_slice(&self, entities: &[Entity], tier: &SubscriptionTier) -> VisibleSlice {
        let limit = tier.max_visible_entities.unwrap_or(usize::MAX);
        let shown = entities.iter().take(limit).cloned().collect::<Vec<_>>();
        VisibleSlice {
            hidden_count: entities.len() - shown.len(),
            shown,
        }
    }

    pub fn available_filters(&self, tier: &SubscriptionTier) -> BTreeSet<FilterOperator> {
        let mut operators = BTreeSet::from([
            FilterOperator::Search,
            FilterOperator::Status,
            FilterOperator::Category,
            FilterOperator::DealScope,
        ]);
        if !tier.is_free() {
            operators.insert(FilterOperator::ValueRange);
        }
        operators
    }

    pub fn validate_filter(&self, filter: &FilterState, tier: &SubscriptionTier) -> SyncResult<()> {
        let allowed = self.available_filters(tier);
        let requested = [
            (FilterOperator::Search, !filter.search.is_empty()),
            (FilterOperator::Status, filter.status.is_some()),
            (FilterOperator::ValueRange, filter.value_range.is_some()),
            (FilterOperator::Category, filter.category.is_some()),
            (FilterOperator::DealScope, filter.deal_id.is_some()),
        ];
        for (operator, used) in requested {
            if used && !allowed.contains(&operator) {
                return Err(SyncError::Policy(format!(
                    "Filter '{}' is not available on the '{}' tier",
                    operator.as_str(),
                    tier.slug
                )));
            }
        }
        Ok(())
    }

    /// Whether a principal already holding `current_count` entities may start another.
    pub fn can_create(&self, tier: &SubscriptionTier, current_count: usize) -> bool {
        tier.max_visible_entities
            .map(|limit| current_count < limit)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityRecord, EntityPayload};
    use chrono::{Duration, Utc};

    fn activities(count: usize) -> Vec<Entity> {
        let now = Utc::now();
        (0..count)
            .map(|index| {
                Entity::new(
                    format!("a-{index}"),
                    now - Duration::seconds(index as i64),
                    vec!["u-1".to_string()],
                    EntityPayload::Activity(ActivityRecord {
                        deal_id: "d-1".to_string(),
                        title: format!("Step {index}"),
                        ..ActivityRecord::default()
                    }),
                )
            })
            .collect()
    }

    #[test]
    fn truncates_to_tier_limit_exactly() {
        let policy = AccessPolicy::new();
        let entities = activities(10);

        let slice = policy.visible_slice(&entities, &SubscriptionTier::limited("starter", 3));
        assert_eq!(slice.shown.len(), 3);
        assert_eq!(slice.hidden_count, 7);
        assert_eq!(slice.shown, entities[..3].to_vec());

        let slice = policy.visible_slice(&entities, &SubscriptionTier::unlimited("professional"));
        assert_eq!(slice.shown.len(), 10);
        assert_eq!(slice.hidden_count, 0);
    }

    #[test]
    fn under_limit_hides_nothing() {
        let policy = AccessPolicy::new();
        let slice = policy.visible_slice(&activities(2), &SubscriptionTier::free());
        assert_eq!(slice.shown.len(), 2);
        assert_eq!(slice.hidden_count, 0);

        let slice = policy.visible_slice(&[], &SubscriptionTier::limited("zero", 0));
        assert!(slice.shown.is_empty());
        assert_eq!(slice.hidden_count, 0);
    }

    #[test]
    fn value_range_requires_paid_tier() {
        let policy = AccessPolicy::new();
        let filter = FilterState {
            value_range: Some("0-250000".to_string()),
            ..FilterState::default()
        };

        let err = policy
            .validate_filter(&filter, &SubscriptionTier::free())
            .expect_err("free tier cannot range filter");
        assert!(err.to_string().starts_with("POLICY_DENIED"));
        assert!(policy
            .validate_filter(&filter, &SubscriptionTier::unlimited("premium"))
            .is_ok());

        let search_only = FilterState {
            search: "brake".to_string(),
            status: Some("closing".to_string()),
            ..FilterState::default()
        };
        assert!(policy.validate_filter(&search_only, &SubscriptionTier::free()).is_ok());

        let scoped = FilterState {
            category: Some("legal".to_string()),
            deal_id: Some("d-1".to_string()),
            ..FilterState::default()
        };
        assert!(policy.validate_filter(&scoped, &SubscriptionTier::free()).is_ok());
    }

    #[test]
    fn creation_is_capped_on_limited_tiers() {
        let policy = AccessPolicy::new();
        assert!(policy.can_create(&SubscriptionTier::free(), 2));
        assert!(!policy.can_create(&SubscriptionTier::free(), 3));
        assert!(policy.can_create(&SubscriptionTier::unlimited("premium"), 500));
    }
}
