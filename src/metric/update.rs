//! Update envelopes carried by the transport.

use super::QueryMetric;
use crate::error::MetricError;
use serde::{Deserialize, Serialize};

/// How an update combines with the state already held for its query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateType {
    /// Partial contribution from one of several workers; counters are summed
    #[default]
    Distributed,
    /// Authoritative snapshot; counters are replaced when not stale
    Complete,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateType::Distributed => f.write_str("DISTRIBUTED"),
            UpdateType::Complete => f.write_str("COMPLETE"),
        }
    }
}

/// Immutable `{metric, update_type}` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetricUpdate {
    pub metric: QueryMetric,
    #[serde(default)]
    pub update_type: UpdateType,
}

impl QueryMetricUpdate {
    pub fn new(metric: QueryMetric, update_type: UpdateType) -> Self {
        QueryMetricUpdate {
            metric,
            update_type,
        }
    }

    pub fn distributed(metric: QueryMetric) -> Self {
        Self::new(metric, UpdateType::Distributed)
    }

    pub fn complete(metric: QueryMetric) -> Self {
        Self::new(metric, UpdateType::Complete)
    }

    pub fn query_id(&self) -> &str {
        &self.metric.query_id
    }

    /// Reject envelopes that cannot be keyed
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.metric.query_id.trim().is_empty() {
            return Err(MetricError::Validation(
                "update is missing a query id".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON payload
    pub fn from_json(payload: &str) -> Result<Self, MetricError> {
        let update: QueryMetricUpdate = serde_json::from_str(payload)?;
        update.validate()?;
        Ok(update)
    }

    /// Parse a JSON array of updates (the batch submission form)
    pub fn batch_from_json(payload: &str) -> Result<Vec<Self>, MetricError> {
        let updates: Vec<QueryMetricUpdate> = serde_json::from_str(payload)?;
        for update in &updates {
            update.validate()?;
        }
        Ok(updates)
    }
}
