//! Read view over a stored query record.

use crate::delta::{decode_metric, FieldValues};
use crate::metric::{FieldName, MetricField, QueryMetric};

/// Live values of one query id, in write order per field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub query_id: String,
    pub fields: FieldValues,
}

/// Fields that legitimately hold several live values
fn is_multi_valued(name: &FieldName) -> bool {
    matches!(
        name,
        FieldName::Known(
            MetricField::PositiveSelectors
                | MetricField::NegativeSelectors
                | MetricField::Prediction
        )
    )
}

impl StoredRecord {
    pub fn new(query_id: impl Into<String>, fields: FieldValues) -> Self {
        StoredRecord {
            query_id: query_id.into(),
            fields,
        }
    }

    pub fn values(&self, field: &FieldName) -> &[String] {
        self.fields.get(field).map_or(&[], Vec::as_slice)
    }

    /// The single live value of a known field
    pub fn value(&self, field: MetricField) -> Option<&str> {
        self.values(&FieldName::Known(field))
            .first()
            .map(String::as_str)
    }

    /// Single-valued fields holding more than one live value
    pub fn duplicate_fields(&self) -> Vec<&FieldName> {
        self.fields
            .iter()
            .filter(|(name, values)| values.len() > 1 && !is_multi_valued(name))
            .map(|(name, _)| name)
            .collect()
    }

    pub fn has_duplicates(&self) -> bool {
        !self.duplicate_fields().is_empty()
    }

    /// Rebuild the aggregate from the stored fields
    pub fn to_metric(&self) -> QueryMetric {
        decode_metric(&self.query_id, &self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_ignore_multi_valued_fields() {
        let mut fields = FieldValues::new();
        fields.insert(
            MetricField::PositiveSelectors.into(),
            vec!["A:1".to_string(), "B:2".to_string()],
        );
        fields.insert(MetricField::SourceCount.into(), vec!["100".to_string()]);
        let record = StoredRecord::new("q1", fields.clone());
        assert!(!record.has_duplicates());
        assert_eq!(record.value(MetricField::SourceCount), Some("100"));

        fields.insert(
            MetricField::SourceCount.into(),
            vec!["100".to_string(), "200".to_string()],
        );
        let record = StoredRecord::new("q1", fields);
        assert!(record.has_duplicates());
        assert_eq!(
            record.duplicate_fields(),
            vec![&FieldName::Known(MetricField::SourceCount)]
        );
    }
}
