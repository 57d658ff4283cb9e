//! Write-set / delete-set computation between two aggregate snapshots.

use super::encode::{encode_metric, FieldValues};
use crate::metric::{FieldName, MetricField, QueryMetric};

/// Storage mutations that move the stored record from one snapshot to another
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDelta {
    /// Values to add
    pub write_set: FieldValues,
    /// Old values to remove
    pub delete_set: FieldValues,
}

/// Selector fields are written once and never removed
fn never_deleted(name: &FieldName) -> bool {
    matches!(
        name,
        FieldName::Known(MetricField::PositiveSelectors | MetricField::NegativeSelectors)
    )
}

fn is_num_updates(name: &FieldName) -> bool {
    *name == FieldName::Known(MetricField::NumUpdates)
}

/// Every present field of `metric`, values cut at `max_len`
pub fn fields_to_write(metric: &QueryMetric, max_len: usize) -> FieldValues {
    encode_metric(metric, max_len)
}

/// Stored values superseded by `updated`.
///
/// A field is deleted only when `updated` carries a different value for it;
/// fields `updated` leaves out are kept. `NUM_UPDATES` is always replaced.
pub fn fields_to_delete(updated: &QueryMetric, stored: &QueryMetric, max_len: usize) -> FieldValues {
    superseded(&encode_metric(updated, max_len), &encode_metric(stored, max_len))
}

fn superseded(updated: &FieldValues, stored: &FieldValues) -> FieldValues {
    stored
        .iter()
        .filter(|(name, _)| !never_deleted(name))
        .filter(|(name, old)| {
            is_num_updates(name) || updated.get(*name).is_some_and(|new| new != *old)
        })
        .map(|(name, old)| (name.clone(), old.clone()))
        .collect()
}

impl FieldDelta {
    /// Delta from `stored` (the last persisted snapshot, if any) to `updated`
    pub fn compute(updated: &QueryMetric, stored: Option<&QueryMetric>, max_len: usize) -> FieldDelta {
        let updated_fields = encode_metric(updated, max_len);
        let Some(stored) = stored else {
            return FieldDelta {
                write_set: updated_fields,
                delete_set: FieldValues::new(),
            };
        };
        let stored_fields = encode_metric(stored, max_len);

        let write_set = updated_fields
            .iter()
            .filter(|(name, new)| {
                is_num_updates(name) || stored_fields.get(*name) != Some(*new)
            })
            .map(|(name, new)| (name.clone(), new.clone()))
            .collect();

        FieldDelta {
            write_set,
            delete_set: superseded(&updated_fields, &stored_fields),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.write_set.is_empty() && self.delete_set.is_empty()
    }

    pub fn write_count(&self) -> usize {
        self.write_set.values().map(Vec::len).sum()
    }

    pub fn delete_count(&self) -> usize {
        self.delete_set.values().map(Vec::len).sum()
    }
}
