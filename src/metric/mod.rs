//! Query metric data model
//!
//! - `QueryMetric`: the mutable per-query aggregate
//! - `QueryMetricUpdate`: the immutable `{metric, update_type}` envelope
//! - `Lifecycle`: ordered execution stages
//! - `MetricField` / `FieldName`: the closed storage schema plus extensions

mod aggregate;
mod field;
mod lifecycle;
mod page;
mod update;

pub use aggregate::{Prediction, QueryMetric, QueryMetricBuilder, Selectors, RUNNING_QUERY};
pub use field::{escape_separators, unescape_separators, FieldName, MetricField};
pub use lifecycle::Lifecycle;
pub use page::PageMetric;
pub use update::{QueryMetricUpdate, UpdateType};
