//! Query metric aggregation service.
//!
//! Many workers report partial metrics for the same query. Updates are
//! merged per query id under the cache's per-key exclusivity, the merged
//! aggregate is diffed against the last persisted snapshot, and only the
//! changed fields are written to the column store.
//!
//! ## Modules
//!
//! - `metric`: the aggregate, pages, lifecycle and update envelopes
//! - `combine`: merge policy and selector extraction
//! - `delta`: field encoding and write/delete set computation
//! - `cache`, `store`: storage boundaries and their in-process implementations
//! - `delivery`: acknowledged submission with bounded retries
//! - `service`: per-key processor, shutdown gate, read paths, reporting
//! - `dst`: deterministic simulation harness

pub mod cache;
pub mod combine;
pub mod config;
pub mod delivery;
pub mod delta;
pub mod dst;
pub mod error;
pub mod metric;
pub mod observability;
pub mod service;
pub mod store;

pub use cache::{CachedMetric, MetricCache, ShardedMetricCache};
pub use combine::{combine, Combiner};
pub use config::ServiceConfig;
pub use delivery::{ChannelTransport, ConfirmationSender, DeliveryCoordinator, Transport};
pub use delta::FieldDelta;
pub use error::{CacheError, DeliveryError, MetricError, StoreError};
pub use metric::{Lifecycle, PageMetric, QueryMetric, QueryMetricUpdate, UpdateType};
pub use service::{QueryMetricService, QueryMetricsSummary, ShutdownGate, UpdateProcessor};
pub use store::{ColumnStore, InMemoryColumnStore, StoredRecord};
