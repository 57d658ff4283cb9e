//! The per-query metric aggregate.

use super::{Lifecycle, PageMetric};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Query type whose selectors are extracted for search indexing
pub const RUNNING_QUERY: &str = "RunningQuery";

/// Selector terms extracted once from the query text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selectors {
    /// `FIELD:value` terms the query requires
    pub positive: Vec<String>,
    /// `FIELD:value` terms the query excludes
    pub negative: Vec<String>,
}

impl Selectors {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

/// Model prediction attached to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub name: String,
    pub value: f64,
}

/// Aggregate state for a single query execution.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryMetric {
    pub query_id: String,

    // Monotonic-forward
    pub lifecycle: Lifecycle,
    pub last_updated: Option<i64>,

    // Additive under DISTRIBUTED updates, replaced under COMPLETE
    pub source_count: u64,
    pub next_count: u64,
    pub seek_count: u64,
    pub yield_count: u64,
    pub doc_ranges: u64,
    pub fi_ranges: u64,
    pub num_updates: u64,

    // Append-with-dedup, ordered by page number
    pub page_times: Vec<PageMetric>,

    // Derived once from `query`; `None` until extracted
    pub selectors: Option<Selectors>,

    // Replace-if-present
    pub query: Option<String>,
    pub query_logic: Option<String>,
    pub query_type: Option<String>,
    pub query_name: Option<String>,
    pub query_authorizations: Option<String>,
    pub user: Option<String>,
    pub user_dn: Option<String>,
    pub markings: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub plan: Option<String>,
    pub host: Option<String>,
    pub version: Option<String>,
    pub create_date: Option<i64>,
    pub begin_date: Option<i64>,
    pub end_date: Option<i64>,
    pub setup_time: Option<i64>,
    pub create_call_time: Option<i64>,
    pub login_time: Option<i64>,
    pub elapsed_time: Option<i64>,
    pub num_results: Option<u64>,
    pub proxy_servers: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub predictions: Vec<Prediction>,

    /// Additional named fields not covered by the schema above
    pub extra: BTreeMap<String, String>,
}

impl QueryMetric {
    pub fn new(query_id: impl Into<String>) -> Self {
        QueryMetric {
            query_id: query_id.into(),
            ..Default::default()
        }
    }

    /// Start building a metric for `query_id`
    pub fn builder(query_id: impl Into<String>) -> QueryMetricBuilder {
        QueryMetricBuilder {
            metric: QueryMetric::new(query_id),
        }
    }

    pub fn num_pages(&self) -> u64 {
        self.page_times.len() as u64
    }

    /// Highest page number recorded, if any page has been seen
    pub fn last_page_number(&self) -> Option<u64> {
        self.page_times.iter().map(|p| p.page_number).max()
    }

    pub fn page(&self, page_number: u64) -> Option<&PageMetric> {
        self.page_times.iter().find(|p| p.page_number == page_number)
    }

    /// Add a page numbered after the current last page
    pub fn add_page(&mut self, mut page: PageMetric) -> u64 {
        let next = self.last_page_number().map_or(1, |n| n + 1);
        page.page_number = next;
        self.page_times.push(page);
        next
    }

    pub fn is_running_query(&self) -> bool {
        self.query_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(RUNNING_QUERY))
    }

    pub fn positive_selectors(&self) -> &[String] {
        self.selectors.as_ref().map_or(&[], |s| s.positive.as_slice())
    }

    pub fn negative_selectors(&self) -> &[String] {
        self.selectors.as_ref().map_or(&[], |s| s.negative.as_slice())
    }
}

/// Fluent constructor for metrics, mostly used by submitters and tests
pub struct QueryMetricBuilder {
    metric: QueryMetric,
}

impl QueryMetricBuilder {
    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.metric.lifecycle = lifecycle;
        self
    }

    pub fn last_updated(mut self, millis: i64) -> Self {
        self.metric.last_updated = Some(millis);
        self
    }

    pub fn create_date(mut self, millis: i64) -> Self {
        self.metric.create_date = Some(millis);
        self
    }

    pub fn query(mut self, query: &str) -> Self {
        self.metric.query = Some(query.to_string());
        self
    }

    pub fn query_type(mut self, query_type: &str) -> Self {
        self.metric.query_type = Some(query_type.to_string());
        self
    }

    pub fn query_logic(mut self, logic: &str) -> Self {
        self.metric.query_logic = Some(logic.to_string());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.metric.user = Some(user.to_string());
        self
    }

    /// Set every additive counter except `num_updates` to `n`
    pub fn counters(mut self, n: u64) -> Self {
        self.metric.source_count = n;
        self.metric.next_count = n;
        self.metric.seek_count = n;
        self.metric.yield_count = n;
        self.metric.doc_ranges = n;
        self.metric.fi_ranges = n;
        self
    }

    pub fn source_count(mut self, n: u64) -> Self {
        self.metric.source_count = n;
        self
    }

    pub fn num_updates(mut self, n: u64) -> Self {
        self.metric.num_updates = n;
        self
    }

    pub fn num_results(mut self, n: u64) -> Self {
        self.metric.num_results = Some(n);
        self
    }

    pub fn elapsed_time(mut self, millis: i64) -> Self {
        self.metric.elapsed_time = Some(millis);
        self
    }

    pub fn page(mut self, page: PageMetric) -> Self {
        self.metric.page_times.push(page);
        self.metric.page_times.sort_by_key(|p| p.page_number);
        self
    }

    pub fn extra(mut self, name: &str, value: &str) -> Self {
        self.metric.extra.insert(name.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> QueryMetric {
        self.metric
    }
}
