//! Stored field encoding.
//!
//! Every field is stored as one or more strings under its `FieldName`.
//! Dates use `yyyyMMdd HHmmss` in UTC, so stored dates carry second
//! precision only.

use crate::metric::{
    escape_separators, unescape_separators, FieldName, Lifecycle, MetricField, PageMetric,
    Prediction, QueryMetric, Selectors,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;

const PARAMETER_SEPARATORS: [char; 2] = [':', ';'];

/// Multi-valued map of stored field values
pub type FieldValues = BTreeMap<FieldName, Vec<String>>;

/// Suffix appended to values cut at the length threshold
pub const TRUNCATION_MARKER: &str = "<truncated>";

const DATE_TIME_FORMAT: &str = "%Y%m%d %H%M%S";

pub fn format_timestamp(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => dt.format(DATE_TIME_FORMAT).to_string(),
        None => millis.to_string(),
    }
}

pub fn parse_timestamp(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
        .or_else(|| s.parse().ok())
}

/// Cut `value` to `max_len` characters, marking the cut
pub fn truncate(value: String, max_len: usize) -> String {
    match value.char_indices().nth(max_len) {
        Some((idx, _)) => {
            let mut cut = value[..idx].to_string();
            cut.push_str(TRUNCATION_MARKER);
            cut
        }
        None => value,
    }
}

struct FieldWriter {
    fields: FieldValues,
    max_len: usize,
}

impl FieldWriter {
    fn put(&mut self, name: impl Into<FieldName>, value: String) {
        self.fields
            .entry(name.into())
            .or_default()
            .push(truncate(value, self.max_len));
    }

    fn put_opt(&mut self, field: MetricField, value: Option<&String>) {
        if let Some(v) = value {
            self.put(field, v.clone());
        }
    }

    fn put_num(&mut self, field: MetricField, value: Option<impl ToString>) {
        if let Some(v) = value {
            self.put(field, v.to_string());
        }
    }

    fn put_date(&mut self, field: MetricField, value: Option<i64>) {
        if let Some(ms) = value {
            self.put(field, format_timestamp(ms));
        }
    }
}

/// Every present field of `metric` in stored form
pub fn encode_metric(metric: &QueryMetric, max_len: usize) -> FieldValues {
    let mut w = FieldWriter {
        fields: FieldValues::new(),
        max_len,
    };

    w.put(MetricField::QueryId, metric.query_id.clone());
    w.put(MetricField::Lifecycle, metric.lifecycle.as_str().to_string());
    w.put_date(MetricField::LastUpdated, metric.last_updated);

    w.put_num(MetricField::SourceCount, Some(metric.source_count));
    w.put_num(MetricField::NextCount, Some(metric.next_count));
    w.put_num(MetricField::SeekCount, Some(metric.seek_count));
    w.put_num(MetricField::YieldCount, Some(metric.yield_count));
    w.put_num(MetricField::DocRanges, Some(metric.doc_ranges));
    w.put_num(MetricField::FiRanges, Some(metric.fi_ranges));
    w.put_num(MetricField::NumUpdates, Some(metric.num_updates));
    w.put_num(MetricField::NumPages, Some(metric.num_pages()));

    for page in &metric.page_times {
        w.put(FieldName::Page(page.page_number), page.to_event_string());
    }

    if let Some(selectors) = &metric.selectors {
        for term in &selectors.positive {
            w.put(MetricField::PositiveSelectors, term.clone());
        }
        for term in &selectors.negative {
            w.put(MetricField::NegativeSelectors, term.clone());
        }
    }

    w.put_opt(MetricField::Query, metric.query.as_ref());
    w.put_opt(MetricField::QueryLogic, metric.query_logic.as_ref());
    w.put_opt(MetricField::QueryType, metric.query_type.as_ref());
    w.put_opt(MetricField::QueryName, metric.query_name.as_ref());
    w.put_opt(MetricField::Authorizations, metric.query_authorizations.as_ref());
    w.put_opt(MetricField::User, metric.user.as_ref());
    w.put_opt(MetricField::UserDn, metric.user_dn.as_ref());
    w.put_opt(MetricField::Markings, metric.markings.as_ref());
    w.put_opt(MetricField::ErrorCode, metric.error_code.as_ref());
    w.put_opt(MetricField::ErrorMessage, metric.error_message.as_ref());
    w.put_opt(MetricField::Plan, metric.plan.as_ref());
    w.put_opt(MetricField::Host, metric.host.as_ref());
    w.put_opt(MetricField::Version, metric.version.as_ref());

    w.put_date(MetricField::CreateDate, metric.create_date);
    w.put_date(MetricField::BeginDate, metric.begin_date);
    w.put_date(MetricField::EndDate, metric.end_date);
    w.put_num(MetricField::SetupTime, metric.setup_time);
    w.put_num(MetricField::CreateCallTime, metric.create_call_time);
    w.put_num(MetricField::LoginTime, metric.login_time);
    w.put_num(MetricField::ElapsedTime, metric.elapsed_time);
    w.put_num(MetricField::NumResults, metric.num_results);

    if !metric.proxy_servers.is_empty() {
        w.put(MetricField::ProxyServers, metric.proxy_servers.join(","));
    }
    if !metric.parameters.is_empty() {
        let params: String = metric
            .parameters
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}:{};",
                    escape_separators(k, &PARAMETER_SEPARATORS),
                    escape_separators(v, &PARAMETER_SEPARATORS)
                )
            })
            .collect();
        w.put(MetricField::Parameters, params);
    }
    for prediction in &metric.predictions {
        w.put(
            MetricField::Prediction,
            format!("{}:{}", prediction.name, prediction.value),
        );
    }

    for (name, value) in &metric.extra {
        w.put(FieldName::Extension(name.clone()), value.clone());
    }

    w.fields
}

/// Rebuild a metric from stored field values.
///
/// Unparseable values are skipped; unreadable pages are logged.
pub fn decode_metric(query_id: &str, fields: &FieldValues) -> QueryMetric {
    let mut m = QueryMetric::new(query_id);

    for (name, values) in fields {
        let Some(first) = values.first() else {
            continue;
        };
        match name {
            FieldName::Page(n) => {
                match PageMetric::from_event_string(*n, first) {
                    Some(page) => m.page_times.push(page),
                    None => warn!(
                        query_id,
                        page = *n,
                        value = %first,
                        "skipping unreadable stored page"
                    ),
                }
            }
            FieldName::Extension(ext) => {
                m.extra.insert(ext.clone(), first.clone());
            }
            FieldName::Known(field) => decode_known(&mut m, *field, first, values),
        }
    }

    m.page_times.sort_by_key(|p| p.page_number);
    m
}

fn decode_known(m: &mut QueryMetric, field: MetricField, first: &str, values: &[String]) {
    let num = || first.parse::<u64>().ok();
    let signed = || first.parse::<i64>().ok();
    let text = || Some(first.to_string());

    match field {
        MetricField::QueryId => m.query_id = first.to_string(),
        MetricField::Lifecycle => m.lifecycle = Lifecycle::parse(first).unwrap_or_default(),
        MetricField::LastUpdated => m.last_updated = parse_timestamp(first),
        MetricField::SourceCount => m.source_count = num().unwrap_or_default(),
        MetricField::NextCount => m.next_count = num().unwrap_or_default(),
        MetricField::SeekCount => m.seek_count = num().unwrap_or_default(),
        MetricField::YieldCount => m.yield_count = num().unwrap_or_default(),
        MetricField::DocRanges => m.doc_ranges = num().unwrap_or_default(),
        MetricField::FiRanges => m.fi_ranges = num().unwrap_or_default(),
        MetricField::NumUpdates => m.num_updates = num().unwrap_or_default(),
        // Derived from the page fields
        MetricField::NumPages | MetricField::PageMetrics => {}
        MetricField::PositiveSelectors => {
            m.selectors.get_or_insert_with(Selectors::default).positive = values.to_vec();
        }
        MetricField::NegativeSelectors => {
            m.selectors.get_or_insert_with(Selectors::default).negative = values.to_vec();
        }
        MetricField::Query => m.query = text(),
        MetricField::QueryLogic => m.query_logic = text(),
        MetricField::QueryType => m.query_type = text(),
        MetricField::QueryName => m.query_name = text(),
        MetricField::Authorizations => m.query_authorizations = text(),
        MetricField::User => m.user = text(),
        MetricField::UserDn => m.user_dn = text(),
        MetricField::Markings => m.markings = text(),
        MetricField::ErrorCode => m.error_code = text(),
        MetricField::ErrorMessage => m.error_message = text(),
        MetricField::Plan => m.plan = text(),
        MetricField::Host => m.host = text(),
        MetricField::Version => m.version = text(),
        MetricField::CreateDate => m.create_date = parse_timestamp(first),
        MetricField::BeginDate => m.begin_date = parse_timestamp(first),
        MetricField::EndDate => m.end_date = parse_timestamp(first),
        MetricField::SetupTime => m.setup_time = signed(),
        MetricField::CreateCallTime => m.create_call_time = signed(),
        MetricField::LoginTime => m.login_time = signed(),
        MetricField::ElapsedTime => m.elapsed_time = signed(),
        MetricField::NumResults => m.num_results = num(),
        MetricField::ProxyServers => {
            m.proxy_servers = first.split(',').map(str::to_string).collect();
        }
        MetricField::Parameters => {
            m.parameters = first
                .split(';')
                .filter_map(|p| p.split_once(':'))
                .map(|(k, v)| (unescape_separators(k), unescape_separators(v)))
                .collect();
        }
        MetricField::Prediction => {
            m.predictions = values
                .iter()
                .filter_map(|v| v.rsplit_once(':'))
                .filter_map(|(name, value)| {
                    Some(Prediction {
                        name: name.to_string(),
                        value: value.parse().ok()?,
                    })
                })
                .collect();
        }
    }
}
