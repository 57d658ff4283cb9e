//! Query metric summaries over a date range.

use crate::error::MetricError;
use crate::metric::QueryMetric;
use chrono::NaiveDateTime;
use serde::Serialize;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Default summary window ending at `end`
pub const DEFAULT_WINDOW_MS: i64 = 90 * DAY_MS;

const SUMMARY_DATE_FORMAT: &str = "%Y%m%d %H%M%S%.3f";

/// Bucket labels and spans, measured back from the end of the range
const BUCKETS: [(&str, Option<i64>); 9] = [
    ("1 hour", Some(HOUR_MS)),
    ("6 hours", Some(6 * HOUR_MS)),
    ("12 hours", Some(12 * HOUR_MS)),
    ("1 day", Some(DAY_MS)),
    ("7 days", Some(7 * DAY_MS)),
    ("30 days", Some(30 * DAY_MS)),
    ("60 days", Some(60 * DAY_MS)),
    ("90 days", Some(90 * DAY_MS)),
    ("all", None),
];

/// Which end of a range a date string bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    Begin,
    End,
}

impl DateBound {
    fn name(&self) -> &'static str {
        match self {
            DateBound::Begin => "begin",
            DateBound::End => "end",
        }
    }
}

/// Parse `yyyyMMdd`, `yyyyMMdd HHmmss` or `yyyyMMdd HHmmss.SSS` (UTC) to epoch
/// millis. Missing time parts are filled with the start of the day/second for
/// `Begin` and the end for `End`. Blank input yields `None`.
pub fn parse_summary_date(s: &str, bound: DateBound) -> Result<Option<i64>, MetricError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let full = match (s.len(), bound) {
        (8, DateBound::Begin) => format!("{} 000000.000", s),
        (8, DateBound::End) => format!("{} 235959.999", s),
        (15, DateBound::Begin) => format!("{}.000", s),
        (15, DateBound::End) => format!("{}.999", s),
        _ => s.to_string(),
    };
    NaiveDateTime::parse_from_str(&full, SUMMARY_DATE_FORMAT)
        .map(|dt| Some(dt.and_utc().timestamp_millis()))
        .map_err(|_| {
            MetricError::Validation(format!(
                "Unable to parse parameter '{}' - valid formats: yyyyMMdd | yyyyMMdd HHmmss | yyyyMMdd HHmmss.SSS",
                bound.name()
            ))
        })
}

/// Fill in defaults and check ordering: `end` defaults to `now`, `begin` to
/// 90 days before `end`.
pub fn resolve_range(begin: Option<i64>, end: Option<i64>, now: i64) -> Result<(i64, i64), MetricError> {
    let end = end.unwrap_or(now);
    let begin = begin.unwrap_or(end - DEFAULT_WINDOW_MS);
    if end < begin {
        return Err(MetricError::Validation(
            "begin date can not be after end date".to_string(),
        ));
    }
    Ok((begin, end))
}

/// Totals for queries created within `span` of the range end
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryBucket {
    pub label: &'static str,
    /// `None` for the bucket covering the whole range
    pub span_ms: Option<i64>,
    pub query_count: u64,
    pub total_results: u64,
    pub total_pages: u64,
    pub total_elapsed_ms: i64,
}

impl SummaryBucket {
    fn new(label: &'static str, span_ms: Option<i64>) -> Self {
        SummaryBucket {
            label,
            span_ms,
            query_count: 0,
            total_results: 0,
            total_pages: 0,
            total_elapsed_ms: 0,
        }
    }

    fn add(&mut self, metric: &QueryMetric) {
        self.query_count += 1;
        self.total_results += metric.num_results.unwrap_or(0);
        self.total_pages += metric.num_pages();
        self.total_elapsed_ms += metric.elapsed_time.unwrap_or(0).max(0);
    }

    pub fn average_elapsed_ms(&self) -> Option<f64> {
        (self.query_count > 0).then(|| self.total_elapsed_ms as f64 / self.query_count as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryMetricsSummary {
    pub begin: i64,
    pub end: i64,
    pub buckets: Vec<SummaryBucket>,
}

impl QueryMetricsSummary {
    pub fn bucket(&self, label: &str) -> Option<&SummaryBucket> {
        self.buckets.iter().find(|b| b.label == label)
    }

    pub fn total(&self) -> Option<&SummaryBucket> {
        self.bucket("all")
    }
}

/// Summarize the metrics created within `[begin, end]`, optionally only
/// those belonging to `user`.
pub fn summarize<'a>(
    metrics: impl IntoIterator<Item = &'a QueryMetric>,
    begin: i64,
    end: i64,
    user: Option<&str>,
) -> QueryMetricsSummary {
    let mut buckets: Vec<SummaryBucket> = BUCKETS
        .iter()
        .map(|(label, span)| SummaryBucket::new(label, *span))
        .collect();

    for metric in metrics {
        let Some(created) = metric.create_date.or(metric.last_updated) else {
            continue;
        };
        if created < begin || created > end {
            continue;
        }
        if user.is_some() && metric.user.as_deref() != user {
            continue;
        }
        let age = end - created;
        for bucket in buckets.iter_mut() {
            if bucket.span_ms.map_or(true, |span| age <= span) {
                bucket.add(metric);
            }
        }
    }

    QueryMetricsSummary { begin, end, buckets }
}
