//! Per-page timing records.

use super::field::{escape_separators, unescape_separators};
use serde::{Deserialize, Serialize};

/// Timing record for one page of results returned to the caller.
///
/// The aggregate holds at most one page per `page_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageMetric {
    pub host: String,
    pub page_number: u64,
    pub page_uuid: String,
    pub pagesize: u64,
    pub return_time: i64,
    pub call_time: i64,
    pub serialize_time: i64,
    pub bytes_written: i64,
    pub page_requested: i64,
    pub page_returned: i64,
    pub login_time: i64,
}

impl Default for PageMetric {
    fn default() -> Self {
        PageMetric {
            host: String::new(),
            page_number: 0,
            page_uuid: String::new(),
            pagesize: 0,
            return_time: 0,
            call_time: -1,
            serialize_time: 0,
            bytes_written: 0,
            page_requested: 0,
            page_returned: 0,
            login_time: -1,
        }
    }
}

impl PageMetric {
    pub fn new(host: &str, page_number: u64, pagesize: u64, return_time: i64) -> Self {
        PageMetric {
            host: host.to_string(),
            page_number,
            pagesize,
            return_time,
            ..Default::default()
        }
    }

    pub fn with_timing(mut self, page_requested: i64, page_returned: i64, call_time: i64) -> Self {
        self.page_requested = page_requested;
        self.page_returned = page_returned;
        self.call_time = call_time;
        self
    }

    /// Same page timing, ignoring the page number
    pub fn same_timing(&self, other: &PageMetric) -> bool {
        PageMetric {
            page_number: other.page_number,
            ..self.clone()
        } == *other
    }

    /// Stored form of the page, without its number (the number is part of
    /// the field name). `/` in `host` or `page_uuid` is escaped.
    pub fn to_event_string(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}/{}/{}/{}/{}/{}",
            escape_separators(&self.host, &['/']),
            escape_separators(&self.page_uuid, &['/']),
            self.pagesize,
            self.return_time,
            self.call_time,
            self.serialize_time,
            self.bytes_written,
            self.page_requested,
            self.page_returned,
            self.login_time
        )
    }

    /// Rebuild a page from its stored form.
    pub fn from_event_string(page_number: u64, s: &str) -> Option<PageMetric> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 10 {
            return None;
        }
        Some(PageMetric {
            host: unescape_separators(parts[0]),
            page_number,
            page_uuid: unescape_separators(parts[1]),
            pagesize: parts[2].parse().ok()?,
            return_time: parts[3].parse().ok()?,
            call_time: parts[4].parse().ok()?,
            serialize_time: parts[5].parse().ok()?,
            bytes_written: parts[6].parse().ok()?,
            page_requested: parts[7].parse().ok()?,
            page_returned: parts[8].parse().ok()?,
            login_time: parts[9].parse().ok()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_string_restores_page() {
        let page = PageMetric::new("web01", 3, 1000, 250).with_timing(10, 260, 240);
        let restored = PageMetric::from_event_string(3, &page.to_event_string());
        assert_eq!(restored, Some(page));
    }

    #[test]
    fn test_event_string_escapes_separator() {
        let mut page = PageMetric::new("proxy/web01", 2, 10, 5);
        page.page_uuid = "a/b".to_string();
        let stored = page.to_event_string();
        assert_eq!(stored.split('/').count(), 10);
        assert_eq!(PageMetric::from_event_string(2, &stored), Some(page));
    }

    #[test]
    fn test_malformed_event_string() {
        assert_eq!(PageMetric::from_event_string(1, "only/three/parts"), None);
        assert_eq!(PageMetric::from_event_string(1, "h/u/x/1/2/3/4/5/6/7"), None);
    }
}
