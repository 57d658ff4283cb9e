//! Storage field schema.
//!
//! The aggregate is persisted as a bag of named fields. Known fields form a
//! closed enum so every merge and diff path is checked at compile time;
//! extension fields carry their own names.

use serde::{Deserialize, Serialize};

/// Known storage fields of a query metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MetricField {
    Authorizations,
    BeginDate,
    CreateCallTime,
    CreateDate,
    DocRanges,
    ElapsedTime,
    EndDate,
    ErrorCode,
    ErrorMessage,
    FiRanges,
    Host,
    LastUpdated,
    Lifecycle,
    LoginTime,
    Markings,
    NegativeSelectors,
    NextCount,
    NumPages,
    NumResults,
    NumUpdates,
    PageMetrics,
    Parameters,
    Plan,
    PositiveSelectors,
    Prediction,
    ProxyServers,
    Query,
    QueryId,
    QueryLogic,
    QueryName,
    QueryType,
    SeekCount,
    SetupTime,
    SourceCount,
    User,
    UserDn,
    Version,
    YieldCount,
}

impl MetricField {
    pub const ALL: [MetricField; 38] = [
        MetricField::Authorizations,
        MetricField::BeginDate,
        MetricField::CreateCallTime,
        MetricField::CreateDate,
        MetricField::DocRanges,
        MetricField::ElapsedTime,
        MetricField::EndDate,
        MetricField::ErrorCode,
        MetricField::ErrorMessage,
        MetricField::FiRanges,
        MetricField::Host,
        MetricField::LastUpdated,
        MetricField::Lifecycle,
        MetricField::LoginTime,
        MetricField::Markings,
        MetricField::NegativeSelectors,
        MetricField::NextCount,
        MetricField::NumPages,
        MetricField::NumResults,
        MetricField::NumUpdates,
        MetricField::PageMetrics,
        MetricField::Parameters,
        MetricField::Plan,
        MetricField::PositiveSelectors,
        MetricField::Prediction,
        MetricField::ProxyServers,
        MetricField::Query,
        MetricField::QueryId,
        MetricField::QueryLogic,
        MetricField::QueryName,
        MetricField::QueryType,
        MetricField::SeekCount,
        MetricField::SetupTime,
        MetricField::SourceCount,
        MetricField::User,
        MetricField::UserDn,
        MetricField::Version,
        MetricField::YieldCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Authorizations => "AUTHORIZATIONS",
            MetricField::BeginDate => "BEGIN_DATE",
            MetricField::CreateCallTime => "CREATE_CALL_TIME",
            MetricField::CreateDate => "CREATE_DATE",
            MetricField::DocRanges => "DOC_RANGES",
            MetricField::ElapsedTime => "ELAPSED_TIME",
            MetricField::EndDate => "END_DATE",
            MetricField::ErrorCode => "ERROR_CODE",
            MetricField::ErrorMessage => "ERROR_MESSAGE",
            MetricField::FiRanges => "FI_RANGES",
            MetricField::Host => "HOST",
            MetricField::LastUpdated => "LAST_UPDATED",
            MetricField::Lifecycle => "LIFECYCLE",
            MetricField::LoginTime => "LOGIN_TIME",
            MetricField::Markings => "MARKINGS",
            MetricField::NegativeSelectors => "NEGATIVE_SELECTORS",
            MetricField::NextCount => "NEXT_COUNT",
            MetricField::NumPages => "NUM_PAGES",
            MetricField::NumResults => "NUM_RESULTS",
            MetricField::NumUpdates => "NUM_UPDATES",
            MetricField::PageMetrics => "PAGE_METRICS",
            MetricField::Parameters => "PARAMETERS",
            MetricField::Plan => "PLAN",
            MetricField::PositiveSelectors => "POSITIVE_SELECTORS",
            MetricField::Prediction => "PREDICTION",
            MetricField::ProxyServers => "PROXY_SERVERS",
            MetricField::Query => "QUERY",
            MetricField::QueryId => "QUERY_ID",
            MetricField::QueryLogic => "QUERY_LOGIC",
            MetricField::QueryName => "QUERY_NAME",
            MetricField::QueryType => "QUERY_TYPE",
            MetricField::SeekCount => "SEEK_COUNT",
            MetricField::SetupTime => "SETUP_TIME",
            MetricField::SourceCount => "SOURCE_COUNT",
            MetricField::User => "USER",
            MetricField::UserDn => "USER_DN",
            MetricField::Version => "VERSION",
            MetricField::YieldCount => "YIELD_COUNT",
        }
    }

    pub fn parse(s: &str) -> Option<MetricField> {
        MetricField::ALL.iter().copied().find(|f| f.as_str() == s)
    }
}

/// Name of a stored field: a known field, one page of the page-metric
/// group, or an extension field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldName {
    Known(MetricField),
    Page(u64),
    Extension(String),
}

impl FieldName {
    pub fn parse(s: &str) -> FieldName {
        if let Some((base, group)) = s.split_once('.') {
            if base == MetricField::PageMetrics.as_str() {
                if let Ok(n) = group.parse() {
                    return FieldName::Page(n);
                }
            }
        }
        match MetricField::parse(s) {
            Some(field) => FieldName::Known(field),
            None => FieldName::Extension(s.to_string()),
        }
    }

    pub fn is_page(&self) -> bool {
        matches!(self, FieldName::Page(_))
    }
}

impl From<MetricField> for FieldName {
    fn from(field: MetricField) -> Self {
        FieldName::Known(field)
    }
}

impl std::fmt::Display for FieldName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldName::Known(field) => f.write_str(field.as_str()),
            FieldName::Page(n) => write!(f, "{}.{}", MetricField::PageMetrics.as_str(), n),
            FieldName::Extension(name) => f.write_str(name),
        }
    }
}

/// Percent-escape `%` and every char in `separators` (all ASCII) so the
/// value can be joined with those separators in one stored string.
pub fn escape_separators(value: &str, separators: &[char]) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '%' || separators.contains(&c) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

/// Inverse of `escape_separators`; text without escapes passes through.
pub fn unescape_separators(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(i) = rest.find('%') {
        out.push_str(&rest[..i]);
        let code = rest
            .get(i + 1..i + 3)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .filter(u8::is_ascii);
        match code {
            Some(b) => {
                out.push(b as char);
                rest = &rest[i + 3..];
            }
            None => {
                out.push('%');
                rest = &rest[i + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_parse() {
        for field in MetricField::ALL {
            assert_eq!(MetricField::parse(field.as_str()), Some(field));
            assert_eq!(FieldName::parse(field.as_str()), FieldName::Known(field));
        }
    }

    #[test]
    fn test_page_field_names() {
        assert_eq!(FieldName::Page(7).to_string(), "PAGE_METRICS.7");
        assert_eq!(FieldName::parse("PAGE_METRICS.7"), FieldName::Page(7));
        assert!(FieldName::parse("PAGE_METRICS.7").is_page());
    }

    #[test]
    fn test_unknown_names_are_extensions() {
        assert_eq!(
            FieldName::parse("SHARD_COUNT"),
            FieldName::Extension("SHARD_COUNT".to_string())
        );
        assert_eq!(
            FieldName::parse("PAGE_METRICS.abc"),
            FieldName::Extension("PAGE_METRICS.abc".to_string())
        );
    }

    #[test]
    fn test_escaped_separators_restore() {
        let raw = "a/b:c;d%2F";
        let escaped = escape_separators(raw, &['/', ':', ';']);
        assert_eq!(escaped, "a%2Fb%3Ac%3Bd%252F");
        assert_eq!(unescape_separators(&escaped), raw);
        assert_eq!(unescape_separators("100%"), "100%");
    }
}
