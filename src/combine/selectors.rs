//! Selector term extraction.
//!
//! Full query-language parsing lives outside this crate; the extractor here
//! recognizes equality terms in JEXL (`FIELD == 'v'`, `FIELD != 'v'`,
//! `!(FIELD == 'v')`) and Lucene (`FIELD:v`, `NOT FIELD:v`, `-FIELD:v`)
//! syntax, which is what the search index needs.

use crate::metric::{QueryMetric, Selectors};
use tracing::trace;

/// Extracts positive and negative `FIELD:value` selectors from query text
pub trait SelectorExtractor: Send + Sync {
    fn extract(&self, query: &str) -> Selectors;
}

/// Default term-level extractor
#[derive(Debug, Clone, Copy, Default)]
pub struct TermSelectorExtractor;

impl SelectorExtractor for TermSelectorExtractor {
    fn extract(&self, query: &str) -> Selectors {
        collect_selectors(&tokenize(query))
    }
}

/// Populate `metric.selectors` unless they were already extracted.
///
/// Extraction only happens for running queries on their first update
/// (`num_updates == 0`). Returns true if the extractor was invoked.
pub fn ensure_selectors(metric: &mut QueryMetric, extractor: &dyn SelectorExtractor) -> bool {
    if metric.selectors.is_some() || !metric.is_running_query() || metric.num_updates != 0 {
        return false;
    }
    let Some(query) = metric.query.as_deref() else {
        return false;
    };
    let selectors = extractor.extract(query);
    trace!(
        query_id = %metric.query_id,
        positive = selectors.positive.len(),
        negative = selectors.negative.len(),
        "extracted selectors"
    );
    metric.selectors = Some(selectors);
    true
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Literal(String),
    Eq,
    Ne,
    Colon,
    Not,
    LParen,
    RParen,
    Other,
}

impl Token {
    fn value(&self) -> Option<&str> {
        match self {
            Token::Word(s) | Token::Literal(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

const DELIMITERS: &[char] = &['(', ')', '\'', '"', ':', '!', '=', '&', '|', '~', '<', '>'];

fn tokenize(query: &str) -> Vec<Token> {
    let chars: Vec<char> = query.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                    }
                    literal.push(chars[i]);
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Literal(literal));
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' | '=' if chars.get(i + 1) == Some(&'~') => {
                tokens.push(Token::Other);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '-' if !matches!(tokens.last(), Some(Token::Eq | Token::Ne | Token::Colon)) => {
                tokens.push(Token::Not);
                i += 1;
            }
            c if DELIMITERS.contains(&c) => {
                tokens.push(Token::Other);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !DELIMITERS.contains(&chars[i])
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    w if w.eq_ignore_ascii_case("not") => tokens.push(Token::Not),
                    w if w.eq_ignore_ascii_case("and") || w.eq_ignore_ascii_case("or") => {
                        tokens.push(Token::Other)
                    }
                    _ => tokens.push(Token::Word(word)),
                }
            }
        }
    }

    tokens
}

fn collect_selectors(tokens: &[Token]) -> Selectors {
    let mut selectors = Selectors::default();
    // One entry per open group: whether the group itself is negated
    let mut groups: Vec<bool> = Vec::new();
    let mut pending_not = false;
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Not => {
                pending_not = !pending_not;
                i += 1;
            }
            Token::LParen => {
                groups.push(pending_not);
                pending_not = false;
                i += 1;
            }
            Token::RParen => {
                groups.pop();
                pending_not = false;
                i += 1;
            }
            Token::Word(field) => {
                let op_negates = match tokens.get(i + 1) {
                    Some(Token::Eq | Token::Colon) => Some(false),
                    Some(Token::Ne) => Some(true),
                    _ => None,
                };
                let value = tokens.get(i + 2).and_then(Token::value);
                if let (Some(op_negates), Some(value)) = (op_negates, value) {
                    let group_negated = groups.iter().filter(|n| **n).count() % 2 == 1;
                    let term = format!("{}:{}", field, value);
                    let bucket = if op_negates ^ pending_not ^ group_negated {
                        &mut selectors.negative
                    } else {
                        &mut selectors.positive
                    };
                    if !bucket.contains(&term) {
                        bucket.push(term);
                    }
                    i += 3;
                } else {
                    i += 1;
                }
                pending_not = false;
            }
            _ => {
                pending_not = false;
                i += 1;
            }
        }
    }

    selectors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(query: &str) -> Selectors {
        TermSelectorExtractor.extract(query)
    }

    #[test]
    fn test_jexl_equality_terms() {
        let s = extract("FOO == 'bar' && BAZ != 'qux'");
        assert_eq!(s.positive, vec!["FOO:bar"]);
        assert_eq!(s.negative, vec!["BAZ:qux"]);
    }

    #[test]
    fn test_jexl_negated_group() {
        let s = extract("FOO == 'bar' && !(BAZ == 'qux' || ZIP == '123')");
        assert_eq!(s.positive, vec!["FOO:bar"]);
        assert_eq!(s.negative, vec!["BAZ:qux", "ZIP:123"]);
    }

    #[test]
    fn test_double_negation_is_positive() {
        let s = extract("!(FOO != 'bar')");
        assert_eq!(s.positive, vec!["FOO:bar"]);
        assert!(s.negative.is_empty());
    }

    #[test]
    fn test_lucene_terms() {
        let s = extract("FOO:bar AND NOT BAZ:qux -ZIP:123");
        assert_eq!(s.positive, vec!["FOO:bar"]);
        assert_eq!(s.negative, vec!["BAZ:qux", "ZIP:123"]);
    }

    #[test]
    fn test_regex_terms_ignored() {
        let s = extract("FOO =~ 'ba.*' && BAR == 'x'");
        assert_eq!(s.positive, vec!["BAR:x"]);
        assert!(s.negative.is_empty());
    }

    #[test]
    fn test_negative_numeric_literal() {
        let s = extract("COUNT == -5");
        assert_eq!(s.positive, vec!["COUNT:-5"]);
    }

    #[test]
    fn test_duplicate_terms_collapsed() {
        let s = extract("FOO == 'bar' || FOO == 'bar'");
        assert_eq!(s.positive, vec!["FOO:bar"]);
    }

    #[test]
    fn test_ensure_selectors_only_on_first_update() {
        let mut m = QueryMetric::builder("q1")
            .query_type("RunningQuery")
            .query("FOO == 'bar'")
            .build();
        assert!(ensure_selectors(&mut m, &TermSelectorExtractor));
        assert_eq!(m.positive_selectors().to_vec(), vec!["FOO:bar".to_string()]);

        // Already extracted
        assert!(!ensure_selectors(&mut m, &TermSelectorExtractor));

        let mut later = QueryMetric::builder("q2")
            .query_type("RunningQuery")
            .query("FOO == 'bar'")
            .num_updates(3)
            .build();
        assert!(!ensure_selectors(&mut later, &TermSelectorExtractor));
        assert!(later.selectors.is_none());
    }

    #[test]
    fn test_ensure_selectors_skips_other_query_types() {
        let mut m = QueryMetric::builder("q1")
            .query_type("CachedQuery")
            .query("FOO == 'bar'")
            .build();
        assert!(!ensure_selectors(&mut m, &TermSelectorExtractor));
    }
}
