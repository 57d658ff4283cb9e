//! Combine engine: merges an incoming update into the prior aggregate.

mod combiner;
mod selectors;

pub use combiner::{combine, last_page_number, Combiner};
pub use selectors::{ensure_selectors, SelectorExtractor, TermSelectorExtractor};
