//! Merge policy for incoming updates.
//!
//! `combine` is pure: both inputs are borrowed and a fresh aggregate is
//! returned. Field classes merge as follows:
//!
//! | class              | DISTRIBUTED      | COMPLETE (fresh)   | COMPLETE (stale) |
//! |--------------------|------------------|--------------------|------------------|
//! | lifecycle, updated | max              | max                | max              |
//! | additive counters  | sum              | incoming           | prior            |
//! | pages              | append           | union, replace     | union            |
//! | replace-if-present | incoming or prior| incoming or prior  | prior            |
//! | create_date        | earliest         | earliest           | earliest         |
//!
//! Workers number their pages independently, so a DISTRIBUTED page whose
//! number is already held is appended under the next free number. A page
//! whose timing matches a held page is a redelivery and is absorbed.

use super::selectors::{ensure_selectors, SelectorExtractor, TermSelectorExtractor};
use crate::metric::{PageMetric, QueryMetric, UpdateType};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Highest page number held by `metric`
pub fn last_page_number(metric: &QueryMetric) -> Option<u64> {
    metric.last_page_number()
}

/// A COMPLETE update is stale when it was produced before the state it would replace.
fn is_stale(incoming: &QueryMetric, prior: &QueryMetric, update_type: UpdateType) -> bool {
    match (update_type, incoming.last_updated, prior.last_updated) {
        (UpdateType::Complete, Some(inc), Some(prev)) => inc < prev,
        _ => false,
    }
}

/// Merge `incoming` into `prior` under `update_type`.
pub fn combine(
    incoming: &QueryMetric,
    prior: Option<&QueryMetric>,
    update_type: UpdateType,
) -> QueryMetric {
    let Some(prior) = prior else {
        return incoming.clone();
    };

    let stale = is_stale(incoming, prior, update_type);
    let mut merged = prior.clone();

    merged.lifecycle = prior.lifecycle.advance(incoming.lifecycle);
    merged.last_updated = prior.last_updated.max(incoming.last_updated);

    match update_type {
        UpdateType::Distributed => {
            merged.source_count = prior.source_count.saturating_add(incoming.source_count);
            merged.next_count = prior.next_count.saturating_add(incoming.next_count);
            merged.seek_count = prior.seek_count.saturating_add(incoming.seek_count);
            merged.yield_count = prior.yield_count.saturating_add(incoming.yield_count);
            merged.doc_ranges = prior.doc_ranges.saturating_add(incoming.doc_ranges);
            merged.fi_ranges = prior.fi_ranges.saturating_add(incoming.fi_ranges);
            merged.num_updates = prior.num_updates.saturating_add(incoming.num_updates);
        }
        UpdateType::Complete if !stale => {
            merged.source_count = incoming.source_count;
            merged.next_count = incoming.next_count;
            merged.seek_count = incoming.seek_count;
            merged.yield_count = incoming.yield_count;
            merged.doc_ranges = incoming.doc_ranges;
            merged.fi_ranges = incoming.fi_ranges;
            merged.num_updates = incoming.num_updates;
        }
        UpdateType::Complete => {
            trace!(
                query_id = %prior.query_id,
                incoming = ?incoming.last_updated,
                prior = ?prior.last_updated,
                "stale complete update, keeping prior counters"
            );
        }
    }

    let collision = match update_type {
        UpdateType::Distributed => PageCollision::Append,
        UpdateType::Complete if stale => PageCollision::Keep,
        UpdateType::Complete => PageCollision::Replace,
    };
    merged.page_times = merge_pages(&prior.page_times, &incoming.page_times, collision);

    merged.create_date = match (prior.create_date, incoming.create_date) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    if merged.selectors.is_none() {
        merged.selectors = incoming.selectors.clone();
    }

    if !stale {
        replace_if_present(&mut merged, incoming);
    }

    merged
}

/// How incoming pages whose number is already held are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageCollision {
    /// Pages from independent workers: append under the next free number
    Append,
    /// Fresh COMPLETE state: the incoming page replaces the held one
    Replace,
    /// Stale COMPLETE state: the held page wins
    Keep,
}

fn merge_pages(
    prior: &[PageMetric],
    incoming: &[PageMetric],
    collision: PageCollision,
) -> Vec<PageMetric> {
    let mut pages = prior.to_vec();
    for page in incoming {
        let held = pages.iter().position(|p| p.page_number == page.page_number);
        match (held, collision) {
            (None, _) => pages.push(page.clone()),
            (Some(i), PageCollision::Replace) => pages[i] = page.clone(),
            (Some(_), PageCollision::Keep) => {}
            (Some(_), PageCollision::Append) => {
                // A redelivered page may already sit under a later number
                if pages.iter().any(|p| p.same_timing(page)) {
                    continue;
                }
                let next = pages.iter().map(|p| p.page_number).max().unwrap_or(0) + 1;
                trace!(from = page.page_number, to = next, "renumbering colliding page");
                let mut renumbered = page.clone();
                renumbered.page_number = next;
                pages.push(renumbered);
            }
        }
    }
    pages.sort_by_key(|p| p.page_number);
    pages
}

fn take<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        slot.clone_from(incoming);
    }
}

fn replace_if_present(merged: &mut QueryMetric, incoming: &QueryMetric) {
    take(&mut merged.query, &incoming.query);
    take(&mut merged.query_logic, &incoming.query_logic);
    take(&mut merged.query_type, &incoming.query_type);
    take(&mut merged.query_name, &incoming.query_name);
    take(&mut merged.query_authorizations, &incoming.query_authorizations);
    take(&mut merged.user, &incoming.user);
    take(&mut merged.user_dn, &incoming.user_dn);
    take(&mut merged.markings, &incoming.markings);
    take(&mut merged.error_code, &incoming.error_code);
    take(&mut merged.error_message, &incoming.error_message);
    take(&mut merged.plan, &incoming.plan);
    take(&mut merged.host, &incoming.host);
    take(&mut merged.version, &incoming.version);
    take(&mut merged.begin_date, &incoming.begin_date);
    take(&mut merged.end_date, &incoming.end_date);
    take(&mut merged.setup_time, &incoming.setup_time);
    take(&mut merged.create_call_time, &incoming.create_call_time);
    take(&mut merged.login_time, &incoming.login_time);
    take(&mut merged.elapsed_time, &incoming.elapsed_time);
    take(&mut merged.num_results, &incoming.num_results);

    if !incoming.proxy_servers.is_empty() {
        merged.proxy_servers.clone_from(&incoming.proxy_servers);
    }
    if !incoming.parameters.is_empty() {
        merged.parameters.clone_from(&incoming.parameters);
    }
    if !incoming.predictions.is_empty() {
        merged.predictions.clone_from(&incoming.predictions);
    }
    merge_extra(&mut merged.extra, &incoming.extra);
}

fn merge_extra(merged: &mut BTreeMap<String, String>, incoming: &BTreeMap<String, String>) {
    for (name, value) in incoming {
        merged.insert(name.clone(), value.clone());
    }
}

/// Combine engine bound to a selector extractor
#[derive(Clone)]
pub struct Combiner {
    extractor: Arc<dyn SelectorExtractor>,
}

impl Default for Combiner {
    fn default() -> Self {
        Combiner::new(Arc::new(TermSelectorExtractor))
    }
}

impl Combiner {
    pub fn new(extractor: Arc<dyn SelectorExtractor>) -> Self {
        Combiner { extractor }
    }

    /// `combine`, then extract selectors if this query has none yet
    pub fn merge(
        &self,
        incoming: &QueryMetric,
        prior: Option<&QueryMetric>,
        update_type: UpdateType,
    ) -> QueryMetric {
        let mut merged = combine(incoming, prior, update_type);
        ensure_selectors(&mut merged, self.extractor.as_ref());
        merged
    }
}

impl std::fmt::Debug for Combiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Combiner").finish_non_exhaustive()
    }
}
