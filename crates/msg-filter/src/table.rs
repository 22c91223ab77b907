//! Filter Table
//!
//! Evaluation order is API filters in registration order, then variant
//! filters in registration order. The first match decides between pass and
//! block; no match passes. A message admitted by a pass filter still picks up
//! the response of a later matching flow control filter.

use passthru_protocol::limits::MAX_FILTERS;
use passthru_protocol::PassThruMsg;
use tracing::{debug, trace};

use crate::filter::{FilterKind, FilterOwner, MsgFilter};
use crate::FilterError;

/// Result of evaluating an inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Pass,
    Block,
    /// Matched a flow control filter; carries the response message
    FlowControl(PassThruMsg),
}

impl FilterOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FilterOutcome::Block)
    }
}

struct Entry {
    id: u32,
    owner: FilterOwner,
    filter: MsgFilter,
}

/// Ordered set of filters for one channel
pub struct FilterTable {
    entries: Vec<Entry>,
    next_id: u32,
    max_api_filters: usize,
}

impl FilterTable {
    pub fn new() -> Self {
        Self::with_limit(MAX_FILTERS)
    }

    /// Table accepting at most `max_api_filters` API filters
    pub fn with_limit(max_api_filters: usize) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            max_api_filters,
        }
    }

    /// Append a filter and return its id
    pub fn add(&mut self, filter: MsgFilter, owner: FilterOwner) -> Result<u32, FilterError> {
        if owner == FilterOwner::Api {
            if self.api_len() >= self.max_api_filters {
                return Err(FilterError::LimitExceeded(self.max_api_filters));
            }
            if filter.kind() == FilterKind::FlowControl && self.duplicates_flow_control(&filter) {
                return Err(FilterError::NotUnique);
            }
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        debug!(id, kind = ?filter.kind(), ?owner, "Filter added");
        self.entries.push(Entry { id, owner, filter });
        Ok(id)
    }

    /// Remove an API filter
    pub fn remove(&mut self, id: u32) -> Result<MsgFilter, FilterError> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.id == id && e.owner == FilterOwner::Api)
            .ok_or(FilterError::NotFound(id))?;
        debug!(id, "Filter removed");
        Ok(self.entries.remove(pos).filter)
    }

    /// Remove every variant-owned filter, returning how many were removed
    pub fn remove_variant_filters(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != FilterOwner::Variant);
        before - self.entries.len()
    }

    /// Remove every API filter, keeping variant filters
    pub fn clear_api(&mut self) {
        self.entries.retain(|e| e.owner != FilterOwner::Api);
    }

    /// Remove everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Decide what happens to an inbound message
    pub fn evaluate(&self, msg: &PassThruMsg) -> FilterOutcome {
        let api = self.entries.iter().filter(|e| e.owner == FilterOwner::Api);
        let variant = self
            .entries
            .iter()
            .filter(|e| e.owner == FilterOwner::Variant);

        let mut passed = false;
        for entry in api.chain(variant) {
            if !entry.filter.matches(msg.data()) {
                continue;
            }
            trace!(id = entry.id, kind = ?entry.filter.kind(), passed, "Filter matched");
            match (entry.filter.kind(), entry.filter.flow_control()) {
                (FilterKind::FlowControl, Some(response)) => {
                    return FilterOutcome::FlowControl(response.clone())
                }
                (FilterKind::Block, _) if !passed => return FilterOutcome::Block,
                (FilterKind::Block, _) => {}
                _ => passed = true,
            }
        }
        FilterOutcome::Pass
    }

    pub fn get(&self, id: u32) -> Option<&MsgFilter> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.filter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of API filters
    pub fn api_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.owner == FilterOwner::Api)
            .count()
    }

    fn duplicates_flow_control(&self, candidate: &MsgFilter) -> bool {
        let masked = candidate.masked_pattern();
        let response_id = candidate.flow_control().and_then(|m| m.can_id());
        self.entries
            .iter()
            .filter(|e| e.owner == FilterOwner::Api && e.filter.kind() == FilterKind::FlowControl)
            .any(|e| {
                e.filter.masked_pattern() == masked
                    || (response_id.is_some()
                        && e.filter.flow_control().and_then(|m| m.can_id()) == response_id)
            })
    }
}

impl Default for FilterTable {
    fn default() -> Self {
        Self::new()
    }
}
