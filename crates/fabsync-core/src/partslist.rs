//! Parts-list diffing against the bridge's reported endpoint set

use std::collections::BTreeSet;
use tracing::debug;

use crate::EndpointId;

/// A change observed between two consecutive parts-list reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartsChange {
    Added(EndpointId),
    Removed(EndpointId),
}

/// Tracks the last parts list reported by the bridge and turns each new
/// report into an ordered sequence of add/remove changes.
///
/// Feeding the same set twice in a row yields no changes, so a redundant
/// subscription report is harmless.
#[derive(Debug, Default)]
pub struct PartsListTracker {
    known: BTreeSet<EndpointId>,
}

impl PartsListTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diff `reported` against the previously known set, emitting changes
    /// in ascending endpoint order. The stored set is replaced with
    /// `reported` whether or not anything changed.
    pub fn update(&mut self, reported: impl IntoIterator<Item = EndpointId>) -> Vec<PartsChange> {
        let new: BTreeSet<EndpointId> = reported.into_iter().collect();

        let mut changes: Vec<PartsChange> = Vec::new();
        for &id in new.difference(&self.known) {
            changes.push(PartsChange::Added(id));
        }
        for &id in self.known.difference(&new) {
            changes.push(PartsChange::Removed(id));
        }
        changes.sort_by_key(|c| match *c {
            PartsChange::Added(id) | PartsChange::Removed(id) => id,
        });

        if !changes.is_empty() {
            debug!(
                known = self.known.len(),
                reported = new.len(),
                changes = changes.len(),
                "Parts list changed"
            );
        }
        self.known = new;
        changes
    }

    pub fn known(&self) -> &BTreeSet<EndpointId> {
        &self.known
    }
}
