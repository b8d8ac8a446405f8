//! Change detection against the previous snapshot
//!
//! Only pairs that are new or changed in the incoming snapshot are reported.
//! A key that was present before and is missing now produces nothing: removal
//! is silent. The stored baseline is one snapshot deep and is replaced
//! wholesale, never merged.

use super::{Reading, ReadingSnapshot};
use tracing::debug;

/// Owner of the previously seen snapshot
#[derive(Debug, Default)]
pub struct DeltaDetector {
    previous: ReadingSnapshot,
}

impl DeltaDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs of `snapshot` whose key is absent from the baseline or whose
    /// value differs from the stored one, in key order.
    pub fn diff(&self, snapshot: &ReadingSnapshot) -> Vec<Reading> {
        snapshot
            .iter()
            .filter(|(key, value)| self.previous.get(key) != Some(*value))
            .map(|(key, value)| Reading {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Makes `snapshot` the new baseline, whether or not it changed anything.
    pub fn replace(&mut self, snapshot: ReadingSnapshot) {
        debug!(
            "Replacing baseline of {} readings with {} readings",
            self.previous.len(),
            snapshot.len()
        );
        self.previous = snapshot;
    }

    pub fn previous(&self) -> &ReadingSnapshot {
        &self.previous
    }
}
