use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use super::event::Event;

type Tally = IndexMap<String, i64>;

/// Immutable point-in-time view of the running totals.
///
/// Snapshots share storage with the aggregator until the next update, which
/// copies the map instead of mutating it while a snapshot is still alive.
#[derive(Debug, Clone, Default)]
pub struct Snapshot(Arc<Tally>);

impl Snapshot {
    /// Entries in first-seen order.
    pub fn iter(&self) -> indexmap::map::Iter<'_, String, i64> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &IndexMap<String, i64> {
        &self.0
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Snapshot {}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Folds `(code, delta)` pairs into cumulative per-code totals.
///
/// The seed is the empty map and is never emitted.
#[derive(Debug, Default)]
pub struct Aggregator {
    totals: Arc<Tally>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `code` and return the resulting snapshot.
    pub fn apply(&mut self, code: &str, delta: i64) -> Snapshot {
        let totals = Arc::make_mut(&mut self.totals);
        match totals.get_mut(code) {
            Some(total) => *total = total.saturating_add(delta),
            None => {
                totals.insert(code.to_string(), delta);
            }
        }
        Snapshot(Arc::clone(&self.totals))
    }

    /// Apply every entry of `event`, one snapshot per entry.
    pub fn apply_event(&mut self, event: &Event) -> Vec<Snapshot> {
        event
            .iter()
            .map(|(code, delta)| self.apply(code, delta))
            .collect()
    }
}
