//! Pending experiment starts
//!
//! `initialize` announces an experiment and how many fragments it will
//! stage. The entry lives until every fragment has been admitted or its
//! deadline passes, whichever comes first.

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStart {
    pub remaining: u32,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct PendingStarts {
    entries: BTreeMap<String, PendingStart>,
}

impl PendingStarts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, experiment: &str) -> Option<&PendingStart> {
        self.entries.get(experiment)
    }

    pub fn contains(&self, experiment: &str) -> bool {
        self.entries.contains_key(experiment)
    }

    /// Expect `fragments` fragments for `experiment` within `window`
    ///
    /// Announcing an experiment again replaces the earlier entry. Nothing is
    /// recorded for zero fragments.
    pub fn announce(&mut self, experiment: &str, fragments: u32, now: Instant, window: Duration) {
        if fragments == 0 {
            return;
        }
        self.entries.insert(
            experiment.to_string(),
            PendingStart {
                remaining: fragments,
                deadline: now + window,
            },
        );
    }

    /// Count one admitted fragment; true when the experiment is complete
    pub fn admit(&mut self, experiment: &str) -> bool {
        let Some(entry) = self.entries.get_mut(experiment) else {
            return false;
        };
        entry.remaining = entry.remaining.saturating_sub(1);
        if entry.remaining == 0 {
            self.entries.remove(experiment);
            true
        } else {
            false
        }
    }

    /// Forget an announcement; true if there was one
    pub fn cancel(&mut self, experiment: &str) -> bool {
        self.entries.remove(experiment).is_some()
    }

    /// Drop entries whose deadline has passed, returning their names
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now > entry.deadline)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.entries.remove(name);
        }
        expired
    }
}
