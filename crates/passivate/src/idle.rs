use crate::types::EntityId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Last-touch timestamps for the active entities of one shard.
///
/// Timestamps record when the shard controller began dispatching a
/// message, not when the worker finished processing it, so idle
/// detection is independent of worker latency.
#[derive(Debug, Default)]
pub struct IdleTracker {
    last_touched: HashMap<EntityId, Instant>,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access to `id` at `now`.
    pub fn touch(&mut self, id: &EntityId, now: Instant) {
        self.last_touched.insert(id.clone(), now);
    }

    /// Forget `id`. Returns whether it was tracked.
    pub fn remove(&mut self, id: &EntityId) -> bool {
        self.last_touched.remove(id).is_some()
    }

    /// Entries idle for at least `timeout` as of `now`, oldest first.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<EntityId> {
        let mut hits: Vec<(&EntityId, &Instant)> = self
            .last_touched
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) >= timeout)
            .collect();
        hits.sort_by_key(|(id, last)| (**last, (*id).clone()));
        hits.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.last_touched.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.last_touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_touched.is_empty()
    }
}
