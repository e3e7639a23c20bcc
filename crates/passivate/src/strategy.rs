use crate::config::StrategyConfig;
use crate::idle::IdleTracker;
use crate::recency::RecencyIndex;
use crate::types::{EntityId, ShardId};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// An instruction to passivate one entity, produced by a [`Strategy`] in
/// response to a shard event. Intents within one event are applied in
/// the order returned (oldest first under LRU).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassivateIntent {
    pub shard_id: ShardId,
    pub entity_id: EntityId,
}

/// Passivation policy with its per-shard bookkeeping.
///
/// A tagged variant rather than a trait object: the three policies share
/// the same event surface and the state stays explicit. All events are
/// delivered under the manager's node-wide lock; per-shard structures are
/// keyed by [`ShardId`] in a `BTreeMap` so that cross-shard rebalancing
/// produces evictions in a deterministic shard order.
#[derive(Debug)]
pub(crate) enum Strategy {
    None,
    Idle(IdleStrategy),
    LeastRecentlyUsed(LruStrategy),
}

#[derive(Debug)]
pub(crate) struct IdleStrategy {
    timeout: Duration,
    shards: BTreeMap<ShardId, IdleTracker>,
}

#[derive(Debug)]
pub(crate) struct LruStrategy {
    total_limit: usize,
    per_shard_limit: usize,
    shards: BTreeMap<ShardId, RecencyIndex>,
}

impl Strategy {
    pub fn from_config(config: &StrategyConfig) -> Self {
        match config {
            StrategyConfig::None => Strategy::None,
            StrategyConfig::Idle { timeout } => Strategy::Idle(IdleStrategy {
                timeout: *timeout,
                shards: BTreeMap::new(),
            }),
            StrategyConfig::LeastRecentlyUsed { limit } => {
                Strategy::LeastRecentlyUsed(LruStrategy {
                    total_limit: *limit,
                    per_shard_limit: *limit,
                    shards: BTreeMap::new(),
                })
            }
        }
    }

    /// How often the idle sweep must run, floored at `min_resolution`.
    /// `None` for strategies that do not sweep.
    pub fn sweep_tick(&self, min_resolution: Duration) -> Option<Duration> {
        match self {
            Strategy::Idle(idle) => Some((idle.timeout / 2).max(min_resolution)),
            _ => None,
        }
    }

    pub fn on_shard_activated(&mut self, shard: &ShardId) -> Vec<PassivateIntent> {
        match self {
            Strategy::None => Vec::new(),
            Strategy::Idle(idle) => {
                idle.shards.entry(shard.clone()).or_default();
                Vec::new()
            }
            Strategy::LeastRecentlyUsed(lru) => {
                lru.shards.entry(shard.clone()).or_default();
                lru.rebalance()
            }
        }
    }

    pub fn on_shard_deactivated(&mut self, shard: &ShardId) -> Vec<PassivateIntent> {
        match self {
            Strategy::None => Vec::new(),
            Strategy::Idle(idle) => {
                idle.shards.remove(shard);
                Vec::new()
            }
            Strategy::LeastRecentlyUsed(lru) => {
                lru.shards.remove(shard);
                lru.rebalance()
            }
        }
    }

    pub fn on_create(
        &mut self,
        shard: &ShardId,
        id: &EntityId,
        now: Instant,
    ) -> Vec<PassivateIntent> {
        self.on_access(shard, id, now)
    }

    pub fn on_access(
        &mut self,
        shard: &ShardId,
        id: &EntityId,
        now: Instant,
    ) -> Vec<PassivateIntent> {
        match self {
            Strategy::None => Vec::new(),
            Strategy::Idle(idle) => {
                idle.shards.entry(shard.clone()).or_default().touch(id, now);
                Vec::new()
            }
            Strategy::LeastRecentlyUsed(lru) => {
                let limit = lru.per_shard_limit;
                let index = lru.shards.entry(shard.clone()).or_default();
                index.touch(id);
                LruStrategy::trim(shard, index, limit)
            }
        }
    }

    /// The entity reached `Stopped`; drop its bookkeeping.
    pub fn on_stop(&mut self, shard: &ShardId, id: &EntityId) {
        self.forget(shard, id);
    }

    /// A handshake started outside any intent this strategy emitted
    /// (self-request or force-stop); the entity is no longer active.
    pub fn on_passivate(&mut self, shard: &ShardId, id: &EntityId) {
        self.forget(shard, id);
    }

    fn forget(&mut self, shard: &ShardId, id: &EntityId) {
        match self {
            Strategy::None => {}
            Strategy::Idle(idle) => {
                if let Some(tracker) = idle.shards.get_mut(shard) {
                    tracker.remove(id);
                }
            }
            Strategy::LeastRecentlyUsed(lru) => {
                if let Some(index) = lru.shards.get_mut(shard) {
                    index.remove(id);
                }
            }
        }
    }

    /// Timer-driven pass over all shards; emits intents for entries idle
    /// at least the configured timeout, oldest first per shard.
    pub fn sweep(&mut self, now: Instant) -> Vec<PassivateIntent> {
        let Strategy::Idle(idle) = self else {
            return Vec::new();
        };
        let mut intents = Vec::new();
        for (shard, tracker) in idle.shards.iter_mut() {
            for id in tracker.expired(now, idle.timeout) {
                tracker.remove(&id);
                intents.push(PassivateIntent {
                    shard_id: shard.clone(),
                    entity_id: id,
                });
            }
        }
        intents
    }

    /// Active entities this strategy currently tracks for `shard`.
    /// Used for sanity checks in tests; `None` tracks nothing.
    #[cfg(test)]
    pub fn tracked(&self, shard: &ShardId) -> usize {
        match self {
            Strategy::None => 0,
            Strategy::Idle(idle) => idle.shards.get(shard).map_or(0, IdleTracker::len),
            Strategy::LeastRecentlyUsed(lru) => {
                lru.shards.get(shard).map_or(0, RecencyIndex::len)
            }
        }
    }
}

impl LruStrategy {
    /// Recompute the per-shard limit from the active shard count, then
    /// trim every shard to it, oldest entries first, shards in id order.
    fn rebalance(&mut self) -> Vec<PassivateIntent> {
        let shard_count = self.shards.len().max(1);
        self.per_shard_limit = (self.total_limit / shard_count).max(1);

        let limit = self.per_shard_limit;
        let mut intents = Vec::new();
        for (shard, index) in self.shards.iter_mut() {
            intents.extend(Self::trim(shard, index, limit));
        }
        intents
    }

    fn trim(shard: &ShardId, index: &mut RecencyIndex, limit: usize) -> Vec<PassivateIntent> {
        let mut intents = Vec::new();
        while index.len() > limit {
            let Some(victim) = index.pop_least_recent() else {
                break;
            };
            intents.push(PassivateIntent {
                shard_id: shard.clone(),
                entity_id: victim,
            });
        }
        intents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> ShardId {
        ShardId::new(s)
    }

    fn eid(s: &str) -> EntityId {
        EntityId::new(s)
    }

    fn intent(shard: &str, id: &str) -> PassivateIntent {
        PassivateIntent {
            shard_id: sid(shard),
            entity_id: eid(id),
        }
    }

    fn lru(limit: usize) -> Strategy {
        Strategy::from_config(&StrategyConfig::LeastRecentlyUsed { limit })
    }

    fn idle(timeout: Duration) -> Strategy {
        Strategy::from_config(&StrategyConfig::Idle { timeout })
    }

    #[tokio::test(start_paused = true)]
    async fn none_emits_nothing() {
        let mut strategy = Strategy::from_config(&StrategyConfig::None);
        assert!(strategy.on_shard_activated(&sid("1")).is_empty());
        assert!(strategy
            .on_create(&sid("1"), &eid("a"), Instant::now())
            .is_empty());
        assert!(strategy
            .on_access(&sid("1"), &eid("a"), Instant::now())
            .is_empty());
        assert!(strategy.sweep(Instant::now()).is_empty());
        assert_eq!(strategy.tracked(&sid("1")), 0);
        assert!(strategy.sweep_tick(Duration::from_millis(100)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_least_recent_beyond_limit() {
        let mut strategy = lru(3);
        strategy.on_shard_activated(&sid("1"));
        let now = Instant::now();

        for name in ["a", "b", "c"] {
            assert!(strategy.on_create(&sid("1"), &eid(name), now).is_empty());
        }
        let intents = strategy.on_create(&sid("1"), &eid("d"), now);
        assert_eq!(intents, vec![intent("1", "a")]);
        assert_eq!(strategy.tracked(&sid("1")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_access_protects_from_eviction() {
        let mut strategy = lru(3);
        strategy.on_shard_activated(&sid("1"));
        let now = Instant::now();

        for name in ["a", "b", "c"] {
            strategy.on_create(&sid("1"), &eid(name), now);
        }
        strategy.on_access(&sid("1"), &eid("a"), now);
        let intents = strategy.on_create(&sid("1"), &eid("d"), now);
        assert_eq!(intents, vec![intent("1", "b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_limit_splits_across_shards() {
        let mut strategy = lru(10);
        strategy.on_shard_activated(&sid("1"));
        let now = Instant::now();

        for i in 0..10 {
            assert!(strategy
                .on_create(&sid("1"), &eid(&format!("e-{i}")), now)
                .is_empty());
        }

        // Second shard halves the per-shard budget: five oldest evicted.
        let intents = strategy.on_shard_activated(&sid("2"));
        assert_eq!(
            intents,
            (0..5)
                .map(|i| intent("1", &format!("e-{i}")))
                .collect::<Vec<_>>()
        );
        assert_eq!(strategy.tracked(&sid("1")), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_limit_grows_back_on_deactivation() {
        let mut strategy = lru(4);
        strategy.on_shard_activated(&sid("1"));
        strategy.on_shard_activated(&sid("2"));
        let now = Instant::now();

        // Per-shard limit is 2.
        strategy.on_create(&sid("1"), &eid("a"), now);
        strategy.on_create(&sid("1"), &eid("b"), now);
        let intents = strategy.on_create(&sid("1"), &eid("c"), now);
        assert_eq!(intents, vec![intent("1", "a")]);

        // Dropping shard 2 restores the full budget to shard 1.
        assert!(strategy.on_shard_deactivated(&sid("2")).is_empty());
        assert!(strategy.on_create(&sid("1"), &eid("d"), now).is_empty());
        assert!(strategy.on_create(&sid("1"), &eid("e"), now).is_empty());
        assert_eq!(strategy.tracked(&sid("1")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_per_shard_limit_is_at_least_one() {
        let mut strategy = lru(2);
        for i in 0..4 {
            strategy.on_shard_activated(&sid(&format!("{i}")));
        }
        let now = Instant::now();
        assert!(strategy.on_create(&sid("0"), &eid("a"), now).is_empty());
        let intents = strategy.on_create(&sid("0"), &eid("b"), now);
        assert_eq!(intents, vec![intent("0", "a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_rebalance_visits_shards_in_order() {
        let mut strategy = lru(8);
        strategy.on_shard_activated(&sid("b"));
        strategy.on_shard_activated(&sid("a"));
        let now = Instant::now();

        for i in 0..4 {
            strategy.on_create(&sid("a"), &eid(&format!("a-{i}")), now);
            strategy.on_create(&sid("b"), &eid(&format!("b-{i}")), now);
        }

        // Third shard: limit drops 4 -> 2, each shard sheds its two
        // oldest, shard "a" before shard "b".
        let intents = strategy.on_shard_activated(&sid("c"));
        assert_eq!(
            intents,
            vec![
                intent("a", "a-0"),
                intent("a", "a-1"),
                intent("b", "b-0"),
                intent("b", "b-1"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lru_forgets_stopped_and_passivated_entities() {
        let mut strategy = lru(2);
        strategy.on_shard_activated(&sid("1"));
        let now = Instant::now();

        strategy.on_create(&sid("1"), &eid("a"), now);
        strategy.on_create(&sid("1"), &eid("b"), now);
        strategy.on_passivate(&sid("1"), &eid("a"));
        strategy.on_stop(&sid("1"), &eid("b"));
        assert_eq!(strategy.tracked(&sid("1")), 0);

        // Freed capacity is usable again.
        assert!(strategy.on_create(&sid("1"), &eid("c"), now).is_empty());
        assert!(strategy.on_create(&sid("1"), &eid("d"), now).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_emits_expired_oldest_first() {
        let timeout = Duration::from_secs(1);
        let mut strategy = idle(timeout);
        strategy.on_shard_activated(&sid("1"));

        strategy.on_create(&sid("1"), &eid("a"), Instant::now());
        tokio::time::advance(Duration::from_millis(300)).await;
        strategy.on_create(&sid("1"), &eid("b"), Instant::now());

        tokio::time::advance(Duration::from_millis(800)).await;
        // "a" is 1.1s idle, "b" only 0.8s.
        let intents = strategy.sweep(Instant::now());
        assert_eq!(intents, vec![intent("1", "a")]);

        tokio::time::advance(Duration::from_millis(300)).await;
        let intents = strategy.sweep(Instant::now());
        assert_eq!(intents, vec![intent("1", "b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_access_defers_passivation() {
        let timeout = Duration::from_secs(1);
        let mut strategy = idle(timeout);
        strategy.on_shard_activated(&sid("1"));

        strategy.on_create(&sid("1"), &eid("a"), Instant::now());
        tokio::time::advance(Duration::from_millis(900)).await;
        strategy.on_access(&sid("1"), &eid("a"), Instant::now());
        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(strategy.sweep(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(200)).await;
        let intents = strategy.sweep(Instant::now());
        assert_eq!(intents, vec![intent("1", "a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_does_not_emit_twice() {
        let mut strategy = idle(Duration::from_secs(1));
        strategy.on_shard_activated(&sid("1"));
        strategy.on_create(&sid("1"), &eid("a"), Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(strategy.sweep(Instant::now()).len(), 1);
        assert!(strategy.sweep(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_deactivation_drops_shard_state() {
        let mut strategy = idle(Duration::from_secs(1));
        strategy.on_shard_activated(&sid("1"));
        strategy.on_create(&sid("1"), &eid("a"), Instant::now());
        strategy.on_shard_deactivated(&sid("1"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(strategy.sweep(Instant::now()).is_empty());
    }

    #[test]
    fn sweep_tick_is_half_the_timeout_with_a_floor() {
        let strategy = idle(Duration::from_secs(10));
        assert_eq!(
            strategy.sweep_tick(Duration::from_millis(100)),
            Some(Duration::from_secs(5))
        );

        let strategy = idle(Duration::from_millis(100));
        assert_eq!(
            strategy.sweep_tick(Duration::from_millis(100)),
            Some(Duration::from_millis(100))
        );
    }
}
