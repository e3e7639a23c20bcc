use crate::config::PassivationConfig;
use crate::error::PassivationError;
use crate::message::{CommandSender, CurrentShardState, ShardCommand};
use crate::metrics::PassivationMetrics;
use crate::strategy::{PassivateIntent, Strategy};
use crate::sweeper::run_sweeper;
use crate::types::{EntityId, ShardId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process-wide coordinator of the passivation engine.
///
/// Owns the strategy, the registry of shards hosted on this node, and
/// the idle sweep timer. Shard controllers feed it entity events and
/// apply the passivation intents it returns.
///
/// The node-wide mutex guards only registry mutation and intent
/// generation; intents are dispatched to shard controllers after the
/// lock is released, and each controller applies them serially in its
/// own task.
#[derive(Debug)]
pub struct PassivationManager {
    config: Arc<PassivationConfig>,
    metrics: Arc<PassivationMetrics>,
    inner: Mutex<ManagerInner>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct ManagerInner {
    strategy: Strategy,
    shards: BTreeMap<ShardId, CommandSender>,
}

impl PassivationManager {
    /// Create a manager with unregistered metrics.
    ///
    /// Must be called within a tokio runtime: the idle sweep task is
    /// spawned here when the strategy requires one.
    pub fn new(config: PassivationConfig) -> Result<Arc<Self>, PassivationError> {
        Self::build(config, PassivationMetrics::unregistered())
    }

    /// Create a manager and register its metrics with `registry`.
    pub fn with_registry(
        config: PassivationConfig,
        registry: &prometheus::Registry,
    ) -> Result<Arc<Self>, PassivationError> {
        let metrics =
            PassivationMetrics::new(registry).map_err(|e| PassivationError::InvalidConfig {
                reason: format!("failed to register metrics: {e}"),
            })?;
        Self::build(config, metrics)
    }

    fn build(
        config: PassivationConfig,
        metrics: PassivationMetrics,
    ) -> Result<Arc<Self>, PassivationError> {
        config.validate()?;
        let strategy = Strategy::from_config(&config.effective_strategy());
        let sweep_tick = strategy.sweep_tick(config.sweep_min_resolution);

        let manager = Arc::new(Self {
            config: Arc::new(config),
            metrics: Arc::new(metrics),
            inner: Mutex::new(ManagerInner {
                strategy,
                shards: BTreeMap::new(),
            }),
            cancel: CancellationToken::new(),
        });

        if let Some(tick) = sweep_tick {
            tokio::spawn(run_sweeper(
                Arc::downgrade(&manager),
                tick,
                manager.cancel.clone(),
            ));
        }

        Ok(manager)
    }

    pub fn config(&self) -> &Arc<PassivationConfig> {
        &self.config
    }

    pub(crate) fn metrics(&self) -> Arc<PassivationMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Add `shard` to the active set. Under LRU this retunes the
    /// per-shard limit and may evict entities from every hosted shard;
    /// those intents are dispatched to the affected controllers.
    pub(crate) fn register(
        &self,
        shard: ShardId,
        sender: CommandSender,
    ) -> Result<(), PassivationError> {
        let dispatches = {
            let mut inner = self.inner.lock();
            if inner.shards.contains_key(&shard) {
                return Err(PassivationError::ShardAlreadyRegistered { shard_id: shard });
            }
            inner.shards.insert(shard.clone(), sender);
            let intents = inner.strategy.on_shard_activated(&shard);
            Self::collect_dispatches(&inner, intents)
        };
        debug!(shard_id = %shard, "shard registered");
        Self::dispatch(dispatches);
        Ok(())
    }

    /// Remove `shard` from the active set and rebalance the rest.
    pub(crate) fn unregister(&self, shard: &ShardId) {
        let dispatches = {
            let mut inner = self.inner.lock();
            if inner.shards.remove(shard).is_none() {
                debug!(shard_id = %shard, "unregister of unknown shard ignored");
                return;
            }
            let intents = inner.strategy.on_shard_deactivated(shard);
            Self::collect_dispatches(&inner, intents)
        };
        debug!(shard_id = %shard, "shard unregistered");
        Self::dispatch(dispatches);
    }

    /// Record the activation of a new entity. Returns the intents the
    /// calling controller must apply, in order.
    pub fn record_create(
        &self,
        shard: &ShardId,
        id: &EntityId,
        now: Instant,
    ) -> Vec<PassivateIntent> {
        let mut inner = self.inner.lock();
        if !Self::known(&inner, shard, id) {
            return Vec::new();
        }
        inner.strategy.on_create(shard, id, now)
    }

    /// Record a message routed to an active entity. Returns the intents
    /// the calling controller must apply, in order.
    pub fn record_access(
        &self,
        shard: &ShardId,
        id: &EntityId,
        now: Instant,
    ) -> Vec<PassivateIntent> {
        let mut inner = self.inner.lock();
        if !Self::known(&inner, shard, id) {
            return Vec::new();
        }
        inner.strategy.on_access(shard, id, now)
    }

    /// Record that an entity reached `Stopped`.
    pub fn record_stop(&self, shard: &ShardId, id: &EntityId) {
        let mut inner = self.inner.lock();
        if !Self::known(&inner, shard, id) {
            return;
        }
        inner.strategy.on_stop(shard, id);
    }

    /// Record a passivation handshake that started outside any intent
    /// the strategy emitted (self-request or force-stop), so the entity
    /// leaves the recency/idle bookkeeping immediately.
    pub fn record_passivate(&self, shard: &ShardId, id: &EntityId) {
        let mut inner = self.inner.lock();
        if !Self::known(&inner, shard, id) {
            return;
        }
        inner.strategy.on_passivate(shard, id);
    }

    /// Timer-driven idle sweep. Generates intents under the node lock,
    /// dispatches them to the affected shard controllers after release,
    /// and returns them.
    pub fn scheduled_sweep(&self, now: Instant) -> Vec<PassivateIntent> {
        let (intents, dispatches) = {
            let mut inner = self.inner.lock();
            let intents = inner.strategy.sweep(now);
            let dispatches = Self::collect_dispatches(&inner, intents.clone());
            (intents, dispatches)
        };
        if !intents.is_empty() {
            debug!(count = intents.len(), "idle sweep emitted passivation intents");
        }
        Self::dispatch(dispatches);
        intents
    }

    /// Administrative query: the ids currently in `Active` state on
    /// `shard`, answered by the shard controller itself.
    pub async fn snapshot_active(
        &self,
        shard: &ShardId,
    ) -> Result<CurrentShardState, PassivationError> {
        let sender = {
            let inner = self.inner.lock();
            inner
                .shards
                .get(shard)
                .cloned()
                .ok_or_else(|| PassivationError::UnknownShard {
                    shard_id: shard.clone(),
                })?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(ShardCommand::GetShardState { reply_tx })
            .map_err(|_| PassivationError::ShardStopped {
                shard_id: shard.clone(),
            })?;
        reply_rx.await.map_err(|_| PassivationError::ShardStopped {
            shard_id: shard.clone(),
        })
    }

    /// Stop the sweep timer. Shard controllers are stopped through
    /// their own handles; this only shuts down manager-owned tasks.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn known(inner: &ManagerInner, shard: &ShardId, id: &EntityId) -> bool {
        if inner.shards.contains_key(shard) {
            true
        } else {
            warn!(
                shard_id = %shard,
                entity_id = %id,
                "dropping event for unregistered shard"
            );
            false
        }
    }

    /// Pair each intent with its controller's sender, preserving order.
    /// Called under the lock; the sends happen after release.
    fn collect_dispatches(
        inner: &ManagerInner,
        intents: Vec<PassivateIntent>,
    ) -> Vec<(CommandSender, Vec<PassivateIntent>)> {
        let mut grouped: Vec<(ShardId, Vec<PassivateIntent>)> = Vec::new();
        for intent in intents {
            match grouped.last_mut() {
                Some((shard, batch)) if *shard == intent.shard_id => batch.push(intent),
                _ => grouped.push((intent.shard_id.clone(), vec![intent])),
            }
        }
        grouped
            .into_iter()
            .filter_map(|(shard, batch)| match inner.shards.get(&shard) {
                Some(sender) => Some((sender.clone(), batch)),
                None => {
                    debug!(shard_id = %shard, "dropping intents for departed shard");
                    None
                }
            })
            .collect()
    }

    fn dispatch(dispatches: Vec<(CommandSender, Vec<PassivateIntent>)>) {
        for (sender, intents) in dispatches {
            // A closed channel means the controller is already gone;
            // its entities are stopping anyway.
            let _ = sender.send(ShardCommand::ApplyIntents { intents });
        }
    }
}

impl Drop for PassivationManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
