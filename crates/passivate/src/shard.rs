use crate::config::PassivationConfig;
use crate::entity::{Entity, EntityContext};
use crate::error::PassivationError;
use crate::manager::PassivationManager;
use crate::message::{
    CommandReceiver, CommandSender, CurrentShardState, ShardCommand, WorkerMessage,
};
use crate::metrics::PassivationMetrics;
use crate::strategy::PassivateIntent;
use crate::types::{EntityId, ShardId};
use crate::worker::run_worker;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// How long shutdown waits for force-cancelled workers to exit before
/// detaching from them.
const FORCE_STOP_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of a hosted entity. `Stopped` has no variant: a stopped
/// entity is removed from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityStatus {
    Active,
    Passivating,
}

/// Why a passivation handshake is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassivationSource {
    /// A strategy intent; the strategy already dropped its bookkeeping.
    Intent,
    /// A worker's own request; the strategy must be told.
    SelfRequest,
}

struct EntityEntry {
    status: EntityStatus,
    /// Incarnation counter; stale worker notifications are matched
    /// against it and ignored.
    epoch: u64,
    mailbox_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker_cancel: CancellationToken,
    /// Completes once the worker task has fully exited.
    monitor: JoinHandle<()>,
    /// Messages received while passivating, delivered FIFO after the
    /// entity restarts.
    buffer: VecDeque<Vec<u8>>,
    handoff_cancel: Option<CancellationToken>,
}

/// Per-shard coordinator.
///
/// Owns one shard's entity table exclusively and processes commands one
/// at a time from its queue: it routes messages to entity workers,
/// records accesses with the manager, applies the passivation intents
/// the manager returns, and mediates the stop handshake with workers.
pub struct ShardController {
    shard_id: ShardId,
    entity: Arc<dyn Entity>,
    manager: Arc<PassivationManager>,
    config: Arc<PassivationConfig>,
    metrics: Arc<PassivationMetrics>,
    entities: HashMap<EntityId, EntityEntry>,
    /// Clone of the controller's own queue, handed to workers (for
    /// self-passivation), handoff timers, and worker monitors.
    self_tx: CommandSender,
    spawn_counter: u64,
}

/// Client handle to a running shard controller.
#[derive(Clone, Debug)]
pub struct ShardHandle {
    shard_id: ShardId,
    commands: CommandSender,
    cancel: CancellationToken,
    manager: Arc<PassivationManager>,
    join: Arc<parking_lot::Mutex<Option<JoinHandle<Result<(), PassivationError>>>>>,
}

impl ShardHandle {
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Route `payload` to `entity_id` on this shard. The entity worker
    /// is created lazily on first message.
    pub fn send(&self, entity_id: EntityId, payload: Vec<u8>) -> Result<(), PassivationError> {
        if entity_id.is_empty() {
            return Err(PassivationError::EmptyEntityId);
        }
        self.commands
            .send(ShardCommand::Deliver { entity_id, payload })
            .map_err(|_| PassivationError::ShardStopped {
                shard_id: self.shard_id.clone(),
            })
    }

    /// Administrative query: the ids currently in `Active` state.
    pub async fn shard_state(&self) -> Result<CurrentShardState, PassivationError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ShardCommand::GetShardState { reply_tx })
            .map_err(|_| PassivationError::ShardStopped {
                shard_id: self.shard_id.clone(),
            })?;
        reply_rx.await.map_err(|_| PassivationError::ShardStopped {
            shard_id: self.shard_id.clone(),
        })
    }

    /// Deactivate the shard: unregister it (rebalancing the remaining
    /// shards), cancel pending handoff timers, stop active workers
    /// gracefully and force-stop passivating ones, then wait for the
    /// controller task to finish. Idempotent.
    pub async fn stop(&self) -> Result<(), PassivationError> {
        self.manager.unregister(&self.shard_id);
        self.cancel.cancel();
        let handle = self.join.lock().take();
        match handle {
            Some(handle) => handle.await.map_err(|e| {
                error!(shard_id = %self.shard_id, error = %e, "shard controller task failed");
                PassivationError::ShardStopped {
                    shard_id: self.shard_id.clone(),
                }
            })?,
            None => Ok(()),
        }
    }
}

impl ShardController {
    /// Register `shard_id` with the manager and start its controller
    /// task. Registration happens before any traffic is accepted, so
    /// strategy events never observe an unknown shard.
    pub fn spawn(
        shard_id: ShardId,
        entity: Arc<dyn Entity>,
        manager: &Arc<PassivationManager>,
    ) -> Result<ShardHandle, PassivationError> {
        if shard_id.is_empty() {
            return Err(PassivationError::InvalidConfig {
                reason: "shard id must be non-empty".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(shard_id.clone(), tx.clone())?;

        let cancel = CancellationToken::new();
        let controller = ShardController {
            shard_id: shard_id.clone(),
            entity,
            manager: Arc::clone(manager),
            config: Arc::clone(manager.config()),
            metrics: manager.metrics(),
            entities: HashMap::new(),
            self_tx: tx.clone(),
            spawn_counter: 0,
        };
        let join = tokio::spawn(controller.run(rx, cancel.clone()));

        Ok(ShardHandle {
            shard_id,
            commands: tx,
            cancel,
            manager: Arc::clone(manager),
            join: Arc::new(parking_lot::Mutex::new(Some(join))),
        })
    }

    async fn run(
        mut self,
        mut rx: CommandReceiver,
        cancel: CancellationToken,
    ) -> Result<(), PassivationError> {
        debug!(shard_id = %self.shard_id, "shard controller started");
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                cmd = rx.recv() => {
                    match cmd {
                        None => break Ok(()),
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                error!(
                                    shard_id = %self.shard_id,
                                    error = %e,
                                    "shard controller aborting"
                                );
                                break Err(e);
                            }
                        }
                    }
                }
            }
        };
        // Covers the abort path; a no-op after ShardHandle::stop.
        self.manager.unregister(&self.shard_id);
        self.shutdown().await;
        result
    }

    async fn handle_command(&mut self, cmd: ShardCommand) -> Result<(), PassivationError> {
        match cmd {
            ShardCommand::Deliver { entity_id, payload } => {
                self.deliver(entity_id, payload).await;
                Ok(())
            }
            ShardCommand::Passivate {
                entity_id,
                stop_message,
            } => {
                self.begin_passivation(&entity_id, stop_message, PassivationSource::SelfRequest);
                Ok(())
            }
            ShardCommand::ApplyIntents { intents } => {
                self.apply_intents(intents);
                Ok(())
            }
            ShardCommand::WorkerTerminated {
                entity_id,
                epoch,
                clean,
            } => self.on_worker_terminated(entity_id, epoch, clean).await,
            ShardCommand::HandoffExpired { entity_id, epoch } => {
                self.on_handoff_expired(&entity_id, epoch);
                Ok(())
            }
            ShardCommand::GetShardState { reply_tx } => {
                let _ = reply_tx.send(self.current_state());
                Ok(())
            }
        }
    }

    /// Route one message: create the worker if absent, record the
    /// access, apply any eviction intents, then deliver or buffer.
    #[instrument(skip(self, payload), fields(shard_id = %self.shard_id, entity_id = %entity_id))]
    async fn deliver(&mut self, entity_id: EntityId, payload: Vec<u8>) {
        let now = Instant::now();
        match self.entities.get(&entity_id).map(|e| e.status) {
            Some(EntityStatus::Passivating) => {
                // Not routed yet: no strategy event until the buffer is
                // drained into a fresh incarnation.
                self.buffer_message(&entity_id, payload);
            }
            Some(EntityStatus::Active) => {
                let intents = self.manager.record_access(&self.shard_id, &entity_id, now);
                self.apply_intents(intents);
                self.route(&entity_id, payload);
            }
            None => {
                if let Err(e) = self.create_worker(&entity_id).await {
                    error!(
                        shard_id = %self.shard_id,
                        entity_id = %entity_id,
                        error = %e,
                        "failed to spawn entity worker, dropping message"
                    );
                    return;
                }
                let intents = self.manager.record_create(&self.shard_id, &entity_id, now);
                self.apply_intents(intents);
                self.route(&entity_id, payload);
            }
        }
    }

    /// Hand `payload` to the entity's worker, or buffer it if the
    /// entity is (or just became) passivating.
    fn route(&mut self, entity_id: &EntityId, payload: Vec<u8>) {
        let Some(entry) = self.entities.get_mut(entity_id) else {
            warn!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                "entity vanished while routing, dropping message"
            );
            return;
        };
        if entry.status == EntityStatus::Active {
            if let Err(err) = entry.mailbox_tx.send(WorkerMessage::Deliver(payload)) {
                // Worker exited on its own; its termination notice is
                // queued behind us and will resynchronize the entry.
                // Buffer so the drain redelivers in order.
                debug!(
                    shard_id = %self.shard_id,
                    entity_id = %entity_id,
                    "worker mailbox closed, buffering until restart"
                );
                if let WorkerMessage::Deliver(payload) = err.0 {
                    self.buffer_message(entity_id, payload);
                }
            }
        } else {
            self.buffer_message(entity_id, payload);
        }
    }

    async fn create_worker(&mut self, entity_id: &EntityId) -> Result<(), PassivationError> {
        self.spawn_counter += 1;
        let epoch = self.spawn_counter;
        let worker_cancel = CancellationToken::new();
        let ctx = EntityContext::new(
            self.shard_id.clone(),
            entity_id.clone(),
            worker_cancel.clone(),
            self.self_tx.clone(),
        );
        let handler =
            self.entity
                .spawn(ctx)
                .await
                .map_err(|e| PassivationError::SpawnFailed {
                    shard_id: self.shard_id.clone(),
                    entity_id: entity_id.clone(),
                    reason: e.to_string(),
                })?;

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            self.shard_id.clone(),
            entity_id.clone(),
            handler,
            mailbox_rx,
            worker_cancel.clone(),
        ));
        let monitor = tokio::spawn(monitor_worker(
            worker,
            self.self_tx.clone(),
            entity_id.clone(),
            epoch,
        ));

        self.entities.insert(
            entity_id.clone(),
            EntityEntry {
                status: EntityStatus::Active,
                epoch,
                mailbox_tx,
                worker_cancel,
                monitor,
                buffer: VecDeque::new(),
                handoff_cancel: None,
            },
        );
        self.metrics.active_entities.inc();
        Ok(())
    }

    fn apply_intents(&mut self, intents: Vec<PassivateIntent>) {
        for intent in intents {
            if intent.shard_id != self.shard_id {
                debug!(
                    shard_id = %self.shard_id,
                    intent_shard = %intent.shard_id,
                    "skipping intent for another shard"
                );
                continue;
            }
            self.begin_passivation(&intent.entity_id, Vec::new(), PassivationSource::Intent);
        }
    }

    /// Step one of the handshake: send the terminal stop signal, move
    /// the entity to `Passivating`, and arm the handoff timer.
    fn begin_passivation(
        &mut self,
        entity_id: &EntityId,
        stop_message: Vec<u8>,
        source: PassivationSource,
    ) {
        let (status, epoch) = match self.entities.get(entity_id) {
            Some(entry) => (entry.status, entry.epoch),
            None => {
                debug!(
                    shard_id = %self.shard_id,
                    entity_id = %entity_id,
                    "passivation target absent, skipping"
                );
                return;
            }
        };
        if status == EntityStatus::Passivating {
            debug!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                "already passivating, skipping"
            );
            return;
        }
        if source == PassivationSource::SelfRequest {
            self.manager.record_passivate(&self.shard_id, entity_id);
        }

        let handoff_cancel = self.arm_handoff_timer(entity_id, epoch);
        if let Some(entry) = self.entities.get_mut(entity_id) {
            let _ = entry.mailbox_tx.send(WorkerMessage::Stop(stop_message));
            entry.status = EntityStatus::Passivating;
            entry.handoff_cancel = Some(handoff_cancel);
        }
        self.metrics.passivations.inc();
        debug!(
            shard_id = %self.shard_id,
            entity_id = %entity_id,
            source = ?source,
            "passivation handshake started"
        );
    }

    fn arm_handoff_timer(&self, entity_id: &EntityId, epoch: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let commands = self.self_tx.clone();
        let timeout = self.config.hand_off_timeout;
        let entity_id = entity_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = commands.send(ShardCommand::HandoffExpired { entity_id, epoch });
                }
            }
        });
        token
    }

    fn on_handoff_expired(&mut self, entity_id: &EntityId, epoch: u64) {
        let Some(entry) = self.entities.get(entity_id) else {
            return;
        };
        if entry.epoch != epoch || entry.status != EntityStatus::Passivating {
            return;
        }
        warn!(
            shard_id = %self.shard_id,
            entity_id = %entity_id,
            timeout_ms = self.config.hand_off_timeout.as_millis() as u64,
            "worker did not terminate within handoff timeout, force-terminating"
        );
        self.metrics.handoff_timeouts.inc();
        entry.worker_cancel.cancel();
    }

    /// Steps three to five of the handshake: the worker is gone.
    /// Transition to `Stopped` (removal), then drain the buffer by
    /// re-routing each message, which lazily spawns a fresh worker.
    async fn on_worker_terminated(
        &mut self,
        entity_id: EntityId,
        epoch: u64,
        clean: bool,
    ) -> Result<(), PassivationError> {
        let Some(entry) = self.entities.get(&entity_id) else {
            debug!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                "termination notice for removed entity, ignoring"
            );
            return Ok(());
        };
        if entry.epoch != epoch {
            debug!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                "stale termination notice, ignoring"
            );
            return Ok(());
        }

        match entry.status {
            EntityStatus::Passivating => {
                if !clean {
                    warn!(
                        shard_id = %self.shard_id,
                        entity_id = %entity_id,
                        "worker crashed mid-passivation, treating as stopped"
                    );
                }
                self.finish_stop(&entity_id).await;
                Ok(())
            }
            EntityStatus::Active => {
                if self.config.strict_transitions {
                    return Err(PassivationError::InvalidTransition {
                        shard_id: self.shard_id.clone(),
                        entity_id,
                        state: "active",
                    });
                }
                warn!(
                    shard_id = %self.shard_id,
                    entity_id = %entity_id,
                    clean,
                    "worker terminated while active, resynchronizing as stopped"
                );
                self.finish_stop(&entity_id).await;
                Ok(())
            }
        }
    }

    async fn finish_stop(&mut self, entity_id: &EntityId) {
        let Some(mut entry) = self.entities.remove(entity_id) else {
            return;
        };
        if let Some(token) = entry.handoff_cancel.take() {
            token.cancel();
        }
        self.manager.record_stop(&self.shard_id, entity_id);
        self.metrics.active_entities.dec();
        debug!(
            shard_id = %self.shard_id,
            entity_id = %entity_id,
            buffered = entry.buffer.len(),
            "entity stopped"
        );

        // FIFO redelivery; the first message respawns the entity.
        for payload in entry.buffer {
            self.deliver(entity_id.clone(), payload).await;
        }
    }

    fn buffer_message(&mut self, entity_id: &EntityId, payload: Vec<u8>) {
        let Some(entry) = self.entities.get_mut(entity_id) else {
            return;
        };
        if entry.buffer.len() >= self.config.buffer_size {
            entry.buffer.pop_front();
            self.metrics.buffer_dropped.inc();
            warn!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                capacity = self.config.buffer_size,
                "passivation buffer full, dropping oldest message"
            );
        }
        entry.buffer.push_back(payload);
    }

    fn current_state(&self) -> CurrentShardState {
        let active_ids: BTreeSet<EntityId> = self
            .entities
            .iter()
            .filter(|(_, entry)| entry.status == EntityStatus::Active)
            .map(|(id, _)| id.clone())
            .collect();
        CurrentShardState {
            shard_id: self.shard_id.clone(),
            active_ids,
        }
    }

    /// Deactivation: cancel handoff timers, stop active workers through
    /// the normal stop signal, force-stop passivating ones immediately,
    /// then wait for the workers to exit (grace, then force).
    async fn shutdown(&mut self) {
        let mut monitors = Vec::new();
        let mut cancels = Vec::new();
        for (entity_id, mut entry) in self.entities.drain() {
            if let Some(token) = entry.handoff_cancel.take() {
                token.cancel();
            }
            match entry.status {
                EntityStatus::Active => {
                    let _ = entry.mailbox_tx.send(WorkerMessage::Stop(Vec::new()));
                }
                EntityStatus::Passivating => entry.worker_cancel.cancel(),
            }
            cancels.push(entry.worker_cancel);
            monitors.push(entry.monitor);
            self.metrics.active_entities.dec();
            debug!(
                shard_id = %self.shard_id,
                entity_id = %entity_id,
                "stopping entity for shard deactivation"
            );
        }
        if monitors.is_empty() {
            debug!(shard_id = %self.shard_id, "shard controller stopped");
            return;
        }

        let mut join = futures::future::join_all(monitors);
        if tokio::time::timeout(self.config.hand_off_timeout, &mut join)
            .await
            .is_err()
        {
            warn!(
                shard_id = %self.shard_id,
                "workers did not stop within handoff timeout, force-terminating"
            );
            for cancel in &cancels {
                cancel.cancel();
            }
            if tokio::time::timeout(FORCE_STOP_GRACE, join).await.is_err() {
                warn!(shard_id = %self.shard_id, "detaching from unresponsive workers");
            }
        }
        debug!(shard_id = %self.shard_id, "shard controller stopped");
    }
}

/// Await the worker task and report its exit to the controller.
/// A panicking worker is reported the same way as a voluntary exit,
/// with `clean = false`.
async fn monitor_worker(
    worker: JoinHandle<()>,
    commands: CommandSender,
    entity_id: EntityId,
    epoch: u64,
) {
    let clean = match worker.await {
        Ok(()) => true,
        Err(e) => {
            if e.is_panic() {
                warn!(entity_id = %entity_id, "entity worker panicked");
            }
            false
        }
    };
    let _ = commands.send(ShardCommand::WorkerTerminated {
        entity_id,
        epoch,
        clean,
    });
}
