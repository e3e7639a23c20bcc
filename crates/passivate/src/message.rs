use crate::strategy::PassivateIntent;
use crate::types::{EntityId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};

/// Channel types for the shard controller's inbound command queue.
pub(crate) type CommandSender = mpsc::UnboundedSender<ShardCommand>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<ShardCommand>;

/// A message delivered into an entity worker's mailbox.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// Normal application payload.
    Deliver(Vec<u8>),
    /// Terminal signal; the worker drains its mailbox, observes the stop
    /// message, and exits.
    Stop(Vec<u8>),
}

/// Commands processed by a shard controller, one at a time.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Route `payload` to `entity_id`, spawning a worker if absent.
    Deliver {
        entity_id: EntityId,
        payload: Vec<u8>,
    },
    /// Self-requested passivation from a worker, carrying the stop
    /// message to use as the terminal signal.
    Passivate {
        entity_id: EntityId,
        stop_message: Vec<u8>,
    },
    /// Eviction intents pushed by the manager (rebalance or idle sweep).
    ApplyIntents { intents: Vec<PassivateIntent> },
    /// A worker task finished; `clean` is false when it panicked.
    /// `epoch` identifies the incarnation the notification belongs to.
    WorkerTerminated {
        entity_id: EntityId,
        epoch: u64,
        clean: bool,
    },
    /// The handoff deadline for a passivating entity elapsed.
    HandoffExpired { entity_id: EntityId, epoch: u64 },
    /// Administrative query for the shard's active entity ids.
    GetShardState {
        reply_tx: oneshot::Sender<CurrentShardState>,
    },
}

/// Snapshot of a shard's active entities, as returned by the
/// administrative query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentShardState {
    pub shard_id: ShardId,
    pub active_ids: BTreeSet<EntityId>,
}
