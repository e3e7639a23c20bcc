use crate::error::PassivationError;
use crate::message::{CommandSender, ShardCommand};
use crate::types::{EntityId, ShardId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Context provided to entity workers when they are spawned.
#[derive(Clone)]
pub struct EntityContext {
    /// The shard hosting this entity.
    pub shard_id: ShardId,
    /// The id this worker serves.
    pub entity_id: EntityId,
    /// Cancelled when the worker is force-terminated.
    pub cancellation: CancellationToken,
    commands: CommandSender,
}

impl EntityContext {
    pub(crate) fn new(
        shard_id: ShardId,
        entity_id: EntityId,
        cancellation: CancellationToken,
        commands: CommandSender,
    ) -> Self {
        Self {
            shard_id,
            entity_id,
            cancellation,
            commands,
        }
    }

    /// Ask the shard controller to passivate this entity, using
    /// `stop_message` as the terminal signal. The controller treats the
    /// request exactly like an eviction decision of its own.
    ///
    /// Fire-and-forget: if the shard is already shutting down the
    /// request is moot and silently dropped.
    pub fn passivate(&self, stop_message: Vec<u8>) {
        let _ = self.commands.send(ShardCommand::Passivate {
            entity_id: self.entity_id.clone(),
            stop_message,
        });
    }
}

/// Defines an entity type: a factory for per-id workers.
///
/// One implementation serves a whole shard; `spawn` is called the first
/// time a message is routed to an id, and again after a passivated id
/// receives new traffic.
#[async_trait]
pub trait Entity: Send + Sync + 'static {
    /// Create a handler for the given entity id. The handler lives until
    /// the entity is passivated or the shard shuts down.
    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, PassivationError>;
}

/// Handles the messages of one entity instance.
///
/// The worker is single-threaded: messages arrive one at a time, in the
/// order the shard controller observed them.
#[async_trait]
pub trait EntityHandler: Send {
    /// Handle one application payload.
    async fn handle_message(&mut self, payload: Vec<u8>) -> Result<(), PassivationError>;

    /// Called with the stop message once the mailbox is drained, just
    /// before the worker exits. Not called on force-termination.
    async fn on_stop(&mut self, _stop_message: Vec<u8>) {}
}
