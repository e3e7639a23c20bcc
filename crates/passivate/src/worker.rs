use crate::entity::EntityHandler;
use crate::message::WorkerMessage;
use crate::types::{EntityId, ShardId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Mailbox loop for one entity worker.
///
/// Runs until a stop signal is observed or the mailbox closes. On a stop
/// signal the mailbox is closed and drained first, so messages accepted
/// before the passivation decision are still processed, then the handler
/// observes the stop message and the worker exits.
///
/// The whole loop races against `cancel`: force-termination after the
/// handoff deadline interrupts even a handler stuck mid-message.
pub(crate) async fn run_worker(
    shard_id: ShardId,
    entity_id: EntityId,
    handler: Box<dyn EntityHandler>,
    mailbox_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(shard_id = %shard_id, entity_id = %entity_id, "worker force-terminated");
        }
        _ = process_mailbox(&shard_id, &entity_id, handler, mailbox_rx) => {}
    }
}

async fn process_mailbox(
    shard_id: &ShardId,
    entity_id: &EntityId,
    mut handler: Box<dyn EntityHandler>,
    mut mailbox_rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(msg) = mailbox_rx.recv().await {
        match msg {
            WorkerMessage::Deliver(payload) => {
                handle(shard_id, entity_id, handler.as_mut(), payload).await;
            }
            WorkerMessage::Stop(stop_message) => {
                // Drain messages queued ahead of the stop signal.
                mailbox_rx.close();
                while let Some(msg) = mailbox_rx.recv().await {
                    match msg {
                        WorkerMessage::Deliver(payload) => {
                            handle(shard_id, entity_id, handler.as_mut(), payload).await;
                        }
                        WorkerMessage::Stop(_) => {
                            debug!(
                                shard_id = %shard_id,
                                entity_id = %entity_id,
                                "ignoring duplicate stop signal"
                            );
                        }
                    }
                }
                handler.on_stop(stop_message).await;
                return;
            }
        }
    }
}

async fn handle(
    shard_id: &ShardId,
    entity_id: &EntityId,
    handler: &mut dyn EntityHandler,
    payload: Vec<u8>,
) {
    if let Err(e) = handler.handle_message(payload).await {
        warn!(
            shard_id = %shard_id,
            entity_id = %entity_id,
            error = %e,
            "entity handler failed to process message"
        );
    }
}
