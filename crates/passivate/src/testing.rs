//! In-memory test fixture for the passivation engine.
//!
//! Provides a single-node manager plus a recording entity whose workers
//! report every delivery and stop on a channel, so tests can assert the
//! exact order of what workers observed.

use crate::config::PassivationConfig;
use crate::entity::{Entity, EntityContext, EntityHandler};
use crate::error::PassivationError;
use crate::manager::PassivationManager;
use crate::shard::{ShardController, ShardHandle};
use crate::types::{EntityId, ShardId};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What a recording worker observed, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Delivered {
        shard_id: ShardId,
        entity_id: EntityId,
        payload: Vec<u8>,
    },
    Stopped {
        shard_id: ShardId,
        entity_id: EntityId,
        stop_message: Vec<u8>,
    },
}

pub type ObservationReceiver = mpsc::UnboundedReceiver<Observation>;

/// Entity whose workers report deliveries and stops to a channel.
///
/// When a `passivate_on` marker is configured, a worker receiving that
/// payload requests its own passivation with the configured stop
/// message, exercising the self-request path.
pub struct RecordingEntity {
    events: mpsc::UnboundedSender<Observation>,
    passivate_on: Option<Vec<u8>>,
    stop_message: Vec<u8>,
    spawns: AtomicUsize,
}

impl RecordingEntity {
    pub fn new() -> (Arc<Self>, ObservationReceiver) {
        Self::build(None, Vec::new())
    }

    /// A recording entity that self-passivates on `marker`.
    pub fn with_passivate_marker(
        marker: Vec<u8>,
        stop_message: Vec<u8>,
    ) -> (Arc<Self>, ObservationReceiver) {
        Self::build(Some(marker), stop_message)
    }

    fn build(
        passivate_on: Option<Vec<u8>>,
        stop_message: Vec<u8>,
    ) -> (Arc<Self>, ObservationReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                passivate_on,
                stop_message,
                spawns: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// How many workers this entity has spawned so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Entity for RecordingEntity {
    async fn spawn(&self, ctx: EntityContext) -> Result<Box<dyn EntityHandler>, PassivationError> {
        self.spawns.fetch_add(1, Ordering::Release);
        Ok(Box::new(RecordingHandler {
            ctx,
            events: self.events.clone(),
            passivate_on: self.passivate_on.clone(),
            stop_message: self.stop_message.clone(),
        }))
    }
}

struct RecordingHandler {
    ctx: EntityContext,
    events: mpsc::UnboundedSender<Observation>,
    passivate_on: Option<Vec<u8>>,
    stop_message: Vec<u8>,
}

#[async_trait]
impl EntityHandler for RecordingHandler {
    async fn handle_message(&mut self, payload: Vec<u8>) -> Result<(), PassivationError> {
        let _ = self.events.send(Observation::Delivered {
            shard_id: self.ctx.shard_id.clone(),
            entity_id: self.ctx.entity_id.clone(),
            payload: payload.clone(),
        });
        if self.passivate_on.as_deref() == Some(payload.as_slice()) {
            self.ctx.passivate(self.stop_message.clone());
        }
        Ok(())
    }

    async fn on_stop(&mut self, stop_message: Vec<u8>) {
        let _ = self.events.send(Observation::Stopped {
            shard_id: self.ctx.shard_id.clone(),
            entity_id: self.ctx.entity_id.clone(),
            stop_message,
        });
    }
}

/// A single-node engine: one manager, recording shards on demand.
pub struct TestFixture {
    pub manager: Arc<PassivationManager>,
    entity: Arc<RecordingEntity>,
}

impl TestFixture {
    /// Create a fixture with a plain recording entity.
    pub fn new(config: PassivationConfig) -> (Self, ObservationReceiver) {
        let (entity, rx) = RecordingEntity::new();
        (Self::with_entity(config, entity), rx)
    }

    /// Create a fixture around a specific recording entity.
    pub fn with_entity(config: PassivationConfig, entity: Arc<RecordingEntity>) -> Self {
        let manager = PassivationManager::new(config).expect("fixture config should be valid");
        Self { manager, entity }
    }

    /// Register a shard hosting the fixture's recording entity.
    pub fn add_shard(&self, shard: &str) -> ShardHandle {
        ShardController::spawn(
            ShardId::new(shard),
            Arc::clone(&self.entity) as Arc<dyn Entity>,
            &self.manager,
        )
        .expect("shard registration should succeed")
    }

    pub fn entity(&self) -> &Arc<RecordingEntity> {
        &self.entity
    }
}

/// Receive the next observation, failing loudly if none arrives.
/// Under a paused clock the timeout auto-advances, so a missing
/// observation fails fast instead of hanging.
pub async fn next_observation(rx: &mut ObservationReceiver) -> Observation {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for an observation")
        .expect("observation channel closed")
}

/// Drain observations that are already queued, without waiting.
pub fn drain_observations(rx: &mut ObservationReceiver) -> Vec<Observation> {
    let mut out = Vec::new();
    while let Ok(obs) = rx.try_recv() {
        out.push(obs);
    }
    out
}
