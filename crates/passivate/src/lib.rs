//! Entity passivation engine for cluster sharding.
//!
//! A node hosts a set of *shards*, each routing messages to *entity*
//! workers identified by stable string keys. Active workers consume
//! memory, so long-lived processes passivate (gracefully stop) entities
//! that are no longer useful. This crate decides which entity to evict
//! and when, per shard, and runs the two-phase stop handshake that
//! retires a worker without losing messages.
//!
//! Three policies are available: `none`, `idle` (passivate after a
//! quiet period, driven by a coarse sweep timer), and
//! `least-recently-used` (a total active-entity budget divided across
//! the shards currently hosted on the node).
//!
//! ```no_run
//! use passivate::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # struct MyEntity;
//! # #[async_trait::async_trait]
//! # impl Entity for MyEntity {
//! #     async fn spawn(
//! #         &self,
//! #         _ctx: EntityContext,
//! #     ) -> Result<Box<dyn EntityHandler>, PassivationError> {
//! #         unimplemented!()
//! #     }
//! # }
//! # async fn demo() -> Result<(), PassivationError> {
//! let manager = PassivationManager::new(PassivationConfig {
//!     strategy: StrategyConfig::Idle {
//!         timeout: Duration::from_secs(120),
//!     },
//!     ..Default::default()
//! })?;
//!
//! let shard = ShardController::spawn(ShardId::new("orders-1"), Arc::new(MyEntity), &manager)?;
//! shard.send(EntityId::new("order-42"), b"charge".to_vec())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod idle;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod recency;
pub mod shard;
pub mod strategy;
pub mod testing;
pub mod types;

mod sweeper;
mod worker;

/// Prelude module for convenient glob imports.
pub mod prelude {
    pub use crate::config::{PassivationConfig, StrategyConfig};
    pub use crate::entity::{Entity, EntityContext, EntityHandler};
    pub use crate::error::PassivationError;
    pub use crate::manager::PassivationManager;
    pub use crate::message::CurrentShardState;
    pub use crate::shard::{ShardController, ShardHandle};
    pub use crate::strategy::PassivateIntent;
    pub use crate::types::{EntityId, ShardId};
}
