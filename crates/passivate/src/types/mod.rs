mod entity_id;
mod shard_id;

pub use entity_id::EntityId;
pub use shard_id::ShardId;
