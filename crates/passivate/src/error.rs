use crate::types::{EntityId, ShardId};

/// Errors that can occur in the passivation engine.
#[derive(Debug, thiserror::Error)]
pub enum PassivationError {
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("shard {shard_id} is not registered")]
    UnknownShard { shard_id: ShardId },

    #[error("shard {shard_id} is already registered")]
    ShardAlreadyRegistered { shard_id: ShardId },

    #[error("shard {shard_id} controller has stopped")]
    ShardStopped { shard_id: ShardId },

    #[error("entity id must be non-empty")]
    EmptyEntityId,

    #[error("entity {shard_id}/{entity_id} terminated while {state}")]
    InvalidTransition {
        shard_id: ShardId,
        entity_id: EntityId,
        state: &'static str,
    },

    #[error("failed to spawn worker for {shard_id}/{entity_id}: {reason}")]
    SpawnFailed {
        shard_id: ShardId,
        entity_id: EntityId,
        reason: String,
    },

    #[error("handler error: {reason}")]
    Handler {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = PassivationError::UnknownShard {
            shard_id: ShardId::new("s-1"),
        };
        assert_eq!(err.to_string(), "shard s-1 is not registered");

        let err = PassivationError::InvalidTransition {
            shard_id: ShardId::new("s-1"),
            entity_id: EntityId::new("e-1"),
            state: "active",
        };
        assert_eq!(err.to_string(), "entity s-1/e-1 terminated while active");

        let err = PassivationError::Handler {
            reason: "bad payload".into(),
            source: None,
        };
        assert_eq!(err.to_string(), "handler error: bad payload");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PassivationError>();
    }
}
