use crate::error::PassivationError;
use std::time::Duration;
use tracing::warn;

/// Passivation policy selection.
///
/// Corresponds to the `passivation.strategy` setting together with its
/// strategy-specific parameters (`passivation.idle.timeout`,
/// `passivation.least-recently-used.limit`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyConfig {
    /// Entities are never passivated by the engine.
    None,
    /// Passivate entities that have received no messages for `timeout`.
    Idle { timeout: Duration },
    /// Keep at most `limit` active entities across all hosted shards,
    /// evicting least-recently-used entities per shard.
    LeastRecentlyUsed { limit: usize },
}

impl StrategyConfig {
    /// The setting value naming this variant.
    pub fn name(&self) -> &'static str {
        match self {
            StrategyConfig::None => "none",
            StrategyConfig::Idle { .. } => "idle",
            StrategyConfig::LeastRecentlyUsed { .. } => "least-recently-used",
        }
    }

    /// Resolve a strategy from its flat settings: the strategy name plus
    /// the parameter keys that accompany it. Parameters for strategies
    /// other than the named one are ignored.
    pub fn from_settings(
        name: &str,
        idle_timeout: Option<Duration>,
        lru_limit: Option<usize>,
    ) -> Result<Self, PassivationError> {
        match name {
            "none" => Ok(StrategyConfig::None),
            "idle" => {
                let timeout = idle_timeout.ok_or_else(|| PassivationError::InvalidConfig {
                    reason: "passivation.idle.timeout is required for the idle strategy"
                        .to_string(),
                })?;
                Ok(StrategyConfig::Idle { timeout })
            }
            "least-recently-used" => {
                let limit = lru_limit.ok_or_else(|| PassivationError::InvalidConfig {
                    reason: "passivation.least-recently-used.limit is required for the \
                             least-recently-used strategy"
                        .to_string(),
                })?;
                Ok(StrategyConfig::LeastRecentlyUsed { limit })
            }
            other => Err(PassivationError::InvalidConfig {
                reason: format!("unknown passivation strategy: {other}"),
            }),
        }
    }
}

/// Configuration for the passivation engine.
#[derive(Debug, Clone)]
pub struct PassivationConfig {
    /// Which entities to passivate, and when. Default: idle after 60s.
    pub strategy: StrategyConfig,
    /// Per-entity message buffer cap while the entity is passivating.
    /// Overflow drops the oldest buffered message. Default: 100.
    pub buffer_size: usize,
    /// How long to wait for a worker to terminate after the stop signal
    /// before force-terminating it. Default: 15s.
    pub hand_off_timeout: Duration,
    /// Whether an out-of-protocol worker termination aborts the shard
    /// controller (strict) or resynchronizes by treating the entity as
    /// stopped (lenient). Default: false (lenient).
    pub strict_transitions: bool,
    /// Floor for the idle sweep tick. The sweep runs every
    /// `timeout / 2`, but never more often than this. Default: 100ms.
    pub sweep_min_resolution: Duration,
    /// Deprecated "passivate idle entity after" setting. The explicit
    /// `strategy` is authoritative; when this is also set a warning is
    /// logged and the value is ignored.
    pub legacy_idle_after: Option<Duration>,
}

impl PassivationConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), PassivationError> {
        match &self.strategy {
            StrategyConfig::None => {}
            StrategyConfig::Idle { timeout } => {
                if timeout.is_zero() {
                    return Err(PassivationError::InvalidConfig {
                        reason: "passivation.idle.timeout must be > 0".to_string(),
                    });
                }
            }
            StrategyConfig::LeastRecentlyUsed { limit } => {
                if *limit == 0 {
                    return Err(PassivationError::InvalidConfig {
                        reason: "passivation.least-recently-used.limit must be >= 1".to_string(),
                    });
                }
            }
        }
        if self.buffer_size == 0 {
            return Err(PassivationError::InvalidConfig {
                reason: "tuning.bufferSize must be >= 1".to_string(),
            });
        }
        if self.hand_off_timeout.is_zero() {
            return Err(PassivationError::InvalidConfig {
                reason: "tuning.handOffTimeout must be > 0".to_string(),
            });
        }
        if self.sweep_min_resolution.is_zero() {
            return Err(PassivationError::InvalidConfig {
                reason: "sweep_min_resolution must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// The strategy the engine will actually run.
    ///
    /// The explicit strategy always wins over the deprecated idle-after
    /// setting; the clash is logged once here.
    pub fn effective_strategy(&self) -> StrategyConfig {
        if let Some(after) = self.legacy_idle_after {
            warn!(
                strategy = self.strategy.name(),
                legacy_idle_after_ms = after.as_millis() as u64,
                "deprecated passivate-idle-entity-after setting is ignored; \
                 the explicit passivation strategy is authoritative"
            );
        }
        self.strategy.clone()
    }
}

impl Default for PassivationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::Idle {
                timeout: Duration::from_secs(60),
            },
            buffer_size: 100,
            hand_off_timeout: Duration::from_secs(15),
            strict_transitions: false,
            sweep_min_resolution: Duration::from_millis(100),
            legacy_idle_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = PassivationConfig::default();
        assert_eq!(
            config.strategy,
            StrategyConfig::Idle {
                timeout: Duration::from_secs(60)
            }
        );
        assert_eq!(config.buffer_size, 100);
        assert_eq!(config.hand_off_timeout, Duration::from_secs(15));
        assert!(!config.strict_transitions);
        assert!(config.legacy_idle_after.is_none());
    }

    #[test]
    fn default_config_is_valid() {
        PassivationConfig::default().validate().unwrap();
    }

    #[test]
    fn strategy_from_settings() {
        let s = StrategyConfig::from_settings("none", None, None).unwrap();
        assert_eq!(s, StrategyConfig::None);

        let s =
            StrategyConfig::from_settings("idle", Some(Duration::from_secs(30)), None).unwrap();
        assert_eq!(
            s,
            StrategyConfig::Idle {
                timeout: Duration::from_secs(30)
            }
        );

        let s = StrategyConfig::from_settings("least-recently-used", None, Some(1000)).unwrap();
        assert_eq!(s, StrategyConfig::LeastRecentlyUsed { limit: 1000 });
    }

    #[test]
    fn unknown_strategy_name_rejected() {
        let err = StrategyConfig::from_settings("most-recently-used", None, None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown passivation strategy"), "got: {msg}");
    }

    #[test]
    fn idle_requires_timeout() {
        let err = StrategyConfig::from_settings("idle", None, None).unwrap_err();
        assert!(err.to_string().contains("idle.timeout"), "got: {err}");
    }

    #[test]
    fn lru_requires_limit() {
        let err = StrategyConfig::from_settings("least-recently-used", None, None).unwrap_err();
        assert!(err.to_string().contains("limit"), "got: {err}");
    }

    #[test]
    fn validate_zero_idle_timeout() {
        let config = PassivationConfig {
            strategy: StrategyConfig::Idle {
                timeout: Duration::ZERO,
            },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("idle.timeout"), "got: {err}");
    }

    #[test]
    fn validate_zero_lru_limit() {
        let config = PassivationConfig {
            strategy: StrategyConfig::LeastRecentlyUsed { limit: 0 },
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limit"), "got: {err}");
    }

    #[test]
    fn validate_zero_buffer_size() {
        let config = PassivationConfig {
            buffer_size: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bufferSize"), "got: {err}");
    }

    #[test]
    fn validate_zero_hand_off_timeout() {
        let config = PassivationConfig {
            hand_off_timeout: Duration::ZERO,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("handOffTimeout"), "got: {err}");
    }

    #[test]
    fn effective_strategy_prefers_explicit_over_legacy() {
        let config = PassivationConfig {
            strategy: StrategyConfig::None,
            legacy_idle_after: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        // Legacy setting is ignored; a warning is logged.
        assert_eq!(config.effective_strategy(), StrategyConfig::None);
    }

    #[test]
    fn strategy_names() {
        assert_eq!(StrategyConfig::None.name(), "none");
        assert_eq!(
            StrategyConfig::Idle {
                timeout: Duration::from_secs(1)
            }
            .name(),
            "idle"
        );
        assert_eq!(
            StrategyConfig::LeastRecentlyUsed { limit: 1 }.name(),
            "least-recently-used"
        );
    }
}
