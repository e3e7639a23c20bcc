use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for the passivation engine.
#[derive(Debug)]
pub struct PassivationMetrics {
    /// Number of active entity instances across all shards.
    pub active_entities: IntGauge,
    /// Total number of passivation handshakes started.
    pub passivations: IntCounter,
    /// Total number of workers force-terminated after the handoff deadline.
    pub handoff_timeouts: IntCounter,
    /// Total number of buffered messages dropped on overflow.
    pub buffer_dropped: IntCounter,
}

impl PassivationMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let active_entities = IntGauge::with_opts(Opts::new(
            "passivation_active_entities",
            "Number of active entity instances across all shards",
        ))?;
        let passivations = IntCounter::with_opts(Opts::new(
            "passivation_handshakes_total",
            "Total number of passivation handshakes started",
        ))?;
        let handoff_timeouts = IntCounter::with_opts(Opts::new(
            "passivation_handoff_timeouts_total",
            "Total number of workers force-terminated after the handoff deadline",
        ))?;
        let buffer_dropped = IntCounter::with_opts(Opts::new(
            "passivation_buffer_dropped_total",
            "Total number of buffered messages dropped on overflow",
        ))?;

        registry.register(Box::new(active_entities.clone()))?;
        registry.register(Box::new(passivations.clone()))?;
        registry.register(Box::new(handoff_timeouts.clone()))?;
        registry.register(Box::new(buffer_dropped.clone()))?;

        Ok(Self {
            active_entities,
            passivations,
            handoff_timeouts,
            buffer_dropped,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            active_entities: IntGauge::new("passivation_active_entities", "active")
                .expect("valid metric name"),
            passivations: IntCounter::new("passivation_handshakes_total", "handshakes")
                .expect("valid metric name"),
            handoff_timeouts: IntCounter::new("passivation_handoff_timeouts_total", "timeouts")
                .expect("valid metric name"),
            buffer_dropped: IntCounter::new("passivation_buffer_dropped_total", "dropped")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = PassivationMetrics::unregistered();
        m.active_entities.set(5);
        assert_eq!(m.active_entities.get(), 5);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = PassivationMetrics::new(&r).unwrap();
        m.passivations.inc();
        assert_eq!(m.passivations.get(), 1);
        assert_eq!(r.gather().len(), 4);
    }
}
