use crate::manager::PassivationManager;
use std::sync::Weak;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Background idle sweep loop.
///
/// One coarse timer per manager, rather than one timer per entity: the
/// tick scans every shard's idle tracker, which bounds timer load and
/// makes cancellation a single token. Runs until the token fires or the
/// manager is dropped.
pub(crate) async fn run_sweeper(
    manager: Weak<PassivationManager>,
    tick: Duration,
    cancel: CancellationToken,
) {
    debug!(tick_ms = tick.as_millis() as u64, "idle sweeper started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {
                let Some(manager) = manager.upgrade() else { break };
                manager.scheduled_sweep(Instant::now());
            }
        }
    }
    debug!("idle sweeper stopped");
}
