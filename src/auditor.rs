use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Background task that periodically reconciles every room in the engine's
/// hostel, repairing drift left behind by interrupted operations.
pub async fn run_auditor(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so startup isn't an audit.
    interval.tick().await;
    info!("auditor for {} running every {period:?}", engine.hostel());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match engine.reconcile().await {
            Ok(report) if report.is_clean() => {
                debug!("audit of {}: {} rooms clean", engine.hostel(), report.rooms_checked);
            }
            // Engine::reconcile already logged the details.
            Ok(_) => {}
            Err(e) => warn!("audit of {} failed: {e}", engine.hostel()),
        }
    }
    debug!("auditor for {} stopped", engine.hostel());
}
