//! Reconciliation sweeper.
//!
//! In-memory timers die with the process; durable records do not. On a
//! fixed interval the sweeper re-drives the retry path for failed or
//! unconfirmed sends whose timers were lost, which is what makes restarts
//! safe. The store, not the timer map, is the source of truth for what
//! still needs retrying.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use super::DeliveryOrchestrator;
use crate::store::now_millis;

/// Run the sweep loop until `shutdown` flips to `true`.
///
/// Spawn this next to the orchestrator:
/// `tokio::spawn(run_sweeper(orchestrator.clone(), shutdown_rx))`.
pub async fn run_sweeper(
    orchestrator: Arc<DeliveryOrchestrator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = orchestrator.config().sweep_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        sweep_once(&orchestrator).await;
    }
    debug!("sweeper stopped");
}

/// One sweep cycle. Returns the number of records re-driven. Errors are
/// logged, never propagated: a faulty record must not abort the sweep.
pub async fn sweep_once(orchestrator: &DeliveryOrchestrator) -> usize {
    let config = orchestrator.config();
    let now = now_millis();
    let updated_before = now - config.retry_delay_ms as i64;
    let created_after = now - config.sweep_lookback_ms as i64;

    let candidates = match orchestrator
        .store
        .find_retryable(config.max_retries, updated_before, created_after)
        .await
    {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!(error = %e, "sweep query failed");
            return 0;
        }
    };

    let mut swept = 0;
    for record in candidates {
        if orchestrator.retry_armed(&record.lead_id) {
            // A live timer already owns this retry.
            continue;
        }
        debug!(
            lead_id = %record.lead_id,
            status = %record.status,
            retry_count = record.retry_count,
            "re-driving retry lost to restart"
        );
        orchestrator.on_retry_due(&record.lead_id).await;
        swept += 1;
    }
    if swept > 0 {
        debug!(swept, "sweep cycle complete");
    }
    swept
}
