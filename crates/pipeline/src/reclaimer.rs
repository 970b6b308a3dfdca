//! Periodic reclamation of expired leases.
//!
//! Runs independently of any batch on a fixed `tokio::time::interval`.
//! Items whose holder crashed or stalled go back to the queue; items that
//! became terminal during the sweep are reported to the progress tracker.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::PipelineContext;
use crate::error::QueueError;
use crate::queue::ReclaimReport;

/// Default interval between sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep: reclaim expired leases and report terminal transitions.
pub async fn reclaim_once(ctx: &PipelineContext) -> Result<ReclaimReport, QueueError> {
    let report = ctx.queue.reclaim_expired_leases().await?;
    ctx.tracker.report_all(&report.terminal).await;
    Ok(report)
}

/// Run the reclamation loop until `cancel` is triggered.
pub async fn run(ctx: PipelineContext, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Lease reclaimer started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Lease reclaimer stopping");
                break;
            }
            _ = ticker.tick() => {
                match reclaim_once(&ctx).await {
                    Ok(report) if report.requeued > 0 || !report.terminal.is_empty() => {
                        tracing::info!(
                            requeued = report.requeued,
                            terminal = report.terminal.len(),
                            "Reclaimed expired leases",
                        );
                    }
                    Ok(_) => tracing::debug!("Lease reclaimer: nothing expired"),
                    Err(e) => tracing::error!(error = %e, "Lease reclamation failed"),
                }
            }
        }
    }
}
