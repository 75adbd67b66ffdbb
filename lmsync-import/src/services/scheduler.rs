//! Fixed-interval import scheduling
//!
//! A rejected or failed run does not stop the loop. Cancelling `shutdown`
//! stops the in-flight run after its current item and then ends the loop.

use lmsync_common::events::RunState;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::services::run_controller::{RunController, RunError};

/// Start a run every `every` until `shutdown` fires
///
/// Returns the number of runs that were started (rejected runs excluded).
pub async fn run_on_schedule(
    controller: &RunController,
    every: Duration,
    shutdown: CancellationToken,
) -> usize {
    tracing::info!("Scheduling import runs every {:?}", every);
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut started = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(runs = started, "Shutdown requested, scheduler stopping");
                return started;
            }
            _ = interval.tick() => {
                match controller.run_with_cancel(shutdown.child_token()).await {
                    Ok(report) => {
                        started += 1;
                        if report.state != RunState::Completed {
                            tracing::warn!(
                                run_id = %report.run_id,
                                state = %report.state,
                                error = report.fatal_error.as_deref().unwrap_or(""),
                                "Scheduled run did not complete"
                            );
                        }
                    }
                    Err(RunError::RunInProgress) => {
                        tracing::info!("Scheduled run skipped: another run is in progress");
                    }
                    Err(e) => tracing::error!("Scheduled run rejected: {}", e),
                }
            }
        }
    }
}
