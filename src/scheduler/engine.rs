use crate::scheduler::{Dispatch, Scheduler};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Main scheduler execution loop.
/// Ticks at the scheduler's granularity, pops due jobs and hands each to the
/// coordinator. Batches run on their own tasks; this loop never awaits one.
pub async fn run_scheduler_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    info!(category = "SCHEDULER", tick = ?scheduler.tick_interval(), "Scheduler engine started");

    let mut interval = tokio::time::interval(scheduler.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        let due = scheduler.registry().pop_due(Utc::now()).await;
        for task_id in due {
            debug!(category = "SCHEDULER", task_id, "Task due");
            match scheduler.coordinator().on_due(task_id).await {
                Ok(Dispatch::Started(batch)) => {
                    // Detached; the batch logs its own outcome.
                    drop(batch);
                }
                Ok(Dispatch::AlreadyRunning) => {}
                Err(e) => {
                    error!(category = "SCHEDULER", task_id, error = %e, "Failed to dispatch scheduled task");
                }
            }
        }
    }

    info!(category = "SCHEDULER", "Scheduler engine stopped");
}
