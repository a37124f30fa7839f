use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::errors::AppResult;
use crate::pipeline::{FetchPipeline, FetchTrigger};
use crate::settings::{Settings, SettingsStore};

const RETRY_AFTER_ERROR: StdDuration = StdDuration::from_secs(60);

/// Shared view of the background fetch loop. Cheap to clone; the admin
/// surface reads `next_run` and calls `reschedule` after settings change.
#[derive(Clone, Default)]
pub struct ScheduleHandle {
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
    last_attempt: Arc<Mutex<Option<DateTime<Utc>>>>,
    wake: Arc<Notify>,
}

impl ScheduleHandle {
    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        *self.next_run.lock()
    }

    /// Forgets the last scheduled attempt and makes the loop recompute its
    /// due time, so fresh credentials are picked up without waiting a cycle.
    pub fn reschedule(&self) {
        self.last_attempt.lock().take();
        self.wake.notify_one();
    }

    fn last_attempt(&self) -> Option<DateTime<Utc>> {
        *self.last_attempt.lock()
    }
}

/// Due time for the next scheduled fetch: the later of the last successful
/// fetch and the last scheduled attempt, plus the configured frequency.
/// With neither on record the fetch is due immediately.
pub fn next_run_after(
    settings: &Settings,
    last_attempt: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let anchor = match (settings.last_fetch_at(), last_attempt) {
        (Some(fetch), Some(attempt)) => Some(fetch.max(attempt)),
        (fetch, attempt) => fetch.or(attempt),
    };
    match anchor {
        Some(anchor) => anchor + Duration::days(settings.update_frequency_days as i64),
        None => now,
    }
}

pub fn spawn(
    pipeline: FetchPipeline,
    settings: SettingsStore,
    handle: ScheduleHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(target: "scheduler", "review fetch scheduler started");
        loop {
            let wait = match plan(&settings, &handle) {
                Ok(wait) => wait,
                Err(err) => {
                    warn!(target: "scheduler", error = %err, "could not compute next run");
                    RETRY_AFTER_ERROR
                }
            };

            tokio::select! {
                _ = sleep(wait) => {}
                _ = handle.wake.notified() => {
                    debug!(target: "scheduler", "woken to recompute schedule");
                    continue;
                }
            }

            *handle.last_attempt.lock() = Some(Utc::now());
            match pipeline.run(FetchTrigger::Scheduled).await {
                Ok(summary) => {
                    debug!(target: "scheduler", added = summary.added, "scheduled fetch finished")
                }
                Err(err) => {
                    warn!(target: "scheduler", kind = err.kind(), error = %err, "scheduled fetch failed")
                }
            }
        }
    })
}

fn plan(settings: &SettingsStore, handle: &ScheduleHandle) -> AppResult<StdDuration> {
    let now = Utc::now();
    let due = next_run_after(&settings.load()?, handle.last_attempt(), now);
    *handle.next_run.lock() = Some(due);
    Ok((due - now).to_std().unwrap_or(StdDuration::ZERO))
}
