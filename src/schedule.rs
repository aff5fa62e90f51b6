//! Timers for the periodic jobs
//!
//! A tick never waits for the previous run, so slow runs overlap with the
//! next one. On shutdown the timers stop and in-flight runs are awaited.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::errors::FencewatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed period, first run immediately
    Every(Duration),
    /// Once a day at the given UTC time
    DailyAt(NaiveTime),
}

/// Next occurrence of `at` strictly after `now`
pub fn next_daily(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

pub struct Scheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Start triggering `job` on `schedule` until cancellation.
    ///
    /// The job receives the shutdown token so it can stop between units of
    /// work. Errors are logged; the next tick is the retry.
    pub fn spawn<F, Fut>(&self, name: &'static str, schedule: Schedule, job: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FencewatchError>> + Send + 'static,
    {
        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();
        let job = Arc::new(job);
        let running = Arc::new(AtomicUsize::new(0));

        let launch = move || {
            let job = job.clone();
            let cancel = cancel.clone();
            let running = running.clone();
            let overlapping = running.fetch_add(1, Ordering::SeqCst);
            if overlapping > 0 {
                warn!(job = name, overlapping, "Previous run still in progress");
            }
            tracker.spawn(async move {
                debug!(job = name, "Scheduled run starting");
                if let Err(e) = (*job)(cancel).await {
                    error!(job = name, error = %e, "Scheduled run failed");
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        };

        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            info!(job = name, ?schedule, "Schedule started");
            match schedule {
                Schedule::Every(period) => {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => launch(),
                        }
                    }
                }
                Schedule::DailyAt(at) => loop {
                    let now = Utc::now();
                    let delay = (next_daily(now, at) - now).to_std().unwrap_or(Duration::ZERO);
                    debug!(job = name, ?delay, "Waiting for next daily run");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => launch(),
                    }
                },
            }
            info!(job = name, "Schedule stopped");
        });
    }

    /// Wait for the timers to stop and every in-flight run to finish.
    ///
    /// Only returns once the cancellation token has fired.
    pub async fn shutdown(self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
