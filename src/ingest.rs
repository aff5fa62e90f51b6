//! GPS fix ingestion

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::FencewatchError,
    geofence::Geofence,
    models::{GpsFix, Violation},
    store::{bounded, ViolationStore},
};

/// What happened to one inbound fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Inside the geofence, nothing to do
    Inside,
    /// Outside, but nobody owns the vehicle; dropped
    NoOwner,
    /// Outside; a new violation was stored
    Recorded(Uuid),
}

/// What to tell the broker once a message has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with, either handled or given up on
    Ack,
    /// Left unacknowledged for the broker to redeliver on the next session
    Redeliver,
}

impl Disposition {
    /// Only a transient failure cut short by shutdown is left for redelivery.
    ///
    /// An unacknowledged message holds a slot of the broker's in-flight
    /// window until the next session.
    pub fn of(result: &Result<IngestOutcome, FencewatchError>, shutting_down: bool) -> Self {
        match result {
            Err(e) if e.is_retryable() && shutting_down => Self::Redeliver,
            _ => Self::Ack,
        }
    }
}

/// Retry schedule for transient ingestion failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry`, starting from 1
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Handles one GPS fix per invocation
///
/// Holds no per-message state, so any number of invocations may run at once.
pub struct IngestionConsumer {
    geofence: Arc<dyn Geofence>,
    store: Arc<dyn ViolationStore>,
    operation_timeout: Duration,
    retry: RetryPolicy,
}

impl IngestionConsumer {
    pub fn new(
        geofence: Arc<dyn Geofence>,
        store: Arc<dyn ViolationStore>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            geofence,
            store,
            operation_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// [`handle`](Self::handle), retrying transient failures with backoff.
    ///
    /// Returns the last error once the attempts run out, or as soon as
    /// `cancel` fires while waiting for the next attempt.
    pub async fn handle_with_retry(
        &self,
        fix: &GpsFix,
        cancel: &CancellationToken,
    ) -> Result<IngestOutcome, FencewatchError> {
        let mut attempt = 1;
        loop {
            match self.handle(fix).await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        vehicle_id = %fix.vehicle_id,
                        attempt,
                        ?delay,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Evaluate a fix and record a violation if it is outside the geofence.
    ///
    /// Errors for which [`FencewatchError::is_retryable`] holds should cause
    /// the message to be redelivered; the rest should be dropped.
    pub async fn handle(&self, fix: &GpsFix) -> Result<IngestOutcome, FencewatchError> {
        fix.validate()?;

        if self.geofence.is_inside(fix.longitude, fix.latitude) {
            debug!(vehicle_id = %fix.vehicle_id, "Fix inside geofence");
            return Ok(IngestOutcome::Inside);
        }

        let owner = bounded(
            "find_owner",
            self.operation_timeout,
            self.store.find_owner(&fix.vehicle_id),
        )
        .await?;

        let Some(owner) = owner else {
            warn!(
                vehicle_id = %fix.vehicle_id,
                lat = fix.latitude,
                lon = fix.longitude,
                "Fix outside geofence but vehicle has no owner, dropping"
            );
            return Ok(IngestOutcome::NoOwner);
        };

        let violation = Violation::open(fix, &owner, Utc::now());
        bounded(
            "create_violation",
            self.operation_timeout,
            self.store.create_violation(&violation),
        )
        .await?;

        info!(
            violation_id = %violation.violation_id,
            vehicle_id = %violation.vehicle_id,
            lat = violation.latitude,
            lon = violation.longitude,
            "Recorded geofence violation"
        );
        Ok(IngestOutcome::Recorded(violation.violation_id))
    }
}

/// Running totals over all handled fixes
#[derive(Debug, Default)]
pub struct IngestStats {
    inside: AtomicU64,
    recorded: AtomicU64,
    no_owner: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub inside: u64,
    pub recorded: u64,
    pub no_owner: u64,
    /// Invalid input, dropped
    pub rejected: u64,
    /// Transient failures that outlasted every retry
    pub failed: u64,
}

impl IngestSummary {
    pub fn processed(&self) -> u64 {
        self.inside + self.recorded + self.no_owner + self.rejected + self.failed
    }
}

impl IngestStats {
    pub fn record(&self, result: &Result<IngestOutcome, FencewatchError>) {
        let counter = match result {
            Ok(IngestOutcome::Inside) => &self.inside,
            Ok(IngestOutcome::Recorded(_)) => &self.recorded,
            Ok(IngestOutcome::NoOwner) => &self.no_owner,
            Err(e) if e.is_retryable() => &self.failed,
            Err(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> IngestSummary {
        IngestSummary {
            inside: self.inside.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            no_owner: self.no_owner.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
