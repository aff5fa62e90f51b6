//! Notification scanner
//!
//! Each run picks up unsent violations, notifies the owners and marks the
//! violations sent. Runs may overlap. Within one process a claim set keeps
//! two runs from notifying the same violation; across processes the
//! conditional `mark_sent` keeps the stored state consistent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use tracing::{error, info, warn};

use crate::{
    errors::FencewatchError,
    models::Violation,
    notifier::{DeliveryId, Notifier, ViolationNotice},
    store::{bounded, ViolationStore},
};

/// Result for a single violation within a run
#[derive(Debug)]
pub enum RecordOutcome {
    /// Notified and marked sent by this run
    Sent(DeliveryId),
    /// Notified, but another run had already marked it sent
    AlreadyMarked,
    /// Notification failed; still unsent
    SendFailed(FencewatchError),
    /// Notified but the state update failed; will be notified again next run
    MarkFailed(FencewatchError),
}

/// Aggregate result of one scanner run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Left for the next run because of shutdown
    pub skipped: usize,
    /// Left alone because a concurrent run is already handling them
    pub claimed: usize,
}

impl ScanReport {
    fn record(mut self, outcome: &RecordOutcome) -> Self {
        self.processed += 1;
        match outcome {
            RecordOutcome::Sent(_) => self.succeeded += 1,
            RecordOutcome::AlreadyMarked => self.conflicts += 1,
            RecordOutcome::SendFailed(_) | RecordOutcome::MarkFailed(_) => self.failed += 1,
        }
        self
    }
}

pub struct NotificationScanner {
    store: Arc<dyn ViolationStore>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
    operation_timeout: Duration,
    /// Violations a run of this scanner is currently handling
    claims: Mutex<HashSet<Uuid>>,
}

impl NotificationScanner {
    pub fn new(
        store: Arc<dyn ViolationStore>,
        notifier: Arc<dyn Notifier>,
        batch_size: usize,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            batch_size,
            operation_timeout,
            claims: Mutex::new(HashSet::new()),
        }
    }

    /// Notify owners of up to one page of unsent violations.
    ///
    /// Only a failure to read the page fails the run. Once `cancel` fires no
    /// further record is started; the record in flight is finished.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<ScanReport, FencewatchError> {
        let started = Instant::now();
        let (page, claimed) = self.claim_page().await?;

        let total = page.len();
        let mut outcomes = Vec::with_capacity(total);
        for violation in &page {
            if cancel.is_cancelled() {
                break;
            }
            outcomes.push(self.process(violation).await);
            self.release(&[violation.violation_id]).await;
        }

        let mut report = outcomes.iter().fold(ScanReport::default(), ScanReport::record);
        report.skipped = total - report.processed;
        report.claimed = claimed;
        let unprocessed: Vec<Uuid> = page[report.processed..]
            .iter()
            .map(|v| v.violation_id)
            .collect();
        self.release(&unprocessed).await;

        info!(
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed,
            conflicts = report.conflicts,
            skipped = report.skipped,
            claimed = report.claimed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Notification scan finished"
        );
        Ok(report)
    }

    /// Read a page of unsent violations and claim those no other run holds.
    ///
    /// The claim lock is held across the read, so a release (which follows
    /// `mark_sent`) can never slip between reading a stale page and claiming
    /// from it. Returns the claimed page and how many were already claimed.
    async fn claim_page(&self) -> Result<(Vec<Violation>, usize), FencewatchError> {
        let mut claims = self.claims.lock().await;
        let unsent = bounded(
            "find_unsent",
            self.operation_timeout,
            self.store.find_unsent(self.batch_size),
        )
        .await?;

        let total = unsent.len();
        let page: Vec<Violation> = unsent
            .into_iter()
            .filter(|v| claims.insert(v.violation_id))
            .collect();
        let claimed = total - page.len();
        Ok((page, claimed))
    }

    async fn release(&self, violation_ids: &[Uuid]) {
        if violation_ids.is_empty() {
            return;
        }
        let mut claims = self.claims.lock().await;
        for id in violation_ids {
            claims.remove(id);
        }
    }

    async fn process(&self, violation: &Violation) -> RecordOutcome {
        let notice = ViolationNotice::from(violation);

        let sent = bounded("send", self.operation_timeout, self.notifier.send(&notice)).await;
        let delivery = match sent {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!(
                    violation_id = %violation.violation_id,
                    vehicle_id = %violation.vehicle_id,
                    error = %e,
                    "Failed to notify owner"
                );
                return RecordOutcome::SendFailed(e);
            }
        };

        match bounded(
            "mark_sent",
            self.operation_timeout,
            self.store.mark_sent(violation.violation_id, Utc::now()),
        )
        .await
        {
            Ok(outcome) if outcome.applied() => RecordOutcome::Sent(delivery),
            Ok(_) => {
                info!(
                    violation_id = %violation.violation_id,
                    vehicle_id = %violation.vehicle_id,
                    "Violation already marked sent by another run"
                );
                RecordOutcome::AlreadyMarked
            }
            Err(e) => {
                error!(
                    violation_id = %violation.violation_id,
                    vehicle_id = %violation.vehicle_id,
                    delivery_id = %delivery,
                    error = %e,
                    "Owner notified but violation not marked sent"
                );
                RecordOutcome::MarkFailed(e)
            }
        }
    }
}
