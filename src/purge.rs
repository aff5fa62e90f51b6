//! Purge sweeper for notified violations

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    errors::FencewatchError,
    store::{bounded, ViolationStore},
};

/// Counts from one sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub sent_before: u64,
    pub deleted: u64,
    pub sent_after: u64,
    pub elapsed: Duration,
}

pub struct PurgeSweeper {
    store: Arc<dyn ViolationStore>,
    retention: Duration,
    operation_timeout: Duration,
}

impl PurgeSweeper {
    pub fn new(store: Arc<dyn ViolationStore>, retention: Duration, operation_timeout: Duration) -> Self {
        Self {
            store,
            retention,
            operation_timeout,
        }
    }

    /// Latest notification time still eligible for deletion at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Delete sent violations past retention. Unsent ones are never touched.
    ///
    /// A failed sweep can simply be run again.
    pub async fn run_once(&self) -> Result<PurgeReport, FencewatchError> {
        let started = Instant::now();
        let cutoff = self.cutoff(Utc::now());

        let sent_before = bounded("count_sent", self.operation_timeout, self.store.count_sent()).await?;
        let deleted = bounded(
            "delete_sent",
            self.operation_timeout,
            self.store.delete_sent(cutoff),
        )
        .await?;
        let sent_after = bounded("count_sent", self.operation_timeout, self.store.count_sent()).await?;

        let report = PurgeReport {
            sent_before,
            deleted,
            sent_after,
            elapsed: started.elapsed(),
        };
        info!(
            sent_before,
            deleted,
            sent_after,
            cutoff = %cutoff,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Purge sweep finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GpsFix, VehicleId, VehicleOwnership, Violation};
    use crate::store::InMemoryStore;

    async fn seed(store: &InMemoryStore, sent: usize, unsent: usize, notified_at: DateTime<Utc>) {
        let owner = VehicleOwnership {
            vehicle_id: VehicleId::try_from("V1").unwrap(),
            email: "a@x.com".to_string(),
        };
        for i in 0..(sent + unsent) {
            let fix = GpsFix {
                timestamp: Utc::now(),
                vehicle_id: owner.vehicle_id.clone(),
                latitude: 50.0,
                longitude: 50.0,
            };
            let v = Violation::open(&fix, &owner, Utc::now());
            store.create_violation(&v).await.unwrap();
            if i < sent {
                store.mark_sent(v.violation_id, notified_at).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_sent() -> Result<(), FencewatchError> {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 5, 2, Utc::now()).await;

        let sweeper = PurgeSweeper::new(store.clone(), Duration::ZERO, Duration::from_secs(1));
        let report = sweeper.run_once().await?;

        assert_eq!(report.sent_before, 5);
        assert_eq!(report.deleted, 5);
        assert_eq!(report.sent_after, 0);
        let remaining = store.violations();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|v| !v.is_sent()));
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_keeps_recent_within_retention() -> Result<(), FencewatchError> {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 3, 0, Utc::now()).await;

        let sweeper = PurgeSweeper::new(
            store.clone(),
            Duration::from_secs(24 * 3600),
            Duration::from_secs(1),
        );
        let report = sweeper.run_once().await?;
        assert_eq!(report.deleted, 0);
        assert_eq!(report.sent_after, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_is_repeatable() -> Result<(), FencewatchError> {
        let store = Arc::new(InMemoryStore::new());
        seed(&store, 2, 1, Utc::now()).await;

        let sweeper = PurgeSweeper::new(store.clone(), Duration::ZERO, Duration::from_secs(1));
        assert_eq!(sweeper.run_once().await?.deleted, 2);
        let again = sweeper.run_once().await?;
        assert_eq!(again.deleted, 0);
        assert_eq!(again.sent_before, 0);
        assert_eq!(store.violations().len(), 1);
        Ok(())
    }

    #[test]
    fn test_cutoff() {
        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();

        let sweeper = PurgeSweeper::new(store.clone(), Duration::ZERO, Duration::from_secs(1));
        assert_eq!(sweeper.cutoff(now), now);

        let sweeper = PurgeSweeper::new(store, Duration::from_secs(3600), Duration::from_secs(1));
        assert_eq!(sweeper.cutoff(now), now - chrono::Duration::hours(1));
    }
}
