//! Persistence operations over violation and ownership records

mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::FencewatchError;
use crate::models::{VehicleId, VehicleOwnership, Violation};

pub use memory::InMemoryStore;

/// Result of a conditional `Unsent -> Sent` transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkSentOutcome {
    /// Records that matched the id and were still unsent
    pub matched: u64,
    /// Records actually changed
    pub modified: u64,
}

impl MarkSentOutcome {
    pub fn applied(&self) -> bool {
        self.modified > 0
    }
}

/// Typed access to the violation store
///
/// Implementations must make `mark_sent` a single atomic conditional update
/// and must never let `delete_sent` remove an unsent record.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Look up the owner registered for a vehicle
    async fn find_owner(
        &self,
        vehicle_id: &VehicleId,
    ) -> Result<Option<VehicleOwnership>, FencewatchError>;

    /// Persist a freshly opened violation
    async fn create_violation(&self, violation: &Violation) -> Result<(), FencewatchError>;

    /// Oldest unsent violations, at most `limit`
    async fn find_unsent(&self, limit: usize) -> Result<Vec<Violation>, FencewatchError>;

    /// Mark a violation sent, only if it is still unsent
    async fn mark_sent(
        &self,
        violation_id: Uuid,
        notified_at: DateTime<Utc>,
    ) -> Result<MarkSentOutcome, FencewatchError>;

    /// Delete sent violations notified at or before `cutoff`
    async fn delete_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, FencewatchError>;

    /// Number of sent violations currently stored
    async fn count_sent(&self) -> Result<u64, FencewatchError>;
}

/// Run a store or notifier call with an upper bound on its duration.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, FencewatchError>
where
    F: Future<Output = Result<T, FencewatchError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FencewatchError::Timeout { operation }),
    }
}
