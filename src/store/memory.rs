// src/store/memory.rs
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{MarkSentOutcome, ViolationStore};
use crate::errors::FencewatchError;
use crate::models::{NotificationState, VehicleId, VehicleOwnership, Violation};

#[derive(Debug, Default)]
struct Collections {
    owners: HashMap<VehicleId, VehicleOwnership>,
    violations: HashMap<Uuid, Violation>,
}

/// Process-local store, each operation atomic under one lock
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Collections>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the owner of a vehicle
    pub fn upsert_owner(&self, owner: VehicleOwnership) {
        self.lock()
            .owners
            .insert(owner.vehicle_id.clone(), owner);
    }

    /// Snapshot of every stored violation, oldest first
    pub fn violations(&self) -> Vec<Violation> {
        let mut all: Vec<Violation> = self.lock().violations.values().cloned().collect();
        all.sort_by_key(|v| (v.recorded_at, v.violation_id));
        all
    }

    pub fn get(&self, violation_id: Uuid) -> Option<Violation> {
        self.lock().violations.get(&violation_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Collections> {
        // Updates are applied in one step, so a poisoned lock is still consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ViolationStore for InMemoryStore {
    async fn find_owner(
        &self,
        vehicle_id: &VehicleId,
    ) -> Result<Option<VehicleOwnership>, FencewatchError> {
        Ok(self.lock().owners.get(vehicle_id).cloned())
    }

    async fn create_violation(&self, violation: &Violation) -> Result<(), FencewatchError> {
        self.lock()
            .violations
            .insert(violation.violation_id, violation.clone());
        Ok(())
    }

    async fn find_unsent(&self, limit: usize) -> Result<Vec<Violation>, FencewatchError> {
        let mut unsent: Vec<Violation> = self
            .lock()
            .violations
            .values()
            .filter(|v| v.notification_state == NotificationState::Unsent)
            .cloned()
            .collect();
        unsent.sort_by_key(|v| (v.recorded_at, v.violation_id));
        unsent.truncate(limit);
        Ok(unsent)
    }

    async fn mark_sent(
        &self,
        violation_id: Uuid,
        notified_at: DateTime<Utc>,
    ) -> Result<MarkSentOutcome, FencewatchError> {
        let mut guard = self.lock();
        match guard.violations.get_mut(&violation_id) {
            Some(v) if v.notification_state == NotificationState::Unsent => {
                v.notification_state = NotificationState::Sent;
                v.notified_at = Some(notified_at);
                Ok(MarkSentOutcome {
                    matched: 1,
                    modified: 1,
                })
            }
            _ => Ok(MarkSentOutcome::default()),
        }
    }

    async fn delete_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, FencewatchError> {
        let mut guard = self.lock();
        let before = guard.violations.len();
        guard.violations.retain(|_, v| {
            !(v.notification_state == NotificationState::Sent
                && v.notified_at.is_some_and(|at| at <= cutoff))
        });
        Ok((before - guard.violations.len()) as u64)
    }

    async fn count_sent(&self) -> Result<u64, FencewatchError> {
        Ok(self
            .lock()
            .violations
            .values()
            .filter(|v| v.is_sent())
            .count() as u64)
    }
}
