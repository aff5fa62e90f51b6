// src/database/models.rs
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::FencewatchError;
use crate::models::{VehicleId, VehicleOwnership, Violation};

#[derive(Debug, sqlx::FromRow)]
pub(super) struct OwnershipRow {
    vehicle_id: String,
    email: String,
}

impl TryFrom<OwnershipRow> for VehicleOwnership {
    type Error = FencewatchError;

    fn try_from(row: OwnershipRow) -> Result<Self, Self::Error> {
        Ok(VehicleOwnership {
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            email: row.email,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct ViolationRow {
    violation_id: Uuid,
    vehicle_id: String,
    owner_email: String,
    latitude: f64,
    longitude: f64,
    event_timestamp: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
    notification_state: String,
    notified_at: Option<DateTime<Utc>>,
}

impl TryFrom<ViolationRow> for Violation {
    type Error = FencewatchError;

    fn try_from(row: ViolationRow) -> Result<Self, Self::Error> {
        Ok(Violation {
            violation_id: row.violation_id,
            vehicle_id: VehicleId::try_from(row.vehicle_id)?,
            owner_email: row.owner_email,
            latitude: row.latitude,
            longitude: row.longitude,
            event_timestamp: row.event_timestamp,
            recorded_at: row.recorded_at,
            notification_state: row.notification_state.parse()?,
            notified_at: row.notified_at,
        })
    }
}
