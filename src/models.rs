//! Data models.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FencewatchError;

/// Vehicle identifier as assigned by the registration process
///
/// Any non-empty string without surrounding whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VehicleId(String);

impl TryFrom<String> for VehicleId {
    type Error = FencewatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(FencewatchError::InvalidVehicleId(value));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<&str> for VehicleId {
    type Error = FencewatchError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

impl From<VehicleId> for String {
    fn from(value: VehicleId) -> Self {
        value.0
    }
}

impl VehicleId {
    /// Get the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single GPS fix, as published on the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    /// Time the fix was taken, ISO-8601
    pub timestamp: DateTime<Utc>,
    pub vehicle_id: VehicleId,
    /// Latitude in WGS84 decimal degrees
    pub latitude: f64,
    /// Longitude in WGS84 decimal degrees
    pub longitude: f64,
}

impl GpsFix {
    /// Reject coordinates that cannot describe a point on earth.
    pub fn validate(&self) -> Result<(), FencewatchError> {
        let valid = self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);

        if valid {
            Ok(())
        } else {
            Err(FencewatchError::InvalidCoordinates {
                longitude: self.longitude,
                latitude: self.latitude,
            })
        }
    }
}

/// Owner contact registered for a vehicle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleOwnership {
    pub vehicle_id: VehicleId,
    pub email: String,
}

/// Notification lifecycle of a violation
///
/// Only ever moves from `Unsent` to `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationState {
    Unsent,
    Sent,
}

impl NotificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsent => "unsent",
            Self::Sent => "sent",
        }
    }
}

impl FromStr for NotificationState {
    type Err = FencewatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsent" => Ok(Self::Unsent),
            "sent" => Ok(Self::Sent),
            other => Err(FencewatchError::InvalidNotificationState(other.to_string())),
        }
    }
}

impl fmt::Display for NotificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected excursion outside the geofence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    /// Key for every update after creation
    pub violation_id: Uuid,
    pub vehicle_id: VehicleId,
    /// Copied from the ownership record when the violation was opened
    pub owner_email: String,
    pub latitude: f64,
    pub longitude: f64,
    pub event_timestamp: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub notification_state: NotificationState,
    pub notified_at: Option<DateTime<Utc>>,
}

impl Violation {
    /// Open a new, not yet notified violation for `fix`.
    pub fn open(fix: &GpsFix, owner: &VehicleOwnership, recorded_at: DateTime<Utc>) -> Self {
        Self {
            violation_id: Uuid::new_v4(),
            vehicle_id: fix.vehicle_id.clone(),
            owner_email: owner.email.clone(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            event_timestamp: fix.timestamp,
            recorded_at,
            notification_state: NotificationState::Unsent,
            notified_at: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.notification_state == NotificationState::Sent
    }
}
