//! Errors for the violation pipeline
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FencewatchError {
    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("Invalid vehicle id: {0:?}")]
    InvalidVehicleId(String),

    #[error("Invalid coordinates: lon={longitude}, lat={latitude}")]
    InvalidCoordinates { longitude: f64, latitude: f64 },

    #[error("Invalid notification state: {0}")]
    InvalidNotificationState(String),

    #[error("Database migration error")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Invalid email address: {0}")]
    InvalidAddress(#[from] lettre::address::AddressError),

    #[error("Email construction error")]
    EmailBuildError(#[from] lettre::error::Error),

    #[error("Email delivery failed")]
    DeliveryError(#[from] lettre::transport::smtp::Error),

    #[error("Delivery rejected: {0}")]
    DeliveryRejected(String),

    #[error("Operation timed out: {operation}")]
    Timeout { operation: &'static str },
}

impl FencewatchError {
    /// Whether redelivering the same work may succeed.
    ///
    /// Invalid input and configuration problems are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MqttClientError(_)
            | Self::DatabaseError(_)
            | Self::DeliveryError(_)
            | Self::DeliveryRejected(_)
            | Self::Timeout { .. } => true,
            Self::SerdeError(_)
            | Self::ConfigError(_)
            | Self::ConfigurationError { .. }
            | Self::InvalidVehicleId(_)
            | Self::InvalidCoordinates { .. }
            | Self::InvalidNotificationState(_)
            | Self::MigrationError(_)
            | Self::InvalidAddress(_)
            | Self::EmailBuildError(_) => false,
        }
    }
}
