//! Owner notifications

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::SmtpConfig,
    errors::FencewatchError,
    models::{VehicleId, Violation},
};

/// What the owner is told about one violation
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationNotice {
    pub violation_id: Uuid,
    pub to_email: String,
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub event_timestamp: DateTime<Utc>,
}

impl From<&Violation> for ViolationNotice {
    fn from(violation: &Violation) -> Self {
        Self {
            violation_id: violation.violation_id,
            to_email: violation.owner_email.clone(),
            vehicle_id: violation.vehicle_id.clone(),
            latitude: violation.latitude,
            longitude: violation.longitude,
            event_timestamp: violation.event_timestamp,
        }
    }
}

impl ViolationNotice {
    pub fn subject(&self) -> String {
        format!("Geofence violation: {}", self.vehicle_id)
    }

    pub fn body(&self) -> String {
        format!(
            "Your vehicle {} was detected outside its permitted area.\n\n\
             Position: {:.6}, {:.6} (lat, lon)\n\
             Time: {}\n\
             Reference: {}\n",
            self.vehicle_id,
            self.latitude,
            self.longitude,
            self.event_timestamp.to_rfc3339(),
            self.violation_id,
        )
    }
}

/// Identifier the notifier assigned to an accepted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notice to its owner
    async fn send(&self, notice: &ViolationNotice) -> Result<DeliveryId, FencewatchError>;
}

/// Email notifier over SMTP
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig) -> Result<Self, FencewatchError> {
        config.validate()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(&config.url)?
            .timeout(Some(config.timeout))
            .build();
        let from: Mailbox = config.from.parse()?;

        info!("Initialized SMTP notifier: from={}", from);

        Ok(Self { transport, from })
    }

    fn build_message(
        &self,
        notice: &ViolationNotice,
        message_id: &str,
    ) -> Result<Message, FencewatchError> {
        let to: Mailbox = notice.to_email.parse()?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(notice.subject())
            .message_id(Some(message_id.to_string()))
            .header(ContentType::TEXT_PLAIN)
            .body(notice.body())?;
        Ok(message)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, notice: &ViolationNotice) -> Result<DeliveryId, FencewatchError> {
        let message_id = format!("<{}@fencewatch>", Uuid::new_v4());
        let message = self.build_message(notice, &message_id)?;

        let response = self.transport.send(message).await?;
        if !response.is_positive() {
            return Err(FencewatchError::DeliveryRejected(format!(
                "{} {}",
                response.code(),
                response.message().collect::<Vec<_>>().join(" ")
            )));
        }

        debug!(
            violation_id = %notice.violation_id,
            message_id = %message_id,
            "Notification accepted by SMTP server"
        );
        Ok(DeliveryId(message_id))
    }
}
