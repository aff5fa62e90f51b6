// src/database.rs
mod models;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    config::DatabaseConfig,
    errors::FencewatchError,
    models::{NotificationState, VehicleId, VehicleOwnership, Violation},
    store::{MarkSentOutcome, ViolationStore},
};
use self::models::{OwnershipRow, ViolationRow};

/// Postgres-backed violation store
///
/// Holds the one connection pool shared by every component. Cloning is cheap
/// and hands out the same pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the connection pool and bring the schema up to date
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, FencewatchError> {
        config.validate()?;

        info!(
            "Connecting to database: max_connections={}, acquire_timeout={:?}",
            config.max_connections, config.acquire_timeout
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                e
            })?;

        Self::new(pool).await
    }

    /// Wrap an existing pool, running pending migrations
    pub async fn new(pool: PgPool) -> Result<Self, FencewatchError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!("Database migrations applied");
        Ok(Self { pool })
    }

    /// Wait for checked-out connections to return, then close the pool
    pub async fn close(&self) {
        info!("Closing database pool");
        self.pool.close().await;
    }
}

#[async_trait]
impl ViolationStore for Database {
    async fn find_owner(
        &self,
        vehicle_id: &VehicleId,
    ) -> Result<Option<VehicleOwnership>, FencewatchError> {
        let row: Option<OwnershipRow> =
            sqlx::query_as("SELECT vehicle_id, email FROM vehicle_ownership WHERE vehicle_id = $1")
                .bind(vehicle_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        row.map(VehicleOwnership::try_from).transpose()
    }

    async fn create_violation(&self, violation: &Violation) -> Result<(), FencewatchError> {
        sqlx::query(
            "INSERT INTO violations (
                violation_id, vehicle_id, owner_email, latitude, longitude,
                event_timestamp, recorded_at, notification_state, notified_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(violation.violation_id)
        .bind(violation.vehicle_id.as_str())
        .bind(&violation.owner_email)
        .bind(violation.latitude)
        .bind(violation.longitude)
        .bind(violation.event_timestamp)
        .bind(violation.recorded_at)
        .bind(violation.notification_state.as_str())
        .bind(violation.notified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_unsent(&self, limit: usize) -> Result<Vec<Violation>, FencewatchError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<ViolationRow> = sqlx::query_as(
            "SELECT violation_id, vehicle_id, owner_email, latitude, longitude,
                    event_timestamp, recorded_at, notification_state, notified_at
             FROM violations
             WHERE notification_state = $1
             ORDER BY recorded_at, violation_id
             LIMIT $2",
        )
        .bind(NotificationState::Unsent.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Violation::try_from).collect()
    }

    async fn mark_sent(
        &self,
        violation_id: Uuid,
        notified_at: DateTime<Utc>,
    ) -> Result<MarkSentOutcome, FencewatchError> {
        // The state predicate makes this a compare-and-set on a single row
        let result = sqlx::query(
            "UPDATE violations
             SET notification_state = $1, notified_at = $2
             WHERE violation_id = $3 AND notification_state = $4",
        )
        .bind(NotificationState::Sent.as_str())
        .bind(notified_at)
        .bind(violation_id)
        .bind(NotificationState::Unsent.as_str())
        .execute(&self.pool)
        .await?;

        let affected = result.rows_affected();
        Ok(MarkSentOutcome {
            matched: affected,
            modified: affected,
        })
    }

    async fn delete_sent(&self, cutoff: DateTime<Utc>) -> Result<u64, FencewatchError> {
        let result = sqlx::query(
            "DELETE FROM violations WHERE notification_state = $1 AND notified_at <= $2",
        )
        .bind(NotificationState::Sent.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_sent(&self) -> Result<u64, FencewatchError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM violations WHERE notification_state = $1")
                .bind(NotificationState::Sent.as_str())
                .fetch_one(&self.pool)
                .await?;

        Ok(count as u64)
    }
}
