//! Geofence violation monitor

use std::sync::Arc;

use fencewatch::{
    config::AppConfig,
    database::Database,
    errors::FencewatchError,
    geofence::Geofence,
    ingest::{Disposition, IngestStats, IngestionConsumer},
    mqtt::{MqttClient, MqttClientBuilder},
    notifier::{Notifier, SmtpNotifier},
    purge::PurgeSweeper,
    scanner::NotificationScanner,
    schedule::{Schedule, Scheduler},
    store::ViolationStore,
};
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), FencewatchError> {
    #[cfg(feature = "dotenv")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Missing or invalid configuration is fatal
    let config = AppConfig::load().inspect_err(|e| error!("Failed to load configuration: {}", e))?;
    config.validate()?;

    let database = Database::connect(&config.database).await?;
    let store: Arc<dyn ViolationStore> = Arc::new(database.clone());
    let notifier: Arc<dyn Notifier> = Arc::new(SmtpNotifier::new(&config.smtp)?);
    let geofence: Arc<dyn Geofence> = Arc::new(config.geofence.clone());
    let timeout = config.pipeline.operation_timeout;

    let consumer = Arc::new(
        IngestionConsumer::new(geofence, store.clone(), timeout)
            .with_retry(config.pipeline.retry_policy()),
    );
    let scanner = Arc::new(NotificationScanner::new(
        store.clone(),
        notifier,
        config.scanner.batch_size,
        timeout,
    ));
    let sweeper = Arc::new(PurgeSweeper::new(store, config.purge.retention, timeout));

    let mqtt_client = match MqttClientBuilder::new(&config.mqtt) {
        Ok(builder) => builder.connect(&config.mqtt.topics).await,
        Err(e) => Err(e),
    };
    let mqtt_client = match mqtt_client {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to set up MQTT client: {}", e);
            database.close().await;
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let scheduler = Scheduler::new(cancel.clone());
    scheduler.spawn(
        "notification_scanner",
        Schedule::Every(config.scanner.interval),
        move |cancel| {
            let scanner = scanner.clone();
            async move { scanner.run_once(&cancel).await.map(|_| ()) }
        },
    );
    scheduler.spawn(
        "purge_sweeper",
        Schedule::DailyAt(config.purge.at),
        move |_| {
            let sweeper = sweeper.clone();
            async move { sweeper.run_once().await.map(|_| ()) }
        },
    );

    run_ingestion(mqtt_client, consumer, config.pipeline.workers, cancel.clone()).await;

    // Ingestion may also end because the broker connection went away
    cancel.cancel();
    info!("Waiting for scheduled runs to finish");
    scheduler.shutdown().await;
    database.close().await;

    info!("Shutdown complete");
    Ok(())
}

/// Hand inbound fixes to a bounded pool of workers until shutdown.
///
/// A message is acknowledged once handled, or once it is known that
/// retrying cannot help. Transient failures stay unacknowledged.
async fn run_ingestion(
    mut mqtt_client: MqttClient,
    consumer: Arc<IngestionConsumer>,
    workers: usize,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(workers));
    let tracker = TaskTracker::new();
    let stats = Arc::new(IngestStats::default());
    let acker = mqtt_client.acker();

    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = mqtt_client.recv() => match delivery {
                Some(delivery) => delivery,
                None => {
                    warn!("MQTT channel closed");
                    break;
                }
            },
        };

        let consumer = consumer.clone();
        let stats = stats.clone();
        let acker = acker.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let _permit = permit;
            let (fix, receipt) = delivery.into_parts();
            let result = match fix {
                Ok(fix) => consumer.handle_with_retry(&fix, &cancel).await,
                Err(e) => Err(e),
            };
            stats.record(&result);

            let disposition = Disposition::of(&result, cancel.is_cancelled());
            match (&result, disposition) {
                (Err(e), Disposition::Redeliver) => {
                    warn!(topic = receipt.topic(), error = %e, "Shutting down, leaving fix for redelivery");
                    return;
                }
                (Err(e), Disposition::Ack) if e.is_retryable() => {
                    error!(topic = receipt.topic(), error = %e, "Giving up on fix after retries");
                }
                (Err(e), Disposition::Ack) => {
                    warn!(topic = receipt.topic(), error = %e, "Dropping invalid fix");
                }
                (Ok(outcome), _) => debug!(?outcome, "Fix processed"),
            }

            if let Err(e) = acker.ack(&receipt).await {
                error!(topic = receipt.topic(), error = %e, "Failed to acknowledge message");
            }
        });
    }

    info!("Ingestion stopped, draining in-flight messages");
    tracker.close();
    tracker.wait().await;

    let summary = stats.summary();
    info!(
        processed = summary.processed(),
        recorded = summary.recorded,
        inside = summary.inside,
        no_owner = summary.no_owner,
        rejected = summary.rejected,
        failed = summary.failed,
        "Ingestion summary"
    );

    mqtt_client.disconnect().await;
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error setting up signal handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to set up SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
    token.cancel();
}
