use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use fencewatch::{
    errors::FencewatchError,
    geofence::{Boundary, CircleGeofence},
    ingest::{IngestOutcome, IngestionConsumer},
    models::{GpsFix, NotificationState, VehicleId, VehicleOwnership},
    notifier::{DeliveryId, Notifier, ViolationNotice},
    purge::PurgeSweeper,
    scanner::NotificationScanner,
    store::{InMemoryStore, ViolationStore},
};

const TIMEOUT: Duration = Duration::from_secs(1);

/// Records every notice; fails for listed vehicles
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<ViolationNotice>>,
    failing: Vec<String>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notice: &ViolationNotice) -> Result<DeliveryId, FencewatchError> {
        // Real deliveries suspend, letting overlapping runs interleave
        tokio::task::yield_now().await;
        if self.failing.iter().any(|v| v == notice.vehicle_id.as_str()) {
            return Err(FencewatchError::DeliveryRejected("451 try later".to_string()));
        }
        self.sent.lock().unwrap().push(notice.clone());
        Ok(DeliveryId(format!("<{}@test>", notice.violation_id)))
    }
}

/// Notifier that never answers
struct StalledNotifier;

#[async_trait]
impl Notifier for StalledNotifier {
    async fn send(&self, _notice: &ViolationNotice) -> Result<DeliveryId, FencewatchError> {
        std::future::pending().await
    }
}

fn boundary() -> Arc<Boundary> {
    // Roughly greater Helsinki
    Arc::new(Boundary::Circle(CircleGeofence {
        center_lon: 24.945831,
        center_lat: 60.192059,
        radius_m: 25_000.0,
    }))
}

fn fix(vehicle: &str, lat: f64, lon: f64) -> GpsFix {
    GpsFix {
        timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        vehicle_id: VehicleId::try_from(vehicle).unwrap(),
        latitude: lat,
        longitude: lon,
    }
}

fn store_with_owner(vehicle: &str, email: &str) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.upsert_owner(VehicleOwnership {
        vehicle_id: VehicleId::try_from(vehicle).unwrap(),
        email: email.to_string(),
    });
    store
}

#[tokio::test]
async fn outside_fix_with_owner_creates_unsent_violation() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);

    let outcome = consumer.handle(&fix("V1", 50.0, 50.0)).await?;
    assert!(matches!(outcome, IngestOutcome::Recorded(_)));

    let violations = store.violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].owner_email, "a@x.com");
    assert_eq!(violations[0].vehicle_id.as_str(), "V1");
    assert_eq!(violations[0].notification_state, NotificationState::Unsent);
    Ok(())
}

#[tokio::test]
async fn inside_fixes_never_create_violations() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);

    for (lat, lon) in [(60.192059, 24.945831), (60.17, 24.94), (60.25, 25.05)] {
        assert_eq!(consumer.handle(&fix("V1", lat, lon)).await?, IngestOutcome::Inside);
    }
    assert!(store.violations().is_empty());
    Ok(())
}

#[tokio::test]
async fn outside_fix_without_owner_is_dropped_quietly() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);

    assert_eq!(
        consumer.handle(&fix("UNKNOWN", 50.0, 50.0)).await?,
        IngestOutcome::NoOwner
    );
    assert!(store.violations().is_empty());
    Ok(())
}

#[tokio::test]
async fn redelivered_fix_creates_a_second_violation() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    let event = fix("V1", 50.0, 50.0);

    let first = consumer.handle(&event).await?;
    let second = consumer.handle(&event).await?;
    assert_ne!(first, second);

    let violations = store.violations();
    assert_eq!(violations.len(), 2);
    assert!(violations.iter().all(|v| v.event_timestamp == event.timestamp));
    Ok(())
}

#[tokio::test]
async fn ownership_change_does_not_rewrite_open_violation() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    consumer.handle(&fix("V1", 50.0, 50.0)).await?;

    store.upsert_owner(VehicleOwnership {
        vehicle_id: VehicleId::try_from("V1")?,
        email: "b@x.com".to_string(),
    });

    let notifier = Arc::new(RecordingNotifier::default());
    let scanner = NotificationScanner::new(store.clone(), notifier.clone(), 10, TIMEOUT);
    scanner.run_once(&CancellationToken::new()).await?;

    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to_email, "a@x.com");
    Ok(())
}

#[tokio::test]
async fn scanner_isolates_failed_notification() -> Result<(), FencewatchError> {
    let store = Arc::new(InMemoryStore::new());
    for vehicle in ["V1", "V2", "V3"] {
        store.upsert_owner(VehicleOwnership {
            vehicle_id: VehicleId::try_from(vehicle)?,
            email: format!("{}@x.com", vehicle),
        });
    }
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    for vehicle in ["V1", "V2", "V3"] {
        consumer.handle(&fix(vehicle, 50.0, 50.0)).await?;
    }

    let notifier = Arc::new(RecordingNotifier {
        failing: vec!["V2".to_string()],
        ..Default::default()
    });
    let scanner = NotificationScanner::new(store.clone(), notifier.clone(), 10, TIMEOUT);

    let report = scanner.run_once(&CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);

    let sent = store.count_sent().await?;
    assert_eq!(sent, 2);
    let unsent = store.find_unsent(10).await?;
    assert_eq!(unsent.len(), 1);
    assert_eq!(unsent[0].vehicle_id.as_str(), "V2");

    // The failed record is picked up again on the next run
    let retry = NotificationScanner::new(
        store.clone(),
        Arc::new(RecordingNotifier::default()),
        10,
        TIMEOUT,
    );
    let report = retry.run_once(&CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 1);
    assert_eq!(store.count_sent().await?, 3);
    Ok(())
}

#[tokio::test]
async fn scanner_honours_batch_size() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    for _ in 0..5 {
        consumer.handle(&fix("V1", 50.0, 50.0)).await?;
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let scanner = NotificationScanner::new(store.clone(), notifier, 2, TIMEOUT);
    let report = scanner.run_once(&CancellationToken::new()).await?;
    assert_eq!(report.processed, 2);
    assert_eq!(store.find_unsent(10).await?.len(), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_notifier_times_out_as_failure() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    consumer.handle(&fix("V1", 50.0, 50.0)).await?;

    let scanner = NotificationScanner::new(store.clone(), Arc::new(StalledNotifier), 10, TIMEOUT);
    let report = scanner.run_once(&CancellationToken::new()).await?;
    assert_eq!(report.failed, 1);
    assert_eq!(store.find_unsent(10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn overlapping_scans_mark_each_violation_once() -> Result<(), FencewatchError> {
    let store = store_with_owner("V1", "a@x.com");
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    for _ in 0..4 {
        consumer.handle(&fix("V1", 50.0, 50.0)).await?;
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let scanner = NotificationScanner::new(store.clone(), notifier.clone(), 10, TIMEOUT);
    let cancel = CancellationToken::new();

    let (ra, rb) = tokio::join!(scanner.run_once(&cancel), scanner.run_once(&cancel));
    let (ra, rb) = (ra?, rb?);

    assert_eq!(ra.succeeded + rb.succeeded, 4);
    assert_eq!(ra.failed + rb.failed, 0);
    assert_eq!(ra.conflicts + rb.conflicts, 0);
    assert_eq!(store.count_sent().await?, 4);

    // Each owner is emailed exactly once
    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 4);
    let mut ids: Vec<_> = sent.iter().map(|n| n.violation_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
    Ok(())
}

#[tokio::test]
async fn full_lifecycle_ends_with_purge() -> Result<(), FencewatchError> {
    let store = Arc::new(InMemoryStore::new());
    for vehicle in ["V1", "V2", "V3", "V4", "V5", "V6", "V7"] {
        store.upsert_owner(VehicleOwnership {
            vehicle_id: VehicleId::try_from(vehicle)?,
            email: format!("{}@x.com", vehicle.to_lowercase()),
        });
    }
    let consumer = IngestionConsumer::new(boundary(), store.clone(), TIMEOUT);
    for vehicle in ["V1", "V2", "V3", "V4", "V5", "V6", "V7"] {
        consumer.handle(&fix(vehicle, 50.0, 50.0)).await?;
    }

    let notifier = Arc::new(RecordingNotifier {
        failing: vec!["V6".to_string(), "V7".to_string()],
        ..Default::default()
    });
    let scanner = NotificationScanner::new(store.clone(), notifier, 100, TIMEOUT);
    scanner.run_once(&CancellationToken::new()).await?;

    let sweeper = PurgeSweeper::new(store.clone(), Duration::ZERO, TIMEOUT);
    let report = sweeper.run_once().await?;
    assert_eq!(report.sent_before, 5);
    assert_eq!(report.deleted, 5);
    assert_eq!(report.sent_after, 0);

    let remaining = store.violations();
    assert_eq!(remaining.len(), 2);
    assert!(remaining
        .iter()
        .all(|v| v.notification_state == NotificationState::Unsent));
    Ok(())
}
