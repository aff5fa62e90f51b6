//! Geofence violation pipeline
//!
//! GPS fixes arrive over MQTT and are checked against a geofence. Fixes
//! outside it become violation records, the vehicle owner is emailed once,
//! and notified records are purged on a daily schedule.

pub mod config;
pub mod database;
pub mod errors;
pub mod geofence;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod notifier;
pub mod purge;
pub mod scanner;
pub mod schedule;
pub mod store;
