//! # signalpost-core
//!
//! Core library for signalpost - a client-side telemetry signal pipeline.
//!
//! This library provides:
//! - A thread-safe signal cache that survives restarts via a JSON backup file
//! - A scheduler that delivers cached signals in batches and re-queues failures
//! - One-way hashing of user identifiers
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Signals flow through three stages:
//! - **Enqueue:** payload built, user identifier hashed off the caller's task
//! - **Cache:** records wait in [`SignalCache`], backed up to disk at shutdown
//! - **Delivery:** every flush interval a batch of up to 100 is posted;
//!   failed batches go back into the cache
//!
//! ## Example
//!
//! ```rust,no_run
//! use signalpost_core::{Config, TelemetryClient};
//!
//! # async fn run() -> signalpost_core::Result<()> {
//! let config = Config::load()?;
//! let client = TelemetryClient::start(&config.telemetry)?;
//! client.send_signal("appLaunched", None, None);
//! client.terminate().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use cache::{SignalCache, MAX_BATCH_SIZE};
pub use client::TelemetryClient;
pub use config::{Config, SettingsHandle, TelemetryConfig, TelemetrySettings};
pub use delivery::{DeliveryError, DeliveryOutcome, HttpDelivery, SignalTransport};
pub use error::{Error, Result};
pub use scheduler::{SchedulerOptions, SignalScheduler, TickOutcome};
pub use signal::SignalRecord;

// Public modules
pub mod cache;
pub mod client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod payload;
pub mod scheduler;
pub mod signal;
