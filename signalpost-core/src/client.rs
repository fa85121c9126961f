//! Telemetry client handle
//!
//! `TelemetryClient` is what applications hold on to. It wires the cache,
//! HTTP delivery, and scheduler together from a [`TelemetryConfig`], and
//! exposes the runtime knobs (default user, session, test mode).
//!
//! ```rust,no_run
//! use signalpost_core::{TelemetryClient, TelemetryConfig};
//!
//! # async fn run() -> signalpost_core::Result<()> {
//! let config = TelemetryConfig::for_app("B97579B6-FFB8-4AC5-AAA7-DA5796CC5DCE");
//! let client = TelemetryClient::start(&config)?;
//!
//! client.send_signal("appLaunched", None, None);
//!
//! // at shutdown: stops the timer and backs up undelivered signals
//! client.terminate().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::SignalCache;
use crate::config::{SettingsHandle, TelemetryConfig, TelemetrySettings};
use crate::delivery::{HttpDelivery, SignalTransport};
use crate::error::Result;
use crate::payload::Environment;
use crate::scheduler::{SchedulerOptions, SignalScheduler, TickOutcome};
use crate::signal::SignalRecord;

/// Signal type sent when a new session starts
pub const NEW_SESSION_SIGNAL: &str = "newSessionBegan";

/// Accepts signals, caches them, and delivers them in the background
pub struct TelemetryClient {
    settings: SettingsHandle,
    scheduler: SignalScheduler,
    send_new_session_began_signal: bool,
}

impl TelemetryClient {
    /// Start a client that delivers over HTTP
    ///
    /// Restores any signals backed up by a previous run. Must be called from
    /// within a tokio runtime.
    pub fn start(config: &TelemetryConfig) -> Result<Self> {
        let settings = SettingsHandle::new(TelemetrySettings::from_config(config)?);
        let transport = HttpDelivery::new(settings.clone(), config.timeout())?;
        Self::assemble(config, settings, Arc::new(transport), Environment::detect())
    }

    /// Start a client with a custom transport and environment
    ///
    /// Settings are derived from `config`, same as [`start`](Self::start).
    pub fn with_transport(
        config: &TelemetryConfig,
        transport: Arc<dyn SignalTransport>,
        environment: Environment,
    ) -> Result<Self> {
        let settings = SettingsHandle::new(TelemetrySettings::from_config(config)?);
        Self::assemble(config, settings, transport, environment)
    }

    /// `settings` must come from `config`
    fn assemble(
        config: &TelemetryConfig,
        settings: SettingsHandle,
        transport: Arc<dyn SignalTransport>,
        environment: Environment,
    ) -> Result<Self> {
        let cache: SignalCache<SignalRecord> = if config.persist_cache {
            SignalCache::load(config.resolved_cache_path())
        } else {
            SignalCache::in_memory()
        };

        let scheduler = SignalScheduler::start(
            Arc::new(cache),
            transport,
            settings.clone(),
            environment,
            SchedulerOptions {
                flush_interval: config.flush_interval(),
                drain_timeout: config.drain_timeout(),
            },
        );

        Ok(Self {
            settings,
            scheduler,
            send_new_session_began_signal: config.send_new_session_began_signal,
        })
    }

    /// Record that an event happened
    ///
    /// `user` takes precedence over the default user. `extra` fields are
    /// sent in addition to the common environment payload and override it
    /// on key collisions.
    pub fn send_signal(
        &self,
        signal_type: impl Into<String>,
        user: Option<String>,
        extra: Option<HashMap<String, String>>,
    ) {
        self.scheduler.enqueue(signal_type, user, extra);
    }

    /// Change the user identifier hashed into signals that don't name one
    ///
    /// `None` falls back to a host-derived identifier.
    pub fn update_default_user(&self, user: Option<String>) {
        self.settings.set_default_user(user);
    }

    /// Begin a new session for all following signals
    ///
    /// Sends a "newSessionBegan" signal unless disabled in configuration.
    pub fn new_session(&self) -> String {
        let session_id = self.settings.rotate_session();
        tracing::info!(session_id = %session_id, "Started new session");
        if self.send_new_session_began_signal {
            self.send_signal(NEW_SESSION_SIGNAL, None, None);
        }
        session_id
    }

    /// Override test mode; `None` restores the build-profile default
    pub fn set_test_mode(&self, test_mode: Option<bool>) {
        self.settings.set_test_mode(test_mode);
    }

    pub fn session_id(&self) -> String {
        self.settings.snapshot().session_id.clone()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn scheduler(&self) -> &SignalScheduler {
        &self.scheduler
    }

    /// Signals waiting to be delivered
    pub fn pending_count(&self) -> usize {
        self.scheduler.count()
    }

    /// Deliver one batch now
    pub async fn flush_now(&self) -> TickOutcome {
        self.scheduler.flush_now().await
    }

    /// Wait for queued signals to land in the cache and spawned sends to end
    pub async fn wait_for_in_flight(&self) {
        self.scheduler.wait_for_in_flight().await;
    }

    /// Shut down, backing up undelivered signals
    ///
    /// Returns the number of signals written to the backup file.
    pub async fn terminate(self) -> Result<usize> {
        self.scheduler.terminate().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const APP_ID: &str = "b97579b6-ffb8-4ac5-aaa7-da5796cc5dce";

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<SignalRecord>>,
    }

    #[async_trait]
    impl SignalTransport for RecordingTransport {
        async fn send(&self, batch: &[SignalRecord]) -> DeliveryOutcome {
            self.sent.lock().unwrap().extend_from_slice(batch);
            DeliveryOutcome::Success
        }
    }

    fn test_config(dir: &TempDir) -> TelemetryConfig {
        TelemetryConfig {
            flush_interval_secs: 3600,
            cache_path: Some(dir.path().join("signal-cache.json")),
            default_user: Some("alice@example.com".to_string()),
            ..TelemetryConfig::for_app(APP_ID)
        }
    }

    fn start_client(config: &TelemetryConfig, transport: Arc<RecordingTransport>) -> TelemetryClient {
        TelemetryClient::with_transport(config, transport, Environment::detect()).unwrap()
    }

    /// Start a client and let its immediate first tick finish
    async fn start_settled(
        config: &TelemetryConfig,
        transport: Arc<RecordingTransport>,
    ) -> TelemetryClient {
        let client = start_client(config, transport);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.scheduler.ticks() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first tick did not run");
        client.wait_for_in_flight().await;
        client
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        assert!(TelemetryClient::start(&TelemetryConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_new_session_sends_signal() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let client = start_settled(&test_config(&dir), Arc::clone(&transport)).await;

        let old_session = client.session_id();
        let new_session = client.new_session();
        assert_ne!(old_session, new_session);
        assert_eq!(client.session_id(), new_session);

        client.wait_for_in_flight().await;
        assert_eq!(client.flush_now().await, TickOutcome::Delivered(1));

        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].signal_type, NEW_SESSION_SIGNAL);
        assert_eq!(sent[0].session_id, new_session);

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_session_signal_can_be_disabled() {
        let dir = TempDir::new().unwrap();
        let config = TelemetryConfig {
            send_new_session_began_signal: false,
            ..test_config(&dir)
        };
        let client = start_settled(&config, Arc::new(RecordingTransport::default())).await;

        client.new_session();
        client.wait_for_in_flight().await;
        assert_eq!(client.pending_count(), 0);

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_default_user_changes_hash() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let client = start_settled(&test_config(&dir), Arc::clone(&transport)).await;

        client.send_signal("first", None, None);
        client.wait_for_in_flight().await;
        client.update_default_user(Some("bob@example.com".to_string()));
        client.send_signal("second", None, None);
        client.wait_for_in_flight().await;

        while client.flush_now().await != TickOutcome::Idle {}

        let sent = transport.sent.lock().unwrap().clone();
        let first = sent.iter().find(|r| r.signal_type == "first").unwrap();
        let second = sent.iter().find(|r| r.signal_type == "second").unwrap();
        assert_eq!(first.client_user, crate::hasher::hash_user("alice@example.com"));
        assert_eq!(second.client_user, crate::hasher::hash_user("bob@example.com"));

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_persists_pending_signals() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let client = start_settled(&config, Arc::new(RecordingTransport::default())).await;

        client.send_signal("pending", None, None);
        client.wait_for_in_flight().await;
        assert_eq!(client.terminate().await.unwrap(), 1);

        let restored = start_client(&config, Arc::new(RecordingTransport::default()));
        assert_eq!(restored.pending_count(), 1);
        restored.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_cache_disabled_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = TelemetryConfig {
            persist_cache: false,
            ..test_config(&dir)
        };
        let client = start_settled(&config, Arc::new(RecordingTransport::default())).await;

        client.send_signal("pending", None, None);
        client.wait_for_in_flight().await;
        assert_eq!(client.terminate().await.unwrap(), 0);
        assert!(!dir.path().join("signal-cache.json").exists());
    }

    #[tokio::test]
    async fn test_dropped_client_keeps_pending_signals() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let client = start_settled(&config, Arc::new(RecordingTransport::default())).await;

        client.send_signal("pending", None, None);
        client.wait_for_in_flight().await;
        assert_eq!(client.pending_count(), 1);
        drop(client);

        let restored = start_client(&config, Arc::new(RecordingTransport::default()));
        assert_eq!(restored.pending_count(), 1);
        restored.terminate().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_send_signal_from_std_thread() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let client = Arc::new(start_settled(&test_config(&dir), Arc::clone(&transport)).await);

        let sender = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.send_signal("fromThread", None, None))
        };
        sender.join().expect("send_signal panicked off the runtime");

        client.wait_for_in_flight().await;
        assert_eq!(client.flush_now().await, TickOutcome::Delivered(1));
        assert_eq!(transport.sent.lock().unwrap()[0].signal_type, "fromThread");
    }

    #[tokio::test]
    async fn test_with_transport_stamps_configured_app_id() {
        let dir = TempDir::new().unwrap();
        let other_app = "0c7b5b4e-93c5-4a4f-9f43-0f1d2f1a5e11";
        let config = TelemetryConfig {
            app_id: Some(other_app.to_string()),
            ..test_config(&dir)
        };
        let transport = Arc::new(RecordingTransport::default());
        let client = start_settled(&config, Arc::clone(&transport)).await;

        client.send_signal("appLaunched", None, None);
        client.wait_for_in_flight().await;
        assert_eq!(client.flush_now().await, TickOutcome::Delivered(1));
        assert_eq!(transport.sent.lock().unwrap()[0].app_id, other_app);
        assert_eq!(client.settings().snapshot().app_id, other_app);

        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_transport_rejects_invalid_config() {
        let result = TelemetryClient::with_transport(
            &TelemetryConfig::for_app("not-a-uuid"),
            Arc::new(RecordingTransport::default()),
            Environment::detect(),
        );
        assert!(result.is_err());
    }
}
