//! Signal scheduler
//!
//! Owns the flush timer and the enqueue path.
//!
//! ## Flushing
//!
//! A background task ticks every `flush_interval` (first tick immediately,
//! so signals restored from a previous run go out right away). Each tick
//! pops a batch and spawns its delivery; the tick never waits for the
//! network, so a slow server can have several batches in flight. A batch
//! that fails is pushed back into the cache for a later tick.
//!
//! A 413 response shrinks the batch size for following ticks; each success
//! grows it back. A single signal that is still too large can never be
//! delivered and is dropped.
//!
//! ## Enqueueing
//!
//! `enqueue` snapshots the settings, builds the payload, and spawns a task
//! that hashes the user identifier on the blocking pool and then pushes the
//! finished record. The caller never waits, and need not be on a runtime
//! thread: tasks go to the runtime the scheduler was started on.
//!
//! ## Shutdown
//!
//! `terminate` stops the timer, waits (bounded) for in-flight deliveries and
//! enqueues so failed batches are back in the cache, then backs the cache
//! up to disk. A scheduler dropped without `terminate` still writes the
//! backup, minus whatever was in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::{SignalCache, MAX_BATCH_SIZE};
use crate::config::SettingsHandle;
use crate::delivery::{DeliveryOutcome, SignalTransport};
use crate::error::Result;
use crate::hasher::hash_user_async;
use crate::payload::{encode_payload, Environment};
use crate::signal::SignalRecord;

/// Timing knobs for the scheduler
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Time between flush ticks
    pub flush_interval: Duration,
    /// Longest `terminate` waits for in-flight work
    pub drain_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// What one delivery cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Cache was empty
    Idle,
    /// Batch of this size was accepted
    Delivered(usize),
    /// Batch of this size failed and went back into the cache
    Requeued(usize),
    /// Undeliverable signals that were discarded
    Dropped(usize),
}

struct SchedulerInner {
    cache: Arc<SignalCache<SignalRecord>>,
    transport: Arc<dyn SignalTransport>,
    settings: SettingsHandle,
    environment: Environment,
    tracker: TaskTracker,
    runtime: Handle,
    batch_limit: AtomicUsize,
    ticks: AtomicU64,
}

impl SchedulerInner {
    async fn deliver_next(&self) -> TickOutcome {
        let batch = self.cache.pop_up_to(self.batch_limit.load(Ordering::Acquire));
        if batch.is_empty() {
            return TickOutcome::Idle;
        }

        let count = batch.len();
        tracing::debug!(
            count,
            remaining = self.cache.count(),
            "Sending signals"
        );

        match self.transport.send(&batch).await {
            DeliveryOutcome::Success => {
                self.grow_batch_limit();
                tracing::debug!(count, "Delivered signals");
                TickOutcome::Delivered(count)
            }
            DeliveryOutcome::Failure { body, error } => {
                if error.is_payload_too_large() {
                    if count == 1 {
                        tracing::error!(
                            signal_type = %batch[0].signal_type,
                            body = %body,
                            "Dropping signal rejected as too large"
                        );
                        return TickOutcome::Dropped(1);
                    }
                    self.shrink_batch_limit(count);
                }

                tracing::warn!(count, error = %error, "Failed to send signals, re-queueing");
                tracing::trace!(body = %body, "Rejected signal data");
                self.cache.push_many(batch);
                TickOutcome::Requeued(count)
            }
        }
    }

    fn shrink_batch_limit(&self, failed_size: usize) {
        let halved = (failed_size / 2).max(1);
        let previous = self.batch_limit.fetch_min(halved, Ordering::AcqRel);
        if halved < previous {
            tracing::info!(batch_limit = halved, "Reduced signal batch size");
        }
    }

    fn grow_batch_limit(&self) {
        let _ = self
            .batch_limit
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                (limit < MAX_BATCH_SIZE).then(|| (limit * 2).min(MAX_BATCH_SIZE))
            });
    }

    fn spawn_delivery(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.tracker.spawn_on(
            async move {
                inner.deliver_next().await;
            },
            &self.runtime,
        );
    }
}

/// Periodic flusher and enqueue path for one cache
pub struct SignalScheduler {
    inner: Arc<SchedulerInner>,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
    drain_timeout: Duration,
    terminated: bool,
}

impl SignalScheduler {
    /// Start the flush timer
    ///
    /// Must be called from within a tokio runtime. Later spawns go to that
    /// runtime whichever thread triggers them.
    pub fn start(
        cache: Arc<SignalCache<SignalRecord>>,
        transport: Arc<dyn SignalTransport>,
        settings: SettingsHandle,
        environment: Environment,
        options: SchedulerOptions,
    ) -> Self {
        let inner = Arc::new(SchedulerInner {
            cache,
            transport,
            settings,
            environment,
            tracker: TaskTracker::new(),
            runtime: Handle::current(),
            batch_limit: AtomicUsize::new(MAX_BATCH_SIZE),
            ticks: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        let timer = inner.runtime.spawn(run_timer(
            Arc::clone(&inner),
            options.flush_interval,
            cancel.clone(),
        ));

        tracing::info!(
            flush_interval = ?options.flush_interval,
            cached = inner.cache.count(),
            "Signal scheduler started"
        );

        Self {
            inner,
            cancel,
            timer: Some(timer),
            drain_timeout: options.drain_timeout,
            terminated: false,
        }
    }

    /// Queue a signal
    ///
    /// Returns immediately. The record is pushed into the cache once the
    /// user hash is computed. `user` overrides the configured default user.
    pub fn enqueue(
        &self,
        signal_type: impl Into<String>,
        user: Option<String>,
        extra: Option<HashMap<String, String>>,
    ) {
        let settings = self.inner.settings.snapshot();
        let signal_type = signal_type.into();
        let payload = encode_payload(&self.inner.environment, extra.as_ref());
        let identifier = user.unwrap_or_else(|| settings.default_user_identifier());
        let received_at = Utc::now();
        let cache = Arc::clone(&self.inner.cache);

        let task = async move {
            match hash_user_async(identifier).await {
                Ok(client_user) => {
                    tracing::debug!(signal_type = %signal_type, "Adding signal to cache");
                    cache.push(SignalRecord {
                        received_at,
                        app_id: settings.app_id.clone(),
                        client_user,
                        session_id: settings.session_id.clone(),
                        signal_type,
                        payload,
                        is_test_mode: settings.is_test_mode(),
                    });
                }
                Err(e) => {
                    tracing::error!(
                        signal_type = %signal_type,
                        error = %e,
                        "Dropping signal, user hash failed"
                    );
                }
            }
        };
        self.inner.tracker.spawn_on(task, &self.inner.runtime);
    }

    /// Run one delivery cycle now and wait for it
    pub async fn flush_now(&self) -> TickOutcome {
        self.inner.deliver_next().await
    }

    /// Start one delivery cycle in the background, like a timer tick
    pub fn run_tick(&self) {
        self.inner.spawn_delivery();
    }

    /// Wait until spawned deliveries and enqueues have finished
    pub async fn wait_for_in_flight(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Signals currently cached
    pub fn count(&self) -> usize {
        self.inner.cache.count()
    }

    /// Current batch size ceiling
    pub fn batch_limit(&self) -> usize {
        self.inner.batch_limit.load(Ordering::Acquire)
    }

    /// Timer ticks so far
    pub fn ticks(&self) -> u64 {
        self.inner.ticks.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }

    /// Stop the timer, drain in-flight work, and back up the cache
    ///
    /// Returns the number of signals written to the backup. Work still
    /// running after the drain timeout is abandoned.
    pub async fn terminate(mut self) -> Result<usize> {
        tracing::info!("Signal scheduler terminating");
        self.cancel.cancel();

        if let Some(timer) = self.timer.take() {
            if let Err(e) = timer.await {
                tracing::warn!(error = %e, "Flush timer ended abnormally");
            }
        }

        self.inner.tracker.close();
        if tokio::time::timeout(self.drain_timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.inner.tracker.len(),
                "Abandoning in-flight signal work at shutdown"
            );
        }

        self.terminated = true;
        self.inner.cache.backup()
    }
}

impl Drop for SignalScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.terminated || self.inner.cache.path().is_none() {
            return;
        }

        tracing::warn!(
            in_flight = self.inner.tracker.len(),
            "Signal scheduler dropped without terminate, backing up cache"
        );
        if let Err(e) = self.inner.cache.backup() {
            tracing::warn!(error = %e, "Failed to back up signals on drop");
        }
    }
}

async fn run_timer(inner: Arc<SchedulerInner>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                tracing::trace!(count = inner.cache.count(), "Current signal cache count");
                inner.spawn_delivery();
                inner.ticks.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    tracing::debug!("Flush timer stopped");
}
