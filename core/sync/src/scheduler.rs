//! Pass scheduling - interval, reconnect, and manual triggers.
//!
//! The scheduler decides *when* a reconciliation pass runs; the engine's own
//! lock guarantees passes never overlap. A failed pass is logged and the loop
//! keeps going.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use keel_common::{Error, Result};
use keel_remote::RemoteBackend;
use keel_store::{LocalStore, SETTING_SYNC_ENABLED, SETTING_SYNC_INTERVAL_SECS};

use crate::connectivity::Connectivity;
use crate::engine::{PassSummary, Reconciler};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Foreground interval between automatic passes.
    pub interval: Duration,
    /// Whether regaining connectivity triggers an immediate pass.
    pub sync_on_reconnect: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            sync_on_reconnect: true,
        }
    }
}

impl SchedulerConfig {
    /// Load the persisted interval, falling back to the default.
    pub fn load(store: &LocalStore) -> Result<Self> {
        let mut config = Self::default();
        if let Some(secs) = store.setting(SETTING_SYNC_INTERVAL_SECS)? {
            match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => config.interval = Duration::from_secs(secs),
                _ => warn!("Ignoring invalid persisted sync interval: {}", secs),
            }
        }
        Ok(config)
    }
}

enum SchedulerRequest {
    SyncNow(oneshot::Sender<Result<Option<PassSummary>>>),
    Shutdown,
}

/// Handle for requesting passes and toggling the scheduler.
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerRequest>,
    store: Arc<LocalStore>,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its loop.
    pub fn new(
        store: Arc<LocalStore>,
        connectivity: Arc<Connectivity>,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let scheduler = Self {
            request_tx,
            store: store.clone(),
        };
        let handle = SchedulerHandle {
            request_rx,
            connectivity,
            config,
            store,
        };
        (scheduler, handle)
    }

    /// Trigger a pass now and wait for its summary.
    ///
    /// Returns `None` when a pass was already running. Works even while the
    /// scheduler is disabled; the toggle only gates automatic triggers.
    pub async fn sync_now(&self) -> Result<Option<PassSummary>> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(SchedulerRequest::SyncNow(tx))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler is not running".to_string()))?;
        rx.await
            .map_err(|_| Error::InvalidInput("Scheduler dropped the request".to_string()))?
    }

    /// Stop the scheduler loop. A running pass winds down cleanly.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }

    /// Persisted automatic-sync toggle.
    pub fn is_enabled(&self) -> Result<bool> {
        self.store.bool_setting(SETTING_SYNC_ENABLED, true)
    }

    /// Enable or disable automatic passes, persisted across restarts.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.store.set_bool_setting(SETTING_SYNC_ENABLED, enabled)?;
        info!(
            "Automatic sync {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

/// Background loop driving the engine. Spawn [`run`] on the runtime.
///
/// [`run`]: SchedulerHandle::run
pub struct SchedulerHandle {
    request_rx: mpsc::Receiver<SchedulerRequest>,
    connectivity: Arc<Connectivity>,
    config: SchedulerConfig,
    store: Arc<LocalStore>,
}

impl SchedulerHandle {
    /// Run the scheduling loop until shutdown.
    pub async fn run<B: RemoteBackend + 'static>(mut self, engine: Arc<Reconciler<B>>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; swallow it so
        // startup does not race app initialization.
        ticker.tick().await;

        let mut online_rx = self.connectivity.subscribe();
        let mut was_online = *online_rx.borrow();

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(SchedulerRequest::SyncNow(reply)) => {
                            let result = engine.run_pass().await;
                            if let Err(err) = &result {
                                error!("Requested pass failed: {}", err);
                            }
                            let _ = reply.send(result);
                        }
                        Some(SchedulerRequest::Shutdown) | None => {
                            engine.request_stop();
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if !self.automatic_allowed() {
                        debug!("Interval tick skipped (disabled or offline)");
                        continue;
                    }
                    Self::run_logged(&engine, "interval").await;
                }

                changed = online_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let online = *online_rx.borrow();
                    let regained = online && !was_online;
                    was_online = online;
                    if regained && self.config.sync_on_reconnect && self.enabled() {
                        info!("Connectivity regained; starting pass");
                        Self::run_logged(&engine, "reconnect").await;
                    }
                }
            }
        }
    }

    fn enabled(&self) -> bool {
        self.store
            .bool_setting(SETTING_SYNC_ENABLED, true)
            .unwrap_or(false)
    }

    fn automatic_allowed(&self) -> bool {
        self.enabled() && self.connectivity.effective_online()
    }

    async fn run_logged<B: RemoteBackend + 'static>(engine: &Reconciler<B>, trigger: &str) {
        match engine.run_pass().await {
            Ok(Some(summary)) => {
                debug!(
                    "{} pass: {} applied, {} conflicts, {} pulled",
                    trigger, summary.applied, summary.conflicts, summary.pulled
                );
            }
            Ok(None) => debug!("{} pass skipped: already running", trigger),
            // A failed pass must not kill the loop; the next trigger retries.
            Err(err) => warn!("{} pass failed: {}", trigger, err),
        }
    }
}
