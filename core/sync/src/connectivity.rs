//! Effective online/offline state.
//!
//! Combines the live network-reachable signal (fed by platform glue) with the
//! persisted "prefer offline" user override. Everything that cares about
//! connectivity derives one boolean: `network_reachable && !force_offline`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use keel_common::Result;
use keel_store::{LocalStore, SETTING_FORCE_OFFLINE};

/// Connectivity oracle.
///
/// Flips of either input notify watch subscribers, so the scheduler can react
/// to a reconnect without polling.
pub struct Connectivity {
    store: Arc<LocalStore>,
    network_reachable: AtomicBool,
    force_offline: AtomicBool,
    effective_tx: watch::Sender<bool>,
}

impl Connectivity {
    /// Create the oracle, loading the persisted offline preference.
    ///
    /// The network starts as reachable until the platform reports otherwise.
    pub fn new(store: Arc<LocalStore>) -> Result<Self> {
        let force_offline = store.bool_setting(SETTING_FORCE_OFFLINE, false)?;
        let effective = !force_offline;
        let (effective_tx, _) = watch::channel(effective);
        Ok(Self {
            store,
            network_reachable: AtomicBool::new(true),
            force_offline: AtomicBool::new(force_offline),
            effective_tx,
        })
    }

    /// Feed the platform's network signal.
    pub fn set_network_reachable(&self, reachable: bool) {
        let previous = self.network_reachable.swap(reachable, Ordering::SeqCst);
        if previous != reachable {
            info!(
                "Network {}",
                if reachable { "reachable" } else { "unreachable" }
            );
        }
        self.publish();
    }

    /// Set and persist the user's offline override.
    pub fn set_force_offline(&self, force_offline: bool) -> Result<()> {
        self.store
            .set_bool_setting(SETTING_FORCE_OFFLINE, force_offline)?;
        let previous = self.force_offline.swap(force_offline, Ordering::SeqCst);
        if previous != force_offline {
            info!(
                "Offline override {}",
                if force_offline { "enabled" } else { "disabled" }
            );
        }
        self.publish();
        Ok(())
    }

    /// Current network signal.
    pub fn network_reachable(&self) -> bool {
        self.network_reachable.load(Ordering::SeqCst)
    }

    /// Current offline override.
    pub fn force_offline(&self) -> bool {
        self.force_offline.load(Ordering::SeqCst)
    }

    /// The one derived boolean everything else consumes.
    pub fn effective_online(&self) -> bool {
        self.network_reachable() && !self.force_offline()
    }

    /// Subscribe to effective-online transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.effective_tx.subscribe()
    }

    fn publish(&self) {
        self.effective_tx.send_replace(self.effective_online());
    }
}
