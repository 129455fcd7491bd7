//! Trust bundle broadcaster
//!
//! Holds the current root certificate bundle and fans a rotation signal out to
//! every registered watcher. The signal carries no payload; watchers read the
//! bundle with [`BundleWatcher::ca_bundle`] when they act on it, so a slow
//! watcher always picks up the newest value.
//!
//! Each watcher gets a channel of capacity one filled with `try_send`: the
//! broadcaster never waits on a consumer, and rotations that land while a
//! signal is still undrained coalesce into that signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Handle identifying a watcher registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatcherId(u64);

/// Current trust bundle plus its watcher registry
pub struct BundleWatcher {
    bundle: RwLock<Arc<[u8]>>,
    watchers: Mutex<HashMap<WatcherId, mpsc::Sender<()>>>,
    next_id: AtomicU64,
}

impl Default for BundleWatcher {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl BundleWatcher {
    /// Create a broadcaster holding an initial bundle
    pub fn new(initial: impl Into<Vec<u8>>) -> Self {
        Self {
            bundle: RwLock::new(Arc::from(initial.into())),
            watchers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a watcher; the receiver gets a signal on every later rotation
    ///
    /// Pair every call with [`BundleWatcher::remove_watcher`], or use
    /// [`BundleWatcher::subscribe`] to have the registration released on drop.
    pub fn add_watcher(&self) -> (WatcherId, mpsc::Receiver<()>) {
        let id = WatcherId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(1);
        self.watchers.lock().insert(id, tx);
        debug!(watcher = id.0, "bundle watcher registered");
        (id, rx)
    }

    /// Deregister a watcher; later rotations are not delivered to it
    pub fn remove_watcher(&self, id: WatcherId) {
        if self.watchers.lock().remove(&id).is_some() {
            debug!(watcher = id.0, "bundle watcher removed");
        }
    }

    /// Register a watcher whose registration is released when the guard drops
    pub fn subscribe(self: &Arc<Self>) -> BundleSubscription {
        let (id, rx) = self.add_watcher();
        BundleSubscription {
            owner: Arc::clone(self),
            id,
            rx,
        }
    }

    /// Number of registered watchers
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Current bundle value
    pub fn ca_bundle(&self) -> Arc<[u8]> {
        self.bundle.read().clone()
    }

    /// Replace the bundle and notify every watcher once
    ///
    /// Returns false without notifying when the bytes are unchanged.
    pub fn set_and_notify(&self, bundle: impl Into<Vec<u8>>) -> bool {
        let bundle: Arc<[u8]> = Arc::from(bundle.into());
        {
            let mut current = self.bundle.write();
            if **current == *bundle {
                return false;
            }
            *current = bundle;
        }

        let watchers = self.watchers.lock();
        for tx in watchers.values() {
            // Full means a signal is already pending for this watcher.
            let _ = tx.try_send(());
        }
        info!(watchers = watchers.len(), "trust bundle rotated");
        true
    }
}

/// Scoped watcher registration; deregisters on drop
pub struct BundleSubscription {
    owner: Arc<BundleWatcher>,
    id: WatcherId,
    rx: mpsc::Receiver<()>,
}

impl BundleSubscription {
    /// Registration handle
    pub fn id(&self) -> WatcherId {
        self.id
    }

    /// Wait for the next rotation signal
    ///
    /// Returns `None` only if the registration was removed out from under
    /// this guard.
    pub async fn changed(&mut self) -> Option<()> {
        self.rx.recv().await
    }
}

impl Drop for BundleSubscription {
    fn drop(&mut self) {
        self.owner.remove_watcher(self.id);
    }
}
