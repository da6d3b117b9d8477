//! Change notification fan-out.
//!
//! [`WatchHub`] keeps the listener list for one [`Storage`](crate::Storage)
//! and the native subscriptions it holds on mounted drivers. The first
//! listener switches the hub into watching mode and subscribes to every
//! watch-capable driver; removing the last listener (or `unwatch`) tears
//! those subscriptions down again. Drivers without native watch support get
//! synthetic events from the façade after each successful write.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stowage_core::key::join_keys;
use stowage_core::StorageResult;
use tracing::debug;

use crate::driver::{Capability, Driver, Unwatch, WatchCallback, WatchEvent};
use crate::mount::MountPoint;

#[derive(Default)]
struct HubState {
    listeners: Vec<(u64, WatchCallback)>,
    unwatchers: HashMap<String, Unwatch>,
    watching: bool,
    next_id: u64,
}

/// Listener registry plus per-mount native subscriptions.
#[derive(Default)]
pub struct WatchHub {
    state: Mutex<HubState>,
}

impl WatchHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one listener is registered.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.state.lock().watching
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Delivers `(event, key)` to every listener, in registration order.
    ///
    /// Listeners run outside the hub lock so they may call back into the
    /// storage.
    pub fn emit(&self, event: WatchEvent, key: &str) {
        let listeners: Vec<WatchCallback> = {
            let state = self.state.lock();
            if !state.watching {
                return;
            }
            state.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for listener in listeners {
            listener(event, key);
        }
    }

    /// Registers a listener. The first listener starts watching `mounts`.
    ///
    /// # Errors
    ///
    /// Propagates a driver's failure to start its native subscription.
    pub fn subscribe(self: &Arc<Self>, callback: WatchCallback, mounts: &[MountPoint]) -> StorageResult<u64> {
        let (id, start) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.listeners.push((id, callback));
            let start = !state.watching;
            state.watching = true;
            (id, start)
        };
        if start {
            debug!(mounts = mounts.len(), "starting watch");
            for mount in mounts {
                if let Err(err) = self.attach(&mount.base, &mount.driver) {
                    self.stop();
                    return Err(err);
                }
            }
        }
        Ok(id)
    }

    /// Subscribes to `driver`'s native events when the hub is watching and
    /// the driver supports it. Relative keys are re-prefixed with `base`.
    ///
    /// # Errors
    ///
    /// Propagates the driver's `watch` failure.
    pub fn attach(self: &Arc<Self>, base: &str, driver: &Arc<dyn Driver>) -> StorageResult<()> {
        if !self.is_watching() || !driver.capabilities().contains(Capability::Watch) {
            return Ok(());
        }
        let hub: Weak<WatchHub> = Arc::downgrade(self);
        let prefix = base.to_string();
        let unwatch = driver.watch(Arc::new(move |event, key| {
            if let Some(hub) = hub.upgrade() {
                hub.emit(event, &join_keys(&[&prefix, key]));
            }
        }))?;
        let previous = self.state.lock().unwatchers.insert(base.to_string(), unwatch);
        if let Some(previous) = previous {
            previous.call();
        }
        Ok(())
    }

    /// Cancels the native subscription for the mount at `base`, if any.
    pub fn detach(&self, base: &str) {
        let unwatch = self.state.lock().unwatchers.remove(base);
        if let Some(unwatch) = unwatch {
            unwatch.call();
        }
    }

    /// Removes one listener; removing the last one stops watching.
    pub fn unsubscribe(&self, id: u64) {
        let empty = {
            let mut state = self.state.lock();
            state.listeners.retain(|(listener, _)| *listener != id);
            state.listeners.is_empty()
        };
        if empty {
            self.stop();
        }
    }

    /// Drops every listener and cancels every native subscription.
    pub fn stop(&self) {
        let unwatchers: Vec<Unwatch> = {
            let mut state = self.state.lock();
            if !state.watching {
                return;
            }
            state.watching = false;
            state.listeners.clear();
            state.unwatchers.drain().map(|(_, unwatch)| unwatch).collect()
        };
        debug!(subscriptions = unwatchers.len(), "stopping watch");
        for unwatch in unwatchers {
            unwatch.call();
        }
    }
}

/// Handle for one listener registered through
/// [`Storage::watch`](crate::Storage::watch).
#[derive(Debug)]
pub struct WatchHandle {
    id: u64,
    hub: Weak<WatchHub>,
}

impl WatchHandle {
    pub(crate) fn new(id: u64, hub: &Arc<WatchHub>) -> Self {
        Self {
            id,
            hub: Arc::downgrade(hub),
        }
    }

    /// Removes this listener. When it was the last one, native driver
    /// subscriptions are cancelled too.
    pub fn unwatch(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
