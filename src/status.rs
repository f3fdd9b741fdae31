use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Where the shared runtime is in its lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    #[default]
    Uninitialized,
    Booting,
    Ready,
    ServerStarting,
    ServerRunning,
    TearingDown,
}

impl LifecyclePhase {
    /// Whether a runtime instance exists in this phase
    pub fn is_booted(&self) -> bool {
        matches!(
            self,
            LifecyclePhase::Ready | LifecyclePhase::ServerStarting | LifecyclePhase::ServerRunning
        )
    }
}

/// Snapshot handed to status subscribers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub phase: LifecyclePhase,
    pub booted: bool,
    pub files_ready: bool,
    pub server_running: bool,
    pub server_url: Option<String>,
    pub server_port: Option<u16>,
    pub last_error: Option<String>,
}

impl ServerStatus {
    pub(crate) fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = phase;
        self.booted = phase.is_booted();
        self.server_running = phase == LifecyclePhase::ServerRunning;
    }
}

pub type StatusCallback = Arc<dyn Fn(&ServerStatus) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    callbacks: Vec<(u64, StatusCallback)>,
    live: HashSet<u64>,
}

/// Fan-out of status snapshots to synchronous callbacks.
///
/// Dispatch works on a snapshot of the callback list taken without holding
/// the lock while calling out, so callbacks may subscribe, unsubscribe or
/// query the manager. A callback removed while a dispatch is under way is
/// skipped by that dispatch.
#[derive(Default)]
pub(crate) struct StatusHub {
    inner: Mutex<HubInner>,
}

impl StatusHub {
    pub(crate) fn add(&self, callback: StatusCallback) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.callbacks.push((id, callback));
        inner.live.insert(id);
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.callbacks.retain(|(cb_id, _)| *cb_id != id);
        inner.live.remove(&id)
    }

    pub(crate) fn notify(&self, status: &ServerStatus) {
        let snapshot: Vec<(u64, StatusCallback)> = self.inner.lock().callbacks.clone();
        for (id, callback) in snapshot {
            if self.inner.lock().live.contains(&id) {
                callback(status);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }
}

/// Returned by [`crate::SandboxRuntimeManager::subscribe`]. Dropping it keeps
/// the callback registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    hub: Weak<StatusHub>,
}

impl Subscription {
    pub(crate) fn new(id: u64, hub: &Arc<StatusHub>) -> Self {
        Self {
            id,
            hub: Arc::downgrade(hub),
        }
    }

    /// Remove the callback. Safe to call while a notification is pending.
    pub fn unsubscribe(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn phase_drives_flags() {
        let mut status = ServerStatus::default();
        status.set_phase(LifecyclePhase::ServerRunning);
        assert!(status.booted);
        assert!(status.server_running);

        status.set_phase(LifecyclePhase::TearingDown);
        assert!(!status.booted);
        assert!(!status.server_running);
    }

    #[test]
    fn removed_callback_is_skipped_mid_dispatch() {
        let hub = Arc::new(StatusHub::default());
        let second_calls = Arc::new(AtomicUsize::new(0));

        // The first callback removes the second one during the same dispatch
        let hub_ref = Arc::downgrade(&hub);
        hub.add(Arc::new(move |_| {
            if let Some(hub) = hub_ref.upgrade() {
                hub.remove(2);
            }
        }));
        let counter = second_calls.clone();
        let second = hub.add(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(second, 2);

        hub.notify(&ServerStatus::default());
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn unsubscribe_after_hub_dropped() {
        let hub = Arc::new(StatusHub::default());
        let id = hub.add(Arc::new(|_| {}));
        let subscription = Subscription::new(id, &hub);
        drop(hub);
        subscription.unsubscribe();
    }

    #[test]
    fn status_serializes_camel_case() {
        let mut status = ServerStatus::default();
        status.set_phase(LifecyclePhase::ServerStarting);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["phase"], "server_starting");
        assert_eq!(value["filesReady"], false);
        assert!(value["serverUrl"].is_null());
    }
}
