//! Publish/subscribe registry for server-originated events.
//!
//! Subscriptions are RAII guards: dropping (or disposing) the returned
//! [`Subscription`] removes the listener. The registry never removes
//! listeners on its own.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;

/// Event names published by the engines. Servers may publish others.
pub mod names {
    pub const STATE_CHANGED: &str = "stateChanged";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const SERVER_START: &str = "ServerStart";
    pub const SERVER_STOP: &str = "ServerStop";
    pub const SERVER_EXITED: &str = "serverExited";
    /// First readiness signal from the server.
    pub const STARTED: &str = "started";

    pub const ERROR: &str = "Error";
    pub const SERVER_ERROR: &str = "ServerError";
    pub const UNRESOLVED_DEPENDENCIES: &str = "UnresolvedDependencies";
    pub const PACKAGE_RESTORE_STARTED: &str = "PackageRestoreStarted";
    pub const PACKAGE_RESTORE_FINISHED: &str = "PackageRestoreFinished";
    pub const PROJECT_CHANGED: &str = "ProjectChanged";
    pub const PROJECT_ADDED: &str = "ProjectAdded";
    pub const PROJECT_REMOVED: &str = "ProjectRemoved";
    pub const PROJECT_DIAGNOSTIC_STATUS: &str = "ProjectDiagnosticStatus";
    pub const MSBUILD_PROJECT_DIAGNOSTICS: &str = "MsBuildProjectDiagnostics";
    pub const TEST_MESSAGE: &str = "TestMessage";
    pub const PROJECT_CONFIGURATION: &str = "ProjectConfiguration";
    pub const DIAGNOSTIC: &str = "Diagnostic";
    pub const BACKGROUND_DIAGNOSTIC_STATUS: &str = "BackgroundDiagnosticStatus";

    /// Events the server itself emits, in the casing subscribers use.
    pub const SERVER_EVENTS: &[&str] = &[
        STARTED,
        ERROR,
        SERVER_ERROR,
        UNRESOLVED_DEPENDENCIES,
        PACKAGE_RESTORE_STARTED,
        PACKAGE_RESTORE_FINISHED,
        PROJECT_CHANGED,
        PROJECT_ADDED,
        PROJECT_REMOVED,
        PROJECT_DIAGNOSTIC_STATUS,
        MSBUILD_PROJECT_DIAGNOSTICS,
        TEST_MESSAGE,
        PROJECT_CONFIGURATION,
        DIAGNOSTIC,
        BACKGROUND_DIAGNOSTIC_STATUS,
    ];
}

pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_event: HashMap<String, Vec<(u64, Listener)>>,
}

fn lock(inner: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    // A listener panicking is caught outside the lock, so poisoning only
    // means a panic inside this module's bookkeeping; the map stays usable.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Maps event names to listeners, invoked in registration order.
#[derive(Clone, Default)]
pub struct EventRegistry {
    inner: Arc<Mutex<Listeners>>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = lock(&self.inner);
        let mut counts: Vec<(&str, usize)> = listeners
            .by_event
            .iter()
            .map(|(name, list)| (name.as_str(), list.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("EventRegistry")
            .field("listeners", &counts)
            .finish()
    }
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event`. It stays registered until the
    /// returned guard is dropped or disposed.
    pub fn subscribe(&self, event: impl Into<String>, listener: Listener) -> Subscription {
        let event = event.into();
        let mut listeners = lock(&self.inner);
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .by_event
            .entry(event.clone())
            .or_default()
            .push((id, listener));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Convenience wrapper around [`subscribe`](Self::subscribe) for closures.
    pub fn on<F>(&self, event: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(event, Arc::new(listener))
    }

    /// Invoke every listener registered for `event`, synchronously and in
    /// registration order. A panicking listener is logged and skipped.
    /// Returns how many listeners ran to completion.
    pub fn publish(&self, event: &str, body: &Value) -> usize {
        // Snapshot so listeners may subscribe or dispose while being invoked.
        let snapshot: Vec<Listener> = lock(&self.inner)
            .by_event
            .get(event)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(body))).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(event, "event listener panicked");
            }
        }
        delivered
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.inner).by_event.get(event).map_or(0, Vec::len)
    }
}

/// Registration handle. Dropping it deregisters the listener.
#[must_use = "dropping a Subscription immediately removes the listener"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Listeners>>,
    event: String,
    id: u64,
}

impl Subscription {
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Deregister now. Equivalent to dropping the guard.
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut listeners = lock(&inner);
        if let Some(list) = listeners.by_event.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                listeners.by_event.remove(&self.event);
            }
        }
    }
}
