//! Local "list changed" fan-out.
//!
//! Each subscriber is bound to one namespace, fixed when it subscribes.
//! Callbacks run synchronously on the thread that performed the write or
//! merge, after every store lock has been released, so a callback may
//! read or write the store again.
//!
//! Local writes carry a version. A subscriber never receives a version
//! older than one it has already seen, which keeps a late initial call
//! from overwriting a newer list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::{PartyCode, Player, Roll};

/// Observer of one namespaced list.
pub type Callback<T> = Arc<dyn Fn(&[T]) + Send + Sync>;

struct Listener<T> {
    code: PartyCode,
    callback: Callback<T>,
    /// Highest version delivered so far
    seen: AtomicU64,
}

impl<T> Listener<T> {
    /// Whether `version` is newer than anything delivered; records it.
    fn admit(&self, version: Option<u64>) -> bool {
        match version {
            Some(v) => self.seen.fetch_max(v, Ordering::AcqRel) < v,
            None => true,
        }
    }
}

/// Subscribers of one entity kind, across all party codes.
pub struct Registry<T> {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<u64, Arc<Listener<T>>>>,
    notifications: AtomicU64,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(HashMap::new()),
            notifications: AtomicU64::new(0),
        }
    }

    pub fn add(&self, code: PartyCode, callback: Callback<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(
                id,
                Arc::new(Listener {
                    code,
                    callback,
                    seen: AtomicU64::new(0),
                }),
            );
        }
        id
    }

    pub fn remove(&self, id: u64) -> bool {
        self.listeners
            .write()
            .map(|mut l| l.remove(&id).is_some())
            .unwrap_or(false)
    }

    /// Call every subscriber of `code`. Returns how many were called.
    ///
    /// With a `version`, subscribers that already saw the same or a newer
    /// version are skipped. `None` always delivers.
    pub fn notify(&self, code: &PartyCode, list: &[T], version: Option<u64>) -> usize {
        // Snapshot listeners so no callback runs under the registry lock.
        let targets: Vec<Arc<Listener<T>>> = match self.listeners.read() {
            Ok(listeners) => listeners
                .values()
                .filter(|l| &l.code == code)
                .cloned()
                .collect(),
            Err(_) => return 0,
        };

        let mut called = 0;
        for listener in &targets {
            if listener.admit(version) {
                (listener.callback)(list);
                called += 1;
            }
        }
        self.notifications.fetch_add(called as u64, Ordering::Relaxed);
        called
    }

    /// Deliver `list` at `version` to the single subscriber `id`.
    ///
    /// Returns false if the subscriber is gone or already saw a version at
    /// least as new.
    pub fn deliver(&self, id: u64, list: &[T], version: u64) -> bool {
        let target = match self.listeners.read() {
            Ok(listeners) => listeners.get(&id).cloned(),
            Err(_) => None,
        };
        match target {
            Some(listener) if listener.admit(Some(version)) => {
                (listener.callback)(list);
                self.notifications.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Subscribers bound to `code`.
    pub fn count(&self, code: &PartyCode) -> usize {
        self.listeners
            .read()
            .map(|l| l.values().filter(|l| &l.code == code).count())
            .unwrap_or(0)
    }

    /// Total callbacks delivered so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-kind registries owned by one store context.
#[derive(Default)]
pub struct Subscribers {
    pub players: Registry<Player>,
    pub rolls: Registry<Roll>,
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle unsubscribes; keep it alive for as long as the
/// callback should fire.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
