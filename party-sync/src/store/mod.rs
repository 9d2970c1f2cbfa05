//! Namespaced persistent store.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  write(ns, list)   ┌────────────────┐
//! │ Party / Room │ ─────────────────► │ Store (context)│
//! └──────────────┘                    └───────┬────────┘
//!                                             │
//!                 ┌───────────────────────────┼───────────────────────┐
//!                 ▼                           ▼                       ▼
//!         ┌───────────────┐          ┌────────────────┐      ┌────────────────┐
//!         │ DurableMedium │          │ local          │      │ SignalBus      │
//!         │ (RocksDB/mem) │          │ subscribers    │      │ (other         │
//!         └───────────────┘          └────────────────┘      │  contexts)     │
//!                                                            └────────────────┘
//! ```
//!
//! Every list lives under `kind:CODE`. A write is one atomic replace of the
//! whole list, followed by a synchronous notification of local subscribers
//! and, when the durable write succeeded, a cross-context signal.
//!
//! Medium failures never escape: reads fall back to the caller's default
//! and writes degrade to in-memory notification only.

pub mod medium;
pub mod rocks;

pub use medium::{DurableMedium, MemoryMedium, StoreError};
pub use rocks::{RocksMedium, StoreConfig};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{SignalBus, StorageSignal};
use crate::model::{Entity, EntityKind, Namespace, PartyCode, Player, Roll};
use crate::subscription::{Subscribers, Subscription};

/// Record holding this device's identifier.
pub const DEVICE_KEY: &str = "device_id";

/// Record holding the active party code.
pub const PARTY_KEY: &str = "party_code";

struct StoreInner {
    /// Identifies this context on the signal bus
    context: Uuid,
    medium: Arc<dyn DurableMedium>,
    bus: Option<SignalBus>,
    subscribers: Subscribers,
    /// Serializes read-modify-write cycles within this context
    write_lock: Mutex<()>,
    /// Bumped under `write_lock` by every list write
    version: AtomicU64,
    /// Dropped with the context; ends its signal listener
    alive: watch::Sender<()>,
}

/// One execution context's view of the device store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Store over `medium` with no cross-context signalling.
    pub fn new(medium: Arc<dyn DurableMedium>) -> Self {
        Self::build(medium, None)
    }

    /// Store over `medium` that signals other contexts attached to `bus`.
    pub fn with_bus(medium: Arc<dyn DurableMedium>, bus: SignalBus) -> Self {
        Self::build(medium, Some(bus))
    }

    /// Volatile store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryMedium::new()))
    }

    fn build(medium: Arc<dyn DurableMedium>, bus: Option<SignalBus>) -> Self {
        let context = Uuid::new_v4();
        log::debug!("Store context {context} attached to medium {}", medium.id());
        Self {
            inner: Arc::new(StoreInner {
                context,
                medium,
                bus,
                subscribers: Subscribers::default(),
                write_lock: Mutex::new(()),
                version: AtomicU64::new(1),
                alive: watch::channel(()).0,
            }),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.inner.context
    }

    pub fn medium(&self) -> &Arc<dyn DurableMedium> {
        &self.inner.medium
    }

    // ─── Raw records ──────────────────────────────────────────────────

    /// Read and decode a record, or `fallback` if missing or unreadable.
    pub fn read_record<V: DeserializeOwned>(&self, key: &str, fallback: V) -> V {
        match self.inner.medium.get(key) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    log::warn!("Discarding unreadable record {key}: {e}");
                    fallback
                }
            },
            Ok(None) => fallback,
            Err(e) => {
                log::warn!("Read of {key} failed, using fallback: {e}");
                fallback
            }
        }
    }

    /// Encode and durably write a record. No notification.
    pub fn write_record<V: Serialize>(&self, key: &str, value: &V) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.inner.medium.put(key, &raw)
    }

    // ─── Namespaced lists ─────────────────────────────────────────────

    /// Current list for `(T::KIND, code)`.
    pub fn read<T: Entity>(&self, code: &PartyCode) -> Vec<T> {
        self.read_record(&Namespace::new(T::KIND, code.clone()).key(), Vec::new())
    }

    /// Replace the list for `(T::KIND, code)` and notify.
    pub fn write<T: Entity>(&self, code: &PartyCode, list: Vec<T>) {
        let version = {
            let _guard = self.lock();
            self.persist(code, &list);
            self.bump()
        };
        self.notify(code, &list, version);
    }

    /// Read-modify-write under this context's write lock.
    ///
    /// Writes and notifies only if `f` changed the list.
    pub fn modify<T, R>(&self, code: &PartyCode, f: impl FnOnce(&mut Vec<T>) -> R) -> R
    where
        T: Entity,
    {
        let (result, written) = {
            let _guard = self.lock();
            let before: Vec<T> = self.read(code);
            let mut list = before.clone();
            let result = f(&mut list);
            if list == before {
                (result, None)
            } else {
                self.persist(code, &list);
                (result, Some((list, self.bump())))
            }
        };

        if let Some((list, version)) = written {
            self.notify(code, &list, version);
        }
        result
    }

    /// Merge remote records into `(T::KIND, code)`.
    ///
    /// Returns whether anything changed; unchanged merges neither write
    /// nor notify.
    pub fn merge<T: Entity>(&self, code: &PartyCode, remote: &[T]) -> bool {
        let (merged, version) = {
            let _guard = self.lock();
            let outcome = T::merge(self.read(code), remote);
            if !outcome.changed {
                return false;
            }
            self.persist(code, &outcome.list);
            (outcome.list, self.bump())
        };

        log::debug!(
            "Merged {} remote record(s) into {}",
            remote.len(),
            Namespace::new(T::KIND, code.clone())
        );
        self.notify(code, &merged, version);
        true
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Observe `(T::KIND, code)`.
    ///
    /// The callback fires once immediately with the current list, then on
    /// every local write, changed merge, or matching cross-context signal.
    /// A local write racing the first call is never followed by the older
    /// initial list.
    pub fn subscribe<T, F>(&self, code: &PartyCode, callback: F) -> Subscription
    where
        T: Entity,
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        let registry = T::registry(&self.inner.subscribers);
        let (id, current, version) = {
            let _guard = self.lock();
            let id = registry.add(code.clone(), Arc::new(callback));
            let current: Vec<T> = self.read(code);
            (id, current, self.inner.version.load(Ordering::Acquire))
        };
        registry.deliver(id, &current, version);

        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                T::registry(&inner.subscribers).remove(id);
            }
        })
    }

    /// Number of subscribers bound to `(T::KIND, code)`.
    pub fn subscriber_count<T: Entity>(&self, code: &PartyCode) -> usize {
        T::registry(&self.inner.subscribers).count(code)
    }

    // ─── Cross-context signals ────────────────────────────────────────

    /// Dispatch a signal from another context to matching subscribers.
    ///
    /// Signals this context published itself are ignored. Returns whether
    /// any subscriber was called.
    pub fn apply_signal(&self, signal: &StorageSignal) -> bool {
        if signal.origin == self.inner.context {
            return false;
        }
        let Some((prefix, raw_code)) = signal.key.split_once(':') else {
            return false;
        };
        let code = PartyCode::new(raw_code);

        let called = if prefix == EntityKind::Players.prefix() {
            self.dispatch_signal::<Player>(&code, signal)
        } else if prefix == EntityKind::Rolls.prefix() {
            self.dispatch_signal::<Roll>(&code, signal)
        } else {
            0
        };
        called > 0
    }

    fn dispatch_signal<T: Entity>(&self, code: &PartyCode, signal: &StorageSignal) -> usize {
        let registry = T::registry(&self.inner.subscribers);
        if registry.count(code) == 0 {
            return 0;
        }
        let list: Vec<T> = match serde_json::from_str(&signal.value) {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Signal for {} carried an unreadable value: {e}", signal.key);
                self.read(code)
            }
        };
        registry.notify(code, &list, None)
    }

    /// Pump the signal bus on the current tokio runtime.
    ///
    /// Returns `None` if this store has no bus or no runtime is running.
    /// The task ends once the last clone of this store is dropped, even
    /// while other contexts keep the bus open.
    pub fn spawn_signal_listener(&self) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.inner.bus.as_ref()?.listen();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::debug!("No tokio runtime; cross-context signals are not pumped");
                return None;
            }
        };

        let mut alive = self.inner.alive.subscribe();
        let weak = Arc::downgrade(&self.inner);
        Some(runtime.spawn(async move {
            loop {
                let received = tokio::select! {
                    received = rx.recv() => received,
                    _ = alive.changed() => break,
                };
                let Some(inner) = weak.upgrade() else { break };
                match received {
                    Ok(signal) => {
                        Store { inner }.apply_signal(&signal);
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("Store signal listener lagged by {n} signals");
                        if let Some(bus) = &inner.bus {
                            bus.record_dropped(n);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            log::debug!("Store signal listener stopped");
        }))
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Durable write plus cross-context signal. Failures are logged only.
    fn persist<T: Entity>(&self, code: &PartyCode, list: &[T]) {
        let key = Namespace::new(T::KIND, code.clone()).key();
        let raw = match serde_json::to_string(list) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Failed to encode {key}: {e}");
                return;
            }
        };

        if let Err(e) = self.inner.medium.put(&key, &raw) {
            log::warn!("Durable write of {key} failed, continuing in memory: {e}");
            return;
        }

        if let Some(bus) = &self.inner.bus {
            bus.publish(StorageSignal {
                origin: self.inner.context,
                key,
                value: raw,
            });
        }
    }

    /// Next list version. Call with `write_lock` held.
    fn bump(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn notify<T: Entity>(&self, code: &PartyCode, list: &[T], version: u64) {
        T::registry(&self.inner.subscribers).notify(code, list, Some(version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct BrokenMedium;

    impl DurableMedium for BrokenMedium {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("access denied".into()))
        }

        fn put(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("quota exceeded".into()))
        }

        fn id(&self) -> Uuid {
            Uuid::nil()
        }
    }

    fn roll(id: &str, created_at: u64) -> Roll {
        Roll {
            id: id.to_string(),
            player_id: Some("p".to_string()),
            player_name: "Mo".to_string(),
            dice_count: 1,
            dice_values: vec![4],
            total: 4,
            session_id: "s".to_string(),
            round_number: 1,
            created_at,
            party_code: PartyCode::new("ABCD"),
        }
    }

    fn recorder<T: Clone + Send + 'static>() -> (Arc<StdMutex<Vec<Vec<T>>>>, impl Fn(&[T]) + Send + Sync) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        (seen, move |list: &[T]| s.lock().unwrap().push(list.to_vec()))
    }

    #[test]
    fn test_read_missing_is_empty() {
        let store = Store::in_memory();
        let rolls: Vec<Roll> = store.read(&PartyCode::new("ABCD"));
        assert!(rolls.is_empty());
    }

    #[test]
    fn test_write_is_namespaced() {
        let store = Store::in_memory();
        let abcd = PartyCode::new("ABCD");
        store.write(&abcd, vec![roll("r1", 1)]);

        assert_eq!(store.read::<Roll>(&abcd).len(), 1);
        assert!(store.read::<Roll>(&PartyCode::new("WXYZ")).is_empty());
        assert!(store.read::<Roll>(&PartyCode::local()).is_empty());
        assert!(store.medium().get("rolls:ABCD").unwrap().is_some());
    }

    #[test]
    fn test_subscribe_fires_immediately_and_on_write() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        store.write(&code, vec![roll("r1", 1)]);

        let (seen, cb) = recorder::<Roll>();
        let _sub = store.subscribe(&code, cb);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].len(), 1);

        store.write(&code, vec![roll("r2", 2), roll("r1", 1)]);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(seen.lock().unwrap()[1].len(), 2);

        // Other namespace does not fire.
        store.write(&PartyCode::new("WXYZ"), vec![roll("x", 1)]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unsubscribe_leaves_others() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        let (seen_a, cb_a) = recorder::<Roll>();
        let (seen_b, cb_b) = recorder::<Roll>();
        let sub_a = store.subscribe(&code, cb_a);
        let _sub_b = store.subscribe(&code, cb_b);
        assert_eq!(store.subscriber_count::<Roll>(&code), 2);

        sub_a.unsubscribe();
        store.write(&code, vec![roll("r1", 1)]);

        assert_eq!(seen_a.lock().unwrap().len(), 1);
        assert_eq!(seen_b.lock().unwrap().len(), 2);
        assert_eq!(store.subscriber_count::<Roll>(&code), 1);
    }

    #[test]
    fn test_merge_unchanged_skips_write_and_notify() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        store.write(&code, vec![roll("r2", 2), roll("r1", 1)]);
        let (seen, cb) = recorder::<Roll>();
        let _sub = store.subscribe(&code, cb);

        assert!(!store.merge(&code, &[roll("r1", 1)]));
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert!(store.merge(&code, &[roll("r3", 3)]));
        let notified = seen.lock().unwrap();
        assert_eq!(notified.len(), 2);
        let order: Vec<u64> = notified[1].iter().map(|r| r.created_at).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_modify_skips_noop() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        let (seen, cb) = recorder::<Roll>();
        let _sub = store.subscribe(&code, cb);

        let removed = store.modify(&code, |list: &mut Vec<Roll>| {
            let before = list.len();
            list.retain(|r| r.id != "missing");
            before - list.len()
        });
        assert_eq!(removed, 0);
        assert_eq!(seen.lock().unwrap().len(), 1);

        store.modify(&code, |list: &mut Vec<Roll>| list.push(roll("r1", 1)));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_broken_medium_degrades() {
        let store = Store::new(Arc::new(BrokenMedium));
        let code = PartyCode::new("ABCD");
        assert!(store.read::<Roll>(&code).is_empty());
        assert_eq!(store.read_record(DEVICE_KEY, "fallback".to_string()), "fallback");

        let (seen, cb) = recorder::<Roll>();
        let _sub = store.subscribe(&code, cb);
        store.write(&code, vec![roll("r1", 1)]);

        // Notification still carries the attempted list.
        let notified = seen.lock().unwrap();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[1][0].id, "r1");
    }

    #[test]
    fn test_corrupt_record_falls_back() {
        let medium = Arc::new(MemoryMedium::new());
        medium.put("rolls:ABCD", "{not json").unwrap();
        let store = Store::new(medium);
        assert!(store.read::<Roll>(&PartyCode::new("ABCD")).is_empty());
    }

    #[test]
    fn test_callback_can_write_back() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        let writer = store.clone();
        let c = code.clone();
        let _sub = store.subscribe(&code, move |list: &[Roll]| {
            if list.len() == 1 {
                let mut next = list.to_vec();
                next.push(roll("echo", 0));
                writer.write(&c, next);
            }
        });
        store.write(&code, vec![roll("r1", 1)]);
        assert_eq!(store.read::<Roll>(&code).len(), 2);
    }

    #[test]
    fn test_signal_between_contexts() {
        let medium: Arc<dyn DurableMedium> = Arc::new(MemoryMedium::new());
        let bus = SignalBus::new(16);
        let tab_a = Store::with_bus(medium.clone(), bus.clone());
        let tab_b = Store::with_bus(medium, bus.clone());
        let mut rx = bus.listen();

        let code = PartyCode::new("ABCD");
        let (seen, cb) = recorder::<Roll>();
        let _sub = tab_b.subscribe(&code, cb);

        tab_a.write(&code, vec![roll("r1", 1)]);
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.key, "rolls:ABCD");
        assert_eq!(signal.origin, tab_a.context_id());

        // Own signal is ignored; foreign one is dispatched.
        assert!(!tab_a.apply_signal(&signal));
        assert!(tab_b.apply_signal(&signal));
        let notified = seen.lock().unwrap();
        assert_eq!(notified.len(), 2);
        assert_eq!(notified[1][0].id, "r1");
    }

    #[test]
    fn test_signal_for_other_namespace_ignored() {
        let store = Store::in_memory();
        let (seen, cb) = recorder::<Player>();
        let _sub = store.subscribe(&PartyCode::new("ABCD"), cb);
        let signal = StorageSignal {
            origin: Uuid::new_v4(),
            key: "players:WXYZ".to_string(),
            value: "[]".to_string(),
        };
        assert!(!store.apply_signal(&signal));
        let bogus = StorageSignal {
            key: "settings".to_string(),
            ..signal
        };
        assert!(!store.apply_signal(&bogus));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signal_listener_pumps_bus() {
        let medium: Arc<dyn DurableMedium> = Arc::new(MemoryMedium::new());
        let bus = SignalBus::new(16);
        let tab_a = Store::with_bus(medium.clone(), bus.clone());
        let tab_b = Store::with_bus(medium, bus);
        let listener = tab_b.spawn_signal_listener();
        assert!(listener.is_some());

        let code = PartyCode::new("ABCD");
        let (seen, cb) = recorder::<Roll>();
        let _sub = tab_b.subscribe(&code, cb);

        tab_a.write(&code, vec![roll("r1", 1)]);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while seen.lock().unwrap().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "signal never arrived");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_signal_listener_stops_with_store() {
        let medium: Arc<dyn DurableMedium> = Arc::new(MemoryMedium::new());
        let bus = SignalBus::new(16);
        let other = Store::with_bus(medium.clone(), bus.clone());
        let tab = Store::with_bus(medium, bus.clone());
        let listener = tab.spawn_signal_listener().unwrap();

        drop(tab);
        // The bus stays open through `other`, and nothing is published.
        tokio::time::timeout(std::time::Duration::from_secs(2), listener)
            .await
            .expect("listener outlived its store")
            .unwrap();
        assert_eq!(bus.stats().listeners, 0);
        drop(other);
    }

    #[test]
    fn test_subscribe_sees_writes_made_before_it() {
        let store = Store::in_memory();
        let code = PartyCode::new("ABCD");
        store.write(&code, vec![roll("r1", 1)]);
        store.write(&code, vec![roll("r2", 2), roll("r1", 1)]);

        let (seen, cb) = recorder::<Roll>();
        let _sub = store.subscribe(&code, cb);
        store.write(&code, vec![roll("r3", 3)]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_no_listener_without_bus() {
        assert!(Store::in_memory().spawn_signal_listener().is_none());
    }
}
