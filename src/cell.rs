//! The reactive engine: one cell owns a current/previous value pair, a
//! subscriber set, and the gate-and-broadcast mutation path shared by every
//! facade.
//!
//! Mutations are synchronous: gates, the in-memory update and the broadcast
//! loop all run before `set`/`reset` returns, and every subscriber receives
//! the exact pair produced by that mutation, in registration order. The
//! write-through to the selected backend is a detached task; ordering across
//! rapid successive writes to one cell is not enforced (last writer wins at
//! the backend) and [`Cell::flush`] awaits the stragglers.
//!
//! Initialization is single-flight: it resolves the backend, reads (and, if
//! needed, migrates) the stored record, accepts it only when admissible and
//! valid, publishes the pair, and then runs the optional async initializer.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, error, warn};

use crate::backend::{validate_name, Backend, StoredRecord};
use crate::error::Result;
use crate::router::{BackendPreference, CapabilityResolver, PersistenceRouter};
use crate::shape::Shape;
use crate::watch::{WatchSender, WatchStream};

/// A value and the value it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuePair<T> {
    /// The current value.
    pub value: T,
    /// The value immediately before the last accepted mutation, `None` when
    /// no prior value is known.
    pub previous: Option<T>,
}

/// Where a cell is in its one-shot initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// `init()` has not started.
    Uninitialized,
    /// `init()` is in flight.
    Initializing,
    /// The initial value has been published.
    Ready,
}

type ValidateFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type SubscriberFn<T> = Arc<dyn Fn(&T, Option<&T>) + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type InitFn<T> = Arc<dyn Fn(Option<T>, Option<T>, Cell<T>) -> BoxFuture + Send + Sync>;

/// Configuration for one cell, consumed by the facade constructors in
/// [`shape`](crate::shape).
///
/// Persistence and deduplication are off unless enabled; the validation
/// predicate and initializer default to identity behavior (always valid,
/// do nothing), so the engine never branches on their presence.
pub struct CellOptions<T> {
    pub(crate) name: String,
    pub(crate) default: T,
    pub(crate) persist: bool,
    pub(crate) dedup: bool,
    pub(crate) preference: BackendPreference,
    pub(crate) validate: Option<ValidateFn<T>>,
    pub(crate) initializer: Option<InitFn<T>>,
    pub(crate) resolver: Option<Arc<CapabilityResolver>>,
}

impl<T> CellOptions<T> {
    /// Options for a cell with the given name and default value.
    pub fn new(name: impl Into<String>, default: T) -> Self {
        Self {
            name: name.into(),
            default,
            persist: false,
            dedup: false,
            preference: BackendPreference::default(),
            validate: None,
            initializer: None,
            resolver: None,
        }
    }

    /// Write accepted mutations through to a storage backend.
    pub fn persist(mut self, on: bool) -> Self {
        self.persist = on;
        self
    }

    /// Silently drop mutations whose value equals the current one.
    pub fn dedup(mut self, on: bool) -> Self {
        self.dedup = on;
        self
    }

    /// Which backend to prefer when more than one is available.
    pub fn prefer(mut self, preference: BackendPreference) -> Self {
        self.preference = preference;
        self
    }

    /// Gate mutations (and acceptance of persisted values) on a predicate.
    pub fn validate(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.validate = Some(Arc::new(predicate));
        self
    }

    /// Run an async initializer after the initial value is published.
    ///
    /// The initializer receives the stored value that initialization
    /// accepted (`None` when the cell started from its default), the
    /// previous value, and a handle to the cell for `set`/`reset` calls.
    /// A failure is logged and swallowed; the cell stays usable.
    pub fn on_init<F, Fut>(mut self, initializer: F) -> Self
    where
        F: Fn(Option<T>, Option<T>, Cell<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.initializer = Some(Arc::new(move |value, previous, cell| {
            Box::pin(initializer(value, previous, cell))
        }));
        self
    }

    /// Use a specific capability resolver instead of the process-wide one.
    pub fn resolver(mut self, resolver: Arc<CapabilityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

struct CellState<T> {
    current: T,
    previous: Option<T>,
}

struct SubscriberSet<T> {
    next_id: u64,
    entries: Vec<(u64, SubscriberFn<T>)>,
}

struct CellInner<T> {
    name: String,
    default: T,
    persist: bool,
    dedup: bool,
    shape: Arc<dyn Shape<T>>,
    validate: ValidateFn<T>,
    initializer: Option<InitFn<T>>,
    router: PersistenceRouter,
    state: RwLock<CellState<T>>,
    lifecycle: RwLock<Lifecycle>,
    subscribers: Mutex<SubscriberSet<T>>,
    changes: WatchSender<T>,
    init_once: OnceCell<()>,
    pending_writes: AtomicUsize,
    writes_settled: Notify,
}

/// A reactive value cell. Cheap to clone; clones share state.
///
/// Construct through the facades: [`collection`](crate::shape::collection),
/// [`document`](crate::shape::document) or [`scalar`](crate::shape::scalar).
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell").field("name", &self.inner.name).finish()
    }
}

impl<T> Cell<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn with_shape(options: CellOptions<T>, shape: Arc<dyn Shape<T>>) -> Self {
        let persist = options.persist
            && match validate_name(&options.name) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "persistence disabled for this cell");
                    false
                }
            };

        let resolver = options.resolver.unwrap_or_else(CapabilityResolver::global);
        let cell = Self {
            inner: Arc::new(CellInner {
                router: PersistenceRouter::new(resolver, options.preference),
                name: options.name,
                state: RwLock::new(CellState {
                    current: options.default.clone(),
                    previous: None,
                }),
                default: options.default,
                persist,
                dedup: options.dedup,
                shape,
                validate: options.validate.unwrap_or_else(|| Arc::new(|_| true)),
                initializer: options.initializer,
                lifecycle: RwLock::new(Lifecycle::Uninitialized),
                subscribers: Mutex::new(SubscriberSet {
                    next_id: 0,
                    entries: Vec::new(),
                }),
                changes: WatchSender::new(64),
                init_once: OnceCell::new(),
                pending_writes: AtomicUsize::new(0),
                writes_settled: Notify::new(),
            }),
        };

        // Initialization starts in the background when a runtime is around;
        // otherwise the first explicit `init().await` runs it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let started = cell.clone();
            handle.spawn(async move { started.init().await });
        }

        cell
    }

    /// The cell's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Where the cell is in its initialization sequence.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.read()
    }

    /// The current value.
    pub fn get(&self) -> T {
        self.inner.state.read().current.clone()
    }

    /// Re-read the persisted pair from the backend, bypassing the in-memory
    /// value.
    ///
    /// Returns `None` when the record is absent, unreadable, inadmissible
    /// for this cell's shape, or the environment cannot host persistence.
    /// When persistence is disabled, returns the in-memory pair. Never
    /// mutates cell state.
    pub async fn get_value(&self) -> Option<ValuePair<T>> {
        if !self.inner.persist {
            let state = self.inner.state.read();
            return Some(ValuePair {
                value: state.current.clone(),
                previous: state.previous.clone(),
            });
        }
        let record = self.inner.router.read(&self.inner.name).await?;
        self.decode(&record)
    }

    /// Gated mutation.
    ///
    /// Silently dropped when deduplication is on and the value equals the
    /// current one under the cell's equality, or when the validation
    /// predicate rejects it. On acceptance the pair is updated, the
    /// write-through is scheduled, and subscribers are notified before this
    /// call returns.
    pub fn set(&self, value: T) {
        if self.inner.dedup {
            let state = self.inner.state.read();
            if self.inner.shape.equals(&value, &state.current) {
                debug!(cell = %self.inner.name, "duplicate value, mutation dropped");
                return;
            }
        }
        if !(self.inner.validate)(&value) {
            debug!(cell = %self.inner.name, "validation rejected mutation");
            return;
        }
        self.commit(value);
    }

    /// Compute the next value from an owned clone of the current one and
    /// feed it through [`set`](Self::set).
    ///
    /// The clone is independent of the cell, so mutating it inside the
    /// closure cannot corrupt state if the result is later rejected.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(T, Option<&T>) -> T,
    {
        let (current, previous) = {
            let state = self.inner.state.read();
            (state.current.clone(), state.previous.clone())
        };
        self.set(f(current, previous.as_ref()));
    }

    /// Unconditionally restore the default value, bypassing both gates.
    pub fn reset(&self) {
        self.commit(self.inner.default.clone());
    }

    /// Register a subscriber callback.
    ///
    /// The callback is invoked immediately with the current pair, then once
    /// per accepted mutation until the returned [`Subscription`] is
    /// unsubscribed. Safe to call before initialization completes; the
    /// replay reflects the default value until `init` publishes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T, Option<&T>) + Send + Sync + 'static,
    {
        let callback: SubscriberFn<T> = Arc::new(callback);
        let id = {
            let mut subscribers = self.inner.subscribers.lock();
            let id = subscribers.next_id;
            subscribers.next_id += 1;
            subscribers.entries.push((id, callback.clone()));
            id
        };

        let (value, previous) = {
            let state = self.inner.state.read();
            (state.current.clone(), state.previous.clone())
        };
        callback(&value, previous.as_ref());

        let inner = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner
                        .subscribers
                        .lock()
                        .entries
                        .retain(|(entry_id, _)| *entry_id != id);
                }
            }),
        }
    }

    /// Open a stream of subsequent change events.
    pub fn watch(&self) -> WatchStream<T> {
        self.inner.changes.subscribe()
    }

    /// Run the initialization sequence. Single-flight: concurrent and
    /// repeated calls await the one in-flight run; later calls return
    /// immediately.
    pub async fn init(&self) {
        let cell = self.clone();
        self.inner
            .init_once
            .get_or_init(|| async move { cell.run_init().await })
            .await;
    }

    /// Await completion of every in-flight write-through task.
    pub async fn flush(&self) {
        loop {
            let settled = self.inner.writes_settled.notified();
            tokio::pin!(settled);
            // Register before checking the counter so a task finishing in
            // between cannot drop the wakeup.
            settled.as_mut().enable();
            if self.inner.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            settled.await;
        }
    }

    async fn run_init(&self) {
        *self.inner.lifecycle.write() = Lifecycle::Initializing;

        let mut stored: Option<StoredRecord> = None;
        if self.inner.persist {
            let choice = self.inner.router.select().await;
            if let Some(backend) = choice.backend() {
                stored = backend.read(&self.inner.name).await;

                // Preferred backend came up empty: look for a record left in
                // the fallback store by an earlier process version.
                if stored.is_none() && choice.is_durable() {
                    let shape = self.inner.shape.clone();
                    let validate = self.inner.validate.clone();
                    let admit = move |record: &StoredRecord| {
                        if !shape.admits(&record.value) {
                            return false;
                        }
                        match serde_json::from_value::<T>(record.value.clone()) {
                            Ok(value) => validate(&value),
                            Err(_) => false,
                        }
                    };
                    stored = self
                        .inner
                        .router
                        .migrate_legacy(&self.inner.name, &admit)
                        .await;
                }
            }
        }

        let mut accepted: Option<T> = None;
        let mut stored_previous: Option<T> = None;
        if let Some(record) = &stored {
            if self.inner.shape.admits(&record.value) {
                if let Ok(value) = record.value_as::<T>() {
                    if (self.inner.validate)(&value) {
                        accepted = Some(value);
                    }
                }
            }
            stored_previous = record.previous_as();
        }

        let (value, previous) = {
            let mut state = self.inner.state.write();
            if let Some(value) = accepted.clone() {
                state.current = value;
            }
            if stored_previous.is_some() {
                state.previous = stored_previous;
            }
            (state.current.clone(), state.previous.clone())
        };

        *self.inner.lifecycle.write() = Lifecycle::Ready;
        self.broadcast(value, previous.clone());

        if let Some(initializer) = self.inner.initializer.clone() {
            if let Err(err) = initializer(accepted, previous, self.clone()).await {
                error!(cell = %self.inner.name, %err, "cell initializer failed");
            }
        }
    }

    fn commit(&self, value: T) {
        let (value, previous) = {
            let mut state = self.inner.state.write();
            let replaced = std::mem::replace(&mut state.current, value);
            state.previous = Some(replaced);
            (state.current.clone(), state.previous.clone())
        };
        self.write_through(&value, previous.as_ref());
        self.broadcast(value, previous);
    }

    fn write_through(&self, value: &T, previous: Option<&T>) {
        if !self.inner.persist {
            return;
        }
        let record = match StoredRecord::encode(value, previous) {
            Ok(record) => record,
            Err(err) => {
                warn!(cell = %self.inner.name, %err, "value not serializable, write-through skipped");
                return;
            }
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(cell = %self.inner.name, "no async runtime, write-through skipped");
            return;
        };

        self.inner.pending_writes.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        handle.spawn(async move {
            inner.router.write(&inner.name, record).await;
            if inner.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.writes_settled.notify_waiters();
            }
        });
    }

    fn broadcast(&self, value: T, previous: Option<T>) {
        // Snapshot outside the lock so callbacks may re-enter the cell.
        let callbacks: Vec<SubscriberFn<T>> = self
            .inner
            .subscribers
            .lock()
            .entries
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in &callbacks {
            callback(&value, previous.as_ref());
        }
        self.inner.changes.send(value, previous);
    }

    fn decode(&self, record: &StoredRecord) -> Option<ValuePair<T>> {
        if !self.inner.shape.admits(&record.value) {
            return None;
        }
        let value: T = record.value_as().ok()?;
        Some(ValuePair {
            value,
            previous: record.previous_as(),
        })
    }
}

/// Handle to one registered subscriber callback.
pub struct Subscription {
    cancel: Box<dyn FnOnce() + Send>,
}

impl Subscription {
    /// Remove exactly this callback registration. Dropping the subscription
    /// without calling this leaves the callback registered for the cell's
    /// lifetime.
    pub fn unsubscribe(self) {
        (self.cancel)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::router::StorageConfig;
    use crate::shape::{collection, scalar};
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_resolver() -> (TempDir, Arc<CapabilityResolver>) {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(CapabilityResolver::new(StorageConfig::at(dir.path())));
        (dir, resolver)
    }

    #[tokio::test]
    async fn test_default_value_and_lifecycle() {
        let cell = scalar(CellOptions::new("counter", 0i64));
        assert_eq!(cell.get(), 0);
        assert_eq!(cell.lifecycle(), Lifecycle::Uninitialized);

        cell.init().await;
        assert_eq!(cell.lifecycle(), Lifecycle::Ready);
        assert_eq!(cell.get(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_replays_current_pair() {
        let cell = scalar(CellOptions::new("counter", 0i64));
        cell.set(5);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v, p| sink.lock().push((*v, p.copied())));

        // Replay carries the pair from the last accepted mutation.
        assert_eq!(events.lock().as_slice(), &[(5, Some(0))]);
    }

    #[tokio::test]
    async fn test_broadcast_in_registration_order() {
        let cell = scalar(CellOptions::new("counter", 0i64));
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = order.clone();
        let _a = cell.subscribe(move |v, _| sink.lock().push(format!("a:{v}")));
        let sink = order.clone();
        let _b = cell.subscribe(move |v, _| sink.lock().push(format!("b:{v}")));

        order.lock().clear();
        cell.set(1);
        assert_eq!(order.lock().as_slice(), &["a:1".to_string(), "b:1".to_string()]);
    }

    #[tokio::test]
    async fn test_dedup_counter_scenario() {
        let cell = scalar(CellOptions::new("counter", 0i64).dedup(true));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v, p| sink.lock().push((*v, p.copied())));
        events.lock().clear();

        cell.set(0); // equal to current: zero broadcasts
        assert!(events.lock().is_empty());
        assert_eq!(cell.get(), 0);

        cell.set(5); // exactly one broadcast with (5, 0)
        assert_eq!(events.lock().as_slice(), &[(5, Some(0))]);
    }

    #[tokio::test]
    async fn test_dedup_collection_is_structural() {
        let cell = collection(CellOptions::new("tags", Vec::<String>::new()).dedup(true));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v: &Vec<String>, _| sink.lock().push(v.clone()));
        events.lock().clear();

        cell.set(vec!["a".into(), "b".into()]);
        cell.set(vec!["a".into(), "b".into()]); // structurally equal clone
        assert_eq!(events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_silently() {
        let cell = collection(
            CellOptions::new("tags", Vec::<String>::new()).validate(|tags| tags.len() <= 2),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v: &Vec<String>, _| sink.lock().push(v.clone()));
        events.lock().clear();

        cell.set(vec!["a".into(), "b".into(), "c".into()]);
        assert!(events.lock().is_empty());
        assert!(cell.get().is_empty());
    }

    #[tokio::test]
    async fn test_reset_bypasses_gates() {
        let cell = scalar(CellOptions::new("counter", 0i64).dedup(true).validate(|_| false));

        // Every set is rejected by the validator.
        cell.set(5);
        assert_eq!(cell.get(), 0);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v, p| sink.lock().push((*v, p.copied())));
        events.lock().clear();

        cell.reset();
        assert_eq!(cell.get(), 0);
        assert_eq!(events.lock().as_slice(), &[(0, Some(0))]);
    }

    #[tokio::test]
    async fn test_reset_records_previous() {
        let cell = scalar(CellOptions::new("counter", 0i64));
        cell.set(9);
        cell.reset();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v, p| sink.lock().push((*v, p.copied())));
        assert_eq!(events.lock().as_slice(), &[(0, Some(9))]);
    }

    #[tokio::test]
    async fn test_update_receives_independent_clone() {
        let cell = collection(CellOptions::new("tags", vec!["a".to_string()]));

        cell.update(|mut tags, previous| {
            assert!(previous.is_none());
            tags.push("b".into());
            tags
        });
        assert_eq!(cell.get(), vec!["a".to_string(), "b".to_string()]);

        // A rejected result leaves the cell untouched even though the
        // closure mutated its clone.
        let rejecting = collection(
            CellOptions::new("tags2", vec!["a".to_string()]).validate(|tags| tags.len() < 2),
        );
        rejecting.update(|mut tags, _| {
            tags.push("b".into());
            tags
        });
        assert_eq!(rejecting.get(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_exactly_that_callback() {
        let cell = scalar(CellOptions::new("counter", 0i64));

        let kept = Arc::new(Mutex::new(Vec::new()));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let sink = kept.clone();
        let _kept_sub = cell.subscribe(move |v, _| sink.lock().push(*v));
        let sink = dropped.clone();
        let dropped_sub = cell.subscribe(move |v, _| sink.lock().push(*v));

        dropped_sub.unsubscribe();
        cell.set(1);

        assert_eq!(kept.lock().as_slice(), &[0, 1]);
        assert_eq!(dropped.lock().as_slice(), &[0]);
    }

    #[tokio::test]
    async fn test_get_value_without_persistence_is_memory_pair() {
        let cell = scalar(CellOptions::new("counter", 0i64));
        cell.set(3);

        let pair = cell.get_value().await.unwrap();
        assert_eq!(pair.value, 3);
        assert_eq!(pair.previous, Some(0));
    }

    #[tokio::test]
    async fn test_tags_scenario_roundtrip() {
        let (_dir, resolver) = temp_resolver();
        let cell = collection(
            CellOptions::new("tags", Vec::<String>::new())
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;

        cell.set(vec!["a".into(), "b".into()]);
        assert_eq!(cell.get(), vec!["a".to_string(), "b".to_string()]);

        // A fresh subscriber immediately receives the pair of that mutation.
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v: &Vec<String>, p| {
            sink.lock().push((v.clone(), p.cloned()));
        });
        assert_eq!(
            events.lock().as_slice(),
            &[(
                vec!["a".to_string(), "b".to_string()],
                Some(Vec::<String>::new())
            )]
        );

        // Write ordering across rapid mutations is not guaranteed, so let
        // the first write settle before the next mutation.
        cell.flush().await;

        cell.reset();
        assert!(cell.get().is_empty());

        cell.flush().await;
        let pair = cell.get_value().await.unwrap();
        assert!(pair.value.is_empty());
        assert_eq!(pair.previous, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[tokio::test]
    async fn test_fresh_resolver_reads_persisted_value() {
        let dir = tempfile::tempdir().unwrap();

        {
            let resolver = Arc::new(CapabilityResolver::new(StorageConfig::at(dir.path())));
            let cell = scalar(
                CellOptions::new("counter", 0i64)
                    .persist(true)
                    .resolver(resolver),
            );
            cell.init().await;
            cell.set(42);
            cell.flush().await;
        }

        // Simulates a process restart: a new resolver over the same directory.
        let resolver = Arc::new(CapabilityResolver::new(StorageConfig::at(dir.path())));
        let cell = scalar(
            CellOptions::new("counter", 0i64)
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;
        assert_eq!(cell.get(), 42);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = cell.subscribe(move |v, p| sink.lock().push((*v, p.copied())));
        assert_eq!(events.lock().as_slice(), &[(42, Some(0))]);
    }

    #[tokio::test]
    async fn test_persisted_garbage_falls_back_to_default() {
        let (_dir, resolver) = temp_resolver();

        // A scalar was persisted where a collection now lives.
        let caps = resolver.resolve().await;
        caps.durable()
            .unwrap()
            .try_write(
                "tags",
                StoredRecord {
                    value: json!(5),
                    previous_value: None,
                },
            )
            .await
            .unwrap();

        let cell = collection(
            CellOptions::new("tags", vec!["default".to_string()])
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;
        assert_eq!(cell.get(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_persisted_value_failing_validation_falls_back() {
        let (_dir, resolver) = temp_resolver();

        let caps = resolver.resolve().await;
        caps.durable()
            .unwrap()
            .try_write(
                "counter",
                StoredRecord {
                    value: json!(-4),
                    previous_value: None,
                },
            )
            .await
            .unwrap();

        let cell = scalar(
            CellOptions::new("counter", 0i64)
                .persist(true)
                .validate(|v| *v >= 0)
                .resolver(resolver),
        );
        cell.init().await;
        assert_eq!(cell.get(), 0);
    }

    #[tokio::test]
    async fn test_migration_scenario() {
        let (_dir, resolver) = temp_resolver();

        // An earlier process version persisted "tags" in the local store.
        let caps = resolver.resolve().await;
        caps.local().unwrap().write_sync(
            "tags",
            StoredRecord {
                value: json!(["legacy"]),
                previous_value: None,
            },
        );

        let cell = collection(
            CellOptions::new("tags", Vec::<String>::new())
                .persist(true)
                .resolver(resolver.clone()),
        );
        cell.init().await;

        assert_eq!(cell.get(), vec!["legacy".to_string()]);

        // The durable store now owns the record; the fallback copy is gone.
        let durable = caps.durable().unwrap();
        let migrated = crate::backend::Backend::read(durable.as_ref(), "tags")
            .await
            .unwrap();
        assert_eq!(migrated.value, json!(["legacy"]));
        assert!(caps.local().unwrap().read_sync("tags").is_none());
    }

    #[tokio::test]
    async fn test_init_is_single_flight() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let cell = scalar(CellOptions::new("counter", 0i64).on_init(
            move |_, _, _| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        ));

        tokio::join!(cell.init(), cell.init());
        cell.init().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initializer_receives_stored_value_and_handle() {
        let (_dir, resolver) = temp_resolver();

        let caps = resolver.resolve().await;
        caps.durable()
            .unwrap()
            .try_write(
                "counter",
                StoredRecord {
                    value: json!(7),
                    previous_value: None,
                },
            )
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let cell = scalar(
            CellOptions::new("counter", 0i64)
                .persist(true)
                .resolver(resolver)
                .on_init(move |stored, _, handle: Cell<i64>| {
                    let sink = sink.clone();
                    async move {
                        *sink.lock() = stored;
                        handle.set(10);
                        Ok(())
                    }
                }),
        );
        cell.init().await;

        assert_eq!(*seen.lock(), Some(7));
        assert_eq!(cell.get(), 10);
    }

    #[tokio::test]
    async fn test_initializer_without_persistence_gets_no_stored_value() {
        let seen = Arc::new(Mutex::new(Some(99)));
        let sink = seen.clone();
        let cell = scalar(CellOptions::new("counter", 0i64).on_init(
            move |stored, _, _| {
                let sink = sink.clone();
                async move {
                    *sink.lock() = stored;
                    Ok(())
                }
            },
        ));
        cell.init().await;
        assert_eq!(*seen.lock(), None);
    }

    #[tokio::test]
    async fn test_initializer_failure_is_swallowed() {
        let cell = scalar(CellOptions::new("counter", 0i64).on_init(|_, _, _| async {
            Err(StoreError::initializer("backend fetch failed"))
        }));

        cell.init().await;
        assert_eq!(cell.lifecycle(), Lifecycle::Ready);

        // The cell stays usable.
        cell.set(1);
        assert_eq!(cell.get(), 1);
    }

    #[tokio::test]
    async fn test_flush_settles_detached_writes() {
        let (_dir, resolver) = temp_resolver();
        let cell = scalar(
            CellOptions::new("counter", 0i64)
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;

        cell.set(1);
        cell.flush().await;
        assert_eq!(cell.get_value().await.unwrap().value, 1);

        cell.set(2);
        cell.flush().await;

        let pair = cell.get_value().await.unwrap();
        assert_eq!(pair.value, 2);
        assert_eq!(pair.previous, Some(1));
    }

    #[tokio::test]
    async fn test_watch_stream_receives_mutations() {
        use tokio_stream::StreamExt;

        let cell = scalar(CellOptions::new("counter", 0i64));
        cell.init().await;

        let mut stream = cell.watch();
        cell.set(1);

        let event = stream.next().await.unwrap();
        assert_eq!(event.value, 1);
        assert_eq!(event.previous, Some(0));
    }

    #[tokio::test]
    async fn test_invalid_name_disables_persistence_only() {
        let (_dir, resolver) = temp_resolver();
        let cell = scalar(
            CellOptions::new("bad name", 0i64)
                .persist(true)
                .resolver(resolver.clone()),
        );
        cell.init().await;

        // The in-memory contract still holds.
        cell.set(5);
        cell.flush().await;
        assert_eq!(cell.get(), 5);

        // Nothing landed in any backend.
        let caps = resolver.resolve().await;
        assert!(caps.local().unwrap().read_sync("bad name").is_none());
    }

    #[tokio::test]
    async fn test_secure_platform_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let key = [3u8; crate::secure::KEY_BYTES];

        {
            let resolver = Arc::new(CapabilityResolver::new(
                StorageConfig::at(dir.path()).with_master_key(key),
            ));
            let cell = scalar(
                CellOptions::new("session", 0i64)
                    .persist(true)
                    .resolver(resolver),
            );
            cell.init().await;
            cell.set(77);
            cell.flush().await;
        }

        let resolver = Arc::new(CapabilityResolver::new(
            StorageConfig::at(dir.path()).with_master_key(key),
        ));
        let cell = scalar(
            CellOptions::new("session", 0i64)
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;
        assert_eq!(cell.get(), 77);

        // A resolver keyed differently cannot read the record back.
        let resolver = Arc::new(CapabilityResolver::new(
            StorageConfig::at(dir.path()).with_master_key([4u8; crate::secure::KEY_BYTES]),
        ));
        let cell = scalar(
            CellOptions::new("session", 0i64)
                .persist(true)
                .resolver(resolver),
        );
        cell.init().await;
        assert_eq!(cell.get(), 0);
    }
}
