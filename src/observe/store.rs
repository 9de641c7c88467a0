//! The reactive field store.
//!
//! Keeps one refcounted `FieldState` per distinct descriptor, multiplexes
//! any number of observers over it, and drives refresh either by a TTL
//! interval (pull mode) or a long-lived subscription (push mode). Observers
//! receive merged snapshots recomputed on every constituent change.
//!
//! All field-state mutation is funneled through a single registry mutex;
//! callbacks, subscriptions, and fetch futures run outside it. Work that
//! resumes after an await re-checks that its field state still exists, so
//! disposal is advisory cancellation for in-flight refreshes while interval
//! tasks and subscriptions are torn down eagerly.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::snapshot::{combine_errors, Snapshot};
use crate::cache::{OfflineStore, StorageMedium};
use crate::field::FieldDescriptor;

/// How a source delivers field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
  /// Periodic fetches driven by each field's TTL.
  Pull,
  /// A long-lived subscription pushing updates.
  Push,
}

/// Partial update delivered by a push subscription. Only the members that
/// are present are applied to the field state.
#[derive(Debug, Clone, Default)]
pub struct PushUpdate {
  pub data: Option<Value>,
  pub loading: Option<bool>,
  pub error: Option<String>,
}

/// Callback handed to `FieldSource::subscribe` for delivering push updates.
pub type PushFn = Arc<dyn Fn(PushUpdate) + Send + Sync>;

/// Teardown function returned by `FieldSource::subscribe`.
pub type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Domain strategies: how to key, expire, and acquire each field.
///
/// A source is pull-only or push-only, declared by `mode`. Pull sources
/// implement `fetch`; push sources implement `subscribe`.
pub trait FieldSource: Send + Sync + 'static {
  /// Label under which the field's value appears in snapshots.
  fn field_key(&self, field: &FieldDescriptor) -> String {
    field.field_key().to_string()
  }

  /// How long a cached value stays fresh. None means it never goes stale
  /// and no refresh timer runs.
  fn ttl(&self, field: &FieldDescriptor) -> Option<Duration>;

  fn mode(&self) -> AcquireMode {
    AcquireMode::Pull
  }

  /// Pull acquisition: resolve the field's current value.
  fn fetch(&self, _field: &FieldDescriptor) -> Option<BoxFuture<'static, Result<Value, String>>> {
    None
  }

  /// Push acquisition: start a subscription delivering updates to `push`.
  fn subscribe(&self, _field: &FieldDescriptor, _push: PushFn) -> Option<Unsubscribe> {
    None
  }
}

type ObserveFn = Arc<dyn Fn(Snapshot) + Send + Sync>;
type ObserverId = u64;

/// What keeps a field's data flowing while it has observers.
enum RefreshDriver {
  /// TTL interval task (pull mode).
  Timer(tokio::task::JoinHandle<()>),
  /// Subscription teardown (push mode). Taken on dispose.
  Push(Option<Unsubscribe>),
}

/// In-memory record for one canonical descriptor.
struct FieldState {
  data: Option<Value>,
  loading: bool,
  error: Option<String>,
  observer_count: usize,
  driver: Option<RefreshDriver>,
  /// Monotonic refresh sequence; completions of superseded refreshes are
  /// discarded so an older fetch can never overwrite a newer value.
  refresh_seq: u64,
  /// True from push-mode seeding until the first push payload arrives.
  first_push_pending: bool,
}

impl FieldState {
  fn new() -> Self {
    Self {
      data: None,
      loading: false,
      error: None,
      observer_count: 0,
      driver: None,
      refresh_seq: 0,
      first_push_pending: false,
    }
  }
}

struct Observer {
  /// Descriptors with their precomputed cache hashes, in request order.
  fields: Vec<(String, FieldDescriptor)>,
  callback: ObserveFn,
}

#[derive(Default)]
struct Registry {
  fields: HashMap<String, FieldState>,
  observers: HashMap<ObserverId, Observer>,
  /// Reverse index: cache hash -> observers whose snapshot includes it.
  watchers: HashMap<String, HashSet<ObserverId>>,
}

struct Inner<M: StorageMedium> {
  source: Arc<dyn FieldSource>,
  offline: OfflineStore<M>,
  registry: Mutex<Registry>,
  next_observer: AtomicU64,
}

/// Reactive field store multiplexing observers over shared field states.
///
/// Requires a tokio runtime: `observe` spawns refresh tasks.
pub struct FieldStore<M: StorageMedium> {
  inner: Arc<Inner<M>>,
}

impl<M: StorageMedium> Clone for FieldStore<M> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Handle returned by `observe`. Disposing it (explicitly or by drop)
/// releases every field registration it holds; disposing twice is a no-op.
pub struct WatchHandle {
  teardown: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl WatchHandle {
  fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
    Self {
      teardown: Mutex::new(Some(Box::new(teardown))),
    }
  }

  /// Stop observing. Idempotent: the teardown runs at most once.
  pub fn dispose(&self) {
    let teardown = self
      .teardown
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(teardown) = teardown {
      teardown();
    }
  }
}

impl Drop for WatchHandle {
  fn drop(&mut self) {
    self.dispose();
  }
}

impl<M: StorageMedium> FieldStore<M> {
  pub fn new(source: impl FieldSource, offline: OfflineStore<M>) -> Self {
    Self {
      inner: Arc::new(Inner {
        source: Arc::new(source),
        offline,
        registry: Mutex::new(Registry::default()),
        next_observer: AtomicU64::new(0),
      }),
    }
  }

  /// Watch a set of fields. The callback receives the current best-known
  /// snapshot once during setup and again on every subsequent change to any
  /// constituent field. Duplicate watches of the same canonical descriptor
  /// share one backend fetch or subscription.
  pub fn observe(
    &self,
    fields: &[FieldDescriptor],
    callback: impl Fn(Snapshot) + Send + Sync + 'static,
  ) -> WatchHandle {
    let callback: ObserveFn = Arc::new(callback);
    let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
    let keyed: Vec<(String, FieldDescriptor)> = fields
      .iter()
      .map(|field| (field.cache_hash(), field.clone()))
      .collect();

    for (hash, field) in &keyed {
      self.register_field_watch(hash, field);
    }

    {
      let mut registry = self.registry();
      for (hash, _) in &keyed {
        registry.watchers.entry(hash.clone()).or_default().insert(id);
      }
      registry.observers.insert(
        id,
        Observer {
          fields: keyed.clone(),
          callback: callback.clone(),
        },
      );
    }
    debug!(observer = id, fields = keyed.len(), "observer registered");

    // Current best-known state; first render need not wait for the network.
    let initial = {
      let registry = self.registry();
      self.snapshot_locked(&registry, &keyed)
    };
    callback(initial);

    let store = self.clone();
    WatchHandle::new(move || store.dispose_observer(id))
  }

  fn registry(&self) -> MutexGuard<'_, Registry> {
    self
      .inner
      .registry
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  fn register_field_watch(&self, hash: &str, field: &FieldDescriptor) {
    let became_first = {
      let mut registry = self.registry();
      let state = registry
        .fields
        .entry(hash.to_string())
        .or_insert_with(FieldState::new);
      state.observer_count += 1;
      state.observer_count == 1
    };

    match self.inner.source.mode() {
      AcquireMode::Push => {
        if became_first {
          self.start_subscription(hash, field);
        }
      }
      AcquireMode::Pull => {
        if became_first {
          if let Some(ttl) = self.inner.source.ttl(field) {
            self.start_interval(hash, field, ttl);
          }
        }
        // Every registration triggers an immediate refresh.
        let store = self.clone();
        let hash = hash.to_string();
        let field = field.clone();
        tokio::spawn(async move {
          store.update_field(&hash, &field).await;
        });
      }
    }
  }

  fn start_interval(&self, hash: &str, field: &FieldDescriptor, ttl: Duration) {
    let store = self.clone();
    let task_hash = hash.to_string();
    let task_field = field.clone();
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(ttl);
      // The first tick completes immediately; registration already fetched.
      interval.tick().await;
      loop {
        interval.tick().await;
        store.update_field(&task_hash, &task_field).await;
      }
    });

    let mut registry = self.registry();
    match registry.fields.get_mut(hash) {
      Some(state) => state.driver = Some(RefreshDriver::Timer(handle)),
      // Disposed before we got here; stop the timer again.
      None => handle.abort(),
    }
  }

  fn start_subscription(&self, hash: &str, field: &FieldDescriptor) {
    // Seed from the durable cache; loading until the first push arrives.
    let seed = self.inner.offline.get(hash);
    {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };
      if state.data.is_none() {
        state.data = seed.map(|entry| entry.data);
      }
      state.loading = true;
      state.first_push_pending = true;
    }
    self.notify(hash);

    let push: PushFn = {
      let store = self.clone();
      let hash = hash.to_string();
      Arc::new(move |update| store.apply_push(&hash, update))
    };

    match self.inner.source.subscribe(field, push) {
      Some(unsubscribe) => {
        let mut registry = self.registry();
        match registry.fields.get_mut(hash) {
          Some(state) => state.driver = Some(RefreshDriver::Push(Some(unsubscribe))),
          // Disposed while the subscription was starting.
          None => {
            drop(registry);
            unsubscribe();
          }
        }
      }
      None => warn!(hash, "push source returned no subscription"),
    }
  }

  /// Apply a push payload. Only defined members overwrite state; the first
  /// payload clears the seeded loading flag; data is persisted so the next
  /// cold start has a recent value.
  fn apply_push(&self, hash: &str, update: PushUpdate) {
    trace!(hash, "push payload");
    {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };

      if state.first_push_pending {
        state.first_push_pending = false;
        state.loading = false;
      }

      if let Some(data) = update.data {
        self.inner.offline.update(hash, &data);
        state.data = Some(data);
      }
      if let Some(loading) = update.loading {
        state.loading = loading;
      }
      if let Some(error) = update.error {
        state.error = Some(error);
      }
    }
    self.notify(hash);
  }

  /// Pull-mode refresh: serve the cached value immediately, then apply the
  /// refetched value unless the field was disposed or a newer refresh has
  /// superseded this one in the meantime.
  async fn update_field(&self, hash: &str, field: &FieldDescriptor) {
    let Some(fetch) = self.inner.source.fetch(field) else {
      return;
    };
    let ttl = self.inner.source.ttl(field);

    let seq = {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };
      state.refresh_seq += 1;
      state.refresh_seq
    };

    let (cached, refresh) = self.inner.offline.fetch(hash, ttl, move || fetch);

    {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };
      state.loading = true;
      if cached.is_some() {
        state.data = cached;
      }
    }
    self.notify(hash);

    let result = match refresh {
      Some(refresh) => Some(refresh.await),
      None => None,
    };

    {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };
      if state.refresh_seq != seq {
        debug!(hash, seq, "discarding superseded refresh");
        return;
      }
      match result {
        Some(Ok(value)) => {
          state.data = Some(value);
          state.error = None;
        }
        Some(Err(message)) => {
          debug!(hash, %message, "field refresh failed");
          state.error = Some(message);
        }
        // Cache was fresh; nothing to apply.
        None => {}
      }
      state.loading = false;
    }
    self.notify(hash);
  }

  /// Recompute and deliver snapshots for every observer watching `hash`.
  /// Callbacks run outside the registry lock.
  fn notify(&self, hash: &str) {
    let deliveries: Vec<(ObserveFn, Snapshot)> = {
      let registry = self.registry();
      let Some(ids) = registry.watchers.get(hash) else {
        return;
      };
      ids
        .iter()
        .filter_map(|id| registry.observers.get(id))
        .map(|observer| {
          (
            observer.callback.clone(),
            self.snapshot_locked(&registry, &observer.fields),
          )
        })
        .collect()
    };

    for (callback, snapshot) in deliveries {
      callback(snapshot);
    }
  }

  fn snapshot_locked(&self, registry: &Registry, fields: &[(String, FieldDescriptor)]) -> Snapshot {
    let mut snapshot = Snapshot::default();
    let mut errors = Vec::new();

    for (hash, field) in fields {
      let Some(state) = registry.fields.get(hash) else {
        continue;
      };
      if let Some(data) = &state.data {
        snapshot
          .data
          .insert(self.inner.source.field_key(field), data.clone());
      }
      if state.loading {
        snapshot.loading = true;
      }
      if let Some(error) = &state.error {
        errors.push(error.clone());
      }
    }

    snapshot.error = combine_errors(&errors);
    snapshot
  }

  fn dispose_observer(&self, id: ObserverId) {
    let observer = {
      let mut registry = self.registry();
      let Some(observer) = registry.observers.remove(&id) else {
        return;
      };
      for (hash, _) in &observer.fields {
        if let Some(ids) = registry.watchers.get_mut(hash) {
          ids.remove(&id);
          if ids.is_empty() {
            registry.watchers.remove(hash);
          }
        }
      }
      observer
    };

    for (hash, _) in &observer.fields {
      self.release_field(hash);
    }
    debug!(observer = id, "observer disposed");
  }

  fn release_field(&self, hash: &str) {
    let driver = {
      let mut registry = self.registry();
      let Some(state) = registry.fields.get_mut(hash) else {
        return;
      };
      state.observer_count = state.observer_count.saturating_sub(1);
      if state.observer_count > 0 {
        return;
      }
      // Last observer gone: the in-memory state is deleted entirely. The
      // durable entry stays so it can seed the next session.
      registry.fields.remove(hash).and_then(|state| state.driver)
    };

    match driver {
      Some(RefreshDriver::Timer(handle)) => handle.abort(),
      Some(RefreshDriver::Push(unsubscribe)) => {
        if let Some(unsubscribe) = unsubscribe {
          unsubscribe();
        }
      }
      None => {}
    }
  }
}
