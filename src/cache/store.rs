//! Stale-while-revalidate cache primitive over a durable key-value medium.
//!
//! `fetch` returns whatever is already persisted immediately, plus an
//! optional refresh future when the entry is missing or past its TTL. The
//! caller decides what to do with the refresh; a successful refresh is
//! persisted before it resolves. Medium failures and corrupt entries degrade
//! to cache misses, never errors.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::clock::{Clock, SystemClock};
use super::medium::StorageMedium;

/// A persisted cache entry: the value and when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub data: Value,
  /// Write time, epoch milliseconds.
  pub time: i64,
}

/// The pending half of a stale-while-revalidate fetch.
pub type Refresh = BoxFuture<'static, Result<Value, String>>;

/// Durable stale-while-revalidate cache.
pub struct OfflineStore<M: StorageMedium> {
  medium: Arc<M>,
  clock: Arc<dyn Clock>,
}

impl<M: StorageMedium> OfflineStore<M> {
  pub fn new(medium: M) -> Self {
    Self::with_clock(medium, Arc::new(SystemClock))
  }

  pub fn with_clock(medium: M, clock: Arc<dyn Clock>) -> Self {
    Self {
      medium: Arc::new(medium),
      clock,
    }
  }

  /// The last persisted entry for `key`, or None if never written.
  /// A failing read or corrupt entry is treated as a miss.
  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    let raw = match self.medium.get(key) {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(key, error = %e, "corrupt cache entry, treating as miss");
        None
      }
    }
  }

  /// Persist `value` under `key` with the current timestamp, replacing any
  /// prior entry. Best-effort: a failing write only logs.
  pub fn update(&self, key: &str, value: &Value) {
    let entry = CacheEntry {
      data: value.clone(),
      time: self.clock.now_millis(),
    };

    let raw = match serde_json::to_string(&entry) {
      Ok(raw) => raw,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize cache entry");
        return;
      }
    };

    if let Err(e) = self.medium.set(key, &raw) {
      warn!(key, error = %e, "cache write failed");
    }
  }

  /// Stale-while-revalidate read.
  ///
  /// Returns the persisted value (when any) immediately. When the entry is
  /// missing or older than `ttl`, the second element is a refresh future
  /// that runs `fetch_fn`, persists its result, and yields it. A `ttl` of
  /// None means entries never go stale: the refresh only happens on a true
  /// miss. Never fails synchronously; refresh failures surface through the
  /// returned future.
  pub fn fetch<F, Fut>(
    &self,
    key: &str,
    ttl: Option<Duration>,
    fetch_fn: F,
  ) -> (Option<Value>, Option<Refresh>)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, String>> + Send + 'static,
  {
    let entry = self.get(key);

    if let Some(entry) = &entry {
      let fresh = match ttl {
        Some(ttl) => entry.time + ttl.as_millis() as i64 >= self.clock.now_millis(),
        None => true,
      };
      if fresh {
        return (Some(entry.data.clone()), None);
      }
    }

    let cached = entry.map(|e| e.data);
    let store = self.clone();
    let key = key.to_string();
    let fut = fetch_fn();
    let refresh: Refresh = Box::pin(async move {
      let value = fut.await?;
      store.update(&key, &value);
      Ok(value)
    });

    (cached, Some(refresh))
  }
}

impl<M: StorageMedium> Clone for OfflineStore<M> {
  fn clone(&self) -> Self {
    Self {
      medium: Arc::clone(&self.medium),
      clock: Arc::clone(&self.clock),
    }
  }
}
