//! Domain field router for trader entities.
//!
//! This layer is deliberately dumb glue: it owns the field-key -> TTL table
//! and the field-key -> backend dispatch table, and extracts the sub-value
//! for a field key out of the backend's response shape. All caching and
//! concurrency live in the field store underneath.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::{OfflineStore, StorageMedium};
use crate::field::FieldDescriptor;
use crate::observe::{FieldSource, FieldStore, Snapshot, WatchHandle};

/// Backend calls resolve loosely-shaped JSON.
pub type ServiceResult = BoxFuture<'static, Result<Value, String>>;

/// Account-side backend: profile data and account writes.
pub trait AccountService: Send + Sync + 'static {
  /// Whole trader profile.
  fn get_user(&self, id: &str) -> ServiceResult;

  /// Selected account-side fields of one trader. The response is an object
  /// with one member per requested field key.
  fn get_user_data(&self, id: &str, fields: &[FieldDescriptor]) -> ServiceResult;

  fn update_user(&self, data: Value) -> ServiceResult;
  fn add_exchange_key(&self, data: Value) -> ServiceResult;
  fn delete_exchange_key(&self, data: Value) -> ServiceResult;
}

/// Scoring-side backend.
pub trait ScoreService: Send + Sync + 'static {
  /// Selected scoring-side fields of one trader, same response shape as
  /// `AccountService::get_user_data`.
  fn get_trader_data(&self, id: &str, fields: &[FieldDescriptor]) -> ServiceResult;
}

const SCORE_FIELDS: &[&str] = &["scores", "score", "rank"];
const ACCOUNT_FIELDS: &[&str] = &["bio", "website", "exchange_keys"];

/// How long each field's cached value stays fresh.
fn field_ttl(key: &str) -> Option<Duration> {
  match key {
    "bio" | "website" => Some(Duration::from_secs(2 * 60 * 60)),
    "exchange_keys" => Some(Duration::from_secs(30)),
    "score" | "rank" | "scores" => Some(Duration::from_secs(60)),
    _ => None,
  }
}

/// Field strategies for one trader: TTL table plus backend dispatch.
struct TraderSource {
  id: String,
  account: Arc<dyn AccountService>,
  scores: Arc<dyn ScoreService>,
}

impl FieldSource for TraderSource {
  fn ttl(&self, field: &FieldDescriptor) -> Option<Duration> {
    field_ttl(field.field_key())
  }

  fn fetch(&self, field: &FieldDescriptor) -> Option<BoxFuture<'static, Result<Value, String>>> {
    let key = field.field_key().to_string();
    let field = field.clone();
    let id = self.id.clone();

    if SCORE_FIELDS.contains(&key.as_str()) {
      let scores = Arc::clone(&self.scores);
      return Some(Box::pin(async move {
        let rsp = scores
          .get_trader_data(&id, std::slice::from_ref(&field))
          .await?;
        Ok(rsp.get(key.as_str()).cloned().unwrap_or(Value::Null))
      }));
    }

    if ACCOUNT_FIELDS.contains(&key.as_str()) {
      let account = Arc::clone(&self.account);
      return Some(Box::pin(async move {
        let rsp = account
          .get_user_data(&id, std::slice::from_ref(&field))
          .await?;
        Ok(rsp.get(key.as_str()).cloned().unwrap_or(Value::Null))
      }));
    }

    Some(Box::pin(async { Ok(Value::Null) }))
  }
}

/// One trader entity with observable fields and pass-through writes.
pub struct Trader<M: StorageMedium> {
  id: String,
  roles: Vec<String>,
  account: Arc<dyn AccountService>,
  store: FieldStore<M>,
}

impl<M: StorageMedium> Trader<M> {
  pub fn new(
    id: impl Into<String>,
    roles: Vec<String>,
    account: Arc<dyn AccountService>,
    scores: Arc<dyn ScoreService>,
    offline: OfflineStore<M>,
  ) -> Self {
    let id = id.into();
    let source = TraderSource {
      id: id.clone(),
      account: Arc::clone(&account),
      scores,
    };

    Self {
      id,
      roles,
      account,
      store: FieldStore::new(source, offline),
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn roles(&self) -> &[String] {
    &self.roles
  }

  /// Watch a set of fields; merged snapshots arrive on the callback. See
  /// `FieldStore::observe`.
  pub fn observe(
    &self,
    fields: &[FieldDescriptor],
    callback: impl Fn(Snapshot) + Send + Sync + 'static,
  ) -> WatchHandle {
    self.store.observe(fields, callback)
  }

  // Writes bypass the cache and resolve straight from the backend.

  pub async fn update(&self, data: Value) -> Result<Value, String> {
    self.account.update_user(data).await
  }

  pub async fn add_exchange_key(&self, data: Value) -> Result<Value, String> {
    self.account.add_exchange_key(data).await
  }

  pub async fn delete_exchange_key(&self, data: Value) -> Result<Value, String> {
    self.account.delete_exchange_key(data).await
  }
}

const PROFILE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Whole-profile lookups with offline fallback.
pub struct TraderDirectory<M: StorageMedium> {
  account: Arc<dyn AccountService>,
  offline: OfflineStore<M>,
}

impl<M: StorageMedium> TraderDirectory<M> {
  pub fn new(account: Arc<dyn AccountService>, offline: OfflineStore<M>) -> Self {
    Self { account, offline }
  }

  /// Fetch a trader's profile, serving the persisted copy when it is fresh
  /// or when the refresh fails. None only when nothing was ever cached and
  /// the backend is unreachable.
  pub async fn get_trader(&self, id: &str) -> Option<Value> {
    let key = format!("trader-{id}");
    let account = Arc::clone(&self.account);
    let id = id.to_string();

    let (cached, refresh) = self
      .offline
      .fetch(&key, Some(PROFILE_TTL), move || account.get_user(&id));

    match refresh {
      None => cached,
      Some(refresh) => match refresh.await {
        Ok(value) => Some(value),
        Err(error) => {
          debug!(%error, "profile refresh failed, serving cached value");
          cached
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ManualClock, MemoryMedium};
  use serde_json::json;
  use std::collections::BTreeMap;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use tokio::sync::mpsc;
  use tokio::time::timeout;

  struct MockAccount {
    user_result: Mutex<Result<Value, String>>,
    user_calls: AtomicUsize,
    user_data_result: Mutex<Result<Value, String>>,
    user_data_calls: Mutex<Vec<(String, Vec<FieldDescriptor>)>>,
    write_result: Mutex<Result<Value, String>>,
    write_calls: Mutex<Vec<(&'static str, Value)>>,
  }

  impl MockAccount {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        user_result: Mutex::new(Ok(Value::Null)),
        user_calls: AtomicUsize::new(0),
        user_data_result: Mutex::new(Ok(Value::Null)),
        user_data_calls: Mutex::new(Vec::new()),
        write_result: Mutex::new(Ok(Value::Null)),
        write_calls: Mutex::new(Vec::new()),
      })
    }

    fn set_user_data(&self, rsp: Value) {
      *self.user_data_result.lock().unwrap() = Ok(rsp);
    }
  }

  impl AccountService for MockAccount {
    fn get_user(&self, _id: &str) -> ServiceResult {
      self.user_calls.fetch_add(1, Ordering::SeqCst);
      let result = self.user_result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }

    fn get_user_data(&self, id: &str, fields: &[FieldDescriptor]) -> ServiceResult {
      self
        .user_data_calls
        .lock()
        .unwrap()
        .push((id.to_string(), fields.to_vec()));
      let result = self.user_data_result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }

    fn update_user(&self, data: Value) -> ServiceResult {
      self.write_calls.lock().unwrap().push(("update_user", data));
      let result = self.write_result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }

    fn add_exchange_key(&self, data: Value) -> ServiceResult {
      self
        .write_calls
        .lock()
        .unwrap()
        .push(("add_exchange_key", data));
      let result = self.write_result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }

    fn delete_exchange_key(&self, data: Value) -> ServiceResult {
      self
        .write_calls
        .lock()
        .unwrap()
        .push(("delete_exchange_key", data));
      let result = self.write_result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }
  }

  struct MockScores {
    result: Mutex<Result<Value, String>>,
    calls: Mutex<Vec<(String, Vec<FieldDescriptor>)>>,
  }

  impl MockScores {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        result: Mutex::new(Ok(Value::Null)),
        calls: Mutex::new(Vec::new()),
      })
    }
  }

  impl ScoreService for MockScores {
    fn get_trader_data(&self, id: &str, fields: &[FieldDescriptor]) -> ServiceResult {
      self
        .calls
        .lock()
        .unwrap()
        .push((id.to_string(), fields.to_vec()));
      let result = self.result.lock().unwrap().clone();
      Box::pin(futures::future::ready(result))
    }
  }

  fn source(account: &Arc<MockAccount>, scores: &Arc<MockScores>) -> TraderSource {
    TraderSource {
      id: "test123".to_string(),
      account: account.clone(),
      scores: scores.clone(),
    }
  }

  fn trader(account: &Arc<MockAccount>, scores: &Arc<MockScores>) -> Trader<MemoryMedium> {
    Trader::new(
      "test123",
      vec!["test1".to_string(), "test2".to_string()],
      account.clone(),
      scores.clone(),
      OfflineStore::new(MemoryMedium::new()),
    )
  }

  // ==========================================================================
  // TTL table
  // ==========================================================================

  #[test]
  fn ttl_table() {
    let two_hours = Some(Duration::from_secs(2 * 60 * 60));
    assert_eq!(field_ttl("bio"), two_hours);
    assert_eq!(field_ttl("website"), two_hours);
    assert_eq!(field_ttl("exchange_keys"), Some(Duration::from_secs(30)));
    assert_eq!(field_ttl("score"), Some(Duration::from_secs(60)));
    assert_eq!(field_ttl("rank"), Some(Duration::from_secs(60)));
    assert_eq!(field_ttl("scores"), Some(Duration::from_secs(60)));
    assert_eq!(field_ttl("unknown"), None);
  }

  // ==========================================================================
  // Fetch dispatch
  // ==========================================================================

  #[tokio::test]
  async fn fetches_bio_from_account_service() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    account.set_user_data(json!({ "bio": "this is my bio" }));

    let field = FieldDescriptor::from("bio");
    let value = source(&account, &scores).fetch(&field).unwrap().await.unwrap();

    assert_eq!(value, json!("this is my bio"));
    let calls = account.user_data_calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[("test123".to_string(), vec![field])]);
    assert!(scores.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn fetches_exchange_keys_from_account_service() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    account.set_user_data(json!({ "exchange_keys": [{ "test": 1 }, { "test": 2 }] }));

    let field = FieldDescriptor::from("exchange_keys");
    let value = source(&account, &scores).fetch(&field).unwrap().await.unwrap();

    assert_eq!(value, json!([{ "test": 1 }, { "test": 2 }]));
  }

  #[tokio::test]
  async fn fetches_score_from_score_service() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    *scores.result.lock().unwrap() = Ok(json!({ "score": 123 }));

    let field = FieldDescriptor::from("score");
    let value = source(&account, &scores).fetch(&field).unwrap().await.unwrap();

    assert_eq!(value, json!(123));
    let calls = scores.calls.lock().unwrap();
    assert_eq!(calls.as_slice(), &[("test123".to_string(), vec![field])]);
    assert!(account.user_data_calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn fetches_parameterized_scores_from_score_service() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    *scores.result.lock().unwrap() = Ok(json!({ "scores": [123] }));

    let mut params = BTreeMap::new();
    params.insert("period".to_string(), json!("day"));
    params.insert("duration".to_string(), json!(86_400_000));
    let field = FieldDescriptor::keyed("scores", params);

    let value = source(&account, &scores).fetch(&field).unwrap().await.unwrap();
    assert_eq!(value, json!([123]));

    let calls = scores.calls.lock().unwrap();
    assert_eq!(calls[0].1, vec![field]);
  }

  #[tokio::test]
  async fn unknown_field_resolves_null_without_backend_calls() {
    let account = MockAccount::new();
    let scores = MockScores::new();

    let field = FieldDescriptor::from("nonsense");
    let value = source(&account, &scores).fetch(&field).unwrap().await.unwrap();

    assert_eq!(value, Value::Null);
    assert!(account.user_data_calls.lock().unwrap().is_empty());
    assert!(scores.calls.lock().unwrap().is_empty());
  }

  // ==========================================================================
  // Pass-through writes
  // ==========================================================================

  #[tokio::test]
  async fn update_forwards_to_account_service() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    *account.write_result.lock().unwrap() = Ok(json!({ "ok": true }));

    let rsp = trader(&account, &scores)
      .update(json!({ "bio": "test" }))
      .await
      .unwrap();

    assert_eq!(rsp, json!({ "ok": true }));
    let calls = account.write_calls.lock().unwrap();
    assert_eq!(
      calls.as_slice(),
      &[("update_user", json!({ "bio": "test" }))]
    );
  }

  #[tokio::test]
  async fn write_errors_propagate() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    *account.write_result.lock().unwrap() = Err("test".to_string());

    let trader = trader(&account, &scores);
    assert_eq!(trader.update(json!({})).await.unwrap_err(), "test");
    assert_eq!(trader.add_exchange_key(json!({})).await.unwrap_err(), "test");
    assert_eq!(
      trader.delete_exchange_key(json!({})).await.unwrap_err(),
      "test"
    );
  }

  #[tokio::test]
  async fn exchange_key_writes_forward() {
    let account = MockAccount::new();
    let scores = MockScores::new();

    let trader = trader(&account, &scores);
    trader.add_exchange_key(json!({ "k": 1 })).await.unwrap();
    trader.delete_exchange_key(json!({ "k": 1 })).await.unwrap();

    let calls = account.write_calls.lock().unwrap();
    assert_eq!(calls[0].0, "add_exchange_key");
    assert_eq!(calls[1].0, "delete_exchange_key");
  }

  // ==========================================================================
  // Observation through the field store
  // ==========================================================================

  #[tokio::test]
  async fn observe_delivers_fetched_bio() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    account.set_user_data(json!({ "bio": "this is my bio" }));

    let trader = trader(&account, &scores);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = trader.observe(&[FieldDescriptor::from("bio")], move |snapshot| {
      let _ = tx.send(snapshot);
    });

    let snapshot = timeout(Duration::from_secs(5), async {
      loop {
        let snapshot = rx.recv().await.expect("channel closed");
        if snapshot.data.get("bio") == Some(&json!("this is my bio")) && !snapshot.loading {
          return snapshot;
        }
      }
    })
    .await
    .expect("snapshot never arrived");

    assert!(snapshot.error.is_none());
  }

  #[tokio::test]
  async fn second_trader_over_same_medium_serves_cached_bio() {
    let account = MockAccount::new();
    let scores = MockScores::new();
    account.set_user_data(json!({ "bio": "cached bio" }));

    let offline = OfflineStore::new(MemoryMedium::new());
    let first = Trader::new(
      "test123",
      vec![],
      account.clone(),
      scores.clone(),
      offline.clone(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _h1 = first.observe(&[FieldDescriptor::from("bio")], move |snapshot| {
      let _ = tx.send(snapshot);
    });
    timeout(Duration::from_secs(5), async {
      loop {
        let snapshot = rx.recv().await.expect("channel closed");
        if snapshot.data.get("bio") == Some(&json!("cached bio")) && !snapshot.loading {
          return;
        }
      }
    })
    .await
    .unwrap();

    let before = account.user_data_calls.lock().unwrap().len();

    // Same medium, fresh entry: the second session renders offline.
    let second = Trader::new("test123", vec![], account.clone(), scores.clone(), offline);
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let _h2 = second.observe(&[FieldDescriptor::from("bio")], move |snapshot| {
      let _ = tx2.send(snapshot);
    });
    timeout(Duration::from_secs(5), async {
      loop {
        let snapshot = rx2.recv().await.expect("channel closed");
        if snapshot.data.get("bio") == Some(&json!("cached bio")) && !snapshot.loading {
          return;
        }
      }
    })
    .await
    .unwrap();

    assert_eq!(account.user_data_calls.lock().unwrap().len(), before);
  }

  // ==========================================================================
  // TraderDirectory
  // ==========================================================================

  #[tokio::test]
  async fn directory_fetches_and_persists_profiles() {
    let account = MockAccount::new();
    *account.user_result.lock().unwrap() = Ok(json!({ "id": "test123", "bio": "hi" }));

    let directory = TraderDirectory::new(
      account.clone() as Arc<dyn AccountService>,
      OfflineStore::new(MemoryMedium::new()),
    );

    let profile = directory.get_trader("test123").await.unwrap();
    assert_eq!(profile, json!({ "id": "test123", "bio": "hi" }));
    assert_eq!(account.user_calls.load(Ordering::SeqCst), 1);

    // Fresh cache: no second backend call.
    let profile = directory.get_trader("test123").await.unwrap();
    assert_eq!(profile, json!({ "id": "test123", "bio": "hi" }));
    assert_eq!(account.user_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn directory_serves_stale_profile_when_refresh_fails() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let account = MockAccount::new();
    *account.user_result.lock().unwrap() = Ok(json!({ "bio": "old" }));

    let directory = TraderDirectory::new(
      account.clone() as Arc<dyn AccountService>,
      OfflineStore::with_clock(MemoryMedium::new(), clock.clone()),
    );

    directory.get_trader("test123").await.unwrap();

    clock.advance(Duration::from_secs(25 * 60 * 60));
    *account.user_result.lock().unwrap() = Err("offline".to_string());

    let profile = directory.get_trader("test123").await;
    assert_eq!(profile, Some(json!({ "bio": "old" })));
  }

  #[tokio::test]
  async fn directory_returns_none_when_nothing_cached_and_backend_fails() {
    let account = MockAccount::new();
    *account.user_result.lock().unwrap() = Err("offline".to_string());

    let directory = TraderDirectory::new(
      account.clone() as Arc<dyn AccountService>,
      OfflineStore::new(MemoryMedium::new()),
    );

    assert_eq!(directory.get_trader("test123").await, None);
  }
}
