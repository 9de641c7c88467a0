//! tradewatch: offline-first reactive field cache.
//!
//! Lets many independent observers watch named, parameterized fields of a
//! remote entity. Each observer receives one merged snapshot
//! (data/loading/error) per observed field-set; duplicate watches of the
//! same field share a single backend fetch or subscription; stale values
//! refresh on a per-field TTL; and the latest known value is persisted to
//! durable local storage so the next session renders instantly offline.
//!
//! Layering, leaves first:
//!
//! - [`cache`]: the durable stale-while-revalidate primitive over a plain
//!   key-value medium (sqlite or in-memory).
//! - [`observe`]: the reactive field store, with refcounted field states,
//!   snapshot aggregation, pull/push acquisition behind [`FieldSource`].
//! - [`trader`]: the domain router supplying key/TTL/dispatch strategies
//!   over account and scoring backends.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tradewatch::{FieldDescriptor, OfflineStore, SqliteMedium, Trader};
//! # use tradewatch::{AccountService, ScoreService};
//!
//! # async fn example(account: Arc<dyn AccountService>, scores: Arc<dyn ScoreService>) {
//! let offline = OfflineStore::new(SqliteMedium::open().unwrap());
//! let trader = Trader::new("trader-1", vec![], account, scores, offline);
//!
//! let watch = trader.observe(&[FieldDescriptor::from("bio")], |snapshot| {
//!   println!("bio = {:?} (loading: {})", snapshot.data.get("bio"), snapshot.loading);
//! });
//! // ... later
//! watch.dispose();
//! # }
//! ```

pub mod cache;
pub mod field;
pub mod observe;
pub mod trader;

pub use cache::{
  CacheEntry, Clock, ManualClock, MemoryMedium, OfflineStore, Refresh, SqliteMedium,
  StorageMedium, SystemClock,
};
pub use field::FieldDescriptor;
pub use observe::{
  AcquireMode, FieldSource, FieldStore, PushFn, PushUpdate, Snapshot, Unsubscribe, WatchHandle,
};
pub use trader::{AccountService, ScoreService, ServiceResult, Trader, TraderDirectory};
