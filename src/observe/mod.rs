//! Reactive field store: refcounted field watches, merged snapshots, and
//! TTL- or push-driven refresh behind one interface.

mod snapshot;
mod store;

pub use snapshot::Snapshot;
pub use store::{
  AcquireMode, FieldSource, FieldStore, PushFn, PushUpdate, Unsubscribe, WatchHandle,
};
