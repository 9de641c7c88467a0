//! Durable stale-while-revalidate cache over a synchronous key-value medium.
//!
//! This module provides the offline half of the crate:
//! - a `StorageMedium` trait with sqlite and in-memory implementations
//! - an `OfflineStore` that returns the last persisted value immediately and
//!   refreshes it in the background once past its TTL
//! - a `Clock` trait so staleness is testable against simulated time

mod clock;
mod medium;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use medium::{MemoryMedium, SqliteMedium, StorageMedium};
pub use store::{CacheEntry, OfflineStore, Refresh};
