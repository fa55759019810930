//! Keyed result cache with dependency-based invalidation.
//!
//! Entries are tagged with a semantic [`CacheKey`] describing what was
//! fetched. The cache deduplicates identical in-flight fetches, serves
//! fresh results without touching the network, and supports bulk
//! invalidation by key prefix after mutations.

mod entry;
mod key;
mod store;

pub use entry::{CacheEntry, EntryState};
pub use key::CacheKey;
pub use store::{EntityCache, UNTIL_INVALIDATED};
