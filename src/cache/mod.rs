//! Query cache for remote data.
//!
//! This module is transport-agnostic. It provides:
//! - Normalized query keys derived from explicit parameters
//! - A cache store with expiry and optional SQLite persistence
//! - A fetch coordinator with stale-while-revalidate, request deduplication
//!   and a fixed retry budget
//! - Page accumulation for infinite lists

mod coordinator;
mod key;
mod pagination;
mod storage;
mod store;
mod traits;

pub use coordinator::{FetchCoordinator, QueryOptions, RetryPolicy};
pub use key::{KeyError, KeyPart, QueryKey, QueryKeyBuilder};
pub use pagination::{InfiniteQuery, Page, PageError, PaginationAccumulator};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage, StoredEntry};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheSource, FetchError, QueryResult, QueryStatus};
