//! yomu: a manga reader backed by a stale-while-revalidate query cache.

pub mod cache;
pub mod config;
pub mod format;
pub mod logging;
pub mod manga;
