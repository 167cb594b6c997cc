//! folio library crate
//!
//! The cache and prefetch engine behind a client-rendered documentation
//! viewer: a two-tier document cache persisted through a chunked key/value
//! layout, a document tree index, and a planner that preloads the documents
//! a reader is likely to open next.

pub mod cache;
pub mod config;
pub mod prefetch;
pub mod store;
pub mod tree;

pub use cache::{CacheOptions, CacheSettings, DocumentCache, Tier};
pub use prefetch::{plan_all, plan_around_current, Prefetcher};
pub use tree::{DocumentTree, DocumentTreeNode};
