//! Herakles Proxy Library
//!
//! Store-and-forward monitoring proxy. Collected values pass through a
//! bounded write buffer into a local SQLite database, recent values stay in
//! a memory-bounded value cache, and history, discovery and autoregistration
//! data are delivered upstream with at-least-once semantics.
//!
//! # Components
//!
//! - **Value cache** ([`valuecache`]): per-item ring buffers of recent values
//!   with DB backfill and least-recently-used eviction
//! - **History syncer** ([`syncer`]): drains the write buffer into the
//!   database and the value cache
//! - **Proxy data sender** ([`sender`]): checkpointed delivery to the server
//! - **Housekeeper** ([`housekeeper`]): time-bounded deletion of delivered
//!   and expired rows
//! - **Server communication** ([`comms`]): framed exchange with retry and
//!   rate-limited link logging
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use herakles_proxy::store::Store;
//! use herakles_proxy::valuecache::ValueCache;
//!
//! let store = Arc::new(Store::open_in_memory().unwrap());
//! let cache = ValueCache::create(1 << 20, 4 << 20, 100, store);
//! assert_eq!(cache.stats().items, 0);
//! ```

pub mod cli;
pub mod collectors;
pub mod comms;
pub mod config;
pub mod configcache;
pub mod control;
pub mod error;
pub mod handlers;
pub mod hashindex;
pub mod history;
pub mod housekeeper;
pub mod metrics;
pub mod poller;
pub mod protocol;
pub mod ringbuffer;
pub mod sender;
pub mod shm;
pub mod state;
pub mod stats;
pub mod store;
pub mod syncer;
pub mod valuecache;
pub mod writebuffer;

// Re-export main types for convenience
pub use error::{ProxyError, Result};
pub use state::{AppState, SharedState};
pub use store::{Store, Stream};
pub use valuecache::ValueCache;
