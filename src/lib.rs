//! A single-writer, multi-reader, durable ordered key-value store backed
//! by a disk-resident B+Tree over fixed-size pages, with a write-ahead
//! log for crash recovery and a bounded buffer pool in front of the
//! page file.
//!
//! This implementation grew out of the architecture of
//! [Quickstep](https://github.com/merlinai-com/quickstep), a Bf-tree
//! embedded store by [Raphael Darley](https://github.com/RaphaelDarley):
//! the page-oriented storage core, buffer pool, and latch-based
//! concurrency model are all descendants of that design, retargeted at a
//! WAL-backed B+Tree instead of a Bf-tree.
//!
//! ```no_run
//! use bptree_engine::Store;
//!
//! let store = Store::open_path("example.db")?;
//! store.set(1u64, b"hello")?;
//! assert_eq!(store.get(1u64)?, Some(b"hello".to_vec()));
//! store.close()?;
//! # Ok::<(), bptree_engine::error::Error>(())
//! ```

pub mod btree;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod file_store;
pub mod lock_manager;
pub mod overflow;
pub mod page_store;
pub mod types;
pub mod wal;

pub use config::{EvictionPolicy, Limits, StoreConfig, StoreConfigBuilder, WalOptions};
pub use coordinator::{CoordinatorStats, Store};
pub use error::{Error, Result};
pub use types::Key;
