//! Process lifetime: open/close, single-writer/multi-reader coordination,
//! and checkpoint cadence. Exposes the public `Store` facade.
//!
//! Grounded on the teacher's `QuickStep`/`QuickStepTx` split — a shared
//! store object that hands out per-operation access — generalized onto
//! this crate's `BTree`. The teacher coordinates via its `LockManager`
//! acquiring locks per mini-page; here a single process-wide `RwLock`
//! gives writers exclusive access and lets readers run concurrently,
//! with the `BTree`'s own latches and buffer-pool mutex handling
//! page-level coordination underneath.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::btree::BTree;
use crate::buffer::{BufferPool, BufferPoolStats};
use crate::config::{Limits, StoreConfig};
use crate::error::Result;
use crate::page_store::PageStore;
use crate::types::Key;
use crate::wal::Wal;

/// Observability snapshot: buffer-pool counters plus checkpoint cadence
/// state. Not part of the on-disk format.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub buffer: BufferPoolStats,
    pub ops_since_checkpoint: u64,
    pub key_count: u64,
}

pub struct Coordinator {
    tree: RwLock<BTree>,
    wal: Arc<Wal>,
    checkpoint_interval_ops: u64,
    checkpoint_interval_ms: u64,
    ops_since_checkpoint: AtomicU64,
    last_checkpoint: Mutex<Instant>,
    limits: Limits,
}

impl Coordinator {
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut page_store = PageStore::initialize(&config.file_path, config.page_size, config.segment_pages)?;
        let wal = Arc::new(Wal::open(&config.wal_path, config.page_size)?);

        let replayed_before = page_store.meta().total_pages;
        wal.replay(&mut page_store)?;
        log::info!(
            "store opened at {}: {} total pages before recovery replay",
            config.file_path.display(),
            replayed_before
        );

        let buffer = BufferPool::new(
            page_store,
            wal.clone(),
            config.buffer_pages,
            config.eviction_policy,
            config.wal_options.group_commit,
        );
        let tree = BTree::new(buffer);

        Ok(Coordinator {
            tree: RwLock::new(tree),
            wal,
            checkpoint_interval_ops: config.wal_options.checkpoint_interval_ops,
            checkpoint_interval_ms: config.wal_options.checkpoint_interval_ms,
            ops_since_checkpoint: AtomicU64::new(0),
            last_checkpoint: Mutex::new(Instant::now()),
            limits: config.limits,
        })
    }

    fn note_mutation(&self) -> Result<()> {
        let n = self.ops_since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        let due_by_count = self.checkpoint_interval_ops != 0 && n >= self.checkpoint_interval_ops;
        let due_by_time = self.checkpoint_interval_ms != 0 && {
            let last = self.last_checkpoint.lock().expect("checkpoint clock poisoned");
            last.elapsed().as_millis() as u64 >= self.checkpoint_interval_ms
        };
        if due_by_count || due_by_time {
            self.checkpoint()?;
        }
        self.check_limits()?;
        Ok(())
    }

    /// Advisory-only threshold check against `Limits`: logs a warning but
    /// never fails the operation.
    fn check_limits(&self) -> Result<()> {
        if self.limits.buffer_pages.is_none() && self.limits.rss_bytes.is_none() {
            return Ok(());
        }
        let tree = self.tree.read().expect("tree lock poisoned");
        let (stats, page_size) = tree.with_buffer(|b| Ok((b.stats(), b.page_store().page_size())))?;
        drop(tree);

        if let Some(limit) = self.limits.buffer_pages {
            if stats.max_resident > limit {
                log::warn!(
                    "buffer pool resident page count {} exceeds advisory limit {}",
                    stats.max_resident,
                    limit
                );
            }
        }
        if let Some(limit) = self.limits.rss_bytes {
            let approx_bytes = stats.max_resident as u64 * page_size as u64;
            if approx_bytes > limit {
                log::warn!(
                    "approximate buffer pool footprint {} bytes exceeds advisory rss limit {} bytes",
                    approx_bytes,
                    limit
                );
            }
        }
        Ok(())
    }

    /// Flushes all dirty frames then replays/truncates the WAL against the
    /// now-durable data file.
    pub fn checkpoint(&self) -> Result<()> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.with_buffer(|buffer| {
            buffer.flush_all()?;
            buffer.page_store_mut().sync()?;
            self.wal.checkpoint(buffer.page_store_mut())
        })?;
        self.ops_since_checkpoint.store(0, Ordering::SeqCst);
        *self.last_checkpoint.lock().expect("checkpoint clock poisoned") = Instant::now();
        log::debug!("checkpoint complete");
        Ok(())
    }

    pub fn get(&self, key: Key) -> Result<Option<Vec<u8>>> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.get(key)
    }

    pub fn set(&self, key: Key, value: &[u8]) -> Result<()> {
        let tree = self.tree.write().expect("tree lock poisoned");
        tree.set(key, value)?;
        drop(tree);
        self.note_mutation()
    }

    pub fn delete(&self, key: Key) -> Result<bool> {
        let tree = self.tree.write().expect("tree lock poisoned");
        let existed = tree.delete(key)?;
        drop(tree);
        self.note_mutation()?;
        Ok(existed)
    }

    pub fn range(&self, start: Key, end: Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.range(start, end)
    }

    pub fn keys(&self, start: Key, end: Key) -> Result<Vec<Key>> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.keys(start, end)
    }

    pub fn values(&self, start: Key, end: Key) -> Result<Vec<Vec<u8>>> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.values(start, end)
    }

    pub fn consistency_check(&self) -> Result<bool> {
        let tree = self.tree.read().expect("tree lock poisoned");
        tree.consistency_check()
    }

    pub fn defragment(&self) -> Result<()> {
        let tree = self.tree.write().expect("tree lock poisoned");
        tree.defragment()
    }

    pub fn vacuum(&self) -> Result<(u32, u32)> {
        let tree = self.tree.write().expect("tree lock poisoned");
        tree.vacuum()
    }

    pub fn stats(&self) -> Result<CoordinatorStats> {
        let tree = self.tree.read().expect("tree lock poisoned");
        let (buffer, key_count) = tree.with_buffer(|b| Ok((b.stats(), b.page_store().meta().key_count)))?;
        Ok(CoordinatorStats {
            buffer,
            ops_since_checkpoint: self.ops_since_checkpoint.load(Ordering::SeqCst),
            key_count,
        })
    }

    /// Flushes, checkpoints, and fsyncs everything before the process
    /// exits. Not required for crash safety (the WAL covers that) but
    /// keeps the data file itself caught up and the log short.
    pub fn close(&self) -> Result<()> {
        let tree = self.tree.write().expect("tree lock poisoned");
        tree.flush_all()?;
        tree.with_buffer(|buffer| {
            self.wal.checkpoint(buffer.page_store_mut())?;
            buffer.page_store_mut().sync()
        })?;
        log::info!("store closed cleanly");
        Ok(())
    }
}

/// The public facade: a durable, disk-backed ordered key-value store.
pub struct Store {
    coordinator: Coordinator,
}

impl Store {
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Store {
            coordinator: Coordinator::open(config)?,
        })
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(StoreConfig::builder(path).build()?)
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Vec<u8>>> {
        self.coordinator.get(key.into())
    }

    pub fn set(&self, key: impl Into<Key>, value: impl AsRef<[u8]>) -> Result<()> {
        self.coordinator.set(key.into(), value.as_ref())
    }

    pub fn delete(&self, key: impl Into<Key>) -> Result<bool> {
        self.coordinator.delete(key.into())
    }

    pub fn range(&self, start: impl Into<Key>, end: impl Into<Key>) -> Result<Vec<(Key, Vec<u8>)>> {
        self.coordinator.range(start.into(), end.into())
    }

    pub fn keys(&self, start: impl Into<Key>, end: impl Into<Key>) -> Result<Vec<Key>> {
        self.coordinator.keys(start.into(), end.into())
    }

    pub fn values(&self, start: impl Into<Key>, end: impl Into<Key>) -> Result<Vec<Vec<u8>>> {
        self.coordinator.values(start.into(), end.into())
    }

    pub fn consistency_check(&self) -> Result<bool> {
        self.coordinator.consistency_check()
    }

    pub fn defragment(&self) -> Result<()> {
        self.coordinator.defragment()
    }

    pub fn vacuum(&self) -> Result<(u32, u32)> {
        self.coordinator.vacuum()
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.coordinator.checkpoint()
    }

    pub fn stats(&self) -> Result<CoordinatorStats> {
        self.coordinator.stats()
    }

    pub fn close(&self) -> Result<()> {
        self.coordinator.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_set_get_close_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        {
            let store = Store::open_path(&path).unwrap();
            store.set(1u64, b"hello").unwrap();
            store.set(2u64, b"world").unwrap();
            store.close().unwrap();
        }
        {
            let store = Store::open_path(&path).unwrap();
            assert_eq!(store.get(1u64).unwrap(), Some(b"hello".to_vec()));
            assert_eq!(store.get(2u64).unwrap(), Some(b"world".to_vec()));
        }
    }

    #[test]
    fn checkpoint_cadence_triggers_on_op_count() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::builder(dir.path().join("s.db"))
            .wal_options(crate::config::WalOptions {
                group_commit: true,
                checkpoint_interval_ops: 10,
                checkpoint_interval_ms: 0,
            })
            .build()
            .unwrap();
        let store = Store::open(config).unwrap();
        for k in 0..25u64 {
            store.set(k, b"v").unwrap();
        }
        let stats = store.stats().unwrap();
        assert!(stats.ops_since_checkpoint < 10);
    }
}
