//! Bounded, pinning page cache with dirty tracking, LRU/clock eviction,
//! and write-through via the WAL.
//!
//! Grounded on the teacher's `MiniPageBuffer` for the overall shape (a
//! bounded pool of page-sized frames with pin/evict/dealloc operations)
//! and on `QuiverDB`'s `PageCache` for the LRU tick/last-access eviction
//! scheme, rebuilt without the teacher's unsafe atomic slab allocator.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::EvictionPolicy;
use crate::error::{Error, Result};
use crate::page_store::PageStore;
use crate::types::PageNo;
use crate::wal::Wal;

struct Frame {
    bytes: Vec<u8>,
    dirty: bool,
    pin_count: u32,
    last_access: u64,
    clock_ref: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub page_loads: u64,
    pub flushes: u64,
    pub evictions: u64,
    pub max_resident: u32,
}

pub struct BufferPool {
    page_store: PageStore,
    wal: Arc<Wal>,
    frames: HashMap<PageNo, Frame>,
    capacity: u32,
    policy: EvictionPolicy,
    group_commit: bool,
    tick: u64,
    clock_order: Vec<PageNo>,
    clock_hand: usize,
    stats: BufferPoolStats,
}

impl BufferPool {
    pub fn new(page_store: PageStore, wal: Arc<Wal>, capacity: u32, policy: EvictionPolicy, group_commit: bool) -> Self {
        BufferPool {
            page_store,
            wal,
            frames: HashMap::new(),
            capacity,
            policy,
            group_commit,
            tick: 0,
            clock_order: Vec::new(),
            clock_hand: 0,
            stats: BufferPoolStats::default(),
        }
    }

    pub fn page_store(&self) -> &PageStore {
        &self.page_store
    }

    pub fn page_store_mut(&mut self) -> &mut PageStore {
        &mut self.page_store
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.stats
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// On hit, increments pinCount. On miss, evicts (if full) then loads
    /// from `PageStore` and inserts with pinCount = 1. Returns a copy of
    /// the page bytes; mutate locally and call [`Self::put_page`] to write
    /// the result back into the frame.
    pub fn get_page(&mut self, n: PageNo) -> Result<Vec<u8>> {
        if !self.frames.contains_key(&n) {
            if self.frames.len() as u32 >= self.capacity {
                self.evict()?;
            }
            let page_size = self.page_store.page_size() as usize;
            let mut bytes = vec![0u8; page_size];
            self.page_store.read_page_raw(n, &mut bytes)?;
            self.stats.page_loads += 1;
            let tick = self.next_tick();
            self.frames.insert(
                n,
                Frame {
                    bytes,
                    dirty: false,
                    pin_count: 0,
                    last_access: tick,
                    clock_ref: true,
                },
            );
            self.clock_order.push(n);
            self.stats.max_resident = self.stats.max_resident.max(self.frames.len() as u32);
        }
        let tick = self.next_tick();
        let frame = self.frames.get_mut(&n).expect("frame just inserted");
        frame.pin_count += 1;
        frame.last_access = tick;
        frame.clock_ref = true;
        Ok(frame.bytes.clone())
    }

    /// Overwrites the in-memory frame contents. Does not itself mark the
    /// frame dirty or change its pin count — pair with [`Self::unpin`].
    pub fn put_page(&mut self, n: PageNo, bytes: Vec<u8>) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&n)
            .ok_or_else(|| Error::LockMisuse(format!("put_page on unresident page {}", n)))?;
        frame.bytes = bytes;
        Ok(())
    }

    /// Decrements pinCount (error if already zero); ORs in `dirty`.
    pub fn unpin(&mut self, n: PageNo, dirty: bool) -> Result<()> {
        let frame = self
            .frames
            .get_mut(&n)
            .ok_or_else(|| Error::LockMisuse(format!("unpin on unresident page {}", n)))?;
        if frame.pin_count == 0 {
            return Err(Error::LockMisuse(format!("unpin of already-unpinned page {}", n)));
        }
        frame.pin_count -= 1;
        frame.dirty |= dirty;
        Ok(())
    }

    /// If dirty: stages the full image through a single WAL transaction
    /// (honoring group-commit), writes through to the `PageStore`, clears
    /// dirty.
    pub fn flush_page(&mut self, n: PageNo) -> Result<()> {
        let dirty = match self.frames.get(&n) {
            Some(f) => f.dirty,
            None => return Ok(()),
        };
        if !dirty {
            return Ok(());
        }
        let bytes = self.frames.get(&n).unwrap().bytes.clone();
        let tx = self.wal.begin_transaction()?;
        self.wal.stage_page(tx, n, &bytes)?;
        self.wal.commit_transaction(tx, self.group_commit)?;
        self.page_store.write_page_raw(n, &bytes)?;
        self.frames.get_mut(&n).unwrap().dirty = false;
        self.stats.flushes += 1;
        log::trace!("flush_page({})", n);
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        let pages: Vec<PageNo> = self.frames.keys().copied().collect();
        for n in pages {
            self.flush_page(n)?;
        }
        Ok(())
    }

    /// Flushes a specific set of pages as a single WAL transaction (one
    /// Begin/Page.../Commit group covering all of them), then writes them
    /// through to the `PageStore`. Pages that aren't dirty are skipped.
    /// Used by the B+Tree write path so everything a `set`/`delete` call
    /// touched becomes durable together before the call returns, rather
    /// than waiting for the next checkpoint.
    pub fn flush_pages(&mut self, pages: &[PageNo]) -> Result<()> {
        let mut dirty: Vec<PageNo> = Vec::new();
        for &n in pages {
            if self.frames.get(&n).map_or(false, |f| f.dirty) && !dirty.contains(&n) {
                dirty.push(n);
            }
        }
        if dirty.is_empty() {
            return Ok(());
        }
        let tx = self.wal.begin_transaction()?;
        for &n in &dirty {
            let bytes = self.frames.get(&n).expect("checked dirty above").bytes.clone();
            self.wal.stage_page(tx, n, &bytes)?;
        }
        self.wal.commit_transaction(tx, self.group_commit)?;
        for &n in &dirty {
            let bytes = self.frames.get(&n).expect("checked dirty above").bytes.clone();
            self.page_store.write_page_raw(n, &bytes)?;
            self.frames.get_mut(&n).expect("checked dirty above").dirty = false;
        }
        self.stats.flushes += 1;
        log::trace!("flush_pages({:?})", dirty);
        Ok(())
    }

    /// Selects a victim with pinCount == 0 per the configured policy,
    /// flushes it, and removes it. Returns `PoolExhausted` if every frame
    /// is pinned.
    pub fn evict(&mut self) -> Result<()> {
        let victim = match self.policy {
            EvictionPolicy::Lru => self.pick_lru_victim(),
            EvictionPolicy::Clock => self.pick_clock_victim(),
        };
        match victim {
            Some(n) => {
                self.flush_page(n)?;
                self.frames.remove(&n);
                self.clock_order.retain(|&p| p != n);
                self.stats.evictions += 1;
                log::debug!("evicted page {}", n);
                Ok(())
            }
            None => Err(Error::PoolExhausted),
        }
    }

    fn pick_lru_victim(&self) -> Option<PageNo> {
        self.frames
            .iter()
            .filter(|(_, f)| f.pin_count == 0)
            .min_by_key(|(_, f)| f.last_access)
            .map(|(&n, _)| n)
    }

    /// Cycles an internal round-robin, skipping pinned frames, with at
    /// most two full revolutions.
    fn pick_clock_victim(&mut self) -> Option<PageNo> {
        if self.clock_order.is_empty() {
            return None;
        }
        let len = self.clock_order.len();
        let max_steps = len.saturating_mul(2);
        for _ in 0..max_steps {
            if self.clock_hand >= self.clock_order.len() {
                self.clock_hand = 0;
            }
            let n = self.clock_order[self.clock_hand];
            let hand = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.clock_order.len().max(1);
            if let Some(frame) = self.frames.get_mut(&n) {
                if frame.pin_count != 0 {
                    continue;
                }
                if frame.clock_ref {
                    frame.clock_ref = false;
                    continue;
                }
                let _ = hand;
                return Some(n);
            }
        }
        None
    }

    /// Removes a frame without flushing. Errors if it is still pinned.
    pub fn drop_page(&mut self, n: PageNo) -> Result<()> {
        if let Some(frame) = self.frames.get(&n) {
            if frame.pin_count != 0 {
                return Err(Error::LockMisuse(format!("drop_page on pinned page {}", n)));
            }
        }
        self.frames.remove(&n);
        self.clock_order.retain(|&p| p != n);
        Ok(())
    }

    /// Discards all frames. Callers must have flushed beforehand.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.clock_order.clear();
        self.clock_hand = 0;
    }
}
