//! Store configuration: the §6 configuration table plus a builder.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::DEFAULT_PAGE_SIZE;

/// Page-eviction policy for the [`crate::buffer::BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Clock,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru
    }
}

/// WAL fsync and checkpoint cadence knobs.
#[derive(Debug, Clone, Copy)]
pub struct WalOptions {
    /// Skip fsync on commit; a checkpoint still fsyncs. Weakens durability,
    /// never consistency.
    pub group_commit: bool,
    /// Auto-checkpoint after this many mutating operations. 0 disables.
    pub checkpoint_interval_ops: u64,
    /// Auto-checkpoint after this many wall-clock milliseconds. 0 disables.
    pub checkpoint_interval_ms: u64,
}

impl Default for WalOptions {
    fn default() -> Self {
        WalOptions {
            group_commit: false,
            checkpoint_interval_ops: 1000,
            checkpoint_interval_ms: 0,
        }
    }
}

/// Advisory alert thresholds. Never enforced as hard failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub rss_bytes: Option<u64>,
    pub buffer_pages: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub file_path: PathBuf,
    pub wal_path: PathBuf,
    pub page_size: u32,
    pub segment_pages: Option<u32>,
    pub read_ahead_pages: u32,
    pub buffer_pages: u32,
    pub eviction_policy: EvictionPolicy,
    pub wal_options: WalOptions,
    pub limits: Limits,
}

impl StoreConfig {
    pub fn builder(file_path: impl AsRef<Path>) -> StoreConfigBuilder {
        StoreConfigBuilder::new(file_path)
    }
}

/// Builder for [`StoreConfig`]. Mirrors the shape of the teacher's own
/// `QuickStepConfig::new` constructor, generalized into a fluent API.
pub struct StoreConfigBuilder {
    file_path: PathBuf,
    wal_path: Option<PathBuf>,
    page_size: u32,
    segment_pages: Option<u32>,
    read_ahead_pages: u32,
    buffer_pages: u32,
    eviction_policy: EvictionPolicy,
    wal_options: WalOptions,
    limits: Limits,
}

impl StoreConfigBuilder {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        StoreConfigBuilder {
            file_path: file_path.as_ref().to_path_buf(),
            wal_path: None,
            page_size: DEFAULT_PAGE_SIZE,
            segment_pages: None,
            read_ahead_pages: 0,
            buffer_pages: 256,
            eviction_policy: EvictionPolicy::default(),
            wal_options: WalOptions::default(),
            limits: Limits::default(),
        }
    }

    pub fn wal_path(mut self, path: impl AsRef<Path>) -> Self {
        self.wal_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn segment_pages(mut self, segment_pages: u32) -> Self {
        self.segment_pages = Some(segment_pages);
        self
    }

    pub fn read_ahead_pages(mut self, n: u32) -> Self {
        self.read_ahead_pages = n;
        self
    }

    pub fn buffer_pages(mut self, n: u32) -> Self {
        self.buffer_pages = n;
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn wal_options(mut self, opts: WalOptions) -> Self {
        self.wal_options = opts;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        if self.page_size == 0 || self.page_size % 512 != 0 {
            return Err(Error::InvalidConfig(format!(
                "page size {} is not a positive multiple of 512",
                self.page_size
            )));
        }
        if let Some(s) = self.segment_pages {
            if s == 0 {
                return Err(Error::InvalidConfig("segmentPages must be >= 1".into()));
            }
        }
        let wal_path = self.wal_path.unwrap_or_else(|| {
            let mut p = self.file_path.clone().into_os_string();
            p.push(".wal");
            PathBuf::from(p)
        });
        Ok(StoreConfig {
            file_path: self.file_path,
            wal_path,
            page_size: self.page_size,
            segment_pages: self.segment_pages,
            read_ahead_pages: self.read_ahead_pages,
            buffer_pages: self.buffer_pages,
            eviction_policy: self.eviction_policy,
            wal_options: self.wal_options,
            limits: self.limits,
        })
    }
}
