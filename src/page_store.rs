//! Meta page plus allocation and the persistent free list.
//!
//! Grounded on the teacher's `io_engine::IoEngine` for raw page addressing
//! and generalized with the free-list walk pattern from `QuiverDB`'s
//! `Pager::allocate_one_page`/`free_page`.

use std::collections::HashSet;
use std::path::Path;

use crate::codec;
use crate::error::{Error, Result};
use crate::file_store::FileStore;
use crate::types::{Meta, PageNo, FIRST_ALLOCATABLE_PAGE, INITIAL_ROOT_PAGE, META_PAGE};

pub struct PageStore {
    file_store: FileStore,
    meta: Meta,
}

impl PageStore {
    /// Opens or creates the data file. If the Meta page's magic is
    /// absent/wrong, writes a fresh Meta and initializes the root leaf.
    pub fn initialize(path: impl AsRef<Path>, page_size: u32, segment_pages: Option<u32>) -> Result<Self> {
        let mut file_store = FileStore::open(path, page_size, segment_pages)?;
        let mut buf = vec![0u8; page_size as usize];
        file_store.read_page(META_PAGE, &mut buf)?;

        let meta = if codec::is_meta_page(&buf) {
            codec::decode_meta(&buf)?
        } else {
            log::debug!("meta page absent or unrecognized, initializing fresh store");
            let meta = Meta::fresh(page_size);
            file_store.write_page(META_PAGE, &codec::encode_meta(&meta, page_size))?;
            let root = crate::codec::LeafPage {
                right_sibling: 0,
                cells: vec![],
            };
            let root_buf = codec::encode_leaf(&root, page_size)?;
            file_store.write_page(INITIAL_ROOT_PAGE, &root_buf)?;
            meta
        };

        if meta.page_size != page_size {
            return Err(Error::CorruptPage {
                page: META_PAGE,
                reason: format!(
                    "stored page size {} does not match configured page size {}",
                    meta.page_size, page_size
                ),
            });
        }
        if meta.tree_depth < 1 {
            return Err(Error::CorruptPage {
                page: META_PAGE,
                reason: "tree depth must be >= 1".into(),
            });
        }
        if meta.total_pages < FIRST_ALLOCATABLE_PAGE {
            return Err(Error::CorruptPage {
                page: META_PAGE,
                reason: "total pages must be >= 3".into(),
            });
        }

        Ok(PageStore { file_store, meta })
    }

    pub fn page_size(&self) -> u32 {
        self.meta.page_size
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn read_meta(&mut self) -> Result<Meta> {
        let mut buf = vec![0u8; self.meta.page_size as usize];
        self.file_store.read_page(META_PAGE, &mut buf)?;
        let meta = codec::decode_meta(&buf)?;
        self.meta = meta.clone();
        Ok(meta)
    }

    pub fn write_meta(&mut self, meta: &Meta) -> Result<()> {
        let buf = codec::encode_meta(meta, self.meta.page_size);
        self.file_store.write_page(META_PAGE, &buf)?;
        self.meta = meta.clone();
        Ok(())
    }

    pub fn read_page_raw(&mut self, n: PageNo, out: &mut [u8]) -> Result<()> {
        self.file_store.read_page(n, out)
    }

    pub fn write_page_raw(&mut self, n: PageNo, bytes: &[u8]) -> Result<()> {
        self.file_store.write_page(n, bytes)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file_store.sync()
    }

    /// Shrinks the underlying file to exactly `n` pages. Callers are
    /// responsible for keeping `meta.total_pages` in sync.
    pub fn truncate_pages(&mut self, n: u32) -> Result<()> {
        self.file_store.truncate_pages(n)
    }

    /// Pops the free-list head if non-empty; otherwise bumps `totalPages`.
    /// A bump-allocated page is zeroed on disk.
    pub fn allocate_page(&mut self) -> Result<PageNo> {
        if self.meta.free_list_head != 0 {
            let head = self.meta.free_list_head;
            let mut buf = vec![0u8; self.meta.page_size as usize];
            self.file_store.read_page(head, &mut buf)?;
            let next = u32::from_le_bytes(buf[0..4].try_into().unwrap());
            let mut meta = self.meta.clone();
            meta.free_list_head = next;
            self.write_meta(&meta)?;
            log::trace!("allocate_page: reused free page {}", head);
            Ok(head)
        } else {
            let n = self.meta.total_pages;
            let zeros = vec![0u8; self.meta.page_size as usize];
            self.file_store.write_page(n, &zeros)?;
            let mut meta = self.meta.clone();
            meta.total_pages = n + 1;
            self.write_meta(&meta)?;
            log::trace!("allocate_page: bump-allocated page {}", n);
            Ok(n)
        }
    }

    /// Pushes `n` onto the free list head.
    pub fn free_page(&mut self, n: PageNo) -> Result<()> {
        if n < FIRST_ALLOCATABLE_PAGE {
            return Err(Error::CorruptFreeList(format!(
                "refusing to free reserved page {}",
                n
            )));
        }
        let mut buf = vec![0u8; self.meta.page_size as usize];
        buf[0..4].copy_from_slice(&self.meta.free_list_head.to_le_bytes());
        self.file_store.write_page(n, &buf)?;
        let mut meta = self.meta.clone();
        meta.free_list_head = n;
        self.write_meta(&meta)?;
        Ok(())
    }

    /// Walks the free-list chain with a seen-set for cycle detection.
    /// Returns pages >= 3 only.
    pub fn collect_free_pages(&mut self) -> Result<HashSet<PageNo>> {
        let mut seen = HashSet::new();
        let mut cur = self.meta.free_list_head;
        while cur != 0 {
            if !seen.insert(cur) {
                return Err(Error::CorruptFreeList(format!(
                    "cycle detected at page {}",
                    cur
                )));
            }
            if cur < FIRST_ALLOCATABLE_PAGE {
                return Err(Error::CorruptFreeList(format!(
                    "free list references reserved page {}",
                    cur
                )));
            }
            let mut buf = vec![0u8; self.meta.page_size as usize];
            self.file_store.read_page(cur, &mut buf)?;
            cur = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        }
        Ok(seen)
    }

    /// Pops pages from the tail of `totalPages` while the candidate is in
    /// the free set, rewrites the persistent free list to exclude the
    /// reclaimed pages, and truncates the file. Idempotent.
    pub fn vacuum(&mut self) -> Result<(u32, u32)> {
        let free = self.collect_free_pages()?;
        let mut remaining: Vec<PageNo> = free.iter().copied().collect();
        remaining.sort_unstable();

        let mut total = self.meta.total_pages;
        let mut reclaimed = 0u32;
        let mut kept: HashSet<PageNo> = free.clone();
        while total > FIRST_ALLOCATABLE_PAGE && kept.contains(&(total - 1)) {
            kept.remove(&(total - 1));
            total -= 1;
            reclaimed += 1;
        }

        // Rewrite the free list with the pages that remain free.
        let mut remaining: Vec<PageNo> = kept.into_iter().collect();
        remaining.sort_unstable();
        let mut head = 0u32;
        for &p in remaining.iter().rev() {
            let mut buf = vec![0u8; self.meta.page_size as usize];
            buf[0..4].copy_from_slice(&head.to_le_bytes());
            self.file_store.write_page(p, &buf)?;
            head = p;
        }

        self.file_store.truncate_pages(total)?;
        let mut meta = self.meta.clone();
        meta.total_pages = total;
        meta.free_list_head = head;
        self.write_meta(&meta)?;

        log::debug!(
            "vacuum: reclaimed {} pages, {} remain free",
            reclaimed,
            remaining.len()
        );
        Ok((reclaimed, remaining.len() as u32))
    }
}
