//! Multi-page linked chain for values larger than a leaf's inline limit.
//!
//! Grounded on `examples/other_examples/287cbc73_cyoab-thunder__src-overflow.rs.rs`'s
//! `OverflowManager` (chunking into fixed-size pages, chain traversal with
//! a length target and a cycle-safety bound, freeing by walking `next`),
//! adapted onto this crate's `PageStore` allocator and `PageCodec` framing
//! instead of that example's own bespoke header/allocator.

use crate::codec::{self, OverflowPage};
use crate::error::{Error, Result};
use crate::page_store::PageStore;
use crate::types::PageNo;

/// Safety bound on chain length so a corrupted cyclic chain cannot spin
/// forever during a read or free walk.
const MAX_CHAIN_LENGTH: usize = 10_000_000;

pub struct OverflowStore;

impl OverflowStore {
    /// Splits `bytes` into chunks of `page_size - header` bytes, allocating
    /// and linking a page per chunk. Empty input returns page 0 (no chain).
    pub fn allocate_chain(page_store: &mut PageStore, bytes: &[u8]) -> Result<PageNo> {
        if bytes.is_empty() {
            return Ok(0);
        }
        let page_size = page_store.page_size();
        let capacity = codec::overflow_chunk_capacity(page_size);
        let chunks: Vec<&[u8]> = bytes.chunks(capacity).collect();

        let mut pages = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            pages.push(page_store.allocate_page()?);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let next = pages.get(i + 1).copied().unwrap_or(0);
            let page = OverflowPage {
                next,
                payload: chunk.to_vec(),
            };
            let buf = codec::encode_overflow(&page, page_size)?;
            page_store.write_page_raw(pages[i], &buf)?;
        }

        log::trace!(
            "allocate_chain: {} bytes across {} pages, head={}",
            bytes.len(),
            pages.len(),
            pages[0]
        );
        Ok(pages[0])
    }

    /// Concatenates chunk payloads following `next` pointers until
    /// `total_len` bytes are collected.
    pub fn read_chain(page_store: &mut PageStore, head: PageNo, total_len: u64) -> Result<Vec<u8>> {
        if head == 0 {
            return if total_len == 0 {
                Ok(Vec::new())
            } else {
                Err(Error::TruncatedChain {
                    expected: total_len,
                    got: 0,
                })
            };
        }
        let page_size = page_store.page_size();
        let mut out = Vec::with_capacity(total_len as usize);
        let mut cur = head;
        let mut hops = 0usize;
        while cur != 0 && (out.len() as u64) < total_len {
            if hops >= MAX_CHAIN_LENGTH {
                return Err(Error::TruncatedChain {
                    expected: total_len,
                    got: out.len() as u64,
                });
            }
            hops += 1;
            let mut buf = vec![0u8; page_size as usize];
            page_store.read_page_raw(cur, &mut buf)?;
            let page = codec::decode_overflow(&buf, cur)?;
            out.extend_from_slice(&page.payload);
            cur = page.next;
        }
        if (out.len() as u64) < total_len {
            return Err(Error::TruncatedChain {
                expected: total_len,
                got: out.len() as u64,
            });
        }
        out.truncate(total_len as usize);
        Ok(out)
    }

    /// Walks `next`, freeing each page; stops at 0.
    pub fn free_chain(page_store: &mut PageStore, head: PageNo) -> Result<()> {
        let page_size = page_store.page_size();
        let mut cur = head;
        let mut hops = 0usize;
        while cur != 0 {
            if hops >= MAX_CHAIN_LENGTH {
                return Err(Error::CorruptFreeList("overflow chain exceeds maximum length".into()));
            }
            hops += 1;
            let mut buf = vec![0u8; page_size as usize];
            page_store.read_page_raw(cur, &mut buf)?;
            let page = codec::decode_overflow(&buf, cur)?;
            let next = page.next;
            page_store.free_page(cur)?;
            cur = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_small_chain() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::initialize(dir.path().join("store.db"), 512, None).unwrap();
        let value = vec![42u8; 2000];
        let head = OverflowStore::allocate_chain(&mut ps, &value).unwrap();
        assert_ne!(head, 0);
        let read_back = OverflowStore::read_chain(&mut ps, head, value.len() as u64).unwrap();
        assert_eq!(read_back, value);
    }

    #[test]
    fn empty_value_has_no_chain() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::initialize(dir.path().join("store.db"), 512, None).unwrap();
        let head = OverflowStore::allocate_chain(&mut ps, &[]).unwrap();
        assert_eq!(head, 0);
    }

    #[test]
    fn free_chain_returns_pages_to_free_list() {
        let dir = tempdir().unwrap();
        let mut ps = PageStore::initialize(dir.path().join("store.db"), 512, None).unwrap();
        let value = vec![7u8; 3000];
        let head = OverflowStore::allocate_chain(&mut ps, &value).unwrap();
        OverflowStore::free_chain(&mut ps, head).unwrap();
        let free = ps.collect_free_pages().unwrap();
        assert!(!free.is_empty());
    }
}
