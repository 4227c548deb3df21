//! Uniform random page I/O, optionally spread across segment files.
//!
//! Grounded on the teacher's `io_engine::IoEngine` (single-file page
//! addressing) generalized with the segment-routing scheme from
//! `QuiverDB`'s pager: page `n` lives in segment `n / segment_pages` at
//! offset `(n % segment_pages) * page_size`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// A single open segment file.
struct Segment {
    file: File,
}

pub struct FileStore {
    base_path: PathBuf,
    page_size: u32,
    segment_pages: Option<u32>,
    segments: Vec<Segment>,
}

impl FileStore {
    pub fn open(base_path: impl AsRef<Path>, page_size: u32, segment_pages: Option<u32>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let seg0 = open_rw(&base_path)?;
        Ok(FileStore {
            base_path,
            page_size,
            segment_pages,
            segments: vec![Segment { file: seg0 }],
        })
    }

    fn segment_path(&self, seg_no: u32) -> PathBuf {
        if seg_no == 0 {
            self.base_path.clone()
        } else {
            let mut s = self.base_path.clone().into_os_string();
            s.push(format!(".seg{}", seg_no));
            PathBuf::from(s)
        }
    }

    fn locate(&self, page_no: u32) -> (u32, u64) {
        match self.segment_pages {
            None => (0, page_no as u64 * self.page_size as u64),
            Some(sp) => {
                let seg_no = page_no / sp;
                let off_in_seg = (page_no % sp) as u64 * self.page_size as u64;
                (seg_no, off_in_seg)
            }
        }
    }

    fn segment_mut(&mut self, seg_no: u32) -> Result<&mut Segment> {
        while self.segments.len() <= seg_no as usize {
            let next = self.segments.len() as u32;
            let path = self.segment_path(next);
            let file = open_rw(&path)?;
            self.segments.push(Segment { file });
        }
        Ok(&mut self.segments[seg_no as usize])
    }

    /// Returns the page's current bytes, padding the underlying segment
    /// with zeros on demand if the page has never been written.
    pub fn read_page(&mut self, page_no: u32, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.page_size as usize);
        let (seg_no, offset) = self.locate(page_no);
        let seg = self.segment_mut(seg_no)?;
        let len = seg.file.metadata()?.len();
        if offset >= len {
            out.fill(0);
            return Ok(());
        }
        seg.file.seek(SeekFrom::Start(offset))?;
        let available = (len - offset).min(out.len() as u64) as usize;
        seg.file.read_exact(&mut out[..available])?;
        if available < out.len() {
            out[available..].fill(0);
        }
        Ok(())
    }

    /// Writes the full page, extending the segment with zero padding first
    /// if the page lies beyond the current end of file.
    pub fn write_page(&mut self, page_no: u32, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size as usize);
        let (seg_no, offset) = self.locate(page_no);
        let seg = self.segment_mut(seg_no)?;
        let len = seg.file.metadata()?.len();
        if offset > len {
            seg.file.set_len(offset)?;
        }
        seg.file.seek(SeekFrom::Start(offset))?;
        seg.file.write_all(bytes)?;
        Ok(())
    }

    /// Shrinks the file (or, when segmented, the relevant segments) to
    /// exactly `n` pages.
    pub fn truncate_pages(&mut self, n: u32) -> Result<()> {
        match self.segment_pages {
            None => {
                let seg = self.segment_mut(0)?;
                seg.file.set_len(n as u64 * self.page_size as u64)?;
            }
            Some(sp) => {
                let last_seg = if n == 0 { 0 } else { (n - 1) / sp };
                for (i, seg) in self.segments.iter_mut().enumerate() {
                    let i = i as u32;
                    if i < last_seg {
                        continue;
                    } else if i == last_seg {
                        let pages_in_seg = n - last_seg * sp;
                        seg.file.set_len(pages_in_seg as u64 * self.page_size as u64)?;
                    } else {
                        seg.file.set_len(0)?;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        for seg in &mut self.segments {
            seg.file.sync_data()?;
        }
        Ok(())
    }

    /// bytes/pageSize of the last non-empty segment, rounded up, added to
    /// full segments before it.
    pub fn page_count(&mut self) -> Result<u32> {
        match self.segment_pages {
            None => {
                let seg = self.segment_mut(0)?;
                let len = seg.file.metadata()?.len();
                Ok(div_ceil(len, self.page_size as u64) as u32)
            }
            Some(sp) => {
                // Find the highest segment that exists on disk.
                let mut highest = 0u32;
                let mut idx = 0u32;
                loop {
                    let path = self.segment_path(idx);
                    if path.exists() {
                        highest = idx;
                        idx += 1;
                    } else {
                        break;
                    }
                }
                let seg = self.segment_mut(highest)?;
                let len = seg.file.metadata()?.len();
                let pages_in_last = div_ceil(len, self.page_size as u64) as u32;
                Ok(highest * sp + pages_in_last)
            }
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

fn open_rw(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?)
}
