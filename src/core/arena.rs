//! Paged byte arena
//!
//! Pairs a [`FreeListAllocator`] with the page buffers it describes. When the
//! free list cannot satisfy a request the arena appends one page large enough
//! for it: `ceil(size / grow_page_size)` growth units. Growth is bounded by
//! `max_page_count` and by what the process can actually reserve; either
//! limit fails the request with `CacheError::Allocation` and leaves the
//! allocator untouched.

use crate::allocator::{Allocation, AllocatorState, AllocatorStats, FreeListAllocator};
use crate::config::MembufOptions;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Size and checksum of one persisted page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub length: u64,
    pub crc32: u32,
}

/// Saved allocator and page table, used to undo a failed multi-range commit
#[derive(Debug, Clone)]
pub struct ArenaCheckpoint {
    allocator: FreeListAllocator,
    page_count: usize,
}

pub struct Arena {
    allocator: FreeListAllocator,
    pages: Vec<Vec<u8>>,
    grow_page_size: u64,
    max_page_count: u32,
}

impl Arena {
    /// Create an arena holding only the initial page
    pub fn new(opts: &MembufOptions) -> Result<Self> {
        let first = allocate_page(opts.initial_page_size)?;

        Ok(Arena {
            allocator: FreeListAllocator::new(
                opts.initial_page_size,
                opts.min_free_block_size,
                opts.fit_policy,
            ),
            pages: vec![first],
            grow_page_size: opts.grow_page_size,
            max_page_count: opts.max_page_count,
        })
    }

    /// Reserve space for `size` bytes, growing the arena if necessary
    pub fn reserve(&mut self, size: u64) -> Result<Allocation> {
        if size == 0 {
            return Err(CacheError::Allocation(
                "cannot reserve an empty range".to_string(),
            ));
        }

        if let Some(allocation) = self.allocator.allocate(size) {
            return Ok(allocation);
        }

        self.grow(size)?;

        self.allocator.allocate(size).ok_or_else(|| {
            CacheError::Allocation(format!("no space for {} bytes after growth", size))
        })
    }

    /// Append a page of whole growth units able to hold `size` bytes
    fn grow(&mut self, size: u64) -> Result<()> {
        if self.pages.len() >= self.max_page_count as usize {
            return Err(CacheError::Allocation(format!(
                "arena is at its page limit ({} pages), cannot fit {} bytes",
                self.max_page_count, size
            )));
        }

        let units = size.div_ceil(self.grow_page_size);
        let length = units.checked_mul(self.grow_page_size).ok_or_else(|| {
            CacheError::Allocation(format!("growth for {} bytes overflows", size))
        })?;

        let page = allocate_page(length)?;
        self.pages.push(page);
        let index = self.allocator.add_page(length);

        tracing::info!(
            "Growing arena: page {} added ({} bytes, {} total)",
            index,
            length,
            self.allocator.total_size()
        );

        Ok(())
    }

    /// Return a range to the free list
    pub fn release(&mut self, allocation: Allocation) -> Result<()> {
        self.allocator.release(allocation)
    }

    /// Copy `bytes` into the start of an allocation
    pub fn write(&mut self, allocation: &Allocation, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 > allocation.length {
            return Err(CacheError::Allocation(format!(
                "{} bytes do not fit in {:?}",
                bytes.len(),
                allocation
            )));
        }

        let page = self.page_slice_mut(allocation)?;
        page[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow the first `len` bytes of an allocation
    pub fn read(&self, allocation: &Allocation, len: u64) -> Result<&[u8]> {
        if len > allocation.length {
            return Err(CacheError::Allocation(format!(
                "read of {} bytes exceeds {:?}",
                len, allocation
            )));
        }

        let page = self
            .pages
            .get(allocation.page as usize)
            .ok_or_else(|| CacheError::Allocation(format!("invalid page {}", allocation.page)))?;
        let start = allocation.offset as usize;
        page.get(start..start + len as usize).ok_or_else(|| {
            CacheError::Allocation(format!("{:?} is outside its page", allocation))
        })
    }

    fn page_slice_mut(&mut self, allocation: &Allocation) -> Result<&mut [u8]> {
        let page = self
            .pages
            .get_mut(allocation.page as usize)
            .ok_or_else(|| CacheError::Allocation(format!("invalid page {}", allocation.page)))?;
        let start = allocation.offset as usize;
        let end = start + allocation.length as usize;
        page.get_mut(start..end).ok_or_else(|| {
            CacheError::Allocation(format!("{:?} is outside its page", allocation))
        })
    }

    pub fn checkpoint(&self) -> ArenaCheckpoint {
        ArenaCheckpoint {
            allocator: self.allocator.clone(),
            page_count: self.pages.len(),
        }
    }

    /// Restore the allocator and drop pages added since `checkpoint`
    pub fn rollback(&mut self, checkpoint: ArenaCheckpoint) {
        self.allocator = checkpoint.allocator;
        self.pages.truncate(checkpoint.page_count);
    }

    pub fn allocator(&self) -> &FreeListAllocator {
        &self.allocator
    }

    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Write every page to `dir` and return their records
    pub fn save_pages(&self, dir: &Path) -> Result<Vec<PageRecord>> {
        fs::create_dir_all(dir)?;

        let mut records = Vec::with_capacity(self.pages.len());
        for (index, page) in self.pages.iter().enumerate() {
            let path = page_path(dir, index);
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, page)?;
            fs::rename(&tmp, &path)?;

            records.push(PageRecord {
                length: page.len() as u64,
                crc32: crc32fast::hash(page),
            });
        }

        // Pages left over from a larger arena would confuse the next load
        let mut stale = records.len();
        while page_path(dir, stale).exists() {
            fs::remove_file(page_path(dir, stale))?;
            stale += 1;
        }

        Ok(records)
    }

    /// Rebuild an arena from a persisted layout and its page files
    ///
    /// Fails if any page is missing, has the wrong length or fails its
    /// checksum, or if the layout disagrees with the page records.
    pub fn restore(
        opts: &MembufOptions,
        state: AllocatorState,
        records: &[PageRecord],
        dir: &Path,
    ) -> Result<Self> {
        if state.pages.len() != records.len()
            || state
                .pages
                .iter()
                .zip(records)
                .any(|(len, record)| *len != record.length)
        {
            return Err(invalid_data("page table does not match page records"));
        }

        let mut pages = Vec::with_capacity(records.len());
        for (index, record) in records.iter().enumerate() {
            let data = fs::read(page_path(dir, index))?;
            if data.len() as u64 != record.length {
                return Err(invalid_data(&format!(
                    "page {} is {} bytes, expected {}",
                    index,
                    data.len(),
                    record.length
                )));
            }
            if crc32fast::hash(&data) != record.crc32 {
                return Err(invalid_data(&format!("page {} checksum mismatch", index)));
            }
            pages.push(data);
        }

        let allocator =
            FreeListAllocator::from_state(state, opts.min_free_block_size, opts.fit_policy)?;

        Ok(Arena {
            allocator,
            pages,
            grow_page_size: opts.grow_page_size,
            max_page_count: opts.max_page_count.max(records.len() as u32),
        })
    }
}

fn page_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("page.{}", index))
}

fn invalid_data(message: &str) -> CacheError {
    CacheError::Io(io::Error::new(io::ErrorKind::InvalidData, message.to_string()))
}

/// Reserve and zero a page buffer, reporting exhaustion as an error
fn allocate_page(length: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(length).map_err(|_| {
        CacheError::Allocation(format!("page of {} bytes exceeds address space", length))
    })?;

    let mut page = Vec::new();
    page.try_reserve_exact(len).map_err(|e| {
        CacheError::Allocation(format!("cannot reserve page of {} bytes: {}", length, e))
    })?;
    page.resize(len, 0);
    Ok(page)
}
