//! Arena space management
//!
//! The arena is a list of pages. Space inside a page is handed out as
//! [`Allocation`]s and reclaimed into a free list of [`FreeBlock`]s that are
//! coalesced with their neighbours on release. Ranges never cross a page
//! boundary.
//!
//! - [`free_list`] - first-fit / best-fit free-list allocator with splitting
//!   and coalescing

pub mod free_list;

pub use free_list::{AllocatorState, FreeListAllocator};

use serde::{Deserialize, Serialize};

/// Reserved range of the arena
///
/// `length` is the reserved size, which can be larger than the bytes stored
/// in it when a sub-threshold remainder was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Allocation {
    pub page: u32,
    pub offset: u64,
    pub length: u64,
}

impl Allocation {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Unallocated range available for reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBlock {
    pub page: u32,
    pub offset: u64,
    pub length: u64,
}

impl FreeBlock {
    pub fn new(page: u32, offset: u64, length: u64) -> Self {
        FreeBlock {
            page,
            offset,
            length,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Check if this block covers a byte position
    pub fn contains(&self, page: u32, position: u64) -> bool {
        self.page == page && position >= self.offset && position < self.end()
    }

    /// Check if this block touches another one in the same page
    pub fn is_adjacent(&self, other: &FreeBlock) -> bool {
        self.page == other.page && (self.end() == other.offset || other.end() == self.offset)
    }

    /// Merge two adjacent blocks
    pub fn coalesce(&self, other: &FreeBlock) -> Option<FreeBlock> {
        if !self.is_adjacent(other) {
            return None;
        }

        let offset = self.offset.min(other.offset);
        let end = self.end().max(other.end());

        Some(FreeBlock::new(self.page, offset, end - offset))
    }

    fn key(&self) -> (u32, u64) {
        (self.page, self.offset)
    }
}

impl From<Allocation> for FreeBlock {
    fn from(allocation: Allocation) -> Self {
        FreeBlock::new(allocation.page, allocation.offset, allocation.length)
    }
}

/// Free-block search policy
///
/// Only total space used is observable from outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FitPolicy {
    /// Lowest-addressed block that fits, scanning pages in order
    #[default]
    FirstFit,
    /// Smallest block that fits; ties go to the lowest address
    BestFit,
}

/// Snapshot of allocator accounting
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorStats {
    pub total_size: u64,
    pub free_size: u64,
    pub allocated_size: u64,
    pub page_count: usize,
    pub free_block_count: usize,
    pub largest_free_block: u64,
    /// 0.0 when all free space is one block, approaching 1.0 as it scatters
    pub fragmentation: f64,
}
