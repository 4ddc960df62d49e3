//! Free-list allocator
//!
//! Free blocks are kept in a B-tree ordered by `(page, offset)`, which gives
//! first-fit its address order and makes neighbour lookup for coalescing a
//! pair of range queries.
//!
//! Allocation splits the chosen block only when the remainder is at least
//! `min_free_block_size`; smaller remainders are handed out with the
//! allocation so the free list never holds unusable slivers.

use super::{Allocation, AllocatorStats, FitPolicy, FreeBlock};
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persistable allocator layout (page table and free list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorState {
    pub pages: Vec<u64>,
    pub free_blocks: Vec<FreeBlock>,
}

#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    /// Free blocks indexed by (page, offset)
    free_blocks: BTreeMap<(u32, u64), FreeBlock>,

    /// Length of every page, indexed by page number
    pages: Vec<u64>,

    min_free_block_size: u64,
    policy: FitPolicy,

    total_size: u64,
    free_size: u64,
}

impl FreeListAllocator {
    /// Create an allocator whose first page is entirely free
    pub fn new(initial_page_size: u64, min_free_block_size: u64, policy: FitPolicy) -> Self {
        let mut allocator = FreeListAllocator {
            free_blocks: BTreeMap::new(),
            pages: Vec::new(),
            min_free_block_size,
            policy,
            total_size: 0,
            free_size: 0,
        };
        allocator.add_page(initial_page_size);
        allocator
    }

    /// Rebuild an allocator from a persisted layout
    ///
    /// Rejects layouts whose free blocks fall outside their page or overlap.
    pub fn from_state(
        state: AllocatorState,
        min_free_block_size: u64,
        policy: FitPolicy,
    ) -> Result<Self> {
        let total_size = state
            .pages
            .iter()
            .try_fold(0u64, |total, len| total.checked_add(*len))
            .ok_or_else(|| CacheError::Allocation("page table size overflows".to_string()))?;

        let mut allocator = FreeListAllocator {
            free_blocks: BTreeMap::new(),
            total_size,
            pages: state.pages,
            min_free_block_size,
            policy,
            free_size: 0,
        };

        for block in state.free_blocks {
            let page_len = allocator.page_len(block.page)?;
            if !fits_page(block.offset, block.length, page_len) {
                return Err(CacheError::Allocation(format!(
                    "free block {:?} outside page {} ({} bytes)",
                    block, block.page, page_len
                )));
            }
            if allocator.overlaps_free(&block) {
                return Err(CacheError::Allocation(format!(
                    "free block {:?} overlaps another free block",
                    block
                )));
            }
            allocator.free_size += block.length;
            allocator.insert_and_coalesce(block);
        }

        Ok(allocator)
    }

    pub fn to_state(&self) -> AllocatorState {
        AllocatorState {
            pages: self.pages.clone(),
            free_blocks: self.free_blocks.values().copied().collect(),
        }
    }

    /// Append a fully free page and return its number
    pub fn add_page(&mut self, length: u64) -> u32 {
        let page = self.pages.len() as u32;
        self.pages.push(length);
        self.total_size += length;

        if length > 0 {
            self.free_blocks
                .insert((page, 0), FreeBlock::new(page, 0, length));
            self.free_size += length;
        }

        tracing::debug!("Arena page {} added ({} bytes)", page, length);
        page
    }

    /// Reserve `size` bytes from the free list
    ///
    /// Returns `None` when no free block is large enough; the caller decides
    /// whether to grow. The free list is untouched in that case.
    pub fn allocate(&mut self, size: u64) -> Option<Allocation> {
        if size == 0 {
            return None;
        }

        let chosen = match self.policy {
            FitPolicy::FirstFit => self
                .free_blocks
                .values()
                .find(|block| block.length >= size)
                .copied(),
            FitPolicy::BestFit => self
                .free_blocks
                .values()
                .filter(|block| block.length >= size)
                .min_by_key(|block| (block.length, block.page, block.offset))
                .copied(),
        }?;

        self.free_blocks.remove(&chosen.key());

        let remainder = chosen.length - size;
        let length = if remainder >= self.min_free_block_size {
            let rest = FreeBlock::new(chosen.page, chosen.offset + size, remainder);
            self.free_blocks.insert(rest.key(), rest);
            size
        } else {
            chosen.length
        };

        self.free_size -= length;

        let allocation = Allocation {
            page: chosen.page,
            offset: chosen.offset,
            length,
        };
        tracing::debug!("Allocated {:?} for {} bytes", allocation, size);
        Some(allocation)
    }

    /// Return a range to the free list, merging it with free neighbours
    pub fn release(&mut self, allocation: Allocation) -> Result<()> {
        let page_len = self.page_len(allocation.page)?;
        if !fits_page(allocation.offset, allocation.length, page_len) {
            return Err(CacheError::Allocation(format!(
                "release of {:?} outside page {} ({} bytes)",
                allocation, allocation.page, page_len
            )));
        }

        let block = FreeBlock::from(allocation);
        if self.overlaps_free(&block) {
            tracing::warn!("Double release detected for {:?}", allocation);
            return Err(CacheError::Allocation(format!(
                "release of {:?} overlaps a free block",
                allocation
            )));
        }

        self.insert_and_coalesce(block);
        self.free_size += allocation.length;

        tracing::debug!("Released {:?}", allocation);
        Ok(())
    }

    /// Insert a free block and coalesce with adjacent blocks in its page
    fn insert_and_coalesce(&mut self, mut block: FreeBlock) {
        let mut to_remove = Vec::new();

        if let Some((&prev_key, &prev)) = self.free_blocks.range(..block.key()).next_back() {
            if let Some(merged) = prev.coalesce(&block) {
                block = merged;
                to_remove.push(prev_key);
            }
        }

        if let Some((&next_key, &next)) = self
            .free_blocks
            .range((block.page, block.end())..)
            .next()
        {
            if let Some(merged) = block.coalesce(&next) {
                block = merged;
                to_remove.push(next_key);
            }
        }

        for key in to_remove {
            self.free_blocks.remove(&key);
        }

        self.free_blocks.insert(block.key(), block);
    }

    /// Check whether a range intersects any free block
    fn overlaps_free(&self, block: &FreeBlock) -> bool {
        let prev_overlaps = self
            .free_blocks
            .range(..=block.key())
            .next_back()
            .map(|(_, prev)| prev.page == block.page && prev.end() > block.offset)
            .unwrap_or(false);

        let next_overlaps = self
            .free_blocks
            .range((block.page, block.offset)..(block.page, block.end()))
            .next()
            .is_some();

        prev_overlaps || next_overlaps
    }

    fn page_len(&self, page: u32) -> Result<u64> {
        self.pages
            .get(page as usize)
            .copied()
            .ok_or_else(|| CacheError::Allocation(format!("invalid page {}", page)))
    }

    /// Check whether a byte position is allocated
    pub fn is_allocated(&self, page: u32, position: u64) -> bool {
        match self.pages.get(page as usize) {
            Some(&len) if position < len => !self
                .free_blocks
                .range(..=(page, position))
                .next_back()
                .map(|(_, block)| block.contains(page, position))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = &FreeBlock> {
        self.free_blocks.values()
    }

    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn pages(&self) -> &[u64] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    pub fn allocated_size(&self) -> u64 {
        self.total_size - self.free_size
    }

    pub fn policy(&self) -> FitPolicy {
        self.policy
    }

    pub fn min_free_block_size(&self) -> u64 {
        self.min_free_block_size
    }

    pub fn largest_free_block(&self) -> u64 {
        self.free_blocks
            .values()
            .map(|block| block.length)
            .max()
            .unwrap_or(0)
    }

    pub fn fragmentation_score(&self) -> f64 {
        if self.free_size == 0 {
            return 0.0;
        }
        1.0 - (self.largest_free_block() as f64 / self.free_size as f64)
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total_size: self.total_size,
            free_size: self.free_size,
            allocated_size: self.allocated_size(),
            page_count: self.pages.len(),
            free_block_count: self.free_blocks.len(),
            largest_free_block: self.largest_free_block(),
            fragmentation: self.fragmentation_score(),
        }
    }

    /// Check the allocator against the set of live allocations
    ///
    /// Verifies that every range stays inside its page, that no two ranges
    /// (free or allocated) overlap, that no two free blocks are left
    /// uncoalesced, and that free plus allocated bytes equal the arena size.
    pub fn verify<'a, I>(&self, allocations: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Allocation>,
    {
        // (page, offset, length, is_free)
        let mut ranges: Vec<(u32, u64, u64, bool)> = self
            .free_blocks
            .values()
            .map(|b| (b.page, b.offset, b.length, true))
            .collect();
        ranges.extend(
            allocations
                .into_iter()
                .map(|a| (a.page, a.offset, a.length, false)),
        );

        // Bounds first, so the sums and range ends below cannot overflow
        for &(page, offset, length, _) in &ranges {
            let page_len = self.page_len(page)?;
            if !fits_page(offset, length, page_len) {
                return Err(CacheError::Allocation(format!(
                    "range {}+{} outside page {} ({} bytes)",
                    offset, length, page, page_len
                )));
            }
        }
        ranges.sort_unstable();

        let sum = |free: bool| {
            ranges
                .iter()
                .filter(|range| range.3 == free)
                .try_fold(0u64, |total, range| total.checked_add(range.2))
                .ok_or_else(|| CacheError::Allocation("range sizes overflow".to_string()))
        };
        let free_total = sum(true)?;
        let allocated_total = sum(false)?;

        if free_total != self.free_size {
            return Err(CacheError::Allocation(format!(
                "free accounting drift: tracked {} but blocks sum to {}",
                self.free_size, free_total
            )));
        }
        if free_total.checked_add(allocated_total) != Some(self.total_size) {
            return Err(CacheError::Allocation(format!(
                "free ({}) + allocated ({}) != arena size ({})",
                free_total, allocated_total, self.total_size
            )));
        }

        for (i, &(page, offset, length, _)) in ranges.iter().enumerate() {
            if let Some(&(next_page, next_offset, _, next_free)) = ranges.get(i + 1) {
                if next_page != page {
                    continue;
                }
                if offset + length > next_offset {
                    return Err(CacheError::Allocation(format!(
                        "overlapping ranges at page {} offset {}",
                        page, next_offset
                    )));
                }
                if ranges[i].3 && next_free && offset + length == next_offset {
                    return Err(CacheError::Allocation(format!(
                        "adjacent free blocks not coalesced at page {} offset {}",
                        page, next_offset
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Bounds check that stays exact for untrusted offsets and lengths
fn fits_page(offset: u64, length: u64, page_len: u64) -> bool {
    length > 0 && offset.checked_add(length).map_or(false, |end| end <= page_len)
}
