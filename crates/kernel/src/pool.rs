//! Fixed-block memory pool.
//!
//! Storage is one contiguous byte buffer cut into equal blocks. Free blocks
//! form an intrusive singly-linked list: the first four bytes of every free
//! block hold the index of the next free block, so `alloc` and `free` are
//! O(1) and need no side storage beyond a one-bit-per-block allocation map
//! used to reject double frees. Allocated blocks are handed out as-is; their
//! contents are not cleared.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

const END: u32 = u32::MAX;

/// Block sizes are rounded up to this alignment.
pub const BLOCK_ALIGN: usize = 4;

/// Handle to an allocated block, identified by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    addr: usize,
}

impl Block {
    pub const fn address(&self) -> usize {
        self.addr
    }
}

/// Pool usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolStats {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    /// Lowest number of free blocks ever observed.
    pub min_free_blocks: usize,
}

impl PoolStats {
    pub const fn new(total_blocks: usize, block_size: usize) -> Self {
        Self {
            block_size,
            total_blocks,
            free_blocks: total_blocks,
            used_blocks: 0,
            min_free_blocks: total_blocks,
        }
    }

    fn on_alloc(&mut self) {
        self.used_blocks += 1;
        self.free_blocks -= 1;
        self.min_free_blocks = self.min_free_blocks.min(self.free_blocks);
    }

    fn on_free(&mut self) {
        self.used_blocks -= 1;
        self.free_blocks += 1;
    }

    pub const fn is_exhausted(&self) -> bool {
        self.free_blocks == 0
    }

    /// Blocks in use as a percentage (0-100).
    pub fn utilization(&self) -> u8 {
        if self.total_blocks == 0 {
            0
        } else {
            ((self.used_blocks * 100) / self.total_blocks) as u8
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for PoolStats {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(
            fmt,
            "PoolStats{{ total: {}, free: {}, used: {}, min_free: {} }}",
            self.total_blocks,
            self.free_blocks,
            self.used_blocks,
            self.min_free_blocks
        );
    }
}

/// Rounds a requested block size up to [`BLOCK_ALIGN`], minimum one word.
pub const fn round_block_size(size: usize) -> usize {
    let size = if size < BLOCK_ALIGN { BLOCK_ALIGN } else { size };
    (size + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

pub struct MemoryPool {
    storage: Vec<u8>,
    block_size: usize,
    block_count: usize,
    free_head: u32,
    allocated: Vec<u32>,
    stats: PoolStats,
}

impl MemoryPool {
    pub fn new(block_count: usize, block_size: usize) -> KernelResult<Self> {
        let block_size = round_block_size(block_size);
        let bytes = block_count
            .checked_mul(block_size)
            .ok_or(KernelError::Parameter)?;
        Self::with_storage(vec![0u8; bytes], block_size)
    }

    /// Builds a pool over caller storage; trailing bytes that do not fill a
    /// whole block are left unused.
    pub fn with_storage(storage: Vec<u8>, block_size: usize) -> KernelResult<Self> {
        let block_size = round_block_size(block_size);
        let block_count = storage.len() / block_size;
        if block_count == 0 || block_count >= END as usize {
            return Err(KernelError::Parameter);
        }

        let mut pool = Self {
            storage,
            block_size,
            block_count,
            free_head: END,
            allocated: vec![0; block_count.div_ceil(32)],
            stats: PoolStats::new(block_count, block_size),
        };
        pool.reset();
        Ok(pool)
    }

    /// Returns every block to the free list.
    pub fn reset(&mut self) {
        for index in 0..self.block_count {
            let next = if index + 1 < self.block_count {
                (index + 1) as u32
            } else {
                END
            };
            self.write_next(index, next);
        }
        self.free_head = 0;
        self.allocated.fill(0);
        let min_free = self.stats.min_free_blocks;
        self.stats = PoolStats::new(self.block_count, self.block_size);
        self.stats.min_free_blocks = min_free;
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    /// One past the last byte of the last block.
    pub fn limit(&self) -> usize {
        self.base() + self.block_count * self.block_size
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.limit()
    }

    pub fn alloc(&mut self) -> Option<Block> {
        if self.free_head == END {
            return None;
        }
        let index = self.free_head as usize;
        self.free_head = self.read_next(index);
        self.set_allocated(index, true);
        self.stats.on_alloc();
        Some(self.block_at(index))
    }

    pub fn free(&mut self, block: Block) -> KernelResult<()> {
        let index = self.index_of(block.addr)?;
        if !self.is_allocated(index) {
            return Err(KernelError::DoubleFree);
        }
        self.set_allocated(index, false);
        self.write_next(index, self.free_head);
        self.free_head = index as u32;
        self.stats.on_free();
        Ok(())
    }

    pub fn block(&self, block: &Block) -> KernelResult<&[u8]> {
        let range = self.live_range(block)?;
        Ok(&self.storage[range])
    }

    pub fn block_mut(&mut self, block: &Block) -> KernelResult<&mut [u8]> {
        let range = self.live_range(block)?;
        Ok(&mut self.storage[range])
    }

    pub(crate) fn index_of(&self, address: usize) -> KernelResult<usize> {
        if !self.contains(address) {
            return Err(KernelError::InvalidBlock);
        }
        let offset = address - self.base();
        if offset % self.block_size != 0 {
            return Err(KernelError::InvalidBlock);
        }
        Ok(offset / self.block_size)
    }

    pub(crate) fn block_at(&self, index: usize) -> Block {
        Block {
            addr: self.base() + index * self.block_size,
        }
    }

    pub(crate) fn slot(&self, index: usize) -> &[u8] {
        let start = index * self.block_size;
        &self.storage[start..start + self.block_size]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.block_size;
        &mut self.storage[start..start + self.block_size]
    }

    fn live_range(&self, block: &Block) -> KernelResult<core::ops::Range<usize>> {
        let index = self.index_of(block.addr)?;
        if !self.is_allocated(index) {
            return Err(KernelError::InvalidBlock);
        }
        let start = index * self.block_size;
        Ok(start..start + self.block_size)
    }

    fn read_next(&self, index: usize) -> u32 {
        let start = index * self.block_size;
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.storage[start..start + 4]);
        u32::from_le_bytes(word)
    }

    fn write_next(&mut self, index: usize, next: u32) {
        let start = index * self.block_size;
        self.storage[start..start + 4].copy_from_slice(&next.to_le_bytes());
    }

    fn is_allocated(&self, index: usize) -> bool {
        self.allocated[index / 32] & (1 << (index % 32)) != 0
    }

    fn set_allocated(&mut self, index: usize, allocated: bool) {
        let bit = 1 << (index % 32);
        if allocated {
            self.allocated[index / 32] |= bit;
        } else {
            self.allocated[index / 32] &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_is_rounded_to_words() {
        assert_eq!(round_block_size(0), 4);
        assert_eq!(round_block_size(1), 4);
        assert_eq!(round_block_size(4), 4);
        assert_eq!(round_block_size(13), 16);

        let pool = MemoryPool::new(3, 10).unwrap();
        assert_eq!(pool.block_size(), 12);
        assert_eq!(pool.limit() - pool.base(), 36);
    }

    #[test]
    fn alloc_until_exhausted_then_reuse() {
        let mut pool = MemoryPool::new(3, 8).unwrap();
        let blocks: Vec<Block> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_none());
        assert!(pool.stats().is_exhausted());
        assert_eq!(pool.stats().utilization(), 100);

        for block in &blocks {
            assert!(pool.contains(block.address()));
        }

        pool.free(blocks[1]).unwrap();
        assert_eq!(pool.alloc(), Some(blocks[1]));
        assert_eq!(pool.stats().min_free_blocks, 0);
    }

    #[test]
    fn double_free_and_foreign_blocks_are_rejected() {
        let mut pool = MemoryPool::new(2, 16).unwrap();
        let mut other = MemoryPool::new(2, 16).unwrap();
        let block = pool.alloc().unwrap();
        let foreign = other.alloc().unwrap();

        assert_eq!(pool.free(foreign), Err(KernelError::InvalidBlock));
        pool.free(block).unwrap();
        assert_eq!(pool.free(block), Err(KernelError::DoubleFree));

        let misaligned = Block {
            addr: pool.base() + 3,
        };
        assert_eq!(pool.free(misaligned), Err(KernelError::InvalidBlock));
        assert_eq!(pool.stats().used_blocks, 0);
    }

    #[test]
    fn contents_survive_until_freed() {
        let mut pool = MemoryPool::new(2, 8).unwrap();
        let block = pool.alloc().unwrap();
        pool.block_mut(&block).unwrap().copy_from_slice(b"abcdefgh");
        assert_eq!(pool.block(&block).unwrap(), b"abcdefgh");

        pool.free(block).unwrap();
        assert_eq!(pool.block(&block), Err(KernelError::InvalidBlock));
    }

    #[test]
    fn caller_storage_ignores_partial_tail() {
        let pool = MemoryPool::with_storage(vec![0; 30], 8).unwrap();
        assert_eq!(pool.block_count(), 3);
        assert!(MemoryPool::with_storage(vec![0; 3], 8).is_err());
    }
}
