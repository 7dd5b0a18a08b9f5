//! Best-fit coalescing allocator.
//!
//! Free blocks are indexed twice: by `(size, address)` for best-fit search and
//! by address for neighbour lookup on free. Both indexes are red-black trees,
//! so allocation and release are O(log n) in the number of free blocks.

use crate::invariant_ppt::{assert_invariant, MM_NO_OVERLAP, MM_RANGE_IN_POOL, MM_REQUEST_ALIGNED};
use crate::rbtree::{NodeRef, RbTree};

/// Allocation granule. Every address and size handled by a pool is a
/// multiple of this.
pub const MM_BLOCK_SIZE: u32 = 32;

/// Round `size` up to the allocation granule.
pub const fn mm_round(size: u32) -> u32 {
    (size + MM_BLOCK_SIZE - 1) & !(MM_BLOCK_SIZE - 1)
}

/// Allocator over the address range `[base, base + size)`.
#[derive(Debug)]
pub struct MemPool {
    base: u32,
    size: u32,
    free_bytes: u32,
    by_size: RbTree<(u32, u32), ()>,
    by_addr: RbTree<u32, u32>,
}

impl MemPool {
    /// Create a pool whose whole range starts out as a single free block.
    pub fn new(base: u32, size: u32) -> Self {
        assert_invariant(
            MM_REQUEST_ALIGNED,
            size > 0 && base % MM_BLOCK_SIZE == 0 && size % MM_BLOCK_SIZE == 0,
            "pool range must be block aligned and non-empty",
            Some("MemPool::new"),
        );
        let mut pool = Self {
            base,
            size,
            free_bytes: 0,
            by_size: RbTree::new(),
            by_addr: RbTree::new(),
        };
        pool.insert_block(base, size);
        pool.free_bytes = size;
        log::debug!("mm: pool {:#x}+{:#x} initialised", base, size);
        pool
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Allocate `size` bytes; `None` when no free block is large enough.
    pub fn alloc(&mut self, size: u32) -> Option<u32> {
        assert_invariant(
            MM_REQUEST_ALIGNED,
            size > 0 && size % MM_BLOCK_SIZE == 0,
            "allocation size must be a non-zero multiple of the block size",
            Some("MemPool::alloc"),
        );

        let best = self.best_fit(size)?;
        let (block_size, block_addr) = *self.by_size.key(best);
        self.by_size.delete(best);

        let addr_node = match self.find_addr(block_addr) {
            Some(n) => n,
            None => panic!("mm: size index references unknown block {:#x}", block_addr),
        };

        let addr = if block_size == size {
            self.by_addr.delete(addr_node);
            block_addr
        } else {
            // Remainder stays at the start of the block; hand out the tail.
            let remainder = block_size - size;
            *self.by_addr.value_mut(addr_node) = remainder;
            self.insert_size(remainder, block_addr);
            block_addr + remainder
        };

        self.free_bytes -= size;
        log::trace!("mm: alloc {:#x}+{:#x}", addr, size);
        Some(addr)
    }

    /// Return `[addr, addr + size)` to the pool, merging with adjacent
    /// free blocks.
    pub fn free(&mut self, addr: u32, size: u32) {
        assert_invariant(
            MM_REQUEST_ALIGNED,
            size > 0 && size % MM_BLOCK_SIZE == 0 && addr % MM_BLOCK_SIZE == 0,
            "freed range must be block aligned",
            Some("MemPool::free"),
        );
        assert_invariant(
            MM_RANGE_IN_POOL,
            self.in_range(addr, size),
            "freed range outside of pool",
            Some("MemPool::free"),
        );

        let left = self.addr_floor(addr);
        let right = match left {
            Some(l) => self.by_addr.next(l),
            None => self.by_addr.first(),
        };
        let end = addr + size;

        let left_block = left.map(|l| (*self.by_addr.key(l), *self.by_addr.value(l)));
        let right_block = right.map(|r| (*self.by_addr.key(r), *self.by_addr.value(r)));

        let clear_left = left_block.map_or(true, |(la, ls)| la + ls <= addr);
        let clear_right = right_block.map_or(true, |(ra, _)| end <= ra);
        assert_invariant(
            MM_NO_OVERLAP,
            clear_left && clear_right,
            "freed range overlaps a free block",
            Some("MemPool::free"),
        );

        let merge_left = left_block.filter(|&(la, ls)| la + ls == addr);
        let merge_right = right_block.filter(|&(ra, _)| end == ra);

        match (merge_left, merge_right) {
            (Some((la, ls)), Some((ra, rs))) => {
                self.remove_size(ls, la);
                self.remove_size(rs, ra);
                if let Some(r) = right {
                    self.by_addr.delete(r);
                }
                let merged = ls + size + rs;
                if let Some(l) = left {
                    *self.by_addr.value_mut(l) = merged;
                }
                self.insert_size(merged, la);
            }
            (Some((la, ls)), None) => {
                self.remove_size(ls, la);
                let merged = ls + size;
                if let Some(l) = left {
                    *self.by_addr.value_mut(l) = merged;
                }
                self.insert_size(merged, la);
            }
            (None, Some((ra, rs))) => {
                self.remove_size(rs, ra);
                let merged = size + rs;
                // New start address sorts into the same slot as the right block.
                if let Some(r) = right {
                    self.by_addr.replace(r, addr, merged);
                }
                self.insert_size(merged, addr);
            }
            (None, None) => self.insert_block(addr, size),
        }

        self.free_bytes += size;
        log::trace!("mm: free {:#x}+{:#x}", addr, size);
    }

    /// Total free bytes.
    pub fn free_bytes(&self) -> u32 {
        self.free_bytes
    }

    /// Free blocks as `(address, size)` in address order.
    pub fn free_blocks(&self) -> Vec<(u32, u32)> {
        self.by_addr.iter().map(|(_, a, s)| (*a, *s)).collect()
    }

    /// Size of the largest free block.
    pub fn largest_free(&self) -> u32 {
        self.by_size.last().map_or(0, |n| self.by_size.key(n).0)
    }

    /// Whether `addr` lies inside the pool range.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && u64::from(addr) < u64::from(self.base) + u64::from(self.size)
    }

    /// Whether `[addr, addr + len)` lies inside the pool and overlaps no
    /// free block. Used to vet ranges supplied by the host.
    pub fn is_allocated(&self, addr: u32, len: u32) -> bool {
        if len == 0 || addr % MM_BLOCK_SIZE != 0 || !self.in_range(addr, len) {
            return false;
        }
        let end = addr + len;
        // Greatest free block starting below `end`.
        let mut cursor = self.by_addr.root();
        let mut candidate = None;
        while let Some(n) = cursor {
            if *self.by_addr.key(n) < end {
                candidate = Some(n);
                cursor = self.by_addr.right(n);
            } else {
                cursor = self.by_addr.left(n);
            }
        }
        match candidate {
            Some(n) => *self.by_addr.key(n) + *self.by_addr.value(n) <= addr,
            None => true,
        }
    }

    /// Full consistency check of both indexes and the free accounting.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.by_size.validate().is_err() {
            return Err("size index violates red-black properties");
        }
        if self.by_addr.validate().is_err() {
            return Err("address index violates red-black properties");
        }
        if self.by_size.len() != self.by_addr.len() {
            return Err("indexes disagree on the number of free blocks");
        }
        let mut total = 0u32;
        let mut prev_end: Option<u32> = None;
        for (_, &addr, &size) in self.by_addr.iter() {
            if size == 0 || size % MM_BLOCK_SIZE != 0 || addr % MM_BLOCK_SIZE != 0 {
                return Err("misaligned free block");
            }
            if !self.in_range(addr, size) {
                return Err("free block outside of pool");
            }
            if let Some(end) = prev_end {
                if end > addr {
                    return Err("free blocks overlap");
                }
                if end == addr {
                    return Err("adjacent free blocks not coalesced");
                }
            }
            if self.find_size(size, addr).is_none() {
                return Err("free block missing from size index");
            }
            prev_end = Some(addr + size);
            total += size;
        }
        if total != self.free_bytes {
            return Err("free byte accounting drifted");
        }
        Ok(())
    }

    fn in_range(&self, addr: u32, size: u32) -> bool {
        addr >= self.base
            && u64::from(addr) + u64::from(size) <= u64::from(self.base) + u64::from(self.size)
    }

    /// Smallest `(size, addr)` entry with size not less than `size`.
    fn best_fit(&self, size: u32) -> Option<NodeRef> {
        let mut cursor = self.by_size.root();
        let mut best = None;
        while let Some(n) = cursor {
            if self.by_size.key(n).0 >= size {
                best = Some(n);
                cursor = self.by_size.left(n);
            } else {
                cursor = self.by_size.right(n);
            }
        }
        best
    }

    /// Greatest free block starting at or below `addr`.
    fn addr_floor(&self, addr: u32) -> Option<NodeRef> {
        let mut cursor = self.by_addr.root();
        let mut floor = None;
        while let Some(n) = cursor {
            if *self.by_addr.key(n) <= addr {
                floor = Some(n);
                cursor = self.by_addr.right(n);
            } else {
                cursor = self.by_addr.left(n);
            }
        }
        floor
    }

    fn find_addr(&self, addr: u32) -> Option<NodeRef> {
        self.addr_floor(addr).filter(|&n| *self.by_addr.key(n) == addr)
    }

    fn find_size(&self, size: u32, addr: u32) -> Option<NodeRef> {
        let key = (size, addr);
        let mut cursor = self.by_size.root();
        while let Some(n) = cursor {
            let k = *self.by_size.key(n);
            if k == key {
                return Some(n);
            }
            cursor = if key < k {
                self.by_size.left(n)
            } else {
                self.by_size.right(n)
            };
        }
        None
    }

    fn insert_block(&mut self, addr: u32, size: u32) {
        let (parent, side) = self.by_addr.locate(|k, _| addr < *k);
        self.by_addr.insert(parent, side, addr, size);
        self.insert_size(size, addr);
    }

    fn insert_size(&mut self, size: u32, addr: u32) {
        let key = (size, addr);
        let (parent, side) = self.by_size.locate(|k, _| key < *k);
        self.by_size.insert(parent, side, key, ());
    }

    fn remove_size(&mut self, size: u32, addr: u32) {
        match self.find_size(size, addr) {
            Some(n) => {
                self.by_size.delete(n);
            }
            None => panic!("mm: block {:#x}+{:#x} missing from size index", addr, size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const B: u32 = MM_BLOCK_SIZE;

    #[test]
    fn mm_round_up() {
        assert_eq!(mm_round(1), B);
        assert_eq!(mm_round(B), B);
        assert_eq!(mm_round(B + 1), 2 * B);
    }

    #[test]
    fn mm_alloc_hands_out_block_tail() {
        let mut pool = MemPool::new(0x1000, 8 * B);
        let a = pool.alloc(2 * B).unwrap();
        assert_eq!(a, 0x1000 + 6 * B);
        assert_eq!(pool.free_blocks(), vec![(0x1000, 6 * B)]);
        assert_eq!(pool.free_bytes(), 6 * B);
        pool.validate().unwrap();
    }

    #[test]
    fn mm_exact_fit_consumes_block() {
        let mut pool = MemPool::new(0, 4 * B);
        assert_eq!(pool.alloc(4 * B), Some(0));
        assert!(pool.free_blocks().is_empty());
        assert_eq!(pool.alloc(B), None);
        pool.free(0, 4 * B);
        assert_eq!(pool.free_blocks(), vec![(0, 4 * B)]);
    }

    #[test]
    fn mm_best_fit_prefers_smallest_block() {
        let mut pool = MemPool::new(0, 16 * B);
        let blocks: Vec<u32> = (0..8).map(|_| pool.alloc(2 * B).unwrap()).collect();
        // Free a 2-block hole and a 4-block hole.
        pool.free(blocks[1], 2 * B);
        pool.free(blocks[4], 2 * B);
        pool.free(blocks[5], 2 * B);
        let a = pool.alloc(2 * B).unwrap();
        assert_eq!(a, blocks[1]);
        assert_eq!(pool.largest_free(), 4 * B);
        pool.validate().unwrap();
    }

    #[test]
    fn mm_three_way_merge() {
        let mut pool = MemPool::new(0, 3 * B);
        let c = pool.alloc(B).unwrap();
        let b = pool.alloc(B).unwrap();
        let a = pool.alloc(B).unwrap();
        assert_eq!((a, b, c), (0, B, 2 * B));
        pool.free(a, B);
        pool.free(c, B);
        assert_eq!(pool.free_blocks().len(), 2);
        pool.free(b, B);
        assert_eq!(pool.free_blocks(), vec![(0, 3 * B)]);
        pool.validate().unwrap();
    }

    #[test]
    fn mm_right_merge_moves_block_start() {
        let mut pool = MemPool::new(0, 4 * B);
        let tail = pool.alloc(2 * B).unwrap();
        let head = pool.alloc(2 * B).unwrap();
        assert_eq!((head, tail), (0, 2 * B));
        pool.free(tail, 2 * B);
        pool.free(B, B);
        assert_eq!(pool.free_blocks(), vec![(B, 3 * B)]);
        pool.free(0, B);
        assert_eq!(pool.free_blocks(), vec![(0, 4 * B)]);
        pool.validate().unwrap();
    }

    #[test]
    fn mm_is_allocated_checks_free_overlap() {
        let mut pool = MemPool::new(0x100, 8 * B);
        let a = pool.alloc(2 * B).unwrap();
        assert!(pool.is_allocated(a, 2 * B));
        assert!(!pool.is_allocated(a - B, 2 * B));
        assert!(!pool.is_allocated(0x100 + 8 * B, B));
        assert!(!pool.is_allocated(a + 1, B));
        pool.free(a, 2 * B);
        assert!(!pool.is_allocated(a, 2 * B));
    }

    #[test]
    #[should_panic(expected = "MM_NO_OVERLAP")]
    fn mm_double_free_is_a_bug() {
        let mut pool = MemPool::new(0, 4 * B);
        let a = pool.alloc(B).unwrap();
        pool.free(a, B);
        pool.free(a, B);
    }

    #[test]
    #[should_panic(expected = "MM_REQUEST_ALIGNED")]
    fn mm_unaligned_request_is_a_bug() {
        let mut pool = MemPool::new(0, 4 * B);
        pool.alloc(B + 4);
    }

    proptest! {
        #[test]
        fn mm_churn_returns_to_original_bounds(
            sizes in proptest::collection::vec(1u32..6, 1..60),
            order in proptest::collection::vec(any::<usize>(), 60),
        ) {
            let base = 0x4000;
            let total = 256 * B;
            let mut pool = MemPool::new(base, total);
            let mut live: Vec<(u32, u32)> = Vec::new();
            for (i, s) in sizes.iter().enumerate() {
                let size = s * B;
                if let Some(addr) = pool.alloc(size) {
                    prop_assert!(addr >= base && addr + size <= base + total);
                    live.push((addr, size));
                }
                // Interleave frees.
                if i % 3 == 2 && !live.is_empty() {
                    let (addr, size) = live.swap_remove(order[i] % live.len());
                    pool.free(addr, size);
                }
                prop_assert!(pool.validate().is_ok());
            }
            for (k, _) in order.iter().enumerate() {
                if live.is_empty() {
                    break;
                }
                let (addr, size) = live.swap_remove(order[k] % live.len());
                pool.free(addr, size);
                prop_assert!(pool.validate().is_ok());
            }
            while let Some((addr, size)) = live.pop() {
                pool.free(addr, size);
            }
            prop_assert_eq!(pool.free_blocks(), vec![(base, total)]);
        }
    }
}
