//! Shared memory block allocator
//!
//! Carves session buffers out of the pages that follow the control block.
//!
//! # Design
//! - Ordered free list of `{first_page, nr_pages, free}` blocks that always
//!   partitions the managed pages exactly
//! - First-fit allocation
//! - Freeing only flips the `free` flag; neighbouring free blocks are merged
//!   lazily, during a later allocation scan that needs the room
//! - One mutex around the whole list; never used from interrupt context

use parking_lot::Mutex;

use crate::layout::{SharedRegion, PAGE_SIZE};
use crate::{IpcError, Result};

/// A block of whole pages inside the shared region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmBlock {
    first_page: usize,
    nr_pages: usize,
}

impl ShmBlock {
    /// Byte offset from the start of the shared region
    pub fn offset(&self) -> usize {
        self.first_page * PAGE_SIZE
    }

    pub fn first_page(&self) -> usize {
        self.first_page
    }

    pub fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.nr_pages * PAGE_SIZE
    }

    /// Packed `(first_page << 16) | nr_pages` form carried in CONFIG records
    pub fn descriptor(&self) -> u32 {
        ((self.first_page as u32) << 16) | (self.nr_pages as u32 & 0xffff)
    }

    /// Check a byte range relative to the block start
    ///
    /// # Errors
    /// Returns `IpcError::OutOfBounds` if the range does not fit
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(IpcError::OutOfBounds {
                offset,
                len,
                size: self.size(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Node {
    first_page: usize,
    nr_pages: usize,
    free: bool,
}

/// First-fit page allocator over the session buffer area
pub struct BlockAllocator {
    nodes: Mutex<Vec<Node>>,
    first_page: usize,
    nr_pages: usize,
}

impl BlockAllocator {
    /// Manage `nr_pages` pages starting at page `first_page`
    pub fn new(first_page: usize, nr_pages: usize) -> Self {
        Self {
            nodes: Mutex::new(Self::initial(first_page, nr_pages)),
            first_page,
            nr_pages,
        }
    }

    /// Manage every page of `region` after the control block
    pub fn for_region(region: &SharedRegion) -> Self {
        let reserved = region.reserved_pages();
        Self::new(reserved, region.total_pages() - reserved)
    }

    fn initial(first_page: usize, nr_pages: usize) -> Vec<Node> {
        vec![Node {
            first_page,
            nr_pages,
            free: true,
        }]
    }

    /// Allocate `nr_pages` contiguous pages
    ///
    /// # Errors
    /// - `IpcError::InvalidSize` for a zero-page request
    /// - `IpcError::OutOfPages` if no free run is large enough
    pub fn alloc(&self, nr_pages: usize) -> Result<ShmBlock> {
        if nr_pages == 0 {
            return Err(IpcError::InvalidSize);
        }

        let mut nodes = self.nodes.lock();
        let mut i = 0;
        while i < nodes.len() {
            if !nodes[i].free {
                i += 1;
                continue;
            }

            // Too small: swallow free successors until it fits or they run out
            while nodes[i].nr_pages < nr_pages && i + 1 < nodes.len() && nodes[i + 1].free {
                let next = nodes.remove(i + 1);
                nodes[i].nr_pages += next.nr_pages;
            }

            if nodes[i].nr_pages < nr_pages {
                i += 1;
                continue;
            }

            let extra = nodes[i].nr_pages - nr_pages;
            nodes[i].nr_pages = nr_pages;
            nodes[i].free = false;

            if extra > 0 {
                if i + 1 < nodes.len() && nodes[i + 1].free {
                    // Hand the tail to the free neighbour
                    nodes[i + 1].first_page -= extra;
                    nodes[i + 1].nr_pages += extra;
                } else {
                    let tail = Node {
                        first_page: nodes[i].first_page + nr_pages,
                        nr_pages: extra,
                        free: true,
                    };
                    nodes.insert(i + 1, tail);
                }
            }

            let block = ShmBlock {
                first_page: nodes[i].first_page,
                nr_pages,
            };
            log::debug!(
                "shm: allocated {} pages at page {}",
                block.nr_pages,
                block.first_page
            );
            return Ok(block);
        }

        Err(IpcError::OutOfPages {
            requested: nr_pages,
        })
    }

    /// Return a block to the free list
    ///
    /// # Errors
    /// Returns `IpcError::UnknownBlock` if `block` is not currently allocated
    pub fn free(&self, block: ShmBlock) -> Result<()> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .iter_mut()
            .find(|n| n.first_page == block.first_page && n.nr_pages == block.nr_pages && !n.free)
            .ok_or(IpcError::UnknownBlock {
                offset: block.offset(),
            })?;

        node.free = true;
        log::debug!(
            "shm: freed {} pages at page {}",
            block.nr_pages,
            block.first_page
        );
        Ok(())
    }

    /// Forget every allocation
    pub fn reset(&self) {
        *self.nodes.lock() = Self::initial(self.first_page, self.nr_pages);
    }

    /// Pages managed in total
    pub fn total_pages(&self) -> usize {
        self.nr_pages
    }

    pub fn free_pages(&self) -> usize {
        self.nodes.lock()
            .iter()
            .filter(|n| n.free)
            .map(|n| n.nr_pages)
            .sum()
    }

    pub fn allocated_pages(&self) -> usize {
        self.nodes.lock()
            .iter()
            .filter(|n| !n.free)
            .map(|n| n.nr_pages)
            .sum()
    }

    /// Number of list nodes, free or not
    pub fn fragments(&self) -> usize {
        self.nodes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_split() {
        let alloc = BlockAllocator::new(4, 10);

        let a = alloc.alloc(3).unwrap();
        assert_eq!(a.first_page(), 4);
        assert_eq!(a.offset(), 4 * PAGE_SIZE);
        assert_eq!(alloc.fragments(), 2);

        let b = alloc.alloc(7).unwrap();
        assert_eq!(b.first_page(), 7);
        assert_eq!(alloc.fragments(), 2);
        assert_eq!(alloc.free_pages(), 0);

        assert_eq!(
            alloc.alloc(1),
            Err(IpcError::OutOfPages { requested: 1 })
        );
    }

    #[test]
    fn test_free_does_not_merge() {
        let alloc = BlockAllocator::new(0, 8);
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(2).unwrap();
        let _c = alloc.alloc(4).unwrap();

        alloc.free(a).unwrap();
        alloc.free(b).unwrap();
        assert_eq!(alloc.fragments(), 3);
        assert_eq!(alloc.free_pages(), 4);
    }

    #[test]
    fn test_alloc_merges_lazily() {
        let alloc = BlockAllocator::new(0, 8);
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(2).unwrap();
        let _c = alloc.alloc(4).unwrap();
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();

        // Neither free block fits 3 pages alone; the scan merges them
        let d = alloc.alloc(3).unwrap();
        assert_eq!(d.first_page(), 0);
        assert_eq!(alloc.free_pages(), 1);
        assert_eq!(alloc.fragments(), 3);
    }

    #[test]
    fn test_split_feeds_free_neighbour() {
        let alloc = BlockAllocator::new(0, 6);
        let a = alloc.alloc(3).unwrap();
        let _b = alloc.alloc(1).unwrap();
        alloc.free(a).unwrap();

        // Layout: [free 3][used 1][free 2]; reuse the first block for 1 page
        let c = alloc.alloc(1).unwrap();
        assert_eq!(c.first_page(), 0);
        assert_eq!(alloc.fragments(), 4);

        // Now [used 1][free 2][used 1][free 2]; the used successor forces a
        // split with a new trailing free node
        let d = alloc.alloc(1).unwrap();
        assert_eq!(d.first_page(), 1);
        assert_eq!(alloc.fragments(), 5);
    }

    #[test]
    fn test_oversized_match_grows_free_successor() {
        let alloc = BlockAllocator::new(0, 6);
        let a = alloc.alloc(2).unwrap();
        let b = alloc.alloc(2).unwrap();
        let _c = alloc.alloc(2).unwrap();
        alloc.free(a).unwrap();
        alloc.free(b).unwrap();

        // [free 2][free 2][used 2]: taking 1 page from the first block gives
        // its spare page to the free neighbour instead of adding a node
        let d = alloc.alloc(1).unwrap();
        assert_eq!(d.first_page(), 0);
        assert_eq!(alloc.fragments(), 3);

        let e = alloc.alloc(3).unwrap();
        assert_eq!(e.first_page(), 1);
        assert_eq!(alloc.free_pages(), 0);
    }

    #[test]
    fn test_invalid_requests() {
        let alloc = BlockAllocator::new(0, 4);
        assert_eq!(alloc.alloc(0), Err(IpcError::InvalidSize));

        let a = alloc.alloc(1).unwrap();
        alloc.free(a).unwrap();
        assert!(matches!(alloc.free(a), Err(IpcError::UnknownBlock { .. })));
    }

    #[test]
    fn test_reset() {
        let alloc = BlockAllocator::new(2, 4);
        alloc.alloc(1).unwrap();
        alloc.alloc(2).unwrap();
        alloc.reset();
        assert_eq!(alloc.fragments(), 1);
        assert_eq!(alloc.free_pages(), 4);
    }

    #[test]
    fn test_block_range_and_descriptor() {
        let block = ShmBlock {
            first_page: 5,
            nr_pages: 2,
        };
        assert_eq!(block.descriptor(), (5 << 16) | 2);
        assert!(block.check_range(0, 2 * PAGE_SIZE).is_ok());
        assert!(block.check_range(1, 2 * PAGE_SIZE).is_err());
        assert!(block.check_range(usize::MAX, 1).is_err());
    }

    /// Random alloc/free sequences never overlap and never lose pages
    #[test]
    fn test_random_sequences_conserve_pages() {
        const POOL: usize = 60;
        let alloc = BlockAllocator::new(4, POOL);
        let mut live: Vec<ShmBlock> = Vec::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..2000 {
            let roll = next();
            if roll % 3 != 0 || live.is_empty() {
                if let Ok(block) = alloc.alloc((next() % 8 + 1) as usize) {
                    live.push(block);
                }
            } else {
                let victim = live.swap_remove((next() as usize) % live.len());
                alloc.free(victim).unwrap();
            }

            for (i, a) in live.iter().enumerate() {
                assert!(a.first_page() >= 4 && a.first_page() + a.nr_pages() <= 4 + POOL);
                for b in &live[i + 1..] {
                    let disjoint = a.first_page() + a.nr_pages() <= b.first_page()
                        || b.first_page() + b.nr_pages() <= a.first_page();
                    assert!(disjoint, "{a:?} overlaps {b:?}");
                }
            }

            let live_pages: usize = live.iter().map(|b| b.nr_pages()).sum();
            assert_eq!(alloc.allocated_pages(), live_pages);
            assert_eq!(alloc.free_pages() + alloc.allocated_pages(), POOL);
        }
    }
}
