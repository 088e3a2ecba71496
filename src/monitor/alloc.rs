//! First-fit page allocator over the monitor's physical range

use crate::region::PAGE_SIZE;

#[derive(Debug)]
pub(crate) struct PageAllocator {
    /// Free ranges as (base, pages), sorted by base, never adjacent
    free: Vec<(u64, usize)>,
    total_pages: usize,
}

impl PageAllocator {
    pub(crate) fn new(base: u64, total_pages: usize) -> Self {
        Self {
            free: vec![(base, total_pages)],
            total_pages,
        }
    }

    pub(crate) fn free_pages(&self) -> usize {
        self.free.iter().map(|&(_, pages)| pages).sum()
    }

    pub(crate) fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages()
    }

    /// Reserve `pages` contiguous pages, returning the base address
    pub(crate) fn alloc(&mut self, pages: usize) -> Option<u64> {
        if pages == 0 {
            return None;
        }
        let slot = self.free.iter().position(|&(_, avail)| avail >= pages)?;
        let (base, avail) = self.free[slot];
        if avail == pages {
            self.free.remove(slot);
        } else {
            self.free[slot] = (base + (pages * PAGE_SIZE) as u64, avail - pages);
        }
        Some(base)
    }

    /// Return a range obtained from `alloc`
    pub(crate) fn release(&mut self, base: u64, pages: usize) {
        let at = self.free.partition_point(|&(b, _)| b < base);
        self.free.insert(at, (base, pages));

        // Merge with the following range, then with the preceding one
        if at + 1 < self.free.len() {
            let (b, p) = self.free[at];
            let (next_b, next_p) = self.free[at + 1];
            if b + (p * PAGE_SIZE) as u64 == next_b {
                self.free[at] = (b, p + next_p);
                self.free.remove(at + 1);
            }
        }
        if at > 0 {
            let (prev_b, prev_p) = self.free[at - 1];
            let (b, p) = self.free[at];
            if prev_b + (prev_p * PAGE_SIZE) as u64 == b {
                self.free[at - 1] = (prev_b, prev_p + p);
                self.free.remove(at);
            }
        }
    }
}
