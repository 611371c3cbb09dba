#![allow(clippy::cast_possible_truncation)]

//! Physical memory provider.
//!
//! The backing store is split into two regions:
//!
//! * a contiguous carve-out used by the `CONPHYS` aperture, and
//! * the EMEM region, which is either handed to the EMEM aperture as another
//!   contiguous carve-out (MMU off) or served page-by-page through
//!   [`PhysicalMemory::alloc_physical_pages`] (MMU on).
//!
//! GPU physical addresses are 32-bit.

use parking_lot::{Mutex, RwLock};

use crate::utils::{PAGE_SHIFT, PAGE_SIZE};

/// Physical address of the first byte of backing memory.
pub const PHYS_BASE: u32 = 0x8000_0000;

/// A physically contiguous span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRegion {
    pub base: u32,
    pub size: u32,
}

impl PhysRegion {
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }

    #[must_use]
    pub const fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && (addr as u64 + len as u64) <= self.end() as u64
    }
}

#[derive(Debug)]
struct PagePool {
    /// Free page addresses, popped from the back.
    free: Vec<u32>,
    /// One entry per page in the EMEM region.
    allocated: Vec<bool>,
}

/// Simulated DMA-capable memory shared by the driver and the command processor.
#[derive(Debug)]
pub struct PhysicalMemory {
    conphys: PhysRegion,
    emem: PhysRegion,
    bytes: RwLock<Vec<u8>>,
    pages: Mutex<PagePool>,
}

impl PhysicalMemory {
    #[must_use]
    pub fn new(conphys_size: u32, emem_size: u32) -> Self {
        let conphys = PhysRegion {
            base: PHYS_BASE,
            size: conphys_size,
        };
        let emem = PhysRegion {
            base: PHYS_BASE + conphys_size,
            size: emem_size,
        };

        let num_pages = (emem_size >> PAGE_SHIFT) as usize;
        // Reverse order so that pops hand out ascending, mostly contiguous pages.
        let free = (0..num_pages as u32)
            .rev()
            .map(|i| emem.base + (i << PAGE_SHIFT))
            .collect();

        Self {
            conphys,
            emem,
            bytes: RwLock::new(vec![0u8; (conphys_size + emem_size) as usize]),
            pages: Mutex::new(PagePool {
                free,
                allocated: vec![false; num_pages],
            }),
        }
    }

    #[must_use]
    pub const fn conphys_region(&self) -> PhysRegion {
        self.conphys
    }

    #[must_use]
    pub const fn emem_region(&self) -> PhysRegion {
        self.emem
    }

    #[must_use]
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        self.offset(addr, len as usize).is_some()
    }

    /// Allocates `count` pages from the EMEM page pool.
    ///
    /// Returns `None` (and allocates nothing) if the pool cannot satisfy the request.
    pub fn alloc_physical_pages(&self, count: u32) -> Option<Vec<u32>> {
        let mut pool = self.pages.lock();
        if (pool.free.len() as u32) < count {
            return None;
        }

        let mut pages = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let page = pool.free.pop()?;
            let idx = ((page - self.emem.base) >> PAGE_SHIFT) as usize;
            pool.allocated[idx] = true;
            pages.push(page);
        }
        drop(pool);

        for &page in &pages {
            self.fill(page, 0, PAGE_SIZE);
        }
        Some(pages)
    }

    /// Returns pages to the EMEM page pool. Unknown or already-free pages are ignored.
    pub fn free_physical_pages(&self, pages: &[u32]) {
        let mut pool = self.pages.lock();
        for &page in pages {
            if !self.emem.contains(page, PAGE_SIZE) {
                log::error!("physmem: freeing page 0x{page:08x} outside the page pool");
                continue;
            }
            let idx = ((page - self.emem.base) >> PAGE_SHIFT) as usize;
            if !pool.allocated[idx] {
                log::error!("physmem: double free of page 0x{page:08x}");
                continue;
            }
            pool.allocated[idx] = false;
            pool.free.push(page);
        }
    }

    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.pages.lock().free.len()
    }

    fn offset(&self, addr: u32, len: usize) -> Option<usize> {
        let end = u64::from(addr) + len as u64;
        if addr < PHYS_BASE || end > u64::from(self.emem.end()) {
            return None;
        }
        Some((addr - PHYS_BASE) as usize)
    }

    /// Copies out of physical memory. Returns `false` if the range is not backed.
    pub fn read(&self, addr: u32, dst: &mut [u8]) -> bool {
        let Some(off) = self.offset(addr, dst.len()) else {
            return false;
        };
        dst.copy_from_slice(&self.bytes.read()[off..off + dst.len()]);
        true
    }

    /// Copies into physical memory. Returns `false` if the range is not backed.
    pub fn write(&self, addr: u32, src: &[u8]) -> bool {
        let Some(off) = self.offset(addr, src.len()) else {
            return false;
        };
        self.bytes.write()[off..off + src.len()].copy_from_slice(src);
        true
    }

    pub fn fill(&self, addr: u32, value: u8, len: u32) -> bool {
        let Some(off) = self.offset(addr, len as usize) else {
            return false;
        };
        self.bytes.write()[off..off + len as usize].fill(value);
        true
    }

    #[must_use]
    pub fn read_u32(&self, addr: u32) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf).then(|| u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> bool {
        self.write(addr, &value.to_le_bytes())
    }

    /// Writes a run of dwords starting at `addr`.
    pub fn write_words(&self, addr: u32, words: &[u32]) -> bool {
        let Some(off) = self.offset(addr, words.len() * 4) else {
            return false;
        };
        let mut bytes = self.bytes.write();
        for (i, w) in words.iter().enumerate() {
            bytes[off + i * 4..off + i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_pool_alloc_free() {
        let mem = PhysicalMemory::new(16 * PAGE_SIZE, 8 * PAGE_SIZE);
        assert_eq!(mem.free_page_count(), 8);

        let pages = mem.alloc_physical_pages(3).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1], pages[0] + PAGE_SIZE);
        assert_eq!(mem.free_page_count(), 5);

        assert!(mem.alloc_physical_pages(6).is_none());
        assert_eq!(mem.free_page_count(), 5);

        mem.free_physical_pages(&pages);
        assert_eq!(mem.free_page_count(), 8);

        // Double free is ignored.
        mem.free_physical_pages(&pages[..1]);
        assert_eq!(mem.free_page_count(), 8);
    }

    #[test]
    fn test_read_write_bounds() {
        let mem = PhysicalMemory::new(PAGE_SIZE, PAGE_SIZE);
        assert!(mem.write_u32(PHYS_BASE + 4, 0xdead_beef));
        assert_eq!(mem.read_u32(PHYS_BASE + 4), Some(0xdead_beef));
        assert!(!mem.write_u32(PHYS_BASE + 2 * PAGE_SIZE, 1));
        assert_eq!(mem.read_u32(PHYS_BASE - 4), None);
    }
}
