use super::ApertureId;
use std::collections::BTreeMap;

/// Allocation strategy over one channel of an aperture.
pub trait ApertureAllocator {
    /// Reserves `size` bytes aligned to `align`. Returns the GPU address.
    fn allocate(&mut self, size: u32, align: u32) -> Option<u32>;

    /// Releases a reservation. Returns its size, or `None` if `addr` was not reserved.
    fn free(&mut self, addr: u32) -> Option<u32>;

    /// The channel's `[base, limit)` range.
    fn bounds(&self) -> (u32, u32);

    /// Size of the largest unreserved hole.
    fn largest_free_block(&self) -> u32;
}

/// One channel of an aperture: a GPU address range handed out best-fit.
#[derive(Debug)]
pub struct Aperture {
    pub id: ApertureId,
    pub channel: u32,
    base: u32,
    limit: u32,
    /// Translated through the MMU rather than physical.
    pub mmu_backed: bool,

    // Occupied ranges: start -> size
    allocations: BTreeMap<u32, u32>,
}

impl Aperture {
    #[must_use]
    pub fn new(id: ApertureId, channel: u32, base: u32, size: u32, mmu_backed: bool) -> Self {
        Self {
            id,
            channel,
            base,
            limit: base + size,
            mmu_backed,
            allocations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, addr: u32, size: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(size) <= u64::from(self.limit)
    }

    /// Reserves exactly `[addr, addr + size)` if it is free and inside this channel.
    pub fn reserve_at(&mut self, addr: u32, size: u32) -> bool {
        if size == 0 || !self.contains(addr, size) {
            return false;
        }
        let end = u64::from(addr) + u64::from(size);
        let below = self
            .allocations
            .range(..=addr)
            .next_back()
            .is_some_and(|(&a, &s)| u64::from(a) + u64::from(s) > u64::from(addr));
        let above = self
            .allocations
            .range(addr..)
            .next()
            .is_some_and(|(&a, _)| u64::from(a) < end);
        if below || above {
            return false;
        }
        self.allocations.insert(addr, size);
        true
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.allocations.values().map(|&s| u64::from(s)).sum()
    }

    /// Holes between reservations as `(start, end)` pairs.
    fn holes(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mut cursor = self.base;
        self.allocations
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .filter_map(move |entry| {
                let (start, end) = match entry {
                    Some((&addr, &size)) => {
                        let hole = (cursor, addr);
                        cursor = addr + size;
                        hole
                    }
                    None => (cursor, self.limit),
                };
                (end > start).then_some((start, end))
            })
    }
}

impl ApertureAllocator for Aperture {
    fn bounds(&self) -> (u32, u32) {
        (self.base, self.limit)
    }

    /// Picks the smallest hole that still fits the aligned request.
    fn allocate(&mut self, size: u32, align: u32) -> Option<u32> {
        if size == 0 {
            return None;
        }

        let mut best: Option<(u32, u32)> = None; // (start, hole size)
        for (start, end) in self.holes() {
            let Some(aligned) = start.checked_next_multiple_of(align).map(u64::from) else {
                continue;
            };
            if aligned + u64::from(size) > u64::from(end) {
                continue;
            }
            let hole = end - start;
            if best.is_none_or(|(_, b)| hole < b) {
                best = Some((aligned as u32, hole));
            }
        }

        let (addr, _) = best?;
        self.allocations.insert(addr, size);
        Some(addr)
    }

    fn free(&mut self, addr: u32) -> Option<u32> {
        let size = self.allocations.remove(&addr);
        if size.is_none() {
            log::error!(
                "aperture {:?}/{}: free of untracked address 0x{addr:08x}",
                self.id,
                self.channel
            );
        }
        size
    }

    fn largest_free_block(&self) -> u32 {
        self.holes().map(|(s, e)| e - s).max().unwrap_or(0)
    }
}
