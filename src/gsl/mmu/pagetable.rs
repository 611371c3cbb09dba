#![allow(clippy::cast_possible_truncation)]

//! Page tables and the super-PTE dirty filter.
//!
//! A page table is a flat array of 32-bit PTEs in physically contiguous
//! memory, one entry per 4 KB page of the GPU virtual range. Entries are
//! grouped into super-PTEs of [`SUPER_PTE`] entries; unmapping a range marks
//! its super-PTEs dirty, and a later map touching a dirty super-PTE (or not
//! starting and ending on super-PTE boundaries) needs a TLB flush.

use std::collections::HashMap;
use std::sync::Arc;

use super::PtOwner;
use crate::config::KgslConfig;
use crate::error::{KgslError, KgslResult};
use crate::gsl::Pid;
use crate::gsl::memory::{MemDesc, MemFlags, ScatterList, SharedMem};
use crate::hw::regs::MH_PTE_ADDR_MASK;
use crate::hw::{DeviceId, PhysicalMemory};
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};

/// PTEs covered by one dirty bit.
pub const SUPER_PTE: u32 = 8;
/// Slack entries past the end of the virtual range.
pub const PT_EXTRA_ENTRIES: u32 = 16;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageTableStats {
    pub maps: u64,
    pub unmaps: u64,
    pub flushes_requested: u64,
}

/// One GPU address space.
#[derive(Debug)]
pub struct PageTable {
    pub owner: PtOwner,
    pub va_base: u32,
    pub va_range: u32,
    /// PTE array storage.
    pub base: MemDesc,
    dirty: Vec<u64>,
    /// One past the highest super-PTE that may hold mappings.
    pub last_superpte: u32,
    pub refcnt: u32,
    pub stats: PageTableStats,
}

impl PageTable {
    #[must_use]
    pub const fn num_entries(va_range: u32) -> u32 {
        (va_range >> PAGE_SHIFT) + PT_EXTRA_ENTRIES
    }

    fn new(owner: PtOwner, va_base: u32, va_range: u32, base: MemDesc) -> Self {
        let superptes = Self::num_entries(va_range).div_ceil(SUPER_PTE);
        Self {
            owner,
            va_base,
            va_range,
            base,
            dirty: vec![0; superptes.div_ceil(64) as usize],
            last_superpte: 0,
            refcnt: 0,
            stats: PageTableStats::default(),
        }
    }

    /// First PTE index of `[va, va + pages)`, or `BadParam` if it leaves the range.
    fn pte_range(&self, va: u32, pages: u32) -> KgslResult<u32> {
        let end = u64::from(va) + (u64::from(pages) << PAGE_SHIFT);
        if va < self.va_base
            || end > u64::from(self.va_base) + u64::from(self.va_range)
            || va & (PAGE_SIZE - 1) != 0
        {
            return Err(KgslError::bad_param(format!(
                "range 0x{va:08x}+{pages} pages outside page table"
            )));
        }
        Ok((va - self.va_base) >> PAGE_SHIFT)
    }

    fn pte_addr(&self, idx: u32) -> u32 {
        self.base.gpuaddr + idx * 4
    }

    fn read_pte(&self, physmem: &PhysicalMemory, idx: u32) -> u32 {
        physmem.read_u32(self.pte_addr(idx)).unwrap_or(0)
    }

    fn is_dirty(&self, superpte: u32) -> bool {
        self.dirty[(superpte / 64) as usize] & (1 << (superpte % 64)) != 0
    }

    fn set_dirty(&mut self, superpte: u32) {
        self.dirty[(superpte / 64) as usize] |= 1 << (superpte % 64);
    }

    pub(crate) fn reset_filter(&mut self) {
        self.dirty.fill(0);
    }

    fn superpte_empty(&self, physmem: &PhysicalMemory, superpte: u32) -> bool {
        let first = superpte * SUPER_PTE;
        (first..first + SUPER_PTE).all(|i| self.read_pte(physmem, i) == 0)
    }

    /// Writes one PTE per page. Returns whether the TLB must be flushed
    /// before the new mapping can be relied on.
    pub fn map(
        &mut self,
        physmem: &PhysicalMemory,
        va: u32,
        sg: &ScatterList,
        access: u32,
    ) -> KgslResult<bool> {
        if sg.num_pages == 0 {
            return Err(KgslError::bad_param("empty scatter list"));
        }
        let first = self.pte_range(va, sg.num_pages)?;
        let last = first + sg.num_pages - 1;

        if self.read_pte(physmem, first) != 0 {
            log::error!(
                "mmu: pagetable {:?}: pte at 0x{va:08x} already populated",
                self.owner
            );
            return Err(KgslError::failure("page table entry already populated"));
        }

        let ptes: Vec<u32> = sg
            .iter()
            .map(|page| (page & MH_PTE_ADDR_MASK) | access)
            .collect();
        if !physmem.write_words(self.pte_addr(first), &ptes) {
            return Err(KgslError::failure("page table backing not addressable"));
        }

        let (sp_first, sp_last) = (first / SUPER_PTE, last / SUPER_PTE);
        let unaligned = first % SUPER_PTE != 0 || (last + 1) % SUPER_PTE != 0;
        let dirty = (sp_first..=sp_last).any(|sp| self.is_dirty(sp));

        self.last_superpte = self.last_superpte.max(sp_last + 1);
        self.stats.maps += 1;
        Ok(dirty || unaligned)
    }

    /// Clears the PTEs of `[va, va + size)` and marks their super-PTEs dirty.
    pub fn unmap(&mut self, physmem: &PhysicalMemory, va: u32, size: u32) -> KgslResult<()> {
        let pages = size.div_ceil(PAGE_SIZE);
        if pages == 0 {
            return Ok(());
        }
        let first = self.pte_range(va, pages)?;
        let last = first + pages - 1;

        physmem.write_words(self.pte_addr(first), &vec![0; pages as usize]);

        let (sp_first, sp_last) = (first / SUPER_PTE, last / SUPER_PTE);
        for sp in sp_first..=sp_last {
            self.set_dirty(sp);
        }

        if sp_last + 1 >= self.last_superpte {
            while self.last_superpte > 0 && self.superpte_empty(physmem, self.last_superpte - 1) {
                self.last_superpte -= 1;
            }
        }

        self.stats.unmaps += 1;
        Ok(())
    }

    /// Physical pages behind `[va, va + size)`.
    pub fn getmap(&self, physmem: &PhysicalMemory, va: u32, size: u32) -> KgslResult<ScatterList> {
        let pages = size.div_ceil(PAGE_SIZE);
        let first = self.pte_range(va, pages)?;

        let mut out = Vec::with_capacity(pages as usize);
        for idx in first..first + pages {
            let pte = self.read_pte(physmem, idx);
            if pte == 0 {
                return Err(KgslError::bad_param(format!(
                    "0x{:08x} is not mapped",
                    self.va_base + (idx << PAGE_SHIFT)
                )));
            }
            out.push(pte & MH_PTE_ADDR_MASK);
        }
        Ok(ScatterList::from_pages(out))
    }
}

/// Every page table in the driver, keyed by owner.
///
/// With a global table configured there is at most one entry. Each table is
/// reference counted by `(device, process)` attachments and destroyed when
/// the last one goes away.
#[derive(Debug)]
pub struct PageTableSet {
    physmem: Arc<PhysicalMemory>,
    enabled: bool,
    per_process: bool,
    va_base: u32,
    va_range: u32,
    tables: HashMap<PtOwner, PageTable>,
    /// Bumped whenever a map requires every device to flush its TLB.
    tlb_generation: u64,
}

impl PageTableSet {
    #[must_use]
    pub fn new(physmem: Arc<PhysicalMemory>, config: &KgslConfig) -> Self {
        Self {
            physmem,
            enabled: config.mmu_enabled,
            per_process: config.per_process_pagetable,
            va_base: config.va_base,
            va_range: config.va_range,
            tables: HashMap::new(),
            tlb_generation: 0,
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn va_range(&self) -> (u32, u32) {
        (self.va_base, self.va_range)
    }

    #[must_use]
    pub const fn tlb_generation(&self) -> u64 {
        self.tlb_generation
    }

    #[must_use]
    pub const fn owner_for(&self, pid: Pid) -> PtOwner {
        if self.per_process {
            PtOwner::Process(pid)
        } else {
            PtOwner::Global
        }
    }

    #[must_use]
    pub fn get(&self, owner: PtOwner) -> Option<&PageTable> {
        self.tables.get(&owner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Takes a reference on `owner`'s table, creating it on first use.
    pub fn attach(
        &mut self,
        sharedmem: &mut SharedMem,
        owner: PtOwner,
        device: DeviceId,
    ) -> KgslResult<()> {
        if !self.enabled {
            return Ok(());
        }

        if !self.tables.contains_key(&owner) {
            let bytes = PageTable::num_entries(self.va_range) * 4;
            let base = sharedmem.alloc_unmapped(
                device,
                MemFlags::CONPHYS | MemFlags::ALIGN4K,
                bytes,
            )?;
            log::debug!(
                "mmu: created pagetable {owner:?} at 0x{:08x} ({} entries)",
                base.gpuaddr,
                PageTable::num_entries(self.va_range)
            );
            self.tables
                .insert(owner, PageTable::new(owner, self.va_base, self.va_range, base));
        }

        if let Some(pt) = self.tables.get_mut(&owner) {
            pt.refcnt += 1;
        }
        Ok(())
    }

    /// Drops a reference. Returns `true` if the table was destroyed.
    pub fn detach(&mut self, sharedmem: &mut SharedMem, owner: PtOwner) -> bool {
        let Some(pt) = self.tables.get_mut(&owner) else {
            return false;
        };
        pt.refcnt = pt.refcnt.saturating_sub(1);
        if pt.refcnt > 0 {
            return false;
        }

        let Some(pt) = self.tables.remove(&owner) else {
            return false;
        };
        if pt.last_superpte != 0 {
            log::warn!("mmu: destroying pagetable {owner:?} with live mappings");
        }
        if let Err(e) = sharedmem.free(self, &pt.base) {
            log::error!("mmu: failed to free pagetable {owner:?} backing: {e}");
        }
        log::debug!("mmu: destroyed pagetable {owner:?}");
        true
    }

    fn table_mut(&mut self, owner: PtOwner) -> KgslResult<&mut PageTable> {
        self.tables
            .get_mut(&owner)
            .ok_or_else(|| KgslError::failure(format!("no page table for {owner:?}")))
    }

    /// Maps `sg` at `va`. A map needing a TLB flush resets the table's dirty
    /// filter and bumps the flush generation every device compares against.
    pub fn map(&mut self, owner: PtOwner, va: u32, sg: &ScatterList, access: u32) -> KgslResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let physmem = self.physmem.clone();
        let pt = self.table_mut(owner)?;
        if pt.map(&physmem, va, sg, access)? {
            pt.reset_filter();
            pt.stats.flushes_requested += 1;
            self.tlb_generation += 1;
        }
        Ok(())
    }

    pub fn unmap(&mut self, owner: PtOwner, va: u32, size: u32) -> KgslResult<()> {
        if !self.enabled {
            return Ok(());
        }
        let physmem = self.physmem.clone();
        self.table_mut(owner)?.unmap(&physmem, va, size)
    }

    pub fn getmap(&self, owner: PtOwner, va: u32, size: u32) -> KgslResult<ScatterList> {
        if !self.enabled {
            return Err(KgslError::NotSupported("mmu disabled".into()));
        }
        self.tables
            .get(&owner)
            .ok_or_else(|| KgslError::failure(format!("no page table for {owner:?}")))?
            .getmap(&self.physmem, va, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SharedMem, PageTableSet) {
        let cfg = KgslConfig::new()
            .with_memory(256 * 1024, 1024 * 1024)
            .with_va_range(0x6600_0000, 4 * 1024 * 1024);
        let physmem = Arc::new(PhysicalMemory::new(cfg.conphys_size, cfg.emem_size));
        let mut sm = SharedMem::new(physmem.clone(), &cfg).unwrap();
        let mut pts = PageTableSet::new(physmem, &cfg);
        pts.attach(&mut sm, PtOwner::Global, DeviceId::Yamato).unwrap();
        (sm, pts)
    }

    fn pages(sm: &SharedMem, n: u32) -> ScatterList {
        ScatterList::from_pages(sm.physmem().alloc_physical_pages(n).unwrap())
    }

    const VA: u32 = 0x6600_0000;
    const RW: u32 = crate::hw::regs::MH_PTE_READ | crate::hw::regs::MH_PTE_WRITE;

    #[test]
    fn test_map_getmap_unmap_remap() {
        let (sm, mut pts) = setup();
        let sg = pages(&sm, 5);

        pts.map(PtOwner::Global, VA + 8 * PAGE_SIZE, &sg, RW).unwrap();
        let back = pts.getmap(PtOwner::Global, VA + 8 * PAGE_SIZE, 5 * PAGE_SIZE).unwrap();
        assert_eq!(back.to_vec(), sg.to_vec());

        pts.unmap(PtOwner::Global, VA + 8 * PAGE_SIZE, 5 * PAGE_SIZE).unwrap();
        assert!(pts.getmap(PtOwner::Global, VA + 8 * PAGE_SIZE, PAGE_SIZE).is_err());

        // No residual "already populated" state.
        pts.map(PtOwner::Global, VA + 8 * PAGE_SIZE, &sg, RW).unwrap();
    }

    #[test]
    fn test_double_map_is_fatal() {
        let (sm, mut pts) = setup();
        let sg = pages(&sm, 1);
        pts.map(PtOwner::Global, VA, &sg, RW).unwrap();
        let err = pts.map(PtOwner::Global, VA, &sg, RW).unwrap_err();
        assert!(matches!(err, KgslError::Failure(_)));
    }

    #[test]
    fn test_flush_filter() {
        let (sm, mut pts) = setup();

        // Aligned map onto clean super-PTEs: no flush.
        let a = pages(&sm, 8);
        pts.map(PtOwner::Global, VA, &a, RW).unwrap();
        assert_eq!(pts.tlb_generation(), 0);

        // Unaligned map always flushes.
        let b = pages(&sm, 1);
        pts.map(PtOwner::Global, VA + 16 * PAGE_SIZE, &b, RW).unwrap();
        assert_eq!(pts.tlb_generation(), 1);

        // Unmap dirties; an aligned remap of the same super-PTE must flush.
        pts.unmap(PtOwner::Global, VA, 8 * PAGE_SIZE).unwrap();
        pts.map(PtOwner::Global, VA, &a, RW).unwrap();
        assert_eq!(pts.tlb_generation(), 2);

        // The flush reset the filter.
        pts.map(PtOwner::Global, VA + 24 * PAGE_SIZE, &pages(&sm, 8), RW)
            .unwrap();
        assert_eq!(pts.tlb_generation(), 2);
    }

    #[test]
    fn test_high_water_mark_shrinks() {
        let (sm, mut pts) = setup();
        pts.map(PtOwner::Global, VA, &pages(&sm, 8), RW).unwrap();
        pts.map(PtOwner::Global, VA + 32 * PAGE_SIZE, &pages(&sm, 8), RW)
            .unwrap();
        assert_eq!(pts.get(PtOwner::Global).unwrap().last_superpte, 5);

        pts.unmap(PtOwner::Global, VA + 32 * PAGE_SIZE, 8 * PAGE_SIZE)
            .unwrap();
        assert_eq!(pts.get(PtOwner::Global).unwrap().last_superpte, 1);
    }

    #[test]
    fn test_refcounted_lifetime() {
        let (mut sm, mut pts) = setup();
        pts.attach(&mut sm, PtOwner::Global, DeviceId::G12).unwrap();
        assert_eq!(pts.get(PtOwner::Global).unwrap().refcnt, 2);
        let blocks = sm.block_count();

        assert!(!pts.detach(&mut sm, PtOwner::Global));
        assert!(pts.detach(&mut sm, PtOwner::Global));
        assert!(pts.is_empty());
        assert_eq!(sm.block_count(), blocks - 1);
    }

    #[test]
    fn test_range_checks() {
        let (sm, mut pts) = setup();
        let sg = pages(&sm, 2);
        assert!(matches!(
            pts.map(PtOwner::Global, VA - PAGE_SIZE, &sg, RW),
            Err(KgslError::BadParam(_))
        ));
        assert!(matches!(
            pts.map(PtOwner::Global, VA + 4 * 1024 * 1024 - PAGE_SIZE, &sg, RW),
            Err(KgslError::BadParam(_))
        ));
        assert!(pts.map(PtOwner::Process(7), VA, &sg, RW).is_err());
    }
}
