#![allow(clippy::cast_possible_truncation)]

//! The shared-memory arena.
//!
//! Two apertures, each split into channels:
//!
//! * `EMEM`: with the MMU on this is a GPU virtual range; every allocation is
//!   page-rounded, backed by pages from the physical page pool and mapped into
//!   the allocating process's page table. With the MMU off it is a physical
//!   carve-out like `CONPHYS`.
//! * `CONPHYS`: physically contiguous; GPU address equals physical address.
//!
//! The arena keeps its own record of every block so descriptors coming back
//! from callers can be validated before they are trusted.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::aperture::{Aperture, ApertureAllocator};
use super::{ApertureId, CacheOp, MemDesc, MemFlags, ScatterList};
use crate::config::KgslConfig;
use crate::error::{KgslError, KgslResult};
use crate::gsl::Pid;
use crate::gsl::mmu::{PageTableSet, PtOwner};
use crate::hw::{DeviceId, PhysicalMemory};
use crate::utils::{PAGE_SHIFT, PAGE_SIZE, pages_for};

/// Base of the kernel alias window reported in `MemDesc::hostptr`.
const HOST_ALIAS_BASE: u64 = 0xffff_ff80_0000_0000;

/// Granularity of physical reservations.
const MIN_RESERVATION: u32 = 32;

#[derive(Debug, Clone)]
struct Block {
    desc: MemDesc,
    pid: Pid,
    /// Backing pages of an MMU-mapped block.
    pages: Vec<u32>,
    /// Page table the block is mapped into.
    owner: Option<PtOwner>,
    /// Holds a reservation in its aperture.
    reserved: bool,
}

impl Block {
    /// Physical address of byte `offset` and the bytes left in that page run.
    fn phys(&self, offset: u32) -> (u32, u32) {
        if self.pages.is_empty() {
            (self.desc.gpuaddr + offset, self.desc.size - offset)
        } else {
            let page = self.pages[(offset >> PAGE_SHIFT) as usize];
            let in_page = offset & (PAGE_SIZE - 1);
            (page + in_page, PAGE_SIZE - in_page)
        }
    }
}

#[derive(Debug)]
pub struct SharedMem {
    physmem: Arc<PhysicalMemory>,
    mmu_enabled: bool,
    // [aperture][channel]
    apertures: Vec<Vec<Aperture>>,
    blocks: BTreeMap<u32, Block>,
}

impl SharedMem {
    pub fn new(physmem: Arc<PhysicalMemory>, config: &KgslConfig) -> KgslResult<Self> {
        let channels = config.channels;
        let emem = if config.mmu_enabled {
            (config.va_base, config.va_range)
        } else {
            let r = physmem.emem_region();
            (r.base, r.size)
        };
        let conphys = physmem.conphys_region();

        let split = |id: ApertureId, base: u32, size: u32, mmu_backed: bool| -> Vec<Aperture> {
            let per_channel = (size / channels) & !(PAGE_SIZE - 1);
            (0..channels)
                .map(|ch| Aperture::new(id, ch, base + ch * per_channel, per_channel, mmu_backed))
                .collect()
        };

        let apertures = vec![
            split(ApertureId::Emem, emem.0, emem.1, config.mmu_enabled),
            split(ApertureId::Conphys, conphys.base, conphys.size, false),
        ];

        if apertures.iter().flatten().any(|a| a.bounds().0 == a.bounds().1) {
            return Err(KgslError::failure("aperture too small for its channel count"));
        }

        log::debug!(
            "sharedmem: emem 0x{:08x}+0x{:x} ({}), conphys 0x{:08x}+0x{:x}, {} channel(s)",
            emem.0,
            emem.1,
            if config.mmu_enabled { "mmu" } else { "physical" },
            conphys.base,
            conphys.size,
            channels
        );

        Ok(Self {
            physmem,
            mmu_enabled: config.mmu_enabled,
            apertures,
            blocks: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn physmem(&self) -> &Arc<PhysicalMemory> {
        &self.physmem
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The `[base, limit)` range of one aperture channel.
    #[must_use]
    pub fn aperture_bounds(&self, id: ApertureId, channel: u32) -> Option<(u32, u32)> {
        self.apertures
            .get(id as usize)?
            .get(channel as usize)
            .map(ApertureAllocator::bounds)
    }

    fn channel_count(&self) -> u32 {
        self.apertures[0].len() as u32
    }

    // ===========================================================================================
    // Allocation
    // ===========================================================================================

    /// Allocates a block for `device` on behalf of `pid`.
    ///
    /// Tries the requested aperture and channel, then the other channel of the
    /// same aperture, then the default `EMEM` channel. `STRICTREQUEST` with the
    /// MMU enabled forbids leaving the requested aperture.
    pub fn alloc(
        &mut self,
        pagetables: &mut PageTableSet,
        device: DeviceId,
        pid: Pid,
        flags: MemFlags,
        size: u32,
    ) -> KgslResult<MemDesc> {
        self.alloc_inner(Some(pagetables), device, pid, flags, size)
    }

    /// Allocates without touching any page table. Only physical apertures are
    /// candidates; used for page-table backing store.
    pub(crate) fn alloc_unmapped(
        &mut self,
        device: DeviceId,
        flags: MemFlags,
        size: u32,
    ) -> KgslResult<MemDesc> {
        self.alloc_inner(None, device, 0, flags, size)
    }

    fn alloc_inner(
        &mut self,
        mut pagetables: Option<&mut PageTableSet>,
        device: DeviceId,
        pid: Pid,
        flags: MemFlags,
        size: u32,
    ) -> KgslResult<MemDesc> {
        if size == 0 {
            return Err(KgslError::bad_param("zero-sized allocation"));
        }

        let channels = self.channel_count();
        let requested = (flags.aperture(), flags.channel().min(channels - 1));
        let mut candidates = vec![requested];
        if channels > 1 {
            candidates.push((requested.0, 1 - requested.1));
        }
        if !candidates.contains(&(ApertureId::Emem, 0)) {
            candidates.push((ApertureId::Emem, 0));
        }

        let strict = flags.contains(MemFlags::STRICTREQUEST) && self.mmu_enabled;
        let mut refused = false;

        for (id, channel) in candidates {
            if strict && id != requested.0 {
                refused = true;
                continue;
            }
            let mmu_backed = self.apertures[id as usize][channel as usize].mmu_backed;
            if mmu_backed && pagetables.is_none() {
                continue;
            }

            match self.try_alloc(
                pagetables.as_deref_mut(),
                id,
                channel,
                device,
                pid,
                flags,
                size,
            ) {
                Ok(desc) => {
                    if (id, channel) != requested {
                        log::debug!(
                            "sharedmem: {:?}/{} exhausted, fell back to {id:?}/{channel}",
                            requested.0,
                            requested.1
                        );
                    }
                    return Ok(desc);
                }
                Err(KgslError::OutOfMemory) => {}
                Err(e) => return Err(e),
            }
        }

        if refused {
            log::warn!(
                "sharedmem: strict request for {size} bytes in {:?} cannot be satisfied",
                requested.0
            );
            Err(KgslError::failure("strict allocation refused fallback"))
        } else {
            log::warn!("sharedmem: out of memory allocating {size} bytes ({flags:?})");
            Err(KgslError::OutOfMemory)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_alloc(
        &mut self,
        pagetables: Option<&mut PageTableSet>,
        id: ApertureId,
        channel: u32,
        device: DeviceId,
        pid: Pid,
        flags: MemFlags,
        size: u32,
    ) -> KgslResult<MemDesc> {
        let aperture = &mut self.apertures[id as usize][channel as usize];
        let mmu_backed = aperture.mmu_backed;
        let align = flags.alignment();

        // Sizes that cannot be rounded up fit no aperture.
        let round = |to: u32| size.checked_next_multiple_of(to).ok_or(KgslError::OutOfMemory);
        let (size, reservation, align) = if mmu_backed {
            let rounded = round(PAGE_SIZE)?;
            (rounded, rounded, align.max(PAGE_SIZE))
        } else {
            (size, round(MIN_RESERVATION)?, align)
        };

        let gpuaddr = aperture
            .allocate(reservation, align)
            .ok_or(KgslError::OutOfMemory)?;

        let mut pages = Vec::new();
        let mut owner = None;

        if mmu_backed {
            let Some(pagetables) = pagetables else {
                aperture.free(gpuaddr);
                return Err(KgslError::failure("mmu-backed allocation without page tables"));
            };
            let Some(backing) = self.physmem.alloc_physical_pages(pages_for(size)) else {
                aperture.free(gpuaddr);
                return Err(KgslError::OutOfMemory);
            };

            let pt_owner = pagetables.owner_for(pid);
            let sg = ScatterList::from_pages(backing.clone());
            if let Err(e) = pagetables.map(pt_owner, gpuaddr, &sg, flags.pte_access()) {
                self.physmem.free_physical_pages(&backing);
                aperture.free(gpuaddr);
                return Err(e);
            }
            pages = backing;
            owner = Some(pt_owner);
        } else {
            self.physmem.fill(gpuaddr, 0, reservation);
        }

        let desc = MemDesc {
            hostptr: HOST_ALIAS_BASE + u64::from(gpuaddr),
            gpuaddr,
            size,
            priv_flags: MemDesc::encode_priv(id, channel, device, false, mmu_backed),
        };

        log::trace!(
            "sharedmem: alloc {:?}/{channel} 0x{gpuaddr:08x}+0x{size:x} for pid {pid}",
            id
        );

        self.blocks.insert(
            gpuaddr,
            Block {
                desc,
                pid,
                pages,
                owner,
                reserved: true,
            },
        );
        Ok(desc)
    }

    /// Maps caller-supplied physical pages. The pages are never released by the arena.
    pub fn map_external(
        &mut self,
        pagetables: &mut PageTableSet,
        device: DeviceId,
        pid: Pid,
        flags: MemFlags,
        sg: &ScatterList,
    ) -> KgslResult<MemDesc> {
        if sg.num_pages == 0 {
            return Err(KgslError::bad_param("empty scatter list"));
        }
        let size = sg
            .num_pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| KgslError::bad_param("scatter list too large"))?;
        if sg.iter().any(|p| p & (PAGE_SIZE - 1) != 0) {
            return Err(KgslError::bad_param("unaligned page in scatter list"));
        }

        let (gpuaddr, aperture_id, channel, owner, reserved) = if self.mmu_enabled {
            let channel = flags.channel().min(self.channel_count() - 1);
            let aperture = &mut self.apertures[ApertureId::Emem as usize][channel as usize];
            let gpuaddr = aperture
                .allocate(size, flags.alignment().max(PAGE_SIZE))
                .ok_or(KgslError::OutOfMemory)?;
            let owner = pagetables.owner_for(pid);
            if let Err(e) = pagetables.map(owner, gpuaddr, sg, flags.pte_access()) {
                aperture.free(gpuaddr);
                return Err(e);
            }
            (gpuaddr, ApertureId::Emem, channel, Some(owner), true)
        } else if sg.contiguous {
            let base = sg.pages[0];
            if u64::from(base) + u64::from(size) > 1 << 32 {
                return Err(KgslError::bad_param("external range wraps the address space"));
            }
            if self.overlaps_block(base, size) {
                return Err(KgslError::bad_param(format!(
                    "external range 0x{base:08x}+0x{size:x} overlaps a live block"
                )));
            }
            match self.reserve_external(base, size)? {
                Some((id, channel)) => (base, id, channel, None, true),
                None => (base, ApertureId::Emem, 0, None, false),
            }
        } else {
            return Err(KgslError::NotSupported(
                "scattered external memory needs the MMU".into(),
            ));
        };

        let mmu_mapped = owner.is_some();
        let desc = MemDesc {
            hostptr: HOST_ALIAS_BASE + u64::from(gpuaddr),
            gpuaddr,
            size,
            priv_flags: MemDesc::encode_priv(aperture_id, channel, device, true, mmu_mapped),
        };
        self.blocks.insert(
            gpuaddr,
            Block {
                desc,
                pid,
                pages: if mmu_mapped { sg.to_vec() } else { Vec::new() },
                owner,
                reserved,
            },
        );
        Ok(desc)
    }

    /// True if `[addr, addr + size)` intersects any live block.
    fn overlaps_block(&self, addr: u32, size: u32) -> bool {
        let end = u64::from(addr) + u64::from(size);
        let below = self
            .blocks
            .range(..=addr)
            .next_back()
            .is_some_and(|(&a, b)| u64::from(a) + u64::from(b.desc.size) > u64::from(addr));
        let above = self
            .blocks
            .range(addr..)
            .next()
            .is_some_and(|(&a, _)| u64::from(a) < end);
        below || above
    }

    /// Claims a physically addressed external range inside whichever aperture channel holds it.
    /// Ranges outside every aperture need no reservation.
    fn reserve_external(&mut self, addr: u32, size: u32) -> KgslResult<Option<(ApertureId, u32)>> {
        let end = u64::from(addr) + u64::from(size);
        for aperture in self.apertures.iter_mut().flatten() {
            let (base, limit) = aperture.bounds();
            if end <= u64::from(base) || u64::from(addr) >= u64::from(limit) {
                continue;
            }
            if !aperture.reserve_at(addr, size) {
                return Err(KgslError::bad_param(format!(
                    "external range 0x{addr:08x}+0x{size:x} collides with aperture {:?}/{}",
                    aperture.id, aperture.channel
                )));
            }
            return Ok(Some((aperture.id, aperture.channel)));
        }
        Ok(None)
    }

    /// Releases a block: unmaps it, frees its pages (unless external) and its reservation.
    pub fn free(&mut self, pagetables: &mut PageTableSet, desc: &MemDesc) -> KgslResult<()> {
        self.validate(desc)?;
        let Some(block) = self.blocks.remove(&desc.gpuaddr) else {
            return Err(KgslError::bad_param("unknown memory descriptor"));
        };

        if let Some(owner) = block.owner
            && let Err(e) = pagetables.unmap(owner, desc.gpuaddr, desc.size)
        {
            log::debug!("sharedmem: unmap of 0x{:08x} skipped: {e}", desc.gpuaddr);
        }

        if !desc.is_external() && !block.pages.is_empty() {
            self.physmem.free_physical_pages(&block.pages);
        }

        if block.reserved
            && let Some(id) = desc.aperture()
            && let Some(aperture) = self.apertures[id as usize].get_mut(desc.channel() as usize)
        {
            aperture.free(desc.gpuaddr);
        }

        log::trace!("sharedmem: free 0x{:08x}+0x{:x}", desc.gpuaddr, desc.size);
        Ok(())
    }

    /// Frees every block still owned by `pid`. Returns how many were released.
    pub fn free_all_for(&mut self, pagetables: &mut PageTableSet, pid: Pid) -> usize {
        let leaked: Vec<MemDesc> = self
            .blocks
            .values()
            .filter(|b| b.pid == pid)
            .map(|b| b.desc)
            .collect();
        for desc in &leaked {
            if let Err(e) = self.free(pagetables, desc) {
                log::warn!("sharedmem: block 0x{:08x} not released: {e}", desc.gpuaddr);
            }
        }
        leaked.len()
    }

    /// Releases everything. Called once the last process has gone.
    pub fn close(&mut self, pagetables: &mut PageTableSet) {
        if !self.blocks.is_empty() {
            log::warn!("sharedmem: {} block(s) leaked at close", self.blocks.len());
        }
        let all: Vec<MemDesc> = self.blocks.values().map(|b| b.desc).collect();
        for desc in &all {
            if let Err(e) = self.free(pagetables, desc) {
                log::warn!("sharedmem: block 0x{:08x} not released: {e}", desc.gpuaddr);
            }
        }
    }

    // ===========================================================================================
    // Queries
    // ===========================================================================================

    fn validate(&self, desc: &MemDesc) -> KgslResult<&Block> {
        match self.blocks.get(&desc.gpuaddr) {
            Some(b) if b.desc == *desc => Ok(b),
            _ => Err(KgslError::bad_param(format!(
                "unknown memory descriptor 0x{:08x}+0x{:x}",
                desc.gpuaddr, desc.size
            ))),
        }
    }

    /// Process a live block was allocated for.
    pub fn owner_of(&self, desc: &MemDesc) -> KgslResult<Pid> {
        self.validate(desc).map(|b| b.pid)
    }

    /// Physical pages behind a block.
    pub fn getmap(&self, pagetables: &PageTableSet, desc: &MemDesc) -> KgslResult<ScatterList> {
        let block = self.validate(desc)?;
        match block.owner {
            Some(owner) => pagetables.getmap(owner, desc.gpuaddr, desc.size),
            None => Ok(ScatterList::contiguous(desc.gpuaddr, pages_for(desc.size))),
        }
    }

    /// True if `[gpuaddr, gpuaddr + len)` lies inside one live block.
    #[must_use]
    pub fn contains_range(&self, gpuaddr: u32, len: u32) -> bool {
        self.blocks
            .range(..=gpuaddr)
            .next_back()
            .is_some_and(|(_, b)| u64::from(gpuaddr) + u64::from(len) <= b.desc.end())
    }

    #[must_use]
    pub fn largest_free_block(&self, flags: MemFlags) -> u32 {
        let channel = flags.channel().min(self.channel_count() - 1);
        self.apertures[flags.aperture() as usize][channel as usize].largest_free_block()
    }

    /// The virtual backend is coherent; this only validates the descriptor.
    pub fn cache_operation(&self, desc: &MemDesc, op: CacheOp) -> KgslResult<()> {
        self.validate(desc)?;
        log::trace!("sharedmem: cache {op:?} on 0x{:08x}", desc.gpuaddr);
        Ok(())
    }

    // ===========================================================================================
    // Access
    // ===========================================================================================

    fn checked(&self, desc: &MemDesc, offset: u32, len: usize) -> KgslResult<&Block> {
        let block = self.validate(desc)?;
        if desc.is_external() {
            return Err(KgslError::bad_param("external memory is not host accessible"));
        }
        if u64::from(offset) + len as u64 > u64::from(desc.size) {
            return Err(KgslError::bad_param(format!(
                "access 0x{offset:x}+0x{len:x} outside block of 0x{:x} bytes",
                desc.size
            )));
        }
        Ok(block)
    }

    /// Walks `[offset, offset + len)` of a block in physically contiguous runs.
    fn for_each_run(
        &self,
        block: &Block,
        offset: u32,
        len: usize,
        mut f: impl FnMut(u32, usize, usize) -> bool,
    ) -> KgslResult<()> {
        let mut done = 0usize;
        while done < len {
            let (phys, avail) = block.phys(offset + done as u32);
            let chunk = (len - done).min(avail as usize);
            if !f(phys, done, chunk) {
                return Err(KgslError::failure(format!("physical access at 0x{phys:08x} failed")));
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read(&self, desc: &MemDesc, offset: u32, dst: &mut [u8]) -> KgslResult<()> {
        let block = self.checked(desc, offset, dst.len())?;
        self.for_each_run(block, offset, dst.len(), |phys, at, n| {
            self.physmem.read(phys, &mut dst[at..at + n])
        })
    }

    pub fn write(&self, desc: &MemDesc, offset: u32, src: &[u8]) -> KgslResult<()> {
        let block = self.checked(desc, offset, src.len())?;
        self.for_each_run(block, offset, src.len(), |phys, at, n| {
            self.physmem.write(phys, &src[at..at + n])
        })
    }

    pub fn set(&self, desc: &MemDesc, offset: u32, value: u8, len: u32) -> KgslResult<()> {
        let block = self.checked(desc, offset, len as usize)?;
        self.for_each_run(block, offset, len as usize, |phys, _, n| {
            self.physmem.fill(phys, value, n as u32)
        })
    }

    pub fn write_words(&self, desc: &MemDesc, offset: u32, words: &[u32]) -> KgslResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.write(desc, offset, &bytes)
    }

    pub fn read_u32(&self, desc: &MemDesc, offset: u32) -> KgslResult<u32> {
        let mut buf = [0u8; 4];
        self.read(desc, offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: u32 = 1024;

    fn setup(mmu: bool) -> (SharedMem, PageTableSet) {
        let cfg = KgslConfig::new()
            .with_mmu(mmu)
            .with_memory(256 * KB, 1024 * KB);
        let physmem = Arc::new(PhysicalMemory::new(cfg.conphys_size, cfg.emem_size));
        let mut sm = SharedMem::new(physmem.clone(), &cfg).unwrap();
        let mut pts = PageTableSet::new(physmem, &cfg);
        if mmu {
            pts.attach(&mut sm, PtOwner::Global, DeviceId::Yamato).unwrap();
        }
        (sm, pts)
    }

    #[test]
    fn test_alignment_and_bounds_hold() {
        let (mut sm, mut pts) = setup(true);
        let cases = [
            (MemFlags::empty(), 100),
            (MemFlags::CONPHYS | MemFlags::ALIGN64, 1),
            (MemFlags::CONPHYS | MemFlags::ALIGN4K, 5000),
            (MemFlags::CONPHYS | MemFlags::CHANNEL2 | MemFlags::ALIGN64K, 300),
            (MemFlags::ALIGN16K, 3 * PAGE_SIZE),
            (MemFlags::CONPHYS, 33),
        ];
        for (flags, size) in cases {
            let d = sm.alloc(&mut pts, DeviceId::Yamato, 1, flags, size).unwrap();
            assert_eq!(d.gpuaddr % flags.alignment(), 0, "{flags:?}");
            let (base, limit) = sm
                .aperture_bounds(d.aperture().unwrap(), d.channel())
                .unwrap();
            assert!(d.gpuaddr >= base && d.end() <= u64::from(limit));
            if d.is_mmu_mapped() {
                assert_eq!(d.gpuaddr % PAGE_SIZE, 0);
                assert_eq!(d.size % PAGE_SIZE, 0);
            }
        }
    }

    #[test]
    fn test_strict_conphys_on_full_aperture_fails() {
        let (mut sm, mut pts) = setup(true);
        let flags = MemFlags::CONPHYS | MemFlags::STRICTREQUEST;
        // Fill both conphys channels.
        while sm.alloc(&mut pts, DeviceId::Yamato, 1, flags, 16 * KB).is_ok() {}

        let err = sm.alloc(&mut pts, DeviceId::Yamato, 1, flags, 64 * KB).unwrap_err();
        assert!(matches!(err, KgslError::Failure(_)), "{err:?}");

        // Without the strict bit the request quietly lands in emem.
        let d = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::CONPHYS, 64 * KB)
            .unwrap();
        assert_eq!(d.aperture(), Some(ApertureId::Emem));
        assert!(d.is_mmu_mapped());
    }

    #[test]
    fn test_exhaustion_is_out_of_memory() {
        let (mut sm, mut pts) = setup(false);
        let err = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), 4 * 1024 * KB)
            .unwrap_err();
        assert!(matches!(err, KgslError::OutOfMemory));
    }

    #[test]
    fn test_oversized_requests_are_out_of_memory() {
        let (mut sm, mut pts) = setup(true);
        let err = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), 0xffff_f001)
            .unwrap_err();
        assert!(matches!(err, KgslError::OutOfMemory), "{err:?}");

        let (mut sm, mut pts) = setup(false);
        let err = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::CONPHYS, 0xffff_fff1)
            .unwrap_err();
        assert!(matches!(err, KgslError::OutOfMemory), "{err:?}");
        assert_eq!(sm.block_count(), 0);
    }

    #[test]
    fn test_read_write_across_pages() {
        let (mut sm, mut pts) = setup(true);
        let d = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), 3 * PAGE_SIZE)
            .unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(6000).collect();
        sm.write(&d, 100, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        sm.read(&d, 100, &mut back).unwrap();
        assert_eq!(back, data);

        sm.set(&d, 0, 0xab, 8).unwrap();
        assert_eq!(sm.read_u32(&d, 4).unwrap(), 0xabab_abab);

        assert!(matches!(
            sm.write(&d, d.size - 2, &[0; 4]),
            Err(KgslError::BadParam(_))
        ));
    }

    #[test]
    fn test_free_validates_descriptor() {
        let (mut sm, mut pts) = setup(true);
        let free_pages = sm.physmem().free_page_count();
        let d = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), 2 * PAGE_SIZE)
            .unwrap();
        assert_eq!(sm.physmem().free_page_count(), free_pages - 2);

        let mut forged = d;
        forged.size += PAGE_SIZE;
        assert!(matches!(sm.free(&mut pts, &forged), Err(KgslError::BadParam(_))));

        sm.free(&mut pts, &d).unwrap();
        assert_eq!(sm.physmem().free_page_count(), free_pages);
        assert!(matches!(sm.free(&mut pts, &d), Err(KgslError::BadParam(_))));
    }

    #[test]
    fn test_external_mapping_keeps_pages() {
        let (mut sm, mut pts) = setup(true);
        let pages = sm.physmem().alloc_physical_pages(2).unwrap();
        let sg = ScatterList::from_pages(vec![pages[1], pages[0]]);
        let d = sm
            .map_external(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), &sg)
            .unwrap();
        assert!(d.is_external());
        assert_eq!(sm.getmap(&pts, &d).unwrap(), sg);
        assert!(matches!(sm.read_u32(&d, 0), Err(KgslError::BadParam(_))));

        let before = sm.physmem().free_page_count();
        sm.free(&mut pts, &d).unwrap();
        assert_eq!(sm.physmem().free_page_count(), before);
    }

    #[test]
    fn test_external_mapping_cannot_alias_blocks() {
        let (mut sm, mut pts) = setup(false);
        let d = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::CONPHYS, PAGE_SIZE)
            .unwrap();
        let over = ScatterList::contiguous(d.gpuaddr, 1);
        let err = sm
            .map_external(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), &over)
            .unwrap_err();
        assert!(matches!(err, KgslError::BadParam(_)), "{err:?}");
        assert_eq!(sm.block_count(), 1);
        assert_eq!(sm.read_u32(&d, 0).unwrap(), 0);

        let (_, limit) = sm.aperture_bounds(ApertureId::Conphys, 0).unwrap();
        let tail = ScatterList::contiguous(limit - PAGE_SIZE, 1);
        let ext = sm
            .map_external(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), &tail)
            .unwrap();
        assert_eq!(ext.aperture(), Some(ApertureId::Conphys));
        assert!(sm
            .map_external(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), &tail)
            .is_err());

        // The claimed tail is never handed out by the allocator.
        let mut filled = Vec::new();
        while let Ok(f) = sm.alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::CONPHYS, PAGE_SIZE) {
            assert!(f.end() <= u64::from(ext.gpuaddr) || u64::from(f.gpuaddr) >= ext.end());
            filled.push(f);
        }

        sm.free(&mut pts, &ext).unwrap();
        sm.free(&mut pts, &d).unwrap();
        for f in &filled {
            sm.free(&mut pts, f).unwrap();
        }
        let again = sm
            .map_external(&mut pts, DeviceId::Yamato, 1, MemFlags::empty(), &tail)
            .unwrap();
        assert_eq!(again.gpuaddr, limit - PAGE_SIZE);
    }

    #[test]
    fn test_contains_range() {
        let (mut sm, mut pts) = setup(false);
        let d = sm
            .alloc(&mut pts, DeviceId::Yamato, 1, MemFlags::CONPHYS, 256)
            .unwrap();
        assert!(sm.contains_range(d.gpuaddr + 16, 64));
        assert!(!sm.contains_range(d.gpuaddr + 16, 256));
        assert!(!sm.contains_range(d.gpuaddr - 4, 8));
    }
}
