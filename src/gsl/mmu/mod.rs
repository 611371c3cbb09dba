//! Per-device MMU state.
//!
//! The page tables themselves live in a driver-wide [`PageTableSet`]; each
//! device's [`Mmu`] tracks which processes are attached through it, which
//! table the hardware currently walks and whether its TLB is behind the
//! set's flush generation.

pub mod pagetable;

use std::collections::{BTreeSet, VecDeque};

use crate::error::KgslResult;
use crate::gsl::Pid;
use crate::gsl::memory::SharedMem;
use crate::hw::regs::{
    MH_INTERRUPT_MASK_ALL, MH_MMU_CONFIG_ENABLE, REG_MH_INTERRUPT_MASK, REG_MH_MMU_CONFIG,
    REG_MH_MMU_PT_BASE, REG_MH_MMU_VA_RANGE, mh_va_range,
};
use crate::hw::{DeviceId, GpuHardware};

pub use pagetable::{PageTable, PageTableSet, SUPER_PTE};

/// Who a page table belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PtOwner {
    /// The single table shared by every process.
    Global,
    Process(Pid),
}

/// Number of faults remembered per device.
const FAULT_LOG_LEN: usize = 16;

/// A translation fault reported by the memory hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuFault {
    pub addr: u32,
    pub status: u32,
    /// Draw context that was active when the fault was taken.
    pub context: Option<u32>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    pub pagetable_switches: u64,
    pub tlb_flushes: u64,
    pub faults: u64,
}

/// A page-table install the device still has to program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtSwitch {
    pub owner: PtOwner,
    pub pt_base: u32,
    /// Table differs from the one the hardware walks.
    pub switch: bool,
    pub flush: bool,
    generation: u64,
}

#[derive(Debug)]
pub struct Mmu {
    device: DeviceId,
    enabled: bool,
    started: bool,
    hwpagetable: Option<PtOwner>,
    flushed_generation: u64,
    attached: BTreeSet<Pid>,
    faults: VecDeque<MmuFault>,
    pub stats: MmuStats,
}

impl Mmu {
    #[must_use]
    pub const fn new(device: DeviceId) -> Self {
        Self {
            device,
            enabled: false,
            started: false,
            hwpagetable: None,
            flushed_generation: 0,
            attached: BTreeSet::new(),
            faults: VecDeque::new(),
            stats: MmuStats {
                pagetable_switches: 0,
                tlb_flushes: 0,
                faults: 0,
            },
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub const fn hwpagetable(&self) -> Option<PtOwner> {
        self.hwpagetable
    }

    #[must_use]
    pub fn is_attached(&self, pid: Pid) -> bool {
        self.attached.contains(&pid)
    }

    pub fn faults(&self) -> impl Iterator<Item = &MmuFault> {
        self.faults.iter()
    }

    /// Brings up translation. With `enabled` false (MMU configured off or the
    /// device in safe mode) the hub is left in pass-through and every other
    /// operation becomes a no-op.
    pub fn start(&mut self, hw: &GpuHardware, pagetables: &PageTableSet, enabled: bool) {
        self.enabled = enabled && pagetables.enabled();
        self.started = true;
        self.hwpagetable = None;
        self.flushed_generation = pagetables.tlb_generation();

        if self.enabled {
            let (base, range) = pagetables.va_range();
            hw.regs.write(REG_MH_MMU_VA_RANGE, mh_va_range(base, range));
            hw.regs.write(REG_MH_INTERRUPT_MASK, MH_INTERRUPT_MASK_ALL);
            hw.regs.write(REG_MH_MMU_CONFIG, MH_MMU_CONFIG_ENABLE);
        } else {
            hw.regs.write(REG_MH_MMU_CONFIG, 0);
        }
        log::debug!(
            "mmu[{}]: started, translation {}",
            self.device.name(),
            if self.enabled { "on" } else { "off" }
        );
    }

    /// Detaches every process and turns translation off.
    pub fn stop(&mut self, hw: &GpuHardware, sharedmem: &mut SharedMem, pagetables: &mut PageTableSet) {
        let pids: Vec<Pid> = self.attached.iter().copied().collect();
        for pid in pids {
            self.detach(pid, sharedmem, pagetables);
        }
        hw.regs.write(REG_MH_MMU_CONFIG, 0);
        hw.regs.write(REG_MH_MMU_PT_BASE, 0);
        self.hwpagetable = None;
        self.started = false;
        log::debug!("mmu[{}]: stopped", self.device.name());
    }

    /// Gives `pid` a page table on this device. Repeated attaches are no-ops.
    pub fn attach(
        &mut self,
        pid: Pid,
        sharedmem: &mut SharedMem,
        pagetables: &mut PageTableSet,
    ) -> KgslResult<()> {
        if !self.enabled || self.attached.contains(&pid) {
            return Ok(());
        }
        pagetables.attach(sharedmem, pagetables.owner_for(pid), self.device)?;
        self.attached.insert(pid);
        Ok(())
    }

    pub fn detach(&mut self, pid: Pid, sharedmem: &mut SharedMem, pagetables: &mut PageTableSet) {
        if !self.attached.remove(&pid) {
            return;
        }
        let owner = pagetables.owner_for(pid);
        let destroyed = pagetables.detach(sharedmem, owner);
        // The registry may still hold a process table that is about to go away.
        if self.hwpagetable == Some(owner) && (destroyed || owner != PtOwner::Global) {
            self.hwpagetable = None;
        }
    }

    /// What has to be programmed so the hardware walks `pid`'s table with an
    /// up-to-date TLB. `None` if nothing needs doing.
    #[must_use]
    pub fn pending_switch(&self, pid: Pid, pagetables: &PageTableSet) -> Option<PtSwitch> {
        if !self.enabled || !self.started {
            return None;
        }
        let owner = pagetables.owner_for(pid);
        let Some(pt) = pagetables.get(owner) else {
            log::warn!("mmu[{}]: no pagetable for pid {pid}", self.device.name());
            return None;
        };

        let generation = pagetables.tlb_generation();
        let switch = self.hwpagetable != Some(owner);
        let flush = generation != self.flushed_generation;
        (switch || flush).then_some(PtSwitch {
            owner,
            pt_base: pt.base.gpuaddr,
            switch,
            flush,
            generation,
        })
    }

    /// Records that `sw` has been programmed.
    pub fn commit(&mut self, sw: PtSwitch) {
        if sw.switch {
            self.stats.pagetable_switches += 1;
        }
        self.stats.tlb_flushes += 1;
        self.hwpagetable = Some(sw.owner);
        self.flushed_generation = sw.generation;
    }

    pub fn record_fault(&mut self, fault: MmuFault) {
        log::error!(
            "mmu[{}]: page fault at 0x{:08x} (status 0x{:x}, context {:?})",
            self.device.name(),
            fault.addr,
            fault.status,
            fault.context
        );
        if self.faults.len() == FAULT_LOG_LEN {
            self.faults.pop_front();
        }
        self.faults.push_back(fault);
        self.stats.faults += 1;
    }
}
