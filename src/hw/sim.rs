#![allow(clippy::cast_possible_truncation)]

//! Simulated command processor.
//!
//! Consumes what the driver puts in front of a core and behaves the way the
//! control plane expects the hardware to: the 3D core walks the ring buffer
//! between its read pointer and the driver's write pointer, executing register
//! writes, memory writes and interrupts; the 2D core retires whatever timestamp
//! was last kicked. No shading or rasterisation happens.
//!
//! The simulator never takes the driver lock. It is driven either explicitly
//! with [`SimGpu::step`] or from a background thread via [`SimGpu::spawn`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::utils::PAGE_SHIFT;

use super::pm4::{
    PM4_EVENT_WRITE, PM4_INDIRECT_BUFFER, PM4_INDIRECT_BUFFER_PFD, PM4_INTERRUPT, PM4_MEM_WRITE,
    PacketHeader,
};
use super::regs::{
    CP_INT_MASK, CP_INT_OPCODE_ERROR, CP_ME_CNTL_HALT, G12_IRQ_MH, G12_IRQ_TIMESTAMP,
    G12_STATUS_BUSY, MASTER_INT_CP, MASTER_INT_MH, MH_INTERRUPT_AXI_WRITE_ERROR,
    MH_INTERRUPT_MMU_PAGE_FAULT, MH_MMU_CONFIG_ENABLE, MH_PTE_ADDR_MASK, MH_PTE_READ, MH_PTE_WRITE,
    RBBM_STATUS_GUI_ACTIVE, REG_CP_INT_STATUS, REG_CP_ME_CNTL, REG_CP_RB_BASE, REG_CP_RB_CNTL,
    REG_CP_RB_RPTR, REG_CP_RB_WPTR, REG_G12_IB_SIZE, REG_G12_IRQ_STATUS, REG_G12_KICK_TS,
    REG_G12_MEMSTORE_ADDR, REG_G12_STATUS, REG_MASTER_INT_SIGNAL, REG_MH_INTERRUPT_STATUS,
    REG_MH_MMU_CONFIG, REG_MH_MMU_INVALIDATE, REG_MH_MMU_PAGE_FAULT, REG_MH_MMU_PT_BASE,
    REG_MH_MMU_VA_RANGE, REG_RBBM_STATUS,
};
use super::{
    DeviceId, GpuHardware, MEMSTORE_EOPTIMESTAMP, MEMSTORE_SOPTIMESTAMP, PhysicalMemory,
};

/// Counters describing what the simulator has executed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub packets: u64,
    pub indirect_buffers: u64,
    pub indirect_words: u64,
    pub mem_writes: u64,
    pub interrupts: u64,
    pub tlb_invalidates: u64,
    pub pagetable_switches: u64,
    pub faults: u64,
}

#[derive(Debug, Default)]
struct SimState {
    stalled: bool,
    stats: SimStats,
}

/// A command processor attached to one [`GpuHardware`].
#[derive(Debug)]
pub struct SimGpu {
    hw: Arc<GpuHardware>,
    physmem: Arc<PhysicalMemory>,
    state: Mutex<SimState>,
}

impl SimGpu {
    #[must_use]
    pub fn new(hw: Arc<GpuHardware>, physmem: Arc<PhysicalMemory>) -> Arc<Self> {
        Arc::new(Self {
            hw,
            physmem,
            state: Mutex::new(SimState::default()),
        })
    }

    /// A stalled processor makes no progress until released.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.lock().stalled = stalled;
    }

    #[must_use]
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Executes up to `max_packets` packets (or one kick on the 2D core).
    /// Returns the number executed.
    pub fn step(&self, max_packets: usize) -> usize {
        let (processed, raise) = match self.hw.id {
            DeviceId::Yamato => self.step_ringbuffer(max_packets),
            DeviceId::G12 => self.step_g12(),
        };
        if raise {
            self.hw.irq.raise();
        }
        processed
    }

    /// Executes everything currently submitted.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let n = self.step(usize::MAX);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Reports an MMU page fault at `addr` through the memory hub.
    pub fn inject_page_fault(&self, addr: u32) {
        let regs = &self.hw.regs;
        regs.write(REG_MH_MMU_PAGE_FAULT, addr);
        regs.set_bits(REG_MH_INTERRUPT_STATUS, MH_INTERRUPT_MMU_PAGE_FAULT);
        match self.hw.id {
            DeviceId::Yamato => regs.set_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_MH),
            DeviceId::G12 => regs.set_bits(REG_G12_IRQ_STATUS, G12_IRQ_MH),
        }
        self.state.lock().stats.faults += 1;
        self.hw.irq.raise();
    }

    /// Runs the processor on a background thread, stepping every `period`.
    /// The thread stops when the returned handle is dropped.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, period: Duration) -> SimThread {
        let stop = Arc::new(AtomicBool::new(false));
        let sim = self.clone();
        let stop_flag = stop.clone();

        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                sim.run_until_idle();
                std::thread::sleep(period);
            }
        });

        SimThread {
            stop,
            handle: Some(handle),
        }
    }

    // =========================================================================================
    // 3D core
    // =========================================================================================

    fn step_ringbuffer(&self, max_packets: usize) -> (usize, bool) {
        let regs = &self.hw.regs;
        let mut state = self.state.lock();

        let cntl = regs.read(REG_CP_RB_CNTL);
        if state.stalled || cntl == 0 || regs.read(REG_CP_ME_CNTL) & CP_ME_CNTL_HALT != 0 {
            return (0, false);
        }

        let sizedwords = 2u32 << (cntl & 0x3f);
        let mask = sizedwords - 1;
        let base = regs.read(REG_CP_RB_BASE);
        let mut rptr = regs.read(REG_CP_RB_RPTR) & mask;
        let mut processed = 0;
        let mut raise = false;

        while processed < max_packets {
            let wptr = regs.read(REG_CP_RB_WPTR) & mask;
            if rptr == wptr {
                break;
            }
            let avail = wptr.wrapping_sub(rptr) & mask;

            let Some(raw) = self.physmem.read_u32(base + rptr * 4) else {
                raise |= self.bus_error(&mut state, base + rptr * 4);
                break;
            };
            let header = PacketHeader::decode(raw);
            let len = header.len();
            if len > avail {
                // Payload not submitted yet.
                break;
            }

            let payload: Vec<u32> = (1..len)
                .map(|i| {
                    let addr = base + ((rptr + i) & mask) * 4;
                    self.physmem.read_u32(addr).unwrap_or(0)
                })
                .collect();

            raise |= self.execute(&mut state, header, &payload);

            rptr = (rptr + len) & mask;
            regs.write(REG_CP_RB_RPTR, rptr);
            state.stats.packets += 1;
            processed += 1;
        }

        if rptr == regs.read(REG_CP_RB_WPTR) & mask {
            regs.clear_bits(REG_RBBM_STATUS, RBBM_STATUS_GUI_ACTIVE);
        } else {
            regs.set_bits(REG_RBBM_STATUS, RBBM_STATUS_GUI_ACTIVE);
        }

        (processed, raise)
    }

    /// Executes one packet. Returns `true` if an interrupt must be raised.
    fn execute(&self, state: &mut SimState, header: PacketHeader, payload: &[u32]) -> bool {
        let regs = &self.hw.regs;

        match header {
            PacketHeader::Type0 { reg, .. } => {
                for (i, &value) in payload.iter().enumerate() {
                    let target = reg + i as u32;
                    regs.write(target, value);
                    match target {
                        REG_MH_MMU_INVALIDATE => state.stats.tlb_invalidates += 1,
                        REG_MH_MMU_PT_BASE => state.stats.pagetable_switches += 1,
                        _ => {}
                    }
                }
                false
            }
            PacketHeader::Type2 => false,
            PacketHeader::Type3 { opcode, .. } => match (opcode, payload) {
                (PM4_MEM_WRITE, [addr, value, ..]) | (PM4_EVENT_WRITE, [_, addr, value, ..]) => {
                    let Some(phys) = self.translate(*addr, MH_PTE_WRITE) else {
                        return self.page_fault(state, *addr);
                    };
                    if self.physmem.write_u32(phys, *value) {
                        state.stats.mem_writes += 1;
                        false
                    } else {
                        self.bus_error(state, *addr)
                    }
                }
                (PM4_INTERRUPT, [mask, ..]) => {
                    regs.set_bits(REG_CP_INT_STATUS, *mask & CP_INT_MASK);
                    regs.set_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_CP);
                    state.stats.interrupts += 1;
                    true
                }
                (PM4_INDIRECT_BUFFER | PM4_INDIRECT_BUFFER_PFD, [addr, size, ..]) => {
                    state.stats.indirect_buffers += 1;
                    state.stats.indirect_words += u64::from(*size);
                    self.run_indirect(state, *addr, *size)
                }
                _ => false,
            },
            PacketHeader::Invalid(raw) => {
                log::warn!("sim: invalid packet header 0x{raw:08x}");
                regs_opcode_error(&self.hw);
                true
            }
        }
    }

    /// Fetches an indirect buffer through the memory hub and executes it.
    /// Indirect buffers do not nest.
    fn run_indirect(&self, state: &mut SimState, addr: u32, sizedwords: u32) -> bool {
        let mut words = Vec::with_capacity(sizedwords as usize);
        for i in 0..sizedwords {
            let va = addr.wrapping_add(i * 4);
            let Some(phys) = self.translate(va, MH_PTE_READ) else {
                return self.page_fault(state, va);
            };
            let Some(word) = self.physmem.read_u32(phys) else {
                return self.bus_error(state, va);
            };
            words.push(word);
        }

        let mut raise = false;
        let mut pos = 0usize;
        while pos < words.len() {
            let header = PacketHeader::decode(words[pos]);
            let end = (pos + header.len() as usize).min(words.len());
            match header {
                PacketHeader::Type3 {
                    opcode: PM4_INDIRECT_BUFFER | PM4_INDIRECT_BUFFER_PFD,
                    ..
                } => {
                    log::warn!("sim: nested indirect buffer at 0x{:08x}", addr + pos as u32 * 4);
                    regs_opcode_error(&self.hw);
                    raise = true;
                }
                _ => raise |= self.execute(state, header, &words[pos + 1..end]),
            }
            pos = end;
        }
        raise
    }

    /// Resolves a GPU address through the memory hub. Addresses outside the
    /// translated range, or any address while translation is off, pass through.
    fn translate(&self, addr: u32, access: u32) -> Option<u32> {
        let regs = &self.hw.regs;
        if regs.read(REG_MH_MMU_CONFIG) & MH_MMU_CONFIG_ENABLE == 0 {
            return Some(addr);
        }

        let va = regs.read(REG_MH_MMU_VA_RANGE);
        let base = va & 0xffff_0000;
        let range = (va & 0xffff) << 16;
        if addr < base || addr - base >= range {
            return Some(addr);
        }

        let pt_base = regs.read(REG_MH_MMU_PT_BASE);
        let pte = self
            .physmem
            .read_u32(pt_base + ((addr - base) >> PAGE_SHIFT) * 4)?;
        if pte & access == 0 {
            return None;
        }
        Some((pte & MH_PTE_ADDR_MASK) | (addr & !MH_PTE_ADDR_MASK))
    }

    fn page_fault(&self, state: &mut SimState, addr: u32) -> bool {
        let regs = &self.hw.regs;
        regs.write(REG_MH_MMU_PAGE_FAULT, addr);
        regs.set_bits(REG_MH_INTERRUPT_STATUS, MH_INTERRUPT_MMU_PAGE_FAULT);
        regs.set_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_MH);
        state.stats.faults += 1;
        true
    }

    fn bus_error(&self, state: &mut SimState, addr: u32) -> bool {
        let regs = &self.hw.regs;
        regs.write(REG_MH_MMU_PAGE_FAULT, addr);
        regs.set_bits(REG_MH_INTERRUPT_STATUS, MH_INTERRUPT_AXI_WRITE_ERROR);
        regs.set_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_MH);
        state.stats.faults += 1;
        true
    }

    // =========================================================================================
    // 2D core
    // =========================================================================================

    fn step_g12(&self) -> (usize, bool) {
        let regs = &self.hw.regs;
        let mut state = self.state.lock();
        if state.stalled {
            return (0, false);
        }

        let memstore = regs.read(REG_G12_MEMSTORE_ADDR);
        let kick = regs.read(REG_G12_KICK_TS);
        let retired = self.physmem.read_u32(memstore + MEMSTORE_EOPTIMESTAMP);
        if memstore == 0 || retired.is_none_or(|r| r == kick) {
            regs.clear_bits(REG_G12_STATUS, G12_STATUS_BUSY);
            return (0, false);
        }

        let ok = self.physmem.write_u32(memstore + MEMSTORE_SOPTIMESTAMP, kick)
            && self.physmem.write_u32(memstore + MEMSTORE_EOPTIMESTAMP, kick);
        if !ok {
            state.stats.faults += 1;
            return (0, false);
        }

        state.stats.indirect_buffers += 1;
        state.stats.indirect_words += u64::from(regs.read(REG_G12_IB_SIZE));
        state.stats.mem_writes += 2;
        state.stats.interrupts += 1;
        state.stats.packets += 1;

        regs.clear_bits(REG_G12_STATUS, G12_STATUS_BUSY);
        regs.set_bits(REG_G12_IRQ_STATUS, G12_IRQ_TIMESTAMP);
        (1, true)
    }
}

fn regs_opcode_error(hw: &GpuHardware) {
    hw.regs.set_bits(REG_CP_INT_STATUS, CP_INT_OPCODE_ERROR);
    hw.regs.set_bits(REG_MASTER_INT_SIGNAL, MASTER_INT_CP);
}

/// Handle to a background simulator thread.
#[derive(Debug)]
pub struct SimThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::physmem::PHYS_BASE;
    use crate::hw::pm4::{nop_packet, type0_packet, type3_packet};
    use crate::utils::PAGE_SIZE;

    fn setup() -> (Arc<GpuHardware>, Arc<PhysicalMemory>, Arc<SimGpu>) {
        let hw = Arc::new(GpuHardware::new(DeviceId::Yamato));
        let mem = Arc::new(PhysicalMemory::new(4 * PAGE_SIZE, PAGE_SIZE));
        // 64-dword ring at the start of memory.
        hw.regs.write(REG_CP_RB_BASE, PHYS_BASE);
        hw.regs.write(REG_CP_RB_CNTL, 5);
        let sim = SimGpu::new(hw.clone(), mem.clone());
        (hw, mem, sim)
    }

    #[test]
    fn test_executes_mem_write_and_interrupt() {
        let (hw, mem, sim) = setup();
        let target = PHYS_BASE + 2 * PAGE_SIZE;
        let cmds = [
            type3_packet(PM4_MEM_WRITE, 2),
            target,
            42,
            type3_packet(PM4_INTERRUPT, 1),
            crate::hw::regs::CP_INT_RB,
        ];
        mem.write_words(PHYS_BASE, &cmds);
        hw.regs.write(REG_CP_RB_WPTR, cmds.len() as u32);

        assert_eq!(sim.run_until_idle(), 2);
        assert_eq!(mem.read_u32(target), Some(42));
        assert_eq!(hw.regs.read(REG_CP_RB_RPTR), 5);
        assert_ne!(hw.regs.read(REG_CP_INT_STATUS), 0);
        assert_eq!(sim.stats().interrupts, 1);
    }

    #[test]
    fn test_waits_for_unsubmitted_payload() {
        let (hw, mem, sim) = setup();
        mem.write_words(PHYS_BASE, &[type0_packet(REG_MH_MMU_INVALIDATE, 1), 1]);
        // Only the header is visible.
        hw.regs.write(REG_CP_RB_WPTR, 1);
        assert_eq!(sim.step(usize::MAX), 0);

        hw.regs.write(REG_CP_RB_WPTR, 2);
        assert_eq!(sim.step(usize::MAX), 1);
        assert_eq!(sim.stats().tlb_invalidates, 1);
    }

    #[test]
    fn test_wrap_nop_returns_to_zero() {
        let (hw, mem, sim) = setup();
        hw.regs.write(REG_CP_RB_RPTR, 60);
        mem.write_words(PHYS_BASE + 60 * 4, &[nop_packet(3)]);
        hw.regs.write(REG_CP_RB_WPTR, 0);
        assert_eq!(sim.step(usize::MAX), 1);
        assert_eq!(hw.regs.read(REG_CP_RB_RPTR), 0);
        assert_eq!(hw.regs.read(REG_RBBM_STATUS) & RBBM_STATUS_GUI_ACTIVE, 0);
    }

    #[test]
    fn test_mem_write_goes_through_page_table() {
        use crate::hw::regs::mh_va_range;

        let (hw, mem, sim) = setup();
        let pt = PHYS_BASE + PAGE_SIZE;
        let page = PHYS_BASE + 3 * PAGE_SIZE;
        let va = 0x6600_0000;
        mem.write_u32(pt, page | MH_PTE_READ | MH_PTE_WRITE);
        hw.regs.write(REG_MH_MMU_PT_BASE, pt);
        hw.regs.write(REG_MH_MMU_VA_RANGE, mh_va_range(va, 1 << 20));
        hw.regs.write(REG_MH_MMU_CONFIG, MH_MMU_CONFIG_ENABLE);

        let cmds = [
            type3_packet(PM4_MEM_WRITE, 2),
            va + 8,
            7,
            type3_packet(PM4_MEM_WRITE, 2),
            va + PAGE_SIZE,
            9,
        ];
        mem.write_words(PHYS_BASE, &cmds);
        hw.regs.write(REG_CP_RB_WPTR, cmds.len() as u32);
        sim.run_until_idle();

        assert_eq!(mem.read_u32(page + 8), Some(7));
        // Second page is unmapped.
        assert_eq!(hw.regs.read(REG_MH_MMU_PAGE_FAULT), va + PAGE_SIZE);
        assert_eq!(sim.stats().faults, 1);
    }

    #[test]
    fn test_indirect_buffer_is_executed() {
        let (hw, mem, sim) = setup();
        let ib = PHYS_BASE + 2 * PAGE_SIZE;
        let target = PHYS_BASE + 3 * PAGE_SIZE;
        mem.write_words(
            ib,
            &[
                nop_packet(1),
                0,
                type3_packet(PM4_MEM_WRITE, 2),
                target,
                0xabcd,
            ],
        );
        mem.write_words(
            PHYS_BASE,
            &[type3_packet(PM4_INDIRECT_BUFFER_PFD, 2), ib, 5],
        );
        hw.regs.write(REG_CP_RB_WPTR, 3);
        sim.run_until_idle();

        assert_eq!(mem.read_u32(target), Some(0xabcd));
        assert_eq!(sim.stats().indirect_buffers, 1);
        assert_eq!(sim.stats().mem_writes, 1);
    }

    #[test]
    fn test_stalled_makes_no_progress() {
        let (hw, mem, sim) = setup();
        mem.write_words(PHYS_BASE, &[nop_packet(1), 0]);
        hw.regs.write(REG_CP_RB_WPTR, 2);
        sim.set_stalled(true);
        assert_eq!(sim.step(usize::MAX), 0);
        sim.set_stalled(false);
        assert_eq!(sim.step(usize::MAX), 1);
    }
}
