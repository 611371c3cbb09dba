#![allow(clippy::cast_possible_truncation)]

//! The 3D core's ring buffer.
//!
//! A power-of-two array of dwords in physically contiguous memory. The CPU
//! owns the write pointer, the command processor owns the read pointer. The
//! ring is empty when they are equal, so the producer never lets the write
//! pointer catch up with the read pointer from behind: running out of room at
//! the tail pads it with a NOP, wraps, and then waits for the consumer to make
//! room at the head.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::error::{KgslError, KgslResult};
use crate::gsl::memory::MemDesc;
use crate::hw::pm4::{
    EVENT_CACHE_FLUSH_TS, PM4_EVENT_WRITE, PM4_INTERRUPT, PM4_ME_INIT, PM4_MEM_WRITE, PM4_TYPE2,
    PM4_SET_PROTECTED_MODE, nop_packet, type3_packet,
};
use crate::hw::regs::{
    CP_INT_MASK, CP_INT_RB, CP_ME_CNTL_HALT, REG_CP_INT_CNTL, REG_CP_INT_STATUS, REG_CP_ME_CNTL,
    REG_CP_RB_BASE, REG_CP_RB_CNTL, REG_CP_RB_RPTR, REG_CP_RB_WPTR, REG_RBBM_STATUS,
};
use crate::hw::{GpuHardware, MEMSTORE_EOPTIMESTAMP, MEMSTORE_SOPTIMESTAMP, PhysicalMemory};

/// Words always kept free at the tail for the wrap NOP.
pub const RB_NOP_SIZEDWORDS: u32 = 2;

/// Payload of the NOP that tags kernel-issued command blocks.
pub const KERNEL_CMD_IDENTIFIER: u32 = 0x7fff_ffff;

const ME_INIT_SIZEDWORDS: u32 = 18;

bitflags::bitflags! {
    /// Flags for [`RingBuffer::issuecmds`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdFlags: u32 {
        /// Drop out of protected mode around the block.
        const PMODE = 1 << 0;
        /// Block came from a client; omit the kernel marker.
        const NOT_KERNEL_CMD = 1 << 1;
        /// No completion interrupt for this timestamp.
        const NO_TS_CMP = 1 << 2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RingFlags: u32 {
        const STARTED = 1 << 0;
        /// Something has been submitted since start.
        const ACTIVE = 1 << 1;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    pub submits: u64,
    pub words: u64,
    pub wraps: u64,
    pub waitspace_calls: u64,
    pub waitspace_spins: u64,
}

#[derive(Debug)]
pub struct RingBuffer {
    hw: Arc<GpuHardware>,
    physmem: Arc<PhysicalMemory>,
    pub buffer: MemDesc,
    memstore_addr: u32,
    pub sizedwords: u32,
    pub wptr: u32,
    /// Read pointer as of the last poll.
    pub rptr: u32,
    pub timestamp: u32,
    pub flags: RingFlags,
    spin_limit: u32,
    pub stats: RingStats,
}

impl RingBuffer {
    /// Wraps `buffer`, which must be physically contiguous and a power-of-two
    /// number of dwords.
    pub fn new(
        hw: Arc<GpuHardware>,
        physmem: Arc<PhysicalMemory>,
        buffer: MemDesc,
        memstore_addr: u32,
        spin_limit: u32,
    ) -> KgslResult<Self> {
        let sizedwords = buffer.size / 4;
        if !sizedwords.is_power_of_two() || sizedwords < 16 || buffer.is_mmu_mapped() {
            return Err(KgslError::bad_param(format!(
                "unusable ring buffer 0x{:08x}+0x{:x}",
                buffer.gpuaddr, buffer.size
            )));
        }
        Ok(Self {
            hw,
            physmem,
            buffer,
            memstore_addr,
            sizedwords,
            wptr: 0,
            rptr: 0,
            timestamp: 0,
            flags: RingFlags::empty(),
            spin_limit,
            stats: RingStats::default(),
        })
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.flags.contains(RingFlags::STARTED)
    }

    /// Programs the command processor and hands it the initial `ME_INIT` packet.
    pub fn start(&mut self) -> KgslResult<()> {
        if self.is_started() {
            return Ok(());
        }
        let regs = &self.hw.regs;

        regs.write(REG_CP_ME_CNTL, CP_ME_CNTL_HALT);
        regs.write(REG_CP_RB_BASE, self.buffer.gpuaddr);
        regs.write(REG_CP_RB_CNTL, self.sizedwords.trailing_zeros() - 1);
        regs.write(REG_CP_RB_RPTR, 0);
        regs.write(REG_CP_RB_WPTR, 0);
        regs.write(REG_CP_INT_STATUS, 0);
        regs.write(REG_CP_INT_CNTL, CP_INT_MASK);
        self.physmem.fill(self.buffer.gpuaddr, 0, self.buffer.size);

        self.wptr = 0;
        self.rptr = 0;
        self.timestamp = 0;
        self.flags = RingFlags::STARTED;
        regs.write(REG_CP_ME_CNTL, 0);

        let mut init = vec![0u32; ME_INIT_SIZEDWORDS as usize + 1];
        init[0] = type3_packet(PM4_ME_INIT, ME_INIT_SIZEDWORDS);
        self.alloc_space(init.len() as u32)?;
        self.write(&init);
        self.submit();

        log::debug!(
            "ringbuffer: started at 0x{:08x}, {} dwords",
            self.buffer.gpuaddr,
            self.sizedwords
        );
        Ok(())
    }

    pub fn stop(&mut self) {
        if !self.is_started() {
            return;
        }
        self.hw.regs.write(REG_CP_ME_CNTL, CP_ME_CNTL_HALT);
        self.hw.regs.write(REG_CP_INT_CNTL, 0);
        self.flags = RingFlags::empty();
        log::debug!("ringbuffer: stopped at timestamp {}", self.timestamp);
    }

    fn poll_rptr(&mut self) -> u32 {
        self.rptr = self.hw.regs.read(REG_CP_RB_RPTR) & (self.sizedwords - 1);
        self.rptr
    }

    /// True once the command processor has consumed everything submitted.
    pub fn is_drained(&mut self) -> bool {
        self.poll_rptr() == self.wptr
    }

    /// Spins on the read pointer until `done` holds, up to the spin cap.
    fn spin_until(&mut self, what: &str, mut done: impl FnMut(&mut Self) -> bool) -> KgslResult<()> {
        let mut spins = 0u32;
        while !done(self) {
            spins += 1;
            self.stats.waitspace_spins += 1;
            if spins >= self.spin_limit {
                log::error!("ringbuffer: timed out waiting for {what}");
                self.dump();
                return Err(KgslError::Timeout);
            }
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Makes room for `numcmds` words. With `wrap` set the tail is padded
    /// with a NOP and the write pointer restarts at zero first.
    fn waitspace(&mut self, numcmds: u32, wrap: bool) -> KgslResult<()> {
        self.stats.waitspace_calls += 1;

        if wrap {
            let nopcount = self.sizedwords - self.wptr - 1;
            let pad = if nopcount == 0 { PM4_TYPE2 } else { nop_packet(nopcount) };
            self.physmem
                .write_u32(self.buffer.gpuaddr + self.wptr * 4, pad);

            // With the consumer parked at zero, wrapping would make the ring look empty.
            self.spin_until("read pointer to leave zero", |rb| rb.poll_rptr() != 0)?;

            self.wptr = 0;
            self.submit();
            self.stats.wraps += 1;
        }

        self.spin_until("ring space", |rb| {
            let freecmds = rb.poll_rptr().wrapping_sub(rb.wptr);
            freecmds == 0 || freecmds > numcmds
        })
    }

    /// Reserves `numcmds` contiguous words at the write pointer, waiting for
    /// the consumer if needed. Returns the offset the words go to.
    pub fn alloc_space(&mut self, numcmds: u32) -> KgslResult<u32> {
        if !self.is_started() {
            return Err(KgslError::failure("ring buffer not started"));
        }
        if numcmds == 0 || numcmds > self.sizedwords - RB_NOP_SIZEDWORDS - 1 {
            return Err(KgslError::bad_param(format!(
                "{numcmds} words cannot fit a {}-word ring",
                self.sizedwords
            )));
        }

        self.poll_rptr();
        if self.wptr < self.rptr && self.wptr + numcmds >= self.rptr {
            self.waitspace(numcmds, false)?;
        }
        if self.wptr >= self.rptr && self.wptr + numcmds > self.sizedwords - RB_NOP_SIZEDWORDS {
            self.waitspace(numcmds, true)?;
        }
        Ok(self.wptr)
    }

    /// Copies words to the write pointer. Space must have been reserved.
    fn write(&mut self, words: &[u32]) {
        self.physmem
            .write_words(self.buffer.gpuaddr + self.wptr * 4, words);
        self.wptr += words.len() as u32;
        self.stats.words += words.len() as u64;
    }

    /// Publishes everything written so far to the command processor.
    pub fn submit(&mut self) {
        fence(Ordering::SeqCst);
        self.hw.regs.write(REG_CP_RB_WPTR, self.wptr);
        self.flags |= RingFlags::ACTIVE;
        self.stats.submits += 1;
    }

    /// Appends `cmds` followed by the timestamp packets and submits.
    /// Returns the timestamp that retires when the block completes.
    pub fn issuecmds(&mut self, flags: CmdFlags, cmds: &[u32]) -> KgslResult<u32> {
        if !self.is_started() {
            return Err(KgslError::failure("ring buffer not started"));
        }

        let kernel = !flags.contains(CmdFlags::NOT_KERNEL_CMD);
        let pmode = flags.contains(CmdFlags::PMODE);
        let interrupt = !flags.contains(CmdFlags::NO_TS_CMP);

        let mut total = cmds.len() as u32 + 3 + 4;
        if kernel {
            total += 2;
        }
        if pmode {
            total += 4;
        }
        if interrupt {
            total += 2;
        }

        self.alloc_space(total)?;
        let timestamp = self.timestamp.wrapping_add(1);

        let mut block = Vec::with_capacity(total as usize);
        if kernel {
            block.extend([nop_packet(1), KERNEL_CMD_IDENTIFIER]);
        }
        if pmode {
            block.extend([type3_packet(PM4_SET_PROTECTED_MODE, 1), 0]);
        }
        block.extend_from_slice(cmds);
        if pmode {
            block.extend([type3_packet(PM4_SET_PROTECTED_MODE, 1), 1]);
        }
        block.extend([
            type3_packet(PM4_MEM_WRITE, 2),
            self.memstore_addr + MEMSTORE_SOPTIMESTAMP,
            timestamp,
            type3_packet(PM4_EVENT_WRITE, 3),
            EVENT_CACHE_FLUSH_TS,
            self.memstore_addr + MEMSTORE_EOPTIMESTAMP,
            timestamp,
        ]);
        if interrupt {
            block.extend([type3_packet(PM4_INTERRUPT, 1), CP_INT_RB]);
        }

        self.write(&block);
        self.timestamp = timestamp;
        self.submit();
        Ok(timestamp)
    }

    /// Logs the ring and command-processor state.
    pub fn dump(&self) {
        let regs = &self.hw.regs;
        log::error!(
            "ringbuffer: base 0x{:08x} size {} wptr {} rptr(polled) {} rptr(hw) {} ts {}",
            self.buffer.gpuaddr,
            self.sizedwords,
            self.wptr,
            self.rptr,
            regs.read(REG_CP_RB_RPTR),
            self.timestamp
        );
        log::error!(
            "ringbuffer: CP_RB_CNTL 0x{:08x} CP_ME_CNTL 0x{:08x} CP_INT_STATUS 0x{:08x} RBBM_STATUS 0x{:08x}",
            regs.read(REG_CP_RB_CNTL),
            regs.read(REG_CP_ME_CNTL),
            regs.read(REG_CP_INT_STATUS),
            regs.read(REG_RBBM_STATUS)
        );
        let stats = self.stats;
        log::error!("ringbuffer: {stats:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KgslConfig;
    use crate::gsl::memory::{MemFlags, SharedMem};
    use crate::gsl::mmu::PageTableSet;
    use crate::hw::{DeviceId, SimGpu};
    use std::time::Duration;

    struct Rig {
        sm: SharedMem,
        pts: PageTableSet,
        hw: Arc<GpuHardware>,
        sim: Arc<SimGpu>,
        memstore: MemDesc,
        rb: RingBuffer,
    }

    fn rig(sizedwords: u32) -> Rig {
        rig_with_limit(sizedwords, u32::MAX)
    }

    fn rig_with_limit(sizedwords: u32, spin_limit: u32) -> Rig {
        let cfg = KgslConfig::new().with_memory(256 * 1024, 256 * 1024);
        let physmem = Arc::new(PhysicalMemory::new(cfg.conphys_size, cfg.emem_size));
        let mut sm = SharedMem::new(physmem.clone(), &cfg).unwrap();
        let mut pts = PageTableSet::new(physmem.clone(), &cfg);
        let hw = Arc::new(GpuHardware::new(DeviceId::Yamato));
        let sim = SimGpu::new(hw.clone(), physmem.clone());

        let flags = MemFlags::CONPHYS | MemFlags::STRICTREQUEST | MemFlags::ALIGN4K;
        let buffer = sm
            .alloc(&mut pts, DeviceId::Yamato, 0, flags, sizedwords * 4)
            .unwrap();
        let memstore = sm
            .alloc(&mut pts, DeviceId::Yamato, 0, MemFlags::CONPHYS, 32)
            .unwrap();
        let mut rb = RingBuffer::new(hw.clone(), physmem, buffer, memstore.gpuaddr, spin_limit)
            .unwrap();
        rb.start().unwrap();
        sim.run_until_idle();
        Rig {
            sm,
            pts,
            hw,
            sim,
            memstore,
            rb,
        }
    }

    fn nops(n: u32) -> Vec<u32> {
        let mut v = vec![0; n as usize];
        v[0] = nop_packet(n - 1);
        v
    }

    #[test]
    fn test_issuecmds_writes_timestamps() {
        let mut r = rig(256);
        let ts = r.rb.issuecmds(CmdFlags::PMODE, &nops(4)).unwrap();
        assert_eq!(ts, 1);
        r.sim.run_until_idle();
        assert_eq!(r.sm.read_u32(&r.memstore, MEMSTORE_EOPTIMESTAMP).unwrap(), 1);
        assert_eq!(r.sm.read_u32(&r.memstore, MEMSTORE_SOPTIMESTAMP).unwrap(), 1);
        assert_ne!(r.hw.regs.read(REG_CP_INT_STATUS) & CP_INT_RB, 0);
        assert!(r.rb.is_drained());
    }

    #[test]
    fn test_no_ts_cmp_skips_interrupt() {
        let mut r = rig(256);
        r.rb.issuecmds(CmdFlags::NO_TS_CMP, &nops(2)).unwrap();
        r.sim.run_until_idle();
        assert_eq!(r.sim.stats().interrupts, 0);
    }

    #[test]
    fn test_unstarted_ring_rejects_commands() {
        let mut r = rig(256);
        r.rb.stop();
        assert!(matches!(
            r.rb.issuecmds(CmdFlags::empty(), &nops(2)),
            Err(KgslError::Failure(_))
        ));
    }

    #[test]
    fn test_flow_control_with_running_consumer() {
        let mut r = rig(256);
        let _consumer = r.sim.spawn(Duration::from_micros(50));

        let mut last = 0;
        for i in 0..2000u32 {
            let n = 2 + (i * 7) % 60;
            let at = r.rb.alloc_space(n).unwrap();
            // Never run into the unconsumed region or the tail slack.
            if at < r.rb.rptr {
                assert!(at + n < r.rb.rptr);
            } else {
                assert!(at + n <= r.rb.sizedwords - RB_NOP_SIZEDWORDS);
            }
            r.rb.write(&nops(n));
            r.rb.submit();

            if i % 10 == 0 {
                let ts = r.rb.issuecmds(CmdFlags::empty(), &nops(3)).unwrap();
                assert!(ts > last);
                last = ts;
            }
        }
        assert!(r.rb.stats.wraps > 0);
    }

    #[test]
    fn test_wrap_waits_for_stalled_consumer() {
        let mut r = rig(512);
        let target = r
            .sm
            .alloc(&mut r.pts, DeviceId::Yamato, 0, MemFlags::CONPHYS, 100 * 4)
            .unwrap();

        // 300 words in flight: 100 memory writes the consumer has not run yet.
        r.sim.set_stalled(true);
        let start = r.rb.wptr;
        for i in 0..100u32 {
            r.rb.alloc_space(3).unwrap();
            r.rb.write(&[type3_packet(PM4_MEM_WRITE, 2), target.gpuaddr + i * 4, 0x1000 + i]);
        }
        r.rb.submit();
        assert_eq!(r.rb.wptr - start, 300);

        let sim = r.sim.clone();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            sim.set_stalled(false);
            for _ in 0..1000 {
                sim.run_until_idle();
                std::thread::sleep(Duration::from_millis(1));
            }
        });

        let at = r.rb.alloc_space(256).unwrap();
        assert_eq!(at, 0);
        assert!(r.rb.stats.wraps >= 1);
        releaser.join().unwrap();

        for i in 0..100u32 {
            assert_eq!(r.sm.read_u32(&target, i * 4).unwrap(), 0x1000 + i);
        }
    }

    #[test]
    fn test_waitspace_gives_up_on_stalled_consumer() {
        let mut r = rig_with_limit(256, 1000);
        r.sim.set_stalled(true);

        let at = r.rb.alloc_space(200).unwrap();
        r.rb.write(&nops(200));
        r.rb.submit();
        assert_eq!(r.rb.wptr, at + 200);

        // The tail cannot hold 100 words and the consumer never frees the head.
        let err = r.rb.alloc_space(100).unwrap_err();
        assert!(matches!(err, KgslError::Timeout), "{err:?}");
        assert_eq!(r.rb.stats.wraps, 1);
        assert!(r.rb.stats.waitspace_spins >= 1000);
        assert_eq!(r.rb.wptr, 0);
        assert_eq!(r.hw.regs.read(REG_CP_RB_WPTR), 0);

        r.sim.set_stalled(false);
        r.sim.run_until_idle();
        assert!(r.rb.is_drained());
        assert_eq!(r.rb.alloc_space(100).unwrap(), 0);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let mut r = rig(256);
        assert!(matches!(r.rb.alloc_space(254), Err(KgslError::BadParam(_))));
    }
}
