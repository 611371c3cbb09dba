//! Command submission and timestamps.
//!
//! Submissions go through the core's ops table; completion is observed via
//! the memstore, either polled with [`Device::readtimestamp`] or waited on
//! through [`DeviceShared::wait_timestamp`](crate::gsl::device::DeviceShared::wait_timestamp)
//! outside the driver lock.

use crate::error::{KgslError, KgslResult};
use crate::gsl::device::{Device, DeviceFlags, TimestampType};
use crate::gsl::memory::MemDesc;
use crate::gsl::ringbuffer::CmdFlags;
use crate::gsl::{GslEnv, Pid};
use crate::utils::timestamp_passed;

/// Command flags a client may set on its own submissions.
pub const CLIENT_CMD_FLAGS: CmdFlags = CmdFlags::NO_TS_CMP;

impl Device {
    /// Queues a client indirect buffer, switching draw context and page
    /// table as needed. Returns the timestamp that retires with it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn issueibcmds(
        &mut self,
        env: &mut GslEnv<'_>,
        pid: Pid,
        context: Option<u32>,
        ibaddr: u32,
        sizedwords: u32,
        flags: CmdFlags,
    ) -> KgslResult<u32> {
        self.require_started()?;
        if sizedwords == 0 {
            return Err(KgslError::bad_param("empty indirect buffer"));
        }
        self.process_faults();
        self.check_context(pid, context)?;

        if self.flags.contains(DeviceFlags::SAFEMODE)
            && !env
                .sharedmem
                .contains_range(ibaddr, sizedwords.saturating_mul(4))
        {
            return Err(KgslError::bad_param(format!(
                "indirect buffer 0x{ibaddr:08x}+{sizedwords} is not inside a live block"
            )));
        }

        let ops = self.ops;
        let ts = ops.issueibcmds(
            self,
            env,
            pid,
            context,
            ibaddr,
            sizedwords,
            flags & CLIENT_CMD_FLAGS,
        )?;
        log::trace!(
            "cmdstream[{}]: pid {pid} ib 0x{ibaddr:08x}+{sizedwords} -> ts {ts}",
            self.id.name()
        );
        self.drain_memqueue(env);
        Ok(ts)
    }

    /// Issues a timestamp with no work attached.
    pub(crate) fn addtimestamp(&mut self, env: &mut GslEnv<'_>, pid: Pid) -> KgslResult<u32> {
        self.require_started()?;
        let ops = self.ops;
        let ts = ops.addtimestamp(self, env, pid)?;
        self.drain_memqueue(env);
        Ok(ts)
    }

    /// Latest timestamp handed out on this device.
    #[must_use]
    pub fn current_timestamp(&self) -> u32 {
        self.ops.current_timestamp(self)
    }

    pub fn readtimestamp(&self, ty: TimestampType) -> KgslResult<u32> {
        self.shared
            .read_timestamp(ty)
            .ok_or_else(|| KgslError::not_initialized(format!("{} has no memstore", self.id.name())))
    }

    /// True once `timestamp` has retired.
    pub fn check_timestamp(&self, timestamp: u32) -> KgslResult<bool> {
        let retired = self.readtimestamp(TimestampType::Retired)?;
        Ok(timestamp_passed(retired, timestamp))
    }

    /// Frees `desc` once `timestamp` has retired, immediately if it already has.
    pub(crate) fn freememontimestamp(
        &mut self,
        env: &mut GslEnv<'_>,
        pid: Pid,
        desc: MemDesc,
        timestamp: u32,
    ) -> KgslResult<()> {
        self.require_started()?;
        let owner = env.sharedmem.owner_of(&desc)?;
        if owner != pid {
            return Err(KgslError::bad_param(format!(
                "block 0x{:08x} belongs to pid {owner}",
                desc.gpuaddr
            )));
        }
        if self.memqueue.iter().any(|e| e.desc == desc) {
            return Err(KgslError::bad_param("block is already queued for freeing"));
        }

        if self.check_timestamp(timestamp)? {
            return env.free(&desc);
        }
        self.memqueue.push(timestamp, desc, pid);
        Ok(())
    }

    /// Frees every queued block whose timestamp has retired. Returns how many.
    pub(crate) fn drain_memqueue(&mut self, env: &mut GslEnv<'_>) -> usize {
        let Some(retired) = self.shared.read_timestamp(TimestampType::Retired) else {
            return 0;
        };
        let freed = self.memqueue.drain_retired(retired);
        for entry in &freed {
            if let Err(e) = env.free(&entry.desc) {
                log::warn!(
                    "cmdstream[{}]: deferred free of 0x{:08x} failed: {e}",
                    self.id.name(),
                    entry.desc.gpuaddr
                );
            }
        }
        freed.len()
    }

    pub(crate) fn cmdwindow_write(&mut self, target: u32, addr: u32, data: u32) -> KgslResult<()> {
        self.require_started()?;
        let ops = self.ops;
        ops.cmdwindow_write(self, target, addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KgslConfig;
    use crate::gsl::drawctxt::{ContextType, DrawCtxtFlags};
    use crate::gsl::memory::{MemFlags, SharedMem};
    use crate::gsl::mmu::PageTableSet;
    use crate::hw::pm4::nop_packet;
    use crate::hw::{DeviceId, GpuHardware, PhysicalMemory, SimGpu};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const PID: Pid = 100;

    struct Rig {
        cfg: KgslConfig,
        sm: SharedMem,
        pts: PageTableSet,
        dev: Device,
        sim: Arc<SimGpu>,
    }

    impl Rig {
        fn new(id: DeviceId, cfg: KgslConfig, start: DeviceFlags) -> Self {
            let physmem = Arc::new(PhysicalMemory::new(cfg.conphys_size, cfg.emem_size));
            let mut sm = SharedMem::new(physmem.clone(), &cfg).unwrap();
            let mut pts = PageTableSet::new(physmem.clone(), &cfg);
            pts.attach(&mut sm, pts.owner_for(PID), id).unwrap();
            let hw = Arc::new(GpuHardware::new(id));
            let sim = SimGpu::new(hw.clone(), physmem.clone());
            let mut rig = Self {
                cfg,
                sm,
                pts,
                dev: Device::new(id, hw, physmem),
                sim,
            };
            rig.with_env(|dev, env| {
                dev.init(env)?;
                dev.start(env, start)
            })
            .unwrap();
            rig
        }

        fn yamato() -> Self {
            let cfg = KgslConfig::new()
                .with_memory(1024 * 1024, 4 * 1024 * 1024)
                .with_ringbuffer_sizedwords(1024);
            Self::new(DeviceId::Yamato, cfg, DeviceFlags::empty())
        }

        fn with_env<R>(&mut self, f: impl FnOnce(&mut Device, &mut GslEnv<'_>) -> R) -> R {
            let mut env = GslEnv {
                sharedmem: &mut self.sm,
                pagetables: &mut self.pts,
                config: &self.cfg,
            };
            f(&mut self.dev, &mut env)
        }

        /// An indirect buffer of NOPs filling the whole block.
        fn ib(&mut self, sizedwords: u32) -> MemDesc {
            let desc = self
                .with_env(|_, env| env.alloc(DeviceId::Yamato, PID, MemFlags::empty(), sizedwords * 4))
                .unwrap();
            let total = desc.size / 4;
            let mut words = vec![0; total as usize];
            words[0] = nop_packet(total - 1);
            self.sm.write_words(&desc, 0, &words).unwrap();
            desc
        }

        fn submit(&mut self, ib: &MemDesc, ctx: Option<u32>) -> KgslResult<u32> {
            let (addr, words) = (ib.gpuaddr, ib.size / 4);
            self.with_env(|dev, env| dev.issueibcmds(env, PID, ctx, addr, words, CmdFlags::empty()))
        }
    }

    #[test]
    fn test_issue_and_retire() {
        let mut rig = Rig::yamato();
        let ib = rig.ib(16);
        let ts = rig.submit(&ib, None).unwrap();
        rig.sim.run_until_idle();

        assert_eq!(rig.dev.readtimestamp(TimestampType::Retired).unwrap(), ts);
        assert_eq!(rig.dev.readtimestamp(TimestampType::Consumed).unwrap(), ts);
        assert!(rig.dev.check_timestamp(ts).unwrap());
        let stats = rig.sim.stats();
        assert_eq!(stats.indirect_buffers, 1);
        assert_eq!(stats.pagetable_switches, 1);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_timestamps_increase_and_retired_never_leads() {
        let mut rig = Rig::yamato();
        let _gpu = rig.sim.spawn(Duration::from_micros(100));
        let ib = rig.ib(8);

        let mut last = 0;
        for _ in 0..200 {
            let ts = rig.submit(&ib, None).unwrap();
            assert!(ts > last);
            last = ts;
            let retired = rig.dev.readtimestamp(TimestampType::Retired).unwrap();
            assert!(retired <= rig.dev.current_timestamp());
        }
    }

    #[test]
    fn test_waiter_woken_by_completion_interrupt() {
        let mut rig = Rig::yamato();
        let ib = rig.ib(8);
        for _ in 0..3 {
            rig.submit(&ib, None).unwrap();
        }
        rig.sim.run_until_idle();
        let retired = rig.dev.readtimestamp(TimestampType::Retired).unwrap();

        rig.sim.set_stalled(true);
        rig.submit(&ib, None).unwrap();
        let target = rig.submit(&ib, None).unwrap();
        assert_eq!(target, retired + 2);

        let shared = rig.dev.shared().clone();
        let started = Instant::now();
        // A poll interval far beyond the test means only the interrupt can wake it.
        let waiter = std::thread::spawn(move || {
            shared.wait_timestamp(PID, target, Duration::from_secs(10), Duration::from_secs(60))
        });

        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        rig.sim.set_stalled(false);
        rig.sim.run_until_idle();

        assert!(waiter.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_wait_times_out_and_can_be_cancelled() {
        let mut rig = Rig::yamato();
        let ib = rig.ib(8);
        rig.sim.set_stalled(true);
        let ts = rig.submit(&ib, None).unwrap();

        let shared = rig.dev.shared().clone();
        let poll = Duration::from_millis(5);
        assert!(matches!(
            shared.wait_timestamp(PID, ts, Duration::from_millis(20), poll),
            Err(KgslError::Timeout)
        ));

        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.wait_timestamp(PID, ts, Duration::from_secs(10), poll))
        };
        while !waiter.is_finished() {
            shared.cancel(PID);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(waiter.join().unwrap(), Err(KgslError::Interrupted)));
    }

    #[test]
    fn test_deferred_free_after_retire() {
        let mut rig = Rig::yamato();
        let ib = rig.ib(8);
        rig.sim.set_stalled(true);
        let ts = rig.submit(&ib, None).unwrap();

        let before = rig.sm.block_count();
        rig.with_env(|dev, env| dev.freememontimestamp(env, PID, ib, ts))
            .unwrap();
        assert_eq!(rig.dev.memqueue.len(), 1);
        assert!(
            rig.with_env(|dev, env| dev.freememontimestamp(env, PID, ib, ts))
                .is_err()
        );

        rig.sim.set_stalled(false);
        rig.sim.run_until_idle();
        assert_eq!(rig.with_env(|dev, env| dev.drain_memqueue(env)), 1);
        assert_eq!(rig.sm.block_count(), before - 1);
    }

    #[test]
    fn test_faulted_context_is_rejected() {
        let mut rig = Rig::yamato();
        let ctx = rig
            .with_env(|dev, env| {
                dev.drawctxt.create(
                    env,
                    DeviceId::Yamato,
                    PID,
                    ContextType::OpenGl,
                    DrawCtxtFlags::NO_GMEM_ALLOC,
                    true,
                )
            })
            .unwrap();

        // Inside the translated range but never mapped.
        let (va_base, va_range) = rig.pts.va_range();
        let bogus = va_base + va_range - 0x1000;
        let ts = rig
            .with_env(|dev, env| dev.issueibcmds(env, PID, Some(ctx), bogus, 4, CmdFlags::empty()))
            .unwrap();
        rig.sim.run_until_idle();
        assert!(rig.dev.check_timestamp(ts).unwrap());

        let ib = rig.ib(8);
        assert!(matches!(rig.submit(&ib, Some(ctx)), Err(KgslError::Device(_))));
        assert_eq!(rig.dev.mmu.faults().next().map(|f| f.addr), Some(bogus));
        // Other submissions are unaffected.
        assert!(rig.submit(&ib, None).is_ok());
    }

    #[test]
    fn test_context_switch_runs_restore_lists() {
        use crate::hw::regs::REG_SCRATCH_REG0;

        let mut rig = Rig::yamato();
        let create = |rig: &mut Rig| {
            rig.with_env(|dev, env| {
                dev.drawctxt.create(
                    env,
                    DeviceId::Yamato,
                    PID,
                    ContextType::OpenGl,
                    DrawCtxtFlags::empty(),
                    true,
                )
            })
            .unwrap()
        };
        let a = create(&mut rig);
        let b = create(&mut rig);
        let ib = rig.ib(8);

        rig.submit(&ib, Some(a)).unwrap();
        rig.submit(&ib, Some(b)).unwrap();
        rig.sim.run_until_idle();
        assert_eq!(rig.dev.hw.regs.read(REG_SCRATCH_REG0), b);
        assert_eq!(rig.sim.stats().faults, 0);

        // a's register and GMEM saves landed in its shadows.
        let ca = rig.dev.drawctxt.get(a).unwrap().clone();
        let saved = rig.sm.read_u32(&ca.gpustate.unwrap(), 0).unwrap();
        assert_eq!(saved, crate::gsl::drawctxt::REG_SAVED_MAGIC | a);
        let gmem = rig.sm.read_u32(&ca.gmem_shadow.unwrap(), 0).unwrap();
        assert_eq!(gmem, crate::gsl::drawctxt::GMEM_SAVED_MAGIC | a);
    }

    #[test]
    fn test_safemode_validates_indirect_buffers() {
        let cfg = KgslConfig::new()
            .with_mmu(false)
            .with_memory(1024 * 1024, 2 * 1024 * 1024)
            .with_ringbuffer_sizedwords(1024);
        let mut rig = Rig::new(DeviceId::Yamato, cfg, DeviceFlags::SAFEMODE);
        assert!(!rig.dev.mmu.enabled());

        let ib = rig.ib(8);
        assert!(rig.submit(&ib, None).is_ok());
        let outside = ib.gpuaddr + ib.size;
        let res = rig.with_env(|dev, env| dev.issueibcmds(env, PID, None, outside, 8, CmdFlags::empty()));
        assert!(matches!(res, Err(KgslError::BadParam(_))));
    }

    #[test]
    fn test_g12_kick_and_cmdwindow() {
        let cfg = KgslConfig::new().with_memory(1024 * 1024, 2 * 1024 * 1024);
        let mut rig = Rig::new(DeviceId::G12, cfg, DeviceFlags::empty());
        let ts1 = rig.with_env(|dev, env| dev.addtimestamp(env, PID)).unwrap();
        let ts2 = rig
            .with_env(|dev, env| dev.issueibcmds(env, PID, None, 0x6600_0000, 4, CmdFlags::empty()))
            .unwrap();
        assert_eq!((ts1, ts2), (1, 2));
        rig.sim.run_until_idle();
        assert!(rig.dev.check_timestamp(2).unwrap());
        assert!(rig.dev.shared().irq_count() >= 1);

        rig.dev.cmdwindow_write(2, 0x10, 0xdead).unwrap();
        assert!(matches!(
            rig.dev.cmdwindow_write(4, 0x10, 0),
            Err(KgslError::BadParam(_))
        ));
    }

    #[test]
    fn test_cmdwindow_unsupported_on_3d() {
        let mut rig = Rig::yamato();
        assert!(matches!(
            rig.dev.cmdwindow_write(0, 0, 0),
            Err(KgslError::NotSupported(_))
        ));
    }
}
