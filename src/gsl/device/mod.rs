//! GPU cores.
//!
//! A [`Device`] is the driver-lock-protected state of one core: lifecycle
//! flags and reference count, MMU, ring buffer, draw contexts, memstore and
//! deferred-free queue. Behaviour that differs between the 3D and 2D cores
//! goes through the core's [`DeviceOps`] table.
//!
//! The part of a device that must be reachable without the driver lock (the
//! interrupt handler and timestamp waiters) lives in [`DeviceShared`].

mod g12;
mod yamato;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{KgslError, KgslResult};
use crate::gsl::drawctxt::{DrawContextTable, DrawCtxtFlags};
use crate::gsl::memory::{MemDesc, MemFlags};
use crate::gsl::memqueue::MemQueue;
use crate::gsl::mmu::{Mmu, MmuFault};
use crate::gsl::ringbuffer::{CmdFlags, RingBuffer};
use crate::gsl::{GslEnv, Pid};
use crate::hw::regs::REG_COUNT;
use crate::hw::{
    DeviceId, GpuHardware, MEMSTORE_EOPTIMESTAMP, MEMSTORE_SIZE, MEMSTORE_SOPTIMESTAMP,
    PhysicalMemory, YAMATO_GMEM_BASE, YAMATO_GMEM_SIZE,
};
use crate::utils::timestamp_passed;

pub use g12::G12_CMDWINDOW_TARGETS;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        const INITIALIZED = 1 << 0;
        const STARTED = 1 << 1;
        /// MMU off, indirect buffers validated against the arena.
        const SAFEMODE = 1 << 2;
        /// The last idle attempt timed out.
        const IDLE_TIMEOUT = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PowerFlags: u32 {
        const POWER_ON = 1 << 0;
        const CLK_ON = 1 << 1;
        const OVERRIDE_ON = 1 << 2;
        const OVERRIDE_OFF = 1 << 3;
    }
}

/// Which memstore timestamp to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TimestampType {
    /// Fetched by the command processor.
    Consumed = 1,
    /// Fully executed.
    Retired = 2,
}

impl TimestampType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Consumed),
            2 => Some(Self::Retired),
            _ => None,
        }
    }

    const fn memstore_offset(self) -> u32 {
        match self {
            Self::Consumed => MEMSTORE_SOPTIMESTAMP,
            Self::Retired => MEMSTORE_EOPTIMESTAMP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PropertyType {
    DeviceInfo = 1,
    DeviceShadow = 2,
    DevicePower = 3,
    MmuEnable = 6,
    InterruptWaits = 7,
}

impl PropertyType {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::DeviceInfo),
            2 => Some(Self::DeviceShadow),
            3 => Some(Self::DevicePower),
            6 => Some(Self::MmuEnable),
            7 => Some(Self::InterruptWaits),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceInfo {
    pub device_id: u32,
    pub chip_id: u32,
    pub mmu_enabled: u32,
    pub gmem_gpubase: u32,
    pub gmem_sizebytes: u32,
}

/// Where the memstore can be read by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DeviceShadow {
    pub hostptr: u64,
    pub gpuaddr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    DeviceInfo(DeviceInfo),
    DeviceShadow(DeviceShadow),
    DevicePower(PowerFlags),
    MmuEnable(bool),
    InterruptWaits(bool),
}

impl Property {
    #[must_use]
    pub const fn kind(&self) -> PropertyType {
        match self {
            Self::DeviceInfo(_) => PropertyType::DeviceInfo,
            Self::DeviceShadow(_) => PropertyType::DeviceShadow,
            Self::DevicePower(_) => PropertyType::DevicePower,
            Self::MmuEnable(_) => PropertyType::MmuEnable,
            Self::InterruptWaits(_) => PropertyType::InterruptWaits,
        }
    }
}

/// Lifecycle counters, mostly for tests and diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStats {
    pub hw_starts: u32,
    pub hw_stops: u32,
    pub idle_timeouts: u32,
}

/// Core-specific behaviour.
pub(crate) trait DeviceOps: Send + Sync + fmt::Debug {
    /// Reads chip identification.
    fn init(&self, dev: &mut Device) -> KgslResult<()>;
    /// Hardware bring-up on the first start.
    fn start(&self, dev: &mut Device, env: &mut GslEnv<'_>) -> KgslResult<()>;
    /// Hardware teardown on the last stop. The device has been idled.
    fn stop(&self, dev: &mut Device, env: &mut GslEnv<'_>);
    /// One poll of the idle condition.
    fn is_idle(&self, dev: &mut Device) -> bool;
    /// Latest timestamp handed out.
    fn current_timestamp(&self, dev: &Device) -> u32;
    /// Makes the hardware walk `pid`'s page table with a current TLB.
    fn setpagetable(&self, dev: &mut Device, env: &mut GslEnv<'_>, pid: Pid) -> KgslResult<()>;
    /// Queues an indirect buffer, switching draw context first.
    fn issueibcmds(
        &self,
        dev: &mut Device,
        env: &mut GslEnv<'_>,
        pid: Pid,
        context: Option<u32>,
        ibaddr: u32,
        sizedwords: u32,
        flags: CmdFlags,
    ) -> KgslResult<u32>;
    /// Issues a timestamp with no work attached.
    fn addtimestamp(&self, dev: &mut Device, env: &mut GslEnv<'_>, pid: Pid) -> KgslResult<u32>;
    fn cmdwindow_write(&self, dev: &mut Device, target: u32, addr: u32, data: u32) -> KgslResult<()>;
    /// Whether contexts carry saved 3D state.
    fn has_context_state(&self) -> bool;
    /// Interrupt service routine. Runs without the driver lock.
    fn isr(&self, shared: &DeviceShared);
    /// Logs the core's registers after a hang.
    fn dump(&self, dev: &Device);
}

#[derive(Debug, Default)]
struct WaitState {
    /// Blocked waiters per process.
    waiters: HashMap<Pid, u32>,
    /// Processes whose current waits must return early.
    cancelled: HashSet<Pid>,
}

/// The part of a device reachable without the driver lock.
#[derive(Debug)]
pub struct DeviceShared {
    pub id: DeviceId,
    hw: Arc<GpuHardware>,
    physmem: Arc<PhysicalMemory>,
    /// Physical address of the memstore, zero when there is none.
    memstore_addr: AtomicU32,
    irq_count: AtomicU32,
    /// Draw context the hardware is running, `u32::MAX` for none.
    active_ctx: AtomicU32,
    wait: Mutex<WaitState>,
    cond: Condvar,
    pending_faults: Mutex<Vec<MmuFault>>,
}

impl DeviceShared {
    fn new(id: DeviceId, hw: Arc<GpuHardware>, physmem: Arc<PhysicalMemory>) -> Self {
        Self {
            id,
            hw,
            physmem,
            memstore_addr: AtomicU32::new(0),
            irq_count: AtomicU32::new(0),
            active_ctx: AtomicU32::new(u32::MAX),
            wait: Mutex::new(WaitState::default()),
            cond: Condvar::new(),
            pending_faults: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn hw(&self) -> &GpuHardware {
        &self.hw
    }

    fn set_memstore(&self, addr: u32) {
        self.memstore_addr.store(addr, Ordering::Release);
    }

    /// Reads a memstore timestamp. `None` once the memstore is gone.
    #[must_use]
    pub fn read_timestamp(&self, ty: TimestampType) -> Option<u32> {
        let base = self.memstore_addr.load(Ordering::Acquire);
        if base == 0 {
            return None;
        }
        self.physmem.read_u32(base + ty.memstore_offset())
    }

    #[must_use]
    pub fn irq_count(&self) -> u32 {
        self.irq_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_active_context(&self, ctx: Option<u32>) {
        self.active_ctx
            .store(ctx.unwrap_or(u32::MAX), Ordering::Release);
    }

    #[must_use]
    pub fn active_context(&self) -> Option<u32> {
        let ctx = self.active_ctx.load(Ordering::Acquire);
        (ctx != u32::MAX).then_some(ctx)
    }

    /// Called by the interrupt handler for every serviced interrupt.
    pub(crate) fn note_irq(&self) {
        self.irq_count.fetch_add(1, Ordering::AcqRel);
        self.wake_all();
    }

    pub(crate) fn push_fault(&self, fault: MmuFault) {
        self.pending_faults.lock().push(fault);
    }

    fn take_faults(&self) -> Vec<MmuFault> {
        std::mem::take(&mut *self.pending_faults.lock())
    }

    /// Wakes every waiter so it re-checks its condition.
    pub fn wake_all(&self) {
        let _guard = self.wait.lock();
        self.cond.notify_all();
    }

    /// Makes every wait currently blocked on behalf of `pid` return
    /// [`KgslError::Interrupted`].
    pub fn cancel(&self, pid: Pid) {
        let mut st = self.wait.lock();
        if st.waiters.contains_key(&pid) {
            st.cancelled.insert(pid);
            self.cond.notify_all();
        }
    }

    /// Blocks until `done` yields a result, re-evaluating it on every wakeup
    /// and at least every `poll`.
    fn wait_until<T>(
        &self,
        pid: Pid,
        timeout: Duration,
        poll: Duration,
        mut done: impl FnMut(&Self) -> Option<KgslResult<T>>,
    ) -> KgslResult<T> {
        let deadline = Instant::now() + timeout;
        let mut st = self.wait.lock();
        *st.waiters.entry(pid).or_default() += 1;

        let result = loop {
            if let Some(r) = done(self) {
                break r;
            }
            if st.cancelled.contains(&pid) {
                break Err(KgslError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(KgslError::Timeout);
            }
            let wake_at = deadline.min(now + poll);
            self.cond.wait_until(&mut st, wake_at);
        };

        if let Some(n) = st.waiters.get_mut(&pid) {
            *n -= 1;
            if *n == 0 {
                st.waiters.remove(&pid);
                st.cancelled.remove(&pid);
            }
        }
        result
    }

    /// Blocks until `timestamp` has retired.
    pub fn wait_timestamp(
        &self,
        pid: Pid,
        timestamp: u32,
        timeout: Duration,
        poll: Duration,
    ) -> KgslResult<()> {
        self.wait_until(pid, timeout, poll, |shared| {
            match shared.read_timestamp(TimestampType::Retired) {
                None => Some(Err(KgslError::not_initialized("device memstore is gone"))),
                Some(retired) if timestamp_passed(retired, timestamp) => Some(Ok(())),
                Some(_) => None,
            }
        })
    }

    /// Blocks until the interrupt count moves past `seen`. Returns the new count.
    pub fn wait_irq(&self, pid: Pid, seen: u32, timeout: Duration, poll: Duration) -> KgslResult<u32> {
        self.wait_until(pid, timeout, poll, |shared| {
            let now = shared.irq_count();
            (now != seen).then_some(Ok(now))
        })
    }
}

/// One GPU core.
#[derive(Debug)]
pub struct Device {
    pub id: DeviceId,
    pub flags: DeviceFlags,
    pub refcnt: u32,
    pub chip_id: u32,
    pub power: PowerFlags,
    pub(crate) hw: Arc<GpuHardware>,
    pub(crate) ops: &'static dyn DeviceOps,
    pub mmu: Mmu,
    pub ringbuffer: Option<RingBuffer>,
    pub drawctxt: DrawContextTable,
    pub memstore: Option<MemDesc>,
    pub memqueue: MemQueue,
    /// Last timestamp issued on cores without a ring buffer.
    pub(crate) timestamp: u32,
    pub(crate) shared: Arc<DeviceShared>,
    pub stats: DeviceStats,
}

impl Device {
    #[must_use]
    pub fn new(id: DeviceId, hw: Arc<GpuHardware>, physmem: Arc<PhysicalMemory>) -> Self {
        let ops: &'static dyn DeviceOps = match id {
            DeviceId::Yamato => &yamato::Yamato,
            DeviceId::G12 => &g12::G12,
        };
        Self {
            id,
            flags: DeviceFlags::empty(),
            refcnt: 0,
            chip_id: 0,
            power: PowerFlags::empty(),
            shared: Arc::new(DeviceShared::new(id, hw.clone(), physmem)),
            hw,
            ops,
            mmu: Mmu::new(id),
            ringbuffer: None,
            drawctxt: DrawContextTable::for_device(id),
            memstore: None,
            memqueue: MemQueue::new(),
            timestamp: 0,
            stats: DeviceStats::default(),
        }
    }

    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.flags.contains(DeviceFlags::STARTED)
    }

    #[must_use]
    pub fn shared(&self) -> &Arc<DeviceShared> {
        &self.shared
    }

    pub(crate) fn require_started(&self) -> KgslResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(KgslError::failure(format!("{} is not started", self.id.name())))
        }
    }

    // ===========================================================================================
    // Lifecycle
    // ===========================================================================================

    /// Allocates the memstore and identifies the chip. Idempotent.
    pub(crate) fn init(&mut self, env: &mut GslEnv<'_>) -> KgslResult<()> {
        if self.flags.contains(DeviceFlags::INITIALIZED) {
            return Ok(());
        }
        let ops = self.ops;
        ops.init(self)?;

        let memstore = env.alloc(self.id, 0, MemFlags::CONPHYS, MEMSTORE_SIZE)?;
        self.shared.set_memstore(memstore.gpuaddr);
        self.memstore = Some(memstore);
        self.flags = DeviceFlags::INITIALIZED;

        log::info!(
            "device[{}]: initialized, chip id 0x{:08x}",
            self.id.name(),
            self.chip_id
        );
        Ok(())
    }

    /// Takes a start reference; the hardware is brought up on the first one.
    pub(crate) fn start(&mut self, env: &mut GslEnv<'_>, flags: DeviceFlags) -> KgslResult<()> {
        if !self.flags.contains(DeviceFlags::INITIALIZED) {
            return Err(KgslError::not_initialized(format!(
                "{} is not initialized",
                self.id.name()
            )));
        }

        self.refcnt += 1;
        if self.refcnt > 1 {
            log::debug!("device[{}]: start, refcnt {}", self.id.name(), self.refcnt);
            return Ok(());
        }

        self.flags.set(DeviceFlags::SAFEMODE, flags.contains(DeviceFlags::SAFEMODE));
        self.flags.remove(DeviceFlags::IDLE_TIMEOUT);
        let ops = self.ops;
        if let Err(e) = ops.start(self, env) {
            log::error!("device[{}]: hardware start failed: {e}", self.id.name());
            self.refcnt -= 1;
            self.flags.remove(DeviceFlags::SAFEMODE);
            return Err(e);
        }

        self.flags |= DeviceFlags::STARTED;
        self.power = PowerFlags::POWER_ON | PowerFlags::CLK_ON;
        self.stats.hw_starts += 1;
        log::info!(
            "device[{}]: started{}",
            self.id.name(),
            if self.flags.contains(DeviceFlags::SAFEMODE) {
                " in safe mode"
            } else {
                ""
            }
        );
        Ok(())
    }

    /// Drops a start reference; the last one idles and tears the hardware down.
    pub(crate) fn stop(&mut self, env: &mut GslEnv<'_>) -> KgslResult<()> {
        if self.refcnt == 0 {
            return Err(KgslError::failure(format!("{} is not started", self.id.name())));
        }
        self.refcnt -= 1;
        if self.refcnt > 0 {
            log::debug!("device[{}]: stop, refcnt {}", self.id.name(), self.refcnt);
            return Ok(());
        }

        if let Err(e) = self.idle(env.config.idle_spin_limit, None) {
            log::error!("device[{}]: not idle at stop: {e}", self.id.name());
        }

        let ops = self.ops;
        ops.stop(self, env);
        self.shared.set_active_context(None);

        for entry in self.memqueue.drain_all() {
            if let Err(e) = env.free(&entry.desc) {
                log::warn!("device[{}]: deferred free at stop: {e}", self.id.name());
            }
        }

        self.flags.remove(DeviceFlags::STARTED | DeviceFlags::SAFEMODE);
        self.power = PowerFlags::empty();
        self.stats.hw_stops += 1;
        self.shared.wake_all();
        log::info!("device[{}]: stopped", self.id.name());
        Ok(())
    }

    /// Stops regardless of how many start references are held.
    pub(crate) fn force_stop(&mut self, env: &mut GslEnv<'_>) {
        if self.refcnt > 0 {
            self.refcnt = 1;
            if let Err(e) = self.stop(env) {
                log::warn!("device[{}]: forced stop: {e}", self.id.name());
            }
        }
    }

    /// Releases the memstore. The device must be stopped.
    pub(crate) fn close(&mut self, env: &mut GslEnv<'_>) -> KgslResult<()> {
        if self.refcnt > 0 {
            return Err(KgslError::failure(format!(
                "{} still has {} start reference(s)",
                self.id.name(),
                self.refcnt
            )));
        }
        if let Some(memstore) = self.memstore.take() {
            self.shared.set_memstore(0);
            env.free(&memstore)?;
        }
        self.flags = DeviceFlags::empty();
        self.shared.wake_all();
        log::info!("device[{}]: closed", self.id.name());
        Ok(())
    }

    /// Busy-polls until the core has drained everything submitted, giving up
    /// after `spin_limit` polls or `timeout`, whichever comes first.
    pub fn idle(&mut self, spin_limit: u32, timeout: Option<Duration>) -> KgslResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let ops = self.ops;

        let mut spins = 0u32;
        while !ops.is_idle(self) {
            spins += 1;
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            if spins >= spin_limit || expired {
                self.flags |= DeviceFlags::IDLE_TIMEOUT;
                self.stats.idle_timeouts += 1;
                log::error!(
                    "device[{}]: idle timed out after {spins} polls",
                    self.id.name()
                );
                ops.dump(self);
                return Err(KgslError::Timeout);
            }
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        self.flags.remove(DeviceFlags::IDLE_TIMEOUT);
        Ok(())
    }

    // ===========================================================================================
    // Properties and registers
    // ===========================================================================================

    pub fn getproperty(&self, ty: PropertyType, mmu_configured: bool) -> KgslResult<Property> {
        Ok(match ty {
            PropertyType::DeviceInfo => {
                let (gmem_gpubase, gmem_sizebytes) = match self.id {
                    DeviceId::Yamato => (YAMATO_GMEM_BASE, YAMATO_GMEM_SIZE),
                    DeviceId::G12 => (0, 0),
                };
                Property::DeviceInfo(DeviceInfo {
                    device_id: self.id as u32,
                    chip_id: self.chip_id,
                    mmu_enabled: u32::from(mmu_configured),
                    gmem_gpubase,
                    gmem_sizebytes,
                })
            }
            PropertyType::DeviceShadow => {
                let memstore = self
                    .memstore
                    .ok_or_else(|| KgslError::not_initialized("device has no memstore"))?;
                Property::DeviceShadow(DeviceShadow {
                    hostptr: memstore.hostptr,
                    gpuaddr: memstore.gpuaddr,
                    size: memstore.size,
                })
            }
            PropertyType::DevicePower => Property::DevicePower(self.power),
            PropertyType::MmuEnable => Property::MmuEnable(if self.is_started() {
                self.mmu.enabled()
            } else {
                mmu_configured
            }),
            PropertyType::InterruptWaits => Property::InterruptWaits(true),
        })
    }

    /// Only the power state is writable.
    pub fn setproperty(&mut self, prop: Property) -> KgslResult<()> {
        match prop {
            Property::DevicePower(flags) => {
                if flags.contains(PowerFlags::OVERRIDE_ON | PowerFlags::OVERRIDE_OFF) {
                    return Err(KgslError::bad_param("conflicting power overrides"));
                }
                log::debug!("device[{}]: power {:?} -> {flags:?}", self.id.name(), self.power);
                self.power = flags;
                Ok(())
            }
            other => Err(KgslError::NotSupported(format!(
                "property {:?} is read-only",
                other.kind()
            ))),
        }
    }

    fn check_reg(offsetwords: u32) -> KgslResult<()> {
        if (offsetwords as usize) < REG_COUNT {
            Ok(())
        } else {
            Err(KgslError::bad_param(format!(
                "register offset 0x{offsetwords:x} out of range"
            )))
        }
    }

    pub fn regread(&self, offsetwords: u32) -> KgslResult<u32> {
        Self::check_reg(offsetwords)?;
        Ok(self.hw.regs.read(offsetwords))
    }

    pub fn regwrite(&self, offsetwords: u32, value: u32) -> KgslResult<()> {
        Self::check_reg(offsetwords)?;
        self.hw.regs.write(offsetwords, value);
        Ok(())
    }

    // ===========================================================================================
    // Processes
    // ===========================================================================================

    /// Drops everything `pid` holds on this device: its draw contexts, its
    /// queued frees and its MMU attachment. The device is idled first so the
    /// GPU no longer references any of it.
    pub(crate) fn release_process(&mut self, env: &mut GslEnv<'_>, pid: Pid) {
        if self.is_started() {
            if let Err(e) = self.idle(env.config.idle_spin_limit, None) {
                log::error!(
                    "device[{}]: releasing pid {pid} on a busy core: {e}",
                    self.id.name()
                );
            }
        }

        let timestamp = self.ops.current_timestamp(self);
        for id in self.drawctxt.owned_by(pid) {
            if let Err(e) = self.drawctxt.destroy(id, &mut self.memqueue, timestamp) {
                log::warn!(
                    "device[{}]: context {id} of pid {pid} not destroyed: {e}",
                    self.id.name()
                );
            }
        }
        self.shared.set_active_context(self.drawctxt.active());

        let mut released = 0;
        for entry in self.memqueue.take_for(pid) {
            if let Err(e) = env.free(&entry.desc) {
                log::warn!("device[{}]: queued free at exit: {e}", self.id.name());
            }
            released += 1;
        }
        self.mmu.detach(pid, env.sharedmem, env.pagetables);
        log::debug!(
            "device[{}]: released pid {pid}, {released} queued block(s)",
            self.id.name()
        );
    }

    // ===========================================================================================
    // Faults
    // ===========================================================================================

    /// Moves faults taken by the interrupt handler into the MMU log and
    /// marks the context that was running as faulted.
    pub(crate) fn process_faults(&mut self) {
        for fault in self.shared.take_faults() {
            self.mmu.record_fault(fault);
            if let Some(ctx) = fault.context {
                self.drawctxt.mark_faulted(ctx);
            }
        }
    }

    /// Rejects submissions against a faulted context.
    pub(crate) fn check_context(&self, pid: Pid, context: Option<u32>) -> KgslResult<()> {
        let Some(id) = context else {
            return Ok(());
        };
        let ctx = self
            .drawctxt
            .get(id)
            .filter(|c| c.pid == pid)
            .ok_or_else(|| KgslError::bad_param(format!("no draw context {id} for pid {pid}")))?;
        if ctx.flags.contains(DrawCtxtFlags::FAULTED) {
            return Err(KgslError::Device(format!(
                "draw context {id} took an MMU fault"
            )));
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.hw.irq.disconnect();
    }
}
