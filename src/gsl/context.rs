//! The driver instance and its process registry.
//!
//! A [`DriverContext`] owns every piece of driver state behind one lock.
//! Processes attach with [`DriverContext::entry`] and detach with
//! [`DriverContext::exit`]; the first attach brings up the arena and the
//! cores, the last detach closes them again. Every other operation names the
//! calling process and is rejected for processes that have not attached.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{CALLER_PROCESS_MAX, KgslConfig};
use crate::error::{KgslError, KgslResult};
use crate::gsl::device::{Device, DeviceFlags, DeviceShared, Property, PropertyType, TimestampType};
use crate::gsl::drawctxt::{ContextType, DrawCtxtFlags, GmemRect};
use crate::gsl::memory::{CacheOp, MemDesc, MemFlags, ScatterList, SharedMem};
use crate::gsl::mmu::PageTableSet;
use crate::gsl::ringbuffer::CmdFlags;
use crate::gsl::{GslEnv, Pid};
use crate::hw::{DEVICE_MAX, DeviceId, Platform};

/// An attached process. A process may attach several times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    pub refcnt: u32,
}

#[derive(Debug)]
struct DriverState {
    sharedmem: Option<SharedMem>,
    pagetables: PageTableSet,
    devices: [Option<Device>; DEVICE_MAX],
    processes: Vec<ProcessEntry>,
}

impl DriverState {
    fn require_process(&self, pid: Pid) -> KgslResult<()> {
        if self.processes.iter().any(|p| p.pid == pid) {
            Ok(())
        } else {
            Err(KgslError::bad_param(format!("pid {pid} has not opened the driver")))
        }
    }

    /// Splits out one device and the environment it operates in.
    fn device_env<'a>(
        &'a mut self,
        config: &'a KgslConfig,
        id: DeviceId,
    ) -> KgslResult<(&'a mut Device, GslEnv<'a>)> {
        let sharedmem = self
            .sharedmem
            .as_mut()
            .ok_or_else(|| KgslError::not_initialized("driver is not initialized"))?;
        let dev = self.devices[id.index()]
            .as_mut()
            .ok_or_else(|| KgslError::NotSupported(format!("{} is not present", id.name())))?;
        let env = GslEnv {
            sharedmem,
            pagetables: &mut self.pagetables,
            config,
        };
        Ok((dev, env))
    }

    fn arena(&mut self) -> KgslResult<(&mut SharedMem, &mut PageTableSet)> {
        let sharedmem = self
            .sharedmem
            .as_mut()
            .ok_or_else(|| KgslError::not_initialized("driver is not initialized"))?;
        Ok((sharedmem, &mut self.pagetables))
    }

    fn is_queued(&self, desc: &MemDesc) -> bool {
        self.devices
            .iter()
            .flatten()
            .any(|dev| dev.memqueue.iter().any(|e| e.desc == *desc))
    }
}

/// One driver instance: configuration, the simulated SoC and the state
/// guarded by the driver lock.
#[derive(Debug)]
pub struct DriverContext {
    config: KgslConfig,
    platform: Platform,
    state: Mutex<DriverState>,
}

impl DriverContext {
    /// Creates an idle driver. Nothing is allocated until the first process attaches.
    ///
    /// # Errors
    /// Returns [`KgslError::BadParam`] if `config` is inconsistent.
    pub fn new(config: KgslConfig, platform: Platform) -> KgslResult<Self> {
        config.validate().map_err(KgslError::BadParam)?;
        let pagetables = PageTableSet::new(platform.physmem.clone(), &config);
        Ok(Self {
            config,
            platform,
            state: Mutex::new(DriverState {
                sharedmem: None,
                pagetables,
                devices: [None, None],
                processes: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &KgslConfig {
        &self.config
    }

    #[must_use]
    pub const fn platform(&self) -> &Platform {
        &self.platform
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().sharedmem.is_some()
    }

    #[must_use]
    pub fn process_count(&self) -> usize {
        self.state.lock().processes.len()
    }

    #[must_use]
    pub fn processes(&self) -> Vec<ProcessEntry> {
        self.state.lock().processes.clone()
    }

    /// Runs `f` on a device under the driver lock.
    ///
    /// # Errors
    /// Fails if the driver is not initialized or the core is absent.
    pub fn with_device<R>(&self, id: DeviceId, f: impl FnOnce(&Device) -> R) -> KgslResult<R> {
        let mut st = self.state.lock();
        let (dev, _) = st.device_env(&self.config, id)?;
        Ok(f(dev))
    }

    /// Runs `f` on the arena under the driver lock.
    ///
    /// # Errors
    /// Fails if the driver is not initialized.
    pub fn with_sharedmem<R>(&self, f: impl FnOnce(&SharedMem) -> R) -> KgslResult<R> {
        let mut st = self.state.lock();
        let (sharedmem, _) = st.arena()?;
        Ok(f(sharedmem))
    }

    fn with_device_mut<R>(
        &self,
        pid: Pid,
        id: DeviceId,
        f: impl FnOnce(&mut Device, &mut GslEnv<'_>) -> KgslResult<R>,
    ) -> KgslResult<R> {
        let mut st = self.state.lock();
        st.require_process(pid)?;
        let (dev, mut env) = st.device_env(&self.config, id)?;
        f(dev, &mut env)
    }

    fn with_arena<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut SharedMem, &mut PageTableSet) -> KgslResult<R>,
    ) -> KgslResult<R> {
        let mut st = self.state.lock();
        st.require_process(pid)?;
        let (sharedmem, pagetables) = st.arena()?;
        f(sharedmem, pagetables)
    }

    /// Lock-free half of a started device, for waits.
    fn started_shared(&self, pid: Pid, id: DeviceId) -> KgslResult<Arc<DeviceShared>> {
        self.with_device_mut(pid, id, |dev, _| {
            dev.require_started()?;
            Ok(dev.shared().clone())
        })
    }

    /// Core the registry's page-table references are charged to.
    fn pagetable_device(&self) -> DeviceId {
        DeviceId::ALL
            .into_iter()
            .find(|&id| self.platform.core(id).is_some())
            .unwrap_or(DeviceId::Yamato)
    }

    // ===========================================================================================
    // Process registry
    // ===========================================================================================

    /// Attaches `pid`. The first attach across all processes initializes the
    /// arena and every core present on the platform.
    ///
    /// # Errors
    /// [`KgslError::Failure`] when the process table is full, or whatever
    /// initialization reports.
    pub fn entry(&self, pid: Pid) -> KgslResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        if let Some(p) = st.processes.iter_mut().find(|p| p.pid == pid) {
            p.refcnt += 1;
            return Ok(());
        }
        if st.processes.len() >= CALLER_PROCESS_MAX {
            log::warn!("driver: process table full, rejecting pid {pid}");
            return Err(KgslError::failure(format!(
                "process table full ({CALLER_PROCESS_MAX} entries)"
            )));
        }

        let first = st.processes.is_empty();
        if first {
            self.init_locked(st)?;
        }

        let owner = st.pagetables.owner_for(pid);
        let attached = match st.sharedmem.as_mut() {
            Some(sharedmem) => st
                .pagetables
                .attach(sharedmem, owner, self.pagetable_device()),
            None => Err(KgslError::not_initialized("driver is not initialized")),
        };
        if let Err(e) = attached {
            if first {
                self.teardown_locked(st);
            }
            return Err(e);
        }

        st.processes.push(ProcessEntry { pid, refcnt: 1 });
        log::info!("driver: pid {pid} attached, {} process(es)", st.processes.len());
        Ok(())
    }

    /// Detaches `pid`. The last detach of a process releases everything it
    /// still holds; the last process to leave closes the driver.
    ///
    /// # Errors
    /// [`KgslError::BadParam`] if `pid` is not attached.
    pub fn exit(&self, pid: Pid) -> KgslResult<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;

        let pos = st
            .processes
            .iter()
            .position(|p| p.pid == pid)
            .ok_or_else(|| KgslError::bad_param(format!("pid {pid} is not attached")))?;
        st.processes[pos].refcnt -= 1;
        if st.processes[pos].refcnt > 0 {
            return Ok(());
        }
        st.processes.remove(pos);

        self.release_locked(st, pid);
        log::info!("driver: pid {pid} detached, {} process(es)", st.processes.len());
        if st.processes.is_empty() {
            self.teardown_locked(st);
        }
        Ok(())
    }

    fn init_locked(&self, st: &mut DriverState) -> KgslResult<()> {
        let physmem = self.platform.physmem.clone();
        let mut sharedmem = SharedMem::new(physmem.clone(), &self.config)?;
        st.pagetables = PageTableSet::new(physmem.clone(), &self.config);

        for id in DeviceId::ALL {
            let Some(hw) = self.platform.core(id) else {
                log::debug!("driver: no {} core on this platform", id.name());
                continue;
            };
            let mut env = GslEnv {
                sharedmem: &mut sharedmem,
                pagetables: &mut st.pagetables,
                config: &self.config,
            };
            let mut dev = Device::new(id, hw.clone(), physmem.clone());
            if let Err(e) = dev.init(&mut env) {
                log::error!("driver: {} failed to initialize: {e}", id.name());
                for mut dev in st.devices.iter_mut().filter_map(Option::take) {
                    if let Err(e) = dev.close(&mut env) {
                        log::warn!("driver: {} close after failed init: {e}", dev.id.name());
                    }
                }
                sharedmem.close(&mut st.pagetables);
                return Err(e);
            }
            st.devices[id.index()] = Some(dev);
        }

        st.sharedmem = Some(sharedmem);
        log::info!("driver: initialized");
        Ok(())
    }

    fn release_locked(&self, st: &mut DriverState, pid: Pid) {
        let Some(sharedmem) = st.sharedmem.as_mut() else {
            return;
        };
        let mut env = GslEnv {
            sharedmem,
            pagetables: &mut st.pagetables,
            config: &self.config,
        };
        for dev in st.devices.iter_mut().flatten() {
            dev.release_process(&mut env, pid);
        }

        let leaked = env.sharedmem.free_all_for(env.pagetables, pid);
        if leaked > 0 {
            log::warn!("driver: freed {leaked} block(s) left behind by pid {pid}");
        }
        let owner = env.pagetables.owner_for(pid);
        env.pagetables.detach(env.sharedmem, owner);
    }

    fn teardown_locked(&self, st: &mut DriverState) {
        if let Some(mut sharedmem) = st.sharedmem.take() {
            let mut env = GslEnv {
                sharedmem: &mut sharedmem,
                pagetables: &mut st.pagetables,
                config: &self.config,
            };
            for mut dev in st.devices.iter_mut().filter_map(Option::take) {
                dev.force_stop(&mut env);
                if let Err(e) = dev.close(&mut env) {
                    log::error!("driver: closing {}: {e}", dev.id.name());
                }
            }
            sharedmem.close(&mut st.pagetables);
        }
        st.pagetables = PageTableSet::new(self.platform.physmem.clone(), &self.config);
        log::info!("driver: closed");
    }

    // ===========================================================================================
    // Devices
    // ===========================================================================================

    /// Takes a start reference on a core.
    ///
    /// # Errors
    /// [`KgslError::NotSupported`] for a core the platform lacks, or whatever
    /// the hardware start reports.
    pub fn device_start(&self, pid: Pid, id: DeviceId, flags: DeviceFlags) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, env| dev.start(env, flags))
    }

    /// Drops a start reference on a core.
    ///
    /// # Errors
    /// [`KgslError::Failure`] if the core holds no start reference.
    pub fn device_stop(&self, pid: Pid, id: DeviceId) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, env| dev.stop(env))
    }

    /// Waits for the core to drain everything submitted. A zero `timeout`
    /// is bounded by the configured spin limit alone.
    ///
    /// # Errors
    /// [`KgslError::Timeout`] if the core does not go idle.
    pub fn device_idle(&self, pid: Pid, id: DeviceId, timeout: Duration) -> KgslResult<()> {
        let spin_limit = self.config.idle_spin_limit;
        let timeout = (!timeout.is_zero()).then_some(timeout);
        self.with_device_mut(pid, id, |dev, _| dev.idle(spin_limit, timeout))
    }

    /// # Errors
    /// Fails for an absent core or a property that is not available.
    pub fn device_getproperty(&self, pid: Pid, id: DeviceId, ty: PropertyType) -> KgslResult<Property> {
        let mmu = self.config.mmu_enabled;
        self.with_device_mut(pid, id, |dev, _| dev.getproperty(ty, mmu))
    }

    /// # Errors
    /// [`KgslError::NotSupported`] for read-only properties.
    pub fn device_setproperty(&self, pid: Pid, id: DeviceId, prop: Property) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, _| dev.setproperty(prop))
    }

    /// # Errors
    /// [`KgslError::BadParam`] for an offset outside the register file.
    pub fn device_regread(&self, pid: Pid, id: DeviceId, offsetwords: u32) -> KgslResult<u32> {
        self.with_device_mut(pid, id, |dev, _| dev.regread(offsetwords))
    }

    /// # Errors
    /// [`KgslError::BadParam`] for an offset outside the register file.
    pub fn device_regwrite(&self, pid: Pid, id: DeviceId, offsetwords: u32, value: u32) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, _| dev.regwrite(offsetwords, value))
    }

    /// Blocks until the core takes another interrupt. Returns the new
    /// interrupt count. Runs without the driver lock.
    ///
    /// # Errors
    /// [`KgslError::Timeout`] or [`KgslError::Interrupted`].
    pub fn device_waitirq(&self, pid: Pid, id: DeviceId, timeout: Duration) -> KgslResult<u32> {
        let shared = self.started_shared(pid, id)?;
        let seen = shared.irq_count();
        shared.wait_irq(pid, seen, timeout, self.config.timestamp_poll_interval)
    }

    /// Makes every wait `pid` is blocked in return [`KgslError::Interrupted`].
    pub fn interrupt(&self, pid: Pid) {
        let shared: Vec<Arc<DeviceShared>> = self
            .state
            .lock()
            .devices
            .iter()
            .flatten()
            .map(|dev| dev.shared().clone())
            .collect();
        for s in shared {
            s.cancel(pid);
        }
    }

    // ===========================================================================================
    // Shared memory
    // ===========================================================================================

    /// # Errors
    /// [`KgslError::OutOfMemory`] or [`KgslError::Failure`] when no aperture
    /// can satisfy the request.
    pub fn sharedmem_alloc(&self, pid: Pid, id: DeviceId, flags: MemFlags, size: u32) -> KgslResult<MemDesc> {
        self.with_device_mut(pid, id, |_, env| env.alloc(id, pid, flags, size))
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a block that is not `pid`'s or is already
    /// queued for a deferred free.
    pub fn sharedmem_free(&self, pid: Pid, desc: &MemDesc) -> KgslResult<()> {
        let mut st = self.state.lock();
        st.require_process(pid)?;
        if st.is_queued(desc) {
            return Err(KgslError::bad_param("block is queued for a deferred free"));
        }
        let (sharedmem, pagetables) = st.arena()?;
        Self::check_owner(sharedmem, pid, desc)?;
        sharedmem.free(pagetables, desc)
    }

    fn check_owner(sharedmem: &SharedMem, pid: Pid, desc: &MemDesc) -> KgslResult<()> {
        let owner = sharedmem.owner_of(desc)?;
        if owner == pid {
            Ok(())
        } else {
            Err(KgslError::bad_param(format!(
                "block 0x{:08x} belongs to pid {owner}",
                desc.gpuaddr
            )))
        }
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block or an out-of-range access.
    pub fn sharedmem_read(&self, pid: Pid, desc: &MemDesc, offset: u32, dst: &mut [u8]) -> KgslResult<()> {
        self.with_arena(pid, |sharedmem, _| {
            Self::check_owner(sharedmem, pid, desc)?;
            sharedmem.read(desc, offset, dst)
        })
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block or an out-of-range access.
    pub fn sharedmem_write(&self, pid: Pid, desc: &MemDesc, offset: u32, src: &[u8]) -> KgslResult<()> {
        self.with_arena(pid, |sharedmem, _| {
            Self::check_owner(sharedmem, pid, desc)?;
            sharedmem.write(desc, offset, src)
        })
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block or an out-of-range access.
    pub fn sharedmem_set(&self, pid: Pid, desc: &MemDesc, offset: u32, value: u8, len: u32) -> KgslResult<()> {
        self.with_arena(pid, |sharedmem, _| {
            Self::check_owner(sharedmem, pid, desc)?;
            sharedmem.set(desc, offset, value, len)
        })
    }

    /// Maps caller-owned physical pages into the GPU address space.
    ///
    /// # Errors
    /// [`KgslError::BadParam`] for an empty or unaligned page list.
    pub fn sharedmem_map(
        &self,
        pid: Pid,
        id: DeviceId,
        flags: MemFlags,
        sg: &ScatterList,
    ) -> KgslResult<MemDesc> {
        self.with_device_mut(pid, id, |_, env| {
            env.sharedmem.map_external(env.pagetables, id, pid, flags, sg)
        })
    }

    /// Physical pages behind a block.
    ///
    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block.
    pub fn sharedmem_getmap(&self, pid: Pid, desc: &MemDesc) -> KgslResult<ScatterList> {
        self.with_arena(pid, |sharedmem, pagetables| {
            Self::check_owner(sharedmem, pid, desc)?;
            sharedmem.getmap(pagetables, desc)
        })
    }

    /// # Errors
    /// Fails if the driver is not initialized.
    pub fn sharedmem_largestfreeblock(&self, pid: Pid, flags: MemFlags) -> KgslResult<u32> {
        self.with_arena(pid, |sharedmem, _| Ok(sharedmem.largest_free_block(flags)))
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block.
    pub fn sharedmem_cacheoperation(&self, pid: Pid, desc: &MemDesc, op: CacheOp) -> KgslResult<()> {
        self.with_arena(pid, |sharedmem, _| {
            Self::check_owner(sharedmem, pid, desc)?;
            sharedmem.cache_operation(desc, op)
        })
    }

    // ===========================================================================================
    // Command stream
    // ===========================================================================================

    /// Submits an indirect buffer. Returns the timestamp that retires with it.
    ///
    /// # Errors
    /// [`KgslError::Failure`] on a stopped core, [`KgslError::Device`] for a
    /// context that has faulted, [`KgslError::Timeout`] if the ring stays full.
    pub fn cmdstream_issueibcmds(
        &self,
        pid: Pid,
        id: DeviceId,
        context: Option<u32>,
        ibaddr: u32,
        sizedwords: u32,
        flags: CmdFlags,
    ) -> KgslResult<u32> {
        self.with_device_mut(pid, id, |dev, env| {
            dev.issueibcmds(env, pid, context, ibaddr, sizedwords, flags)
        })
    }

    /// # Errors
    /// [`KgslError::Failure`] on a stopped core.
    pub fn add_timestamp(&self, pid: Pid, id: DeviceId) -> KgslResult<u32> {
        self.with_device_mut(pid, id, |dev, env| dev.addtimestamp(env, pid))
    }

    /// Reads a timestamp from the memstore. Reading the retired timestamp
    /// also releases deferred frees that have come due.
    ///
    /// # Errors
    /// [`KgslError::NotInitialized`] if the core has no memstore.
    pub fn cmdstream_readtimestamp(&self, pid: Pid, id: DeviceId, ty: TimestampType) -> KgslResult<u32> {
        self.with_device_mut(pid, id, |dev, env| {
            let ts = dev.readtimestamp(ty)?;
            if ty == TimestampType::Retired && dev.is_started() {
                dev.drain_memqueue(env);
            }
            Ok(ts)
        })
    }

    /// Blocks until `timestamp` retires. The driver lock is not held while waiting.
    ///
    /// # Errors
    /// [`KgslError::Timeout`], or [`KgslError::Interrupted`] after
    /// [`DriverContext::interrupt`].
    pub fn cmdstream_waittimestamp(
        &self,
        pid: Pid,
        id: DeviceId,
        timestamp: u32,
        timeout: Duration,
    ) -> KgslResult<()> {
        let shared = self.started_shared(pid, id)?;
        shared.wait_timestamp(pid, timestamp, timeout, self.config.timestamp_poll_interval)?;

        let mut st = self.state.lock();
        if let Ok((dev, mut env)) = st.device_env(&self.config, id) {
            if dev.is_started() {
                dev.drain_memqueue(&mut env);
            }
        }
        Ok(())
    }

    /// Frees `desc` once `timestamp` has retired.
    ///
    /// # Errors
    /// [`KgslError::BadParam`] for a foreign block or one already queued.
    pub fn cmdstream_freememontimestamp(
        &self,
        pid: Pid,
        id: DeviceId,
        desc: MemDesc,
        timestamp: u32,
    ) -> KgslResult<()> {
        let mut st = self.state.lock();
        st.require_process(pid)?;
        if st.is_queued(&desc) {
            return Err(KgslError::bad_param("block is already queued for freeing"));
        }
        let (dev, mut env) = st.device_env(&self.config, id)?;
        dev.freememontimestamp(&mut env, pid, desc, timestamp)
    }

    /// # Errors
    /// [`KgslError::NotSupported`] on the 3D core.
    pub fn cmdwindow_write(&self, pid: Pid, id: DeviceId, target: u32, addr: u32, data: u32) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, _| dev.cmdwindow_write(target, addr, data))
    }

    // ===========================================================================================
    // Draw contexts
    // ===========================================================================================

    /// # Errors
    /// [`KgslError::OutOfMemory`] when every slot is taken.
    pub fn context_create(
        &self,
        pid: Pid,
        id: DeviceId,
        ctx_type: ContextType,
        flags: DrawCtxtFlags,
    ) -> KgslResult<u32> {
        self.with_device_mut(pid, id, |dev, env| dev.context_create(env, pid, ctx_type, flags))
    }

    /// # Errors
    /// [`KgslError::BadParam`] for a context `pid` does not own.
    pub fn context_destroy(&self, pid: Pid, id: DeviceId, context: u32) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, _| dev.context_destroy(pid, context))
    }

    /// Binds a client GMEM shadow to a context; a zero `shadow` unbinds it.
    ///
    /// # Errors
    /// [`KgslError::BadParam`] for a foreign context or shadow, or a shadow
    /// too small for `rect`.
    pub fn context_bind_gmem_shadow(
        &self,
        pid: Pid,
        id: DeviceId,
        context: u32,
        rect: GmemRect,
        shadow: MemDesc,
    ) -> KgslResult<()> {
        self.with_device_mut(pid, id, |dev, env| {
            dev.context_bind_gmem_shadow(env, pid, context, rect, shadow)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_VA_BASE;
    use crate::gsl::device::PowerFlags;
    use crate::hw::pm4::nop_packet;
    use std::sync::Barrier;
    use std::thread;

    fn config() -> KgslConfig {
        KgslConfig::new()
            .with_memory(1024 * 1024, 4 * 1024 * 1024)
            .with_va_range(DEFAULT_VA_BASE, 4 * 1024 * 1024)
            .with_ringbuffer_sizedwords(1024)
            .with_timestamp_poll_interval(Duration::from_millis(1))
    }

    fn driver() -> Arc<DriverContext> {
        let cfg = config();
        Arc::new(DriverContext::new(cfg, Platform::imx51(&cfg)).unwrap())
    }

    /// A block of NOPs usable as an indirect buffer.
    fn nop_ib(drv: &DriverContext, pid: Pid) -> MemDesc {
        let desc = drv
            .sharedmem_alloc(pid, DeviceId::Yamato, MemFlags::empty(), 256)
            .unwrap();
        let words = desc.size / 4;
        let mut bytes = vec![0u8; desc.size as usize];
        bytes[..4].copy_from_slice(&nop_packet(words - 1).to_le_bytes());
        drv.sharedmem_write(pid, &desc, 0, &bytes).unwrap();
        desc
    }

    fn submit(drv: &DriverContext, pid: Pid, ib: &MemDesc, ctx: Option<u32>) -> KgslResult<u32> {
        drv.cmdstream_issueibcmds(pid, DeviceId::Yamato, ctx, ib.gpuaddr, ib.size / 4, CmdFlags::empty())
    }

    #[test]
    fn test_first_entry_initializes_and_last_exit_closes() {
        let drv = driver();
        assert!(!drv.is_initialized());
        assert!(drv.sharedmem_alloc(1, DeviceId::Yamato, MemFlags::empty(), 64).is_err());

        drv.entry(1).unwrap();
        drv.entry(2).unwrap();
        assert!(drv.is_initialized());

        let desc = drv
            .sharedmem_alloc(2, DeviceId::Yamato, MemFlags::empty(), 8192)
            .unwrap();
        let before = drv.with_sharedmem(SharedMem::block_count).unwrap();
        drv.exit(2).unwrap();
        assert_eq!(drv.with_sharedmem(SharedMem::block_count).unwrap(), before - 1);
        assert!(drv.sharedmem_free(1, &desc).is_err());

        drv.exit(1).unwrap();
        assert!(!drv.is_initialized());
        assert_eq!(drv.process_count(), 0);
        assert!(drv.exit(1).is_err());

        // The driver comes back up for the next process.
        drv.entry(3).unwrap();
        assert!(drv.with_device(DeviceId::G12, |d| d.chip_id != 0).unwrap());
        drv.exit(3).unwrap();
    }

    #[test]
    fn test_process_table_is_bounded() {
        let drv = driver();
        for pid in 0..CALLER_PROCESS_MAX as Pid {
            drv.entry(1000 + pid).unwrap();
        }
        let err = drv.entry(5000).unwrap_err();
        assert!(matches!(err, KgslError::Failure(_)));

        // Re-entry of an attached process only bumps its count.
        drv.entry(1000).unwrap();
        assert_eq!(drv.processes()[0].refcnt, 2);
        drv.exit(1000).unwrap();
        drv.exit(1001).unwrap();
        drv.entry(5000).unwrap();
        assert_eq!(drv.process_count(), CALLER_PROCESS_MAX);
    }

    #[test]
    fn test_unattached_process_is_rejected() {
        let drv = driver();
        drv.entry(1).unwrap();
        let err = drv.device_start(2, DeviceId::G12, DeviceFlags::empty()).unwrap_err();
        assert!(matches!(err, KgslError::BadParam(_)));
        drv.exit(1).unwrap();
    }

    #[test]
    fn test_absent_core_is_not_supported() {
        let cfg = config();
        let platform = Platform::with_cores(&cfg, &[DeviceId::Yamato]);
        let drv = DriverContext::new(cfg, platform).unwrap();
        drv.entry(1).unwrap();
        let err = drv.device_start(1, DeviceId::G12, DeviceFlags::empty()).unwrap_err();
        assert!(matches!(err, KgslError::NotSupported(_)));
        assert!(drv.with_device(DeviceId::G12, |_| ()).is_err());
        drv.exit(1).unwrap();
    }

    #[test]
    fn test_rejects_bad_config() {
        let cfg = config().with_ringbuffer_sizedwords(1000);
        let err = DriverContext::new(cfg, Platform::imx51(&cfg)).unwrap_err();
        assert!(matches!(err, KgslError::BadParam(_)));
    }

    #[test]
    fn test_second_stop_tears_down() {
        let drv = driver();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        let _run = sim.spawn(Duration::from_micros(200));
        drv.entry(1).unwrap();
        drv.entry(2).unwrap();

        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        drv.device_start(2, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        drv.device_stop(1, DeviceId::Yamato).unwrap();
        let state = |d: &Device| (d.is_started(), d.refcnt, d.stats.hw_stops);
        assert_eq!(drv.with_device(DeviceId::Yamato, state).unwrap(), (true, 1, 0));

        drv.device_stop(2, DeviceId::Yamato).unwrap();
        assert_eq!(drv.with_device(DeviceId::Yamato, state).unwrap(), (false, 0, 1));
        assert!(drv.device_stop(2, DeviceId::Yamato).is_err());

        drv.exit(1).unwrap();
        drv.exit(2).unwrap();
    }

    #[test]
    fn test_concurrent_start_stop_runs_hardware_once() {
        let drv = driver();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        let _run = sim.spawn(Duration::from_micros(200));

        let pids: Vec<Pid> = (10..18).collect();
        for &pid in &pids {
            drv.entry(pid).unwrap();
        }
        let barrier = Arc::new(Barrier::new(pids.len()));
        let handles: Vec<_> = pids
            .iter()
            .map(|&pid| {
                let drv = drv.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    drv.device_start(pid, DeviceId::Yamato, DeviceFlags::empty())
                        .unwrap();
                    barrier.wait();
                    drv.device_stop(pid, DeviceId::Yamato).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let (started, refcnt, stats) = drv
            .with_device(DeviceId::Yamato, |d| (d.is_started(), d.refcnt, d.stats))
            .unwrap();
        assert!(!started);
        assert_eq!(refcnt, 0);
        assert_eq!(stats.hw_starts, 1);
        assert_eq!(stats.hw_stops, 1);
    }

    #[test]
    fn test_timestamps_increase_across_processes() {
        let drv = driver();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        let _run = sim.spawn(Duration::from_micros(100));
        drv.entry(1).unwrap();
        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();

        let handles: Vec<_> = [20, 21]
            .into_iter()
            .map(|pid| {
                let drv = drv.clone();
                thread::spawn(move || {
                    drv.entry(pid).unwrap();
                    let ib = nop_ib(&drv, pid);
                    (0..50)
                        .map(|_| submit(&drv, pid, &ib, None).unwrap())
                        .collect::<Vec<u32>>()
                })
            })
            .collect();
        let per_thread: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for seq in &per_thread {
            assert!(seq.windows(2).all(|w| w[0] < w[1]));
        }
        let mut all: Vec<u32> = per_thread.concat();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 100);

        let last = *all.last().unwrap();
        drv.cmdstream_waittimestamp(20, DeviceId::Yamato, last, Duration::from_secs(10))
            .unwrap();
        let retired = drv
            .cmdstream_readtimestamp(20, DeviceId::Yamato, TimestampType::Retired)
            .unwrap();
        let current = drv
            .with_device(DeviceId::Yamato, Device::current_timestamp)
            .unwrap();
        assert_eq!(retired, current);
    }

    #[test]
    fn test_idle_gives_up_after_spin_limit() {
        let cfg = config().with_spin_limits(u32::MAX, 1000);
        let drv = DriverContext::new(cfg, Platform::imx51(&cfg)).unwrap();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        drv.entry(1).unwrap();
        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        let ib = nop_ib(&drv, 1);
        sim.set_stalled(true);
        submit(&drv, 1, &ib, None).unwrap();

        let err = drv.device_idle(1, DeviceId::Yamato, Duration::ZERO).unwrap_err();
        assert!(matches!(err, KgslError::Timeout), "{err:?}");
        let state = |d: &Device| (d.flags.contains(DeviceFlags::IDLE_TIMEOUT), d.stats.idle_timeouts);
        assert_eq!(drv.with_device(DeviceId::Yamato, state).unwrap(), (true, 1));

        sim.set_stalled(false);
        sim.run_until_idle();
        drv.device_idle(1, DeviceId::Yamato, Duration::ZERO).unwrap();
        assert_eq!(drv.with_device(DeviceId::Yamato, state).unwrap(), (false, 1));
        drv.exit(1).unwrap();
    }

    #[test]
    fn test_exit_on_a_busy_core_still_tears_down() {
        let cfg = config().with_spin_limits(u32::MAX, 1000);
        let drv = DriverContext::new(cfg, Platform::imx51(&cfg)).unwrap();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        sim.set_stalled(true);
        drv.entry(1).unwrap();
        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        let ctx = drv
            .context_create(1, DeviceId::Yamato, ContextType::OpenGl, DrawCtxtFlags::empty())
            .unwrap();
        let ib = nop_ib(&drv, 1);
        submit(&drv, 1, &ib, Some(ctx)).unwrap();

        // Neither the release idle nor the forced stop can drain the ring.
        drv.exit(1).unwrap();
        assert!(!drv.is_initialized());
        assert_eq!(drv.process_count(), 0);

        sim.set_stalled(false);
        drv.entry(2).unwrap();
        drv.device_start(2, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        sim.run_until_idle();
        drv.device_idle(2, DeviceId::Yamato, Duration::ZERO).unwrap();
        drv.exit(2).unwrap();
    }

    #[test]
    fn test_interrupt_cancels_wait() {
        let drv = driver();
        drv.entry(1).unwrap();
        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();
        let ib = nop_ib(&drv, 1);
        // No simulator: nothing ever retires.
        let ts = submit(&drv, 1, &ib, None).unwrap();

        let waiter = {
            let drv = drv.clone();
            thread::spawn(move || {
                drv.cmdstream_waittimestamp(1, DeviceId::Yamato, ts, Duration::from_secs(30))
            })
        };
        while !waiter.is_finished() {
            drv.interrupt(1);
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(waiter.join().unwrap(), Err(KgslError::Interrupted)));

        let err = drv
            .cmdstream_waittimestamp(1, DeviceId::Yamato, ts, Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, KgslError::Timeout));
    }

    #[test]
    fn test_retired_read_releases_deferred_frees() {
        let drv = driver();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        drv.entry(1).unwrap();
        drv.device_start(1, DeviceId::Yamato, DeviceFlags::empty()).unwrap();

        let ib = nop_ib(&drv, 1);
        let ts = submit(&drv, 1, &ib, None).unwrap();
        let victim = drv
            .sharedmem_alloc(1, DeviceId::Yamato, MemFlags::empty(), 4096)
            .unwrap();
        drv.cmdstream_freememontimestamp(1, DeviceId::Yamato, victim, ts)
            .unwrap();
        assert!(drv.sharedmem_free(1, &victim).is_err());
        assert!(drv
            .cmdstream_freememontimestamp(1, DeviceId::Yamato, victim, ts)
            .is_err());

        let before = drv.with_sharedmem(SharedMem::block_count).unwrap();
        sim.run_until_idle();
        let retired = drv
            .cmdstream_readtimestamp(1, DeviceId::Yamato, TimestampType::Retired)
            .unwrap();
        assert_eq!(retired, ts);
        assert_eq!(drv.with_sharedmem(SharedMem::block_count).unwrap(), before - 1);
    }

    #[test]
    fn test_exit_releases_contexts_on_a_shared_device() {
        let drv = driver();
        let sim = drv.platform().simulator(DeviceId::Yamato).unwrap();
        let _run = sim.spawn(Duration::from_micros(200));
        drv.entry(1).unwrap();
        drv.entry(2).unwrap();
        drv.device_start(2, DeviceId::Yamato, DeviceFlags::empty()).unwrap();

        let ctx = drv
            .context_create(1, DeviceId::Yamato, ContextType::OpenGl, DrawCtxtFlags::empty())
            .unwrap();
        let ib = nop_ib(&drv, 1);
        submit(&drv, 1, &ib, Some(ctx)).unwrap();
        assert!(drv.context_destroy(2, DeviceId::Yamato, ctx).is_err());

        let before = drv.with_sharedmem(SharedMem::block_count).unwrap();
        drv.exit(1).unwrap();
        // The ib, the state block and the GMEM shadow.
        assert_eq!(drv.with_sharedmem(SharedMem::block_count).unwrap(), before - 3);
        let (contexts, started) = drv
            .with_device(DeviceId::Yamato, |d| (d.drawctxt.count(), d.is_started()))
            .unwrap();
        assert_eq!(contexts, 0);
        assert!(started);
        drv.exit(2).unwrap();
    }

    #[test]
    fn test_properties_and_registers() {
        let drv = driver();
        drv.entry(1).unwrap();
        let Property::DeviceInfo(info) = drv
            .device_getproperty(1, DeviceId::Yamato, PropertyType::DeviceInfo)
            .unwrap()
        else {
            panic!("wrong property kind");
        };
        assert_eq!(info.device_id, DeviceId::Yamato as u32);
        assert_eq!(info.mmu_enabled, 1);

        let power = Property::DevicePower(PowerFlags::POWER_ON | PowerFlags::OVERRIDE_ON);
        drv.device_setproperty(1, DeviceId::G12, power).unwrap();
        assert!(drv
            .device_setproperty(1, DeviceId::G12, Property::MmuEnable(false))
            .is_err());

        drv.device_regwrite(1, DeviceId::G12, 0x10, 0xabcd).unwrap();
        assert_eq!(drv.device_regread(1, DeviceId::G12, 0x10).unwrap(), 0xabcd);
        assert!(drv.device_regread(1, DeviceId::G12, 0x1_0000).is_err());
        drv.exit(1).unwrap();
    }
}
