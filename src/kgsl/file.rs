use std::ffi::c_void;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{KgslError, KgslResult, to_status};
use crate::gsl::context::DriverContext;
use crate::gsl::device::{
    DeviceFlags, DeviceInfo, DeviceShadow, PowerFlags, Property, PropertyType, TimestampType,
};
use crate::gsl::drawctxt::{ContextType, DrawCtxtFlags, GmemRect};
use crate::gsl::memory::{CacheOp, MemDesc, MemFlags, ScatterList};
use crate::gsl::ringbuffer::CmdFlags;
use crate::gsl::{Pid, current_pid};
use crate::hw::{DEVICE_MAX, DeviceId};
use crate::kgsl::ioctl::{
    AddTimestampArgs, BindGmemShadowArgs, CmdWindowWriteArgs, ContextCreateArgs,
    ContextDestroyArgs, DeviceIdleArgs, DevicePropertyArgs, DeviceRegArgs, DeviceStartArgs,
    DeviceStopArgs, DeviceWaitIrqArgs, FreeMemOnTimestampArgs, IOCTL_KGSL_ADD_TIMESTAMP,
    IOCTL_KGSL_CMDSTREAM_FREEMEMONTIMESTAMP, IOCTL_KGSL_CMDSTREAM_ISSUEIBCMDS,
    IOCTL_KGSL_CMDSTREAM_READTIMESTAMP, IOCTL_KGSL_CMDSTREAM_WAITTIMESTAMP,
    IOCTL_KGSL_CMDWINDOW_WRITE, IOCTL_KGSL_CONTEXT_BIND_GMEM_SHADOW, IOCTL_KGSL_CONTEXT_CREATE,
    IOCTL_KGSL_CONTEXT_DESTROY, IOCTL_KGSL_DEVICE_GETPROPERTY, IOCTL_KGSL_DEVICE_IDLE,
    IOCTL_KGSL_DEVICE_REGREAD, IOCTL_KGSL_DEVICE_REGWRITE, IOCTL_KGSL_DEVICE_SETPROPERTY,
    IOCTL_KGSL_DEVICE_START, IOCTL_KGSL_DEVICE_STOP, IOCTL_KGSL_DEVICE_WAITIRQ,
    IOCTL_KGSL_SHAREDMEM_ALLOC, IOCTL_KGSL_SHAREDMEM_CACHEOPERATION, IOCTL_KGSL_SHAREDMEM_FREE,
    IOCTL_KGSL_SHAREDMEM_LARGESTFREEBLOCK, IOCTL_KGSL_SHAREDMEM_MAP, IOCTL_KGSL_SHAREDMEM_READ,
    IOCTL_KGSL_SHAREDMEM_SET, IOCTL_KGSL_SHAREDMEM_WRITE, IssueIbCmdsArgs, KGSL_CONTEXT_NONE,
    ReadTimestampArgs, SharedMemAccessArgs, SharedMemAllocArgs, SharedMemCacheOperationArgs,
    SharedMemFreeArgs, SharedMemLargestFreeBlockArgs, SharedMemMapArgs, SharedMemSetArgs,
    WaitTimestampArgs,
};

/// One open of the driver.
///
/// Opening attaches the process to the driver; dropping the handle releases
/// every block, draw context and start reference made through it and then
/// detaches. Several handles may be open for the same process.
#[derive(Debug)]
pub struct KgslFile {
    driver: Arc<DriverContext>,
    pid: Pid,
    memdescs: Vec<MemDesc>,
    contexts: Vec<(DeviceId, u32)>,
    starts: [u32; DEVICE_MAX],
}

fn device(raw: u32) -> KgslResult<DeviceId> {
    DeviceId::from_raw(raw).ok_or_else(|| KgslError::bad_param(format!("invalid device id {raw}")))
}

fn millis(ms: u32) -> Duration {
    Duration::from_millis(u64::from(ms))
}

/// Reinterprets a raw ioctl argument.
///
/// # Safety
/// `arg` must be null or point to a valid, aligned `T` not aliased elsewhere.
unsafe fn args<'a, T>(arg: *mut c_void) -> KgslResult<&'a mut T> {
    // SAFETY: guaranteed by the caller.
    unsafe { arg.cast::<T>().as_mut() }.ok_or_else(|| KgslError::bad_param("null ioctl argument"))
}

/// Copies `value` into a caller buffer of exactly its size.
///
/// # Safety
/// `ptr` must be null or valid for writes of `size` bytes.
unsafe fn put<T: Copy>(ptr: u64, size: u32, value: T) -> KgslResult<()> {
    if ptr == 0 || size as usize != size_of::<T>() {
        return Err(KgslError::bad_param(format!(
            "property buffer of {size} bytes, expected {}",
            size_of::<T>()
        )));
    }
    // SAFETY: non-null and sized for T; guaranteed valid by the caller.
    unsafe { std::ptr::write_unaligned(ptr as *mut T, value) };
    Ok(())
}

/// Copies a `T` out of a caller buffer of exactly its size.
///
/// # Safety
/// `ptr` must be null or valid for reads of `size` bytes.
unsafe fn get<T: Copy>(ptr: u64, size: u32) -> KgslResult<T> {
    if ptr == 0 || size as usize != size_of::<T>() {
        return Err(KgslError::bad_param(format!(
            "property buffer of {size} bytes, expected {}",
            size_of::<T>()
        )));
    }
    // SAFETY: non-null and sized for T; guaranteed valid by the caller.
    Ok(unsafe { std::ptr::read_unaligned(ptr as *const T) })
}

impl KgslFile {
    /// Opens the driver on behalf of the calling process.
    ///
    /// # Errors
    /// Fails if the process table is full or driver initialization fails.
    pub fn open(driver: Arc<DriverContext>) -> KgslResult<Self> {
        Self::open_as(driver, current_pid())
    }

    /// Opens the driver on behalf of `pid`.
    ///
    /// # Errors
    /// Fails if the process table is full or driver initialization fails.
    pub fn open_as(driver: Arc<DriverContext>, pid: Pid) -> KgslResult<Self> {
        driver.entry(pid)?;
        Ok(Self {
            driver,
            pid,
            memdescs: Vec::new(),
            contexts: Vec::new(),
            starts: [0; DEVICE_MAX],
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<DriverContext> {
        &self.driver
    }

    /// Blocks allocated through this handle and not yet freed.
    #[must_use]
    pub fn memdescs(&self) -> &[MemDesc] {
        &self.memdescs
    }

    fn untrack(&mut self, desc: &MemDesc) {
        self.memdescs.retain(|d| d != desc);
    }

    /// Blocks made through another handle stay out of reach, even for the same process.
    fn require_tracked(&self, desc: &MemDesc) -> KgslResult<()> {
        if self.memdescs.contains(desc) {
            Ok(())
        } else {
            Err(KgslError::bad_param(format!(
                "block 0x{:08x} was not allocated through this handle",
                desc.gpuaddr
            )))
        }
    }

    // ===========================================================================================
    // Device
    // ===========================================================================================

    /// # Errors
    /// See [`DriverContext::device_start`].
    pub fn device_start(&mut self, id: DeviceId, flags: DeviceFlags) -> KgslResult<()> {
        self.driver.device_start(self.pid, id, flags)?;
        self.starts[id.index()] += 1;
        Ok(())
    }

    /// # Errors
    /// [`KgslError::Failure`] if this handle holds no start reference on `id`.
    pub fn device_stop(&mut self, id: DeviceId) -> KgslResult<()> {
        if self.starts[id.index()] == 0 {
            return Err(KgslError::failure(format!(
                "{} was not started through this handle",
                id.name()
            )));
        }
        self.driver.device_stop(self.pid, id)?;
        self.starts[id.index()] -= 1;
        Ok(())
    }

    /// # Errors
    /// See [`DriverContext::device_idle`].
    pub fn device_idle(&self, id: DeviceId, timeout: Duration) -> KgslResult<()> {
        self.driver.device_idle(self.pid, id, timeout)
    }

    /// # Errors
    /// See [`DriverContext::device_getproperty`].
    pub fn device_getproperty(&self, id: DeviceId, ty: PropertyType) -> KgslResult<Property> {
        self.driver.device_getproperty(self.pid, id, ty)
    }

    /// # Errors
    /// See [`DriverContext::device_setproperty`].
    pub fn device_setproperty(&self, id: DeviceId, prop: Property) -> KgslResult<()> {
        self.driver.device_setproperty(self.pid, id, prop)
    }

    /// # Errors
    /// See [`DriverContext::device_regread`].
    pub fn device_regread(&self, id: DeviceId, offsetwords: u32) -> KgslResult<u32> {
        self.driver.device_regread(self.pid, id, offsetwords)
    }

    /// # Errors
    /// See [`DriverContext::device_regwrite`].
    pub fn device_regwrite(&self, id: DeviceId, offsetwords: u32, value: u32) -> KgslResult<()> {
        self.driver.device_regwrite(self.pid, id, offsetwords, value)
    }

    /// # Errors
    /// See [`DriverContext::device_waitirq`].
    pub fn device_waitirq(&self, id: DeviceId, timeout: Duration) -> KgslResult<u32> {
        self.driver.device_waitirq(self.pid, id, timeout)
    }

    // ===========================================================================================
    // Shared memory
    // ===========================================================================================

    /// # Errors
    /// See [`DriverContext::sharedmem_alloc`].
    pub fn sharedmem_alloc(&mut self, id: DeviceId, flags: MemFlags, size: u32) -> KgslResult<MemDesc> {
        let desc = self.driver.sharedmem_alloc(self.pid, id, flags, size)?;
        self.memdescs.push(desc);
        Ok(desc)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_free`].
    pub fn sharedmem_free(&mut self, desc: &MemDesc) -> KgslResult<()> {
        self.require_tracked(desc)?;
        self.driver.sharedmem_free(self.pid, desc)?;
        self.untrack(desc);
        Ok(())
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_read`].
    pub fn sharedmem_read(&self, desc: &MemDesc, offset: u32, dst: &mut [u8]) -> KgslResult<()> {
        self.driver.sharedmem_read(self.pid, desc, offset, dst)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_write`].
    pub fn sharedmem_write(&self, desc: &MemDesc, offset: u32, src: &[u8]) -> KgslResult<()> {
        self.driver.sharedmem_write(self.pid, desc, offset, src)
    }

    /// Writes `words` little-endian at `offset`.
    ///
    /// # Errors
    /// See [`DriverContext::sharedmem_write`].
    pub fn sharedmem_write_words(&self, desc: &MemDesc, offset: u32, words: &[u32]) -> KgslResult<()> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.sharedmem_write(desc, offset, &bytes)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_set`].
    pub fn sharedmem_set(&self, desc: &MemDesc, offset: u32, value: u8, len: u32) -> KgslResult<()> {
        self.driver.sharedmem_set(self.pid, desc, offset, value, len)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_map`].
    pub fn sharedmem_map(&mut self, id: DeviceId, flags: MemFlags, sg: &ScatterList) -> KgslResult<MemDesc> {
        let desc = self.driver.sharedmem_map(self.pid, id, flags, sg)?;
        self.memdescs.push(desc);
        Ok(desc)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_getmap`].
    pub fn sharedmem_getmap(&self, desc: &MemDesc) -> KgslResult<ScatterList> {
        self.driver.sharedmem_getmap(self.pid, desc)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_largestfreeblock`].
    pub fn sharedmem_largestfreeblock(&self, flags: MemFlags) -> KgslResult<u32> {
        self.driver.sharedmem_largestfreeblock(self.pid, flags)
    }

    /// # Errors
    /// See [`DriverContext::sharedmem_cacheoperation`].
    pub fn sharedmem_cacheoperation(&self, desc: &MemDesc, op: CacheOp) -> KgslResult<()> {
        self.driver.sharedmem_cacheoperation(self.pid, desc, op)
    }

    // ===========================================================================================
    // Command stream
    // ===========================================================================================

    /// # Errors
    /// See [`DriverContext::cmdstream_issueibcmds`].
    pub fn cmdstream_issueibcmds(
        &self,
        id: DeviceId,
        context: Option<u32>,
        ibaddr: u32,
        sizedwords: u32,
        flags: CmdFlags,
    ) -> KgslResult<u32> {
        self.driver
            .cmdstream_issueibcmds(self.pid, id, context, ibaddr, sizedwords, flags)
    }

    /// # Errors
    /// See [`DriverContext::cmdstream_readtimestamp`].
    pub fn cmdstream_readtimestamp(&self, id: DeviceId, ty: TimestampType) -> KgslResult<u32> {
        self.driver.cmdstream_readtimestamp(self.pid, id, ty)
    }

    /// # Errors
    /// See [`DriverContext::cmdstream_waittimestamp`].
    pub fn cmdstream_waittimestamp(&self, id: DeviceId, timestamp: u32, timeout: Duration) -> KgslResult<()> {
        self.driver
            .cmdstream_waittimestamp(self.pid, id, timestamp, timeout)
    }

    /// Hands `desc` to the driver to free once `timestamp` retires. The
    /// handle no longer tracks it.
    ///
    /// # Errors
    /// See [`DriverContext::cmdstream_freememontimestamp`].
    pub fn cmdstream_freememontimestamp(&mut self, id: DeviceId, desc: MemDesc, timestamp: u32) -> KgslResult<()> {
        self.require_tracked(&desc)?;
        self.driver
            .cmdstream_freememontimestamp(self.pid, id, desc, timestamp)?;
        self.untrack(&desc);
        Ok(())
    }

    /// # Errors
    /// See [`DriverContext::add_timestamp`].
    pub fn add_timestamp(&self, id: DeviceId) -> KgslResult<u32> {
        self.driver.add_timestamp(self.pid, id)
    }

    /// # Errors
    /// See [`DriverContext::cmdwindow_write`].
    pub fn cmdwindow_write(&self, id: DeviceId, target: u32, addr: u32, data: u32) -> KgslResult<()> {
        self.driver.cmdwindow_write(self.pid, id, target, addr, data)
    }

    // ===========================================================================================
    // Draw contexts
    // ===========================================================================================

    /// # Errors
    /// See [`DriverContext::context_create`].
    pub fn context_create(&mut self, id: DeviceId, ctx_type: ContextType, flags: DrawCtxtFlags) -> KgslResult<u32> {
        let ctx = self.driver.context_create(self.pid, id, ctx_type, flags)?;
        self.contexts.push((id, ctx));
        Ok(ctx)
    }

    /// # Errors
    /// See [`DriverContext::context_destroy`].
    pub fn context_destroy(&mut self, id: DeviceId, context: u32) -> KgslResult<()> {
        if !self.contexts.contains(&(id, context)) {
            return Err(KgslError::bad_param(format!(
                "context {context} on {} was not created through this handle",
                id.name()
            )));
        }
        self.driver.context_destroy(self.pid, id, context)?;
        self.contexts.retain(|&c| c != (id, context));
        Ok(())
    }

    /// # Errors
    /// See [`DriverContext::context_bind_gmem_shadow`].
    pub fn context_bind_gmem_shadow(
        &self,
        id: DeviceId,
        context: u32,
        rect: GmemRect,
        shadow: MemDesc,
    ) -> KgslResult<()> {
        self.driver
            .context_bind_gmem_shadow(self.pid, id, context, rect, shadow)
    }

    // ===========================================================================================
    // Raw dispatch
    // ===========================================================================================

    /// Dispatches an encoded ioctl and returns its status code.
    ///
    /// # Safety
    /// `arg` must point to a valid, aligned argument struct of the type
    /// `cmd` encodes, and any buffer pointers inside it must be valid for
    /// the sizes they are given with.
    pub unsafe fn ioctl(&mut self, cmd: u32, arg: *mut c_void) -> i32 {
        // SAFETY: forwarded from the caller.
        let res = unsafe { self.dispatch(cmd, arg) };
        if let Err(e) = &res {
            log::debug!("kgsl: pid {} ioctl 0x{cmd:08x} failed: {e}", self.pid);
        }
        to_status(&res)
    }

    #[allow(clippy::too_many_lines)]
    unsafe fn dispatch(&mut self, cmd: u32, arg: *mut c_void) -> KgslResult<()> {
        match cmd {
            IOCTL_KGSL_DEVICE_START => {
                let a = unsafe { args::<DeviceStartArgs>(arg)? };
                self.device_start(device(a.device_id)?, DeviceFlags::from_bits_truncate(a.flags))
            }
            IOCTL_KGSL_DEVICE_STOP => {
                let a = unsafe { args::<DeviceStopArgs>(arg)? };
                self.device_stop(device(a.device_id)?)
            }
            IOCTL_KGSL_DEVICE_IDLE => {
                let a = unsafe { args::<DeviceIdleArgs>(arg)? };
                self.device_idle(device(a.device_id)?, millis(a.timeout_ms))
            }
            IOCTL_KGSL_DEVICE_GETPROPERTY => {
                let a = unsafe { args::<DevicePropertyArgs>(arg)? };
                let ty = PropertyType::from_raw(a.type_)
                    .ok_or_else(|| KgslError::bad_param(format!("invalid property {}", a.type_)))?;
                let prop = self.device_getproperty(device(a.device_id)?, ty)?;
                unsafe {
                    match prop {
                        Property::DeviceInfo(info) => put(a.value, a.sizebytes, info),
                        Property::DeviceShadow(shadow) => put(a.value, a.sizebytes, shadow),
                        Property::DevicePower(power) => put(a.value, a.sizebytes, power.bits()),
                        Property::MmuEnable(on) | Property::InterruptWaits(on) => {
                            put(a.value, a.sizebytes, u32::from(on))
                        }
                    }
                }
            }
            IOCTL_KGSL_DEVICE_SETPROPERTY => {
                let a = unsafe { args::<DevicePropertyArgs>(arg)? };
                let ty = PropertyType::from_raw(a.type_)
                    .ok_or_else(|| KgslError::bad_param(format!("invalid property {}", a.type_)))?;
                let prop = unsafe {
                    match ty {
                        PropertyType::DeviceInfo => {
                            Property::DeviceInfo(get::<DeviceInfo>(a.value, a.sizebytes)?)
                        }
                        PropertyType::DeviceShadow => {
                            Property::DeviceShadow(get::<DeviceShadow>(a.value, a.sizebytes)?)
                        }
                        PropertyType::DevicePower => Property::DevicePower(
                            PowerFlags::from_bits_truncate(get::<u32>(a.value, a.sizebytes)?),
                        ),
                        PropertyType::MmuEnable => {
                            Property::MmuEnable(get::<u32>(a.value, a.sizebytes)? != 0)
                        }
                        PropertyType::InterruptWaits => {
                            Property::InterruptWaits(get::<u32>(a.value, a.sizebytes)? != 0)
                        }
                    }
                };
                self.device_setproperty(device(a.device_id)?, prop)
            }
            IOCTL_KGSL_DEVICE_REGREAD => {
                let a = unsafe { args::<DeviceRegArgs>(arg)? };
                a.value = self.device_regread(device(a.device_id)?, a.offsetwords)?;
                Ok(())
            }
            IOCTL_KGSL_DEVICE_REGWRITE => {
                let a = unsafe { args::<DeviceRegArgs>(arg)? };
                self.device_regwrite(device(a.device_id)?, a.offsetwords, a.value)
            }
            IOCTL_KGSL_DEVICE_WAITIRQ => {
                let a = unsafe { args::<DeviceWaitIrqArgs>(arg)? };
                a.count = self.device_waitirq(device(a.device_id)?, millis(a.timeout_ms))?;
                Ok(())
            }
            IOCTL_KGSL_CMDSTREAM_ISSUEIBCMDS => {
                let a = unsafe { args::<IssueIbCmdsArgs>(arg)? };
                let context = (a.drawctxt_id != KGSL_CONTEXT_NONE).then_some(a.drawctxt_id);
                a.timestamp = self.cmdstream_issueibcmds(
                    device(a.device_id)?,
                    context,
                    a.ibaddr,
                    a.sizedwords,
                    CmdFlags::from_bits_truncate(a.flags),
                )?;
                Ok(())
            }
            IOCTL_KGSL_CMDSTREAM_READTIMESTAMP => {
                let a = unsafe { args::<ReadTimestampArgs>(arg)? };
                let ty = TimestampType::from_raw(a.type_)
                    .ok_or_else(|| KgslError::bad_param(format!("invalid timestamp type {}", a.type_)))?;
                a.timestamp = self.cmdstream_readtimestamp(device(a.device_id)?, ty)?;
                Ok(())
            }
            IOCTL_KGSL_CMDSTREAM_WAITTIMESTAMP => {
                let a = unsafe { args::<WaitTimestampArgs>(arg)? };
                self.cmdstream_waittimestamp(device(a.device_id)?, a.timestamp, millis(a.timeout_ms))
            }
            IOCTL_KGSL_CMDSTREAM_FREEMEMONTIMESTAMP => {
                let a = unsafe { args::<FreeMemOnTimestampArgs>(arg)? };
                self.cmdstream_freememontimestamp(device(a.device_id)?, a.memdesc, a.timestamp)
            }
            IOCTL_KGSL_ADD_TIMESTAMP => {
                let a = unsafe { args::<AddTimestampArgs>(arg)? };
                a.timestamp = self.add_timestamp(device(a.device_id)?)?;
                Ok(())
            }
            IOCTL_KGSL_CMDWINDOW_WRITE => {
                let a = unsafe { args::<CmdWindowWriteArgs>(arg)? };
                self.cmdwindow_write(device(a.device_id)?, a.target, a.addr, a.data)
            }
            IOCTL_KGSL_CONTEXT_CREATE => {
                let a = unsafe { args::<ContextCreateArgs>(arg)? };
                let ty = ContextType::from_raw(a.type_)
                    .ok_or_else(|| KgslError::bad_param(format!("invalid context type {}", a.type_)))?;
                let flags = DrawCtxtFlags::from_bits_truncate(a.flags);
                a.drawctxt_id = self.context_create(device(a.device_id)?, ty, flags)?;
                Ok(())
            }
            IOCTL_KGSL_CONTEXT_DESTROY => {
                let a = unsafe { args::<ContextDestroyArgs>(arg)? };
                self.context_destroy(device(a.device_id)?, a.drawctxt_id)
            }
            IOCTL_KGSL_CONTEXT_BIND_GMEM_SHADOW => {
                let a = unsafe { args::<BindGmemShadowArgs>(arg)? };
                self.context_bind_gmem_shadow(device(a.device_id)?, a.drawctxt_id, a.gmem_rect, a.shadow)
            }
            IOCTL_KGSL_SHAREDMEM_ALLOC => {
                let a = unsafe { args::<SharedMemAllocArgs>(arg)? };
                a.memdesc = self.sharedmem_alloc(
                    device(a.device_id)?,
                    MemFlags::from_bits_retain(a.flags),
                    a.sizebytes,
                )?;
                Ok(())
            }
            IOCTL_KGSL_SHAREDMEM_FREE => {
                let a = unsafe { args::<SharedMemFreeArgs>(arg)? };
                self.sharedmem_free(&a.memdesc)
            }
            IOCTL_KGSL_SHAREDMEM_READ => {
                let a = unsafe { args::<SharedMemAccessArgs>(arg)? };
                if a.buffer == 0 {
                    return Err(KgslError::bad_param("null read buffer"));
                }
                // SAFETY: the caller vouches for `sizebytes` bytes at `buffer`.
                let dst = unsafe { std::slice::from_raw_parts_mut(a.buffer as *mut u8, a.sizebytes as usize) };
                self.sharedmem_read(&a.memdesc, a.offsetbytes, dst)
            }
            IOCTL_KGSL_SHAREDMEM_WRITE => {
                let a = unsafe { args::<SharedMemAccessArgs>(arg)? };
                if a.buffer == 0 {
                    return Err(KgslError::bad_param("null write buffer"));
                }
                // SAFETY: the caller vouches for `sizebytes` bytes at `buffer`.
                let src = unsafe { std::slice::from_raw_parts(a.buffer as *const u8, a.sizebytes as usize) };
                self.sharedmem_write(&a.memdesc, a.offsetbytes, src)
            }
            IOCTL_KGSL_SHAREDMEM_SET => {
                let a = unsafe { args::<SharedMemSetArgs>(arg)? };
                let value = u8::try_from(a.value)
                    .map_err(|_| KgslError::bad_param(format!("fill value 0x{:x} is not a byte", a.value)))?;
                self.sharedmem_set(&a.memdesc, a.offsetbytes, value, a.sizebytes)
            }
            IOCTL_KGSL_SHAREDMEM_LARGESTFREEBLOCK => {
                let a = unsafe { args::<SharedMemLargestFreeBlockArgs>(arg)? };
                a.largestfreeblock = self.sharedmem_largestfreeblock(MemFlags::from_bits_retain(a.flags))?;
                Ok(())
            }
            IOCTL_KGSL_SHAREDMEM_CACHEOPERATION => {
                let a = unsafe { args::<SharedMemCacheOperationArgs>(arg)? };
                let op = CacheOp::from_raw(a.op)
                    .ok_or_else(|| KgslError::bad_param(format!("invalid cache operation {}", a.op)))?;
                self.sharedmem_cacheoperation(&a.memdesc, op)
            }
            IOCTL_KGSL_SHAREDMEM_MAP => {
                let a = unsafe { args::<SharedMemMapArgs>(arg)? };
                if a.pages == 0 {
                    return Err(KgslError::bad_param("null page list"));
                }
                // SAFETY: the caller vouches for `num_pages` entries at `pages`.
                let pages = unsafe { std::slice::from_raw_parts(a.pages as *const u32, a.num_pages as usize) };
                let sg = ScatterList::from_pages(pages.to_vec());
                a.memdesc = self.sharedmem_map(device(a.device_id)?, MemFlags::from_bits_retain(a.flags), &sg)?;
                Ok(())
            }
            _ => Err(KgslError::NotSupported(format!("ioctl 0x{cmd:08x}"))),
        }
    }

    // ===========================================================================================
    // Close
    // ===========================================================================================

    fn release(&mut self) {
        let pid = self.pid;
        for id in DeviceId::ALL {
            if self.starts[id.index()] > 0 {
                if let Err(e) = self.driver.device_idle(pid, id, Duration::ZERO) {
                    log::warn!("kgsl: pid {pid} closing on a busy {}: {e}", id.name());
                }
            }
        }

        for (id, ctx) in std::mem::take(&mut self.contexts) {
            if let Err(e) = self.driver.context_destroy(pid, id, ctx) {
                log::debug!("kgsl: pid {pid} context {ctx} on {}: {e}", id.name());
            }
        }
        for desc in std::mem::take(&mut self.memdescs) {
            if let Err(e) = self.driver.sharedmem_free(pid, &desc) {
                log::debug!("kgsl: pid {pid} block 0x{:08x}: {e}", desc.gpuaddr);
            }
        }
        for id in DeviceId::ALL {
            for _ in 0..std::mem::take(&mut self.starts[id.index()]) {
                if let Err(e) = self.driver.device_stop(pid, id) {
                    log::warn!("kgsl: pid {pid} stopping {}: {e}", id.name());
                }
            }
        }
    }
}

impl Drop for KgslFile {
    fn drop(&mut self) {
        self.release();
        if let Err(e) = self.driver.exit(self.pid) {
            log::error!("kgsl: pid {} exit: {e}", self.pid);
        }
    }
}
