//! Graphics support layer: the driver core.
//!
//! Everything in here runs under the single driver lock held by
//! [`context::DriverContext`], except timestamp waits and interrupt service,
//! which go through the lock-free [`device::DeviceShared`] half of a device.

pub mod cmdstream;
pub mod context;
pub mod device;
pub mod drawctxt;
pub mod memory;
pub mod memqueue;
pub mod mmu;
pub mod ringbuffer;

use crate::config::KgslConfig;
use crate::error::KgslResult;
use crate::hw::DeviceId;
use memory::{MemDesc, MemFlags, SharedMem};
use mmu::PageTableSet;

/// Operating system process identifier.
pub type Pid = u32;

/// Identity of the calling process.
#[must_use]
pub fn current_pid() -> Pid {
    // SAFETY: getpid has no preconditions and cannot fail.
    let pid = unsafe { libc::getpid() };
    pid.unsigned_abs()
}

/// Mutable driver-wide state a device operation may need besides the device itself.
///
/// Split out of the driver state so a `&mut Device` and the arena can be
/// borrowed at the same time.
pub(crate) struct GslEnv<'a> {
    pub sharedmem: &'a mut SharedMem,
    pub pagetables: &'a mut PageTableSet,
    pub config: &'a KgslConfig,
}

impl GslEnv<'_> {
    pub fn alloc(
        &mut self,
        device: DeviceId,
        pid: Pid,
        flags: MemFlags,
        size: u32,
    ) -> KgslResult<MemDesc> {
        self.sharedmem
            .alloc(self.pagetables, device, pid, flags, size)
    }

    pub fn free(&mut self, desc: &MemDesc) -> KgslResult<()> {
        self.sharedmem.free(self.pagetables, desc)
    }
}
