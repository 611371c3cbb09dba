use crate::gsl::drawctxt::GmemRect;
use crate::gsl::memory::MemDesc;
use crate::utils::iowr;

// ===============================================================================================
// Constants
// ===============================================================================================

pub const KGSL_IOCTL_BASE: u32 = 0x09;

/// Context id meaning "no draw context" in [`IssueIbCmdsArgs`].
pub const KGSL_CONTEXT_NONE: u32 = u32::MAX;

// ===============================================================================================
// Device
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceStartArgs {
    pub device_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceStopArgs {
    pub device_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceIdleArgs {
    pub device_id: u32,
    pub timeout_ms: u32,
}

/// Shared by get and set. `value` points at a buffer of `sizebytes`
/// holding the property's fixed-layout representation.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DevicePropertyArgs {
    pub device_id: u32,
    pub type_: u32,
    pub value: u64,
    pub sizebytes: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceRegArgs {
    pub device_id: u32,
    pub offsetwords: u32,
    pub value: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DeviceWaitIrqArgs {
    pub device_id: u32,
    pub timeout_ms: u32,
    /// Interrupt count after the wait.
    pub count: u32,
}

// ===============================================================================================
// Command Stream
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct IssueIbCmdsArgs {
    pub device_id: u32,
    pub drawctxt_id: u32,
    pub ibaddr: u32,
    pub sizedwords: u32,
    pub timestamp: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ReadTimestampArgs {
    pub device_id: u32,
    pub type_: u32,
    pub timestamp: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WaitTimestampArgs {
    pub device_id: u32,
    pub timestamp: u32,
    pub timeout_ms: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FreeMemOnTimestampArgs {
    pub memdesc: MemDesc,
    pub device_id: u32,
    pub timestamp: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct AddTimestampArgs {
    pub device_id: u32,
    pub timestamp: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct CmdWindowWriteArgs {
    pub device_id: u32,
    pub target: u32,
    pub addr: u32,
    pub data: u32,
}

// ===============================================================================================
// Draw Contexts
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ContextCreateArgs {
    pub device_id: u32,
    pub type_: u32,
    pub drawctxt_id: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct ContextDestroyArgs {
    pub device_id: u32,
    pub drawctxt_id: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct BindGmemShadowArgs {
    pub shadow: MemDesc,
    pub gmem_rect: GmemRect,
    pub device_id: u32,
    pub drawctxt_id: u32,
}

// ===============================================================================================
// Shared Memory
// ===============================================================================================

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemAllocArgs {
    pub memdesc: MemDesc,
    pub device_id: u32,
    pub flags: u32,
    pub sizebytes: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemFreeArgs {
    pub memdesc: MemDesc,
}

/// Shared by read and write; `buffer` is the destination or source.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemAccessArgs {
    pub memdesc: MemDesc,
    pub buffer: u64,
    pub offsetbytes: u32,
    pub sizebytes: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemSetArgs {
    pub memdesc: MemDesc,
    pub offsetbytes: u32,
    pub value: u32,
    pub sizebytes: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemLargestFreeBlockArgs {
    pub flags: u32,
    pub largestfreeblock: u32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemCacheOperationArgs {
    pub memdesc: MemDesc,
    pub op: u32,
}

/// Maps `num_pages` physical pages listed at `pages` (an array of `u32`).
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SharedMemMapArgs {
    pub memdesc: MemDesc,
    pub pages: u64,
    pub num_pages: u32,
    pub device_id: u32,
    pub flags: u32,
}

// ===============================================================================================
// IOCTL Definitions
// ===============================================================================================

pub const IOCTL_KGSL_DEVICE_START: u32 = iowr::<DeviceStartArgs>(KGSL_IOCTL_BASE, 0x20);
pub const IOCTL_KGSL_DEVICE_STOP: u32 = iowr::<DeviceStopArgs>(KGSL_IOCTL_BASE, 0x21);
pub const IOCTL_KGSL_DEVICE_IDLE: u32 = iowr::<DeviceIdleArgs>(KGSL_IOCTL_BASE, 0x22);
pub const IOCTL_KGSL_DEVICE_GETPROPERTY: u32 = iowr::<DevicePropertyArgs>(KGSL_IOCTL_BASE, 0x24);
pub const IOCTL_KGSL_DEVICE_SETPROPERTY: u32 = iowr::<DevicePropertyArgs>(KGSL_IOCTL_BASE, 0x25);
pub const IOCTL_KGSL_DEVICE_REGREAD: u32 = iowr::<DeviceRegArgs>(KGSL_IOCTL_BASE, 0x26);
pub const IOCTL_KGSL_DEVICE_REGWRITE: u32 = iowr::<DeviceRegArgs>(KGSL_IOCTL_BASE, 0x27);
pub const IOCTL_KGSL_DEVICE_WAITIRQ: u32 = iowr::<DeviceWaitIrqArgs>(KGSL_IOCTL_BASE, 0x28);
pub const IOCTL_KGSL_CMDSTREAM_ISSUEIBCMDS: u32 = iowr::<IssueIbCmdsArgs>(KGSL_IOCTL_BASE, 0x29);
pub const IOCTL_KGSL_CMDSTREAM_READTIMESTAMP: u32 =
    iowr::<ReadTimestampArgs>(KGSL_IOCTL_BASE, 0x2a);
pub const IOCTL_KGSL_CMDSTREAM_FREEMEMONTIMESTAMP: u32 =
    iowr::<FreeMemOnTimestampArgs>(KGSL_IOCTL_BASE, 0x2b);
pub const IOCTL_KGSL_CMDSTREAM_WAITTIMESTAMP: u32 =
    iowr::<WaitTimestampArgs>(KGSL_IOCTL_BASE, 0x2c);
pub const IOCTL_KGSL_CMDWINDOW_WRITE: u32 = iowr::<CmdWindowWriteArgs>(KGSL_IOCTL_BASE, 0x2d);
pub const IOCTL_KGSL_CONTEXT_CREATE: u32 = iowr::<ContextCreateArgs>(KGSL_IOCTL_BASE, 0x2e);
pub const IOCTL_KGSL_CONTEXT_DESTROY: u32 = iowr::<ContextDestroyArgs>(KGSL_IOCTL_BASE, 0x2f);
pub const IOCTL_KGSL_CONTEXT_BIND_GMEM_SHADOW: u32 =
    iowr::<BindGmemShadowArgs>(KGSL_IOCTL_BASE, 0x30);
pub const IOCTL_KGSL_SHAREDMEM_ALLOC: u32 = iowr::<SharedMemAllocArgs>(KGSL_IOCTL_BASE, 0x31);
pub const IOCTL_KGSL_SHAREDMEM_FREE: u32 = iowr::<SharedMemFreeArgs>(KGSL_IOCTL_BASE, 0x32);
pub const IOCTL_KGSL_SHAREDMEM_READ: u32 = iowr::<SharedMemAccessArgs>(KGSL_IOCTL_BASE, 0x33);
pub const IOCTL_KGSL_SHAREDMEM_WRITE: u32 = iowr::<SharedMemAccessArgs>(KGSL_IOCTL_BASE, 0x34);
pub const IOCTL_KGSL_SHAREDMEM_SET: u32 = iowr::<SharedMemSetArgs>(KGSL_IOCTL_BASE, 0x35);
pub const IOCTL_KGSL_SHAREDMEM_LARGESTFREEBLOCK: u32 =
    iowr::<SharedMemLargestFreeBlockArgs>(KGSL_IOCTL_BASE, 0x36);
pub const IOCTL_KGSL_SHAREDMEM_CACHEOPERATION: u32 =
    iowr::<SharedMemCacheOperationArgs>(KGSL_IOCTL_BASE, 0x37);
pub const IOCTL_KGSL_SHAREDMEM_MAP: u32 = iowr::<SharedMemMapArgs>(KGSL_IOCTL_BASE, 0x38);
pub const IOCTL_KGSL_ADD_TIMESTAMP: u32 = iowr::<AddTimestampArgs>(KGSL_IOCTL_BASE, 0x39);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ioc_nr;

    #[test]
    fn test_commands_are_distinct() {
        let cmds = [
            IOCTL_KGSL_DEVICE_START,
            IOCTL_KGSL_DEVICE_STOP,
            IOCTL_KGSL_DEVICE_IDLE,
            IOCTL_KGSL_DEVICE_GETPROPERTY,
            IOCTL_KGSL_DEVICE_SETPROPERTY,
            IOCTL_KGSL_DEVICE_REGREAD,
            IOCTL_KGSL_DEVICE_REGWRITE,
            IOCTL_KGSL_DEVICE_WAITIRQ,
            IOCTL_KGSL_CMDSTREAM_ISSUEIBCMDS,
            IOCTL_KGSL_CMDSTREAM_READTIMESTAMP,
            IOCTL_KGSL_CMDSTREAM_FREEMEMONTIMESTAMP,
            IOCTL_KGSL_CMDSTREAM_WAITTIMESTAMP,
            IOCTL_KGSL_CMDWINDOW_WRITE,
            IOCTL_KGSL_CONTEXT_CREATE,
            IOCTL_KGSL_CONTEXT_DESTROY,
            IOCTL_KGSL_CONTEXT_BIND_GMEM_SHADOW,
            IOCTL_KGSL_SHAREDMEM_ALLOC,
            IOCTL_KGSL_SHAREDMEM_FREE,
            IOCTL_KGSL_SHAREDMEM_READ,
            IOCTL_KGSL_SHAREDMEM_WRITE,
            IOCTL_KGSL_SHAREDMEM_SET,
            IOCTL_KGSL_SHAREDMEM_LARGESTFREEBLOCK,
            IOCTL_KGSL_SHAREDMEM_CACHEOPERATION,
            IOCTL_KGSL_SHAREDMEM_MAP,
            IOCTL_KGSL_ADD_TIMESTAMP,
        ];
        let mut nrs: Vec<u32> = cmds.iter().map(|&c| ioc_nr(c)).collect();
        nrs.sort_unstable();
        nrs.dedup();
        assert_eq!(nrs.len(), cmds.len());
        assert_eq!((IOCTL_KGSL_SHAREDMEM_ALLOC >> 8) & 0xff, KGSL_IOCTL_BASE);
    }

    #[test]
    fn test_memdesc_layout() {
        assert_eq!(std::mem::size_of::<MemDesc>(), 24);
        assert_eq!(std::mem::size_of::<SharedMemAllocArgs>(), 40);
        assert_eq!(std::mem::offset_of!(SharedMemAccessArgs, buffer), 24);
    }
}
