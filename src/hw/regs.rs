//! Register offsets (dword indices) and the shared register file.
//!
//! Only the registers the control plane touches are named here. Both cores
//! expose the memory hub (MH) block at the same offsets.

use std::sync::atomic::{AtomicU32, Ordering};

/// Size of each core's register file in dwords.
pub const REG_COUNT: usize = 0x1000;

// ===============================================================================================
// Memory hub / MMU
// ===============================================================================================

pub const REG_MH_MMU_CONFIG: u32 = 0x0040;
pub const REG_MH_MMU_VA_RANGE: u32 = 0x0041;
pub const REG_MH_MMU_PT_BASE: u32 = 0x0042;
pub const REG_MH_MMU_PAGE_FAULT: u32 = 0x0043;
pub const REG_MH_MMU_TRAN_ERROR: u32 = 0x0044;
pub const REG_MH_MMU_INVALIDATE: u32 = 0x0045;
pub const REG_MH_INTERRUPT_MASK: u32 = 0x0A42;
pub const REG_MH_INTERRUPT_STATUS: u32 = 0x0A43;
pub const REG_MH_INTERRUPT_CLEAR: u32 = 0x0A44;

pub const MH_MMU_CONFIG_ENABLE: u32 = 1 << 0;
pub const MH_MMU_INVALIDATE_ALL: u32 = 1 << 0;
pub const MH_MMU_INVALIDATE_TC: u32 = 1 << 1;

/// Page-table entry layout: physical page in bits 31:12, access bits below.
pub const MH_PTE_READ: u32 = 1 << 0;
pub const MH_PTE_WRITE: u32 = 1 << 1;
pub const MH_PTE_ADDR_MASK: u32 = 0xffff_f000;

/// Encodes `MH_MMU_VA_RANGE`: base in bits 31:16, size in 64 KB units below.
#[must_use]
pub const fn mh_va_range(base: u32, range: u32) -> u32 {
    (base & 0xffff_0000) | ((range >> 16) & 0xffff)
}

pub const MH_INTERRUPT_AXI_READ_ERROR: u32 = 1 << 0;
pub const MH_INTERRUPT_AXI_WRITE_ERROR: u32 = 1 << 1;
pub const MH_INTERRUPT_MMU_PAGE_FAULT: u32 = 1 << 2;
pub const MH_INTERRUPT_MASK_ALL: u32 = MH_INTERRUPT_AXI_READ_ERROR
    | MH_INTERRUPT_AXI_WRITE_ERROR
    | MH_INTERRUPT_MMU_PAGE_FAULT;

// ===============================================================================================
// 3D core: RBBM / command processor
// ===============================================================================================

pub const REG_RBBM_SOFT_RESET: u32 = 0x003C;
pub const REG_MASTER_INT_SIGNAL: u32 = 0x03B7;
pub const REG_RBBM_CHIP_ID: u32 = 0x03F9;
pub const REG_RBBM_STATUS: u32 = 0x05D0;

pub const MASTER_INT_MH: u32 = 1 << 5;
pub const MASTER_INT_CP: u32 = 1 << 30;
pub const MASTER_INT_RBBM: u32 = 1 << 31;

pub const RBBM_STATUS_GUI_ACTIVE: u32 = 1 << 31;

pub const REG_CP_RB_BASE: u32 = 0x01C0;
pub const REG_CP_RB_CNTL: u32 = 0x01C1;
pub const REG_CP_RB_RPTR_ADDR: u32 = 0x01C3;
pub const REG_CP_RB_RPTR: u32 = 0x01C4;
pub const REG_CP_RB_WPTR: u32 = 0x01C5;
pub const REG_CP_INT_CNTL: u32 = 0x01F2;
pub const REG_CP_INT_STATUS: u32 = 0x01F3;
pub const REG_CP_INT_ACK: u32 = 0x01F4;
pub const REG_CP_ME_CNTL: u32 = 0x01F6;
pub const REG_SCRATCH_REG0: u32 = 0x0578;

pub const CP_ME_CNTL_HALT: u32 = 1 << 28;

pub const CP_INT_SW: u32 = 1 << 19;
pub const CP_INT_T0_PACKET_IN_IB: u32 = 1 << 23;
pub const CP_INT_OPCODE_ERROR: u32 = 1 << 24;
pub const CP_INT_PROTECTED_MODE_ERROR: u32 = 1 << 25;
pub const CP_INT_RESERVED_BIT_ERROR: u32 = 1 << 26;
pub const CP_INT_IB_ERROR: u32 = 1 << 27;
pub const CP_INT_IB1: u32 = 1 << 29;
pub const CP_INT_RB: u32 = 1 << 31;
pub const CP_INT_MASK: u32 = CP_INT_SW
    | CP_INT_T0_PACKET_IN_IB
    | CP_INT_OPCODE_ERROR
    | CP_INT_PROTECTED_MODE_ERROR
    | CP_INT_RESERVED_BIT_ERROR
    | CP_INT_IB_ERROR
    | CP_INT_IB1
    | CP_INT_RB;

// ===============================================================================================
// 2D core: command window and kick
// ===============================================================================================

pub const REG_G12_CHIP_ID: u32 = 0x0100;
pub const REG_G12_STATUS: u32 = 0x0101;
pub const REG_G12_IRQ_STATUS: u32 = 0x0102;
pub const REG_G12_IRQ_CLEAR: u32 = 0x0103;
pub const REG_G12_MEMSTORE_ADDR: u32 = 0x0104;
pub const REG_G12_CMDWINDOW_ADDR: u32 = 0x0200;
pub const REG_G12_CMDWINDOW_DATA: u32 = 0x0201;
pub const REG_G12_IB_ADDR: u32 = 0x0202;
pub const REG_G12_IB_SIZE: u32 = 0x0203;
pub const REG_G12_KICK_TS: u32 = 0x0204;

pub const G12_STATUS_BUSY: u32 = 1 << 0;
pub const G12_IRQ_TIMESTAMP: u32 = 1 << 0;
pub const G12_IRQ_MH: u32 = 1 << 1;

/// A core's memory-mapped register file.
///
/// Registers are plain atomics: the driver and the command processor touch
/// them concurrently without the driver lock.
#[derive(Debug)]
pub struct RegisterSpace {
    regs: Box<[AtomicU32]>,
}

impl Default for RegisterSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterSpace {
    #[must_use]
    pub fn new() -> Self {
        let regs = (0..REG_COUNT).map(|_| AtomicU32::new(0)).collect();
        Self { regs }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Reads a register, or `None` if `offset` is outside the file.
    #[must_use]
    pub fn try_read(&self, offset: u32) -> Option<u32> {
        self.regs
            .get(offset as usize)
            .map(|r| r.load(Ordering::Acquire))
    }

    /// Writes a register. Returns `false` if `offset` is outside the file.
    pub fn try_write(&self, offset: u32, value: u32) -> bool {
        match self.regs.get(offset as usize) {
            Some(r) => {
                r.store(value, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn read(&self, offset: u32) -> u32 {
        self.try_read(offset).unwrap_or_else(|| {
            log::warn!("regs: read from invalid offset 0x{offset:04x}");
            0
        })
    }

    pub fn write(&self, offset: u32, value: u32) {
        if !self.try_write(offset, value) {
            log::warn!("regs: write to invalid offset 0x{offset:04x}");
        }
    }

    pub fn set_bits(&self, offset: u32, bits: u32) {
        if let Some(r) = self.regs.get(offset as usize) {
            r.fetch_or(bits, Ordering::AcqRel);
        }
    }

    pub fn clear_bits(&self, offset: u32, bits: u32) {
        if let Some(r) = self.regs.get(offset as usize) {
            r.fetch_and(!bits, Ordering::AcqRel);
        }
    }

    /// Atomically reads and clears the given bits, returning the bits that were set.
    pub fn take_bits(&self, offset: u32, bits: u32) -> u32 {
        self.regs
            .get(offset as usize)
            .map_or(0, |r| r.fetch_and(!bits, Ordering::AcqRel) & bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        let regs = RegisterSpace::new();
        assert!(regs.try_write(REG_CP_RB_WPTR, 7));
        assert_eq!(regs.try_read(REG_CP_RB_WPTR), Some(7));
        assert!(!regs.try_write(REG_COUNT as u32, 1));
        assert_eq!(regs.try_read(REG_COUNT as u32), None);
    }

    #[test]
    fn test_take_bits() {
        let regs = RegisterSpace::new();
        regs.set_bits(REG_CP_INT_STATUS, CP_INT_RB | CP_INT_SW);
        assert_eq!(regs.take_bits(REG_CP_INT_STATUS, CP_INT_RB), CP_INT_RB);
        assert_eq!(regs.read(REG_CP_INT_STATUS), CP_INT_SW);
    }
}
