pub mod aperture;
pub mod sharedmem;

use crate::hw::DeviceId;
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};

pub use aperture::Aperture;
pub use sharedmem::SharedMem;

bitflags::bitflags! {
    /// Allocation request flags.
    ///
    /// Bits 8..12 carry the log2 of the requested alignment; use the `ALIGN*`
    /// constants or [`MemFlags::with_align`] rather than setting them directly.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemFlags: u32 {
        /// Physically contiguous aperture instead of the default `EMEM`.
        const CONPHYS = 1 << 0;
        /// Second channel of the aperture instead of the first.
        const CHANNEL2 = 1 << 4;

        const GPUREADONLY = 1 << 16;
        const GPUWRITEONLY = 1 << 17;
        const GPUNOACCESS = 1 << 18;

        /// Do not fall back to another aperture when the MMU is enabled.
        const STRICTREQUEST = 1 << 24;

        const _ = !0;
    }
}

const ALIGN_SHIFT: u32 = 8;
const ALIGN_MASK: u32 = 0x1f << ALIGN_SHIFT;
const ALIGN_MIN_LOG2: u32 = 5;
const ALIGN_MAX_LOG2: u32 = 16;

impl MemFlags {
    pub const ALIGN32: Self = Self::from_bits_retain(5 << ALIGN_SHIFT);
    pub const ALIGN64: Self = Self::from_bits_retain(6 << ALIGN_SHIFT);
    pub const ALIGN128: Self = Self::from_bits_retain(7 << ALIGN_SHIFT);
    pub const ALIGN256: Self = Self::from_bits_retain(8 << ALIGN_SHIFT);
    pub const ALIGN512: Self = Self::from_bits_retain(9 << ALIGN_SHIFT);
    pub const ALIGN1K: Self = Self::from_bits_retain(10 << ALIGN_SHIFT);
    pub const ALIGN2K: Self = Self::from_bits_retain(11 << ALIGN_SHIFT);
    pub const ALIGN4K: Self = Self::from_bits_retain(12 << ALIGN_SHIFT);
    pub const ALIGN8K: Self = Self::from_bits_retain(13 << ALIGN_SHIFT);
    pub const ALIGN16K: Self = Self::from_bits_retain(14 << ALIGN_SHIFT);
    pub const ALIGN32K: Self = Self::from_bits_retain(15 << ALIGN_SHIFT);
    pub const ALIGN64K: Self = Self::from_bits_retain(16 << ALIGN_SHIFT);

    /// Replaces the alignment field with `2^log2` bytes.
    #[must_use]
    pub const fn with_align(self, log2: u32) -> Self {
        Self::from_bits_retain((self.bits() & !ALIGN_MASK) | ((log2 << ALIGN_SHIFT) & ALIGN_MASK))
    }

    /// Requested alignment in bytes, clamped to 32 B ..= 64 KB.
    #[must_use]
    pub const fn alignment(self) -> u32 {
        let mut log2 = (self.bits() & ALIGN_MASK) >> ALIGN_SHIFT;
        if log2 < ALIGN_MIN_LOG2 {
            log2 = ALIGN_MIN_LOG2;
        } else if log2 > ALIGN_MAX_LOG2 {
            log2 = ALIGN_MAX_LOG2;
        }
        1 << log2
    }

    #[must_use]
    pub const fn aperture(self) -> ApertureId {
        if self.contains(Self::CONPHYS) {
            ApertureId::Conphys
        } else {
            ApertureId::Emem
        }
    }

    #[must_use]
    pub const fn channel(self) -> u32 {
        if self.contains(Self::CHANNEL2) { 1 } else { 0 }
    }

    /// PTE access bits for this request.
    #[must_use]
    pub const fn pte_access(self) -> u32 {
        use crate::hw::regs::{MH_PTE_READ, MH_PTE_WRITE};
        if self.contains(Self::GPUNOACCESS) {
            0
        } else if self.contains(Self::GPUREADONLY) {
            MH_PTE_READ
        } else if self.contains(Self::GPUWRITEONLY) {
            MH_PTE_WRITE
        } else {
            MH_PTE_READ | MH_PTE_WRITE
        }
    }
}

/// The memory regions allocations are carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ApertureId {
    /// External memory; virtualized through the MMU when it is enabled.
    Emem = 0,
    /// Physically contiguous memory; GPU address equals physical address.
    Conphys = 1,
}

impl ApertureId {
    pub const ALL: [Self; 2] = [Self::Emem, Self::Conphys];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Emem),
            1 => Some(Self::Conphys),
            _ => None,
        }
    }
}

// priv_flags layout
const PRIV_APERTURE_MASK: u32 = 0xf;
const PRIV_CHANNEL_SHIFT: u32 = 4;
const PRIV_CHANNEL_MASK: u32 = 0xf << PRIV_CHANNEL_SHIFT;
const PRIV_DEVICE_SHIFT: u32 = 8;
const PRIV_DEVICE_MASK: u32 = 0xf << PRIV_DEVICE_SHIFT;
const PRIV_EXTERNAL: u32 = 1 << 16;
const PRIV_MMU_MAPPED: u32 = 1 << 17;

/// Descriptor of one arena block, as handed across the ioctl surface.
///
/// Callers treat it as opaque and must return it unchanged; the arena
/// validates every descriptor against its own records before use.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemDesc {
    /// Kernel alias of the block. Not dereferenceable by callers.
    pub hostptr: u64,
    pub gpuaddr: u32,
    pub size: u32,
    pub priv_flags: u32,
}

impl MemDesc {
    pub(crate) const fn encode_priv(
        aperture: ApertureId,
        channel: u32,
        device: DeviceId,
        external: bool,
        mmu_mapped: bool,
    ) -> u32 {
        let mut flags = (aperture as u32 & PRIV_APERTURE_MASK)
            | ((channel << PRIV_CHANNEL_SHIFT) & PRIV_CHANNEL_MASK)
            | (((device as u32) << PRIV_DEVICE_SHIFT) & PRIV_DEVICE_MASK);
        if external {
            flags |= PRIV_EXTERNAL;
        }
        if mmu_mapped {
            flags |= PRIV_MMU_MAPPED;
        }
        flags
    }

    #[must_use]
    pub const fn aperture(&self) -> Option<ApertureId> {
        ApertureId::from_raw(self.priv_flags & PRIV_APERTURE_MASK)
    }

    #[must_use]
    pub const fn channel(&self) -> u32 {
        (self.priv_flags & PRIV_CHANNEL_MASK) >> PRIV_CHANNEL_SHIFT
    }

    #[must_use]
    pub const fn device_id(&self) -> Option<DeviceId> {
        DeviceId::from_raw((self.priv_flags & PRIV_DEVICE_MASK) >> PRIV_DEVICE_SHIFT)
    }

    #[must_use]
    pub const fn is_external(&self) -> bool {
        self.priv_flags & PRIV_EXTERNAL != 0
    }

    #[must_use]
    pub const fn is_mmu_mapped(&self) -> bool {
        self.priv_flags & PRIV_MMU_MAPPED != 0
    }

    /// GPU address one past the end of the block.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.gpuaddr as u64 + self.size as u64
    }
}

/// Physical pages backing (or to be mapped into) a GPU range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterList {
    /// Page addresses. A contiguous list holds only the first page.
    pub pages: Vec<u32>,
    pub num_pages: u32,
    pub contiguous: bool,
}

impl ScatterList {
    #[must_use]
    pub fn contiguous(base: u32, num_pages: u32) -> Self {
        Self {
            pages: vec![base],
            num_pages,
            contiguous: true,
        }
    }

    /// Builds a list from individual pages, collapsing it when they are contiguous.
    #[must_use]
    pub fn from_pages(pages: Vec<u32>) -> Self {
        let num_pages = pages.len() as u32;
        let contiguous = pages.windows(2).all(|w| w[1] == w[0] + PAGE_SIZE);
        if contiguous && num_pages > 0 {
            Self::contiguous(pages[0], num_pages)
        } else {
            Self {
                pages,
                num_pages,
                contiguous: false,
            }
        }
    }

    /// Physical address of page `idx`.
    #[must_use]
    pub fn page(&self, idx: u32) -> Option<u32> {
        if idx >= self.num_pages {
            return None;
        }
        if self.contiguous {
            Some(self.pages[0] + (idx << PAGE_SHIFT))
        } else {
            self.pages.get(idx as usize).copied()
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pages).filter_map(|i| self.page(i))
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u32> {
        self.iter().collect()
    }
}

/// Cache maintenance requested through `sharedmem_cacheoperation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CacheOp {
    Flush = 1,
    Invalidate = 2,
}

impl CacheOp {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Flush),
            2 => Some(Self::Invalidate),
            _ => None,
        }
    }
}
