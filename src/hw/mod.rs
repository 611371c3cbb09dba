//! Virtual hardware: the register files, physical memory and interrupt lines
//! the control plane drives, plus a simulated command processor.

pub mod physmem;
pub mod pm4;
pub mod regs;
pub mod sim;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::KgslConfig;
pub use physmem::{PhysRegion, PhysicalMemory};
use regs::{REG_G12_CHIP_ID, REG_RBBM_CHIP_ID, RegisterSpace};
pub use sim::SimGpu;

pub const YAMATO_CHIP_ID: u32 = 0x0002_0100;
pub const G12_CHIP_ID: u32 = 0x0001_0000;

/// On-chip tile memory of the 3D core.
pub const YAMATO_GMEM_BASE: u32 = 0;
pub const YAMATO_GMEM_SIZE: u32 = 256 * 1024;

/// Byte offsets inside a core's memstore, the scratch block the command
/// processor writes timestamps into.
pub const MEMSTORE_SOPTIMESTAMP: u32 = 0;
pub const MEMSTORE_EOPTIMESTAMP: u32 = 4;
pub const MEMSTORE_TS_CMP_ENABLE: u32 = 8;
pub const MEMSTORE_REF_WAIT_TS: u32 = 12;
pub const MEMSTORE_SIZE: u32 = 32;

/// Number of GPU cores the driver knows about.
pub const DEVICE_MAX: usize = 2;

/// Identifies one GPU core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum DeviceId {
    /// Z430 3D core.
    Yamato = 1,
    /// Z160 2D core.
    G12 = 2,
}

impl DeviceId {
    pub const ALL: [Self; DEVICE_MAX] = [Self::Yamato, Self::G12];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Yamato),
            2 => Some(Self::G12),
            _ => None,
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize - 1
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Yamato => "yamato",
            Self::G12 => "g12",
        }
    }
}

type IrqHandler = Arc<dyn Fn() + Send + Sync>;

/// A level-triggered interrupt line from a core to its service routine.
#[derive(Default)]
pub struct InterruptLine {
    handler: Mutex<Option<IrqHandler>>,
}

impl std::fmt::Debug for InterruptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptLine")
            .field("connected", &self.handler.lock().is_some())
            .finish()
    }
}

impl InterruptLine {
    pub fn connect(&self, handler: IrqHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub fn disconnect(&self) {
        self.handler.lock().take();
    }

    /// Delivers the interrupt. The handler runs without the line's lock held.
    pub fn raise(&self) {
        let handler = self.handler.lock().clone();
        if let Some(h) = handler {
            h();
        }
    }
}

/// One GPU core as seen by the driver.
#[derive(Debug)]
pub struct GpuHardware {
    pub id: DeviceId,
    pub regs: RegisterSpace,
    pub irq: InterruptLine,
}

impl GpuHardware {
    #[must_use]
    pub fn new(id: DeviceId) -> Self {
        let regs = RegisterSpace::new();
        match id {
            DeviceId::Yamato => regs.write(REG_RBBM_CHIP_ID, YAMATO_CHIP_ID),
            DeviceId::G12 => regs.write(REG_G12_CHIP_ID, G12_CHIP_ID),
        }
        Self {
            id,
            regs,
            irq: InterruptLine::default(),
        }
    }
}

/// The SoC: shared physical memory plus whichever cores are present.
#[derive(Debug, Clone)]
pub struct Platform {
    pub physmem: Arc<PhysicalMemory>,
    cores: [Option<Arc<GpuHardware>>; DEVICE_MAX],
}

impl Platform {
    /// An i.MX51 with both cores.
    #[must_use]
    pub fn imx51(config: &KgslConfig) -> Self {
        Self::with_cores(config, &DeviceId::ALL)
    }

    /// A variant carrying only the listed cores.
    #[must_use]
    pub fn with_cores(config: &KgslConfig, present: &[DeviceId]) -> Self {
        let mut cores: [Option<Arc<GpuHardware>>; DEVICE_MAX] = [None, None];
        for &id in present {
            cores[id.index()] = Some(Arc::new(GpuHardware::new(id)));
        }
        Self {
            physmem: Arc::new(PhysicalMemory::new(config.conphys_size, config.emem_size)),
            cores,
        }
    }

    #[must_use]
    pub fn core(&self, id: DeviceId) -> Option<&Arc<GpuHardware>> {
        self.cores[id.index()].as_ref()
    }

    /// Builds a simulated command processor attached to the given core.
    #[must_use]
    pub fn simulator(&self, id: DeviceId) -> Option<Arc<SimGpu>> {
        self.core(id)
            .map(|hw| SimGpu::new(hw.clone(), self.physmem.clone()))
    }
}
