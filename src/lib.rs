//! Control plane of the KGSL graphics driver for the Yamato 3D and Z160 2D
//! cores, running against simulated hardware.
//!
//! [`DriverContext`] is the driver instance; [`KgslFile`] is one client open
//! of it and carries the ioctl surface.

pub mod config;
pub mod error;
pub mod gsl;
pub mod hw;
pub mod kgsl;
pub mod utils;

pub use config::KgslConfig;
pub use error::{KgslError, KgslResult};
pub use gsl::context::DriverContext;
pub use gsl::device::{DeviceFlags, Property, PropertyType, TimestampType};
pub use gsl::drawctxt::{ContextType, DrawCtxtFlags, GmemRect};
pub use gsl::memory::{CacheOp, MemDesc, MemFlags, ScatterList};
pub use gsl::ringbuffer::CmdFlags;
pub use gsl::{Pid, current_pid};
pub use hw::{DeviceId, Platform, SimGpu};
pub use kgsl::KgslFile;
