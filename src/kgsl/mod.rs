//! Client-facing surface: per-open handles and the raw ioctl encoding.

pub mod file;
pub mod ioctl;

pub use file::KgslFile;
