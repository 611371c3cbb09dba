//! Driver configuration.
//!
//! Everything here is fixed once the [`DriverContext`](crate::gsl::context::DriverContext)
//! is constructed. Defaults mirror the i.MX51 configuration: MMU on, a single
//! global page table, a 32 KB ring buffer.

use std::time::Duration;

use crate::utils::PAGE_SIZE;

/// Maximum number of processes that may have the driver open at once.
pub const CALLER_PROCESS_MAX: usize = 32;

/// Default base of the MMU-translated GPU virtual range.
pub const DEFAULT_VA_BASE: u32 = 0x6600_0000;
/// Default size of the MMU-translated GPU virtual range (32 MB).
pub const DEFAULT_VA_RANGE: u32 = 32 * 1024 * 1024;

/// Configuration for a driver instance.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy)]
pub struct KgslConfig {
    /// GPU sub-client translation. When off, every aperture is physical.
    pub mmu_enabled: bool,
    /// One page table per process instead of a single global table.
    pub per_process_pagetable: bool,
    pub va_base: u32,
    pub va_range: u32,
    /// Ring buffer size in dwords. Must be a power of two.
    pub ringbuffer_sizedwords: u32,
    /// Upper bound on register polls while waiting for ring space.
    pub waitspace_spin_limit: u32,
    /// Upper bound on register polls while waiting for the device to go idle.
    pub idle_spin_limit: u32,
    /// How often a timestamp waiter re-reads the memstore without an interrupt.
    pub timestamp_poll_interval: Duration,
    /// Bytes of physically contiguous memory backing the `CONPHYS` aperture.
    pub conphys_size: u32,
    /// Bytes of memory backing the `EMEM` aperture (page pool when the MMU is on).
    pub emem_size: u32,
    /// Number of channels each aperture is split into.
    pub channels: u32,
}

impl Default for KgslConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl KgslConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mmu_enabled: true,
            per_process_pagetable: false,
            va_base: DEFAULT_VA_BASE,
            va_range: DEFAULT_VA_RANGE,
            ringbuffer_sizedwords: 8192,
            waitspace_spin_limit: 20_000_000,
            idle_spin_limit: 20_000_000,
            timestamp_poll_interval: Duration::from_millis(10),
            conphys_size: 4 * 1024 * 1024,
            emem_size: 8 * 1024 * 1024,
            channels: 2,
        }
    }

    #[must_use]
    pub const fn with_mmu(mut self, enabled: bool) -> Self {
        self.mmu_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_per_process_pagetable(mut self, enabled: bool) -> Self {
        self.per_process_pagetable = enabled;
        self
    }

    #[must_use]
    pub const fn with_va_range(mut self, base: u32, range: u32) -> Self {
        self.va_base = base;
        self.va_range = range;
        self
    }

    #[must_use]
    pub const fn with_ringbuffer_sizedwords(mut self, sizedwords: u32) -> Self {
        self.ringbuffer_sizedwords = sizedwords;
        self
    }

    #[must_use]
    pub const fn with_spin_limits(mut self, waitspace: u32, idle: u32) -> Self {
        self.waitspace_spin_limit = waitspace;
        self.idle_spin_limit = idle;
        self
    }

    #[must_use]
    pub const fn with_timestamp_poll_interval(mut self, interval: Duration) -> Self {
        self.timestamp_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_memory(mut self, conphys_size: u32, emem_size: u32) -> Self {
        self.conphys_size = conphys_size;
        self.emem_size = emem_size;
        self
    }

    /// Applies `KGSL_MMU`, `KGSL_PER_PROCESS_PT` and `KGSL_RB_SIZE` overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::new();

        if let Some(v) = env_flag("KGSL_MMU") {
            cfg.mmu_enabled = v;
        }
        if let Some(v) = env_flag("KGSL_PER_PROCESS_PT") {
            cfg.per_process_pagetable = v;
        }
        if let Ok(s) = std::env::var("KGSL_RB_SIZE") {
            match s.parse::<u32>() {
                Ok(n) if n.is_power_of_two() => cfg.ringbuffer_sizedwords = n,
                _ => log::warn!("config: ignoring invalid KGSL_RB_SIZE={s}"),
            }
        }

        cfg
    }

    /// Checks the invariants the rest of the driver relies on.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if !self.ringbuffer_sizedwords.is_power_of_two() || self.ringbuffer_sizedwords < 64 {
            return Err(format!(
                "ring buffer size {} is not a power of two >= 64",
                self.ringbuffer_sizedwords
            ));
        }
        if self.va_base % PAGE_SIZE != 0 || self.va_range % PAGE_SIZE != 0 || self.va_range == 0 {
            return Err("MMU virtual range must be page aligned".into());
        }
        if self.conphys_size % PAGE_SIZE != 0 || self.emem_size % PAGE_SIZE != 0 {
            return Err("physical memory sizes must be page aligned".into());
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(format!("unsupported channel count {}", self.channels));
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.as_str() {
        "1" | "on" | "true" => Some(true),
        "0" | "off" | "false" => Some(false),
        other => {
            log::warn!("config: ignoring invalid {name}={other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(KgslConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let cfg = KgslConfig::new().with_ringbuffer_sizedwords(1000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let cfg = KgslConfig::new()
            .with_mmu(false)
            .with_per_process_pagetable(true)
            .with_ringbuffer_sizedwords(512);
        assert!(!cfg.mmu_enabled);
        assert!(cfg.per_process_pagetable);
        assert_eq!(cfg.ringbuffer_sizedwords, 512);
    }
}
