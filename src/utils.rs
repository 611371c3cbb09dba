#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use std::cmp::Ordering;

// ===============================================================================================
// Ioctl command encoding (asm-generic layout)
// ===============================================================================================

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

#[must_use]
pub const fn ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | (type_ << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    ioc(IOC_READ | IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Extracts the command number from an encoded ioctl.
#[must_use]
pub const fn ioc_nr(cmd: u32) -> u32 {
    (cmd >> IOC_NRSHIFT) & ((1 << IOC_NRBITS) - 1)
}

// ===============================================================================================
// Address helpers
// ===============================================================================================

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

#[must_use]
pub const fn align_up(val: u32, align: u32) -> u32 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn pages_for(size: u32) -> u32 {
    align_up(size, PAGE_SIZE) >> PAGE_SHIFT
}

// ===============================================================================================
// Timestamps
// ===============================================================================================

/// Guard band for wrapped timestamps. A difference larger than this in the
/// negative direction means the counter wrapped rather than went backwards.
pub const TIMESTAMP_EPSILON: u32 = 20_000;

/// Compares two 32-bit timestamps tolerating wraparound.
#[must_use]
pub const fn timestamp_cmp(new: u32, old: u32) -> Ordering {
    let diff = new.wrapping_sub(old) as i32;
    if diff == 0 {
        Ordering::Equal
    } else if diff > 0 || diff < -(TIMESTAMP_EPSILON as i32) {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// True once `retired` has reached or passed `timestamp`.
#[must_use]
pub const fn timestamp_passed(retired: u32, timestamp: u32) -> bool {
    !matches!(timestamp_cmp(retired, timestamp), Ordering::Less)
}
