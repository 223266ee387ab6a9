#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

use std::fmt::Write as _;

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    assert!(size < (1 << _IOC_SIZEBITS), "ioctl argument too large");
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

/// Read-write request carrying a `T` parameter block.
#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Extracts the parameter size encoded in a request number.
#[must_use]
pub const fn ioc_size(request: u32) -> usize {
    ((request >> _IOC_SIZESHIFT) & ((1 << _IOC_SIZEBITS) - 1)) as usize
}

/// Extracts the command number encoded in a request number.
#[must_use]
pub const fn ioc_nr(request: u32) -> u32 {
    (request >> _IOC_NRSHIFT) & ((1 << _IOC_NRBITS) - 1)
}

/// Formats `bytes` as 16 bytes per row, grouped in pairs, with a leading offset.
#[must_use]
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:06X}\t", row * 16);
        for (i, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{byte:02X}");
            if i % 2 == 1 {
                out.push(' ');
            }
        }
        out.push('\n');
    }
    out
}
