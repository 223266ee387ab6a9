//! Fixed-layout parameter blocks.
//!
//! Every request sent to the driver is a `#[repr(C)]` struct with explicit padding,
//! so it is `bytemuck::Pod` and can be viewed as the exact byte image the kernel
//! expects. Offsets and sizes are pinned at compile time with [`param_layout!`];
//! a block whose layout drifts from the driver ABI does not build.

use bytemuck::Pod;

/// Pins the size of a parameter block and the offsets of its ABI-critical fields.
///
/// ```ignore
/// param_layout!(Nvos21Parameters, size = 32, h_object_new @ 8, status @ 28);
/// ```
#[macro_export]
macro_rules! param_layout {
    ($ty:ty, size = $size:expr $(, $field:ident @ $off:expr)* $(,)?) => {
        const _: () = {
            assert!(::core::mem::size_of::<$ty>() == $size);
            $( assert!(::core::mem::offset_of!($ty, $field) == $off); )*
        };
    };
}

/// A parameter block carrying a trailing status word written by the driver.
pub trait StatusBlock: Pod {
    fn status(&self) -> u32;
}

/// Implements [`StatusBlock`] for blocks whose status field has the given name.
#[macro_export]
macro_rules! status_block {
    ($($ty:ty => $field:ident),+ $(,)?) => {
        $(
            impl $crate::nv::codec::StatusBlock for $ty {
                fn status(&self) -> u32 {
                    self.$field
                }
            }
        )+
    };
}

/// Copies a block out of a byte buffer of exactly its size.
///
/// # Panics
/// Panics if `bytes` is not exactly `size_of::<T>()` long.
#[must_use]
pub fn decode<T: Pod>(bytes: &[u8]) -> T {
    assert_eq!(
        bytes.len(),
        std::mem::size_of::<T>(),
        "parameter block size mismatch"
    );
    bytemuck::pod_read_unaligned(bytes)
}

/// Writes `block` back into a buffer of exactly its size.
///
/// # Panics
/// Panics if `bytes` is not exactly `size_of::<T>()` long.
pub fn encode_into<T: Pod>(block: &T, bytes: &mut [u8]) {
    bytes.copy_from_slice(bytemuck::bytes_of(block));
}

#[must_use]
pub fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[must_use]
pub fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

pub fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
