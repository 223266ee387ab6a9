#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

//! Runs a relocated flat machine-code image on the host CPU with the same
//! argument convention as a GPU launch: buffer pointers first, then scalars.

use crate::error::{NvError, NvResult};
use std::ptr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Registers available to the fixed calling convention.
pub const MAX_PROGRAM_ARGS: usize = 8;

type Entry = extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramArg {
    Buffer(*mut u8),
    Int(i64),
}

/// An executable copy of a code image. Unmapped on drop.
#[derive(Debug)]
pub struct HostProgram {
    base: *mut libc::c_void,
    len: usize,
}

impl HostProgram {
    /// Copies `image` into fresh anonymous memory and makes it executable.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty image, `MappingFailure` if the memory
    /// cannot be mapped or its protection changed.
    pub fn load(image: &[u8]) -> NvResult<Self> {
        if image.is_empty() {
            return Err(NvError::InvalidArgument("empty program image".into()));
        }

        let page = page_size();
        let len = image.len().div_ceil(page) * page;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(NvError::MappingFailure(format!(
                "program image of {} bytes: {}",
                image.len(),
                std::io::Error::last_os_error()
            )));
        }
        // From here on, drop releases the mapping.
        let program = Self { base, len };

        unsafe { ptr::copy_nonoverlapping(image.as_ptr(), base.cast::<u8>(), image.len()) };
        unsafe { sync_icache(base.cast::<u8>(), len) };
        let ret = unsafe { libc::mprotect(base, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            return Err(NvError::MappingFailure(format!(
                "program image: mprotect: {}",
                std::io::Error::last_os_error()
            )));
        }

        debug!(base = format_args!("{base:p}"), len, "loaded host program");
        Ok(program)
    }

    #[must_use]
    pub const fn entry(&self) -> *const u8 {
        self.base as *const u8
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Calls the image's entry point. Buffers are passed first, in order,
    /// followed by the integers, in order.
    ///
    /// # Safety
    /// The image must be a function taking up to eight pointer-sized arguments
    /// that only touches memory the buffers grant it.
    ///
    /// # Errors
    /// `InvalidArgument` for more than [`MAX_PROGRAM_ARGS`] arguments.
    pub unsafe fn call(&self, args: &[ProgramArg]) -> NvResult<()> {
        if args.len() > MAX_PROGRAM_ARGS {
            return Err(NvError::InvalidArgument(format!(
                "{} program arguments, at most {MAX_PROGRAM_ARGS} supported",
                args.len()
            )));
        }

        let buffers = args.iter().filter_map(|a| match a {
            ProgramArg::Buffer(p) => Some(*p as u64),
            ProgramArg::Int(_) => None,
        });
        let ints = args.iter().filter_map(|a| match a {
            ProgramArg::Int(v) => Some(*v as u64),
            ProgramArg::Buffer(_) => None,
        });
        let mut regs = [0u64; MAX_PROGRAM_ARGS];
        for (slot, value) in regs.iter_mut().zip(buffers.chain(ints)) {
            *slot = value;
        }

        let entry: Entry = unsafe { std::mem::transmute::<*mut libc::c_void, Entry>(self.base) };
        entry(
            regs[0], regs[1], regs[2], regs[3], regs[4], regs[5], regs[6], regs[7],
        );
        Ok(())
    }

    /// [`HostProgram::call`], returning the wall-clock time it took.
    ///
    /// # Safety
    /// See [`HostProgram::call`].
    ///
    /// # Errors
    /// See [`HostProgram::call`].
    pub unsafe fn call_timed(&self, args: &[ProgramArg]) -> NvResult<Duration> {
        let start = Instant::now();
        unsafe { self.call(args)? };
        Ok(start.elapsed())
    }
}

impl Drop for HostProgram {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base, self.len) };
        if ret != 0 {
            warn!(
                base = format_args!("{:p}", self.base),
                error = %std::io::Error::last_os_error(),
                "failed to unmap host program"
            );
        }
    }
}

#[cfg(target_arch = "aarch64")]
unsafe extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

/// Makes freshly written code in `base..base + len` visible to instruction
/// fetch. The data and instruction caches are not coherent on aarch64.
#[cfg(target_arch = "aarch64")]
unsafe fn sync_icache(base: *mut u8, len: usize) {
    unsafe { __clear_cache(base.cast(), base.add(len).cast()) };
}

#[cfg(not(target_arch = "aarch64"))]
const unsafe fn sync_icache(_base: *mut u8, _len: usize) {}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 0x1000 }
}
