#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::config::DevicePaths;
use bytemuck::Pod;
use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The device node a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceNode {
    /// `/dev/nvidiactl`: resource manager escapes.
    Control,
    /// `/dev/nvidia-uvm`: unified memory commands.
    Uvm,
    /// `/dev/nvidia{N}`: the GPU itself, used as the mmap source.
    Gpu,
}

/// The raw transport to the kernel driver.
///
/// Every higher layer talks to the driver only through this trait, so a context
/// can run against the real device files or against an in-process fake.
pub trait ControlChannel: Debug {
    /// Sends `params` with `request` to `node`. The driver writes its answer back
    /// into the same buffer.
    fn ioctl(&self, node: DeviceNode, request: u32, params: &mut [u8]) -> io::Result<()>;

    /// Descriptor number for `node`, as embedded in parameter blocks that name a
    /// control descriptor.
    fn raw_fd(&self, node: DeviceNode) -> RawFd;

    /// Opens a fresh descriptor on the GPU node for one memory mapping.
    fn open_mapping_fd(&self) -> io::Result<OwnedFd>;

    /// Shared read-write mapping of `len` bytes of `fd`. A nonzero `target` must be
    /// honoured exactly; zero lets the kernel choose.
    fn mmap(&self, fd: BorrowedFd<'_>, target: u64, len: usize) -> io::Result<u64>;

    fn munmap(&self, addr: u64, len: usize) -> io::Result<()>;
}

/// Typed helpers over [`ControlChannel`].
pub trait ControlChannelExt: ControlChannel {
    /// Sends a `Pod` parameter block and returns the driver's copy of it.
    fn call<T: Pod>(&self, node: DeviceNode, request: u32, mut params: T) -> io::Result<T> {
        self.ioctl(node, request, bytemuck::bytes_of_mut(&mut params))?;
        Ok(params)
    }
}

impl<C: ControlChannel + ?Sized> ControlChannelExt for C {}

/// The real driver: the control, unified-memory and GPU device files.
///
/// Files are wrapped in an `Arc`, so the device is cheap to clone into objects
/// that outlive the call that created them.
#[derive(Clone, Debug)]
pub struct NvDevice {
    ctl: Arc<File>,
    uvm: Arc<File>,
    gpu: Arc<File>,
    gpu_path: PathBuf,
}

impl NvDevice {
    /// Opens all three device nodes.
    ///
    /// # Errors
    /// Returns an error if any node cannot be opened (driver not loaded, permissions).
    pub fn open(paths: &DevicePaths) -> io::Result<Self> {
        let ctl = open_node(&paths.control)?;
        let uvm = open_node(&paths.uvm)?;
        let gpu = open_node(&paths.gpu)?;
        debug!(
            ctl = ctl.as_raw_fd(),
            uvm = uvm.as_raw_fd(),
            gpu = gpu.as_raw_fd(),
            "opened driver nodes"
        );

        Ok(Self {
            ctl: Arc::new(ctl),
            uvm: Arc::new(uvm),
            gpu: Arc::new(gpu),
            gpu_path: paths.gpu.clone(),
        })
    }

    fn file(&self, node: DeviceNode) -> &File {
        match node {
            DeviceNode::Control => self.ctl.as_ref(),
            DeviceNode::Uvm => self.uvm.as_ref(),
            DeviceNode::Gpu => self.gpu.as_ref(),
        }
    }
}

// std opens with O_CLOEXEC already.
fn open_node(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

impl ControlChannel for NvDevice {
    fn ioctl(&self, node: DeviceNode, request: u32, params: &mut [u8]) -> io::Result<()> {
        let fd = self.file(node).as_raw_fd();
        let ret = unsafe { libc::ioctl(fd, request as _, params.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn raw_fd(&self, node: DeviceNode) -> RawFd {
        self.file(node).as_raw_fd()
    }

    fn open_mapping_fd(&self) -> io::Result<OwnedFd> {
        Ok(open_node(&self.gpu_path)?.into())
    }

    fn mmap(&self, fd: BorrowedFd<'_>, target: u64, len: usize) -> io::Result<u64> {
        // A fixed target never replaces an existing mapping. Kernels without
        // NOREPLACE treat it as a hint, which the caller's address check catches.
        let mut flags = libc::MAP_SHARED;
        if target != 0 {
            flags |= libc::MAP_FIXED_NOREPLACE;
        }
        let ptr = unsafe {
            libc::mmap(
                target as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(ptr as u64)
    }

    fn munmap(&self, addr: u64, len: usize) -> io::Result<()> {
        let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsFd for NvDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.ctl.as_fd()
    }
}
