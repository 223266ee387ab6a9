#![allow(clippy::cast_possible_truncation)]

//! Resource manager client: object allocation, control calls, memory mapping and
//! release, all through the control node.

use crate::error::{NvError, NvResult, RmStatus};
use crate::nv::codec::StatusBlock;
use crate::nv::device::{ControlChannel, ControlChannelExt, DeviceNode};
use crate::nv::ioctl::{
    Handle, NV_IOC_RM_ALLOC, NV_IOC_RM_CONTROL, NV_IOC_RM_FREE, NV_IOC_RM_MAP_MEMORY,
    NV_IOC_RM_VID_HEAP_CONTROL, NV01_ROOT_CLIENT, NVOS32_FUNCTION_ALLOC_SIZE,
    NvIoctlNvos33ParametersWithFd, Nvos00Parameters, Nvos21Parameters, Nvos32AllocSize,
    Nvos32Parameters, Nvos33Parameters, Nvos54Parameters,
};
use bytemuck::Pod;
use std::collections::HashSet;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;
use tracing::{debug, warn};

/// An object this client allocated and must release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmObject {
    pub parent: Handle,
    pub handle: Handle,
    /// `None` for video heap memory, which has no class.
    pub class: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct HostMapping {
    addr: u64,
    len: usize,
}

/// A resource manager client rooted at one `NV01_ROOT_CLIENT` object.
///
/// Every handle it hands out is nonzero and distinct from every handle it handed
/// out before. Dropping the client unmaps its host mappings and frees its objects
/// in reverse creation order, the root last.
#[derive(Debug)]
pub struct RmClient {
    driver: Arc<dyn ControlChannel>,
    root: Handle,
    objects: Vec<RmObject>,
    issued: HashSet<Handle>,
    mappings: Vec<HostMapping>,
}

impl RmClient {
    /// Allocates the root client object.
    ///
    /// # Errors
    /// `AllocationFailure` if the driver rejects the root or returns a null handle.
    pub fn new(driver: Arc<dyn ControlChannel>) -> NvResult<Self> {
        let args = Nvos21Parameters {
            h_class: NV01_ROOT_CLIENT,
            ..Default::default()
        };
        let args = driver
            .call(DeviceNode::Control, NV_IOC_RM_ALLOC, args)
            .map_err(|e| NvError::AllocationFailure(format!("root client: {e}")))?;
        check_status(&args).map_err(|s| NvError::AllocationFailure(format!("root client: {s}")))?;
        if args.h_object_new.is_null() {
            return Err(NvError::AllocationFailure(
                "root client: driver returned a null handle".into(),
            ));
        }

        debug!(root = %args.h_object_new, "allocated root client");
        Ok(Self {
            driver,
            root: args.h_object_new,
            objects: Vec::new(),
            issued: HashSet::from([args.h_object_new]),
            mappings: Vec::new(),
        })
    }

    #[must_use]
    pub const fn root(&self) -> Handle {
        self.root
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn ControlChannel> {
        &self.driver
    }

    /// Objects allocated so far, oldest first. The root is not included.
    #[must_use]
    pub fn objects(&self) -> &[RmObject] {
        &self.objects
    }

    /// Allocates an object of `class` under `parent` with no allocation parameters.
    ///
    /// # Errors
    /// See [`RmClient::alloc_with`].
    pub fn alloc(&mut self, class: u32, parent: Handle) -> NvResult<Handle> {
        self.alloc_raw(class, parent, 0, 0)
    }

    /// Allocates an object of `class` under `parent`, passing `params` by pointer.
    /// The driver may write back into `params`.
    ///
    /// # Errors
    /// `AllocationFailure` if the OS call or the embedded status fails, or if the
    /// returned handle is null or already issued by this client.
    pub fn alloc_with<P: Pod>(
        &mut self,
        class: u32,
        parent: Handle,
        params: &mut P,
    ) -> NvResult<Handle> {
        let ptr = std::ptr::from_mut(params) as u64;
        self.alloc_raw(class, parent, ptr, size_of::<P>() as u32)
    }

    fn alloc_raw(
        &mut self,
        class: u32,
        parent: Handle,
        params_ptr: u64,
        params_size: u32,
    ) -> NvResult<Handle> {
        let args = Nvos21Parameters {
            h_root: self.root,
            h_object_parent: parent,
            h_class: class,
            p_alloc_parms: params_ptr,
            params_size,
            ..Default::default()
        };
        let fail = |why: String| {
            NvError::AllocationFailure(format!("class 0x{class:04x} under {parent}: {why}"))
        };

        let args = self
            .driver
            .call(DeviceNode::Control, NV_IOC_RM_ALLOC, args)
            .map_err(|e| fail(e.to_string()))?;
        check_status(&args).map_err(|s| fail(s.to_string()))?;

        let handle = self.adopt(args.h_object_new).map_err(fail)?;
        self.objects.push(RmObject {
            parent,
            handle,
            class: Some(class),
        });
        debug!(class = format_args!("0x{class:04x}"), %parent, %handle, "allocated object");
        Ok(handle)
    }

    fn adopt(&mut self, handle: Handle) -> Result<Handle, String> {
        if handle.is_null() {
            return Err("driver returned a null handle".into());
        }
        if !self.issued.insert(handle) {
            return Err(format!("driver reissued live handle {handle}"));
        }
        Ok(handle)
    }

    /// Issues control command `cmd` against `object`. The driver reads and writes
    /// `params` in place.
    ///
    /// # Errors
    /// `ControlCallFailure` if the OS call or the embedded status fails.
    pub fn control<P: Pod>(&self, object: Handle, cmd: u32, params: &mut P) -> NvResult<()> {
        let args = Nvos54Parameters {
            h_client: self.root,
            h_object: object,
            cmd,
            params: std::ptr::from_mut(params) as u64,
            params_size: size_of::<P>() as u32,
            ..Default::default()
        };
        let fail =
            |why: String| NvError::ControlCallFailure(format!("cmd 0x{cmd:08x} on {object}: {why}"));

        let args = self
            .driver
            .call(DeviceNode::Control, NV_IOC_RM_CONTROL, args)
            .map_err(|e| fail(e.to_string()))?;
        check_status(&args).map_err(|s| fail(s.to_string()))
    }

    /// Creates a video heap memory object of `type_` under `parent`.
    ///
    /// # Errors
    /// `AllocationFailure` if the request fails or the memory handle is unusable.
    pub fn vid_heap_alloc(
        &mut self,
        parent: Handle,
        type_: u32,
        flags: u32,
        size: u64,
    ) -> NvResult<Handle> {
        let args = Nvos32Parameters {
            h_root: self.root,
            h_object_parent: parent,
            function: NVOS32_FUNCTION_ALLOC_SIZE,
            data: Nvos32AllocSize {
                owner: self.root,
                type_,
                flags,
                size,
                ..Default::default()
            },
            ..Default::default()
        };
        let fail = |why: String| {
            NvError::AllocationFailure(format!("heap type {type_} ({size:#x} bytes): {why}"))
        };

        let args = self
            .driver
            .call(DeviceNode::Control, NV_IOC_RM_VID_HEAP_CONTROL, args)
            .map_err(|e| fail(e.to_string()))?;
        check_status(&args).map_err(|s| fail(s.to_string()))?;

        let handle = self.adopt(args.data.h_memory).map_err(fail)?;
        self.objects.push(RmObject {
            parent,
            handle,
            class: None,
        });
        debug!(type_, flags = format_args!("0x{flags:x}"), size = format_args!("0x{size:x}"), %handle, "allocated heap memory");
        Ok(handle)
    }

    /// Maps `len` bytes of `memory` into this process.
    ///
    /// A fresh descriptor on the GPU node is prepared by the driver, then mapped
    /// with `mmap`. With a nonzero `target` the mapping must land exactly there.
    ///
    /// # Errors
    /// `MappingFailure` if either step fails, the mapping lands elsewhere, or a
    /// fixed `target` overlaps a mapping this client already holds.
    pub fn map_memory(
        &mut self,
        device: Handle,
        memory: Handle,
        len: u64,
        target: u64,
        flags: u32,
    ) -> NvResult<u64> {
        let fail = |why: String| {
            NvError::MappingFailure(format!("memory {memory} at 0x{target:x}: {why}"))
        };
        if target != 0 {
            let end = target.saturating_add(len);
            if let Some(held) = self
                .mappings
                .iter()
                .find(|m| target < m.addr + m.len as u64 && m.addr < end)
            {
                return Err(fail(format!(
                    "overlaps the mapping at 0x{:x} (0x{:x} bytes)",
                    held.addr, held.len
                )));
            }
        }

        let fd = self.driver.open_mapping_fd().map_err(|e| fail(e.to_string()))?;
        let args = NvIoctlNvos33ParametersWithFd {
            params: Nvos33Parameters {
                h_client: self.root,
                h_device: device,
                h_memory: memory,
                length: len,
                flags,
                ..Default::default()
            },
            fd: fd.as_raw_fd(),
            pad0: 0,
        };
        let args = self
            .driver
            .call(DeviceNode::Control, NV_IOC_RM_MAP_MEMORY, args)
            .map_err(|e| fail(e.to_string()))?;
        check_status(&args).map_err(|s| fail(s.to_string()))?;

        let len = len as usize;
        let addr = self
            .driver
            .mmap(fd.as_fd(), target, len)
            .map_err(|e| fail(e.to_string()))?;
        if target != 0 && addr != target {
            if let Err(e) = self.driver.munmap(addr, len) {
                warn!(addr = format_args!("0x{addr:x}"), error = %e, "failed to drop misplaced mapping");
            }
            return Err(fail(format!("mapped at 0x{addr:x} instead")));
        }

        self.mappings.push(HostMapping { addr, len });
        debug!(%memory, addr = format_args!("0x{addr:x}"), len = format_args!("0x{len:x}"), "mapped memory");
        Ok(addr)
    }

    /// Frees `handle`, allocated by this client under `parent`.
    ///
    /// # Errors
    /// `InvalidArgument` if this client does not own `handle`; `ControlCallFailure`
    /// if the driver refuses.
    pub fn free(&mut self, parent: Handle, handle: Handle) -> NvResult<()> {
        let Some(index) = self
            .objects
            .iter()
            .position(|o| o.handle == handle && o.parent == parent)
        else {
            return Err(NvError::InvalidArgument(format!(
                "{handle} under {parent} is not owned by client {}",
                self.root
            )));
        };
        self.free_raw(parent, handle)?;
        self.objects.remove(index);
        Ok(())
    }

    fn free_raw(&self, parent: Handle, handle: Handle) -> NvResult<()> {
        let args = Nvos00Parameters {
            h_root: self.root,
            h_object_parent: parent,
            h_object_old: handle,
            status: 0,
        };
        let fail = |why: String| NvError::ControlCallFailure(format!("free {handle}: {why}"));
        let args = self
            .driver
            .call(DeviceNode::Control, NV_IOC_RM_FREE, args)
            .map_err(|e| fail(e.to_string()))?;
        check_status(&args).map_err(|s| fail(s.to_string()))
    }
}

impl Drop for RmClient {
    fn drop(&mut self) {
        for mapping in self.mappings.drain(..).rev() {
            if let Err(e) = self.driver.munmap(mapping.addr, mapping.len) {
                warn!(addr = format_args!("0x{:x}", mapping.addr), error = %e, "failed to unmap");
            }
        }

        let objects = std::mem::take(&mut self.objects);
        for object in objects.iter().rev() {
            if let Err(e) = self.free_raw(object.parent, object.handle) {
                warn!(handle = %object.handle, error = %e, "failed to free object");
            }
        }

        if let Err(e) = self.free_raw(self.root, self.root) {
            warn!(root = %self.root, error = %e, "failed to free root client");
        }
        debug!(root = %self.root, "released client");
    }
}

fn check_status<T: StatusBlock>(block: &T) -> Result<(), RmStatus> {
    let status = RmStatus(block.status());
    if status.is_ok() { Ok(()) } else { Err(status) }
}
