#![allow(clippy::cast_possible_truncation)]

use crate::error::{NvError, NvResult};
use crate::nv::ioctl::{Handle, NVOS32_TYPE_IMAGE, NVOS32_TYPE_NOTIFIER};
use crate::nv::rm::RmClient;
use crate::thunk::memory::mmio::MmioRegion;
use crate::thunk::memory::uvm::UvmSession;
use tracing::debug;

const PAGE_SIZE: u64 = 0x1000;

/// Video heap allocation types (`NVOS32_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeapType {
    /// General memory, mirrored into GPU virtual memory through UVM.
    Image = NVOS32_TYPE_IMAGE,
    /// Completion and error notifiers. Host mapped only.
    Notifier = NVOS32_TYPE_NOTIFIER,
}

/// Parameters of a video heap allocation at a caller-chosen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRequest {
    pub address: u64,
    pub length: u64,
    pub alloc_flags: u32,
    pub map_flags: u32,
    pub kind: HeapType,
}

impl HeapRequest {
    /// General memory with the allocation and mapping flags channels use for
    /// their control region.
    #[must_use]
    pub const fn image(address: u64, length: u64) -> Self {
        Self {
            address,
            length,
            alloc_flags: 0x0001_C101,
            map_flags: 0x000C_0000,
            kind: HeapType::Image,
        }
    }

    #[must_use]
    pub const fn notifier(address: u64, length: u64) -> Self {
        Self {
            address,
            length,
            alloc_flags: 0x0000_C001,
            map_flags: 0,
            kind: HeapType::Notifier,
        }
    }

    #[must_use]
    pub const fn with_alloc_flags(mut self, flags: u32) -> Self {
        self.alloc_flags = flags;
        self
    }

    #[must_use]
    pub const fn with_map_flags(mut self, flags: u32) -> Self {
        self.map_flags = flags;
        self
    }

    fn validate(&self) -> NvResult<()> {
        if self.length == 0 || self.length % PAGE_SIZE != 0 {
            return Err(NvError::InvalidArgument(format!(
                "heap length 0x{:x} is not a nonzero multiple of 0x{PAGE_SIZE:x}",
                self.length
            )));
        }
        if self.address == 0 || self.address % PAGE_SIZE != 0 {
            return Err(NvError::InvalidArgument(format!(
                "heap address 0x{:x} is not a nonzero page-aligned address",
                self.address
            )));
        }
        Ok(())
    }
}

/// A driver memory object mapped into this process at its GPU virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub handle: Handle,
    pub gpu_va: u64,
    pub size: u64,
    pub alloc_flags: u32,
    pub map_flags: u32,
    pub kind: HeapType,
    host_ptr: u64,
}

impl Allocation {
    /// Host address of the mapping. Equal to `gpu_va` for fixed mappings.
    #[must_use]
    pub const fn host_ptr(&self) -> *mut u8 {
        self.host_ptr as *mut u8
    }

    /// A volatile view of the whole mapping.
    ///
    /// # Safety
    /// The client that created the allocation must still be alive; dropping it
    /// unmaps the memory. [`DeviceContext::region`] is the borrow-checked form.
    ///
    /// [`DeviceContext::region`]: crate::thunk::context::DeviceContext::region
    #[must_use]
    pub unsafe fn region<'a>(&self) -> MmioRegion<'a> {
        let region = unsafe { MmioRegion::from_addr(self.host_ptr, self.size as usize) };
        // Mappings are never placed at zero.
        region.unwrap_or_else(|| unreachable!("allocation mapped at null"))
    }
}

/// Parents a heap allocation hangs off.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeapParents {
    pub device: Handle,
    pub subdevice: Handle,
}

/// Allocates video heap memory and maps it at `request.address` on the host.
/// `Image` memory is also reserved and mapped in the GPU's unified address space.
pub(crate) fn heap_alloc(
    rm: &mut RmClient,
    uvm: &mut UvmSession,
    parents: HeapParents,
    request: HeapRequest,
) -> NvResult<Allocation> {
    request.validate()?;

    let handle = rm.vid_heap_alloc(
        parents.device,
        request.kind as u32,
        request.alloc_flags,
        request.length,
    )?;
    let host_ptr = rm.map_memory(
        parents.subdevice,
        handle,
        request.length,
        request.address,
        request.map_flags,
    )?;

    if request.kind == HeapType::Image {
        uvm.create_external_range(request.address, request.length)?;
        uvm.map_external_allocation(request.address, request.length, rm.root(), handle)?;
    }

    debug!(
        %handle,
        kind = ?request.kind,
        gpu_va = format_args!("0x{:x}", request.address),
        size = format_args!("0x{:x}", request.length),
        "heap allocation ready"
    );
    Ok(Allocation {
        handle,
        gpu_va: request.address,
        size: request.length,
        alloc_flags: request.alloc_flags,
        map_flags: request.map_flags,
        kind: request.kind,
        host_ptr,
    })
}
