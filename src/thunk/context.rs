#![allow(clippy::cast_possible_truncation)]

use crate::config::GpuConfig;
use crate::error::{NvError, NvResult};
use crate::nv::device::{ControlChannel, NvDevice};
use crate::nv::ioctl::{
    FERMI_VASPACE_A, Handle, NV01_DEVICE_0, NV2080_CTRL_CMD_GPU_GET_GID_INFO,
    NV2080_CTRL_CMD_GR_GET_SM_ISSUE_RATE_MODIFIER, NV2080_GPU_CMD_GPU_GET_GID_FLAGS_FORMAT_BINARY,
    NV20_SUBDEVICE_0, NV_DEVICE_ALLOCATION_VAMODE_MULTIPLE_VASPACES, NV_GPU_UUID_LEN,
    NV_VASPACE_ALLOCATION_FLAGS_ENABLE_PAGE_FAULTING, NV_VASPACE_ALLOCATION_FLAGS_IS_EXTERNALLY_OWNED,
    NV_VASPACE_DEFAULT_VA_BASE, Nv0080AllocParameters, Nv2080CtrlGpuGetGidInfoParams,
    Nv2080CtrlGrGetSmIssueRateModifierParams, NvVaspaceAllocationParameters, TURING_USERMODE_A,
};
use crate::nv::rm::RmClient;
use crate::thunk::memory::manager::{self, HeapParents};
use crate::thunk::memory::{Allocation, HeapRequest, MmioRegion, UvmSession};
use bytemuck::Pod;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Mapping flags for the usermode register window.
const USERMODE_MAP_FLAGS: u32 = 2;

// ===============================================================================================
// Context Structures
// ===============================================================================================

/// The 16-byte GPU identity reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuUuid(pub [u8; NV_GPU_UUID_LEN]);

impl GpuUuid {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for GpuUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GPU-")?;
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Handles of the objects a context allocates, parent before child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextHandles {
    pub root: Handle,
    pub device: Handle,
    pub subdevice: Handle,
    pub usermode: Handle,
    pub va_space: Handle,
}

/// SM instruction issue-rate modifiers (`NV2080_CTRL_GR_GET_SM_ISSUE_RATE_MODIFIER`).
#[allow(clippy::struct_field_names)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmIssueRateModifiers {
    pub imla0: u8,
    pub fmla16: u8,
    pub dp: u8,
    pub fmla32: u8,
    pub ffma: u8,
    pub imla1: u8,
    pub imla2: u8,
    pub imla3: u8,
    pub imla4: u8,
}

/// An initialized GPU: the object hierarchy down to the address space, unified
/// memory registration, the usermode doorbell window and the channel control
/// region.
///
/// Dropping the context undoes all of it in reverse: UVM registrations first,
/// then host mappings, then driver objects.
#[derive(Debug)]
pub struct DeviceContext {
    // Field order is drop order.
    uvm: UvmSession,
    rm: RmClient,
    config: GpuConfig,
    handles: ContextHandles,
    gpu_uuid: GpuUuid,
    usermode_addr: u64,
    control: Allocation,
    channel_claimed: bool,
}

// ===============================================================================================
// Initialization
// ===============================================================================================

impl DeviceContext {
    /// Opens the device nodes named by `config` and initializes the GPU.
    ///
    /// # Errors
    /// `Io` if a node cannot be opened, otherwise the first failing step's error.
    pub fn open(config: GpuConfig) -> NvResult<Self> {
        let device = NvDevice::open(&config.paths)?;
        Self::with_driver(Arc::new(device), config)
    }

    /// Initializes the GPU through an already-open driver.
    ///
    /// Any failure aborts the whole sequence; what was created so far is released.
    ///
    /// # Errors
    /// `AllocationFailure`, `MappingFailure` or `ControlCallFailure` from the
    /// failing step.
    pub fn with_driver(driver: Arc<dyn ControlChannel>, config: GpuConfig) -> NvResult<Self> {
        let layout = config.layout;
        let mut rm = RmClient::new(driver.clone())?;
        let root = rm.root();

        let mut device_params = Nv0080AllocParameters {
            device_id: config.device_index,
            h_client_share: root,
            va_mode: NV_DEVICE_ALLOCATION_VAMODE_MULTIPLE_VASPACES,
            ..Default::default()
        };
        let device = rm.alloc_with(NV01_DEVICE_0, root, &mut device_params)?;
        let subdevice = rm.alloc(NV20_SUBDEVICE_0, device)?;
        let usermode = rm.alloc(TURING_USERMODE_A, subdevice)?;
        let usermode_addr = rm.map_memory(
            subdevice,
            usermode,
            layout.usermode_len,
            0,
            USERMODE_MAP_FLAGS,
        )?;

        let mut va_params = NvVaspaceAllocationParameters {
            flags: NV_VASPACE_ALLOCATION_FLAGS_ENABLE_PAGE_FAULTING
                | NV_VASPACE_ALLOCATION_FLAGS_IS_EXTERNALLY_OWNED,
            va_base: NV_VASPACE_DEFAULT_VA_BASE,
            ..Default::default()
        };
        let va_space = rm.alloc_with(FERMI_VASPACE_A, device, &mut va_params)?;

        let gpu_uuid = query_uuid(&rm, subdevice)?;
        info!(uuid = %gpu_uuid, device_index = config.device_index, "GPU identified");

        let mut uvm = UvmSession::new(driver);
        uvm.initialize()?;
        uvm.register_gpu(gpu_uuid.0)?;
        uvm.register_gpu_vaspace(root, va_space)?;

        let parents = HeapParents { device, subdevice };
        let control = manager::heap_alloc(
            &mut rm,
            &mut uvm,
            parents,
            HeapRequest::image(layout.control_base, layout.control_len),
        )?;

        let handles = ContextHandles {
            root,
            device,
            subdevice,
            usermode,
            va_space,
        };
        info!(?handles, "device context ready");

        Ok(Self {
            uvm,
            rm,
            config,
            handles,
            gpu_uuid,
            usermode_addr,
            control,
            channel_claimed: false,
        })
    }
}

fn query_uuid(rm: &RmClient, subdevice: Handle) -> NvResult<GpuUuid> {
    let mut params = Nv2080CtrlGpuGetGidInfoParams {
        flags: NV2080_GPU_CMD_GPU_GET_GID_FLAGS_FORMAT_BINARY,
        length: NV_GPU_UUID_LEN as u32,
        ..Default::default()
    };
    rm.control(subdevice, NV2080_CTRL_CMD_GPU_GET_GID_INFO, &mut params)?;

    let mut uuid = [0u8; NV_GPU_UUID_LEN];
    uuid.copy_from_slice(&params.data[..NV_GPU_UUID_LEN]);
    let uuid = GpuUuid(uuid);
    if uuid.is_zero() {
        return Err(NvError::ControlCallFailure(
            "GPU identity query returned an all-zero UUID".into(),
        ));
    }
    Ok(uuid)
}

// ===============================================================================================
// Accessors and Operations
// ===============================================================================================

impl DeviceContext {
    #[must_use]
    pub const fn handles(&self) -> &ContextHandles {
        &self.handles
    }

    #[must_use]
    pub const fn gpu_uuid(&self) -> GpuUuid {
        self.gpu_uuid
    }

    #[must_use]
    pub const fn config(&self) -> &GpuConfig {
        &self.config
    }

    /// The channel control region allocated at initialization.
    #[must_use]
    pub const fn control_memory(&self) -> &Allocation {
        &self.control
    }

    /// Volatile view of the control region.
    #[must_use]
    pub fn control_region(&self) -> MmioRegion<'_> {
        // Owned by `rm`, which outlives the returned borrow.
        unsafe { self.control.region() }
    }

    /// Volatile view of the usermode register window holding the doorbell.
    #[must_use]
    pub fn usermode(&self) -> MmioRegion<'_> {
        let len = self.config.layout.usermode_len as usize;
        // Mapped by this context; unmapped only when it drops.
        unsafe { MmioRegion::from_addr(self.usermode_addr, len) }
            .unwrap_or_else(|| unreachable!("usermode window mapped at null"))
    }

    /// Volatile view of `alloc`.
    ///
    /// # Errors
    /// `InvalidArgument` if `alloc` was not allocated by this context.
    pub fn region(&self, alloc: &Allocation) -> NvResult<MmioRegion<'_>> {
        if !self
            .rm
            .objects()
            .iter()
            .any(|o| o.handle == alloc.handle && o.class.is_none())
        {
            return Err(NvError::InvalidArgument(format!(
                "memory {} does not belong to client {}",
                alloc.handle, self.handles.root
            )));
        }
        // Owned by `rm`, which outlives the returned borrow.
        Ok(unsafe { alloc.region() })
    }

    /// Allocates video heap memory and maps it at the requested address.
    ///
    /// # Errors
    /// `InvalidArgument` for an unaligned request, `AllocationFailure` or
    /// `MappingFailure` from the driver, including a mapping that lands away from
    /// the requested address.
    pub fn heap_alloc(&mut self, request: HeapRequest) -> NvResult<Allocation> {
        let parents = HeapParents {
            device: self.handles.device,
            subdevice: self.handles.subdevice,
        };
        manager::heap_alloc(&mut self.rm, &mut self.uvm, parents, request)
    }

    /// Issues a resource manager control call against `object`.
    ///
    /// # Errors
    /// `ControlCallFailure` if the call or its status fails.
    pub fn control<P: Pod>(&self, object: Handle, cmd: u32, params: &mut P) -> NvResult<()> {
        self.rm.control(object, cmd, params)
    }

    /// Allocates an object of `class` under `parent`.
    ///
    /// # Errors
    /// `AllocationFailure` if the driver refuses or returns an unusable handle.
    pub fn alloc_object(&mut self, class: u32, parent: Handle) -> NvResult<Handle> {
        self.rm.alloc(class, parent)
    }

    /// Allocates an object of `class` under `parent` with allocation parameters.
    ///
    /// # Errors
    /// `AllocationFailure` if the driver refuses or returns an unusable handle.
    pub fn alloc_object_with<P: Pod>(
        &mut self,
        class: u32,
        parent: Handle,
        params: &mut P,
    ) -> NvResult<Handle> {
        self.rm.alloc_with(class, parent, params)
    }

    /// # Errors
    /// `ControlCallFailure` if the query fails.
    pub fn sm_issue_rate_modifiers(&self) -> NvResult<SmIssueRateModifiers> {
        let mut p = Nv2080CtrlGrGetSmIssueRateModifierParams::default();
        self.rm.control(
            self.handles.subdevice,
            NV2080_CTRL_CMD_GR_GET_SM_ISSUE_RATE_MODIFIER,
            &mut p,
        )?;
        let modifiers = SmIssueRateModifiers {
            imla0: p.imla0,
            fmla16: p.fmla16,
            dp: p.dp,
            fmla32: p.fmla32,
            ffma: p.ffma,
            imla1: p.imla1,
            imla2: p.imla2,
            imla3: p.imla3,
            imla4: p.imla4,
        };
        debug!(?modifiers, "SM issue rate modifiers");
        Ok(modifiers)
    }

    /// Reserves the context's single channel slot. The ring and USERD live at
    /// fixed offsets of the control region, so a second channel would share them.
    pub(crate) fn claim_channel(&mut self) -> NvResult<()> {
        if self.channel_claimed {
            return Err(NvError::InvalidState(format!(
                "client {} already has a channel",
                self.handles.root
            )));
        }
        self.channel_claimed = true;
        Ok(())
    }

    pub(crate) const fn uvm_mut(&mut self) -> &mut UvmSession {
        &mut self.uvm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nv::ioctl::{UVM_INITIALIZE, UVM_REGISTER_GPU, UVM_REGISTER_GPU_VASPACE};
    use crate::nv::mock::{FAKE_UUID, FakeDriver, test_layout};
    use crate::thunk::memory::{HeapType, UvmStage};

    fn open(fake: &Arc<FakeDriver>) -> DeviceContext {
        let config = GpuConfig::default().with_layout(test_layout());
        DeviceContext::with_driver(fake.clone(), config).unwrap()
    }

    #[test]
    fn hierarchy_handles_are_nonzero_and_parented() {
        let fake = Arc::new(FakeDriver::new());
        let ctx = open(&fake);
        let h = *ctx.handles();

        let all = [h.root, h.device, h.subdevice, h.usermode, h.va_space];
        assert!(all.iter().all(|x| !x.is_null()));
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(fake.parent_of(h.device), Some(h.root));
        assert_eq!(fake.parent_of(h.subdevice), Some(h.device));
        assert_eq!(fake.parent_of(h.usermode), Some(h.subdevice));
        assert_eq!(fake.parent_of(h.va_space), Some(h.device));
    }

    #[test]
    fn device_and_vaspace_params_follow_the_driver_contract() {
        let fake = Arc::new(FakeDriver::new());
        let _ctx = open(&fake);

        let device: Nv0080AllocParameters = fake.last_alloc_params(NV01_DEVICE_0).unwrap();
        assert_eq!(device.va_mode, 2);
        let va: NvVaspaceAllocationParameters = fake.last_alloc_params(FERMI_VASPACE_A).unwrap();
        assert_eq!(va.flags, 0x48);
        assert_eq!(va.va_base, 0x1000);
    }

    #[test]
    fn identity_and_uvm_registration() {
        let fake = Arc::new(FakeDriver::new());
        let mut ctx = open(&fake);
        assert_eq!(ctx.gpu_uuid(), GpuUuid(FAKE_UUID));
        assert!(!ctx.gpu_uuid().is_zero());
        assert_eq!(ctx.uvm_mut().stage(), UvmStage::VaSpaceRegistered);
        assert_eq!(
            &fake.uvm_log()[..3],
            &[UVM_INITIALIZE, UVM_REGISTER_GPU, UVM_REGISTER_GPU_VASPACE]
        );
    }

    #[test]
    fn control_region_lands_at_the_layout_base() {
        let fake = Arc::new(FakeDriver::new());
        let ctx = open(&fake);
        let layout = ctx.config().layout;
        let control = ctx.control_memory();
        assert_eq!(control.kind, HeapType::Image);
        assert_eq!(control.host_ptr() as u64, layout.control_base);
        assert_eq!(control.size, 0x20_0000);
        assert_eq!(ctx.control_region().len(), 0x20_0000);
    }

    #[test]
    fn zero_uuid_fails_initialization_and_releases() {
        let fake = Arc::new(FakeDriver::new().with_uuid([0; 16]));
        let config = GpuConfig::default().with_layout(test_layout());
        let err = DeviceContext::with_driver(fake.clone(), config).unwrap_err();
        assert!(matches!(err, NvError::ControlCallFailure(_)));
        assert_eq!(fake.live_mappings(), 0);
        assert_eq!(fake.freed().len(), 5);
    }

    #[test]
    fn failed_class_aborts_without_partial_state() {
        let fake = Arc::new(FakeDriver::new().failing_class(TURING_USERMODE_A));
        let config = GpuConfig::default().with_layout(test_layout());
        let err = DeviceContext::with_driver(fake.clone(), config).unwrap_err();
        assert!(matches!(err, NvError::AllocationFailure(_)));
        assert!(fake.uvm_log().is_empty());
    }

    #[test]
    fn drop_unregisters_before_freeing() {
        let fake = Arc::new(FakeDriver::new());
        let root = {
            let ctx = open(&fake);
            ctx.handles().root
        };
        assert_eq!(fake.freed().last(), Some(&root));
        assert_eq!(fake.live_mappings(), 0);
        let requests = fake.requests();
        let last_uvm = requests
            .iter()
            .rposition(|(node, _)| *node == crate::nv::DeviceNode::Uvm)
            .unwrap();
        let first_free = requests
            .iter()
            .position(|(_, req)| *req == crate::nv::ioctl::NV_IOC_RM_FREE)
            .unwrap();
        assert!(last_uvm < first_free);
    }

    #[test]
    fn extra_heap_allocations_are_tracked() {
        let fake = Arc::new(FakeDriver::new());
        let mut ctx = open(&fake);
        let layout = ctx.config().layout;
        let notifier = ctx
            .heap_alloc(HeapRequest::notifier(layout.notifier_base, layout.notifier_len))
            .unwrap();
        assert_eq!(notifier.host_ptr() as u64, layout.notifier_base);
        let region = ctx.region(&notifier).unwrap();
        region.write32(0, 1);
        assert_eq!(region.read32(0), 1);
    }

    #[test]
    fn region_of_foreign_allocation_is_rejected() {
        let fake = Arc::new(FakeDriver::new());
        let ctx = open(&fake);
        let other_fake = Arc::new(FakeDriver::new().with_first_handle(0xD000_0000));
        let other = open(&other_fake);

        let err = ctx.region(other.control_memory()).unwrap_err();
        assert!(matches!(err, NvError::InvalidArgument(_)));
        assert!(other.region(other.control_memory()).is_ok());
    }

    #[test]
    fn issue_rate_modifiers_are_decoded_in_order() {
        let fake = Arc::new(FakeDriver::new());
        let ctx = open(&fake);
        let m = ctx.sm_issue_rate_modifiers().unwrap();
        assert_eq!((m.imla0, m.ffma, m.imla4), (1, 5, 9));
    }

    #[test]
    fn uuid_display_uses_dashed_groups() {
        let uuid = GpuUuid([
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ]);
        assert_eq!(
            uuid.to_string(),
            "GPU-00112233-4455-6677-8899-aabbccddeeff"
        );
    }
}
