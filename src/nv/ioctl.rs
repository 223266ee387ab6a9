use crate::utils::iowr;
use crate::{param_layout, status_block};
use bytemuck::{Pod, Zeroable};
use std::fmt;

// ===============================================================================================
// Handles
// ===============================================================================================

/// An opaque resource-manager object handle. Zero is the null object.
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Blocks with large arrays cannot derive `Default`; all of them are valid when zeroed.
macro_rules! zeroed_default {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Default for $ty {
                fn default() -> Self {
                    Self::zeroed()
                }
            }
        )+
    };
}

// ===============================================================================================
// Resource Manager escapes (/dev/nvidiactl)
// ===============================================================================================

pub const NV_IOCTL_MAGIC: u32 = 0x46; // 'F'

pub const NV_ESC_RM_FREE: u32 = 0x29;
pub const NV_ESC_RM_CONTROL: u32 = 0x2A;
pub const NV_ESC_RM_ALLOC: u32 = 0x2B;
pub const NV_ESC_RM_VID_HEAP_CONTROL: u32 = 0x4A;
pub const NV_ESC_RM_MAP_MEMORY: u32 = 0x4E;

/// NVOS00_PARAMETERS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos00Parameters {
    pub h_root: Handle,
    pub h_object_parent: Handle,
    pub h_object_old: Handle,
    pub status: u32,
}

/// NVOS21_PARAMETERS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos21Parameters {
    pub h_root: Handle,
    pub h_object_parent: Handle,
    pub h_object_new: Handle,
    pub h_class: u32,
    pub p_alloc_parms: u64,
    pub params_size: u32,
    pub status: u32,
}

/// NVOS54_PARAMETERS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos54Parameters {
    pub h_client: Handle,
    pub h_object: Handle,
    pub cmd: u32,
    pub flags: u32,
    pub params: u64,
    pub params_size: u32,
    pub status: u32,
}

/// NVOS33_PARAMETERS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos33Parameters {
    pub h_client: Handle,
    pub h_device: Handle,
    pub h_memory: Handle,
    pub pad0: u32,
    pub offset: u64,
    pub length: u64,
    pub p_linear_address: u64,
    pub status: u32,
    pub flags: u32,
}

/// `nv_ioctl_nvos33_parameters_with_fd`: the map request names the descriptor the
/// caller will `mmap` afterwards.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct NvIoctlNvos33ParametersWithFd {
    pub params: Nvos33Parameters,
    pub fd: i32,
    pub pad0: u32,
}

pub const NVOS32_FUNCTION_ALLOC_SIZE: u32 = 2;

pub const NVOS32_TYPE_IMAGE: u32 = 0;
pub const NVOS32_TYPE_NOTIFIER: u32 = 13;

/// `NVOS32_PARAMETERS.data.AllocSize`
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos32AllocSize {
    pub owner: Handle,
    pub h_memory: Handle,
    pub type_: u32,
    pub flags: u32,
    pub attr: u32,
    pub format: u32,
    pub compr_covg: u32,
    pub zcull_covg: u32,
    pub partition_stride: u32,
    pub width: u32,
    pub height: u32,
    pub pad0: u32,
    pub size: u64,
    pub alignment: u64,
    pub offset: u64,
    pub limit: u64,
    pub address: u64,
    pub range_begin: u64,
    pub range_end: u64,
    pub attr2: u32,
    pub ctag_offset: u32,
    pub reserved: [u8; 32],
}

/// NVOS32_PARAMETERS (video heap control), `AllocSize` arm of the data union.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nvos32Parameters {
    pub h_root: Handle,
    pub h_object_parent: Handle,
    pub function: u32,
    pub h_va_space: Handle,
    pub ivc_heap_number: i16,
    pub pad0: u16,
    pub status: u32,
    pub total: u64,
    pub free: u64,
    pub data: Nvos32AllocSize,
}

// ===============================================================================================
// Object classes and their allocation parameters
// ===============================================================================================

pub const NV01_ROOT_CLIENT: u32 = 0x0000_0041;
pub const NV01_DEVICE_0: u32 = 0x0000_0080;
pub const NV20_SUBDEVICE_0: u32 = 0x0000_2080;
pub const TURING_USERMODE_A: u32 = 0x0000_C461;
pub const FERMI_VASPACE_A: u32 = 0x0000_90F1;
pub const KEPLER_CHANNEL_GROUP_A: u32 = 0x0000_A06C;
pub const FERMI_CONTEXT_SHARE_A: u32 = 0x0000_9067;
pub const AMPERE_CHANNEL_GPFIFO_A: u32 = 0x0000_C56F;
pub const AMPERE_COMPUTE_B: u32 = 0x0000_C7C0;

pub const NV_DEVICE_ALLOCATION_VAMODE_MULTIPLE_VASPACES: u32 = 0x0000_0002;
pub const NV_VASPACE_ALLOCATION_FLAGS_ENABLE_PAGE_FAULTING: u32 = 0x0000_0008;
pub const NV_VASPACE_ALLOCATION_FLAGS_IS_EXTERNALLY_OWNED: u32 = 0x0000_0040;
/// Lowest usable GPU virtual address; page zero stays unmapped.
pub const NV_VASPACE_DEFAULT_VA_BASE: u64 = 0x1000;
pub const NV_CTXSHARE_ALLOCATION_FLAGS_SUBCONTEXT_ASYNC: u32 = 0x0000_0001;
pub const NV2080_ENGINE_TYPE_GRAPHICS: u32 = 0x0000_0001;

pub const NV_MAX_SUBDEVICES: usize = 8;

/// NV0080_ALLOC_PARAMETERS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Nv0080AllocParameters {
    pub device_id: u32,
    pub h_client_share: Handle,
    pub h_target_client: Handle,
    pub h_target_device: Handle,
    pub flags: u32,
    pub pad0: u32,
    pub va_space_size: u64,
    pub va_start_internal: u64,
    pub va_limit_internal: u64,
    pub va_mode: u32,
    pub pad1: u32,
}

/// NV_VASPACE_ALLOCATION_PARAMETERS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct NvVaspaceAllocationParameters {
    pub index: u32,
    pub flags: u32,
    pub va_size: u64,
    pub va_start_internal: u64,
    pub va_limit_internal: u64,
    pub big_page_size: u32,
    pub pad0: u32,
    pub va_base: u64,
}

/// NV_CHANNEL_GROUP_ALLOCATION_PARAMETERS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct NvChannelGroupAllocationParameters {
    pub h_object_error: Handle,
    pub h_object_ecc_error: Handle,
    pub h_va_space: Handle,
    pub engine_type: u32,
    pub is_calling_context_vgpu_plugin: u8,
    pub pad0: [u8; 3],
}

/// NV_CTXSHARE_ALLOCATION_PARAMETERS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct NvCtxshareAllocationParameters {
    pub h_va_space: Handle,
    pub flags: u32,
    pub subctx_id: u32,
}

/// NV_MEMORY_DESC_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct NvMemoryDescParams {
    pub base: u64,
    pub size: u64,
    pub address_space: u32,
    pub cache_attrib: u32,
}

/// NV_CHANNEL_ALLOC_PARAMS, used for `AMPERE_CHANNEL_GPFIFO_A`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct NvChannelAllocParams {
    pub h_object_error: Handle,
    pub h_object_buffer: Handle,
    pub gp_fifo_offset: u64,
    pub gp_fifo_entries: u32,
    pub flags: u32,
    pub h_context_share: Handle,
    pub h_va_space: Handle,
    pub h_userd_memory: [Handle; NV_MAX_SUBDEVICES],
    pub userd_offset: [u64; NV_MAX_SUBDEVICES],
    pub engine_type: u32,
    pub cid: u32,
    pub sub_device_id: u32,
    pub h_object_ecc_error: Handle,
    pub instance_mem: NvMemoryDescParams,
    pub userd_mem: NvMemoryDescParams,
    pub ramfc_mem: NvMemoryDescParams,
    pub mthdbuf_mem: NvMemoryDescParams,
    pub h_phys_channel_group: Handle,
    pub internal_flags: u32,
    pub error_notifier_mem: NvMemoryDescParams,
    pub ecc_error_notifier_mem: NvMemoryDescParams,
    pub process_id: u32,
    pub sub_process_id: u32,
}

// ===============================================================================================
// Control commands
// ===============================================================================================

pub const NV2080_CTRL_CMD_GPU_GET_GID_INFO: u32 = 0x2080_014A;
pub const NV2080_CTRL_CMD_GR_GET_SM_ISSUE_RATE_MODIFIER: u32 = 0x2080_1230;
pub const NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN: u32 = 0xC36F_0108;
pub const NVA06C_CTRL_CMD_GPFIFO_SCHEDULE: u32 = 0xA06C_0101;

pub const NV2080_GPU_CMD_GPU_GET_GID_FLAGS_FORMAT_BINARY: u32 = 0x0000_0002;
pub const NV_GPU_UUID_LEN: usize = 16;
pub const NV2080_GPU_MAX_GID_LENGTH: usize = 0x100;

/// Value the driver leaves in the token field when it has no token to hand out.
pub const NV_WORK_SUBMIT_TOKEN_INVALID: u32 = 0xFFFF_FFFF;

/// NV2080_CTRL_GPU_GET_GID_INFO_PARAMS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct Nv2080CtrlGpuGetGidInfoParams {
    pub index: u32,
    pub flags: u32,
    pub length: u32,
    pub data: [u8; NV2080_GPU_MAX_GID_LENGTH],
}

/// NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Nvc36fCtrlGpfifoGetWorkSubmitTokenParams {
    pub work_submit_token: u32,
}

/// NVA06C_CTRL_GPFIFO_SCHEDULE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Nva06cCtrlGpfifoScheduleParams {
    pub b_enable: u8,
    pub b_skip_submit: u8,
}

/// NV2080_CTRL_GR_GET_SM_ISSUE_RATE_MODIFIER_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct Nv2080CtrlGrGetSmIssueRateModifierParams {
    pub gr_route_flags: u32,
    pub pad0: u32,
    pub gr_route: u64,
    pub imla0: u8,
    pub fmla16: u8,
    pub dp: u8,
    pub fmla32: u8,
    pub ffma: u8,
    pub imla1: u8,
    pub imla2: u8,
    pub imla3: u8,
    pub imla4: u8,
    pub pad1: [u8; 7],
}

// ===============================================================================================
// Unified Virtual Memory (/dev/nvidia-uvm)
// ===============================================================================================

// UVM takes the bare command number, not an _IOC encoding.
pub const UVM_INITIALIZE: u32 = 0x3000_0001;
pub const UVM_REGISTER_GPU_VASPACE: u32 = 25;
pub const UVM_UNREGISTER_GPU_VASPACE: u32 = 26;
pub const UVM_REGISTER_CHANNEL: u32 = 27;
pub const UVM_UNREGISTER_CHANNEL: u32 = 28;
pub const UVM_MAP_EXTERNAL_ALLOCATION: u32 = 33;
pub const UVM_FREE: u32 = 34;
pub const UVM_REGISTER_GPU: u32 = 37;
pub const UVM_UNREGISTER_GPU: u32 = 38;
pub const UVM_CREATE_EXTERNAL_RANGE: u32 = 73;

pub const UVM_MAX_GPUS: usize = 32;
pub const UVM_GPU_MAPPING_TYPE_READ_WRITE_ATOMIC: u32 = 1;

/// UVM_INITIALIZE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmInitializeParams {
    pub flags: u64,
    pub rm_status: u32,
    pub pad0: u32,
}

/// UVM_REGISTER_GPU_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmRegisterGpuParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub numa_enabled: u8,
    pub pad0: [u8; 3],
    pub numa_node_id: i32,
    pub rm_ctrl_fd: i32,
    pub h_client: Handle,
    pub h_smc_part_ref: Handle,
    pub rm_status: u32,
}

/// UVM_UNREGISTER_GPU_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmUnregisterGpuParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub rm_status: u32,
}

/// UVM_REGISTER_GPU_VASPACE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmRegisterGpuVaspaceParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub rm_ctrl_fd: i32,
    pub h_client: Handle,
    pub h_va_space: Handle,
    pub rm_status: u32,
}

/// UVM_UNREGISTER_GPU_VASPACE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmUnregisterGpuVaspaceParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub rm_status: u32,
}

/// UVM_REGISTER_CHANNEL_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmRegisterChannelParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub rm_ctrl_fd: i32,
    pub h_client: Handle,
    pub h_channel: Handle,
    pub pad0: u32,
    pub base: u64,
    pub length: u64,
    pub rm_status: u32,
    pub pad1: u32,
}

/// UVM_UNREGISTER_CHANNEL_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmUnregisterChannelParams {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub h_client: Handle,
    pub h_channel: Handle,
    pub rm_status: u32,
}

/// UVM_CREATE_EXTERNAL_RANGE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmCreateExternalRangeParams {
    pub base: u64,
    pub length: u64,
    pub rm_status: u32,
    pub pad0: u32,
}

/// UVM_FREE_PARAMS
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmFreeParams {
    pub base: u64,
    pub length: u64,
    pub rm_status: u32,
    pub pad0: u32,
}

/// UvmGpuMappingAttributes
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Pod, Zeroable)]
pub struct UvmGpuMappingAttributes {
    pub gpu_uuid: [u8; NV_GPU_UUID_LEN],
    pub gpu_mapping_type: u32,
    pub gpu_caching_type: u32,
    pub gpu_format_type: u32,
    pub gpu_element_bits: u32,
    pub gpu_compression_type: u32,
}

/// UVM_MAP_EXTERNAL_ALLOCATION_PARAMS
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct UvmMapExternalAllocationParams {
    pub base: u64,
    pub length: u64,
    pub offset: u64,
    pub per_gpu_attributes: [UvmGpuMappingAttributes; UVM_MAX_GPUS],
    pub gpu_attributes_count: u64,
    pub rm_ctrl_fd: i32,
    pub h_client: Handle,
    pub h_memory: Handle,
    pub rm_status: u32,
}

zeroed_default!(
    Nvos00Parameters,
    Nvos21Parameters,
    Nvos54Parameters,
    Nvos33Parameters,
    NvIoctlNvos33ParametersWithFd,
    Nvos32AllocSize,
    Nvos32Parameters,
    NvChannelAllocParams,
    Nv2080CtrlGpuGetGidInfoParams,
    UvmMapExternalAllocationParams,
);

status_block!(
    Nvos00Parameters => status,
    Nvos21Parameters => status,
    Nvos54Parameters => status,
    Nvos32Parameters => status,
    UvmInitializeParams => rm_status,
    UvmRegisterGpuParams => rm_status,
    UvmUnregisterGpuParams => rm_status,
    UvmRegisterGpuVaspaceParams => rm_status,
    UvmUnregisterGpuVaspaceParams => rm_status,
    UvmRegisterChannelParams => rm_status,
    UvmUnregisterChannelParams => rm_status,
    UvmCreateExternalRangeParams => rm_status,
    UvmFreeParams => rm_status,
    UvmMapExternalAllocationParams => rm_status,
);

impl crate::nv::codec::StatusBlock for NvIoctlNvos33ParametersWithFd {
    fn status(&self) -> u32 {
        self.params.status
    }
}

// ===============================================================================================
// Layout pins
// ===============================================================================================

param_layout!(Nvos00Parameters, size = 16, h_object_old @ 8, status @ 12);
param_layout!(Nvos21Parameters, size = 32, h_object_new @ 8, h_class @ 12, p_alloc_parms @ 16, status @ 28);
param_layout!(Nvos54Parameters, size = 32, cmd @ 8, params @ 16, params_size @ 24, status @ 28);
param_layout!(Nvos33Parameters, size = 48, length @ 24, p_linear_address @ 32, status @ 40, flags @ 44);
param_layout!(NvIoctlNvos33ParametersWithFd, size = 56, fd @ 48);
param_layout!(Nvos32AllocSize, size = 144, h_memory @ 4, type_ @ 8, flags @ 12, size @ 48);
param_layout!(Nvos32Parameters, size = 184, function @ 8, status @ 20, data @ 40);
param_layout!(Nv0080AllocParameters, size = 56, h_client_share @ 4, va_mode @ 48);
param_layout!(NvVaspaceAllocationParameters, size = 48, flags @ 4, va_base @ 40);
param_layout!(NvChannelGroupAllocationParameters, size = 20, engine_type @ 12);
param_layout!(NvCtxshareAllocationParameters, size = 12, flags @ 4);
param_layout!(NvMemoryDescParams, size = 24);
param_layout!(NvChannelAllocParams, size = 304, gp_fifo_offset @ 8, gp_fifo_entries @ 16, h_context_share @ 24, h_userd_memory @ 32, userd_offset @ 64, instance_mem @ 144, process_id @ 296);
param_layout!(Nv2080CtrlGpuGetGidInfoParams, size = 268, length @ 8, data @ 12);
param_layout!(Nvc36fCtrlGpfifoGetWorkSubmitTokenParams, size = 4);
param_layout!(Nva06cCtrlGpfifoScheduleParams, size = 2);
param_layout!(Nv2080CtrlGrGetSmIssueRateModifierParams, size = 32, imla0 @ 16, imla4 @ 24);
param_layout!(UvmInitializeParams, size = 16, rm_status @ 8);
param_layout!(UvmRegisterGpuParams, size = 40, numa_node_id @ 20, rm_ctrl_fd @ 24, rm_status @ 36);
param_layout!(UvmUnregisterGpuParams, size = 20, rm_status @ 16);
param_layout!(UvmRegisterGpuVaspaceParams, size = 32, rm_ctrl_fd @ 16, h_va_space @ 24, rm_status @ 28);
param_layout!(UvmUnregisterGpuVaspaceParams, size = 20, rm_status @ 16);
param_layout!(UvmRegisterChannelParams, size = 56, base @ 32, length @ 40, rm_status @ 48);
param_layout!(UvmUnregisterChannelParams, size = 28, rm_status @ 24);
param_layout!(UvmCreateExternalRangeParams, size = 24, rm_status @ 16);
param_layout!(UvmFreeParams, size = 24, rm_status @ 16);
param_layout!(UvmGpuMappingAttributes, size = 36, gpu_mapping_type @ 16);
param_layout!(UvmMapExternalAllocationParams, size = 1200, per_gpu_attributes @ 24, gpu_attributes_count @ 1176, rm_ctrl_fd @ 1184, h_memory @ 1192, rm_status @ 1196);

// ===============================================================================================
// Request numbers
// ===============================================================================================

pub const NV_IOC_RM_FREE: u32 = iowr::<Nvos00Parameters>(NV_IOCTL_MAGIC, NV_ESC_RM_FREE);
pub const NV_IOC_RM_CONTROL: u32 = iowr::<Nvos54Parameters>(NV_IOCTL_MAGIC, NV_ESC_RM_CONTROL);
pub const NV_IOC_RM_ALLOC: u32 = iowr::<Nvos21Parameters>(NV_IOCTL_MAGIC, NV_ESC_RM_ALLOC);
pub const NV_IOC_RM_VID_HEAP_CONTROL: u32 =
    iowr::<Nvos32Parameters>(NV_IOCTL_MAGIC, NV_ESC_RM_VID_HEAP_CONTROL);
pub const NV_IOC_RM_MAP_MEMORY: u32 =
    iowr::<NvIoctlNvos33ParametersWithFd>(NV_IOCTL_MAGIC, NV_ESC_RM_MAP_MEMORY);
