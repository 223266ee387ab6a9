#![allow(clippy::cast_possible_truncation)]

//! An in-process stand-in for the kernel driver.
//!
//! It decodes the same parameter blocks the real driver receives, hands out
//! handles from a counter, and backs mappings with anonymous memory placed at the
//! requested address, so fixed-address code paths run for real.

use crate::config::GpuLayout;
use crate::nv::codec::{decode, encode_into};
use crate::nv::device::{ControlChannel, DeviceNode};
use crate::nv::ioctl::{
    Handle, NV_IOC_RM_ALLOC, NV_IOC_RM_CONTROL, NV_IOC_RM_FREE, NV_IOC_RM_MAP_MEMORY,
    NV_IOC_RM_VID_HEAP_CONTROL, NV2080_CTRL_CMD_GPU_GET_GID_INFO,
    NV2080_CTRL_CMD_GR_GET_SM_ISSUE_RATE_MODIFIER, NVA06C_CTRL_CMD_GPFIFO_SCHEDULE,
    NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN, Nv2080CtrlGpuGetGidInfoParams,
    Nv2080CtrlGrGetSmIssueRateModifierParams, Nva06cCtrlGpfifoScheduleParams,
    Nvc36fCtrlGpfifoGetWorkSubmitTokenParams, NvIoctlNvos33ParametersWithFd, Nvos00Parameters,
    Nvos21Parameters, Nvos32Parameters, Nvos54Parameters, UVM_CREATE_EXTERNAL_RANGE, UVM_FREE,
    UVM_INITIALIZE, UVM_MAP_EXTERNAL_ALLOCATION, UVM_REGISTER_CHANNEL, UVM_REGISTER_GPU,
    UVM_REGISTER_GPU_VASPACE, UVM_UNREGISTER_CHANNEL, UVM_UNREGISTER_GPU,
    UVM_UNREGISTER_GPU_VASPACE, UvmCreateExternalRangeParams, UvmFreeParams,
    UvmInitializeParams, UvmMapExternalAllocationParams, UvmRegisterChannelParams,
    UvmRegisterGpuParams, UvmRegisterGpuVaspaceParams, UvmUnregisterChannelParams,
    UvmUnregisterGpuParams, UvmUnregisterGpuVaspaceParams,
};
use bytemuck::Pod;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

const NV_ERR_INVALID_CLASS: u32 = 0x22;
const NV_ERR_NOT_SUPPORTED: u32 = 0x56;

pub const FAKE_UUID: [u8; 16] = [
    0x47, 0x50, 0x55, 0x2d, 0x8b, 0x11, 0x02, 0x3c, 0x9a, 0x60, 0x4e, 0x31, 0xd2, 0x07, 0x5f, 0xa8,
];

static NEXT_REGION: AtomicU64 = AtomicU64::new(0);

/// A layout whose fixed addresses no other test in this process uses.
pub fn test_layout() -> GpuLayout {
    let slot = NEXT_REGION.fetch_add(1, Ordering::Relaxed);
    let base = 0x30_0000_0000 + slot * 0x1000_0000;
    GpuLayout::default()
        .with_control_base(base)
        .with_notifier_base(base + 0x800_0000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    Fresh,
    /// Every allocation returns the same handle.
    Stuck,
    /// Every allocation returns the null handle.
    Null,
}

#[derive(Debug)]
struct AllocRecord {
    class: u32,
    parent: Handle,
    handle: Handle,
    params: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u32,
    requests: Vec<(DeviceNode, u32)>,
    allocs: Vec<AllocRecord>,
    freed: Vec<Handle>,
    mappings: HashMap<u64, usize>,
    uvm_log: Vec<u32>,
    external_ranges: Vec<(u64, u64)>,
    channels: Vec<(u64, u64)>,
    scheduled: bool,
}

#[derive(Debug)]
pub struct FakeDriver {
    state: RefCell<State>,
    handle_mode: HandleMode,
    fail_class: Option<u32>,
    fail_uvm: Option<u32>,
    misplace: bool,
    token: u32,
    uuid: [u8; 16],
    schedule_status: u32,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_handle: 0xC1D0_0000,
                ..State::default()
            }),
            handle_mode: HandleMode::Fresh,
            fail_class: None,
            fail_uvm: None,
            misplace: false,
            token: 0x0000_0C01,
            uuid: FAKE_UUID,
            schedule_status: 0,
        }
    }

    pub const fn with_handle_mode(mut self, mode: HandleMode) -> Self {
        self.handle_mode = mode;
        self
    }

    pub fn with_first_handle(mut self, handle: u32) -> Self {
        self.state.get_mut().next_handle = handle;
        self
    }

    pub const fn failing_class(mut self, class: u32) -> Self {
        self.fail_class = Some(class);
        self
    }

    pub const fn failing_uvm(mut self, cmd: u32) -> Self {
        self.fail_uvm = Some(cmd);
        self
    }

    pub const fn misplacing_mappings(mut self) -> Self {
        self.misplace = true;
        self
    }

    pub const fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    pub const fn with_uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    pub const fn with_schedule_status(mut self, status: u32) -> Self {
        self.schedule_status = status;
        self
    }

    pub fn requests(&self) -> Vec<(DeviceNode, u32)> {
        self.state.borrow().requests.clone()
    }

    /// Classes allocated so far, in order.
    pub fn allocated_classes(&self) -> Vec<u32> {
        self.state.borrow().allocs.iter().map(|a| a.class).collect()
    }

    /// The allocation parameters most recently passed for `class`.
    pub fn last_alloc_params<P: Pod>(&self, class: u32) -> Option<P> {
        let state = self.state.borrow();
        let record = state.allocs.iter().rev().find(|a| a.class == class)?;
        (record.params.len() == size_of::<P>()).then(|| decode(&record.params))
    }

    pub fn parent_of(&self, handle: Handle) -> Option<Handle> {
        let state = self.state.borrow();
        state
            .allocs
            .iter()
            .find(|a| a.handle == handle)
            .map(|a| a.parent)
    }

    pub fn freed(&self) -> Vec<Handle> {
        self.state.borrow().freed.clone()
    }

    pub fn live_mappings(&self) -> usize {
        self.state.borrow().mappings.len()
    }

    /// UVM command numbers received, in order.
    pub fn uvm_log(&self) -> Vec<u32> {
        self.state.borrow().uvm_log.clone()
    }

    pub fn external_ranges(&self) -> Vec<(u64, u64)> {
        self.state.borrow().external_ranges.clone()
    }

    pub fn registered_channels(&self) -> Vec<(u64, u64)> {
        self.state.borrow().channels.clone()
    }

    pub fn scheduled(&self) -> bool {
        self.state.borrow().scheduled
    }

    fn next_handle(&self) -> Handle {
        let mut state = self.state.borrow_mut();
        match self.handle_mode {
            HandleMode::Null => Handle::NULL,
            HandleMode::Stuck => Handle(state.next_handle),
            HandleMode::Fresh => {
                state.next_handle += 1;
                Handle(state.next_handle)
            }
        }
    }

    fn rm_alloc(&self, params: &mut [u8]) {
        let mut args: Nvos21Parameters = decode(params);
        if self.fail_class == Some(args.h_class) {
            args.status = NV_ERR_INVALID_CLASS;
            encode_into(&args, params);
            return;
        }

        let copied = if args.p_alloc_parms == 0 {
            Vec::new()
        } else {
            let src = args.p_alloc_parms as *const u8;
            unsafe { std::slice::from_raw_parts(src, args.params_size as usize) }.to_vec()
        };
        args.h_object_new = self.next_handle();
        args.status = 0;
        self.state.borrow_mut().allocs.push(AllocRecord {
            class: args.h_class,
            parent: args.h_object_parent,
            handle: args.h_object_new,
            params: copied,
        });
        encode_into(&args, params);
    }

    fn rm_control(&self, params: &mut [u8]) {
        let mut args: Nvos54Parameters = decode(params);
        args.status = match args.cmd {
            NV2080_CTRL_CMD_GPU_GET_GID_INFO => {
                self.write_through(&args, |p: &mut Nv2080CtrlGpuGetGidInfoParams| {
                    p.data[..16].copy_from_slice(&self.uuid);
                    p.length = 16;
                })
            }
            NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN => {
                self.write_through(&args, |p: &mut Nvc36fCtrlGpfifoGetWorkSubmitTokenParams| {
                    p.work_submit_token = self.token;
                })
            }
            NVA06C_CTRL_CMD_GPFIFO_SCHEDULE => {
                let mut enabled = false;
                let status = self.write_through(&args, |p: &mut Nva06cCtrlGpfifoScheduleParams| {
                    enabled = p.b_enable != 0;
                });
                if status == 0 && self.schedule_status == 0 {
                    self.state.borrow_mut().scheduled = enabled;
                }
                if status == 0 { self.schedule_status } else { status }
            }
            NV2080_CTRL_CMD_GR_GET_SM_ISSUE_RATE_MODIFIER => {
                self.write_through(&args, |p: &mut Nv2080CtrlGrGetSmIssueRateModifierParams| {
                    p.imla0 = 1;
                    p.fmla16 = 2;
                    p.dp = 3;
                    p.fmla32 = 4;
                    p.ffma = 5;
                    p.imla1 = 6;
                    p.imla2 = 7;
                    p.imla3 = 8;
                    p.imla4 = 9;
                })
            }
            _ => NV_ERR_NOT_SUPPORTED,
        };
        encode_into(&args, params);
    }

    /// Applies `f` to the caller's control parameters if the size matches.
    fn write_through<P: Pod>(&self, args: &Nvos54Parameters, f: impl FnOnce(&mut P)) -> u32 {
        if args.params_size as usize != size_of::<P>() || args.params == 0 {
            return 0x1F;
        }
        let block = unsafe { &mut *(args.params as *mut P) };
        f(block);
        0
    }

    fn rm_vid_heap(&self, params: &mut [u8]) {
        let mut args: Nvos32Parameters = decode(params);
        args.data.h_memory = self.next_handle();
        args.status = 0;
        self.state.borrow_mut().allocs.push(AllocRecord {
            class: 0,
            parent: args.h_object_parent,
            handle: args.data.h_memory,
            params: Vec::new(),
        });
        encode_into(&args, params);
    }

    fn rm_free(&self, params: &mut [u8]) {
        let mut args: Nvos00Parameters = decode(params);
        self.state.borrow_mut().freed.push(args.h_object_old);
        args.status = 0;
        encode_into(&args, params);
    }

    fn rm_map(&self, params: &mut [u8]) {
        let mut args: NvIoctlNvos33ParametersWithFd = decode(params);
        args.params.status = if args.fd < 0 { 0x1F } else { 0 };
        encode_into(&args, params);
    }

    fn uvm(&self, request: u32, params: &mut [u8]) {
        self.state.borrow_mut().uvm_log.push(request);
        let status = if self.fail_uvm == Some(request) { 0x1F } else { 0 };
        match request {
            UVM_INITIALIZE => self.set_status::<UvmInitializeParams>(params, status, |p| &mut p.rm_status),
            UVM_REGISTER_GPU => self.set_status::<UvmRegisterGpuParams>(params, status, |p| &mut p.rm_status),
            UVM_REGISTER_GPU_VASPACE => {
                self.set_status::<UvmRegisterGpuVaspaceParams>(params, status, |p| &mut p.rm_status);
            }
            UVM_UNREGISTER_GPU => self.set_status::<UvmUnregisterGpuParams>(params, status, |p| &mut p.rm_status),
            UVM_UNREGISTER_GPU_VASPACE => {
                self.set_status::<UvmUnregisterGpuVaspaceParams>(params, status, |p| &mut p.rm_status);
            }
            UVM_UNREGISTER_CHANNEL => {
                self.set_status::<UvmUnregisterChannelParams>(params, status, |p| &mut p.rm_status);
            }
            UVM_MAP_EXTERNAL_ALLOCATION => {
                self.set_status::<UvmMapExternalAllocationParams>(params, status, |p| &mut p.rm_status);
            }
            UVM_FREE => self.set_status::<UvmFreeParams>(params, status, |p| &mut p.rm_status),
            UVM_CREATE_EXTERNAL_RANGE => {
                let args: UvmCreateExternalRangeParams = decode(params);
                if status == 0 {
                    self.state.borrow_mut().external_ranges.push((args.base, args.length));
                }
                self.set_status::<UvmCreateExternalRangeParams>(params, status, |p| &mut p.rm_status);
            }
            UVM_REGISTER_CHANNEL => {
                let args: UvmRegisterChannelParams = decode(params);
                if status == 0 {
                    self.state.borrow_mut().channels.push((args.base, args.length));
                }
                self.set_status::<UvmRegisterChannelParams>(params, status, |p| &mut p.rm_status);
            }
            _ => {}
        }
    }

    fn set_status<P: Pod>(&self, params: &mut [u8], status: u32, field: impl Fn(&mut P) -> &mut u32) {
        let mut args: P = decode(params);
        *field(&mut args) = status;
        encode_into(&args, params);
    }
}

impl ControlChannel for FakeDriver {
    fn ioctl(&self, node: DeviceNode, request: u32, params: &mut [u8]) -> io::Result<()> {
        self.state.borrow_mut().requests.push((node, request));
        match (node, request) {
            (DeviceNode::Control, NV_IOC_RM_ALLOC) => self.rm_alloc(params),
            (DeviceNode::Control, NV_IOC_RM_CONTROL) => self.rm_control(params),
            (DeviceNode::Control, NV_IOC_RM_VID_HEAP_CONTROL) => self.rm_vid_heap(params),
            (DeviceNode::Control, NV_IOC_RM_FREE) => self.rm_free(params),
            (DeviceNode::Control, NV_IOC_RM_MAP_MEMORY) => self.rm_map(params),
            (DeviceNode::Uvm, _) => self.uvm(request, params),
            _ => return Err(io::Error::from_raw_os_error(libc::ENOTTY)),
        }
        Ok(())
    }

    fn raw_fd(&self, node: DeviceNode) -> RawFd {
        match node {
            DeviceNode::Control => 100,
            DeviceNode::Uvm => 101,
            DeviceNode::Gpu => 102,
        }
    }

    fn open_mapping_fd(&self) -> io::Result<OwnedFd> {
        Ok(File::open("/dev/null")?.into())
    }

    fn mmap(&self, _fd: BorrowedFd<'_>, target: u64, len: usize) -> io::Result<u64> {
        let (hint, flags) = if target == 0 || self.misplace {
            (0, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS)
        } else {
            (
                target,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            )
        };
        let ptr = unsafe {
            libc::mmap(
                hint as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        self.state.borrow_mut().mappings.insert(ptr as u64, len);
        Ok(ptr as u64)
    }

    fn munmap(&self, addr: u64, len: usize) -> io::Result<()> {
        let ret = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        self.state.borrow_mut().mappings.remove(&addr);
        Ok(())
    }
}
