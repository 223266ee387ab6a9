//! Unified virtual memory registration.
//!
//! The UVM driver must learn about the GPU, then the GPU's address space, before
//! it will mirror any allocation. [`UvmSession`] enforces that order and undoes
//! every registration when dropped.

use crate::error::{NvError, NvResult, RmStatus};
use crate::nv::codec::StatusBlock;
use crate::nv::device::{ControlChannel, ControlChannelExt, DeviceNode};
use crate::nv::ioctl::{
    Handle, NV_GPU_UUID_LEN, UVM_CREATE_EXTERNAL_RANGE, UVM_FREE,
    UVM_GPU_MAPPING_TYPE_READ_WRITE_ATOMIC, UVM_INITIALIZE, UVM_MAP_EXTERNAL_ALLOCATION,
    UVM_REGISTER_CHANNEL, UVM_REGISTER_GPU, UVM_REGISTER_GPU_VASPACE, UVM_UNREGISTER_CHANNEL,
    UVM_UNREGISTER_GPU, UVM_UNREGISTER_GPU_VASPACE, UvmCreateExternalRangeParams, UvmFreeParams,
    UvmGpuMappingAttributes, UvmInitializeParams, UvmMapExternalAllocationParams,
    UvmRegisterChannelParams, UvmRegisterGpuParams, UvmRegisterGpuVaspaceParams,
    UvmUnregisterChannelParams, UvmUnregisterGpuParams, UvmUnregisterGpuVaspaceParams,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// How far registration has progressed. Stages only advance, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UvmStage {
    Closed,
    Initialized,
    GpuRegistered,
    VaSpaceRegistered,
}

#[derive(Debug, Clone, Copy)]
struct ChannelRegistration {
    client: Handle,
    channel: Handle,
}

#[derive(Debug)]
pub struct UvmSession {
    driver: Arc<dyn ControlChannel>,
    stage: UvmStage,
    gpu_uuid: [u8; NV_GPU_UUID_LEN],
    ranges: Vec<(u64, u64)>,
    channels: Vec<ChannelRegistration>,
}

impl UvmSession {
    #[must_use]
    pub fn new(driver: Arc<dyn ControlChannel>) -> Self {
        Self {
            driver,
            stage: UvmStage::Closed,
            gpu_uuid: [0; NV_GPU_UUID_LEN],
            ranges: Vec::new(),
            channels: Vec::new(),
        }
    }

    #[must_use]
    pub const fn stage(&self) -> UvmStage {
        self.stage
    }

    #[must_use]
    pub const fn gpu_uuid(&self) -> &[u8; NV_GPU_UUID_LEN] {
        &self.gpu_uuid
    }

    fn expect_stage(&self, want: UvmStage, op: &str) -> NvResult<()> {
        if self.stage == want {
            Ok(())
        } else {
            Err(NvError::InvalidState(format!(
                "UVM {op} requires stage {want:?}, session is at {:?}",
                self.stage
            )))
        }
    }

    fn send<T: StatusBlock>(&self, cmd: u32, block: T) -> Result<T, String> {
        let block = self
            .driver
            .call(DeviceNode::Uvm, cmd, block)
            .map_err(|e| e.to_string())?;
        let status = RmStatus(block.status());
        if status.is_ok() {
            Ok(block)
        } else {
            Err(status.to_string())
        }
    }

    /// # Errors
    /// `InvalidState` unless the session is closed; `ControlCallFailure` if the
    /// driver refuses.
    pub fn initialize(&mut self) -> NvResult<()> {
        self.expect_stage(UvmStage::Closed, "initialize")?;
        self.send(UVM_INITIALIZE, UvmInitializeParams::default())
            .map_err(|e| NvError::ControlCallFailure(format!("UVM initialize: {e}")))?;
        self.stage = UvmStage::Initialized;
        debug!("initialized UVM");
        Ok(())
    }

    /// Registers the GPU identified by `uuid`.
    ///
    /// # Errors
    /// `InvalidState` unless the session was just initialized;
    /// `ControlCallFailure` if the driver refuses.
    pub fn register_gpu(&mut self, uuid: [u8; NV_GPU_UUID_LEN]) -> NvResult<()> {
        self.expect_stage(UvmStage::Initialized, "register GPU")?;
        let params = UvmRegisterGpuParams {
            gpu_uuid: uuid,
            rm_ctrl_fd: -1,
            ..Default::default()
        };
        self.send(UVM_REGISTER_GPU, params)
            .map_err(|e| NvError::ControlCallFailure(format!("UVM register GPU: {e}")))?;
        self.gpu_uuid = uuid;
        self.stage = UvmStage::GpuRegistered;
        debug!(uuid = ?uuid, "registered GPU with UVM");
        Ok(())
    }

    /// Registers `va_space`, owned by `client`, as the GPU's address space.
    ///
    /// # Errors
    /// `InvalidState` unless the GPU is registered and the address space is not;
    /// `ControlCallFailure` if the driver refuses.
    pub fn register_gpu_vaspace(&mut self, client: Handle, va_space: Handle) -> NvResult<()> {
        self.expect_stage(UvmStage::GpuRegistered, "register GPU VA space")?;
        let params = UvmRegisterGpuVaspaceParams {
            gpu_uuid: self.gpu_uuid,
            rm_ctrl_fd: self.driver.raw_fd(DeviceNode::Control),
            h_client: client,
            h_va_space: va_space,
            rm_status: 0,
        };
        self.send(UVM_REGISTER_GPU_VASPACE, params)
            .map_err(|e| NvError::ControlCallFailure(format!("UVM register VA space: {e}")))?;
        self.stage = UvmStage::VaSpaceRegistered;
        debug!(%va_space, "registered VA space with UVM");
        Ok(())
    }

    /// Reserves `base..base + length` as an external range.
    ///
    /// # Errors
    /// `InvalidState` before the address space is registered; `MappingFailure` if
    /// the driver refuses.
    pub fn create_external_range(&mut self, base: u64, length: u64) -> NvResult<()> {
        self.expect_stage(UvmStage::VaSpaceRegistered, "create external range")?;
        let params = UvmCreateExternalRangeParams {
            base,
            length,
            ..Default::default()
        };
        self.send(UVM_CREATE_EXTERNAL_RANGE, params).map_err(|e| {
            NvError::MappingFailure(format!("UVM external range 0x{base:x}+0x{length:x}: {e}"))
        })?;
        self.ranges.push((base, length));
        Ok(())
    }

    /// Maps driver memory `memory` into GPU virtual memory at `base`, inside a
    /// range created with [`UvmSession::create_external_range`].
    ///
    /// # Errors
    /// `InvalidState` before the address space is registered; `MappingFailure` if
    /// the driver refuses.
    pub fn map_external_allocation(
        &mut self,
        base: u64,
        length: u64,
        client: Handle,
        memory: Handle,
    ) -> NvResult<()> {
        self.expect_stage(UvmStage::VaSpaceRegistered, "map external allocation")?;
        let mut params = UvmMapExternalAllocationParams {
            base,
            length,
            gpu_attributes_count: 1,
            rm_ctrl_fd: self.driver.raw_fd(DeviceNode::Control),
            h_client: client,
            h_memory: memory,
            ..Default::default()
        };
        params.per_gpu_attributes[0] = UvmGpuMappingAttributes {
            gpu_uuid: self.gpu_uuid,
            gpu_mapping_type: UVM_GPU_MAPPING_TYPE_READ_WRITE_ATOMIC,
            ..Default::default()
        };
        self.send(UVM_MAP_EXTERNAL_ALLOCATION, params).map_err(|e| {
            NvError::MappingFailure(format!("UVM map {memory} at 0x{base:x}: {e}"))
        })?;
        debug!(%memory, base = format_args!("0x{base:x}"), "mapped external allocation");
        Ok(())
    }

    /// Registers a GPFIFO channel and its instance range.
    ///
    /// # Errors
    /// `InvalidState` before the address space is registered; `ControlCallFailure`
    /// if the driver refuses.
    pub fn register_channel(
        &mut self,
        client: Handle,
        channel: Handle,
        base: u64,
        length: u64,
    ) -> NvResult<()> {
        self.expect_stage(UvmStage::VaSpaceRegistered, "register channel")?;
        let params = UvmRegisterChannelParams {
            gpu_uuid: self.gpu_uuid,
            rm_ctrl_fd: self.driver.raw_fd(DeviceNode::Control),
            h_client: client,
            h_channel: channel,
            base,
            length,
            ..Default::default()
        };
        self.send(UVM_REGISTER_CHANNEL, params)
            .map_err(|e| NvError::ControlCallFailure(format!("UVM register {channel}: {e}")))?;
        self.channels.push(ChannelRegistration { client, channel });
        debug!(%channel, "registered channel with UVM");
        Ok(())
    }
}

impl Drop for UvmSession {
    fn drop(&mut self) {
        let channels = std::mem::take(&mut self.channels);
        for reg in channels.iter().rev() {
            let params = UvmUnregisterChannelParams {
                gpu_uuid: self.gpu_uuid,
                h_client: reg.client,
                h_channel: reg.channel,
                rm_status: 0,
            };
            if let Err(e) = self.send(UVM_UNREGISTER_CHANNEL, params) {
                warn!(channel = %reg.channel, error = %e, "failed to unregister channel");
            }
        }

        let ranges = std::mem::take(&mut self.ranges);
        for &(base, length) in ranges.iter().rev() {
            let params = UvmFreeParams {
                base,
                length,
                ..Default::default()
            };
            if let Err(e) = self.send(UVM_FREE, params) {
                warn!(base = format_args!("0x{base:x}"), error = %e, "failed to free external range");
            }
        }

        if self.stage >= UvmStage::VaSpaceRegistered {
            let params = UvmUnregisterGpuVaspaceParams {
                gpu_uuid: self.gpu_uuid,
                rm_status: 0,
            };
            if let Err(e) = self.send(UVM_UNREGISTER_GPU_VASPACE, params) {
                warn!(error = %e, "failed to unregister VA space");
            }
        }

        if self.stage >= UvmStage::GpuRegistered {
            let params = UvmUnregisterGpuParams {
                gpu_uuid: self.gpu_uuid,
                rm_status: 0,
            };
            if let Err(e) = self.send(UVM_UNREGISTER_GPU, params) {
                warn!(error = %e, "failed to unregister GPU");
            }
        }
    }
}
