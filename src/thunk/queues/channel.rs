#![allow(clippy::cast_possible_truncation)]

use crate::error::{NvError, NvResult};
use crate::nv::ioctl::{
    AMPERE_CHANNEL_GPFIFO_A, AMPERE_COMPUTE_B, FERMI_CONTEXT_SHARE_A, Handle,
    KEPLER_CHANNEL_GROUP_A, NV_CTXSHARE_ALLOCATION_FLAGS_SUBCONTEXT_ASYNC, NV_MAX_SUBDEVICES,
    NV_WORK_SUBMIT_TOKEN_INVALID, NV2080_ENGINE_TYPE_GRAPHICS, NVA06C_CTRL_CMD_GPFIFO_SCHEDULE,
    NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN, NvChannelAllocParams,
    NvChannelGroupAllocationParameters, NvCtxshareAllocationParameters,
    Nva06cCtrlGpfifoScheduleParams, Nvc36fCtrlGpfifoGetWorkSubmitTokenParams,
};
use crate::thunk::context::DeviceContext;
use crate::thunk::memory::{Allocation, HeapRequest};
use crate::thunk::queues::pushbuf::PushBuffer;
use crate::thunk::queues::submit::{
    CompletionStatus, ControlBlock, PollOptions, poll_completion, submit_to,
};
use tracing::{debug, info};

/// Handles of the objects backing one channel, parent before child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandles {
    pub group: Handle,
    pub share: Handle,
    pub gpfifo: Handle,
    pub compute: Handle,
}

/// A scheduled GPFIFO channel with a compute engine bound to it.
///
/// The driver objects belong to the [`DeviceContext`] that created the channel
/// and are released with it.
#[derive(Debug)]
pub struct Channel {
    client: Handle,
    handles: ChannelHandles,
    notifier: Allocation,
    token: u32,
    control: ControlBlock,
    completion_offset: usize,
}

pub struct ChannelBuilder<'a> {
    ctx: &'a mut DeviceContext,
    gpfifo_entries: u32,
    engine_type: u32,
}

impl<'a> ChannelBuilder<'a> {
    pub fn new(ctx: &'a mut DeviceContext) -> Self {
        let gpfifo_entries = ctx.config().layout.gpfifo_entries;
        Self {
            ctx,
            gpfifo_entries,
            engine_type: NV2080_ENGINE_TYPE_GRAPHICS,
        }
    }

    #[must_use]
    pub const fn with_gpfifo_entries(mut self, entries: u32) -> Self {
        self.gpfifo_entries = entries;
        self
    }

    #[must_use]
    pub const fn with_engine_type(mut self, engine_type: u32) -> Self {
        self.engine_type = engine_type;
        self
    }

    /// Creates the channel group, context share, GPFIFO and compute objects,
    /// registers the channel with UVM and enables scheduling.
    ///
    /// A context carries at most one channel; its ring and USERD sit at fixed
    /// offsets of the control region.
    ///
    /// # Errors
    /// `InvalidArgument` if the ring does not fit before USERD; `InvalidState` if
    /// the context already created a channel; `AllocationFailure`
    /// for any object or an invalid submission token; `ControlCallFailure` from
    /// UVM; `SchedulingFailure` if the group cannot be enabled.
    pub fn create(self) -> NvResult<Channel> {
        let mut layout = self.ctx.config().layout;
        let ring_end = layout.gpfifo_offset + u64::from(self.gpfifo_entries) * 8;
        if self.gpfifo_entries == 0 || ring_end > layout.userd_offset {
            return Err(NvError::InvalidArgument(format!(
                "{} GPFIFO entries do not fit below USERD at +0x{:x}",
                self.gpfifo_entries, layout.userd_offset
            )));
        }
        layout.gpfifo_entries = self.gpfifo_entries;

        let ctx = self.ctx;
        ctx.claim_channel()?;
        let handles = *ctx.handles();
        let memory = ctx.control_memory().handle;

        let notifier = ctx.heap_alloc(HeapRequest::notifier(
            layout.notifier_base,
            layout.notifier_len,
        ))?;

        let mut group_params = NvChannelGroupAllocationParameters {
            engine_type: self.engine_type,
            ..Default::default()
        };
        let group =
            ctx.alloc_object_with(KEPLER_CHANNEL_GROUP_A, handles.device, &mut group_params)?;

        let mut share_params = NvCtxshareAllocationParameters {
            h_va_space: handles.va_space,
            flags: NV_CTXSHARE_ALLOCATION_FLAGS_SUBCONTEXT_ASYNC,
            subctx_id: 0,
        };
        let share = ctx.alloc_object_with(FERMI_CONTEXT_SHARE_A, group, &mut share_params)?;

        let mut userd_memory = [Handle::NULL; NV_MAX_SUBDEVICES];
        userd_memory[0] = memory;
        let mut userd_offset = [0u64; NV_MAX_SUBDEVICES];
        userd_offset[0] = layout.userd_offset;
        let mut gpfifo_params = NvChannelAllocParams {
            h_object_error: notifier.handle,
            h_object_buffer: memory,
            gp_fifo_offset: layout.gpfifo_address(),
            gp_fifo_entries: self.gpfifo_entries,
            h_context_share: share,
            h_userd_memory: userd_memory,
            userd_offset,
            ..Default::default()
        };
        let gpfifo =
            ctx.alloc_object_with(AMPERE_CHANNEL_GPFIFO_A, group, &mut gpfifo_params)?;
        let compute = ctx.alloc_object(AMPERE_COMPUTE_B, gpfifo)?;

        let mut token_params = Nvc36fCtrlGpfifoGetWorkSubmitTokenParams {
            work_submit_token: NV_WORK_SUBMIT_TOKEN_INVALID,
        };
        ctx.control(
            gpfifo,
            NVC36F_CTRL_CMD_GPFIFO_GET_WORK_SUBMIT_TOKEN,
            &mut token_params,
        )?;
        let token = token_params.work_submit_token;
        if token == NV_WORK_SUBMIT_TOKEN_INVALID {
            return Err(NvError::AllocationFailure(format!(
                "channel {gpfifo}: driver returned no work submit token"
            )));
        }

        let root = handles.root;
        ctx.uvm_mut()
            .register_channel(root, gpfifo, layout.channel_uvm_base, layout.channel_uvm_len)?;

        let mut schedule = Nva06cCtrlGpfifoScheduleParams {
            b_enable: 1,
            b_skip_submit: 0,
        };
        ctx.control(group, NVA06C_CTRL_CMD_GPFIFO_SCHEDULE, &mut schedule)
            .map_err(|e| NvError::SchedulingFailure(format!("channel group {group}: {e}")))?;

        let channel_handles = ChannelHandles {
            group,
            share,
            gpfifo,
            compute,
        };
        debug!(?channel_handles, "channel objects allocated");
        info!(%gpfifo, token = format_args!("0x{token:x}"), "channel scheduled");

        Ok(Channel {
            client: root,
            handles: channel_handles,
            notifier,
            token,
            control: ControlBlock::new(layout),
            completion_offset: (layout.userd_offset + layout.gp_get_offset) as usize,
        })
    }
}

impl Channel {
    #[must_use]
    pub const fn handles(&self) -> &ChannelHandles {
        &self.handles
    }

    /// Value written to the doorbell to wake this channel.
    #[must_use]
    pub const fn token(&self) -> u32 {
        self.token
    }

    #[must_use]
    pub const fn notifier(&self) -> &Allocation {
        &self.notifier
    }

    /// Entries queued so far.
    #[must_use]
    pub const fn put(&self) -> u32 {
        self.control.put()
    }

    fn check_owner(&self, ctx: &DeviceContext) -> NvResult<()> {
        if ctx.handles().root == self.client {
            Ok(())
        } else {
            Err(NvError::InvalidArgument(format!(
                "channel {} belongs to client {}, not {}",
                self.handles.gpfifo,
                self.client,
                ctx.handles().root
            )))
        }
    }

    /// Queues `push` and rings the doorbell. Clears the completion word first.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty push buffer or a foreign context;
    /// `InvalidState` if the ring is exhausted.
    pub fn submit(&mut self, ctx: &DeviceContext, push: &mut PushBuffer) -> NvResult<u32> {
        self.check_owner(ctx)?;
        submit_to(
            &ctx.control_region(),
            &ctx.usermode(),
            &mut self.control,
            self.token,
            push,
        )
    }

    /// Waits for the GPU to consume the last submission.
    ///
    /// # Errors
    /// `SubmissionTimeout` if the completion word stays zero past the timeout.
    pub fn await_completion(
        &self,
        ctx: &DeviceContext,
        options: PollOptions,
    ) -> NvResult<CompletionStatus> {
        self.check_owner(ctx)?;
        let status = poll_completion(&ctx.control_region(), self.completion_offset, options)?;
        debug!(value = status.value, elapsed = ?status.elapsed, "submission completed");
        Ok(status)
    }
}
