#![allow(clippy::cast_possible_truncation)]

use crate::config::{GpuConfig, GpuLayout};
use crate::error::{NvError, NvResult};
use crate::thunk::memory::MmioRegion;
use crate::thunk::queues::pushbuf::PushBuffer;
use crate::utils::hexdump;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, enabled, trace, Level};

const ENTRY_LENGTH_SHIFT: u32 = 42;
const ENTRY_LENGTH_MAX: u64 = (1 << 21) - 1;
/// GET plus GET_HI: 40 address bits. Bit 40 is the PRIV flag.
const ENTRY_ADDRESS_LIMIT: u64 = 1 << 40;
/// Bit 41 of a GPFIFO entry. Set on every entry this crate writes.
const ENTRY_FLAG: u64 = 1 << 41;
const GPFIFO_ENTRY_SIZE: u64 = 8;

/// Encodes a GPFIFO entry pointing at `words` command words at `address`.
///
/// # Errors
/// `InvalidArgument` if `address` is unaligned or does not fit in 40 bits, or
/// `words` exceeds the 21-bit length field.
pub fn ring_entry(address: u64, words: u64) -> NvResult<u64> {
    if address >= ENTRY_ADDRESS_LIMIT || address % 4 != 0 {
        return Err(NvError::InvalidArgument(format!(
            "push buffer address 0x{address:x} is unaligned or above 40 bits"
        )));
    }
    if words == 0 || words > ENTRY_LENGTH_MAX {
        return Err(NvError::InvalidArgument(format!(
            "push segment of {words} words does not fit a GPFIFO entry"
        )));
    }
    Ok(address | (words << ENTRY_LENGTH_SHIFT) | ENTRY_FLAG)
}

// ===============================================================================================
// Channel Control Block
// ===============================================================================================

/// Host-side view of a channel's GPFIFO ring and USERD put pointer.
///
/// Entries are written from slot 0 upward; the ring does not wrap.
#[derive(Debug, Clone)]
pub struct ControlBlock {
    layout: GpuLayout,
    put: u32,
}

impl ControlBlock {
    #[must_use]
    pub const fn new(layout: GpuLayout) -> Self {
        Self { layout, put: 0 }
    }

    /// Number of entries written so far, equal to the last GP_PUT value.
    #[must_use]
    pub const fn put(&self) -> u32 {
        self.put
    }

    const fn completion_offset(&self) -> usize {
        (self.layout.userd_offset + self.layout.gp_get_offset) as usize
    }

    /// Writes `entry` into the next ring slot, then publishes the new GP_PUT.
    ///
    /// # Errors
    /// `InvalidState` once every slot has been used.
    pub fn push_entry(&mut self, control: &MmioRegion<'_>, entry: u64) -> NvResult<u32> {
        if self.put >= self.layout.gpfifo_entries {
            return Err(NvError::InvalidState(format!(
                "GPFIFO ring exhausted after {} entries",
                self.put
            )));
        }
        let slot = self.layout.gpfifo_offset + u64::from(self.put) * GPFIFO_ENTRY_SIZE;
        control.write64(slot as usize, entry);

        self.put += 1;
        let gp_put = (self.layout.userd_offset + self.layout.gp_put_offset) as usize;
        control.write32(gp_put, self.put);
        Ok(self.put)
    }

    pub fn clear_completion(&self, control: &MmioRegion<'_>) {
        control.write32(self.completion_offset(), 0);
    }

    #[must_use]
    pub fn completion(&self, control: &MmioRegion<'_>) -> u32 {
        control.read32(self.completion_offset())
    }
}

// ===============================================================================================
// Submission
// ===============================================================================================

/// Copies `push` into the ring region, queues it, and rings the doorbell with
/// `token`. The push buffer is emptied on success.
///
/// Returns the new GP_PUT value.
///
/// # Errors
/// `InvalidArgument` for an empty push buffer or one that does not lie inside
/// `control`; `InvalidState` if the ring is exhausted.
pub fn submit_to(
    control: &MmioRegion<'_>,
    doorbell: &MmioRegion<'_>,
    block: &mut ControlBlock,
    token: u32,
    push: &mut PushBuffer,
) -> NvResult<u32> {
    if push.is_empty() {
        return Err(NvError::InvalidArgument("nothing to submit".into()));
    }

    let layout = block.layout;
    let bytes: &[u8] = bytemuck::cast_slice(push.words());
    let offset = push
        .cmdq_address()
        .checked_sub(layout.control_base)
        .map(|o| o as usize)
        .filter(|o| o.checked_add(bytes.len()).is_some_and(|end| end <= control.len()))
        .ok_or_else(|| {
            NvError::InvalidArgument(format!(
                "push buffer at 0x{:x} lies outside the control region",
                push.cmdq_address()
            ))
        })?;
    let entry = ring_entry(push.cmdq_address(), push.len() as u64)?;
    if block.put >= layout.gpfifo_entries {
        return Err(NvError::InvalidState(format!(
            "GPFIFO ring exhausted after {} entries",
            block.put
        )));
    }

    control.write_bytes(offset, bytes);
    if enabled!(Level::TRACE) {
        trace!("push buffer at 0x{:x}:\n{}", push.cmdq_address(), hexdump(bytes));
    }

    block.clear_completion(control);
    let put = block.push_entry(control, entry)?;
    doorbell.write32(layout.doorbell_offset as usize, token);

    debug!(
        words = push.len(),
        entry = format_args!("0x{entry:016x}"),
        put,
        token = format_args!("0x{token:x}"),
        "submitted"
    );
    push.reset();
    Ok(put)
}

// ===============================================================================================
// Completion
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from_config(&GpuConfig::default())
    }
}

impl PollOptions {
    #[must_use]
    pub const fn from_config(config: &GpuConfig) -> Self {
        Self {
            interval: config.poll_interval,
            timeout: config.submit_timeout,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// The nonzero completion word and how long it took to appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStatus {
    pub value: u32,
    pub elapsed: Duration,
}

/// Polls the 32-bit word at `offset` until it becomes nonzero.
///
/// # Errors
/// `SubmissionTimeout` once `options.timeout` has passed. The last sleep is
/// clipped to the remaining time, so the wait never exceeds the timeout by more
/// than one interval.
pub fn poll_completion(
    control: &MmioRegion<'_>,
    offset: usize,
    options: PollOptions,
) -> NvResult<CompletionStatus> {
    let start = Instant::now();
    loop {
        let value = control.read32(offset);
        let elapsed = start.elapsed();
        if value != 0 {
            return Ok(CompletionStatus { value, elapsed });
        }
        if elapsed >= options.timeout {
            return Err(NvError::SubmissionTimeout { waited: elapsed });
        }
        thread::sleep(options.interval.min(options.timeout - elapsed));
    }
}
