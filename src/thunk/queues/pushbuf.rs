#![allow(clippy::cast_possible_truncation)]

use crate::config::GpuLayout;
use crate::error::{NvError, NvResult};
use crate::thunk::queues::qmd::{LaunchParams, QMD_WORDS, Qmd};

// ===============================================================================================
// Methods (NVC6C0 compute class)
// ===============================================================================================

/// Subchannel the compute object is bound to.
pub const COMPUTE_SUBCHANNEL: u32 = 1;

pub const NVC6C0_OFFSET_OUT_UPPER: u32 = 0x0188;
pub const NVC6C0_LINE_LENGTH_IN: u32 = 0x0180;
pub const NVC6C0_LAUNCH_DMA: u32 = 0x01B0;
pub const NVC6C0_LOAD_INLINE_DATA: u32 = 0x01B4;
pub const NVC6C0_SET_SHADER_SHARED_MEMORY_WINDOW_A: u32 = 0x02A0;
pub const NVC6C0_SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_A: u32 = 0x02E4;
pub const NVC6C0_SET_INLINE_QMD_ADDRESS_A: u32 = 0x0318;
pub const NVC6C0_LOAD_INLINE_QMD_DATA: u32 = 0x0320;

/// `LAUNCH_DMA`: pitch destination, no semaphore, system-wide flush.
const LAUNCH_DMA_INLINE: u32 = 0x41;
const SHARED_MEMORY_WINDOW: u64 = 0x0000_7FFF_F400_0000;
const LOCAL_MEMORY_NON_THROTTLED: u64 = 0x004B_0000;

const MAX_COUNT: u32 = 0x1FFF;
const MAX_SUBCHANNEL: u32 = 7;
const MAX_METHOD: u32 = 0x3FFC;

// ===============================================================================================
// Packet Headers
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    /// One method, payload words go to consecutive methods.
    Incrementing = 1,
    /// One method, first payload word to it and the rest to the same method.
    OneIncrement = 5,
}

impl Opcode {
    const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Incrementing),
            5 => Some(Self::OneIncrement),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: Opcode,
    pub count: u32,
    pub subchannel: u32,
    pub method: u32,
}

impl PacketHeader {
    /// # Errors
    /// `InvalidArgument` if a field is out of range or `method` is not 4-aligned.
    pub fn new(opcode: Opcode, count: u32, subchannel: u32, method: u32) -> NvResult<Self> {
        if count > MAX_COUNT || subchannel > MAX_SUBCHANNEL || method > MAX_METHOD || method % 4 != 0
        {
            return Err(NvError::InvalidArgument(format!(
                "packet header out of range: count {count}, subchannel {subchannel}, method 0x{method:x}"
            )));
        }
        Ok(Self {
            opcode,
            count,
            subchannel,
            method,
        })
    }

    #[must_use]
    pub const fn encode(&self) -> u32 {
        ((self.opcode as u32) << 29) | (self.count << 16) | (self.subchannel << 13) | (self.method >> 2)
    }

    /// Inverse of [`PacketHeader::encode`]; `None` for words no valid header encodes to.
    #[must_use]
    pub const fn decode(word: u32) -> Option<Self> {
        let Some(opcode) = Opcode::from_tag(word >> 29) else {
            return None;
        };
        if word & (1 << 12) != 0 {
            return None;
        }
        Some(Self {
            opcode,
            count: (word >> 16) & MAX_COUNT,
            subchannel: (word >> 13) & MAX_SUBCHANNEL,
            method: (word & 0xFFF) << 2,
        })
    }
}

// ===============================================================================================
// Push Buffer
// ===============================================================================================

/// A command stream assembled on the host and copied into the channel's ring
/// region at submission.
///
/// Every emitter checks the whole packet against the remaining capacity before
/// writing anything, so a failed call leaves the buffer unchanged.
#[derive(Debug, Clone)]
pub struct PushBuffer {
    base: u64,
    cmdq_offset: u64,
    words: Vec<u32>,
    capacity: usize,
}

impl PushBuffer {
    #[must_use]
    pub fn new(layout: &GpuLayout) -> Self {
        Self {
            base: layout.pushbuf_base,
            cmdq_offset: layout.cmdq_offset,
            words: Vec::new(),
            capacity: (layout.cmdq_capacity() / 4) as usize,
        }
    }

    /// GPU address of the push buffer region. Data targets are usually placed
    /// relative to it.
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// GPU address the command words are copied to.
    #[must_use]
    pub const fn cmdq_address(&self) -> u64 {
        self.base + self.cmdq_offset
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.words.clear();
    }

    fn reserve(&self, words: usize) -> NvResult<()> {
        if self.words.len() + words > self.capacity {
            return Err(NvError::InvalidArgument(format!(
                "push buffer full: {} of {} words used, {words} more requested",
                self.words.len(),
                self.capacity
            )));
        }
        Ok(())
    }

    fn begin(&mut self, opcode: Opcode, subchannel: u32, method: u32, count: u32) -> NvResult<()> {
        let header = PacketHeader::new(opcode, count, subchannel, method)?;
        self.words.push(header.encode());
        Ok(())
    }

    fn push_hl(&mut self, value: u64) {
        self.words.push((value >> 32) as u32);
        self.words.push(value as u32);
    }

    /// Writes a 64-bit state value to a method pair, high word first.
    ///
    /// # Errors
    /// `InvalidArgument` for an invalid header or when the buffer is full.
    pub fn set_state(&mut self, subchannel: u32, method: u32, value: u64) -> NvResult<()> {
        PacketHeader::new(Opcode::Incrementing, 2, subchannel, method)?;
        self.reserve(3)?;
        self.begin(Opcode::Incrementing, subchannel, method, 2)?;
        self.push_hl(value);
        Ok(())
    }

    /// Shared-memory window and local-memory throttling, programmed once before
    /// the first launch.
    ///
    /// # Errors
    /// `InvalidArgument` when the buffer is full.
    pub fn gpu_setup(&mut self) -> NvResult<()> {
        self.reserve(6)?;
        self.set_state(
            COMPUTE_SUBCHANNEL,
            NVC6C0_SET_SHADER_SHARED_MEMORY_WINDOW_A,
            SHARED_MEMORY_WINDOW,
        )?;
        self.set_state(
            COMPUTE_SUBCHANNEL,
            NVC6C0_SET_SHADER_LOCAL_MEMORY_NON_THROTTLED_A,
            LOCAL_MEMORY_NON_THROTTLED,
        )
    }

    /// Inline copy of `data` to GPU address `dest` through the compute engine's
    /// inline-to-memory path.
    ///
    /// Payloads longer than one packet can carry are split into consecutive
    /// copies.
    ///
    /// # Errors
    /// `InvalidArgument` if `data` is empty or not a whole number of words, or
    /// when the buffer is full.
    pub fn memcpy(&mut self, dest: u64, data: &[u8]) -> NvResult<()> {
        if data.is_empty() || data.len() % 4 != 0 {
            return Err(NvError::InvalidArgument(format!(
                "inline copy of {} bytes is not a nonzero multiple of 4",
                data.len()
            )));
        }

        let chunk_bytes = MAX_COUNT as usize * 4;
        let chunks = data.len().div_ceil(chunk_bytes);
        self.reserve(data.len() / 4 + chunks * 9)?;

        for (i, chunk) in data.chunks(chunk_bytes).enumerate() {
            let words = (chunk.len() / 4) as u32;
            let dest = dest + (i * chunk_bytes) as u64;

            self.begin(Opcode::Incrementing, COMPUTE_SUBCHANNEL, NVC6C0_OFFSET_OUT_UPPER, 2)?;
            self.push_hl(dest);

            self.begin(Opcode::Incrementing, COMPUTE_SUBCHANNEL, NVC6C0_LINE_LENGTH_IN, 2)?;
            self.words.push(chunk.len() as u32);
            self.words.push(1); // LINE_COUNT

            self.begin(Opcode::Incrementing, COMPUTE_SUBCHANNEL, NVC6C0_LAUNCH_DMA, 1)?;
            self.words.push(LAUNCH_DMA_INLINE);

            self.begin(Opcode::OneIncrement, COMPUTE_SUBCHANNEL, NVC6C0_LOAD_INLINE_DATA, words)?;
            self.words.extend(
                chunk
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]])),
            );
        }
        Ok(())
    }

    /// Launches `program` with a single-thread grid, constant buffer 0 at
    /// `constants`, the descriptor itself stored at `qmd_address`.
    ///
    /// # Errors
    /// `InvalidArgument` if an address does not fit the descriptor or the buffer
    /// is full.
    pub fn launch_compute(
        &mut self,
        qmd_address: u64,
        program: u64,
        constants: u64,
        constants_len: u32,
    ) -> NvResult<()> {
        let qmd = Qmd::compute(program, constants, constants_len, &LaunchParams::default())?;
        self.launch_qmd(qmd_address, &qmd)
    }

    /// Sends `qmd` inline and triggers the launch.
    ///
    /// # Errors
    /// `InvalidArgument` when the buffer is full.
    pub fn launch_qmd(&mut self, qmd_address: u64, qmd: &Qmd) -> NvResult<()> {
        self.reserve(3 + 1 + QMD_WORDS)?;
        self.set_state(COMPUTE_SUBCHANNEL, NVC6C0_SET_INLINE_QMD_ADDRESS_A, qmd_address >> 8)?;
        self.begin(
            Opcode::Incrementing,
            COMPUTE_SUBCHANNEL,
            NVC6C0_LOAD_INLINE_QMD_DATA,
            QMD_WORDS as u32,
        )?;
        self.words.extend_from_slice(qmd.words());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push() -> PushBuffer {
        PushBuffer::new(&GpuLayout::default())
    }

    #[test]
    fn header_constants() {
        let sq = PacketHeader::new(Opcode::Incrementing, 2, 1, NVC6C0_OFFSET_OUT_UPPER).unwrap();
        assert_eq!(sq.encode(), 0x2000_0000 | (2 << 16) | (1 << 13) | (0x188 >> 2));
        let one = PacketHeader::new(Opcode::OneIncrement, 1, 1, NVC6C0_LOAD_INLINE_DATA).unwrap();
        assert_eq!(one.encode() & 0xE000_0000, 0xA000_0000);
    }

    #[test]
    fn header_rejects_out_of_range_fields() {
        assert!(PacketHeader::new(Opcode::Incrementing, 0x2000, 0, 0).is_err());
        assert!(PacketHeader::new(Opcode::Incrementing, 1, 8, 0).is_err());
        assert!(PacketHeader::new(Opcode::Incrementing, 1, 0, 0x4000).is_err());
        assert!(PacketHeader::new(Opcode::Incrementing, 1, 0, 0x182).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcodes() {
        assert_eq!(PacketHeader::decode(0x4000_0000), None);
        assert_eq!(PacketHeader::decode(0x2000_1000), None);
    }

    #[test]
    fn set_state_is_high_word_first() {
        let mut p = push();
        p.set_state(1, NVC6C0_SET_SHADER_SHARED_MEMORY_WINDOW_A, 0x0000_7FFF_F400_0000)
            .unwrap();
        let w = p.words();
        assert_eq!(w.len(), 3);
        let header = PacketHeader::decode(w[0]).unwrap();
        assert_eq!(header.count, 2);
        assert_eq!(header.method, 0x2a0);
        assert_eq!(&w[1..], &[0x7FFF, 0xF400_0000]);
    }

    #[test]
    fn gpu_setup_emits_two_state_packets() {
        let mut p = push();
        p.gpu_setup().unwrap();
        let w = p.words();
        assert_eq!(w.len(), 6);
        assert_eq!(PacketHeader::decode(w[3]).unwrap().method, 0x2e4);
        assert_eq!(&w[4..], &[0, 0x004B_0000]);
    }

    #[test]
    fn four_byte_copy_layout() {
        let mut p = push();
        let dest = p.base() + 4;
        p.memcpy(dest, &[0xaa, 0xbb, 0xcc, 0xdd]).unwrap();
        let w = p.words();
        assert_eq!(w.len(), 10);

        assert_eq!(PacketHeader::decode(w[0]).unwrap().method, NVC6C0_OFFSET_OUT_UPPER);
        assert_eq!((w[1], w[2]), (2, 0x0050_0004));
        assert_eq!(PacketHeader::decode(w[3]).unwrap().method, NVC6C0_LINE_LENGTH_IN);
        assert_eq!((w[4], w[5]), (4, 1));
        assert_eq!(PacketHeader::decode(w[6]).unwrap().method, NVC6C0_LAUNCH_DMA);
        assert_eq!(w[7], 0x41);

        let inline = PacketHeader::decode(w[8]).unwrap();
        assert_eq!(inline.opcode, Opcode::OneIncrement);
        assert_eq!(inline.count, 1);
        assert_eq!(w[9], 0xddcc_bbaa);
    }

    #[test]
    fn ragged_copy_is_rejected_before_emitting() {
        let mut p = push();
        p.gpu_setup().unwrap();
        let err = p.memcpy(p.base(), &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, NvError::InvalidArgument(_)));
        assert_eq!(p.len(), 6);
    }

    #[test]
    fn long_copy_is_split() {
        let mut p = push();
        let data = vec![0u8; (MAX_COUNT as usize + 1) * 4];
        p.memcpy(0x1000, &data).unwrap();
        assert_eq!(p.len(), 9 + MAX_COUNT as usize + 9 + 1);
        let second = &p.words()[9 + MAX_COUNT as usize..];
        assert_eq!(second[2], 0x1000 + MAX_COUNT * 4);
        assert_eq!(PacketHeader::decode(second[8]).unwrap().count, 1);
    }

    #[test]
    fn launch_inlines_the_descriptor() {
        let mut p = push();
        let base = p.base();
        p.launch_compute(base + 0x4000, base + 0x1000, base + 0x2000, 0x170)
            .unwrap();
        let w = p.words();
        assert_eq!(w.len(), 3 + 1 + 64);
        assert_eq!(PacketHeader::decode(w[0]).unwrap().method, NVC6C0_SET_INLINE_QMD_ADDRESS_A);
        assert_eq!((w[1], w[2]), (0, ((base + 0x4000) >> 8) as u32));

        let load = PacketHeader::decode(w[3]).unwrap();
        assert_eq!(load.method, NVC6C0_LOAD_INLINE_QMD_DATA);
        assert_eq!(load.count, 64);
        assert_eq!(w[4 + 48], (base + 0x1000) as u32);
    }

    #[test]
    fn overflow_leaves_the_buffer_untouched() {
        let layout = GpuLayout {
            control_len: 0x10_6000 + 16,
            ..GpuLayout::default()
        };
        let mut p = PushBuffer::new(&layout);
        assert_eq!(p.capacity(), 4);
        p.set_state(1, 0x2a0, 1).unwrap();
        assert!(p.set_state(1, 0x2a0, 1).is_err());
        assert_eq!(p.len(), 3);
        p.reset();
        assert!(p.is_empty());
    }
}
