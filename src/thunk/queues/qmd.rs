#![allow(clippy::cast_possible_truncation)]

//! Queue metadata descriptor (QMD v03_00) for inline compute launches.
//!
//! The block is 64 little-endian words. Fields are addressed by their absolute
//! bit range within the block, matching the `NVC6C0_QMDV03_00_*` definitions.

use crate::error::{NvError, NvResult};

pub const QMD_WORDS: usize = 64;

/// Bit range `hi:lo` within the 2048-bit block. Fields never straddle a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QmdField {
    pub hi: u32,
    pub lo: u32,
}

impl QmdField {
    const fn new(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    pub const QMD_VERSION: Self = Self::new(579, 576);
    pub const QMD_MAJOR_VERSION: Self = Self::new(583, 580);
    pub const API_VISIBLE_CALL_LIMIT: Self = Self::new(378, 378);
    pub const SAMPLER_INDEX: Self = Self::new(382, 382);
    pub const CTA_RASTER_WIDTH: Self = Self::new(415, 384);
    pub const CTA_RASTER_HEIGHT: Self = Self::new(431, 416);
    pub const CTA_RASTER_DEPTH: Self = Self::new(463, 448);
    pub const SHARED_MEMORY_SIZE: Self = Self::new(561, 544);
    pub const CTA_THREAD_DIMENSION0: Self = Self::new(607, 592);
    pub const CTA_THREAD_DIMENSION1: Self = Self::new(623, 608);
    pub const CTA_THREAD_DIMENSION2: Self = Self::new(639, 624);
    pub const CONSTANT_BUFFER_VALID0: Self = Self::new(640, 640);
    pub const REGISTER_COUNT_V: Self = Self::new(656, 648);
    pub const BARRIER_COUNT: Self = Self::new(661, 657);
    pub const CONSTANT_BUFFER_ADDR_LOWER0: Self = Self::new(1055, 1024);
    pub const CONSTANT_BUFFER_ADDR_UPPER0: Self = Self::new(1072, 1056);
    pub const CONSTANT_BUFFER_SIZE_SHIFTED4_0: Self = Self::new(1087, 1075);
    pub const PROGRAM_ADDRESS_LOWER: Self = Self::new(1567, 1536);
    pub const PROGRAM_ADDRESS_UPPER: Self = Self::new(1584, 1568);

    #[must_use]
    pub const fn width(self) -> u32 {
        self.hi - self.lo + 1
    }

    #[must_use]
    pub const fn mask(self) -> u32 {
        if self.width() == 32 {
            u32::MAX
        } else {
            (1 << self.width()) - 1
        }
    }

    const fn word(self) -> usize {
        (self.lo / 32) as usize
    }

    const fn shift(self) -> u32 {
        self.lo % 32
    }
}

/// Launch geometry and resources for one compute dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchParams {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub shared_memory: u32,
    pub registers: u32,
    pub barriers: u32,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            grid: [1, 1, 1],
            block: [1, 1, 1],
            shared_memory: 0,
            registers: 16,
            barriers: 0,
        }
    }
}

impl LaunchParams {
    #[must_use]
    pub const fn with_grid(mut self, x: u32, y: u32, z: u32) -> Self {
        self.grid = [x, y, z];
        self
    }

    #[must_use]
    pub const fn with_block(mut self, x: u32, y: u32, z: u32) -> Self {
        self.block = [x, y, z];
        self
    }

    #[must_use]
    pub const fn with_shared_memory(mut self, bytes: u32) -> Self {
        self.shared_memory = bytes;
        self
    }

    #[must_use]
    pub const fn with_registers(mut self, count: u32) -> Self {
        self.registers = count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qmd {
    words: [u32; QMD_WORDS],
}

impl Default for Qmd {
    fn default() -> Self {
        Self {
            words: [0; QMD_WORDS],
        }
    }
}

impl Qmd {
    /// Stores `value` into `field`.
    ///
    /// # Errors
    /// `InvalidArgument` if `value` does not fit the field.
    pub fn set(&mut self, field: QmdField, value: u32) -> NvResult<()> {
        if value & !field.mask() != 0 {
            return Err(NvError::InvalidArgument(format!(
                "QMD value 0x{value:x} does not fit bits {}:{}",
                field.hi, field.lo
            )));
        }
        let word = &mut self.words[field.word()];
        *word = (*word & !(field.mask() << field.shift())) | (value << field.shift());
        Ok(())
    }

    #[must_use]
    pub const fn get(&self, field: QmdField) -> u32 {
        (self.words[field.word()] >> field.shift()) & field.mask()
    }

    #[must_use]
    pub const fn words(&self) -> &[u32; QMD_WORDS] {
        &self.words
    }

    /// A v3.0 descriptor launching `program` with constant buffer 0 at
    /// `constants` (`constants_len` bytes).
    ///
    /// # Errors
    /// `InvalidArgument` if an address or launch parameter exceeds its field.
    pub fn compute(
        program: u64,
        constants: u64,
        constants_len: u32,
        launch: &LaunchParams,
    ) -> NvResult<Self> {
        let mut qmd = Self::default();
        qmd.set(QmdField::QMD_MAJOR_VERSION, 3)?;
        qmd.set(QmdField::QMD_VERSION, 0)?;
        qmd.set(QmdField::API_VISIBLE_CALL_LIMIT, 1)?;
        qmd.set(QmdField::SAMPLER_INDEX, 1)?;

        qmd.set(QmdField::CTA_RASTER_WIDTH, launch.grid[0])?;
        qmd.set(QmdField::CTA_RASTER_HEIGHT, launch.grid[1])?;
        qmd.set(QmdField::CTA_RASTER_DEPTH, launch.grid[2])?;
        qmd.set(QmdField::CTA_THREAD_DIMENSION0, launch.block[0])?;
        qmd.set(QmdField::CTA_THREAD_DIMENSION1, launch.block[1])?;
        qmd.set(QmdField::CTA_THREAD_DIMENSION2, launch.block[2])?;
        qmd.set(QmdField::SHARED_MEMORY_SIZE, launch.shared_memory)?;
        qmd.set(QmdField::REGISTER_COUNT_V, launch.registers)?;
        qmd.set(QmdField::BARRIER_COUNT, launch.barriers)?;

        qmd.set(QmdField::CONSTANT_BUFFER_VALID0, 1)?;
        qmd.set(QmdField::CONSTANT_BUFFER_ADDR_LOWER0, constants as u32)?;
        qmd.set(
            QmdField::CONSTANT_BUFFER_ADDR_UPPER0,
            split_upper(constants, QmdField::CONSTANT_BUFFER_ADDR_UPPER0)?,
        )?;
        qmd.set(
            QmdField::CONSTANT_BUFFER_SIZE_SHIFTED4_0,
            constants_len.div_ceil(16),
        )?;

        qmd.set(QmdField::PROGRAM_ADDRESS_LOWER, program as u32)?;
        qmd.set(
            QmdField::PROGRAM_ADDRESS_UPPER,
            split_upper(program, QmdField::PROGRAM_ADDRESS_UPPER)?,
        )?;
        Ok(qmd)
    }
}

fn split_upper(address: u64, field: QmdField) -> NvResult<u32> {
    let upper = address >> 32;
    if upper > u64::from(field.mask()) {
        return Err(NvError::InvalidArgument(format!(
            "address 0x{address:x} exceeds the {}-bit QMD address range",
            32 + field.width()
        )));
    }
    Ok(upper as u32)
}
