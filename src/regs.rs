//! AR934x audio clock and stereo controller register map.
//!
//! Three register groups are involved: the audio PLL pair in the SoC PLL
//! block, the audio DPLL tuning registers in the SRIF block, and the stereo
//! controller block. Each group is guarded by its own driver above; nothing
//! here takes locks.

use core::ptr;

/// Physical base of the SoC PLL block.
pub const PLL_BLOCK_BASE: u32 = 0x1805_0000;
/// Physical base of the audio DPLL registers in the SRIF block.
pub const AUDIO_DPLL_BASE: u32 = 0x1811_6200;
/// Physical base of the stereo controller block.
pub const STEREO_BLOCK_BASE: u32 = 0x180b_0000;

/// Register selector covering the three audio register groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Reg {
    /// AUDIO_PLL_CONFIG: structural dividers, bypass and power bits.
    PllConfig,
    /// AUDIO_PLL_MODULATION: integer and fractional target divider.
    PllModulation,
    /// AUDIO_DPLL2: loop gains and range latch.
    Dpll2,
    /// AUDIO_DPLL3: phase shift, measurement trigger, deviation readback.
    Dpll3,
    /// AUDIO_DPLL4: measurement status.
    Dpll4,
    /// STEREO_CONFIG: enables, word-size codes, posedge, soft reset.
    StereoConfig,
}

/// Register group a selector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Group {
    Pll,
    Dpll,
    Stereo,
}

impl Reg {
    /// Group this register belongs to.
    pub const fn group(self) -> Group {
        match self {
            Reg::PllConfig | Reg::PllModulation => Group::Pll,
            Reg::Dpll2 | Reg::Dpll3 | Reg::Dpll4 => Group::Dpll,
            Reg::StereoConfig => Group::Stereo,
        }
    }

    /// Byte offset within the group's block.
    pub const fn offset(self) -> u32 {
        match self {
            Reg::PllConfig => 0x30,
            Reg::PllModulation => 0x34,
            Reg::Dpll2 => 0x04,
            Reg::Dpll3 => 0x08,
            Reg::Dpll4 => 0x0c,
            Reg::StereoConfig => 0x00,
        }
    }
}

/// Word access to the audio register file.
///
/// The drivers are generic over this so they can run against the real
/// memory-mapped blocks or a scripted stand-in on the host.
pub trait RegisterFile {
    fn read(&mut self, reg: Reg) -> u32;
    fn write(&mut self, reg: Reg, value: u32);

    /// Read-modify-write.
    fn modify<F: FnOnce(u32) -> u32>(&mut self, reg: Reg, f: F) {
        let v = self.read(reg);
        self.write(reg, f(v));
    }
}

/// AUDIO_PLL_CONFIG fields.
pub mod pll_config {
    pub const REFDIV_MASK: u32 = 0xf;
    pub const REFDIV_SHIFT: u32 = 0;
    /// Bypass the PLL, passing the reference clock through.
    pub const BYPASS: u32 = 1 << 4;
    /// Hold the PLL in power-down. Set means powered down.
    pub const PLLPWD: u32 = 1 << 5;
    /// Post-divider power-down select.
    pub const POSTPLLPWD_MASK: u32 = 0x7;
    pub const POSTPLLPWD_SHIFT: u32 = 7;
    pub const EXT_DIV_MASK: u32 = 0x7;
    pub const EXT_DIV_SHIFT: u32 = 12;
}

/// AUDIO_PLL_MODULATION fields.
pub mod pll_mod {
    pub const TGT_DIV_INT_MASK: u32 = 0x3f;
    pub const TGT_DIV_INT_SHIFT: u32 = 1;
    /// 18-bit fractional part of the target divider.
    pub const TGT_DIV_FRAC_MASK: u32 = 0x3ffff;
    pub const TGT_DIV_FRAC_SHIFT: u32 = 11;
}

/// AUDIO_DPLL2 fields.
pub mod dpll2 {
    /// Frequency range latch. Toggled off then on when retuning.
    pub const RANGE: u32 = 1 << 31;
    pub const KI_MASK: u32 = 0xf;
    pub const KI_SHIFT: u32 = 26;
    pub const KD_MASK: u32 = 0x7f;
    pub const KD_SHIFT: u32 = 19;
}

/// AUDIO_DPLL3 fields.
pub mod dpll3 {
    /// Start a lock-quality measurement.
    pub const DO_MEAS: u32 = 1 << 30;
    pub const PHASE_SHIFT_MASK: u32 = 0x7f;
    pub const PHASE_SHIFT_SHIFT: u32 = 23;
    /// Squared-sum deviation of the last measurement.
    pub const SQSUM_DVC_MASK: u32 = 0xf_ffff;
    pub const SQSUM_DVC_SHIFT: u32 = 3;
}

/// AUDIO_DPLL4 fields.
pub mod dpll4 {
    /// Measurement complete.
    pub const MEAS_DONE: u32 = 1 << 3;
}

/// STEREO_CONFIG fields.
pub mod stereo_config {
    /// MCLK-to-sampling-edge divisor.
    pub const POSEDGE_MASK: u32 = 0xff;
    pub const POSEDGE_SHIFT: u32 = 0;
    /// Data word size code, one of `DATA_WORD_*`.
    pub const DATA_WORD_SIZE_MASK: u32 = 0x3;
    pub const DATA_WORD_SIZE_SHIFT: u32 = 12;
    pub const DATA_WORD_8: u32 = 0;
    pub const DATA_WORD_16: u32 = 1;
    pub const DATA_WORD_24: u32 = 2;
    pub const DATA_WORD_32: u32 = 3;
    /// Swap sample byte order (little-endian data in memory).
    pub const PCM_SWAP: u32 = 1 << 14;
    /// 32-bit serial (I2S) word slot.
    pub const I2S_WORD_SIZE: u32 = 1 << 15;
    /// 32-bit mic word slot.
    pub const MIC_WORD_SIZE: u32 = 1 << 16;
    /// Clear the sample counters when the block is enabled.
    pub const SAMPLE_CNT_CLEAR_TYPE: u32 = 1 << 17;
    /// Block drives the bit and frame clocks.
    pub const MASTER: u32 = 1 << 18;
    /// Self-clearing soft reset.
    pub const RESET: u32 = 1 << 19;
    pub const I2S_ENABLE: u32 = 1 << 21;
    /// Run from the externally supplied MCLK instead of the audio PLL.
    pub const MCK_SEL: u32 = 1 << 22;
    pub const SPDIF_ENABLE: u32 = 1 << 23;
}

/// Memory-mapped register file over the three audio register blocks.
///
/// Copyable, so the PLL and stereo drivers can each hold an accessor over
/// their own group.
#[derive(Clone, Copy)]
pub struct Mmio {
    pll: *mut u32,
    dpll: *mut u32,
    stereo: *mut u32,
}

unsafe impl Send for Mmio {}

impl Mmio {
    /// Create an accessor over the given block base pointers.
    ///
    /// Typical bases are [`PLL_BLOCK_BASE`], [`AUDIO_DPLL_BASE`] and
    /// [`STEREO_BLOCK_BASE`], translated through whatever uncached mapping
    /// the platform uses (KSEG1 on MIPS).
    ///
    /// # Safety
    ///
    /// The pointers must be valid, word-aligned uncached mappings of the PLL
    /// block, the audio DPLL registers and the stereo controller block, and
    /// nothing else may access those registers while this accessor is alive.
    pub const unsafe fn new(pll: *mut u32, dpll: *mut u32, stereo: *mut u32) -> Self {
        Self { pll, dpll, stereo }
    }

    fn ptr(&self, reg: Reg) -> *mut u32 {
        let base = match reg.group() {
            Group::Pll => self.pll,
            Group::Dpll => self.dpll,
            Group::Stereo => self.stereo,
        };
        // All offsets are word aligned.
        unsafe { base.add(reg.offset() as usize / 4) }
    }
}

impl RegisterFile for Mmio {
    fn read(&mut self, reg: Reg) -> u32 {
        unsafe { ptr::read_volatile(self.ptr(reg)) }
    }

    fn write(&mut self, reg: Reg, value: u32) {
        unsafe { ptr::write_volatile(self.ptr(reg), value) }
    }
}
