//! I2S/S-PDIF stereo controller.
//!
//! The AR934x stereo block frames audio data onto the I2S and S/PDIF outputs
//! from a shared master clock. Programming it means picking the MCLK family
//! for the requested sample rate, synthesizing that clock (or trusting an
//! externally supplied one), deriving the sampling-edge divisor, encoding the
//! word format and pulsing the block's soft reset so the new framing takes.
//!
//! Reconfiguration is stream-lifecycle aware: the first direction to start
//! enables the block, the last to stop shuts it down, and a rate or format
//! change is skipped outright while both directions are running so a live
//! playback/capture pair is never disturbed.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;

use crate::pll::{self, AudioPll};
use crate::regs::{stereo_config, Reg, RegisterFile};
use crate::time::Hertz;

/// Sample rates the block is advertised with.
pub const SUPPORTED_RATES: [u32; 7] =
    [22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 192_000];

/// MCLK for the 48 kHz rate family.
pub const MCLK_48K_FAMILY: Hertz = Hertz(24_576_000);
/// MCLK for the 44.1 kHz rate family.
pub const MCLK_44K1_FAMILY: Hertz = Hertz(22_579_200);

/// Stereo controller error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Word size the stereo block cannot encode.
    UnsupportedFormat { word_size: u8 },
    /// MCLK synthesis failed.
    Pll(pll::Error),
}

impl From<pll::Error> for Error {
    fn from(err: pll::Error) -> Self {
        Error::Pll(err)
    }
}

/// Stream direction through the block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    Playback,
    Capture,
}

/// Sample format descriptor: word size in bits plus memory byte order.
///
/// The named constants cover every format the hardware supports; the width is
/// validated in [`format_mask`], so a descriptor built by hand with an odd
/// width is reported rather than misprogrammed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SampleFormat {
    pub word_size: u8,
    pub little_endian: bool,
}

impl SampleFormat {
    pub const S8: Self = Self { word_size: 8, little_endian: false };
    pub const S16_LE: Self = Self { word_size: 16, little_endian: true };
    pub const S16_BE: Self = Self { word_size: 16, little_endian: false };
    pub const S24_LE: Self = Self { word_size: 24, little_endian: true };
    pub const S24_BE: Self = Self { word_size: 24, little_endian: false };
    pub const S32_LE: Self = Self { word_size: 32, little_endian: true };
    pub const S32_BE: Self = Self { word_size: 32, little_endian: false };
}

/// Sample formats the block is advertised with.
pub const SUPPORTED_FORMATS: [SampleFormat; 7] = [
    SampleFormat::S8,
    SampleFormat::S16_LE,
    SampleFormat::S16_BE,
    SampleFormat::S24_LE,
    SampleFormat::S24_BE,
    SampleFormat::S32_LE,
    SampleFormat::S32_BE,
];

/// Stereo config bits owned by the word format. Cleared before each merge so
/// a narrower format does not inherit the wide slots of the one before it.
const FORMAT_FIELDS: u32 = (stereo_config::DATA_WORD_SIZE_MASK
    << stereo_config::DATA_WORD_SIZE_SHIFT)
    | stereo_config::PCM_SWAP
    | stereo_config::I2S_WORD_SIZE
    | stereo_config::MIC_WORD_SIZE;

/// Encode a sample format into the stereo config word-size field group.
///
/// 24 and 32-bit data always requests the wide serial and mic slots; the
/// byte-swap flag covers little-endian data of any multi-byte width.
pub fn format_mask(format: SampleFormat) -> Result<u32, Error> {
    use stereo_config::*;

    let swap = if format.little_endian { PCM_SWAP } else { 0 };
    let mask = match format.word_size {
        8 => DATA_WORD_8 << DATA_WORD_SIZE_SHIFT,
        16 => (DATA_WORD_16 << DATA_WORD_SIZE_SHIFT) | swap,
        24 => (DATA_WORD_24 << DATA_WORD_SIZE_SHIFT) | swap | I2S_WORD_SIZE | MIC_WORD_SIZE,
        32 => (DATA_WORD_32 << DATA_WORD_SIZE_SHIFT) | swap | I2S_WORD_SIZE | MIC_WORD_SIZE,
        word_size => {
            warn!("stereo: no encoding for {} bit samples", word_size);
            return Err(Error::UnsupportedFormat { word_size });
        }
    };
    Ok(mask)
}

/// MCLK family serving a sample rate: multiples of 16 kHz run from the
/// 48 kHz-family clock, everything else from the 44.1 kHz family.
pub const fn mclk_for_rate(rate: u32) -> Hertz {
    if rate % 16_000 == 0 {
        MCLK_48K_FAMILY
    } else {
        MCLK_44K1_FAMILY
    }
}

/// Posedge divisor for a synthesized MCLK: 32 bits per sample, two channels,
/// 2x oversampling.
pub const fn internal_posedge(mclk: Hertz, rate: u32) -> u32 {
    mclk.0 / (rate * 32 * 2 * 2)
}

/// Posedge divisor for an externally supplied MCLK, from the fixed per-rate
/// table. Rates without an entry fall back to 4.
pub fn external_posedge(rate: u32) -> u32 {
    match rate {
        22_050 => 8,
        32_000 => 6,
        44_100 | 48_000 => 4,
        88_200 | 96_000 => 2,
        192_000 => 1,
        _ => {
            warn!("stereo: no posedge entry for {} Hz, falling back to 4", rate);
            4
        }
    }
}

/// Where the stereo block's master clock comes from.
pub enum MclkSource<'d, R: RegisterFile, D: DelayNs> {
    /// MCLK synthesized by the audio PLL; retuned on every rate change.
    AudioPll(&'d AudioPll<R, D>),
    /// MCLK supplied from outside the SoC. The block selects its external
    /// clock input and the PLL is left alone.
    External,
}

/// Stereo controller configuration.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// Keep the block enabled and clocked after the last stream stops, and
    /// bring the clocks up at construction instead of first stream start.
    pub persistent_clocks: bool,
}

/// Stereo controller driver.
///
/// Owns the stereo register group and the per-direction activity flags behind
/// one guard. Clock programming happens outside that guard; the PLL
/// serializes behind its own, so the two are never held together.
pub struct I2s<'d, R: RegisterFile, D: DelayNs, S: RegisterFile> {
    state: Mutex<CriticalSectionRawMutex, RefCell<State<S>>>,
    mclk: MclkSource<'d, R, D>,
    config: Config,
}

struct State<S> {
    regs: S,
    playback: bool,
    capture: bool,
}

impl<'d, R: RegisterFile, D: DelayNs, S: RegisterFile> I2s<'d, R, D, S> {
    /// Create the driver over the stereo register group.
    ///
    /// With [`Config::persistent_clocks`] set, the block is enabled and the
    /// 48 kHz-family clocks are brought up immediately, so MCLK runs before
    /// any stream starts.
    pub fn new(regs: S, mclk: MclkSource<'d, R, D>, config: Config) -> Result<Self, Error> {
        let i2s = Self {
            state: Mutex::new(RefCell::new(State {
                regs,
                playback: false,
                capture: false,
            })),
            mclk,
            config,
        };
        if config.persistent_clocks {
            let posedge = i2s.program_mclk(48_000)?;
            let external = i2s.is_external();
            i2s.with_state(|state| {
                state.enable_block(external);
                state.write_posedge(posedge);
                state.pulse_reset();
            });
        }
        Ok(i2s)
    }

    fn is_external(&self) -> bool {
        matches!(self.mclk, MclkSource::External)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State<S>) -> T) -> T {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    /// Program the master clock for `rate` and return the posedge divisor.
    /// Takes no stereo guard.
    fn program_mclk(&self, rate: u32) -> Result<u32, Error> {
        match &self.mclk {
            MclkSource::AudioPll(pll) => {
                let mclk = mclk_for_rate(rate);
                pll.set_frequency(mclk)?;
                Ok(internal_posedge(mclk, rate))
            }
            MclkSource::External => {
                info!("stereo: external mclk in use, audio pll untouched");
                Ok(external_posedge(rate))
            }
        }
    }

    /// Note a stream starting in `dir`.
    ///
    /// The first direction to become active writes the baseline enable and
    /// pulses reset; a second direction joining a running block changes
    /// nothing.
    pub fn stream_start(&self, dir: Direction) {
        let external = self.is_external();
        self.with_state(|state| {
            let first = !state.playback && !state.capture;
            match dir {
                Direction::Playback => state.playback = true,
                Direction::Capture => state.capture = true,
            }
            if first {
                debug!("stereo: first stream up, enabling block");
                state.enable_block(external);
                state.pulse_reset();
            }
        });
    }

    /// Note a stream stopping in `dir`. When the last direction stops the
    /// block is shut down, unless persistent clocks were requested.
    pub fn stream_stop(&self, dir: Direction) {
        let persistent = self.config.persistent_clocks;
        self.with_state(|state| {
            match dir {
                Direction::Playback => state.playback = false,
                Direction::Capture => state.capture = false,
            }
            if !state.playback && !state.capture && !persistent {
                debug!("stereo: last stream down, disabling block");
                state.regs.write(Reg::StereoConfig, 0);
            }
        });
    }

    /// Reconfigure the block for a sample rate and word format.
    ///
    /// Skipped (successfully) while both directions are running. The format
    /// is validated before any clock work, so an unencodable format leaves
    /// the clocks exactly as they were.
    pub fn hw_params(&self, rate: u32, format: SampleFormat) -> Result<(), Error> {
        if self.with_state(|state| state.playback && state.capture) {
            debug!("stereo: both directions running, keeping current config");
            return Ok(());
        }

        let mask = format_mask(format)?;
        let posedge = self.program_mclk(rate)?;
        debug!(
            "stereo: hw params {} Hz, {} bit, posedge {}",
            rate, format.word_size, posedge
        );

        self.with_state(|state| {
            state.write_posedge(posedge);
            state.merge_format(mask);
            state.pulse_reset();
        });
        Ok(())
    }

    /// Pulse the block's self-clearing soft reset.
    pub fn reset(&self) {
        self.with_state(|state| state.pulse_reset());
    }
}

#[cfg(test)]
impl<'d, R: RegisterFile, D: DelayNs, S: RegisterFile> I2s<'d, R, D, S> {
    pub(crate) fn with_stereo_regs<T>(&self, f: impl FnOnce(&mut S) -> T) -> T {
        self.with_state(|state| f(&mut state.regs))
    }
}

impl<S: RegisterFile> State<S> {
    fn enable_block(&mut self, external_mclk: bool) {
        let mut value = stereo_config::I2S_ENABLE
            | stereo_config::SPDIF_ENABLE
            | stereo_config::SAMPLE_CNT_CLEAR_TYPE
            | stereo_config::MASTER;
        if external_mclk {
            value |= stereo_config::MCK_SEL;
        }
        self.regs.write(Reg::StereoConfig, value);
    }

    fn write_posedge(&mut self, posedge: u32) {
        self.regs.modify(Reg::StereoConfig, |v| {
            (v & !(stereo_config::POSEDGE_MASK << stereo_config::POSEDGE_SHIFT))
                | ((posedge & stereo_config::POSEDGE_MASK) << stereo_config::POSEDGE_SHIFT)
        });
    }

    fn merge_format(&mut self, mask: u32) {
        self.regs.modify(Reg::StereoConfig, |v| (v & !FORMAT_FIELDS) | mask);
    }

    fn pulse_reset(&mut self) {
        self.regs
            .modify(Reg::StereoConfig, |v| v | stereo_config::RESET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{FakeRegs, NoDelay};
    use crate::pll::RefClock;
    use crate::regs::stereo_config as sc;

    fn pll() -> AudioPll<FakeRegs, NoDelay> {
        AudioPll::new(FakeRegs::new(), NoDelay, RefClock::Mhz25, pll::Config::default())
    }

    fn i2s_with_pll<'d>(
        pll: &'d AudioPll<FakeRegs, NoDelay>,
        config: Config,
    ) -> I2s<'d, FakeRegs, NoDelay, FakeRegs> {
        I2s::new(FakeRegs::new(), MclkSource::AudioPll(pll), config).unwrap()
    }

    fn external_i2s(config: Config) -> I2s<'static, FakeRegs, NoDelay, FakeRegs> {
        I2s::new(FakeRegs::new(), MclkSource::External, config).unwrap()
    }

    #[test]
    fn format_mask_16_le_sets_swap() {
        let mask = format_mask(SampleFormat::S16_LE).unwrap();
        assert_eq!(
            mask,
            (sc::DATA_WORD_16 << sc::DATA_WORD_SIZE_SHIFT) | sc::PCM_SWAP
        );
    }

    #[test]
    fn format_mask_24_be_requests_wide_slots() {
        let mask = format_mask(SampleFormat::S24_BE).unwrap();
        assert_eq!(
            mask,
            (sc::DATA_WORD_24 << sc::DATA_WORD_SIZE_SHIFT)
                | sc::I2S_WORD_SIZE
                | sc::MIC_WORD_SIZE
        );
        assert_eq!(mask & sc::PCM_SWAP, 0);
    }

    #[test]
    fn format_mask_8_bit_is_bare_code() {
        assert_eq!(
            format_mask(SampleFormat::S8).unwrap(),
            sc::DATA_WORD_8 << sc::DATA_WORD_SIZE_SHIFT
        );
    }

    #[test]
    fn format_mask_rejects_odd_widths() {
        assert_eq!(
            format_mask(SampleFormat { word_size: 17, little_endian: true }),
            Err(Error::UnsupportedFormat { word_size: 17 })
        );
    }

    #[test]
    fn internal_posedge_for_48k_mclk() {
        assert_eq!(internal_posedge(MCLK_48K_FAMILY, 48_000), 4);
        assert_eq!(internal_posedge(MCLK_48K_FAMILY, 96_000), 2);
        assert_eq!(internal_posedge(MCLK_44K1_FAMILY, 22_050), 8);
    }

    #[test]
    fn external_posedge_table_and_fallback() {
        assert_eq!(external_posedge(44_100), 4);
        assert_eq!(external_posedge(22_050), 8);
        assert_eq!(external_posedge(192_000), 1);
        // Unlisted rate falls back.
        assert_eq!(external_posedge(47_999), 4);
    }

    #[test]
    fn mclk_family_selection() {
        assert_eq!(mclk_for_rate(32_000), MCLK_48K_FAMILY);
        assert_eq!(mclk_for_rate(48_000), MCLK_48K_FAMILY);
        assert_eq!(mclk_for_rate(96_000), MCLK_48K_FAMILY);
        assert_eq!(mclk_for_rate(192_000), MCLK_48K_FAMILY);
        assert_eq!(mclk_for_rate(22_050), MCLK_44K1_FAMILY);
        assert_eq!(mclk_for_rate(44_100), MCLK_44K1_FAMILY);
        assert_eq!(mclk_for_rate(88_200), MCLK_44K1_FAMILY);
    }

    #[test]
    fn only_first_stream_start_enables_block() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        i2s.stream_start(Direction::Playback);
        i2s.with_stereo_regs(|regs| {
            assert_eq!(regs.resets, 1);
            let v = regs.get(Reg::StereoConfig);
            assert_ne!(v & sc::I2S_ENABLE, 0);
            assert_ne!(v & sc::SPDIF_ENABLE, 0);
            assert_ne!(v & sc::SAMPLE_CNT_CLEAR_TYPE, 0);
            assert_ne!(v & sc::MASTER, 0);
            assert_eq!(v & sc::MCK_SEL, 0);
        });

        // Second direction joins silently.
        i2s.stream_start(Direction::Capture);
        i2s.with_stereo_regs(|regs| assert_eq!(regs.resets, 1));
    }

    #[test]
    fn hw_params_programs_rate_and_format() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        i2s.stream_start(Direction::Playback);
        i2s.hw_params(48_000, SampleFormat::S16_LE).unwrap();

        pll.with_regs(|regs| assert_eq!(regs.measurements, 1));
        i2s.with_stereo_regs(|regs| {
            let v = regs.get(Reg::StereoConfig);
            assert_eq!(v >> sc::POSEDGE_SHIFT & sc::POSEDGE_MASK, 4);
            assert_eq!(
                v >> sc::DATA_WORD_SIZE_SHIFT & sc::DATA_WORD_SIZE_MASK,
                sc::DATA_WORD_16
            );
            assert_ne!(v & sc::PCM_SWAP, 0);
            // Enables from stream start survive the merge.
            assert_ne!(v & sc::I2S_ENABLE, 0);
            assert_eq!(regs.resets, 2);
        });
    }

    #[test]
    fn format_change_clears_previous_field_group() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        i2s.stream_start(Direction::Playback);
        i2s.hw_params(48_000, SampleFormat::S32_LE).unwrap();
        i2s.hw_params(96_000, SampleFormat::S16_BE).unwrap();

        i2s.with_stereo_regs(|regs| {
            let v = regs.get(Reg::StereoConfig);
            assert_eq!(v >> sc::POSEDGE_SHIFT & sc::POSEDGE_MASK, 2);
            assert_eq!(
                v >> sc::DATA_WORD_SIZE_SHIFT & sc::DATA_WORD_SIZE_MASK,
                sc::DATA_WORD_16
            );
            // Wide slots and swap from the 32-bit LE format are gone.
            assert_eq!(v & sc::PCM_SWAP, 0);
            assert_eq!(v & sc::I2S_WORD_SIZE, 0);
            assert_eq!(v & sc::MIC_WORD_SIZE, 0);
        });
    }

    #[test]
    fn hw_params_skipped_while_both_directions_run() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        i2s.stream_start(Direction::Playback);
        i2s.stream_start(Direction::Capture);
        let before = i2s.with_stereo_regs(|regs| regs.get(Reg::StereoConfig));

        i2s.hw_params(96_000, SampleFormat::S24_LE).unwrap();

        assert_eq!(
            i2s.with_stereo_regs(|regs| regs.get(Reg::StereoConfig)),
            before
        );
        pll.with_regs(|regs| assert_eq!(regs.measurements, 0));
    }

    #[test]
    fn unsupported_format_causes_no_clock_work() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        assert_eq!(
            i2s.hw_params(48_000, SampleFormat { word_size: 20, little_endian: false }),
            Err(Error::UnsupportedFormat { word_size: 20 })
        );
        pll.with_regs(|regs| {
            assert_eq!(regs.measurements, 0);
            assert_eq!(regs.power_downs, 0);
        });
        i2s.with_stereo_regs(|regs| assert_eq!(regs.get(Reg::StereoConfig), 0));
    }

    #[test]
    fn last_stream_stop_shuts_down_block() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config::default());

        i2s.stream_start(Direction::Playback);
        i2s.stream_start(Direction::Capture);
        i2s.stream_stop(Direction::Playback);
        // Capture still running, block stays up.
        i2s.with_stereo_regs(|regs| {
            assert_ne!(regs.get(Reg::StereoConfig) & sc::I2S_ENABLE, 0)
        });

        i2s.stream_stop(Direction::Capture);
        i2s.with_stereo_regs(|regs| assert_eq!(regs.get(Reg::StereoConfig), 0));
    }

    #[test]
    fn persistent_clocks_survive_stream_stop() {
        let i2s = external_i2s(Config { persistent_clocks: true });

        i2s.stream_start(Direction::Playback);
        i2s.stream_stop(Direction::Playback);

        i2s.with_stereo_regs(|regs| {
            assert_ne!(regs.get(Reg::StereoConfig) & sc::I2S_ENABLE, 0)
        });
    }

    #[test]
    fn persistent_clocks_bring_up_at_probe() {
        let pll = pll();
        let i2s = i2s_with_pll(&pll, Config { persistent_clocks: true });

        // The 48 kHz-family MCLK was synthesized before any stream started.
        pll.with_regs(|regs| assert_eq!(regs.measurements, 1));
        i2s.with_stereo_regs(|regs| {
            let v = regs.get(Reg::StereoConfig);
            assert_ne!(v & sc::I2S_ENABLE, 0);
            assert_eq!(v >> sc::POSEDGE_SHIFT & sc::POSEDGE_MASK, 4);
            assert_eq!(regs.resets, 1);
        });
    }

    #[test]
    fn external_mclk_uses_table_and_selects_external_input() {
        let i2s = external_i2s(Config::default());

        i2s.stream_start(Direction::Capture);
        i2s.hw_params(96_000, SampleFormat::S24_LE).unwrap();

        i2s.with_stereo_regs(|regs| {
            let v = regs.get(Reg::StereoConfig);
            assert_ne!(v & sc::MCK_SEL, 0);
            assert_eq!(v >> sc::POSEDGE_SHIFT & sc::POSEDGE_MASK, 2);
        });
    }

    #[test]
    fn public_reset_pulses_without_touching_config() {
        let i2s = external_i2s(Config::default());
        i2s.stream_start(Direction::Playback);
        let before = i2s.with_stereo_regs(|regs| regs.get(Reg::StereoConfig));

        i2s.reset();

        i2s.with_stereo_regs(|regs| {
            assert_eq!(regs.get(Reg::StereoConfig), before);
            assert_eq!(regs.resets, 2);
        });
    }
}
