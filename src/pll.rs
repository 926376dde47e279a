//! Audio PLL (fractional-N clock synthesizer).
//!
//! The AR934x derives its audio master clock from a dedicated PLL with an
//! 18-bit fractional divider, trimmed by a digital control loop (DPLL) that
//! can measure how far the output wanders from the programmed target. A
//! retune is a full power cycle: force the PLL down, rewrite the dividers and
//! loop tuning while it is down, bring it back up and measure. If the
//! measured deviation is out of tolerance the whole cycle repeats.
//!
//! Replaces the `ath79_audio_set_freq` path of the reference kernel driver,
//! with the unbounded retry made finite and the powered-write `BUG()` turned
//! into an error.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embedded_hal::delay::DelayNs;

use crate::regs::{dpll2, dpll3, dpll4, pll_config, pll_mod, Reg, RegisterFile};
use crate::time::Hertz;

/// Reference divider, fixed by the clock tree.
const REFDIV: u32 = 1;
/// Log2 of the post divider.
const POST_DIV: u32 = 3;
/// External divider between PLL output and MCLK.
const EXT_DIV: u32 = 2;
/// DPLL phase shift programmed on every retune.
const PHASE_SHIFT: u32 = 6;
/// Settle time after forcing the PLL down, in microseconds.
const POWER_DOWN_SETTLE_US: u32 = 100;
/// Delay between measurement-done polls, in microseconds.
const MEAS_POLL_DELAY_US: u32 = 10;
/// Measurement-done polls before the measurement counts as stuck.
const MEAS_POLL_LIMIT: u32 = 1000;

/// Audio PLL error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Reference clock is not one of the supported rates.
    UnsupportedRefClock { rate_hz: u32 },
    /// A DPLL tuning write was attempted while the PLL was powered.
    NotPoweredDown,
    /// The lock-quality measurement never completed.
    MeasurementTimeout,
    /// The PLL did not lock within the attempt budget.
    ConvergenceNotAchieved { attempts: u8, last_deviation: u32 },
}

/// Supported reference clock rates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RefClock {
    /// 25 MHz crystal.
    Mhz25,
    /// 40 MHz crystal.
    Mhz40,
}

impl RefClock {
    /// Validate a platform-supplied reference rate.
    pub const fn from_hz(rate_hz: u32) -> Result<Self, Error> {
        match rate_hz {
            25_000_000 => Ok(RefClock::Mhz25),
            40_000_000 => Ok(RefClock::Mhz40),
            _ => Err(Error::UnsupportedRefClock { rate_hz }),
        }
    }

    /// Reference rate in Hz.
    pub const fn hz(self) -> u32 {
        match self {
            RefClock::Mhz25 => 25_000_000,
            RefClock::Mhz40 => 40_000_000,
        }
    }

    /// DPLL gain pair tuned for this reference rate.
    const fn gains(self) -> DpllGains {
        match self {
            RefClock::Mhz25 => DpllGains { kd: 61, ki: 4 },
            RefClock::Mhz40 => DpllGains { kd: 50, ki: 4 },
        }
    }
}

/// DPLL proportional/integral gain pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct DpllGains {
    kd: u32,
    ki: u32,
}

/// PLL power state as read back from the config register.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerState {
    /// Held in power-down.
    PoweredDown,
    /// Running, but the reference is passed through to the output.
    Bypassed,
    /// PLL output drives MCLK.
    Powered,
}

/// Rate at the fractional divider input: the reference after the structural
/// refdiv, post and external dividers.
pub const fn base_rate(ref_clock: RefClock) -> Hertz {
    Hertz(ref_clock.hz() / (REFDIV * (1 << POST_DIV) * EXT_DIV))
}

/// Fractional-N target divider pair.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TargetDivider {
    /// Integer part.
    pub div_int: u32,
    /// 18-bit fractional part.
    pub div_frac: u32,
}

impl TargetDivider {
    /// Compute the divider pair producing `target` from `ref_clock`.
    ///
    /// The fractional part is rounded to nearest; intermediates are 64-bit so
    /// the 2^18 scale cannot overflow.
    pub const fn compute(ref_clock: RefClock, target: Hertz) -> Self {
        let base = base_rate(ref_clock).0 as u64;
        let target = target.0 as u64;
        let div_int = target / base;
        let rem = target - base * div_int;
        let div_frac = (rem * (1 << 18) + base / 2) / base;
        Self {
            div_int: div_int as u32,
            div_frac: div_frac as u32,
        }
    }

    /// Rate this divider pair reproduces, rounded down to whole Hz.
    ///
    /// The granularity of the fractional field is `base_rate / 2^18`
    /// (about 6 Hz from a 25 MHz reference), so the reproduced rate can sit
    /// up to half that step away from the requested one.
    pub const fn reconstruct(self, ref_clock: RefClock) -> Hertz {
        let base = base_rate(ref_clock).0 as u64;
        let frac_hz = (base * self.div_frac as u64) >> 18;
        Hertz((base * self.div_int as u64 + frac_hz) as u32)
    }
}

/// Convergence policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// Full power-cycle attempts before giving up.
    pub max_attempts: u8,
    /// Measured deviation below which the PLL counts as locked.
    pub deviation_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            // Acceptance threshold from the reference bring-up code.
            deviation_limit: 0x40000,
        }
    }
}

/// Audio PLL driver.
///
/// Owns the PLL and DPLL register groups behind a single guard. A retune
/// runs the whole power-cycle sequence under that guard, so concurrent
/// callers serialize and none of them observes a half-configured PLL.
/// Sibling drivers hold the PLL by shared reference, see
/// [`i2s::MclkSource`](crate::i2s::MclkSource).
pub struct AudioPll<R: RegisterFile, D: DelayNs> {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<R, D>>>,
    ref_clock: RefClock,
    config: Config,
}

struct Inner<R, D> {
    regs: R,
    delay: D,
}

impl<R: RegisterFile, D: DelayNs> AudioPll<R, D> {
    /// Create the driver for the given reference clock.
    pub fn new(regs: R, delay: D, ref_clock: RefClock, config: Config) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner { regs, delay })),
            ref_clock,
            config,
        }
    }

    /// Reference clock the PLL runs from.
    pub fn ref_clock(&self) -> RefClock {
        self.ref_clock
    }

    /// Current power state, read back from hardware.
    pub fn power_state(&self) -> PowerState {
        self.inner.lock(|inner| {
            let cfg = inner.borrow_mut().regs.read(Reg::PllConfig);
            if cfg & pll_config::PLLPWD != 0 {
                PowerState::PoweredDown
            } else if cfg & pll_config::BYPASS != 0 {
                PowerState::Bypassed
            } else {
                PowerState::Powered
            }
        })
    }

    /// Retune the PLL to `target` and verify it locked.
    ///
    /// Each attempt powers the PLL down, rewrites the dividers and DPLL
    /// tuning, powers back up and measures the deviation. Attempts repeat
    /// until the deviation is below [`Config::deviation_limit`] or
    /// [`Config::max_attempts`] is exhausted.
    pub fn set_frequency(&self, target: Hertz) -> Result<(), Error> {
        let divider = TargetDivider::compute(self.ref_clock, target);
        debug!(
            "audio pll: target {} Hz -> div {} + {}/262144 ({} Hz)",
            target.0,
            divider.div_int,
            divider.div_frac,
            divider.reconstruct(self.ref_clock).0,
        );

        self.inner.lock(|inner| {
            let inner = &mut *inner.borrow_mut();
            let mut last_deviation = u32::MAX;

            for attempt in 1..=self.config.max_attempts {
                inner.clear_meas();
                inner.power_down();
                inner.delay.delay_us(POWER_DOWN_SETTLE_US);

                inner.set_postpllpwd(POST_DIV);
                inner.set_bypass(false);
                inner.set_ext_div(EXT_DIV);
                inner.set_refdiv(REFDIV);
                inner.set_target_divider(divider);
                inner.relatch_range();
                inner.set_phase_shift(PHASE_SHIFT)?;
                inner.set_gains(self.ref_clock.gains())?;

                inner.power_up();

                inner.clear_meas();
                inner.start_meas();
                inner.wait_meas_done()?;

                last_deviation = inner.deviation();
                if last_deviation < self.config.deviation_limit {
                    debug!(
                        "audio pll: locked after {} attempt(s), deviation {:#x}",
                        attempt, last_deviation
                    );
                    return Ok(());
                }
                debug!(
                    "audio pll: attempt {} deviation {:#x}, power-cycling",
                    attempt, last_deviation
                );
            }

            error!(
                "audio pll: no lock after {} attempts, last deviation {:#x}",
                self.config.max_attempts, last_deviation
            );
            Err(Error::ConvergenceNotAchieved {
                attempts: self.config.max_attempts,
                last_deviation,
            })
        })
    }
}

#[cfg(test)]
impl<R: RegisterFile, D: DelayNs> AudioPll<R, D> {
    pub(crate) fn with_regs<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        self.inner.lock(|inner| f(&mut inner.borrow_mut().regs))
    }
}

impl<R: RegisterFile, D: DelayNs> Inner<R, D> {
    fn is_powered_down(&mut self) -> bool {
        self.regs.read(Reg::PllConfig) & pll_config::PLLPWD != 0
    }

    fn power_down(&mut self) {
        self.regs.modify(Reg::PllConfig, |v| v | pll_config::PLLPWD);
    }

    fn power_up(&mut self) {
        self.regs.modify(Reg::PllConfig, |v| v & !pll_config::PLLPWD);
    }

    fn set_bypass(&mut self, bypass: bool) {
        self.regs.modify(Reg::PllConfig, |v| {
            if bypass {
                v | pll_config::BYPASS
            } else {
                v & !pll_config::BYPASS
            }
        });
    }

    fn set_refdiv(&mut self, refdiv: u32) {
        self.regs.modify(Reg::PllConfig, |v| {
            (v & !(pll_config::REFDIV_MASK << pll_config::REFDIV_SHIFT))
                | ((refdiv & pll_config::REFDIV_MASK) << pll_config::REFDIV_SHIFT)
        });
    }

    fn set_postpllpwd(&mut self, post_div: u32) {
        self.regs.modify(Reg::PllConfig, |v| {
            (v & !(pll_config::POSTPLLPWD_MASK << pll_config::POSTPLLPWD_SHIFT))
                | ((post_div & pll_config::POSTPLLPWD_MASK) << pll_config::POSTPLLPWD_SHIFT)
        });
    }

    fn set_ext_div(&mut self, ext_div: u32) {
        self.regs.modify(Reg::PllConfig, |v| {
            (v & !(pll_config::EXT_DIV_MASK << pll_config::EXT_DIV_SHIFT))
                | ((ext_div & pll_config::EXT_DIV_MASK) << pll_config::EXT_DIV_SHIFT)
        });
    }

    fn set_target_divider(&mut self, divider: TargetDivider) {
        self.regs.modify(Reg::PllModulation, |v| {
            (v & !((pll_mod::TGT_DIV_INT_MASK << pll_mod::TGT_DIV_INT_SHIFT)
                | (pll_mod::TGT_DIV_FRAC_MASK << pll_mod::TGT_DIV_FRAC_SHIFT)))
                | ((divider.div_int & pll_mod::TGT_DIV_INT_MASK) << pll_mod::TGT_DIV_INT_SHIFT)
                | ((divider.div_frac & pll_mod::TGT_DIV_FRAC_MASK) << pll_mod::TGT_DIV_FRAC_SHIFT)
        });
    }

    fn relatch_range(&mut self) {
        self.regs.modify(Reg::Dpll2, |v| v & !dpll2::RANGE);
        self.regs.modify(Reg::Dpll2, |v| v | dpll2::RANGE);
    }

    // DPLL gain and phase fields latch garbage if written while the PLL
    // runs; the hardware state is re-checked rather than trusted.

    fn check_powered_down(&mut self) -> Result<(), Error> {
        if self.is_powered_down() {
            Ok(())
        } else {
            Err(Error::NotPoweredDown)
        }
    }

    fn set_phase_shift(&mut self, phase: u32) -> Result<(), Error> {
        self.check_powered_down()?;
        self.regs.modify(Reg::Dpll3, |v| {
            (v & !(dpll3::PHASE_SHIFT_MASK << dpll3::PHASE_SHIFT_SHIFT))
                | ((phase & dpll3::PHASE_SHIFT_MASK) << dpll3::PHASE_SHIFT_SHIFT)
        });
        Ok(())
    }

    fn set_gains(&mut self, gains: DpllGains) -> Result<(), Error> {
        self.check_powered_down()?;
        self.regs.modify(Reg::Dpll2, |v| {
            (v & !((dpll2::KD_MASK << dpll2::KD_SHIFT) | (dpll2::KI_MASK << dpll2::KI_SHIFT)))
                | ((gains.kd & dpll2::KD_MASK) << dpll2::KD_SHIFT)
                | ((gains.ki & dpll2::KI_MASK) << dpll2::KI_SHIFT)
        });
        Ok(())
    }

    fn clear_meas(&mut self) {
        self.regs.modify(Reg::Dpll3, |v| v & !dpll3::DO_MEAS);
    }

    fn start_meas(&mut self) {
        self.regs.modify(Reg::Dpll3, |v| v | dpll3::DO_MEAS);
    }

    fn wait_meas_done(&mut self) -> Result<(), Error> {
        for _ in 0..MEAS_POLL_LIMIT {
            if self.regs.read(Reg::Dpll4) & dpll4::MEAS_DONE != 0 {
                return Ok(());
            }
            self.delay.delay_us(MEAS_POLL_DELAY_US);
        }
        Err(Error::MeasurementTimeout)
    }

    fn deviation(&mut self) -> u32 {
        (self.regs.read(Reg::Dpll3) >> dpll3::SQSUM_DVC_SHIFT) & dpll3::SQSUM_DVC_MASK
    }
}
