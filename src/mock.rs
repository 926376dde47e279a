//! Scripted register file and no-op delay for host tests.
//!
//! `FakeRegs` stores the six audio registers and models the few behaviors the
//! drivers depend on: the power-down bit latching (or not), the measurement
//! engine completing with a scripted deviation, and the stereo soft reset
//! clearing itself.

use embedded_hal::delay::DelayNs;

use crate::regs::{dpll3, dpll4, pll_config, stereo_config, Reg, RegisterFile};

pub(crate) struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

pub(crate) struct FakeRegs {
    values: [u32; 6],
    deviations: Vec<u32>,
    next_deviation: usize,
    /// When false, writes to the power-down bit do not stick.
    pub pllpwd_latches: bool,
    /// When false, triggered measurements never raise the done flag.
    pub meas_completes: bool,
    /// Rising edges seen on the power-down bit.
    pub power_downs: u32,
    /// Rising edges seen on the do-measurement bit.
    pub measurements: u32,
    /// Reset pulses seen on the stereo config register.
    pub resets: u32,
}

impl FakeRegs {
    pub fn new() -> Self {
        Self {
            values: [0; 6],
            deviations: Vec::new(),
            next_deviation: 0,
            pllpwd_latches: true,
            meas_completes: true,
            power_downs: 0,
            measurements: 0,
            resets: 0,
        }
    }

    /// Script the deviation reported by each successive measurement.
    /// Measurements past the end of the script report zero (locked).
    pub fn with_deviations(deviations: &[u32]) -> Self {
        let mut fake = Self::new();
        fake.deviations = deviations.to_vec();
        fake
    }

    /// Raw register value, no side effects.
    pub fn get(&self, reg: Reg) -> u32 {
        self.values[reg as usize]
    }

    /// Raw register store, bypassing the behavioral model.
    pub fn set(&mut self, reg: Reg, value: u32) {
        self.values[reg as usize] = value;
    }
}

impl RegisterFile for FakeRegs {
    fn read(&mut self, reg: Reg) -> u32 {
        self.values[reg as usize]
    }

    fn write(&mut self, reg: Reg, mut value: u32) {
        let prev = self.values[reg as usize];
        match reg {
            Reg::PllConfig => {
                if value & pll_config::PLLPWD != 0 && prev & pll_config::PLLPWD == 0 {
                    self.power_downs += 1;
                }
                if !self.pllpwd_latches {
                    value &= !pll_config::PLLPWD;
                }
            }
            Reg::Dpll3 => {
                if value & dpll3::DO_MEAS != 0 && prev & dpll3::DO_MEAS == 0 {
                    self.measurements += 1;
                    let deviation = self
                        .deviations
                        .get(self.next_deviation)
                        .copied()
                        .unwrap_or(0);
                    self.next_deviation += 1;
                    value = (value & !(dpll3::SQSUM_DVC_MASK << dpll3::SQSUM_DVC_SHIFT))
                        | ((deviation & dpll3::SQSUM_DVC_MASK) << dpll3::SQSUM_DVC_SHIFT);
                    if self.meas_completes {
                        self.values[Reg::Dpll4 as usize] |= dpll4::MEAS_DONE;
                    }
                }
                if value & dpll3::DO_MEAS == 0 {
                    self.values[Reg::Dpll4 as usize] &= !dpll4::MEAS_DONE;
                }
            }
            Reg::StereoConfig => {
                // The soft reset is self-clearing.
                if value & stereo_config::RESET != 0 {
                    self.resets += 1;
                    value &= !stereo_config::RESET;
                }
            }
            _ => {}
        }
        self.values[reg as usize] = value;
    }
}
