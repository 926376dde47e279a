#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod i2s;
pub mod pll;
pub mod regs;
pub mod time;

#[cfg(test)]
pub(crate) mod mock;
