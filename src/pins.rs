// Copyright 2022 Reach Technology <support@reachtech.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BOOT0 / NRST pin control.
//!
//! The target's boot-selection and reset pins hang off an I2C port
//! expander. The driver is strictly best-effort: bus errors are logged and
//! swallowed, never reported to the caller. If the pins did not actually
//! move, the init handshake fails cleanly a moment later, and a separate
//! pin-error path would not make recovery any better.

use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use log::{debug, error};

use crate::constants;

/// Output register of the expander.
const OUT_REG: u8 = 0x01;
/// Direction/configuration register of the expander.
const CTRL_REG: u8 = 0x03;

/// Expander bit wired to BOOT0.
const BOOT_BIT: u8 = 2;
/// Expander bit wired to NRST.
const RESET_BIT: u8 = 3;

/// Direction mask: BOOT0 and NRST as outputs, everything else input.
const CTRL_OUTPUTS: u8 = 0xF3;
/// Initial output state: NRST high (target running), BOOT0 low.
const OUT_INITIAL: u8 = 0x08;

/// Logic level of a target pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Two-bit output interface to the target's BOOT0 and NRST pins.
///
/// Implementations block until the level is effective and report nothing.
pub trait PinDriver {
    /// Claim the pins and drive them to their idle state.
    fn init(&mut self);
    /// Release the pins.
    fn deinit(&mut self);
    fn set_boot(&mut self, level: Level);
    fn set_reset(&mut self, level: Level);
}

/// Pin driver over the board's I2C port expander.
pub struct ExpanderPins {
    dev: Option<LinuxI2CDevice>,
}

impl ExpanderPins {
    /// The bus is not touched until [`PinDriver::init`] runs.
    pub fn new() -> Self {
        ExpanderPins { dev: None }
    }

    fn write_pin(&mut self, bit: u8, level: Level) {
        let dev = match self.dev.as_mut() {
            Some(dev) => dev,
            None => return,
        };

        let reg = match dev.smbus_read_byte_data(OUT_REG) {
            Ok(reg) => reg,
            Err(e) => {
                error!("expander output read failed: {}", e);
                return;
            }
        };

        if let Err(e) = dev.smbus_write_byte_data(OUT_REG, apply_level(reg, bit, level)) {
            error!("expander output write failed: {}", e);
        }
    }
}

impl Default for ExpanderPins {
    fn default() -> Self {
        Self::new()
    }
}

impl PinDriver for ExpanderPins {
    fn init(&mut self) {
        let mut dev = match LinuxI2CDevice::new(constants::I2C_DEV, constants::I2C_ADDR) {
            Ok(dev) => dev,
            Err(e) => {
                error!("open {} failed: {}", constants::I2C_DEV, e);
                return;
            }
        };

        if let Err(e) = dev.smbus_write_byte_data(CTRL_REG, CTRL_OUTPUTS) {
            error!("expander direction setup failed: {}", e);
            return;
        }
        if let Err(e) = dev.smbus_write_byte_data(OUT_REG, OUT_INITIAL) {
            error!("expander output setup failed: {}", e);
            return;
        }

        debug!("expander ready at 0x{:02X}", constants::I2C_ADDR);
        self.dev = Some(dev);
    }

    fn deinit(&mut self) {
        if let Some(dev) = self.dev.as_mut() {
            // All pins back to inputs, outputs low.
            if let Err(e) = dev.smbus_write_byte_data(CTRL_REG, 0xFF) {
                error!("expander direction reset failed: {}", e);
            }
            if let Err(e) = dev.smbus_write_byte_data(OUT_REG, 0x00) {
                error!("expander output reset failed: {}", e);
            }
        }
        self.dev = None;
    }

    fn set_boot(&mut self, level: Level) {
        debug!("BOOT0 -> {:?}", level);
        self.write_pin(BOOT_BIT, level);
    }

    fn set_reset(&mut self, level: Level) {
        debug!("NRST -> {:?}", level);
        self.write_pin(RESET_BIT, level);
    }
}

/// Read-modify-write helper for a single expander output bit.
fn apply_level(reg: u8, bit: u8, level: Level) -> u8 {
    match level {
        Level::Low => reg & !(1 << bit),
        Level::High => reg | (1 << bit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_level_sets_and_clears_single_bits() {
        assert_eq!(apply_level(0x00, BOOT_BIT, Level::High), 0x04);
        assert_eq!(apply_level(0xFF, BOOT_BIT, Level::Low), 0xFB);
        assert_eq!(apply_level(0x00, RESET_BIT, Level::High), 0x08);
        assert_eq!(apply_level(0xFF, RESET_BIT, Level::Low), 0xF7);
    }

    #[test]
    fn apply_level_leaves_other_bits_alone() {
        let reg = 0b1010_0101;
        let set = apply_level(reg, RESET_BIT, Level::High);
        assert_eq!(set & !(1 << RESET_BIT), reg & !(1 << RESET_BIT));
        let cleared = apply_level(reg, BOOT_BIT, Level::Low);
        assert_eq!(cleared & !(1 << BOOT_BIT), reg & !(1 << BOOT_BIT));
    }
}
