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

//! Target lifecycle controller.
//!
//! Owns the pin driver, the serial options and the open protocol engine
//! for the duration of a session, and is the only place that sequences
//! them. To put the target into bootloader mode, BOOT0 goes high and NRST
//! is pulsed low then high; to return it to the application, the same
//! pulse with BOOT0 low. The dwells around each edge are conservative
//! bounds that absorb expander latency and target power-on reset.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serial::SystemPort;

use crate::flash;
use crate::pins::{Level, PinDriver};
use crate::serial_port::{self, SerialOptions};
use crate::version::{AppVersion, VersionCheck};
use crate::{constants, Bootloader, Error, Result};

/// Dwell after each pin edge. Never zero: the target needs real time to
/// come out of power-on reset.
const RESET_DWELL: Duration = Duration::from_secs(1);

/// Quiescent delay after GO, during which the line is left alone.
const POST_GO_DELAY: Duration = Duration::from_secs(5);

/// Where the target session stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake yet, or reset back out of bootloader mode.
    Idle,
    /// Init handshake succeeded; commands may be issued.
    Ready,
    /// A protocol error occurred. Only a full pin reset plus re-init
    /// recovers from here.
    Failed,
}

/// The target and everything needed to drive it.
pub struct Target<G: PinDriver> {
    pins: G,
    opts: SerialOptions,
    reset_enabled: bool,
    state: SessionState,
    bootloader: Option<Bootloader<SystemPort>>,
}

impl<G: PinDriver> Target<G> {
    /// `reset_enabled: false` means the caller has already put the target
    /// into bootloader mode by other means and the pins are left alone.
    pub fn new(pins: G, opts: SerialOptions, reset_enabled: bool) -> Self {
        Target {
            pins,
            opts,
            reset_enabled,
            state: SessionState::Idle,
            bootloader: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Open the serial channel without touching the target.
    ///
    /// The daemon holds the port open from startup so it can forward
    /// target chatter; entering bootloader mode later reuses the handle.
    pub fn open_serial(&mut self) -> Result<()> {
        if self.bootloader.is_none() {
            let port = serial_port::open_port(&self.opts)?;
            self.bootloader = Some(Bootloader::new(port));
        }
        Ok(())
    }

    /// Bring the target up in bootloader mode and run the init handshake.
    pub fn enter_bootloader(&mut self) -> Result<()> {
        if self.reset_enabled {
            info!("resetting target into bootloader mode");
            self.pins.init();
            self.pulse_reset(Level::High);
        } else {
            // Caller reset the board; give it a moment to settle.
            dwell(RESET_DWELL);
        }

        if let Err(e) = self.open_serial() {
            self.state = SessionState::Failed;
            return Err(e);
        }

        match self.bootloader.as_mut().unwrap().init() {
            Ok(()) => {
                info!("target ready");
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("init handshake failed: {}", e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Reset the target back into its application and release everything.
    pub fn leave_bootloader(&mut self) {
        if self.reset_enabled {
            info!("resetting target into application mode");
            self.pulse_reset(Level::Low);
            self.pins.deinit();
        }
        // Dropping the engine closes the port.
        self.bootloader = None;
        self.state = SessionState::Idle;
    }

    /// Read and decode the application version word.
    pub fn query_version(&mut self) -> Result<(AppVersion, VersionCheck)> {
        let mut data = [0u8; 4];
        self.run(|bl| bl.read_memory(constants::USER_DATA_OFFSET, &mut data))?;

        let version = AppVersion::from_le_bytes(data);
        debug!("target reports version {} (0x{:08X})", version, version.word());
        Ok((version, version.check()))
    }

    /// Erase the flash and program `path` into it.
    pub fn update_firmware<F>(
        &mut self,
        path: &Path,
        stop: &AtomicBool,
        progress: F,
    ) -> Result<()>
    where
        F: FnMut(usize),
    {
        self.run(|bl| flash::write_firmware(bl, path, stop, progress))
    }

    /// Start the application at the flash base, then leave the line alone
    /// long enough for it to boot.
    pub fn go(&mut self) -> Result<()> {
        self.run(|bl| bl.go(constants::FLASH_BASE))?;
        dwell(POST_GO_DELAY);
        Ok(())
    }

    /// One plain serial read for the daemon's forwarding path.
    pub fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.bootloader
            .as_mut()
            .ok_or(Error::NotOpen)?
            .read_some(buf)
    }

    #[cfg(unix)]
    pub fn serial_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.bootloader.as_ref().map(|bl| bl.as_raw_fd())
    }

    /// Run one engine transaction, downgrading the session on protocol
    /// failure. Cancellation and file problems are not target failures.
    fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Bootloader<SystemPort>) -> Result<T>,
    {
        let bl = self.bootloader.as_mut().ok_or(Error::NotOpen)?;
        match f(bl) {
            Ok(v) => Ok(v),
            Err(e) => {
                if !matches!(e, Error::Cancelled | Error::File(_)) {
                    self.state = SessionState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Drive BOOT0 to `boot` and pulse NRST low then high.
    fn pulse_reset(&mut self, boot: Level) {
        self.pins.set_boot(boot);
        dwell(RESET_DWELL);
        self.pins.set_reset(Level::Low);
        dwell(RESET_DWELL);
        self.pins.set_reset(Level::High);
        dwell(RESET_DWELL);
    }
}

fn dwell(period: Duration) {
    // Compiled out of tests so pin-sequence checks do not sleep for real.
    if cfg!(not(test)) {
        thread::sleep(period);
    }
}
