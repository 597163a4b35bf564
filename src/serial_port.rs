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

//! Serial channel configuration.
//!
//! The bootloader UART runs 8E1 with no flow control. The read timeout is
//! deliberately short (50 ms) so that a silent target turns into a short
//! read instead of a hang; the protocol engine reports that as "no ACK"
//! when it happens during an ACK phase.

use std::path::PathBuf;
use std::time::Duration;

use log::{debug, warn};
use serial::{BaudRate, SerialPort, SystemPort};

use crate::constants;
use crate::Result;

/// Inter-byte read timeout (the termios VTIME equivalent).
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Baud rates the front-ends accept. Everything else falls back to the
/// table maximum with a warning rather than aborting.
#[rustfmt::skip]
const BAUD_SPEEDS: &[usize] = &[
    50,      75,      110,     134,     150,     200,
    300,     600,     1200,    1800,    2400,    4800,
    9600,    19200,   38400,   57600,   115200,  230400,
    460800,  500000,  576000,  921600,  1000000, 1152000,
    1500000, 2000000, 2500000, 3000000, 3500000, 4000000,
];

/// Fallback for unrecognized baud strings.
pub fn max_baud() -> BaudRate {
    BaudRate::from_speed(*BAUD_SPEEDS.last().unwrap())
}

/// Where and how fast to talk to the target.
///
/// The open handle is not part of the options; whoever opens the port owns
/// the returned [`SystemPort`] and closing is dropping.
#[derive(Debug, Clone)]
pub struct SerialOptions {
    pub device: PathBuf,
    pub baud: BaudRate,
}

impl SerialOptions {
    pub fn new<P: Into<PathBuf>>(device: P, baud: BaudRate) -> Self {
        SerialOptions {
            device: device.into(),
            baud,
        }
    }
}

impl Default for SerialOptions {
    fn default() -> Self {
        SerialOptions {
            device: PathBuf::from(constants::TTY_DEV),
            baud: BaudRate::Baud57600,
        }
    }
}

/// Open and configure the bootloader UART.
///
/// Raw 8E1, requested baud for both directions, 50 ms read timeout, input
/// queue flushed so a previous session's stale bytes cannot be mistaken
/// for an ACK.
pub fn open_port(opts: &SerialOptions) -> Result<SystemPort> {
    debug!(
        "opening {} at {} 8E1",
        opts.device.display(),
        baud_to_str(opts.baud)
    );

    let mut port = serial::open(&opts.device)?;
    port.set_timeout(READ_TIMEOUT)?;
    port.configure(&serial::PortSettings {
        baud_rate: opts.baud,
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityEven,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    })?;
    flush_input(&port)?;

    Ok(port)
}

/// Discard anything already queued on the line.
fn flush_input(port: &SystemPort) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    nix::sys::termios::tcflush(port.as_raw_fd(), nix::sys::termios::FlushArg::TCIFLUSH)
        .map_err(std::io::Error::from)?;
    Ok(())
}

/// Render a baud key as the string form the CLI accepts (`57600bps`).
pub fn baud_to_str(baud: BaudRate) -> String {
    format!("{}bps", baud.speed())
}

/// Parse a baud string (`57600` or `57600bps`) to a platform key.
///
/// Unknown values warn and resolve to the table maximum; a bad baud rate
/// is not worth aborting a programming run the user can see failing.
pub fn baud_from_str(s: &str) -> BaudRate {
    let digits = s.trim().trim_end_matches("bps");

    match digits.parse::<usize>() {
        Ok(speed) if BAUD_SPEEDS.contains(&speed) => BaudRate::from_speed(speed),
        _ => {
            warn!(
                "unknown baud rate '{}', defaulting to {}",
                s,
                baud_to_str(max_baud())
            );
            max_baud()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_round_trips_for_every_table_entry() {
        for speed in BAUD_SPEEDS {
            let key = BaudRate::from_speed(*speed);
            assert_eq!(baud_from_str(&baud_to_str(key)), key);
        }
    }

    #[test]
    fn baud_accepts_bare_and_suffixed_strings() {
        assert_eq!(baud_from_str("57600"), BaudRate::Baud57600);
        assert_eq!(baud_from_str("115200bps"), BaudRate::Baud115200);
        assert_eq!(baud_from_str(" 9600 "), BaudRate::Baud9600);
    }

    #[test]
    fn unknown_baud_falls_back_to_max() {
        assert_eq!(baud_from_str("123456"), max_baud());
        assert_eq!(baud_from_str("fast"), max_baud());
        assert_eq!(baud_from_str(""), max_baud());
    }

    #[test]
    fn default_options_use_compiled_in_device() {
        let opts = SerialOptions::default();
        assert_eq!(opts.device, PathBuf::from(constants::TTY_DEV));
        assert_eq!(opts.baud, BaudRate::Baud57600);
    }
}
