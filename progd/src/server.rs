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

//! Control socket plumbing.
//!
//! Clients speak a three-byte request frame `[_, cmd, 0x0A]` and receive
//! newline-terminated assignment strings the panel UI renders directly.

use std::fs;
use std::io::{self, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::{debug, info};

use stm32_isp::version::AppVersion;

/// Request frames are exactly this long, newline included.
pub const CMD_SIZE: usize = 3;

/// Decoded client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `MS` - reset the target into bootloader mode and shake hands.
    Init,
    /// `MV` - report the target's application version.
    Version,
    /// `MU` - erase and program the configured firmware image.
    Update,
    /// `MG` - start the application at the flash base.
    Go,
    /// `MQ` - reset the target back to its application and shut down.
    Quit,
    /// Anything else; ignored.
    Invalid,
}

/// Decode a request frame. `None` means the frame is not
/// newline-terminated and must be ignored outright.
pub fn parse_command(frame: &[u8; CMD_SIZE]) -> Option<Command> {
    if frame[CMD_SIZE - 1] != b'\n' {
        return None;
    }

    Some(match frame[1] {
        b'S' => Command::Init,
        b'V' => Command::Version,
        b'U' => Command::Update,
        b'G' => Command::Go,
        b'Q' => Command::Quit,
        _ => Command::Invalid,
    })
}

/// Status values a client can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready,
    Busy,
    Idle,
    Updating,
    Complete,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "Ready",
            Status::Busy => "Busy",
            Status::Idle => "Idle",
            Status::Updating => "Updating",
            Status::Complete => "Complete",
        }
    }
}

/// Render a status notification line.
pub fn status_line(status: Status) -> String {
    format!("txtStatus.text={}\n", status.as_str())
}

/// Render a per-chunk progress line carrying the chunks remaining.
pub fn progress_line(remaining: usize) -> String {
    format!("txtStatus.text={}\n", remaining)
}

/// Render the target version report line.
pub fn version_line(version: &AppVersion) -> String {
    format!("micro_input.text={}\n", version)
}

pub fn send_status(client: &mut UnixStream, status: Status) -> io::Result<()> {
    debug!("-> {:?}", status);
    client.write_all(status_line(status).as_bytes())
}

pub fn send_progress(client: &mut UnixStream, remaining: usize) -> io::Result<()> {
    client.write_all(progress_line(remaining).as_bytes())
}

pub fn send_version(client: &mut UnixStream, version: &AppVersion) -> io::Result<()> {
    debug!("-> version {}", version);
    client.write_all(version_line(version).as_bytes())
}

/// Bind the listening socket, stealing the path from any dead instance.
///
/// Two live daemons cannot coexist; the second one simply takes over the
/// rendezvous point, which is fine under the single-client policy.
pub fn bind_listener(path: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(path)?;
    info!("listening on {}", path.display());
    Ok(listener)
}
