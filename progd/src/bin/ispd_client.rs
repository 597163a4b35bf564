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

//! Test client for the ISP daemon.
//!
//! Sends each command letter given on the command line as a framed
//! request and prints whatever status lines come back until the daemon
//! goes quiet. Purely a bench tool; the real client is the panel UI.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::{Context, Result};

use stm32_isp::constants;

/// How long a silent daemon ends the response listing for one command.
const QUIET_WINDOW: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let commands: Vec<String> = std::env::args().skip(1).collect();
    if commands.is_empty() || commands.iter().any(|c| c.len() != 1) {
        eprintln!("usage: ispd-client <S|V|U|G|Q> ...");
        std::process::exit(2);
    }

    let mut stream = UnixStream::connect(constants::SOCKET_PATH)
        .with_context(|| format!("Failed to connect to {}", constants::SOCKET_PATH))?;
    stream
        .set_read_timeout(Some(QUIET_WINDOW))
        .context("Failed to set socket timeout")?;

    // The daemon greets every client before the first command.
    drain(&mut stream)?;

    for command in &commands {
        let frame = [b'M', command.as_bytes()[0], b'\n'];
        stream
            .write_all(&frame)
            .with_context(|| format!("Failed to send command {}", command))?;
        drain(&mut stream)?;
    }

    Ok(())
}

/// Print response lines until the daemon stays quiet for a while.
fn drain(stream: &mut UnixStream) -> Result<()> {
    let mut buf = [0u8; 512];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => io::stdout().write_all(&buf[..n])?,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => return Err(e).context("Failed to read from daemon"),
        }
    }
    Ok(())
}
