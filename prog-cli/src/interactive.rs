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

//! Interactive mode.
//!
//! A small line-buffered REPL over stdin. The bootloader session is
//! entered once at startup and spans every command until `exit`; the
//! `firmware` command swaps the image used by subsequent `update`s.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use log::error;

use stm32_isp::pins::PinDriver;
use stm32_isp::target::Target;
use stm32_isp::version::AppVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
    MicroVer,
    AppVer,
    Update,
    Firmware,
    Status,
    Unknown,
}

pub fn parse(cmd: &str) -> Command {
    match cmd {
        "exit" => Command::Exit,
        "help" => Command::Help,
        "micro-ver" => Command::MicroVer,
        "app-ver" => Command::AppVer,
        "update" => Command::Update,
        "firmware" => Command::Firmware,
        "status" => Command::Status,
        _ => Command::Unknown,
    }
}

pub fn run<G: PinDriver>(
    target: &mut Target<G>,
    mut firmware: PathBuf,
    stop: &AtomicBool,
) -> Result<()> {
    if let Err(e) = target.enter_bootloader() {
        error!("cannot enter bootloader mode: {}", e);
        target.leave_bootloader();
        anyhow::bail!("interactive session aborted");
    }

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        let line = match prompt_line(&mut lines, "-> ")? {
            Some(line) => line,
            None => break,
        };

        match parse(line.trim()) {
            Command::Exit => break,
            Command::Help => display_help(),
            Command::MicroVer => {
                if let Err(e) = crate::query_action(target) {
                    error!("{:#}", e);
                }
            }
            Command::AppVer => println!("{}", AppVersion::compiled_in()),
            Command::Status => println!("firmware: {}", firmware.display()),
            Command::Firmware => {
                if let Some(path) = prompt_line(&mut lines, "-> firmware ")? {
                    let path = path.trim();
                    if !path.is_empty() {
                        firmware = PathBuf::from(path);
                    }
                }
            }
            Command::Update => {
                if let Err(e) = crate::write_action(target, &firmware, stop) {
                    error!("{:#}", e);
                }
            }
            Command::Unknown => println!("Cmd '{}' unknown", line.trim()),
        }
    }

    target.leave_bootloader();
    Ok(())
}

/// Print `prompt` and read one line; `None` on end of input.
fn prompt_line<B: BufRead>(
    lines: &mut io::Lines<B>,
    prompt: &str,
) -> Result<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush().context("Failed to flush stdout")?;

    match lines.next() {
        Some(line) => Ok(Some(line.context("Failed to read stdin")?)),
        None => Ok(None),
    }
}

fn display_help() {
    println!("help");
    println!("micro-ver");
    println!("app-ver");
    println!("status");
    println!("update");
    println!("firmware");
    println!("exit");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse() {
        assert_eq!(parse("exit"), Command::Exit);
        assert_eq!(parse("help"), Command::Help);
        assert_eq!(parse("micro-ver"), Command::MicroVer);
        assert_eq!(parse("app-ver"), Command::AppVer);
        assert_eq!(parse("update"), Command::Update);
        assert_eq!(parse("firmware"), Command::Firmware);
        assert_eq!(parse("status"), Command::Status);
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(parse(""), Command::Unknown);
        assert_eq!(parse("reboot"), Command::Unknown);
        assert_eq!(parse("EXIT"), Command::Unknown);
    }
}
