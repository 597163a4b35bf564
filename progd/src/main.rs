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

//! ISP daemon.
//!
//! Serves one local client at a time over a UNIX-domain control socket and
//! drives the programmer core from three-byte text commands. The loop is
//! single-threaded: one poll multiplexes the socket side with the serial
//! line, whose unsolicited bytes are forwarded to the client verbatim.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{crate_authors, crate_version, App, Arg};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use stm32_isp::constants;
use stm32_isp::pins::ExpanderPins;
use stm32_isp::serial_port::{self, SerialOptions};
use stm32_isp::target::{SessionState, Target};

mod server;

use server::{Command, Status};

/// Poll tick, so the stop flag is observed even when nothing is ready.
const POLL_TICK_MS: i32 = 500;

fn main() -> Result<()> {
    let matches = App::new("STM32 ISP daemon")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Socket-driven programmer for an external STM32")
        .arg(
            Arg::with_name("tty")
                .short("t")
                .long("tty")
                .value_name("DEVICE")
                .default_value(constants::TTY_DEV)
                .help("Serial device wired to the target bootloader UART"),
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .value_name("BAUD")
                .default_value("57600bps")
                .help("Serial baud rate, e.g. 57600 or 115200bps"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .multiple(true)
                .help("Raise log verbosity, --verbose (debug), --verbose --verbose (trace)"),
        )
        .get_matches();

    init_logger(match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    })?;

    // Signals only flip the flag; the loop notices and teardown runs from
    // ordinary control flow.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("Failed to install signal handler")?;
    }

    let opts = SerialOptions::new(
        matches.value_of("tty").unwrap(),
        serial_port::baud_from_str(matches.value_of("baudrate").unwrap()),
    );
    let mut target = Target::new(ExpanderPins::new(), opts, true);
    target
        .open_serial()
        .context("Failed to open the serial port")?;

    let socket_path = Path::new(constants::SOCKET_PATH);
    let listener = server::bind_listener(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;

    let result = event_loop(&listener, &mut target, &stop);

    // Teardown, unconditionally.
    if target.state() == SessionState::Ready {
        target.leave_bootloader();
    }
    drop(listener);
    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!("could not unlink {}: {}", socket_path.display(), e);
    }

    result
}

fn event_loop(
    listener: &UnixListener,
    target: &mut Target<ExpanderPins>,
    stop: &AtomicBool,
) -> Result<()> {
    let mut client: Option<UnixStream> = None;

    while !stop.load(Ordering::SeqCst) {
        let serial_fd = target
            .serial_fd()
            .context("serial port closed unexpectedly")?;

        // One client at a time: while one is connected the listener sits
        // outside the wait set, so nobody else gets accepted.
        let socket_fd = match &client {
            Some(stream) => stream.as_raw_fd(),
            None => listener.as_raw_fd(),
        };
        let mut fds = [
            PollFd::new(socket_fd, PollFlags::POLLIN),
            PollFd::new(serial_fd, PollFlags::POLLIN),
        ];

        let ready = match poll(&mut fds, POLL_TICK_MS) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll failed"),
        };
        if ready == 0 {
            continue;
        }

        let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        let socket_ready = fds[0].revents().map_or(false, |r| r.intersects(wanted));
        let serial_ready = fds[1].revents().map_or(false, |r| r.intersects(wanted));

        if socket_ready {
            match client.take() {
                None => {
                    let (mut stream, _) = listener.accept().context("accept failed")?;
                    info!("client connected");
                    let _ = server::send_status(&mut stream, Status::Ready);
                    client = Some(stream);
                }
                Some(mut stream) => {
                    if handle_client(&mut stream, target, stop) {
                        client = Some(stream);
                    } else {
                        info!("client disconnected");
                    }
                }
            }
        }

        if serial_ready {
            forward_serial(target, client.as_mut());
        }
    }

    Ok(())
}

/// Service one readiness event on the client socket. Returns `false` when
/// the client is gone.
fn handle_client(
    stream: &mut UnixStream,
    target: &mut Target<ExpanderPins>,
    stop: &AtomicBool,
) -> bool {
    let mut frame = [0u8; server::CMD_SIZE];
    let n = match stream.read(&mut frame) {
        Ok(0) => return false,
        Ok(n) => n,
        Err(e) => {
            debug!("client read failed: {}", e);
            return false;
        }
    };

    if n < frame.len() {
        debug!("runt command frame ({} bytes), ignored", n);
        return true;
    }

    match server::parse_command(&frame) {
        None => debug!("unterminated command frame, ignored"),
        Some(cmd) => dispatch(cmd, stream, target, stop),
    }

    true
}

fn dispatch(
    cmd: Command,
    client: &mut UnixStream,
    target: &mut Target<ExpanderPins>,
    stop: &AtomicBool,
) {
    debug!("dispatching {:?}", cmd);

    match cmd {
        Command::Init => {
            let _ = server::send_status(client, Status::Busy);
            match target.enter_bootloader() {
                Ok(()) => {
                    let _ = server::send_status(client, Status::Ready);
                }
                Err(e) => error!("cannot enter bootloader mode: {}", e),
            }
        }
        Command::Version => match target.query_version() {
            Ok((version, _)) => {
                let _ = server::send_version(client, &version);
            }
            Err(e) => error!("version query failed: {}", e),
        },
        Command::Update => {
            let _ = server::send_status(client, Status::Updating);
            let firmware = Path::new(constants::DEFAULT_FIRMWARE);
            let result = target.update_firmware(firmware, stop, |remaining| {
                let _ = server::send_progress(client, remaining);
            });
            match result {
                Ok(()) => {
                    let _ = server::send_status(client, Status::Complete);
                }
                Err(e) => error!("firmware update failed: {}", e),
            }
        }
        Command::Go => {
            if let Err(e) = target.go() {
                error!("cannot start the application: {}", e);
            }
        }
        Command::Quit => {
            target.leave_bootloader();
            let _ = server::send_status(client, Status::Idle);
            stop.store(true, Ordering::SeqCst);
        }
        Command::Invalid => debug!("invalid command, ignored"),
    }
}

/// Drain whatever the target sent outside a transaction and pass it on.
fn forward_serial(target: &mut Target<ExpanderPins>, client: Option<&mut UnixStream>) {
    let mut buf = [0u8; 512];
    match target.read_serial(&mut buf) {
        Ok(0) => (),
        Ok(n) => {
            debug!("forwarding {} serial bytes", n);
            if let Some(stream) = client {
                let _ = stream.write_all(&buf[..n]);
            }
        }
        Err(e) => warn!("serial read failed: {}", e),
    }
}

fn init_logger(level: log::LevelFilter) -> Result<()> {
    let mut logger = env_logger::Builder::from_env("ISPD_LOG");
    logger.filter_level(level);

    #[cfg(unix)]
    logger.format(log_format_color);
    #[cfg(not(unix))]
    logger.format(log_format_no_color);

    logger.try_init().context("Failed to initialize logger")
}

#[cfg(unix)]
fn log_format_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    let level = match record.level() {
        log::Level::Error => ansi_term::Color::Red.bold().paint("ERROR"),
        log::Level::Warn => ansi_term::Color::Yellow.bold().paint("WARN"),
        log::Level::Info => ansi_term::Color::Green.bold().paint("INFO"),
        log::Level::Debug => ansi_term::Color::Cyan.bold().paint("DBG"),
        log::Level::Trace => ansi_term::Color::Cyan.bold().paint("TRACE"),
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}

#[cfg(not(unix))]
fn log_format_no_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    let level = match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN",
        log::Level::Info => "INFO",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRACE",
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}
