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

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{crate_authors, crate_version, App, Arg, ArgGroup};
use indicatif::ProgressBar;
use log::{debug, error, warn};

use stm32_isp::constants;
use stm32_isp::pins::{ExpanderPins, PinDriver};
use stm32_isp::serial_port::{self, SerialOptions};
use stm32_isp::target::Target;
use stm32_isp::version::{AppVersion, VersionCheck};

mod interactive;

/// What the user asked for. Actions are mutually exclusive.
#[derive(Debug)]
enum Task {
    Write(PathBuf),
    Read(PathBuf),
    Query,
    Interactive,
}

/// Progress of the one-shot task. Advances monotonically; `Failed` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Start,
    Inited,
    Active,
    Success,
    Failed,
}

fn main() -> Result<()> {
    let mut app = App::new("STM32 In-System Programmer")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Program an external STM32 through its ROM serial bootloader")
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
            Arg::with_name("skip-reset")
                .short("s")
                .long("skip-reset")
                .help("Skip the pin reset; the target is already in bootloader mode"),
        )
        .arg(
            Arg::with_name("write")
                .short("w")
                .long("write")
                .value_name("FILE")
                .help("Erase the flash and program it from FILE"),
        )
        .arg(
            Arg::with_name("read")
                .short("r")
                .long("read")
                .value_name("FILE")
                .help("Read the flash back to FILE (reserved, not implemented)"),
        )
        .arg(
            Arg::with_name("query")
                .short("q")
                .long("query")
                .help("Query the application version stored on the target"),
        )
        .arg(
            Arg::with_name("interactive")
                .short("i")
                .long("interactive")
                .help("Run in interactive mode"),
        )
        .arg(
            Arg::with_name("app-version")
                .short("v")
                .long("app-version")
                .help("Display the compiled-in application version and exit"),
        )
        .arg(
            Arg::with_name("verbose")
                .long("verbose")
                .multiple(true)
                .help("Raise log verbosity, --verbose (debug), --verbose --verbose (trace)"),
        )
        .group(ArgGroup::with_name("action").args(&[
            "write",
            "read",
            "query",
            "interactive",
            "app-version",
        ]));

    let matches = app.clone().get_matches();

    init_logger(match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    })?;

    if matches.is_present("app-version") {
        println!("{}", AppVersion::compiled_in());
        return Ok(());
    }

    let task = if let Some(path) = matches.value_of("write") {
        Task::Write(PathBuf::from(path))
    } else if let Some(path) = matches.value_of("read") {
        Task::Read(PathBuf::from(path))
    } else if matches.is_present("query") {
        Task::Query
    } else if matches.is_present("interactive") {
        Task::Interactive
    } else {
        app.print_help()?;
        println!();
        return Ok(());
    };

    // Signals only flip the flag; teardown always runs from the normal
    // control flow below.
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
    let reset_enabled = !matches.is_present("skip-reset");
    let mut target = Target::new(ExpanderPins::new(), opts, reset_enabled);

    if let Task::Interactive = task {
        return interactive::run(
            &mut target,
            PathBuf::from(constants::DEFAULT_FIRMWARE),
            &stop,
        );
    }

    match start(&mut target, &task, &stop) {
        TaskState::Success => Ok(()),
        state => anyhow::bail!("task ended in state {:?}", state),
    }
}

/// Run a one-shot task: enter the bootloader, do the work, start the
/// application, and always put the target and pins back.
fn start<G: PinDriver>(target: &mut Target<G>, task: &Task, stop: &AtomicBool) -> TaskState {
    let mut state = TaskState::Start;
    debug!("task {:?}, state {:?}", task, state);

    state = match target.enter_bootloader() {
        Ok(()) => TaskState::Inited,
        Err(e) => {
            error!("cannot enter bootloader mode: {}", e);
            TaskState::Failed
        }
    };

    if state == TaskState::Inited {
        state = TaskState::Active;
        debug!("task {:?}, state {:?}", task, state);
        state = match run_task(target, task, stop) {
            Ok(()) => match target.go() {
                Ok(()) => TaskState::Success,
                Err(e) => {
                    error!("cannot start the application: {}", e);
                    TaskState::Failed
                }
            },
            Err(e) => {
                error!("{:#}", e);
                TaskState::Failed
            }
        };
    }

    target.leave_bootloader();
    state
}

fn run_task<G: PinDriver>(target: &mut Target<G>, task: &Task, stop: &AtomicBool) -> Result<()> {
    match task {
        Task::Write(path) => write_action(target, path, stop),
        Task::Read(_path) => {
            warn!("flash read is not implemented");
            Ok(())
        }
        Task::Query => query_action(target),
        Task::Interactive => unreachable!("interactive mode is dispatched separately"),
    }
}

/// Erase and program, with a progress bar fed by the chunks-remaining
/// ticks.
pub(crate) fn write_action<G: PinDriver>(
    target: &mut Target<G>,
    path: &std::path::Path,
    stop: &AtomicBool,
) -> Result<()> {
    let size = fs::metadata(path)
        .with_context(|| format!("Cannot stat firmware file `{}`", path.display()))?
        .len();
    let total = (size as usize + constants::MAX_RW_SIZE - 1) / constants::MAX_RW_SIZE;

    let bar = ProgressBar::new(total as u64);
    target
        .update_firmware(path, stop, |remaining| {
            bar.set_position((total - remaining + 1) as u64);
        })
        .with_context(|| format!("Failed to program `{}`", path.display()))?;
    bar.finish();

    Ok(())
}

/// Read and print the target's application version, with update advice on
/// mismatch.
pub(crate) fn query_action<G: PinDriver>(target: &mut Target<G>) -> Result<()> {
    let (version, check) = target
        .query_version()
        .context("Failed to query the target version")?;

    println!("{}", version);
    if check != VersionCheck::Match {
        warn!("Need to update micro!");
    }

    Ok(())
}

fn init_logger(level: log::LevelFilter) -> Result<()> {
    let mut logger = env_logger::Builder::from_env("ISP_LOG");
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
