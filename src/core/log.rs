/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

enum SharedOutput<'a> {
    Stdout(io::Stdout),
    File(&'a Mutex<File>),
}

impl Write for SharedOutput<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Stdout(g) => g.write(buf),
            Self::File(g) => match g.lock() {
                Ok(mut f) => f.write(buf),
                Err(e) => e.into_inner().write(buf),
            },
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Stdout(g) => g.flush(),
            Self::File(g) => match g.lock() {
                Ok(mut f) => f.flush(),
                Err(e) => e.into_inner().flush(),
            },
        }
    }
}

/// Map a 0-4 verbosity (as in the config file and `--loglevel`) to a
/// filter. Values above 4 enable everything.
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

fn write_line<W: Write>(
    out: &mut W,
    level: Level,
    ts: &str,
    target: &str,
    args: &fmt::Arguments,
) -> Result<(), io::Error> {
    let lname = level_name(level);

    if level <= Level::Info {
        writeln!(out, "[{}] {} {}", lname, ts, args)
    } else {
        writeln!(out, "[{}] {} [{}] {}", lname, ts, target, args)
    }
}

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut output = match &self.output_file {
            Some(f) => SharedOutput::File(f),
            None => SharedOutput::Stdout(io::stdout()),
        };

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let ts = now.format(&format).unwrap_or_default();

        // nowhere to report a failure to log
        let _ = write_line(
            &mut output,
            record.level(),
            &ts,
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {}
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(output_file: Option<File>) {
    LOGGER.get_or_init(|| {
        // SAFETY: we accept that this call is unsound. on some platforms it
        // is the only way to know the time zone, with a chance of UB if
        // another thread modifies environment vars during the call. the risk
        // is low, as this call will happen very early in the program, and
        // only once
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    });
}

pub fn get_simple_logger() -> &'static SimpleLogger {
    ensure_init_simple_logger(None);

    match LOGGER.get() {
        Some(l) => l,
        None => unreachable!("logger initialized above"),
    }
}

pub fn local_offset_check() {
    if get_simple_logger().local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}
