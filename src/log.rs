//! Run log for cadence.
//!
//! Everything goes to `~/.cadence/cadence.log`, truncated on each start.
//! ERROR covers terminal failures and persistence errors, WARN retries and
//! milestone delays, INFO the run lifecycle. DEBUG adds readiness and
//! estimation detail and TRACE the simulator's per-tick state; both are
//! written only with `--debug` or `CADENCE_DEBUG=1`.
//!
//! Until `init` runs nothing is written, so library users and tests stay quiet.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static SINK: OnceLock<Sink> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        })
    }
}

/// Log file plus the most verbose level it accepts.
#[derive(Debug)]
struct Sink {
    path: PathBuf,
    max: Level,
}

impl Sink {
    fn create(path: &Path, max: Level) -> Option<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).ok()?;
        }
        std::fs::write(path, "").ok()?;
        Some(Self {
            path: path.to_path_buf(),
            max,
        })
    }

    fn accepts(&self, level: Level) -> bool {
        level <= self.max
    }

    fn append(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.accepts(level) {
            return;
        }
        if let Ok(mut file) = OpenOptions::new().append(true).open(&self.path) {
            let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level, args);
        }
    }
}

fn debug_from_env() -> bool {
    std::env::var("CADENCE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Start logging. `debug` (or `CADENCE_DEBUG`) lowers the threshold to TRACE.
pub fn init(debug: bool) {
    let max = if debug || debug_from_env() {
        Level::Trace
    } else {
        Level::Info
    };
    let Some(path) = dirs::home_dir().map(|h| h.join(".cadence").join("cadence.log")) else {
        return;
    };
    if let Some(sink) = Sink::create(&path, max) {
        SINK.set(sink).ok();
    }
}

/// Used by the `clog*` macros.
#[doc(hidden)]
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if let Some(sink) = SINK.get() {
        sink.append(level, args);
    }
}

#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Trace, format_args!($($arg)*))
    };
}
