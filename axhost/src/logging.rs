// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    env, io,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
};

use flexi_logger::{
    DeferredNow, FileSpec, LogSpecification, Logger, LoggerHandle, WriteMode, writers::LogWriter,
};
use log::{LevelFilter, Log};

const LOGGER_NAME: &str = "axhost";

pub(crate) struct WinDbgLogWriter;

impl LogWriter for WinDbgLogWriter {
    fn write(&self, _now: &mut DeferredNow, record: &log::Record) -> io::Result<()> {
        win_dbg_logger::DEBUGGER_LOGGER.log(record);
        Ok(())
    }
    fn flush(&self) -> io::Result<()> {
        win_dbg_logger::DEBUGGER_LOGGER.flush();
        Ok(())
    }
}

/// Standalone mode fills this from the command line, surrogate mode from
/// the AppID key of the activated class.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoggingSettings {
    pub enabled: bool,
    pub level: String,
    pub directory: String,
    pub file: String,
}

impl LoggingSettings {
    /// The file to log to, if any. An explicit file or directory turns logging on.
    pub fn log_file_path(&self, pid: u32) -> Option<PathBuf> {
        if !self.file.is_empty() {
            return Some(PathBuf::from(&self.file));
        }
        let directory = if !self.directory.is_empty() {
            PathBuf::from(&self.directory)
        } else if self.enabled {
            default_log_directory()
        } else {
            return None;
        };
        Some(directory.join(format!("{LOGGER_NAME}-{pid}.log")))
    }

    pub fn level_filter(&self) -> LevelFilter {
        parse_level(&self.level).unwrap_or(LevelFilter::Info)
    }
}

pub fn default_log_directory() -> PathBuf {
    env::temp_dir().join(LOGGER_NAME)
}

pub fn parse_level(text: &str) -> Option<LevelFilter> {
    match text.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" | "err" => Some(LevelFilter::Error),
        _ => None,
    }
}

fn file_spec(path: &Path) -> FileSpec {
    let mut spec = FileSpec::default().suppress_timestamp();
    if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        spec = spec.directory(directory);
    }
    if let Some(stem) = path.file_stem() {
        spec = spec.basename(stem.to_string_lossy());
    }
    match path.extension() {
        Some(extension) => spec.suffix(extension.to_string_lossy()),
        None => spec.o_suffix(None::<String>),
    }
}

/// Starts the logger. Output always goes to the debugger; a file is added
/// when the settings ask for one. Returns `None` if the logger could not start.
pub fn init(settings: &LoggingSettings) -> Option<LoggerHandle> {
    let spec = LogSpecification::builder()
        .default(settings.level_filter())
        .build();
    let writer = Box::new(WinDbgLogWriter);
    let logger = Logger::with(spec)
        .format(flexi_logger::detailed_format)
        .panic_if_error_channel_is_broken(false)
        .use_windows_line_ending()
        .write_mode(WriteMode::BufferAndFlush);
    let logger = match settings.log_file_path(std::process::id()) {
        Some(path) => logger
            .log_to_file_and_writer(file_spec(&path), writer)
            .append(),
        None => logger.log_to_writer(writer),
    };
    let handle = logger.start().ok()?;
    install_panic_hook();
    Some(handle)
}

fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        log::error!("{info}");
        log::logger().flush();
        previous(info);
    }));
}
