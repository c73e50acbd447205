// SPDX-License-Identifier: GPL-3.0-or-later

//! Command line.
//!
//! The COM runtime and existing launchers pass Windows-style switches
//! (`-Embedding`, `/Processid:{...}`), so arguments are normalized to the
//! GNU spellings before xflags sees them.

use std::{ffi::OsString, time::Duration};

use anyhow::{Context, Result, bail};
use windows_core::GUID;

use crate::{
    class_spec::{ClassSpec, REGISTER_MULTIPLE_USE, REGISTER_SINGLE_USE},
    guid::parse_guid,
    lifetime::DEFAULT_IDLE_TIMEOUT,
    logging::LoggingSettings,
};

xflags::xflags! {
    /// A minimal host process for COM/ActiveX controls.
    cmd axhost {
        /// CLSID of the class to activate as a surrogate. Supplied by the COM runtime.
        optional class_id: String
        /// Launched by the SCM as a COM server.
        optional --embedding
        /// Activated through OLE Automation. Accepted and ignored.
        optional --automation
        /// Process identifier supplied by the SCM. Accepted and ignored.
        optional --process-id id: String

        /// Register a COM class: CLSID[/ALIAS[/CLSCTX_CREATE[/CLSCTX_REGISTER[/REGCLS]]]].
        repeated --clsid item: String
        /// Exit when no client arrives for this long (ms, s, m or h; default 60000 ms).
        optional --timeout duration: String
        /// Named event signaled once every class is registered.
        optional --ready-event name: String
        /// Register class factories with REGCLS_SINGLEUSE (default).
        optional --single-use
        /// Register class factories with REGCLS_MULTIPLEUSE.
        optional --multiple-use
        optional --enable-logging
        /// trace, debug, info, warn or error.
        optional --log-level level: String
        /// Log to this file (implies --enable-logging).
        optional --log-file file: String
        /// Log to an automatically named file in this directory (implies --enable-logging).
        optional --log-dir dir: String

        /// Register this executable as DllSurrogate for a CLSID.
        optional --register clsid: String
        /// AppID to register under (defaults to the CLSID).
        optional --register-appid appid: String
        /// Enable logging for surrogate launches of the registered AppID.
        optional --register-logging
        optional --register-log-level level: String
        optional --register-log-dir dir: String
        /// Remove the DllSurrogate registration of a CLSID.
        optional --unregister clsid: String

        /// Print the version and exit.
        optional -V, --version
    }
}

const SWITCHES: &[(&str, &str)] = &[
    ("embedding", "--embedding"),
    ("automation", "--automation"),
    ("processid", "--process-id"),
    ("classid", "--clsid"),
    ("timeout", "--timeout"),
    ("readyevent", "--ready-event"),
    ("singleuse", "--single-use"),
    ("multipleuse", "--multiple-use"),
    ("enablelogging", "--enable-logging"),
    ("loglevel", "--log-level"),
    ("logfile", "--log-file"),
    ("logdirectory", "--log-dir"),
    ("register", "--register"),
    ("registerappid", "--register-appid"),
    ("registerlogging", "--register-logging"),
    ("registerloglevel", "--register-log-level"),
    ("registerlogdirectory", "--register-log-dir"),
    ("unregister", "--unregister"),
    ("help", "--help"),
    ("h", "--help"),
    ("?", "--help"),
    ("version", "--version"),
];

/// Rewrites `-Name`, `/Name`, `-Name:value` and `/Name=value` into the long form.
pub fn normalize<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut normalized = Vec::new();
    for arg in args {
        let Some(text) = arg.to_str() else {
            normalized.push(arg);
            continue;
        };
        if text.starts_with("--") {
            normalized.push(arg);
            continue;
        }
        let Some(switch) = text.strip_prefix('-').or_else(|| text.strip_prefix('/')) else {
            normalized.push(arg);
            continue;
        };
        let (name, value) = match switch.find([':', '=']) {
            Some(at) => (&switch[..at], Some(&switch[at + 1..])),
            None => (switch, None),
        };
        let long = SWITCHES
            .iter()
            .find(|(windows, _)| windows.eq_ignore_ascii_case(name))
            .map(|(_, long)| *long);
        match long {
            Some(long) => {
                normalized.push(long.into());
                if let Some(value) = value {
                    normalized.push(value.into());
                }
            }
            None => normalized.push(arg),
        }
    }
    normalized
}

/// Parses `1500`, `1500ms`, `30s`, `5m` or `1h`. A bare number is milliseconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: u64 = number.parse().ok()?;
    let millis = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        _ => return None,
    };
    Some(Duration::from_millis(number.checked_mul(millis)?))
}

pub struct StandaloneOptions {
    pub specs: Vec<ClassSpec>,
    pub ready_event: String,
    pub regcls: u32,
    pub timeout: Duration,
}

pub enum Command {
    Version,
    Register {
        clsid: Option<String>,
        appid: String,
        logging: LoggingSettings,
    },
    Unregister {
        clsid: String,
    },
    Surrogate {
        clsid: GUID,
    },
    Standalone(StandaloneOptions),
    Idle,
}

impl Axhost {
    pub fn from_args<I>(args: I) -> xflags::Result<Axhost>
    where
        I: IntoIterator<Item = OsString>,
    {
        Axhost::from_vec(normalize(args))
    }

    pub fn surrogate_clsid(&self) -> Option<GUID> {
        if !self.embedding {
            return None;
        }
        self.class_id.as_deref().and_then(parse_guid)
    }

    pub fn logging(&self) -> LoggingSettings {
        LoggingSettings {
            enabled: self.enable_logging,
            level: self.log_level.clone().unwrap_or_default(),
            directory: self.log_dir.clone().unwrap_or_default(),
            file: self.log_file.clone().unwrap_or_default(),
        }
    }

    pub fn default_regcls(&self) -> u32 {
        if self.multiple_use {
            REGISTER_MULTIPLE_USE
        } else {
            REGISTER_SINGLE_USE
        }
    }

    pub fn command(&self) -> Result<Command> {
        if self.version {
            return Ok(Command::Version);
        }
        let appid = self
            .register_appid
            .clone()
            .or_else(|| self.register.clone());
        if let Some(appid) = appid {
            return Ok(Command::Register {
                clsid: self.register.clone(),
                appid,
                logging: LoggingSettings {
                    enabled: self.register_logging,
                    level: self.register_log_level.clone().unwrap_or_default(),
                    directory: self.register_log_dir.clone().unwrap_or_default(),
                    file: String::new(),
                },
            });
        }
        if let Some(clsid) = &self.unregister {
            return Ok(Command::Unregister {
                clsid: clsid.clone(),
            });
        }
        if self.embedding {
            if let Some(text) = &self.class_id {
                let Some(clsid) = parse_guid(text) else {
                    bail!("invalid CLSID: {text}");
                };
                return Ok(Command::Surrogate { clsid });
            }
        }
        if self.clsid.is_empty() {
            return Ok(Command::Idle);
        }
        let timeout = match &self.timeout {
            Some(text) => parse_duration(text).with_context(|| format!("invalid timeout: {text}"))?,
            None => DEFAULT_IDLE_TIMEOUT,
        };
        Ok(Command::Standalone(StandaloneOptions {
            specs: self.clsid.iter().map(|item| ClassSpec::parse(item)).collect(),
            ready_event: self.ready_event.clone().unwrap_or_default(),
            regcls: self.default_regcls(),
            timeout,
        }))
    }
}
