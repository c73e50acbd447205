// SPDX-License-Identifier: GPL-3.0-or-later

//! DllSurrogate registration under `HKEY_CLASSES_ROOT`.
//!
//! `CLSID\{clsid}\AppID` points at `AppID\{appid}`, whose `DllSurrogate`
//! value names this executable. Logging settings for surrogate launches live
//! next to it.

use std::env;

use windows::Win32::{
    Foundation::{E_ACCESSDENIED, E_FAIL, ERROR_FILE_NOT_FOUND},
    UI::Shell::IsUserAnAdmin,
};
use windows_core::{HRESULT, Result};
use windows_registry::{CLASSES_ROOT, Key};

use crate::{
    guid::{format_guid, parse_guid},
    logging::LoggingSettings,
    notify,
};

const APPID_VALUE: &str = "AppID";
const SURROGATE_VALUE: &str = "DllSurrogate";
const LOG_ENABLED_VALUE: &str = "LogEnabled";
const LOG_LEVEL_VALUE: &str = "LogLevel";
const LOG_DIRECTORY_VALUE: &str = "LogDirectory";

pub fn is_running_as_admin() -> bool {
    unsafe { IsUserAnAdmin() }.as_bool()
}

pub fn normalize_id(text: &str) -> String {
    match parse_guid(text) {
        Some(guid) => format_guid(&guid),
        None => text.trim().to_owned(),
    }
}

pub fn clsid_key_path(clsid: &str) -> String {
    format!(r"CLSID\{}", normalize_id(clsid))
}

pub fn appid_key_path(appid: &str) -> String {
    format!(r"AppID\{}", normalize_id(appid))
}

fn require_admin(action: &str) -> Result<()> {
    if is_running_as_admin() {
        return Ok(());
    }
    notify::critical(
        "Administrator Privileges Required",
        &format!("{action} requires administrator privileges.\nPlease run this command as administrator."),
    );
    Err(E_ACCESSDENIED.into())
}

fn report(what: &str, path: &str) -> impl FnOnce(windows_core::Error) -> windows_core::Error {
    let text = format!(r"{what}: HKEY_CLASSES_ROOT\{path}");
    move |error| {
        notify::critical("Registry Update Failed", &format!("{text}\n\n{}", notify::describe(&error)));
        error
    }
}

fn remove_value_if_present(key: &Key, name: &str) -> Result<()> {
    match key.remove_value(name) {
        Err(error) if error.code() == HRESULT::from_win32(ERROR_FILE_NOT_FOUND.0) => Ok(()),
        other => other,
    }
}

/// Makes this executable the DllSurrogate for `clsid`. An empty `appid` uses the CLSID.
pub fn register_surrogate(clsid: &str, appid: &str) -> Result<()> {
    require_admin("Registering COM surrogates")?;
    let appid = if appid.is_empty() { clsid } else { appid };
    let exe = env::current_exe().map_err(|error| {
        log::error!("cannot locate the executable: {error}");
        windows_core::Error::from(E_FAIL)
    })?;
    let exe = exe.to_string_lossy();

    let clsid_path = clsid_key_path(clsid);
    let clsid_key = CLASSES_ROOT
        .create(&clsid_path)
        .map_err(report("Could not create registry key", &clsid_path))?;
    clsid_key
        .set_string(APPID_VALUE, normalize_id(appid))
        .map_err(report("Could not set AppID", &clsid_path))?;

    let appid_path = appid_key_path(appid);
    let appid_key = CLASSES_ROOT
        .create(&appid_path)
        .map_err(report("Could not create registry key", &appid_path))?;
    appid_key
        .set_string(SURROGATE_VALUE, &*exe)
        .map_err(report("Could not set DllSurrogate", &appid_path))?;

    notify::information(
        "Surrogate Registered",
        &format!(
            "CLSID: {}\nAppID: {}\nDllSurrogate: {exe}",
            normalize_id(clsid),
            normalize_id(appid)
        ),
    );
    Ok(())
}

pub fn unregister_surrogate(clsid: &str) -> Result<()> {
    require_admin("Unregistering COM surrogates")?;
    let clsid_path = clsid_key_path(clsid);
    let Ok(clsid_key) = CLASSES_ROOT.open(&clsid_path) else {
        log::info!(r"HKEY_CLASSES_ROOT\{clsid_path} does not exist");
        return Ok(());
    };
    let appid = clsid_key.get_string(APPID_VALUE).ok();
    remove_value_if_present(&clsid_key, APPID_VALUE)
        .map_err(report("Could not remove AppID", &clsid_path))?;

    if let Some(appid) = &appid {
        let appid_path = appid_key_path(appid);
        if let Ok(appid_key) = CLASSES_ROOT.open(&appid_path) {
            remove_value_if_present(&appid_key, SURROGATE_VALUE)
                .map_err(report("Could not remove DllSurrogate", &appid_path))?;
        }
    }

    notify::information(
        "Surrogate Unregistered",
        &format!(
            "CLSID: {}{}",
            normalize_id(clsid),
            appid.map(|appid| format!("\nAppID: {appid}")).unwrap_or_default()
        ),
    );
    Ok(())
}

pub fn write_logging_settings(appid: &str, settings: &LoggingSettings) -> Result<()> {
    require_admin("Writing logging settings")?;
    let appid_path = appid_key_path(appid);
    let key = CLASSES_ROOT
        .open(&appid_path)
        .map_err(report("Could not open registry key", &appid_path))?;
    key.set_u32(LOG_ENABLED_VALUE, u32::from(settings.enabled))
        .map_err(report("Could not set LogEnabled", &appid_path))?;
    if !settings.level.is_empty() {
        key.set_string(LOG_LEVEL_VALUE, &settings.level)
            .map_err(report("Could not set LogLevel", &appid_path))?;
    }
    if !settings.directory.is_empty() {
        key.set_string(LOG_DIRECTORY_VALUE, &settings.directory)
            .map_err(report("Could not set LogDirectory", &appid_path))?;
    }
    log::info!(r"logging settings written to HKEY_CLASSES_ROOT\{appid_path}");
    Ok(())
}

/// Logging settings for a surrogate launch of `clsid`. Anything missing reads as default.
pub fn read_logging_settings(clsid: &str) -> LoggingSettings {
    let mut settings = LoggingSettings::default();
    let Some(appid) = CLASSES_ROOT
        .open(clsid_key_path(clsid))
        .and_then(|key| key.get_string(APPID_VALUE))
        .ok()
    else {
        return settings;
    };
    let Ok(key) = CLASSES_ROOT.open(appid_key_path(&appid)) else {
        return settings;
    };
    settings.enabled = key.get_u32(LOG_ENABLED_VALUE).is_ok_and(|value| value != 0);
    settings.level = key.get_string(LOG_LEVEL_VALUE).unwrap_or_default();
    settings.directory = key.get_string(LOG_DIRECTORY_VALUE).unwrap_or_default();
    settings
}
