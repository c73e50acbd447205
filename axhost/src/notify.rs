// SPDX-License-Identifier: GPL-3.0-or-later

//! User-facing notifications.
//!
//! Every message goes to the log. A blocking message box is shown only once
//! the process opted in with [`set_interactive`], so library users and unit
//! tests never block on a dialog.

use std::sync::atomic::{AtomicBool, Ordering};

use windows::Win32::UI::WindowsAndMessaging::{
    MB_ICONERROR, MB_ICONINFORMATION, MB_ICONWARNING, MB_OK, MESSAGEBOX_STYLE, MessageBoxW,
};
use windows_core::{Error, HSTRING};

const CAPTION: &str = "axhost";

static INTERACTIVE: AtomicBool = AtomicBool::new(false);

pub fn set_interactive(enabled: bool) {
    INTERACTIVE.store(enabled, Ordering::Relaxed);
}

pub fn information(title: &str, text: &str) {
    log::info!("{title}: {text}");
    show(title, text, MB_ICONINFORMATION);
}

pub fn warning(title: &str, text: &str) {
    log::warn!("{title}: {text}");
    show(title, text, MB_ICONWARNING);
}

pub fn critical(title: &str, text: &str) {
    log::error!("{title}: {text}");
    show(title, text, MB_ICONERROR);
}

/// Renders an error as "message (HRESULT: 0x........)".
pub fn describe(error: &Error) -> String {
    let message = error.message();
    let code = error.code().0 as u32;
    if message.is_empty() {
        format!("HRESULT: 0x{code:08X}")
    } else {
        format!("{message} (HRESULT: 0x{code:08X})")
    }
}

fn show(title: &str, text: &str, icon: MESSAGEBOX_STYLE) {
    if !INTERACTIVE.load(Ordering::Relaxed) {
        return;
    }
    let body = HSTRING::from(format!("{title}\n\n{text}"));
    unsafe {
        MessageBoxW(None, &body, &HSTRING::from(CAPTION), MB_OK | icon);
    }
}
