// SPDX-License-Identifier: GPL-3.0-or-later

use windows::Win32::System::Com::{COINIT, CoInitializeEx, CoUninitialize};
use windows_core::{HRESULT, Result};

pub struct ComInitializeContext {
    result: HRESULT,
}

impl ComInitializeContext {
    pub fn new(coinit: COINIT) -> ComInitializeContext {
        let result = unsafe { CoInitializeEx(None, coinit) };
        if result.is_err() {
            log::warn!("CoInitializeEx failed: 0x{:08X}", result.0 as u32);
        }
        ComInitializeContext { result }
    }

    pub fn result(&self) -> Result<()> {
        self.result.ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.result.is_ok()
    }
}

impl Drop for ComInitializeContext {
    fn drop(&mut self) {
        if self.result.is_ok() {
            unsafe { CoUninitialize() };
        }
    }
}
