// SPDX-License-Identifier: GPL-3.0-or-later

use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    System::Threading::{CreateEventW, GetCurrentProcessId, SetEvent},
};
use windows_core::{HSTRING, Result};

pub fn default_ready_event_name(pid: u32) -> String {
    format!(r"Local\AxHost_Ready_{pid}")
}

pub struct HostReadyEvent {
    name: String,
    handle: HANDLE,
}

impl HostReadyEvent {
    /// Opens or creates the event. An empty name selects the per-process default.
    pub fn new(name: &str) -> Result<HostReadyEvent> {
        let name = if name.is_empty() {
            default_ready_event_name(unsafe { GetCurrentProcessId() })
        } else {
            name.to_owned()
        };
        let handle = unsafe { CreateEventW(None, true, false, &HSTRING::from(name.as_str())) }?;
        Ok(HostReadyEvent { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub(crate) fn is_signaled(&self) -> bool {
        use windows::Win32::{Foundation::WAIT_OBJECT_0, System::Threading::WaitForSingleObject};

        unsafe { WaitForSingleObject(self.handle, 0) == WAIT_OBJECT_0 }
    }

    pub fn set(&self) -> Result<()> {
        log::info!("signaling ready event {}", self.name);
        unsafe { SetEvent(self.handle) }
    }
}

impl Drop for HostReadyEvent {
    fn drop(&mut self) {
        if let Err(error) = unsafe { CloseHandle(self.handle) } {
            log::warn!("failed to close ready event {}: {error}", self.name);
        }
    }
}
