// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicU32, Ordering};

use windows::Win32::System::Com::{EXTCONN_STRONG, IExternalConnection, IExternalConnection_Impl};
use windows_core::{BOOL, implement};

/// Tracks strong external connections, forwarding to the control when it
/// implements `IExternalConnection` itself.
#[implement(IExternalConnection)]
pub struct HostExternalConnection {
    underlying: Option<IExternalConnection>,
    strong: AtomicU32,
}

impl HostExternalConnection {
    pub fn new(underlying: Option<IExternalConnection>) -> HostExternalConnection {
        HostExternalConnection {
            underlying,
            strong: AtomicU32::new(0),
        }
    }

    pub fn strong_connections(&self) -> u32 {
        self.strong.load(Ordering::SeqCst)
    }

    pub fn add_connection(&self, extconn: u32, reserved: u32) -> u32 {
        let count = if is_strong(extconn) {
            self.strong.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.strong_connections()
        };
        match &self.underlying {
            Some(underlying) => unsafe { underlying.AddConnection(extconn, reserved) },
            None => count,
        }
    }

    pub fn release_connection(&self, extconn: u32, reserved: u32, last_release_closes: BOOL) -> u32 {
        let count = if is_strong(extconn) {
            match self
                .strong
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            {
                Ok(previous) => previous - 1,
                Err(_) => {
                    log::warn!("external connection released without being added");
                    0
                }
            }
        } else {
            self.strong_connections()
        };
        match &self.underlying {
            Some(underlying) => unsafe {
                underlying.ReleaseConnection(extconn, reserved, last_release_closes.as_bool())
            },
            None => count,
        }
    }
}

fn is_strong(extconn: u32) -> bool {
    extconn & EXTCONN_STRONG.0 as u32 != 0
}

impl IExternalConnection_Impl for HostExternalConnection_Impl {
    fn AddConnection(&self, extconn: u32, reserved: u32) -> u32 {
        self.add_connection(extconn, reserved)
    }

    fn ReleaseConnection(&self, extconn: u32, reserved: u32, flastreleasecloses: BOOL) -> u32 {
        self.release_connection(extconn, reserved, flastreleasecloses)
    }
}
