// SPDX-License-Identifier: GPL-3.0-or-later

//! Main-thread message loop.
//!
//! Besides dispatching window messages for the apartment it fires the
//! idle-exit deadline and calls the "about to block" hook before every wait.

use std::time::Instant;

use windows::Win32::{
    Foundation::{LPARAM, WPARAM},
    System::Threading::{GetCurrentThreadId, INFINITE},
    UI::WindowsAndMessaging::{
        DispatchMessageW, MSG, MWMO_INPUTAVAILABLE, MsgWaitForMultipleObjectsEx, PM_NOREMOVE,
        PM_REMOVE, PeekMessageW, PostThreadMessageW, QS_ALLINPUT, TranslateMessage, WM_APP,
        WM_QUIT,
    },
};

use crate::lifetime::ServerLifetime;

const WM_EXIT_LATER: u32 = WM_APP + 0x41;

#[derive(Clone, Copy, Debug)]
pub struct ExitHandle {
    thread_id: u32,
}

impl ExitHandle {
    pub fn exit_later(&self, code: i32) -> bool {
        let posted = unsafe {
            PostThreadMessageW(
                self.thread_id,
                WM_EXIT_LATER,
                WPARAM(code as u32 as usize),
                LPARAM(0),
            )
        };
        match posted {
            Ok(()) => true,
            Err(error) => {
                log::error!("failed to schedule exit: {error}");
                false
            }
        }
    }
}

pub struct MessageLoop {
    thread_id: u32,
}

impl Default for MessageLoop {
    fn default() -> Self {
        MessageLoop::new()
    }
}

impl MessageLoop {
    /// Must be created on the thread that will call [`MessageLoop::run`].
    pub fn new() -> MessageLoop {
        let mut msg = MSG::default();
        // Make sure the thread has a queue before anyone posts to it.
        unsafe {
            let _ = PeekMessageW(&mut msg, None, 0, 0, PM_NOREMOVE);
        }
        MessageLoop {
            thread_id: unsafe { GetCurrentThreadId() },
        }
    }

    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle {
            thread_id: self.thread_id,
        }
    }

    /// Runs until an exit is scheduled or `WM_QUIT` arrives, returning the exit code.
    pub fn run(&self, lifetime: &ServerLifetime) -> i32 {
        let mut msg = MSG::default();
        loop {
            while unsafe { PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE) }.as_bool() {
                if msg.hwnd.is_invalid() && msg.message == WM_EXIT_LATER {
                    log::info!("leaving message loop with exit code {}", msg.wParam.0 as i32);
                    return msg.wParam.0 as i32;
                }
                if msg.message == WM_QUIT {
                    return msg.wParam.0 as i32;
                }
                unsafe {
                    let _ = TranslateMessage(&msg);
                    DispatchMessageW(&msg);
                }
            }

            let now = Instant::now();
            lifetime.poll(now);
            lifetime.about_to_block(now);

            let timeout = match lifetime.deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(u128::from(INFINITE - 1)) as u32,
                None => INFINITE,
            };
            unsafe {
                let _ = MsgWaitForMultipleObjectsEx(None, timeout, QS_ALLINPUT, MWMO_INPUTAVAILABLE);
            }
        }
    }
}
