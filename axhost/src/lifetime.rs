// SPDX-License-Identifier: GPL-3.0-or-later

//! Process lifetime accounting.
//!
//! Hosted containers and `LockServer` calls hold server references. When the
//! last one goes away the process either exits right away (single-use
//! standalone server) or re-arms the idle deadline and exits once that
//! passes with nothing new attached.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{notify, services::HostServices};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(60_000);

#[derive(Debug, Default)]
pub struct ProcessReferences {
    instances: AtomicU32,
    locks: AtomicU32,
}

impl ProcessReferences {
    pub const fn new() -> ProcessReferences {
        ProcessReferences {
            instances: AtomicU32::new(0),
            locks: AtomicU32::new(0),
        }
    }

    pub fn instance_created(&self) -> u32 {
        self.instances.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn instance_destroyed(&self) -> Option<u32> {
        decrement(&self.instances)
    }

    pub fn lock(&self) -> u32 {
        self.locks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn unlock(&self) -> Option<u32> {
        decrement(&self.locks)
    }

    pub fn instances(&self) -> u32 {
        self.instances.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> u32 {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.instances() == 0 && self.locks() == 0
    }
}

/// `None` when the counter was already zero.
fn decrement(counter: &AtomicU32) -> Option<u32> {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .map(|previous| previous - 1)
        .ok()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostMode {
    Surrogate,
    Standalone { multiple_use: bool },
}

#[derive(Debug, Default)]
struct IdleState {
    deadline: Option<Instant>,
    warned_idle: bool,
    exit_scheduled: bool,
    last_cleanup: Option<Instant>,
}

enum IdleDecision {
    Rearm,
    Exit { warn: bool },
    AlreadyExiting,
}

pub struct ServerLifetime {
    services: Arc<dyn HostServices>,
    mode: HostMode,
    timeout: Duration,
    cleanup_interval: Duration,
    references: ProcessReferences,
    acquisitions: AtomicU32,
    state: Mutex<IdleState>,
}

impl ServerLifetime {
    pub fn new(services: Arc<dyn HostServices>, mode: HostMode, timeout: Duration) -> ServerLifetime {
        ServerLifetime {
            services,
            mode,
            timeout,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            references: ProcessReferences::new(),
            acquisitions: AtomicU32::new(0),
            state: Mutex::new(IdleState::default()),
        }
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> ServerLifetime {
        self.cleanup_interval = interval;
        self
    }

    pub fn mode(&self) -> HostMode {
        self.mode
    }

    pub fn references(&self) -> &ProcessReferences {
        &self.references
    }

    pub fn add_server_reference(&self) {
        self.services.add_ref_server_process();
        let locks = self.references.lock();
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        log::debug!("server locked, {locks} lock(s)");
    }

    /// An unlock without a matching lock leaves the process reference alone.
    pub fn release_server_reference(&self) {
        let Some(locks) = self.references.unlock() else {
            log::error!("server unlocked more often than locked");
            return;
        };
        log::debug!("server unlocked, {locks} lock(s)");
        self.release_server_process();
    }

    pub fn instance_created(&self) {
        self.services.add_ref_server_process();
        let instances = self.references.instance_created();
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        log::debug!("container created, {instances} instance(s)");
    }

    pub fn instance_destroyed(&self) {
        let Some(instances) = self.references.instance_destroyed() else {
            log::error!("container destroyed more often than created");
            return;
        };
        log::debug!("container destroyed, {instances} instance(s)");
        self.release_server_process();
    }

    fn release_server_process(&self) {
        if self.services.release_server_process() == 0 {
            self.on_last_reference();
        }
    }

    fn on_last_reference(&self) {
        match self.mode {
            HostMode::Standalone {
                multiple_use: false,
            } => {
                log::info!("last server reference released");
                self.exit_later();
            }
            // A multiple-use factory may see the next client shortly, and a
            // surrogate leaves the decision to the SCM, so only re-arm here.
            _ => self.check_for_exit_later(),
        }
    }

    pub fn start(&self) {
        self.arm(Instant::now());
    }

    pub fn check_for_exit_later(&self) {
        self.arm(Instant::now());
    }

    fn arm(&self, now: Instant) {
        let mut state = self.state();
        if !state.exit_scheduled {
            state.deadline = Some(now + self.timeout);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state().deadline
    }

    pub fn poll(&self, now: Instant) {
        let expired = {
            let mut state = self.state();
            match state.deadline {
                Some(deadline) if deadline <= now => {
                    state.deadline = None;
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.check_for_exit(now);
        }
    }

    pub fn check_for_exit(&self, now: Instant) {
        let idle = self.references.is_idle();
        let untouched = self.acquisitions.load(Ordering::SeqCst) == 0;
        let decision = {
            let mut state = self.state();
            if state.exit_scheduled {
                IdleDecision::AlreadyExiting
            } else if idle {
                let warn = untouched && !state.warned_idle;
                state.warned_idle |= warn;
                IdleDecision::Exit { warn }
            } else {
                state.deadline = Some(now + self.timeout);
                IdleDecision::Rearm
            }
        };
        match decision {
            IdleDecision::Exit { warn } => {
                if warn {
                    notify::warning(
                        "Idle Timeout",
                        &format!(
                            "No COM interaction has occurred within {} ms. The process will exit.",
                            self.timeout.as_millis()
                        ),
                    );
                }
                self.exit_later();
            }
            IdleDecision::Rearm => {
                log::debug!(
                    "still in use ({} instance(s), {} lock(s))",
                    self.references.instances(),
                    self.references.locks()
                );
            }
            IdleDecision::AlreadyExiting => {}
        }
    }

    /// Schedules process exit once. Returns false if it could not be scheduled.
    pub fn exit_later(&self) -> bool {
        {
            let mut state = self.state();
            if state.exit_scheduled {
                return true;
            }
            state.exit_scheduled = true;
            state.deadline = None;
        }
        if self.services.exit_later(0) {
            return true;
        }
        let mut state = self.state();
        state.exit_scheduled = false;
        state.deadline = Some(Instant::now() + self.timeout);
        false
    }

    pub fn is_exit_scheduled(&self) -> bool {
        self.state().exit_scheduled
    }

    pub fn has_warned_idle(&self) -> bool {
        self.state().warned_idle
    }

    /// Idle hook of the message loop: lets COM unload unused in-process
    /// servers at most once per cleanup interval.
    pub fn about_to_block(&self, now: Instant) {
        let due = {
            let mut state = self.state();
            let due = state
                .last_cleanup
                .is_none_or(|last| now.saturating_duration_since(last) >= self.cleanup_interval);
            if due {
                state.last_cleanup = Some(now);
            }
            due
        };
        if due {
            self.services.free_unused_libraries();
        }
    }

    fn state(&self) -> MutexGuard<'_, IdleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
