// SPDX-License-Identifier: GPL-3.0-or-later

//! The process-wide COM services the host depends on.
//!
//! Registration, server-process reference counting and exit scheduling all
//! go through [`HostServices`] so the orchestration above it can run against
//! a fake in tests.

use windows::Win32::System::Com::{
    CLSCTX, CoAddRefServerProcess, CoFreeUnusedLibraries, CoGetClassObject,
    CoRegisterClassObject, CoRegisterSurrogate, CoReleaseServerProcess, CoResumeClassObjects,
    CoRevokeClassObject, CoSuspendClassObjects, IClassFactory, ISurrogate, REGCLS,
};
use windows_core::{GUID, IUnknown, Result};

use crate::event_loop::ExitHandle;

pub trait HostServices: Send + Sync {
    fn suspend_class_objects(&self) -> Result<()>;
    fn resume_class_objects(&self) -> Result<()>;
    fn register_class_object(
        &self,
        clsid: &GUID,
        factory: &IUnknown,
        clsctx: u32,
        regcls: u32,
    ) -> Result<u32>;
    fn revoke_class_object(&self, cookie: u32) -> Result<()>;
    fn get_class_object(&self, clsid: &GUID, clsctx: u32) -> Result<IClassFactory>;
    fn register_surrogate(&self, surrogate: &ISurrogate) -> Result<()>;
    fn add_ref_server_process(&self) -> u32;
    fn release_server_process(&self) -> u32;
    fn free_unused_libraries(&self);
    /// Schedules the message loop to finish. False if that could not be arranged.
    fn exit_later(&self, code: i32) -> bool;
}

pub struct OleHostServices {
    exit: ExitHandle,
}

impl OleHostServices {
    pub fn new(exit: ExitHandle) -> OleHostServices {
        OleHostServices { exit }
    }
}

impl HostServices for OleHostServices {
    fn suspend_class_objects(&self) -> Result<()> {
        unsafe { CoSuspendClassObjects() }
    }

    fn resume_class_objects(&self) -> Result<()> {
        unsafe { CoResumeClassObjects() }
    }

    fn register_class_object(
        &self,
        clsid: &GUID,
        factory: &IUnknown,
        clsctx: u32,
        regcls: u32,
    ) -> Result<u32> {
        unsafe { CoRegisterClassObject(clsid, factory, CLSCTX(clsctx as _), REGCLS(regcls as _)) }
    }

    fn revoke_class_object(&self, cookie: u32) -> Result<()> {
        unsafe { CoRevokeClassObject(cookie) }
    }

    fn get_class_object(&self, clsid: &GUID, clsctx: u32) -> Result<IClassFactory> {
        unsafe { CoGetClassObject(clsid, CLSCTX(clsctx as _), None) }
    }

    fn register_surrogate(&self, surrogate: &ISurrogate) -> Result<()> {
        unsafe { CoRegisterSurrogate(surrogate) }
    }

    fn add_ref_server_process(&self) -> u32 {
        unsafe { CoAddRefServerProcess() }
    }

    fn release_server_process(&self) -> u32 {
        unsafe { CoReleaseServerProcess() }
    }

    fn free_unused_libraries(&self) {
        unsafe { CoFreeUnusedLibraries() };
    }

    fn exit_later(&self, code: i32) -> bool {
        self.exit.exit_later(code)
    }
}
