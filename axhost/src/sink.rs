// SPDX-License-Identifier: GPL-3.0-or-later

//! Event sink proxy.
//!
//! The control fires events on whatever thread it likes. The proxy parks
//! the client sink in the global interface table and replays every
//! `Invoke` on a pool thread, pumping the caller's apartment until the call
//! has finished so re-entrant calls keep flowing.

use std::sync::{Arc, mpsc};

use windows::Win32::{
    Foundation::{
        CloseHandle, DISP_E_UNKNOWNINTERFACE, E_FAIL, E_NOTIMPL, E_UNEXPECTED, HANDLE,
        RPC_E_CALL_REJECTED,
    },
    System::{
        Com::{
            CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED,
            COWAIT_DISPATCH_CALLS, COWAIT_INPUTAVAILABLE, CoCreateInstance,
            CoWaitForMultipleHandles, DISPATCH_FLAGS, DISPPARAMS, EXCEPINFO, IDispatch,
            IDispatch_Impl, IGlobalInterfaceTable, ITypeInfo,
        },
        Threading::{CreateEventW, INFINITE, SetEvent},
        Variant::VARIANT,
    },
};
use windows_core::{GUID, HRESULT, IUnknown, Interface, PCWSTR, Result, implement};

use crate::{com_init::ComInitializeContext, worker_pool::WorkerPool};

/// `CLSID_StdGlobalInterfaceTable`
const STD_GLOBAL_INTERFACE_TABLE: GUID = GUID::from_u128(0x00000323_0000_0000_c000_000000000046);

thread_local! {
    static WORKER_APARTMENT: ComInitializeContext = ComInitializeContext::new(COINIT_MULTITHREADED);
}

#[implement(IDispatch)]
pub struct HostEventSink {
    /// Global interface table cookie, 0 if the sink could not be registered.
    cookie: u32,
    _sink: IUnknown,
}

impl HostEventSink {
    pub fn new(sink: &IUnknown) -> HostEventSink {
        let cookie = match register_in_global(sink) {
            Ok(cookie) => cookie,
            Err(error) => {
                log::error!("unable to register event sink in the global interface table: {error}");
                0
            }
        };
        HostEventSink {
            cookie,
            _sink: sink.clone(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.cookie != 0
    }
}

impl Drop for HostEventSink {
    fn drop(&mut self) {
        if self.cookie == 0 {
            return;
        }
        if let Err(error) =
            global_interface_table().and_then(|git| unsafe { git.RevokeInterfaceFromGlobal(self.cookie) })
        {
            log::warn!("unable to revoke event sink {}: {error}", self.cookie);
        }
    }
}

fn global_interface_table() -> Result<IGlobalInterfaceTable> {
    unsafe { CoCreateInstance(&STD_GLOBAL_INTERFACE_TABLE, None, CLSCTX_INPROC_SERVER) }
}

fn register_in_global(sink: &IUnknown) -> Result<u32> {
    let dispatch: IDispatch = sink.cast()?;
    let git = global_interface_table()?;
    unsafe { git.RegisterInterfaceInGlobal(&dispatch, &IDispatch::IID) }
}

fn dispatch_from_global(cookie: u32) -> Result<IDispatch> {
    let git = global_interface_table()?;
    let mut raw = std::ptr::null_mut();
    unsafe {
        git.GetInterfaceFromGlobal(cookie, &IDispatch::IID, &mut raw)?;
        Ok(IDispatch::from_raw(raw))
    }
}

impl IDispatch_Impl for HostEventSink_Impl {
    fn GetTypeInfoCount(&self) -> Result<u32> {
        Ok(0)
    }

    fn GetTypeInfo(&self, _itinfo: u32, _lcid: u32) -> Result<ITypeInfo> {
        Err(E_NOTIMPL.into())
    }

    fn GetIDsOfNames(
        &self,
        _riid: *const GUID,
        _rgsznames: *const PCWSTR,
        _cnames: u32,
        _lcid: u32,
        _rgdispid: *mut i32,
    ) -> Result<()> {
        Err(E_NOTIMPL.into())
    }

    fn Invoke(
        &self,
        dispidmember: i32,
        riid: *const GUID,
        lcid: u32,
        wflags: DISPATCH_FLAGS,
        pdispparams: *const DISPPARAMS,
        pvarresult: *mut VARIANT,
        pexcepinfo: *mut EXCEPINFO,
        puargerr: *mut u32,
    ) -> Result<()> {
        if riid.is_null() || unsafe { *riid } != GUID::zeroed() {
            return Err(DISP_E_UNKNOWNINTERFACE.into());
        }
        if self.cookie == 0 {
            return Err(E_UNEXPECTED.into());
        }
        let call = InvokeCall {
            cookie: self.cookie,
            dispid: dispidmember,
            lcid,
            flags: wflags,
            params: pdispparams,
            result: pvarresult,
            exception: pexcepinfo,
            arg_error: puargerr,
        };
        dispatch_on_worker(call).ok()
    }
}

struct InvokeCall {
    cookie: u32,
    dispid: i32,
    lcid: u32,
    flags: DISPATCH_FLAGS,
    params: *const DISPPARAMS,
    result: *mut VARIANT,
    exception: *mut EXCEPINFO,
    arg_error: *mut u32,
}

// The calling thread stays inside `Invoke` until the worker has signalled,
// so the borrowed argument pointers outlive the worker's use of them.
unsafe impl Send for InvokeCall {}

impl InvokeCall {
    fn run(self) -> HRESULT {
        if let Err(error) = WORKER_APARTMENT.with(ComInitializeContext::result) {
            return error.code();
        }
        let dispatch = match dispatch_from_global(self.cookie) {
            Ok(dispatch) => dispatch,
            Err(error) => return error.code(),
        };
        let iid_null = GUID::zeroed();
        unsafe {
            (Interface::vtable(&dispatch).Invoke)(
                Interface::as_raw(&dispatch),
                self.dispid,
                &iid_null,
                self.lcid,
                self.flags,
                self.params,
                self.result,
                self.exception,
                self.arg_error,
            )
        }
    }
}

struct Completion(HANDLE);

unsafe impl Send for Completion {}
unsafe impl Sync for Completion {}

impl Completion {
    fn new() -> Result<Completion> {
        unsafe { CreateEventW(None, true, false, None) }.map(Completion)
    }

    fn signal(&self) {
        if let Err(error) = unsafe { SetEvent(self.0) } {
            log::error!("unable to signal event sink completion: {error}");
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// Signals the completion event however the job ends.
struct SignalOnDrop(Arc<Completion>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.signal();
    }
}

fn dispatch_on_worker(call: InvokeCall) -> HRESULT {
    let completion = match Completion::new() {
        Ok(completion) => Arc::new(completion),
        Err(error) => {
            log::error!("unable to create event sink completion event: {error}");
            return E_FAIL;
        }
    };
    let (sender, receiver) = mpsc::sync_channel(1);
    let signal = SignalOnDrop(completion.clone());
    let queued = WorkerPool::shared().execute(move || {
        let _signal = signal;
        let _ = sender.send(call.run());
    });
    if !queued {
        return RPC_E_CALL_REJECTED;
    }

    let flags = (COWAIT_INPUTAVAILABLE.0 | COWAIT_DISPATCH_CALLS.0) as u32;
    loop {
        match unsafe { CoWaitForMultipleHandles(flags, INFINITE, &[completion.0]) } {
            Ok(0) => break,
            Ok(_) => continue,
            Err(error) => {
                log::error!("waiting for event sink failed: {error}");
                // The worker still holds the caller's argument pointers.
                let _ = receiver.recv();
                return error.code();
            }
        }
    }
    receiver.recv().unwrap_or(E_UNEXPECTED)
}
