// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    ffi::c_void,
    mem::ManuallyDrop,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, ThreadId},
};

use windows::Win32::{
    Foundation::{
        CLASS_E_CLASSNOTAVAILABLE, E_FAIL, E_INVALIDARG, E_NOINTERFACE, E_NOTIMPL, E_POINTER,
        REGDB_E_CLASSNOTREG, S_FALSE, S_OK,
    },
    System::{
        Com::{
            CONNECTDATA, DISPATCH_FLAGS, DISPPARAMS, EXCEPINFO, IClassFactory, IClassFactory_Impl,
            IConnectionPoint, IConnectionPoint_Impl, IConnectionPointContainer, IConnectionPointContainer_Impl,
            IDispatch, IDispatch_Impl, IDispatch_Vtbl, IEnumConnectionPoints, IEnumConnectionPoints_Impl,
            IEnumConnections, IEnumConnections_Impl, ISurrogate, ITypeInfo,
        },
        Variant::VARIANT,
    },
};
use windows_core::{
    BOOL, GUID, HRESULT, IUnknown, IUnknown_Vtbl, Interface, PCWSTR, Ref, Result, implement,
};

use crate::services::HostServices;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Registration {
    pub(crate) clsid: GUID,
    pub(crate) clsctx: u32,
    pub(crate) regcls: u32,
}

/// In-memory stand-in for the OLE32 class table.
#[derive(Default)]
pub(crate) struct FakeServices {
    registrations: Mutex<BTreeMap<u32, Registration>>,
    failing: Mutex<Vec<GUID>>,
    native: Mutex<Vec<GUID>>,
    log: Mutex<Vec<&'static str>>,
    next_cookie: AtomicU32,
    server_references: AtomicU32,
    exits: AtomicU32,
    cleanups: AtomicU32,
    refuse_exit: AtomicBool,
}

impl FakeServices {
    pub(crate) fn fail_registration_of(&self, clsid: GUID) {
        self.failing.lock().unwrap().push(clsid);
    }

    /// Makes `get_class_object` find a class factory for `clsid`.
    pub(crate) fn provide_class_object(&self, clsid: GUID) {
        self.native.lock().unwrap().push(clsid);
    }

    pub(crate) fn registrations(&self) -> Vec<Registration> {
        self.registrations.lock().unwrap().values().cloned().collect()
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn exit_count(&self) -> u32 {
        self.exits.load(Ordering::SeqCst)
    }

    pub(crate) fn cleanup_count(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub(crate) fn server_references(&self) -> u32 {
        self.server_references.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse_exit(&self, refuse: bool) {
        self.refuse_exit.store(refuse, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.log.lock().unwrap().push(call);
    }
}

impl HostServices for FakeServices {
    fn suspend_class_objects(&self) -> Result<()> {
        self.record("suspend");
        Ok(())
    }

    fn resume_class_objects(&self) -> Result<()> {
        self.record("resume");
        Ok(())
    }

    fn register_class_object(
        &self,
        clsid: &GUID,
        _factory: &IUnknown,
        clsctx: u32,
        regcls: u32,
    ) -> Result<u32> {
        self.record("register");
        if self.failing.lock().unwrap().contains(clsid) {
            return Err(E_FAIL.into());
        }
        let cookie = self.next_cookie.fetch_add(1, Ordering::SeqCst) + 1;
        self.registrations.lock().unwrap().insert(
            cookie,
            Registration {
                clsid: *clsid,
                clsctx,
                regcls,
            },
        );
        Ok(cookie)
    }

    fn revoke_class_object(&self, cookie: u32) -> Result<()> {
        self.record("revoke");
        match self.registrations.lock().unwrap().remove(&cookie) {
            Some(_) => Ok(()),
            None => Err(E_FAIL.into()),
        }
    }

    fn get_class_object(&self, clsid: &GUID, _clsctx: u32) -> Result<IClassFactory> {
        if self.native.lock().unwrap().contains(clsid) {
            Ok(FakeClassFactory { clsid: *clsid }.into())
        } else {
            Err(REGDB_E_CLASSNOTREG.into())
        }
    }

    fn register_surrogate(&self, _surrogate: &ISurrogate) -> Result<()> {
        self.record("register_surrogate");
        Ok(())
    }

    fn add_ref_server_process(&self) -> u32 {
        self.server_references.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn release_server_process(&self) -> u32 {
        self.server_references.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn free_unused_libraries(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn exit_later(&self, _code: i32) -> bool {
        if self.refuse_exit.load(Ordering::SeqCst) {
            return false;
        }
        self.exits.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[implement(IClassFactory)]
pub(crate) struct FakeClassFactory {
    clsid: GUID,
}

impl IClassFactory_Impl for FakeClassFactory_Impl {
    fn CreateInstance(
        &self,
        _punkouter: Ref<'_, IUnknown>,
        _riid: *const GUID,
        _ppvobject: *mut *mut c_void,
    ) -> Result<()> {
        log::debug!("fake factory {:?} asked for an instance", self.clsid);
        Err(CLASS_E_CLASSNOTAVAILABLE.into())
    }

    fn LockServer(&self, _flock: BOOL) -> Result<()> {
        Ok(())
    }
}

/// Address of the object's `IUnknown`, the COM identity.
pub(crate) fn identity<T: Interface>(interface: &T) -> usize {
    interface.cast::<IUnknown>().unwrap().as_raw() as usize
}

pub(crate) fn next_connections(
    connections: &IEnumConnections,
    count: u32,
) -> (HRESULT, Vec<(u32, Option<IUnknown>)>) {
    let mut data: Vec<CONNECTDATA> = (0..count).map(|_| CONNECTDATA::default()).collect();
    let mut fetched = 0;
    let hr = unsafe {
        (Interface::vtable(connections).Next)(
            Interface::as_raw(connections),
            count,
            data.as_mut_ptr(),
            &mut fetched,
        )
    };
    let items = data
        .iter_mut()
        .take(fetched as usize)
        .map(|item| (item.dwCookie, unsafe { ManuallyDrop::take(&mut item.pUnk) }))
        .collect();
    (hr, items)
}

pub(crate) fn next_points(
    points: &IEnumConnectionPoints,
    count: u32,
) -> (HRESULT, Vec<IConnectionPoint>) {
    let mut slots: Vec<Option<IConnectionPoint>> = vec![None; count as usize];
    let mut fetched = 0;
    let hr = unsafe {
        (Interface::vtable(points).Next)(
            Interface::as_raw(points),
            count,
            slots.as_mut_ptr().cast(),
            &mut fetched,
        )
    };
    (hr, slots.into_iter().take(fetched as usize).flatten().collect())
}

/// Client event sink recording every dispatched member.
#[implement(IDispatch)]
pub(crate) struct RecordingSink {
    calls: Arc<Mutex<Vec<i32>>>,
    threads: Threads,
}

type Threads = Arc<Mutex<Vec<ThreadId>>>;

impl RecordingSink {
    pub(crate) fn create() -> (IUnknown, Arc<Mutex<Vec<i32>>>) {
        let (sink, calls, _) = RecordingSink::create_with_threads();
        (sink, calls)
    }

    /// Also reports the thread every `Invoke` ran on.
    pub(crate) fn create_with_threads() -> (IUnknown, Arc<Mutex<Vec<i32>>>, Threads) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let threads = Arc::new(Mutex::new(Vec::new()));
        let sink: IDispatch = RecordingSink {
            calls: calls.clone(),
            threads: threads.clone(),
        }
        .into();
        (sink.cast().unwrap(), calls, threads)
    }
}

impl IDispatch_Impl for RecordingSink_Impl {
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
        _riid: *const GUID,
        _lcid: u32,
        _wflags: DISPATCH_FLAGS,
        _pdispparams: *const DISPPARAMS,
        _pvarresult: *mut VARIANT,
        _pexcepinfo: *mut EXCEPINFO,
        _puargerr: *mut u32,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(dispidmember);
        self.threads.lock().unwrap().push(thread::current().id());
        Ok(())
    }
}

/// Dispatch sink bound to the apartment that created it.
///
/// Unlike `#[implement]` objects it has no free-threaded marshaler, so a
/// call from another apartment is marshaled back and only completes while
/// the creating thread dispatches incoming calls.
#[repr(C)]
pub(crate) struct ApartmentSink {
    vtbl: *const IDispatch_Vtbl,
    refs: AtomicU32,
    threads: Threads,
}

static APARTMENT_SINK_VTBL: IDispatch_Vtbl = IDispatch_Vtbl {
    base__: IUnknown_Vtbl {
        QueryInterface: apartment_query_interface,
        AddRef: apartment_add_ref,
        Release: apartment_release,
    },
    GetTypeInfoCount: apartment_get_type_info_count,
    GetTypeInfo: apartment_get_type_info,
    GetIDsOfNames: apartment_get_ids_of_names,
    Invoke: apartment_invoke,
};

impl ApartmentSink {
    pub(crate) fn create() -> (IUnknown, Threads) {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let raw = Box::into_raw(Box::new(ApartmentSink {
            vtbl: &APARTMENT_SINK_VTBL,
            refs: AtomicU32::new(1),
            threads: threads.clone(),
        }));
        (unsafe { IUnknown::from_raw(raw.cast()) }, threads)
    }

    unsafe fn from_this<'a>(this: *mut c_void) -> &'a ApartmentSink {
        unsafe { &*this.cast::<ApartmentSink>() }
    }
}

unsafe extern "system" fn apartment_query_interface(
    this: *mut c_void,
    riid: *const GUID,
    ppv: *mut *mut c_void,
) -> HRESULT {
    if ppv.is_null() || riid.is_null() {
        return E_POINTER;
    }
    let iid = unsafe { *riid };
    if iid != IUnknown::IID && iid != IDispatch::IID {
        unsafe { ppv.write(std::ptr::null_mut()) };
        return E_NOINTERFACE;
    }
    unsafe { ApartmentSink::from_this(this) }
        .refs
        .fetch_add(1, Ordering::SeqCst);
    unsafe { ppv.write(this) };
    S_OK
}

unsafe extern "system" fn apartment_add_ref(this: *mut c_void) -> u32 {
    unsafe { ApartmentSink::from_this(this) }
        .refs
        .fetch_add(1, Ordering::SeqCst)
        + 1
}

unsafe extern "system" fn apartment_release(this: *mut c_void) -> u32 {
    let remaining = unsafe { ApartmentSink::from_this(this) }
        .refs
        .fetch_sub(1, Ordering::SeqCst)
        - 1;
    if remaining == 0 {
        drop(unsafe { Box::from_raw(this.cast::<ApartmentSink>()) });
    }
    remaining
}

unsafe extern "system" fn apartment_get_type_info_count(
    _this: *mut c_void,
    pctinfo: *mut u32,
) -> HRESULT {
    if !pctinfo.is_null() {
        unsafe { pctinfo.write(0) };
    }
    S_OK
}

unsafe extern "system" fn apartment_get_type_info(
    _this: *mut c_void,
    _itinfo: u32,
    _lcid: u32,
    _ppinfo: *mut *mut c_void,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn apartment_get_ids_of_names(
    _this: *mut c_void,
    _riid: *const GUID,
    _names: *const PCWSTR,
    _count: u32,
    _lcid: u32,
    _dispids: *mut i32,
) -> HRESULT {
    E_NOTIMPL
}

unsafe extern "system" fn apartment_invoke(
    this: *mut c_void,
    _dispid: i32,
    _riid: *const GUID,
    _lcid: u32,
    _flags: DISPATCH_FLAGS,
    _params: *const DISPPARAMS,
    _result: *mut VARIANT,
    _exception: *mut EXCEPINFO,
    _arg_error: *mut u32,
) -> HRESULT {
    let sink = unsafe { ApartmentSink::from_this(this) };
    sink.threads.lock().unwrap().push(thread::current().id());
    S_OK
}

#[implement(IConnectionPoint)]
pub(crate) struct FakeConnectionPoint {
    iid: GUID,
    next_cookie: Cell<u32>,
    sinks: RefCell<BTreeMap<u32, IUnknown>>,
}

impl FakeConnectionPoint {
    pub(crate) fn create(iid: GUID) -> IConnectionPoint {
        FakeConnectionPoint {
            iid,
            next_cookie: Cell::new(0),
            sinks: RefCell::default(),
        }
        .into()
    }
}

impl IConnectionPoint_Impl for FakeConnectionPoint_Impl {
    fn GetConnectionInterface(&self) -> Result<GUID> {
        Ok(self.iid)
    }

    fn GetConnectionPointContainer(&self) -> Result<IConnectionPointContainer> {
        Err(E_NOTIMPL.into())
    }

    fn Advise(&self, punksink: Ref<'_, IUnknown>) -> Result<u32> {
        let sink = punksink.ok()?;
        let cookie = self.next_cookie.get() + 1;
        self.next_cookie.set(cookie);
        self.sinks.borrow_mut().insert(cookie, sink.clone());
        Ok(cookie)
    }

    fn Unadvise(&self, dwcookie: u32) -> Result<()> {
        match self.sinks.borrow_mut().remove(&dwcookie) {
            Some(_) => Ok(()),
            None => Err(E_INVALIDARG.into()),
        }
    }

    fn EnumConnections(&self) -> Result<IEnumConnections> {
        let items = self
            .sinks
            .borrow()
            .iter()
            .map(|(cookie, sink)| (*cookie, sink.clone()))
            .collect();
        Ok(FakeEnumConnections {
            items,
            cursor: Cell::new(0),
        }
        .into())
    }
}

#[implement(IEnumConnections)]
struct FakeEnumConnections {
    items: Vec<(u32, IUnknown)>,
    cursor: Cell<usize>,
}

impl IEnumConnections_Impl for FakeEnumConnections_Impl {
    fn Next(&self, cconnections: u32, rgcd: *mut CONNECTDATA, pcfetched: *mut u32) -> HRESULT {
        let start = self.cursor.get();
        let end = (start + cconnections as usize).min(self.items.len());
        for (index, (cookie, sink)) in self.items[start..end].iter().enumerate() {
            unsafe {
                rgcd.add(index).write(CONNECTDATA {
                    pUnk: ManuallyDrop::new(Some(sink.clone())),
                    dwCookie: *cookie,
                });
            }
        }
        self.cursor.set(end);
        let fetched = (end - start) as u32;
        if !pcfetched.is_null() {
            unsafe { pcfetched.write(fetched) };
        }
        if fetched == cconnections { S_OK } else { S_FALSE }
    }

    fn Skip(&self, cconnections: u32) -> Result<()> {
        self.cursor
            .set((self.cursor.get() + cconnections as usize).min(self.items.len()));
        Ok(())
    }

    fn Reset(&self) -> Result<()> {
        self.cursor.set(0);
        Ok(())
    }

    fn Clone(&self) -> Result<IEnumConnections> {
        Ok(FakeEnumConnections {
            items: self.items.clone(),
            cursor: self.cursor.clone(),
        }
        .into())
    }
}

#[implement(IConnectionPointContainer)]
pub(crate) struct FakeConnectionPointContainer {
    points: Vec<IConnectionPoint>,
}

impl FakeConnectionPointContainer {
    pub(crate) fn create(points: Vec<IConnectionPoint>) -> IConnectionPointContainer {
        FakeConnectionPointContainer { points }.into()
    }
}

impl IConnectionPointContainer_Impl for FakeConnectionPointContainer_Impl {
    fn EnumConnectionPoints(&self) -> Result<IEnumConnectionPoints> {
        Ok(FakeEnumConnectionPoints {
            points: self.points.clone(),
            cursor: Cell::new(0),
        }
        .into())
    }

    fn FindConnectionPoint(&self, riid: *const GUID) -> Result<IConnectionPoint> {
        let riid = unsafe { *riid };
        self.points
            .iter()
            .find(|point| unsafe { point.GetConnectionInterface() }.ok() == Some(riid))
            .cloned()
            .ok_or_else(|| E_NOINTERFACE.into())
    }
}

#[implement(IEnumConnectionPoints)]
struct FakeEnumConnectionPoints {
    points: Vec<IConnectionPoint>,
    cursor: Cell<usize>,
}

impl IEnumConnectionPoints_Impl for FakeEnumConnectionPoints_Impl {
    fn Next(
        &self,
        cconnections: u32,
        slots: *mut Option<IConnectionPoint>,
        pcfetched: *mut u32,
    ) -> HRESULT {
        let start = self.cursor.get();
        let end = (start + cconnections as usize).min(self.points.len());
        for (index, point) in self.points[start..end].iter().enumerate() {
            unsafe { slots.add(index).write(Some(point.clone())) };
        }
        self.cursor.set(end);
        let fetched = (end - start) as u32;
        if !pcfetched.is_null() {
            unsafe { pcfetched.write(fetched) };
        }
        if fetched == cconnections { S_OK } else { S_FALSE }
    }

    fn Skip(&self, cconnections: u32) -> Result<()> {
        self.cursor
            .set((self.cursor.get() + cconnections as usize).min(self.points.len()));
        Ok(())
    }

    fn Reset(&self) -> Result<()> {
        self.cursor.set(0);
        Ok(())
    }

    fn Clone(&self) -> Result<IEnumConnectionPoints> {
        Ok(FakeEnumConnectionPoints {
            points: self.points.clone(),
            cursor: self.cursor.clone(),
        }
        .into())
    }
}
