// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection point proxy.
//!
//! Every sink a client advises is wrapped in a [`HostEventSink`] before it
//! reaches the control. The proxy remembers which client sink belongs to
//! which cookie so enumerations hand the client its own sinks back.

use std::{
    collections::BTreeMap,
    ffi::c_void,
    mem::ManuallyDrop,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
};

use windows::Win32::{
    Foundation::{E_INVALIDARG, E_NOINTERFACE, E_POINTER, E_UNEXPECTED, S_OK},
    System::Com::{
        CONNECTDATA, IConnectionPoint, IConnectionPoint_Impl, IConnectionPoint_Vtbl,
        IConnectionPointContainer, IDispatch, IEnumConnections, IEnumConnections_Impl,
    },
};
use windows_core::{
    GUID, HRESULT, IUnknown, IUnknown_Vtbl, Interface, Ref, Result, Weak, implement,
};

use crate::sink::HostEventSink;

#[derive(Default)]
struct Connections {
    proxies: BTreeMap<u32, IDispatch>,
    sinks: BTreeMap<u32, IUnknown>,
}

#[derive(Clone, Default)]
struct SharedConnections(Arc<Mutex<Connections>>);

impl SharedConnections {
    fn lock(&self) -> MutexGuard<'_, Connections> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self, cookie: u32) -> Option<IUnknown> {
        self.lock().sinks.get(&cookie).cloned()
    }
}

#[implement(IConnectionPoint)]
pub struct HostConnectionPoint {
    underlying: IConnectionPoint,
    container: Option<Weak<IConnectionPointContainer>>,
    connections: SharedConnections,
}

impl HostConnectionPoint {
    pub fn new(
        underlying: IConnectionPoint,
        container: Option<Weak<IConnectionPointContainer>>,
    ) -> HostConnectionPoint {
        HostConnectionPoint {
            underlying,
            container,
            connections: SharedConnections::default(),
        }
    }

    pub fn create(
        underlying: IConnectionPoint,
        container: Option<Weak<IConnectionPointContainer>>,
    ) -> IConnectionPoint {
        CheckedConnectionPoint::wrap(HostConnectionPoint::new(underlying, container).into())
    }

    pub fn underlying_sink(&self, cookie: u32) -> Option<IUnknown> {
        self.connections.sink(cookie)
    }

    pub fn connection_count(&self) -> usize {
        let connections = self.connections.lock();
        debug_assert_eq!(connections.proxies.len(), connections.sinks.len());
        connections.sinks.len()
    }
}

impl IConnectionPoint_Impl for HostConnectionPoint_Impl {
    fn GetConnectionInterface(&self) -> Result<GUID> {
        unsafe { self.underlying.GetConnectionInterface() }
    }

    fn GetConnectionPointContainer(&self) -> Result<IConnectionPointContainer> {
        self.container
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| E_UNEXPECTED.into())
    }

    fn Advise(&self, punksink: Ref<'_, IUnknown>) -> Result<u32> {
        let sink = punksink.ok().map_err(|_| E_INVALIDARG)?;
        let proxy: IDispatch = HostEventSink::new(sink).into();
        let cookie = unsafe { self.underlying.Advise(&proxy) }?;
        let mut connections = self.connections.lock();
        connections.proxies.insert(cookie, proxy);
        connections.sinks.insert(cookie, sink.clone());
        log::debug!("advised sink {cookie}");
        Ok(cookie)
    }

    fn Unadvise(&self, dwcookie: u32) -> Result<()> {
        unsafe { self.underlying.Unadvise(dwcookie) }?;
        let mut connections = self.connections.lock();
        connections.proxies.remove(&dwcookie);
        connections.sinks.remove(&dwcookie);
        log::debug!("unadvised sink {dwcookie}");
        Ok(())
    }

    fn EnumConnections(&self) -> Result<IEnumConnections> {
        let underlying = unsafe { self.underlying.EnumConnections() }?;
        Ok(HostEnumConnections {
            underlying,
            connections: self.connections.clone(),
        }
        .into())
    }
}

/// Enumerates the control's connections, reporting the client's own sinks.
#[implement(IEnumConnections)]
struct HostEnumConnections {
    underlying: IEnumConnections,
    connections: SharedConnections,
}

impl IEnumConnections_Impl for HostEnumConnections_Impl {
    fn Next(&self, cconnections: u32, rgcd: *mut CONNECTDATA, pcfetched: *mut u32) -> HRESULT {
        if rgcd.is_null() || (cconnections > 1 && pcfetched.is_null()) {
            return E_POINTER;
        }
        let mut fetched = 0;
        let hr = unsafe {
            (Interface::vtable(&self.underlying).Next)(
                Interface::as_raw(&self.underlying),
                cconnections,
                rgcd,
                &mut fetched,
            )
        };
        if hr.is_err() {
            return hr;
        }
        for index in 0..fetched.min(cconnections) as usize {
            let data = unsafe { &mut *rgcd.add(index) };
            if let Some(sink) = self.connections.sink(data.dwCookie) {
                unsafe { ManuallyDrop::drop(&mut data.pUnk) };
                data.pUnk = ManuallyDrop::new(Some(sink));
            }
        }
        if !pcfetched.is_null() {
            unsafe { pcfetched.write(fetched) };
        }
        hr
    }

    fn Skip(&self, cconnections: u32) -> Result<()> {
        let hr = unsafe {
            (Interface::vtable(&self.underlying).Skip)(
                Interface::as_raw(&self.underlying),
                cconnections,
            )
        };
        enumeration_result(hr)
    }

    fn Reset(&self) -> Result<()> {
        unsafe { self.underlying.Reset() }
    }

    fn Clone(&self) -> Result<IEnumConnections> {
        let underlying = unsafe { self.underlying.Clone() }?;
        Ok(HostEnumConnections {
            underlying,
            connections: self.connections.clone(),
        }
        .into())
    }
}

/// Outer identity of a [`HostConnectionPoint`].
///
/// The generated `Advise` thunk writes the cookie without checking the
/// pointer, so this vtable rejects null arguments before the control is
/// advised and forwards everything else.
#[repr(C)]
struct CheckedConnectionPoint {
    vtbl: *const IConnectionPoint_Vtbl,
    refs: AtomicU32,
    inner: IConnectionPoint,
}

static CHECKED_VTBL: IConnectionPoint_Vtbl = IConnectionPoint_Vtbl {
    base__: IUnknown_Vtbl {
        QueryInterface: checked_query_interface,
        AddRef: checked_add_ref,
        Release: checked_release,
    },
    GetConnectionInterface: checked_get_connection_interface,
    GetConnectionPointContainer: checked_get_connection_point_container,
    Advise: checked_advise,
    Unadvise: checked_unadvise,
    EnumConnections: checked_enum_connections,
};

impl CheckedConnectionPoint {
    fn wrap(inner: IConnectionPoint) -> IConnectionPoint {
        let raw = Box::into_raw(Box::new(CheckedConnectionPoint {
            vtbl: &CHECKED_VTBL,
            refs: AtomicU32::new(1),
            inner,
        }));
        unsafe { IConnectionPoint::from_raw(raw.cast()) }
    }

    unsafe fn from_this<'a>(this: *mut c_void) -> &'a CheckedConnectionPoint {
        unsafe { &*this.cast::<CheckedConnectionPoint>() }
    }

    unsafe fn inner<'a>(this: *mut c_void) -> &'a IConnectionPoint {
        unsafe { &CheckedConnectionPoint::from_this(this).inner }
    }
}

unsafe extern "system" fn checked_query_interface(
    this: *mut c_void,
    riid: *const GUID,
    ppv: *mut *mut c_void,
) -> HRESULT {
    if ppv.is_null() {
        return E_POINTER;
    }
    unsafe { ppv.write(std::ptr::null_mut()) };
    if riid.is_null() {
        return E_POINTER;
    }
    let iid = unsafe { *riid };
    if iid != IUnknown::IID && iid != IConnectionPoint::IID {
        return E_NOINTERFACE;
    }
    let point = unsafe { CheckedConnectionPoint::from_this(this) };
    point.refs.fetch_add(1, Ordering::SeqCst);
    unsafe { ppv.write(this) };
    S_OK
}

unsafe extern "system" fn checked_add_ref(this: *mut c_void) -> u32 {
    let point = unsafe { CheckedConnectionPoint::from_this(this) };
    point.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn checked_release(this: *mut c_void) -> u32 {
    let point = unsafe { CheckedConnectionPoint::from_this(this) };
    let remaining = point.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        drop(unsafe { Box::from_raw(this.cast::<CheckedConnectionPoint>()) });
    }
    remaining
}

unsafe extern "system" fn checked_get_connection_interface(
    this: *mut c_void,
    piid: *mut GUID,
) -> HRESULT {
    let inner = unsafe { CheckedConnectionPoint::inner(this) };
    unsafe { (Interface::vtable(inner).GetConnectionInterface)(Interface::as_raw(inner), piid) }
}

unsafe extern "system" fn checked_get_connection_point_container(
    this: *mut c_void,
    ppcpc: *mut *mut c_void,
) -> HRESULT {
    let inner = unsafe { CheckedConnectionPoint::inner(this) };
    unsafe {
        (Interface::vtable(inner).GetConnectionPointContainer)(Interface::as_raw(inner), ppcpc)
    }
}

unsafe extern "system" fn checked_advise(
    this: *mut c_void,
    punksink: *mut c_void,
    pdwcookie: *mut u32,
) -> HRESULT {
    if punksink.is_null() || pdwcookie.is_null() {
        return E_INVALIDARG;
    }
    let inner = unsafe { CheckedConnectionPoint::inner(this) };
    unsafe { (Interface::vtable(inner).Advise)(Interface::as_raw(inner), punksink, pdwcookie) }
}

unsafe extern "system" fn checked_unadvise(this: *mut c_void, dwcookie: u32) -> HRESULT {
    let inner = unsafe { CheckedConnectionPoint::inner(this) };
    unsafe { (Interface::vtable(inner).Unadvise)(Interface::as_raw(inner), dwcookie) }
}

unsafe extern "system" fn checked_enum_connections(
    this: *mut c_void,
    ppenum: *mut *mut c_void,
) -> HRESULT {
    let inner = unsafe { CheckedConnectionPoint::inner(this) };
    unsafe { (Interface::vtable(inner).EnumConnections)(Interface::as_raw(inner), ppenum) }
}

/// Keeps `S_FALSE` from `Skip` visible to the caller.
pub(crate) fn enumeration_result(hr: HRESULT) -> Result<()> {
    if hr == S_OK { Ok(()) } else { Err(hr.into()) }
}
