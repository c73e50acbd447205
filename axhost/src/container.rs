// SPDX-License-Identifier: GPL-3.0-or-later

//! The object handed to clients for every created control.
//!
//! `IProvideClassInfo2`, `IConnectionPointContainer` and
//! `IExternalConnection` are answered by host proxies, every other interface
//! comes straight from the control. That delegating `QueryInterface` is why
//! this object lays out its own vtables instead of using `#[implement]`.

use std::{
    ffi::c_void,
    mem::size_of,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use windows::Win32::{
    Foundation::{CO_E_CLASSSTRING, E_NOINTERFACE, E_POINTER, E_UNEXPECTED, S_OK},
    System::{
        Com::{
            CLSCTX, CoCreateInstance, IConnectionPointContainer, IExternalConnection,
            IPersistStreamInit,
        },
        Ole::{IProvideClassInfo, IProvideClassInfo2},
    },
};
use windows_core::{BOOL, GUID, HRESULT, IUnknown, Interface, Result};

use crate::{
    class_info::HostProvideClassInfo, connection_point_container::HostConnectionPointContainer,
    external_connection::HostExternalConnection, guid::format_guid, lifetime::ServerLifetime,
    notify,
};

type QueryInterfaceFn = unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT;
type RefCountFn = unsafe extern "system" fn(*mut c_void) -> u32;

#[repr(C)]
struct UnknownVtbl {
    query_interface: QueryInterfaceFn,
    add_ref: RefCountFn,
    release: RefCountFn,
}

#[repr(C)]
struct ProvideClassInfo2Vtbl {
    base: UnknownVtbl,
    get_class_info: unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT,
    get_guid: unsafe extern "system" fn(*mut c_void, u32, *mut GUID) -> HRESULT,
}

#[repr(C)]
struct ConnectionPointContainerVtbl {
    base: UnknownVtbl,
    enum_connection_points: unsafe extern "system" fn(*mut c_void, *mut *mut c_void) -> HRESULT,
    find_connection_point:
        unsafe extern "system" fn(*mut c_void, *const GUID, *mut *mut c_void) -> HRESULT,
}

#[repr(C)]
struct ExternalConnectionVtbl {
    base: UnknownVtbl,
    add_connection: unsafe extern "system" fn(*mut c_void, u32, u32) -> u32,
    release_connection: unsafe extern "system" fn(*mut c_void, u32, u32, BOOL) -> u32,
}

const CLASS_INFO_SLOT: usize = 0;
const CONNECTION_POINTS_SLOT: usize = 1;
const EXTERNAL_CONNECTION_SLOT: usize = 2;

static CLASS_INFO_VTBL: ProvideClassInfo2Vtbl = ProvideClassInfo2Vtbl {
    base: UnknownVtbl {
        query_interface: query_interface::<CLASS_INFO_SLOT>,
        add_ref: add_ref::<CLASS_INFO_SLOT>,
        release: release::<CLASS_INFO_SLOT>,
    },
    get_class_info,
    get_guid,
};

static CONNECTION_POINTS_VTBL: ConnectionPointContainerVtbl = ConnectionPointContainerVtbl {
    base: UnknownVtbl {
        query_interface: query_interface::<CONNECTION_POINTS_SLOT>,
        add_ref: add_ref::<CONNECTION_POINTS_SLOT>,
        release: release::<CONNECTION_POINTS_SLOT>,
    },
    enum_connection_points,
    find_connection_point,
};

static EXTERNAL_CONNECTION_VTBL: ExternalConnectionVtbl = ExternalConnectionVtbl {
    base: UnknownVtbl {
        query_interface: query_interface::<EXTERNAL_CONNECTION_SLOT>,
        add_ref: add_ref::<EXTERNAL_CONNECTION_SLOT>,
        release: release::<EXTERNAL_CONNECTION_SLOT>,
    },
    add_connection,
    release_connection,
};

struct Capabilities {
    class_info: IProvideClassInfo2,
    connection_points: IConnectionPointContainer,
    external_connection: IExternalConnection,
}

#[repr(C)]
pub struct HostContainer {
    // Interface slots, in `*_SLOT` order. Must stay the first fields.
    class_info_vtbl: *const ProvideClassInfo2Vtbl,
    connection_points_vtbl: *const ConnectionPointContainerVtbl,
    external_connection_vtbl: *const ExternalConnectionVtbl,
    refs: AtomicU32,
    clsid: GUID,
    control: Option<IUnknown>,
    capabilities: Option<Capabilities>,
    lifetime: Arc<ServerLifetime>,
}

impl HostContainer {
    /// Creates the control `clsid` in `clsctx`.
    ///
    /// A control that fails to load is reported and leaves the container
    /// uninitialized; check [`HostContainer::is_initialized`].
    pub fn new(clsid: GUID, clsctx: u32, lifetime: Arc<ServerLifetime>) -> Box<HostContainer> {
        let control = match load_control(&clsid, clsctx) {
            Ok(control) => Some(control),
            Err(error) => {
                notify::critical(
                    "Control Loading Failed",
                    &format!(
                        "Failed to load control.\n\nCLSID: '{}'\nCLSCTX: 0x{clsctx:X}\n\nError message:\n{}",
                        format_guid(&clsid),
                        notify::describe(&error)
                    ),
                );
                None
            }
        };
        HostContainer::with_control(clsid, control, lifetime)
    }

    pub fn with_control(
        clsid: GUID,
        control: Option<IUnknown>,
        lifetime: Arc<ServerLifetime>,
    ) -> Box<HostContainer> {
        let capabilities = control.as_ref().map(|control| Capabilities {
            class_info: HostProvideClassInfo::new(clsid, control.cast().ok(), control.cast().ok())
                .into(),
            connection_points: HostConnectionPointContainer::create(control.cast().ok()),
            external_connection: HostExternalConnection::new(control.cast().ok()).into(),
        });
        if capabilities.is_some() {
            lifetime.instance_created();
        }
        Box::new(HostContainer {
            class_info_vtbl: &CLASS_INFO_VTBL,
            connection_points_vtbl: &CONNECTION_POINTS_VTBL,
            external_connection_vtbl: &EXTERNAL_CONNECTION_VTBL,
            refs: AtomicU32::new(0),
            clsid,
            control,
            capabilities,
            lifetime,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.control.is_some()
    }

    pub fn clsid(&self) -> &GUID {
        &self.clsid
    }

    pub fn into_unknown(self: Box<HostContainer>) -> IUnknown {
        let raw = Box::into_raw(self);
        unsafe {
            (*raw).refs.fetch_add(1, Ordering::SeqCst);
            IUnknown::from_raw(raw.cast())
        }
    }

    fn slot(&self, slot: usize) -> *mut c_void {
        let base = self as *const HostContainer as *mut u8;
        unsafe { base.add(slot * size_of::<*const c_void>()) }.cast()
    }

    /// Recovers the container from an interface pointer of `slot`.
    unsafe fn from_slot<'a>(this: *mut c_void, slot: usize) -> &'a HostContainer {
        unsafe { &*this.cast::<u8>().sub(slot * size_of::<*const c_void>()).cast() }
    }

    unsafe fn query(&self, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT {
        if ppv.is_null() {
            return E_POINTER;
        }
        unsafe { ppv.write(std::ptr::null_mut()) };
        if riid.is_null() {
            return E_POINTER;
        }
        let iid = unsafe { *riid };
        let slot = if iid == IUnknown::IID
            || iid == IProvideClassInfo::IID
            || iid == IProvideClassInfo2::IID
        {
            CLASS_INFO_SLOT
        } else if iid == IConnectionPointContainer::IID {
            CONNECTION_POINTS_SLOT
        } else if iid == IExternalConnection::IID {
            EXTERNAL_CONNECTION_SLOT
        } else {
            return match &self.control {
                Some(control) => unsafe { control.query(riid, ppv) },
                None => E_NOINTERFACE,
            };
        };
        self.refs.fetch_add(1, Ordering::SeqCst);
        unsafe { ppv.write(self.slot(slot)) };
        S_OK
    }
}

impl Drop for HostContainer {
    fn drop(&mut self) {
        // Release the control before giving up the process reference.
        let loaded = self.capabilities.take().is_some();
        self.control.take();
        if loaded {
            self.lifetime.instance_destroyed();
        }
    }
}

fn load_control(clsid: &GUID, clsctx: u32) -> Result<IUnknown> {
    if *clsid == GUID::zeroed() {
        return Err(CO_E_CLASSSTRING.into());
    }
    let control: IUnknown = unsafe { CoCreateInstance(clsid, None, CLSCTX(clsctx as _)) }?;
    if let Ok(persist) = control.cast::<IPersistStreamInit>() {
        if let Err(error) = unsafe { persist.InitNew() } {
            log::warn!("IPersistStreamInit::InitNew failed for {}: {error}", format_guid(clsid));
        }
    }
    log::info!("loaded control {}", format_guid(clsid));
    Ok(control)
}

unsafe extern "system" fn query_interface<const SLOT: usize>(
    this: *mut c_void,
    riid: *const GUID,
    ppv: *mut *mut c_void,
) -> HRESULT {
    unsafe { HostContainer::from_slot(this, SLOT).query(riid, ppv) }
}

unsafe extern "system" fn add_ref<const SLOT: usize>(this: *mut c_void) -> u32 {
    let container = unsafe { HostContainer::from_slot(this, SLOT) };
    container.refs.fetch_add(1, Ordering::SeqCst) + 1
}

unsafe extern "system" fn release<const SLOT: usize>(this: *mut c_void) -> u32 {
    let container = unsafe { HostContainer::from_slot(this, SLOT) };
    let remaining = container.refs.fetch_sub(1, Ordering::SeqCst) - 1;
    if remaining == 0 {
        let raw = container as *const HostContainer as *mut HostContainer;
        drop(unsafe { Box::from_raw(raw) });
    }
    remaining
}

unsafe extern "system" fn get_class_info(this: *mut c_void, ppti: *mut *mut c_void) -> HRESULT {
    let container = unsafe { HostContainer::from_slot(this, CLASS_INFO_SLOT) };
    match &container.capabilities {
        Some(capabilities) => {
            let info = &capabilities.class_info;
            unsafe { (Interface::vtable(info).base__.GetClassInfo)(Interface::as_raw(info), ppti) }
        }
        None => E_UNEXPECTED,
    }
}

unsafe extern "system" fn get_guid(this: *mut c_void, kind: u32, pguid: *mut GUID) -> HRESULT {
    let container = unsafe { HostContainer::from_slot(this, CLASS_INFO_SLOT) };
    match &container.capabilities {
        Some(capabilities) => {
            let info = &capabilities.class_info;
            unsafe { (Interface::vtable(info).GetGUID)(Interface::as_raw(info), kind, pguid) }
        }
        None => E_UNEXPECTED,
    }
}

unsafe extern "system" fn enum_connection_points(
    this: *mut c_void,
    ppenum: *mut *mut c_void,
) -> HRESULT {
    let container = unsafe { HostContainer::from_slot(this, CONNECTION_POINTS_SLOT) };
    match &container.capabilities {
        Some(capabilities) => {
            let points = &capabilities.connection_points;
            unsafe { (Interface::vtable(points).EnumConnectionPoints)(Interface::as_raw(points), ppenum) }
        }
        None => E_UNEXPECTED,
    }
}

unsafe extern "system" fn find_connection_point(
    this: *mut c_void,
    riid: *const GUID,
    ppcp: *mut *mut c_void,
) -> HRESULT {
    let container = unsafe { HostContainer::from_slot(this, CONNECTION_POINTS_SLOT) };
    match &container.capabilities {
        Some(capabilities) => {
            let points = &capabilities.connection_points;
            unsafe {
                (Interface::vtable(points).FindConnectionPoint)(Interface::as_raw(points), riid, ppcp)
            }
        }
        None => E_UNEXPECTED,
    }
}

unsafe extern "system" fn add_connection(this: *mut c_void, extconn: u32, reserved: u32) -> u32 {
    let container = unsafe { HostContainer::from_slot(this, EXTERNAL_CONNECTION_SLOT) };
    match &container.capabilities {
        Some(capabilities) => unsafe {
            capabilities.external_connection.AddConnection(extconn, reserved)
        },
        None => 0,
    }
}

unsafe extern "system" fn release_connection(
    this: *mut c_void,
    extconn: u32,
    reserved: u32,
    last_release_closes: BOOL,
) -> u32 {
    let container = unsafe { HostContainer::from_slot(this, EXTERNAL_CONNECTION_SLOT) };
    match &container.capabilities {
        Some(capabilities) => unsafe {
            capabilities
                .external_connection
                .ReleaseConnection(extconn, reserved, last_release_closes.as_bool())
        },
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use windows::Win32::{
        Foundation::{E_NOINTERFACE, E_POINTER, E_UNEXPECTED},
        System::{
            Com::{
                COINIT_MULTITHREADED, DISPATCH_METHOD, DISPPARAMS, IConnectionPointContainer,
                IDispatch, IExternalConnection,
            },
            Ole::{IProvideClassInfo, IProvideClassInfo2},
        },
    };
    use windows_core::{GUID, IUnknown, Interface};

    use super::HostContainer;
    use crate::{
        com_init::ComInitializeContext,
        lifetime::{HostMode, ServerLifetime},
        test_support::{
            FakeConnectionPoint, FakeConnectionPointContainer, FakeServices, RecordingSink,
            identity,
        },
    };

    const CONTROL: GUID = GUID::from_u128(0xA0A0A0A0_0000_4000_8000_000000000001);
    const EVENTS: GUID = GUID::from_u128(0xA0A0A0A0_0000_4000_8000_0000000000E0);

    fn lifetime(services: &Arc<FakeServices>) -> Arc<ServerLifetime> {
        Arc::new(ServerLifetime::new(
            services.clone(),
            HostMode::Surrogate,
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn unknown_interface_without_control() {
        let services = Arc::new(FakeServices::default());
        let container = HostContainer::with_control(CONTROL, None, lifetime(&services));
        assert!(!container.is_initialized());
        let unknown = container.into_unknown();

        assert_eq!(E_NOINTERFACE, unknown.cast::<IDispatch>().unwrap_err().code());
        let mut out = 1usize as *mut core::ffi::c_void;
        let hr = unsafe { unknown.query(&IDispatch::IID, &mut out) };
        assert_eq!(E_NOINTERFACE, hr);
        assert!(out.is_null());
        let hr = unsafe { unknown.query(&IDispatch::IID, std::ptr::null_mut()) };
        assert_eq!(E_POINTER, hr);

        let points: IConnectionPointContainer = unknown.cast().unwrap();
        let error = unsafe { points.FindConnectionPoint(&EVENTS) }.unwrap_err();
        assert_eq!(E_UNEXPECTED, error.code());
        assert_eq!(0, services.server_references());
    }

    #[test]
    fn composed_interfaces_share_identity() {
        let _com = ComInitializeContext::new(COINIT_MULTITHREADED);
        let services = Arc::new(FakeServices::default());
        let (control, _) = RecordingSink::create();
        let unknown = HostContainer::with_control(CONTROL, Some(control), lifetime(&services))
            .into_unknown();

        let raw = unknown.as_raw() as usize;
        assert_eq!(raw, identity(&unknown.cast::<IProvideClassInfo>().unwrap()));
        assert_eq!(raw, identity(&unknown.cast::<IProvideClassInfo2>().unwrap()));
        assert_eq!(raw, identity(&unknown.cast::<IConnectionPointContainer>().unwrap()));
        assert_eq!(raw, identity(&unknown.cast::<IExternalConnection>().unwrap()));
        let again: IUnknown = unknown
            .cast::<IExternalConnection>()
            .unwrap()
            .cast()
            .unwrap();
        assert_eq!(raw, again.as_raw() as usize);
    }

    #[test]
    fn other_interfaces_come_from_control() {
        let _com = ComInitializeContext::new(COINIT_MULTITHREADED);
        let services = Arc::new(FakeServices::default());
        let (control, calls) = RecordingSink::create();
        let unknown = HostContainer::with_control(CONTROL, Some(control), lifetime(&services))
            .into_unknown();

        let dispatch: IDispatch = unknown.cast().unwrap();
        let params = DISPPARAMS::default();
        unsafe { dispatch.Invoke(3, &GUID::zeroed(), 0, DISPATCH_METHOD, &params, None, None, None) }
            .unwrap();
        assert_eq!(vec![3], *calls.lock().unwrap());
    }

    #[test]
    fn connection_points_are_proxied() {
        let _com = ComInitializeContext::new(COINIT_MULTITHREADED);
        let services = Arc::new(FakeServices::default());
        let point = FakeConnectionPoint::create(EVENTS);
        let control: IUnknown = FakeConnectionPointContainer::create(vec![point.clone()])
            .cast()
            .unwrap();
        let unknown = HostContainer::with_control(CONTROL, Some(control), lifetime(&services))
            .into_unknown();

        let points: IConnectionPointContainer = unknown.cast().unwrap();
        let found = unsafe { points.FindConnectionPoint(&EVENTS) }.unwrap();
        assert_ne!(identity(&point), identity(&found));
        assert_eq!(EVENTS, unsafe { found.GetConnectionInterface() }.unwrap());
    }

    #[test]
    fn instances_follow_container_lifetime() {
        let _com = ComInitializeContext::new(COINIT_MULTITHREADED);
        let services = Arc::new(FakeServices::default());
        let lifetime = lifetime(&services);

        let containers: Vec<IUnknown> = (0..3)
            .map(|_| {
                let (control, _) = RecordingSink::create();
                HostContainer::with_control(CONTROL, Some(control), lifetime.clone()).into_unknown()
            })
            .collect();
        assert_eq!(3, lifetime.references().instances());
        assert_eq!(3, services.server_references());

        let mut containers = containers.into_iter();
        drop(containers.next());
        drop(containers.next());
        assert_eq!(1, lifetime.references().instances());
        assert_eq!(1, services.server_references());
        drop(containers);
        assert_eq!(0, lifetime.references().instances());
    }

    #[test]
    fn null_clsid_fails_to_load() {
        let services = Arc::new(FakeServices::default());
        let container = HostContainer::new(GUID::zeroed(), 1, lifetime(&services));
        assert!(!container.is_initialized());
    }
}
