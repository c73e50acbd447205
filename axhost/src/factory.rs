// SPDX-License-Identifier: GPL-3.0-or-later

//! Class factory registered in place of the control's own.
//!
//! Every instance it creates is a [`HostContainer`]. The factory implements
//! `IMarshal` so it can decide which object the standard marshaler sees.

use std::{ffi::c_void, sync::Arc};

use windows::Win32::{
    Foundation::{CLASS_E_CLASSNOTAVAILABLE, CLASS_E_NOAGGREGATION, E_POINTER},
    System::Com::{
        IClassFactory, IClassFactory_Impl, IStream,
        Marshal::{CoGetStandardMarshal, IMarshal, IMarshal_Impl},
    },
};
use windows_core::{
    BOOL, ComObjectInterface, GUID, IUnknown, Interface, InterfaceRef, Ref, Result, implement,
};

use crate::{container::HostContainer, guid::format_guid, lifetime::ServerLifetime};

/// `MSHCTX_LOCAL`
const LOCAL_CONTEXT: u32 = 0;
/// `MSHLFLAGS_NORMAL`
const NORMAL_MARSHALING: u32 = 0;

#[implement(IClassFactory, IMarshal)]
pub struct HostContainerFactory {
    clsid: GUID,
    clsctx: u32,
    /// The control's own class factory, when it could be obtained.
    underlying: Option<IUnknown>,
    lifetime: Arc<ServerLifetime>,
}

impl HostContainerFactory {
    pub fn new(
        clsid: GUID,
        clsctx: u32,
        underlying: Option<IClassFactory>,
        lifetime: Arc<ServerLifetime>,
    ) -> HostContainerFactory {
        HostContainerFactory {
            clsid,
            clsctx,
            underlying: underlying.and_then(|factory| factory.cast().ok()),
            lifetime,
        }
    }
}

impl HostContainerFactory_Impl {
    /// The object the standard marshaler works on for `riid`.
    fn marshal_target(&self, riid: *const GUID) -> IUnknown {
        let iid = if riid.is_null() {
            IUnknown::IID
        } else {
            unsafe { *riid }
        };
        let this: InterfaceRef<IUnknown> = self.as_interface_ref();
        if iid == IClassFactory::IID || iid == IUnknown::IID {
            return this.to_owned();
        }
        match &self.underlying {
            Some(underlying) => underlying.clone(),
            None => this.to_owned(),
        }
    }

    fn standard_marshal(
        &self,
        riid: *const GUID,
        context: u32,
        context_data: *const c_void,
        flags: u32,
    ) -> Result<IMarshal> {
        let target = self.marshal_target(riid);
        unsafe { CoGetStandardMarshal(riid, &target, context, Some(context_data), flags) }
    }

    fn default_marshal(&self) -> Result<IMarshal> {
        self.standard_marshal(
            &IUnknown::IID,
            LOCAL_CONTEXT,
            std::ptr::null(),
            NORMAL_MARSHALING,
        )
    }
}

impl IClassFactory_Impl for HostContainerFactory_Impl {
    fn CreateInstance(
        &self,
        punkouter: Ref<'_, IUnknown>,
        riid: *const GUID,
        ppvobject: *mut *mut c_void,
    ) -> Result<()> {
        if ppvobject.is_null() {
            return Err(E_POINTER.into());
        }
        unsafe { ppvobject.write(std::ptr::null_mut()) };
        if !punkouter.is_null() {
            return Err(CLASS_E_NOAGGREGATION.into());
        }
        let container = HostContainer::new(self.clsid, self.clsctx, self.lifetime.clone());
        if !container.is_initialized() {
            return Err(CLASS_E_CLASSNOTAVAILABLE.into());
        }
        log::debug!("created container for {}", format_guid(&self.clsid));
        let container = container.into_unknown();
        unsafe { container.query(riid, ppvobject) }.ok()
    }

    fn LockServer(&self, flock: BOOL) -> Result<()> {
        if flock.as_bool() {
            self.lifetime.add_server_reference();
        } else {
            self.lifetime.release_server_reference();
        }
        Ok(())
    }
}

impl IMarshal_Impl for HostContainerFactory_Impl {
    fn GetUnmarshalClass(
        &self,
        riid: *const GUID,
        pv: *const c_void,
        dwdestcontext: u32,
        pvdestcontext: *const c_void,
        mshlflags: u32,
    ) -> Result<GUID> {
        let marshal = self.standard_marshal(riid, dwdestcontext, pvdestcontext, mshlflags)?;
        unsafe {
            marshal.GetUnmarshalClass(riid, Some(pv), dwdestcontext, Some(pvdestcontext), mshlflags)
        }
    }

    fn GetMarshalSizeMax(
        &self,
        riid: *const GUID,
        pv: *const c_void,
        dwdestcontext: u32,
        pvdestcontext: *const c_void,
        mshlflags: u32,
    ) -> Result<u32> {
        let marshal = self.standard_marshal(riid, dwdestcontext, pvdestcontext, mshlflags)?;
        unsafe {
            marshal.GetMarshalSizeMax(riid, Some(pv), dwdestcontext, Some(pvdestcontext), mshlflags)
        }
    }

    fn MarshalInterface(
        &self,
        pstm: Ref<'_, IStream>,
        riid: *const GUID,
        pv: *const c_void,
        dwdestcontext: u32,
        pvdestcontext: *const c_void,
        mshlflags: u32,
    ) -> Result<()> {
        let marshal = self.standard_marshal(riid, dwdestcontext, pvdestcontext, mshlflags)?;
        unsafe {
            marshal.MarshalInterface(
                pstm.as_ref(),
                riid,
                Some(pv),
                dwdestcontext,
                Some(pvdestcontext),
                mshlflags,
            )
        }
    }

    fn UnmarshalInterface(
        &self,
        pstm: Ref<'_, IStream>,
        riid: *const GUID,
        ppv: *mut *mut c_void,
    ) -> Result<()> {
        let marshal =
            self.standard_marshal(riid, LOCAL_CONTEXT, std::ptr::null(), NORMAL_MARSHALING)?;
        unsafe { marshal.UnmarshalInterface(pstm.as_ref(), riid, ppv) }
    }

    fn ReleaseMarshalData(&self, pstm: Ref<'_, IStream>) -> Result<()> {
        unsafe { self.default_marshal()?.ReleaseMarshalData(pstm.as_ref()) }
    }

    fn DisconnectObject(&self, dwreserved: u32) -> Result<()> {
        unsafe { self.default_marshal()?.DisconnectObject(dwreserved) }
    }
}
