// SPDX-License-Identifier: GPL-3.0-or-later

//! `ISurrogate` and the class registrations it owns.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use windows::Win32::{
    Foundation::{CO_E_CLASSSTRING, E_POINTER, E_UNEXPECTED, S_OK},
    System::Com::{ISurrogate, ISurrogate_Impl},
};
use windows_core::{GUID, IUnknown, Result, implement};

use crate::{
    class_spec::{
        CONTEXT_INPROC_SERVER, CONTEXT_LOCAL_SERVER, ClassSpec, REGISTER_MULTI_SEPARATE,
        REGISTER_MULTIPLE_USE, REGISTER_SURROGATE, REGISTER_SUSPENDED,
    },
    factory::HostContainerFactory,
    guid::format_guid,
    lifetime::ServerLifetime,
    notify,
    services::HostServices,
};

pub const SURROGATE_REGCLS: u32 = REGISTER_SURROGATE | REGISTER_MULTI_SEPARATE;

#[implement(ISurrogate)]
pub struct HostSurrogate {
    services: Arc<dyn HostServices>,
    lifetime: Arc<ServerLifetime>,
    cookies: Mutex<BTreeSet<u32>>,
}

impl HostSurrogate {
    pub fn new(services: Arc<dyn HostServices>, lifetime: Arc<ServerLifetime>) -> HostSurrogate {
        HostSurrogate {
            services,
            lifetime,
            cookies: Mutex::new(BTreeSet::new()),
        }
    }

    fn cookies(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a [`HostContainerFactory`] creating `clsid` under `alias`.
    ///
    /// A multiple-use local registration of an in-process-only class would
    /// make COM hand the host its own factory when the container creates the
    /// control. In that case the control's native factory is registered
    /// in-process as well.
    pub fn load_dll_server_ex(
        &self,
        clsid: &GUID,
        alias: &GUID,
        clsctx_create: u32,
        clsctx_register: u32,
        regcls: u32,
    ) -> Result<()> {
        if *clsid == GUID::zeroed() || *alias == GUID::zeroed() {
            return Err(CO_E_CLASSSTRING.into());
        }
        let shadows_inproc_server =
            clsctx_register & CONTEXT_LOCAL_SERVER != 0 && regcls & REGISTER_MULTIPLE_USE != 0;
        let inproc_only = clsctx_create & CONTEXT_INPROC_SERVER != 0
            && clsctx_create & CONTEXT_LOCAL_SERVER == 0;

        let native = self.services.get_class_object(clsid, clsctx_create);
        let original = match (&native, shadows_inproc_server && inproc_only) {
            (Ok(factory), true) => Some(factory.clone()),
            (Err(error), true) => {
                if alias == clsid {
                    notify::warning(
                        "Original InProc Class Factory Not Available",
                        &format!(
                            "Multiple-use mode with alias == source requires the original InProc DLL.\n\
                             CoGetClassObject failed for CLSID: {} ({})\n\n\
                             Self-instantiation may occur. Consider using an explicit alias.",
                            format_guid(clsid),
                            notify::describe(error)
                        ),
                    );
                }
                None
            }
            _ => None,
        };

        let factory: IUnknown = HostContainerFactory::new(
            *clsid,
            clsctx_create,
            native.ok(),
            self.lifetime.clone(),
        )
        .into();
        let cookie = self
            .services
            .register_class_object(alias, &factory, clsctx_register, regcls)?;
        self.cookies().insert(cookie);
        log::info!(
            "registered {} as {} (clsctx 0x{clsctx_register:X}, regcls 0x{regcls:X}, cookie {cookie})",
            format_guid(clsid),
            format_guid(alias)
        );

        if let Some(original) = original {
            let original: IUnknown = original.into();
            match self.services.register_class_object(
                clsid,
                &original,
                clsctx_create,
                REGISTER_MULTIPLE_USE | REGISTER_MULTI_SEPARATE,
            ) {
                Ok(cookie) => {
                    self.cookies().insert(cookie);
                    log::info!("re-registered native factory of {}", format_guid(clsid));
                }
                Err(error) => log::warn!(
                    "unable to re-register native factory of {}: {error}",
                    format_guid(clsid)
                ),
            }
        }
        Ok(())
    }

    /// Returns the first failure. Specs after a failed one are still
    /// registered.
    pub fn register_all_class_factories(
        &self,
        specs: &mut [ClassSpec],
        suspend: bool,
        regcls: u32,
    ) -> Result<()> {
        let mut regcls = regcls | REGISTER_MULTI_SEPARATE;
        if suspend {
            regcls |= REGISTER_SUSPENDED;
        }
        let mut overall = Ok(());
        for spec in specs.iter_mut() {
            spec.sanitize(regcls);
            // A CLSID that failed to parse keeps its parse error.
            let unresolved = !spec.has_clsid() && !spec.succeeded();
            match self.load_dll_server_ex(
                &spec.clsid,
                &spec.alias,
                spec.clsctx_create,
                spec.clsctx_register,
                spec.regcls,
            ) {
                Ok(()) => {
                    spec.result = S_OK;
                    spec.error.clear();
                }
                Err(error) => {
                    if !unresolved {
                        spec.record_error(&error);
                    }
                    notify::warning(
                        "Class Registration Failed",
                        &format!(
                            "CoRegisterClassObject failed.\n\nCLSID: '{}'\nCLSCTX: 0x{:X}\n\nError message:\n{}",
                            spec.alias_input, spec.clsctx_register, spec.error
                        ),
                    );
                    if overall.is_ok() {
                        overall = Err(spec.result.into());
                    }
                }
            }
        }
        overall
    }

    /// Revokes every registration. Cookies that fail to revoke are kept.
    pub fn revoke_all_class_factories(&self) -> Result<()> {
        let mut cookies = self.cookies();
        let mut overall = Ok(());
        cookies.retain(|&cookie| match self.services.revoke_class_object(cookie) {
            Ok(()) => false,
            Err(error) => {
                log::warn!("unable to revoke class object {cookie}: {error}");
                if overall.is_ok() {
                    overall = Err(error);
                }
                true
            }
        });
        overall
    }

    pub fn registered_count(&self) -> usize {
        self.cookies().len()
    }

    pub fn has_registered_class(&self) -> bool {
        !self.cookies().is_empty()
    }
}

impl ISurrogate_Impl for HostSurrogate_Impl {
    fn LoadDllServer(&self, clsid: *const GUID) -> Result<()> {
        if clsid.is_null() {
            return Err(E_POINTER.into());
        }
        let clsid = unsafe { *clsid };
        log::info!("LoadDllServer {}", format_guid(&clsid));
        self.load_dll_server_ex(
            &clsid,
            &clsid,
            CONTEXT_INPROC_SERVER,
            CONTEXT_LOCAL_SERVER,
            SURROGATE_REGCLS,
        )
        .inspect_err(|error| log::error!("LoadDllServer failed: {error}"))
    }

    fn FreeSurrogate(&self) -> Result<()> {
        log::info!("FreeSurrogate");
        let revoked = self.revoke_all_class_factories();
        let scheduled = self.lifetime.exit_later();
        match revoked {
            Ok(()) if !scheduled => Err(E_UNEXPECTED.into()),
            other => other,
        }
    }
}
