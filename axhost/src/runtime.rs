// SPDX-License-Identifier: GPL-3.0-or-later

//! The two ways this process hosts controls.
//!
//! As a DllSurrogate the SCM drives registration through `ISurrogate`. As a
//! standalone server every `--clsid` is registered up front, bracketed by
//! suspend/resume so clients see the whole batch at once.

use std::{sync::Arc, time::Duration};

use windows::Win32::System::Com::ISurrogate;
use windows_core::{ComObject, GUID, Result};

use crate::{
    class_spec::{ClassSpec, any_multiple_use},
    guid::format_guid,
    lifetime::{HostMode, ServerLifetime},
    notify,
    ready_event::HostReadyEvent,
    services::HostServices,
    surrogate::HostSurrogate,
};

pub struct HostRuntime {
    services: Arc<dyn HostServices>,
    lifetime: Arc<ServerLifetime>,
    surrogate: ComObject<HostSurrogate>,
}

impl HostRuntime {
    fn new(services: Arc<dyn HostServices>, mode: HostMode, timeout: Duration) -> HostRuntime {
        let lifetime = Arc::new(ServerLifetime::new(services.clone(), mode, timeout));
        let surrogate = ComObject::new(HostSurrogate::new(services.clone(), lifetime.clone()));
        HostRuntime {
            services,
            lifetime,
            surrogate,
        }
    }

    pub fn surrogate(
        services: Arc<dyn HostServices>,
        clsid: &GUID,
        timeout: Duration,
    ) -> Result<HostRuntime> {
        log::info!("running as surrogate for {}", format_guid(clsid));
        let runtime = HostRuntime::new(services, HostMode::Surrogate, timeout);
        let surrogate: ISurrogate = runtime.surrogate.to_interface();
        runtime.services.register_surrogate(&surrogate)?;
        unsafe { surrogate.LoadDllServer(clsid) }?;
        runtime.lifetime.start();
        Ok(runtime)
    }

    /// Registers every spec as a local server.
    ///
    /// Classes that fail to register are reported and skipped. The process
    /// only gives up when none could be registered.
    pub fn standalone(
        services: Arc<dyn HostServices>,
        specs: &mut [ClassSpec],
        ready_event: Option<&HostReadyEvent>,
        default_regcls: u32,
        timeout: Duration,
    ) -> HostRuntime {
        let multiple_use = any_multiple_use(specs, default_regcls);
        log::info!(
            "running standalone with {} class(es), multiple use: {multiple_use}",
            specs.len()
        );
        let runtime = HostRuntime::new(services, HostMode::Standalone { multiple_use }, timeout);

        let suspended = runtime
            .services
            .suspend_class_objects()
            .inspect_err(|error| log::warn!("CoSuspendClassObjects failed: {error}"))
            .is_ok();
        let registered =
            runtime
                .surrogate
                .register_all_class_factories(specs, suspended, default_regcls);

        if !runtime.surrogate.has_registered_class() {
            notify::critical(
                "No Class Registered",
                "No class factory could be registered. Exiting.",
            );
            runtime.lifetime.exit_later();
        }
        if suspended && runtime.surrogate.has_registered_class() {
            if let Err(error) = runtime.services.resume_class_objects() {
                log::warn!("CoResumeClassObjects failed: {error}");
            }
        }
        if registered.is_ok() {
            if let Some(event) = ready_event {
                if let Err(error) = event.set() {
                    log::warn!("failed to signal {}: {error}", event.name());
                }
            }
        }
        runtime.lifetime.start();
        runtime
    }

    pub fn lifetime(&self) -> &Arc<ServerLifetime> {
        &self.lifetime
    }

    pub fn registered_count(&self) -> usize {
        self.surrogate.registered_count()
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        match self.lifetime.mode() {
            HostMode::Surrogate => {
                if let Err(error) = self.surrogate.revoke_all_class_factories() {
                    log::warn!("failed to revoke class factories: {error}");
                }
            }
            HostMode::Standalone { .. } => {
                let suspended = self.services.suspend_class_objects().is_ok();
                if let Err(error) = self.surrogate.revoke_all_class_factories() {
                    log::warn!("failed to revoke class factories: {error}");
                }
                if suspended && self.surrogate.has_registered_class() {
                    if let Err(error) = self.services.resume_class_objects() {
                        log::warn!("CoResumeClassObjects failed: {error}");
                    }
                }
            }
        }
    }
}
