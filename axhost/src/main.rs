// SPDX-License-Identifier: GPL-3.0-or-later

#![windows_subsystem = "windows"]

use std::{env, process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use axhost::{
    cli::{Axhost, Command},
    com_init::ComInitializeContext,
    event_loop::MessageLoop,
    guid::format_guid,
    lifetime::DEFAULT_IDLE_TIMEOUT,
    logging::{self, LoggingSettings},
    notify,
    ready_event::HostReadyEvent,
    registry,
    runtime::HostRuntime,
    services::OleHostServices,
};
use windows::Win32::System::Com::{
    COINIT_APARTMENTTHREADED, CoInitializeSecurity, EOAC_APPID, RPC_C_AUTHN_LEVEL_DEFAULT,
    RPC_C_IMP_LEVEL_IMPERSONATE,
};

fn initialize_com_security() -> Result<()> {
    unsafe {
        CoInitializeSecurity(
            None,
            -1,
            None,
            None,
            RPC_C_AUTHN_LEVEL_DEFAULT,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_APPID,
            None,
        )
    }
    .context("CoInitializeSecurity failed")
}

fn command_line() -> String {
    env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<ExitCode> {
    let parsed = Axhost::from_args(env::args_os().skip(1));

    // Surrogate launches take their logging settings from the registry.
    let settings = match &parsed {
        Ok(flags) => match flags.surrogate_clsid() {
            Some(clsid) => registry::read_logging_settings(&format_guid(&clsid)),
            None => flags.logging(),
        },
        Err(_) => LoggingSettings::default(),
    };
    let _logger = logging::init(&settings);
    notify::set_interactive(true);
    log::info!("command line: {}", command_line());

    let flags = match parsed {
        Ok(flags) => flags,
        Err(error) if error.is_help() => {
            notify::information("Usage", &error.to_string());
            return Ok(ExitCode::SUCCESS);
        }
        Err(error) => {
            notify::critical("Invalid Command Line", &error.to_string());
            return Ok(ExitCode::from(2));
        }
    };
    let command = match flags.command() {
        Ok(command) => command,
        Err(error) => {
            notify::critical("Invalid Command Line", &format!("{error:#}"));
            return Ok(ExitCode::from(2));
        }
    };
    if let Command::Version = command {
        notify::information("Version", concat!("axhost ", env!("CARGO_PKG_VERSION")));
        return Ok(ExitCode::SUCCESS);
    }

    let com = ComInitializeContext::new(COINIT_APARTMENTTHREADED);
    com.result().context("CoInitializeEx failed")?;
    initialize_com_security()?;

    let message_loop = MessageLoop::new();
    let services = Arc::new(OleHostServices::new(message_loop.exit_handle()));
    // Stays open until exit so a launcher can still observe it.
    let ready_event: Option<HostReadyEvent>;
    let runtime = match command {
        Command::Register {
            clsid,
            appid,
            logging,
        } => {
            if let Some(clsid) = clsid {
                registry::register_surrogate(&clsid, &appid).context("RegisterSurrogate failed")?;
            }
            registry::write_logging_settings(&appid, &logging)
                .context("WriteLoggingSettings failed")?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Unregister { clsid } => {
            registry::unregister_surrogate(&clsid).context("UnregisterSurrogate failed")?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Surrogate { clsid } => {
            HostRuntime::surrogate(services, &clsid, DEFAULT_IDLE_TIMEOUT)
                .with_context(|| format!("surrogate activation of {} failed", format_guid(&clsid)))?
        }
        Command::Standalone(mut options) => {
            ready_event = HostReadyEvent::new(&options.ready_event)
                .inspect_err(|error| log::warn!("ready event unavailable: {error}"))
                .ok();
            HostRuntime::standalone(
                services,
                &mut options.specs,
                ready_event.as_ref(),
                options.regcls,
                options.timeout,
            )
        }
        Command::Version | Command::Idle => return Ok(ExitCode::SUCCESS),
    };

    let code = message_loop.run(runtime.lifetime());
    drop(runtime);
    log::info!("exiting with code {code}");
    Ok(ExitCode::from(code as u8))
}
