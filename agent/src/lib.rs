#![allow(non_snake_case)]

mod config;
mod handler;
mod logger;

use config::AgentConfig;
use handler::PassThroughHandler;
use std::path::Path;
use std::thread;
use windows::Win32::{
    Foundation::{HINSTANCE, HMODULE},
    System::{
        LibraryLoader::DisableThreadLibraryCalls,
        SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH},
    },
};

/// Windows-recommended pattern: do minimal work under the loader lock and
/// spawn a thread for everything else. Installing patches and running LPC
/// calibration both involve blocking work and must not run here directly.
#[unsafe(no_mangle)]
pub extern "system" fn DllMain(hinst: HINSTANCE, reason: u32, _reserved: *mut ()) -> bool {
    match reason {
        DLL_PROCESS_ATTACH => {
            unsafe {
                DisableThreadLibraryCalls(HMODULE::from(hinst)).ok();
            }
            thread::spawn(attach);
        }
        DLL_PROCESS_DETACH => {
            detach();
        }
        _ => {}
    }
    true
}

fn attach() {
    let cfg = AgentConfig::load(Path::new("agent.toml")).unwrap_or_default();
    if logger::init_logger(&cfg.log_level).is_err() {
        return;
    }

    if !cfg.install_lpc_interceptor {
        log::info!("install_lpc_interceptor disabled by config, skipping");
        return;
    }

    log::info!("installing LPC interceptor");
    let timeout = cfg.calibration_timeout();
    match patch_core::install_lpc_interceptor(Box::new(PassThroughHandler), Some(timeout)) {
        Ok(()) => log::info!("LPC interceptor installed and calibrated"),
        Err(e) => log::error!("failed to install LPC interceptor: {e}"),
    }
}

fn detach() {
    if let Err(e) = patch_core::uninstall_lpc_interceptor() {
        log::error!("failed to revert LPC interceptor on detach: {e}");
    }
}
