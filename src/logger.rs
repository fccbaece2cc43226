// Logging setup and the maintenance-panel observers. The log gate clamps
// output to warnings until the guest reaches a configured MP code, then
// restores the level that was active at boot; useful when the interesting
// part of a run is long past the boot chatter.

use log::{info, LevelFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn initialize() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init()
        .ok();
}

// The plain observer: every MP write gets a line.
pub fn mp_message() -> Box<dyn Fn(u16) + Send> {
    Box::new(|mp| info!("MP {:04}", mp))
}

// Clamp below `restore` until target_mp appears.
pub fn mp_log_gate(target_mp: u16) -> Box<dyn Fn(u16) + Send> {
    let restore = log::max_level();
    log::set_max_level(LevelFilter::Warn);
    let armed = AtomicBool::new(true);
    Box::new(move |mp| {
        if mp == target_mp && armed.swap(false, Ordering::Relaxed) {
            log::set_max_level(restore);
            info!("MP {:04} reached, log level restored", mp);
        }
    })
}

// Halt the machine when the guest reports a configured MP code.
pub fn mp_stop_at(target_mp: u16, stop: Arc<AtomicBool>) -> Box<dyn Fn(u16) + Send> {
    Box::new(move |mp| {
        if mp == target_mp {
            info!("MP {:04} reached, stopping", mp);
            stop.store(true, Ordering::Relaxed);
        }
    })
}
