//! Task isolation manager daemon entry point.
//!
//! Wires `isol_runtime::CurrentPlatform` to `isol_manager::Manager`,
//! binds the crash-safe control socket, and runs the central loop
//! (spec.md §4.6) until a `terminate` control command is accepted and
//! every worker has wound down.

use isol_core::kerror;
use isol_core::traits::Platform;
use isol_manager::config::ManagerConfig;
use isol_manager::control::Control;
use isol_manager::manager::Manager;
use isol_runtime::CurrentPlatform;

fn main() {
    let config = ManagerConfig::from_env();
    let platform = CurrentPlatform::new();

    if let Err(e) = platform.install_isolation_lost_handler() {
        kerror!("failed to install SIGUSR1 handler: {}", e);
        std::process::exit(1);
    }

    let mut manager = match Manager::new(platform, config) {
        Ok(m) => m,
        Err(e) => {
            kerror!("manager init failed: {}", e);
            std::process::exit(1);
        }
    };

    let socket_path = manager.config.effective_socket_path();
    let mut control = match Control::bind(&socket_path) {
        Ok(c) => c,
        Err(e) => {
            kerror!("control socket bind failed: {}", e);
            std::process::exit(1);
        }
    };

    run(&mut manager, &mut control);
}

fn run<P: Platform>(manager: &mut Manager<P>, control: &mut Control) {
    loop {
        manager.pass();

        if let Err(e) = control.poll(manager, manager.idle_poll_timeout()) {
            kerror!("control loop error: {}", e);
        }

        if manager.should_exit() && !control.has_pending_output() {
            break;
        }
    }
}
