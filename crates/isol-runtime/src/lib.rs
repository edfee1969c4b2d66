//! # isol-runtime
//!
//! Platform-specific runtime for the task isolation manager.
//!
//! This crate provides:
//! - The `Platform` implementation for the current OS (syscalls, `/proc`
//!   reading, signal installation)
//! - The thread-local slot the `SIGUSR1` handler uses to mark isolation lost
//! - Pure parsers for the timer feed and the per-thread sweep table
//! - The per-worker hot loop that drives one `Ring` pair

#![allow(dead_code)]

pub mod signal;
pub mod thread_sweeper;
pub mod timer_scanner;
pub mod tls;
pub mod worker;

/// Discriminant of `isol_core::state::IsolationFlag::Absent`, duplicated
/// here so the async-signal-safe handler path (`tls::signal_mark_isolation_lost`)
/// never has to go through anything heavier than a raw store.
pub(crate) const ISOLATION_FLAG_ABSENT: u8 = isol_core::state::IsolationFlag::Absent as u8;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod platform_linux;
        pub use platform_linux::LinuxPlatform as CurrentPlatform;
    } else {
        compile_error!("isol-runtime only supports Linux: task isolation has no portable equivalent elsewhere");
    }
}
