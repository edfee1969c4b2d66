//! The `Platform` abstraction: every OS-specific capability the core
//! needs, named exactly as spec.md's "abstract capabilities" list (§1).
//! Implementations live in `isol-runtime`; this crate only names the
//! seam so tests can substitute a fake.

use crate::cpuset::CpuSet;
use crate::error::{IsolResult, PlatformError};

/// Enable or disable hardware-level task isolation and pin/affinity
/// control for the calling thread.
pub trait PlatformIsolation: Send + Sync {
    /// Turn isolation on or off for the calling thread. Mirrors the
    /// kernel's `task_isolation` feature (or an equivalent) - suppresses
    /// scheduler ticks and most IRQs while isolation is on.
    fn set_isolation(&self, on: bool) -> IsolResult<()>;

    /// Pin the calling thread to `cpu`.
    fn pin(&self, cpu: u32) -> IsolResult<()>;

    /// Restore the calling thread's affinity to everything in `cpus`
    /// (used when leaving isolation, or by the sweeper).
    fn set_affinity(&self, cpus: &CpuSet) -> IsolResult<()>;

    /// Lock all of the calling process's current and future memory
    /// pages, so isolated code never takes a page fault.
    fn mlock_all(&self) -> IsolResult<()>;
}

/// Signal installation and delivery for the `SIGUSR1` isolation-lost
/// notification.
pub trait PlatformSignal: Send + Sync {
    /// Install the process-wide `SIGUSR1` handler and ignore `SIGPIPE`.
    /// Called once, at manager startup.
    fn install_isolation_lost_handler(&self) -> IsolResult<()>;
}

/// Thread and process identity.
pub trait PlatformThread: Send + Sync {
    /// The calling thread's OS-level thread id (`gettid`-equivalent).
    fn current_tid(&self) -> u64;
}

/// One schedulable entity's raw platform text, as read straight off
/// `/proc` (or an equivalent): the `stat` line (name, last-run cpu at a
/// fixed positional field) and the `status` text (hex `Cpus_allowed`
/// mask, voluntary/involuntary context-switch counters). Kept as raw
/// text rather than pre-parsed fields so the positional/line-oriented
/// decoding stays a pure, independently testable function (spec.md §9's
/// Open Question about the `field 39 = current cpu` convention).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRawRecord {
    pub pid: u32,
    pub tid: u32,
    pub stat_line: String,
    pub status_text: String,
}

/// Discovery of the isolation-capable cpu set, running timers, and every
/// other schedulable entity on the machine.
pub trait PlatformDiscovery: Send + Sync {
    /// The machine's isolation-capable cpu list, read from
    /// `<sysfs>/cpu/task_isolation` (falling back to `<sysfs>/cpu/isolated`).
    fn isolation_capable_cpus(&self) -> IsolResult<CpuSet>;

    /// Raw text of the platform's timer listing (spec.md §4.4's grammar),
    /// e.g. the contents of `/proc/timer_list`.
    fn read_timer_feed(&self) -> IsolResult<String>;

    /// One record per `(pid, tid)` pair on the machine (spec.md §4.5 / §6).
    fn list_threads(&self) -> IsolResult<Vec<ThreadRawRecord>>;
}

/// Combined platform interface. A `Manager` is generic over one
/// implementation for the lifetime of a process.
pub trait Platform: PlatformIsolation + PlatformSignal + PlatformThread + PlatformDiscovery {
    fn name(&self) -> &'static str;
}

/// Stand-in used when a `Platform` call is not yet wired to a real
/// backend; every method returns `PlatformError::Other`. Production code
/// should never construct this; it exists for early bring-up and for
/// tests that only exercise a subset of `Platform`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnimplementedPlatform;

impl PlatformIsolation for UnimplementedPlatform {
    fn set_isolation(&self, _on: bool) -> IsolResult<()> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
    fn pin(&self, _cpu: u32) -> IsolResult<()> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
    fn set_affinity(&self, _cpus: &CpuSet) -> IsolResult<()> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
    fn mlock_all(&self) -> IsolResult<()> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
}

impl PlatformSignal for UnimplementedPlatform {
    fn install_isolation_lost_handler(&self) -> IsolResult<()> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
}

impl PlatformThread for UnimplementedPlatform {
    fn current_tid(&self) -> u64 {
        0
    }
}

impl PlatformDiscovery for UnimplementedPlatform {
    fn isolation_capable_cpus(&self) -> IsolResult<CpuSet> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
    fn read_timer_feed(&self) -> IsolResult<String> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
    fn list_threads(&self) -> IsolResult<Vec<ThreadRawRecord>> {
        Err(PlatformError::Other("unimplemented".into()).into())
    }
}

impl Platform for UnimplementedPlatform {
    fn name(&self) -> &'static str {
        "unimplemented"
    }
}
