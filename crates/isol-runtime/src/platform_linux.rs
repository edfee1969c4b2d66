//! Linux platform implementation.
//!
//! `pin`/`set_affinity`/`mlock_all`/`current_tid` are real syscalls via
//! `nix`/`libc`. `set_isolation` is the one capability spec.md explicitly
//! treats as an external collaborator (§1: "the OS-specific calls to
//! enable/disable isolation... only their interfaces matter") - there is
//! no single stable mainline uAPI for it, so this talks to the
//! `task_isolation`-style sysfs knob when present and otherwise reports
//! `IsolationEnableFailed`, matching the platform's documented contract
//! rather than guessing at a kernel feature that may not be present.

use isol_core::cpuset::CpuSet as IsolCpuSet;
use isol_core::error::{IsolResult, PlatformError};
use isol_core::traits::{Platform, PlatformDiscovery, PlatformIsolation, PlatformSignal, PlatformThread, ThreadRawRecord};
use isol_core::{kerror, kdebug};
use std::fs;
use std::path::Path;

const SYSFS_TASK_ISOLATION: &str = "/sys/devices/system/cpu/task_isolation";
const SYSFS_ISOLATED: &str = "/sys/devices/system/cpu/isolated";
const PROC_TIMER_LIST: &str = "/proc/timer_list";
const PROC_DIR: &str = "/proc";

/// Linux platform handler.
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformIsolation for LinuxPlatform {
    fn set_isolation(&self, on: bool) -> IsolResult<()> {
        let path = format!("/sys/devices/system/cpu/cpu{}/task_isolation_state", current_cpu_hint());
        match fs::write(&path, if on { "1" } else { "0" }) {
            Ok(()) => Ok(()),
            Err(e) => {
                kdebug!("set_isolation({}) via {} failed: {}", on, path, e);
                if on {
                    Err(PlatformError::IsolationEnableFailed.into())
                } else {
                    Err(PlatformError::IsolationDisableFailed.into())
                }
            }
        }
    }

    fn pin(&self, cpu: u32) -> IsolResult<()> {
        let mut set = nix::sched::CpuSet::new();
        set.set(cpu as usize)?;
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)?;
        Ok(())
    }

    fn set_affinity(&self, cpus: &IsolCpuSet) -> IsolResult<()> {
        let mut set = nix::sched::CpuSet::new();
        for cpu in cpus.iter() {
            set.set(cpu as usize)?;
        }
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)?;
        Ok(())
    }

    fn mlock_all(&self) -> IsolResult<()> {
        nix::sys::mman::mlockall(
            nix::sys::mman::MlockAllFlags::MCL_CURRENT | nix::sys::mman::MlockAllFlags::MCL_FUTURE,
        )?;
        Ok(())
    }
}

impl PlatformSignal for LinuxPlatform {
    fn install_isolation_lost_handler(&self) -> IsolResult<()> {
        crate::signal::install()
    }
}

impl PlatformThread for LinuxPlatform {
    fn current_tid(&self) -> u64 {
        unsafe { libc::syscall(libc::SYS_gettid) as u64 }
    }
}

impl PlatformDiscovery for LinuxPlatform {
    fn isolation_capable_cpus(&self) -> IsolResult<IsolCpuSet> {
        let raw = fs::read_to_string(SYSFS_TASK_ISOLATION)
            .or_else(|_| fs::read_to_string(SYSFS_ISOLATED))
            .map_err(|e| {
                kerror!("could not read isolation-capable cpu list: {}", e);
                PlatformError::Other(format!("no isolation cpu list: {}", e))
            })?;
        IsolCpuSet::parse_list(raw.trim()).ok_or_else(|| PlatformError::Other("empty isolation cpu list".into()).into())
    }

    fn read_timer_feed(&self) -> IsolResult<String> {
        fs::read_to_string(PROC_TIMER_LIST).map_err(|e| {
            kdebug!("read_timer_feed failed: {}", e);
            PlatformError::ListTimersFailed.into()
        })
    }

    fn list_threads(&self) -> IsolResult<Vec<ThreadRawRecord>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(PROC_DIR).map_err(|e| PlatformError::Other(format!("read_dir {}: {}", PROC_DIR, e)))?;
        for entry in entries.flatten() {
            let pid_str = entry.file_name().to_string_lossy().into_owned();
            let pid: u32 = match pid_str.parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let task_dir = Path::new(PROC_DIR).join(&pid_str).join("task");
            let Ok(tasks) = fs::read_dir(&task_dir) else { continue };
            for task in tasks.flatten() {
                let tid: u32 = match task.file_name().to_string_lossy().parse() {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let stat_line = fs::read_to_string(task.path().join("stat")).unwrap_or_default();
                let status_text = fs::read_to_string(task.path().join("status")).unwrap_or_default();
                if stat_line.is_empty() {
                    continue;
                }
                out.push(ThreadRawRecord { pid, tid, stat_line, status_text });
            }
        }
        Ok(out)
    }
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }
}

/// Best-effort hint at which cpu the caller is bound to, used only to
/// build the per-cpu isolation sysfs path; falls back to 0 if affinity
/// cannot be read (the write will then simply fail and surface as
/// `IsolationEnableFailed`/`IsolationDisableFailed`).
fn current_cpu_hint() -> u32 {
    unsafe { libc::sched_getcpu().max(0) as u32 }
}
