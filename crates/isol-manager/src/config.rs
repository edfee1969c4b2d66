//! Manager configuration: compile-time defaults with environment
//! overrides, following `isol-core::env`'s `env_get` convention (the
//! same pattern the scheduler crate this workspace started from uses
//! for its own `SchedulerConfig`).

use std::time::Duration;

use isol_core::constants::{
    DEFAULT_RESTART_DELAY_MS, DEFAULT_SOCKET_PATH, DEFAULT_START_TIMEOUT_MS, DEFAULT_SWEEP_INTERVAL_MS, IDLE_POLL_MS,
};
use isol_core::cpuset::CpuSet;
use isol_core::env::{env_get, env_get_opt, env_get_str};
use isol_core::{kwarn, IsolError, IsolResult};

/// Manager-wide tunables (spec.md §4.3, §4.6, §4.7).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Socket path before any `CPU_SUBSET_ID` suffix is applied.
    pub socket_path: String,
    pub start_timeout: Duration,
    pub restart_delay: Duration,
    pub idle_poll: Duration,
    pub sweep_interval: Duration,
    /// `CPU_SUBSET_ID`, if set; the socket path gets `.{id}` appended
    /// and the isolation-capable cpu list gets intersected with the
    /// subset's list.
    pub cpu_subset_id: Option<String>,
    /// Inline subset expression from `CPU_SUBSET`, consulted before
    /// falling back to `/etc/cpu_subsets`.
    pub cpu_subset_inline: Option<String>,
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        Self {
            socket_path: env_get_str("ISOL_SOCKET_PATH", DEFAULT_SOCKET_PATH),
            start_timeout: Duration::from_millis(env_get("ISOL_START_TIMEOUT_MS", DEFAULT_START_TIMEOUT_MS)),
            restart_delay: Duration::from_millis(env_get("ISOL_RESTART_DELAY_MS", DEFAULT_RESTART_DELAY_MS)),
            idle_poll: Duration::from_millis(env_get("ISOL_IDLE_POLL_MS", IDLE_POLL_MS)),
            sweep_interval: Duration::from_millis(env_get("ISOL_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)),
            cpu_subset_id: env_get_opt("CPU_SUBSET_ID"),
            cpu_subset_inline: env_get_opt("CPU_SUBSET"),
        }
    }

    /// The public socket path, suffixed with `.{id}` when a cpu subset is
    /// selected (spec.md §4.7, §6).
    pub fn effective_socket_path(&self) -> String {
        match &self.cpu_subset_id {
            Some(id) => format!("{}.{}", self.socket_path, id),
            None => self.socket_path.clone(),
        }
    }

    /// Intersect `capable` with the selected `CPU_SUBSET_ID`'s list, if
    /// any. The subset's own list is read from `CPU_SUBSET` (an inline
    /// `id: cpulist` expression, to support tests without touching the
    /// filesystem) or else `/etc/cpu_subsets`, whose lines are
    /// `id: cpulist` (spec.md §4.7).
    pub fn apply_subset(&self, capable: &CpuSet) -> IsolResult<CpuSet> {
        let Some(id) = &self.cpu_subset_id else {
            return Ok(capable.clone());
        };

        let table = match &self.cpu_subset_inline {
            Some(inline) => inline.clone(),
            None => std::fs::read_to_string("/etc/cpu_subsets")
                .map_err(|e| IsolError::Io(format!("cannot read /etc/cpu_subsets: {}", e)))?,
        };

        let subset = parse_subset_table(&table, id).ok_or_else(|| {
            kwarn!("CPU_SUBSET_ID={} not found in subset table", id);
            IsolError::NoIsolationCpus
        })?;

        Ok(capable.intersection(&subset))
    }
}

/// Parse `id: cpulist` lines, returning the `CpuSet` for `want_id`.
fn parse_subset_table(text: &str, want_id: &str) -> Option<CpuSet> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (id, list) = line.split_once(':')?;
        if id.trim() == want_id {
            return CpuSet::parse_list(list.trim());
        }
    }
    None
}
