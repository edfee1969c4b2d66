//! Per-worker lifecycle state, as driven by the manager-side `StateMachine`.

/// A worker's position in the isolation lifecycle.
///
/// Transitions are owned by the manager (see `isol-manager::state_machine`);
/// this type only names the states and the handful of predicates other
/// components need (is the worker mid-flight, does it expect isolation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerLifecycleState {
    Off = 0,
    Started = 1,
    Ready = 2,
    Launching = 3,
    Launched = 4,
    Running = 5,
    TmpExitingIsolation = 6,
    ExitingIsolation = 7,
    LostIsolation = 8,
}

impl WorkerLifecycleState {
    /// True for every state between `Started` and a terminal `Off`, i.e.
    /// states the manager's `io_expected` predicate (spec §4.6) treats as
    /// "this worker still needs polling."
    pub const fn is_transient(&self) -> bool {
        use WorkerLifecycleState::*;
        matches!(self, Started | Ready | Launching | Launched | TmpExitingIsolation | ExitingIsolation | LostIsolation)
    }

    /// True once the manager has told this worker it may run its isolated
    /// user code (i.e. `StartConfirmed` has been sent and accepted).
    pub const fn is_running(&self) -> bool {
        matches!(self, WorkerLifecycleState::Running)
    }

    /// True for states in which the cpu is expected to be actively
    /// isolation-bearing: a timer observed here blocks confirmation, and a
    /// `SIGUSR1` here is a real loss rather than noise.
    pub const fn expects_isolation(&self) -> bool {
        matches!(self, WorkerLifecycleState::Launched | WorkerLifecycleState::Running)
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        use WorkerLifecycleState::*;
        Some(match v {
            0 => Off,
            1 => Started,
            2 => Ready,
            3 => Launching,
            4 => Launched,
            5 => Running,
            6 => TmpExitingIsolation,
            7 => ExitingIsolation,
            8 => LostIsolation,
            _ => return None,
        })
    }
}

impl std::fmt::Display for WorkerLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerLifecycleState::Off => "Off",
            WorkerLifecycleState::Started => "Started",
            WorkerLifecycleState::Ready => "Ready",
            WorkerLifecycleState::Launching => "Launching",
            WorkerLifecycleState::Launched => "Launched",
            WorkerLifecycleState::Running => "Running",
            WorkerLifecycleState::TmpExitingIsolation => "TmpExitingIsolation",
            WorkerLifecycleState::ExitingIsolation => "ExitingIsolation",
            WorkerLifecycleState::LostIsolation => "LostIsolation",
        };
        f.write_str(s)
    }
}

/// Tri-state isolation flag shared between a worker thread and the manager
/// (spec.md §3's Worker record `isolated` field, §5's "only cross-ring
/// synchronizer"). Written with SeqCst store, read with SeqCst load, from
/// both the owning worker thread, the manager, and (for `Absent`) the
/// `SIGUSR1` handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IsolationFlag {
    Absent = 0,
    Initializing = 1,
    Isolated = 2,
}

impl IsolationFlag {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => IsolationFlag::Initializing,
            2 => IsolationFlag::Isolated,
            _ => IsolationFlag::Absent,
        }
    }
}
