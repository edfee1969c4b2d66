//! Manager-side `StateMachine` (spec.md §4.3): a pure function from
//! `(current state, event)` to `(next state, action)`. Kept free of
//! `Ring`/`Platform`/timing concerns so every transition in the table is
//! independently testable without a real worker thread - the `Manager`
//! (in `manager.rs`) is the only thing that actually calls `Ring::put`
//! or reads a clock.

use std::time::Duration;

use isol_core::message::MessageKind;
use isol_core::state::WorkerLifecycleState;

/// What the `Manager` must do in response to a transition. Never more
/// than one emit per transition (spec.md §4.3's table has exactly one
/// `emit X` per row).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    None,
    EmitStartLaunch,
    EmitStartConfirmed,
    EmitExitIsolation,
    EmitOkLeaveIsolation,
    EmitTerminate,
    /// Release the cpu claim, detach any foreign reference, join if
    /// same-process (spec.md §4.3's `any --Exiting--> Off` row).
    ReleaseWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: WorkerLifecycleState,
    pub action: StateAction,
}

impl Transition {
    const fn new(next: WorkerLifecycleState, action: StateAction) -> Self {
        Self { next, action }
    }
}

/// React to a worker→manager message. `Exiting` and `StartLaunchFailure`
/// apply from any state ("any" rows in spec.md §4.3's table); everything
/// else requires the specific prior state the table names.
pub fn on_message(state: WorkerLifecycleState, kind: MessageKind) -> Option<Transition> {
    use WorkerLifecycleState::*;

    if kind == MessageKind::Exiting {
        return Some(Transition::new(Off, StateAction::ReleaseWorker));
    }
    if kind == MessageKind::StartLaunchFailure {
        return Some(Transition::new(LostIsolation, StateAction::None));
    }

    match (state, kind) {
        (Off, MessageKind::Init) => Some(Transition::new(Started, StateAction::None)),
        (Started, MessageKind::StartReady) => Some(Transition::new(Ready, StateAction::None)),
        (Launching, MessageKind::StartLaunchDone) => Some(Transition::new(Launched, StateAction::None)),
        (Running, MessageKind::LeaveIsolation) => {
            Some(Transition::new(ExitingIsolation, StateAction::EmitOkLeaveIsolation))
        }
        _ => None,
    }
}

/// Everything a per-pass (clock/sweeper-driven) evaluation needs that
/// isn't itself part of `WorkerLifecycleState` (spec.md §4.3's
/// tie-break rules).
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// True once every `Ready` worker has reported in, or `start_timeout`
    /// has elapsed since the first one did (spec.md: "on expiry, Ready
    /// workers advance individually" - the manager computes this
    /// per-worker-or-globally, both reduce to this bool from here).
    pub all_ready_or_timeout: bool,
    /// `(running_iso_cpus ∩ cpus_with_active_timers) == ∅` restricted to
    /// this worker's own cpu, from the snapshot taken at the start of
    /// this pass (spec.md §4.3).
    pub timers_on_self_cpu: bool,
    /// `SIGUSR1` observed / `isolated == Absent` polled while expected
    /// isolated (spec.md §4.3's `Running --signal SIGUSR1 observed-->`).
    pub isolation_lost_observed: bool,
    /// Time elapsed since this worker entered its current state.
    pub elapsed_in_state: Duration,
    pub restart_delay: Duration,
    /// Manager-wide `exit_requested` has been set for this worker.
    pub exit_requested: bool,
}

/// Evaluate the clock/sweeper-driven half of the table for one worker.
/// Message-driven transitions are handled separately by [`on_message`];
/// a single manager pass calls both (drain `w2m` via `on_message`, then
/// `on_tick` once) per spec.md §4.6's central loop.
pub fn on_tick(state: WorkerLifecycleState, ctx: &TickContext) -> Option<Transition> {
    use WorkerLifecycleState::*;

    match state {
        Ready if ctx.all_ready_or_timeout => Some(Transition::new(Launching, StateAction::EmitStartLaunch)),
        Launched if ctx.timers_on_self_cpu => Some(Transition::new(TmpExitingIsolation, StateAction::EmitExitIsolation)),
        Launched => Some(Transition::new(Running, StateAction::EmitStartConfirmed)),
        Running if ctx.isolation_lost_observed => Some(Transition::new(LostIsolation, StateAction::None)),
        TmpExitingIsolation if ctx.elapsed_in_state >= ctx.restart_delay => {
            Some(Transition::new(Launching, StateAction::EmitStartLaunch))
        }
        LostIsolation => Some(Transition::new(Launching, StateAction::EmitStartLaunch)),
        _ if ctx.exit_requested && state != Off => Some(Transition::new(state, StateAction::EmitTerminate)),
        _ => None,
    }
}
