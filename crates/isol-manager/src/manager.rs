//! Owns the Workers table and drives the central loop (spec.md §4.6).
//!
//! A `Worker` here is the manager-side half of spec.md §3's record: the
//! two `Ring`s shared with the worker thread (or foreign process), the
//! lifecycle state, the `isolated` tri-state flag (the *only*
//! cross-ring synchronizer, per spec.md §5), and the handful of
//! manager-only bookkeeping fields (claim counter, state-entry
//! timestamp, exit request).
//!
//! Memory for a claimed cpu's two `Ring`s is shared with the worker
//! thread via `Arc`; `isolated` is shared the same way so the `SIGUSR1`
//! handler (running on the worker's own thread, see
//! `isol-runtime::tls`) and the manager's poll both reach the same byte.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use isol_core::constants::{AREA_SIZE, MAX_MSG};
use isol_core::cpuset::CpuSet;
use isol_core::error::RingError;
use isol_core::message::MessageKind;
use isol_core::ring::Ring;
use isol_core::state::{IsolationFlag, WorkerLifecycleState};
use isol_core::traits::Platform;
use isol_core::{kdebug, kinfo, kwarn, IsolResult};
use isol_runtime::thread_sweeper::ThreadSweeper;
use isol_runtime::timer_scanner;

use crate::config::ManagerConfig;
use crate::state_machine::{self, StateAction, TickContext};

/// One isolation-capable cpu's slot in the Workers table.
pub struct Worker {
    pub cpu: u32,
    pub state: WorkerLifecycleState,
    pub isolated: Arc<AtomicU8>,
    pub m2w: Arc<Ring>,
    pub w2m: Arc<Ring>,
    claim_counter: AtomicU32,
    state_entered_at: Instant,
    pub exit_requested: bool,
    pub ever_ran: bool,
    pub tid: Option<u64>,
    pub pid: Option<u32>,
    /// Set for a self-connect (foreign process) attach; managed-create
    /// workers join their own spawned thread instead (spec.md §4.3's
    /// "join if same-process").
    pub foreign: bool,
}

impl Worker {
    fn new(cpu: u32) -> Self {
        Self {
            cpu,
            state: WorkerLifecycleState::Off,
            isolated: Arc::new(AtomicU8::new(IsolationFlag::Absent as u8)),
            m2w: Arc::new(Ring::new(AREA_SIZE)),
            w2m: Arc::new(Ring::new(AREA_SIZE)),
            claim_counter: AtomicU32::new(0),
            state_entered_at: Instant::now(),
            exit_requested: false,
            ever_ran: false,
            tid: None,
            pid: None,
            foreign: false,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claim_counter.load(Ordering::SeqCst) > 0
    }

    /// Tie-break cpu claim (spec.md §8: "at most one Worker has
    /// claim_counter > 0 for a given cpu at any time"). Returns `true`
    /// if this call won the claim.
    fn try_claim(&self) -> bool {
        let prev = self.claim_counter.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            true
        } else {
            self.claim_counter.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    fn release(&mut self) {
        self.claim_counter.store(0, Ordering::SeqCst);
        self.state = WorkerLifecycleState::Off;
        self.isolated.store(IsolationFlag::Absent as u8, Ordering::SeqCst);
        self.tid = None;
        self.pid = None;
        self.foreign = false;
        self.exit_requested = false;
        self.state_entered_at = Instant::now();
    }

    fn set_state(&mut self, next: WorkerLifecycleState) {
        if next != self.state {
            self.state = next;
            self.state_entered_at = Instant::now();
            if next == WorkerLifecycleState::Running {
                self.ever_ran = true;
            }
        }
    }

    fn elapsed_in_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }
}

/// Manager owning the Workers table, the sweeper, and (via `P`) every
/// platform call. Generic over `Platform` so tests substitute a fake
/// (spec.md §9's "a test is a freshly constructed Manager with a fake
/// Platform").
pub struct Manager<P: Platform> {
    pub platform: P,
    pub config: ManagerConfig,
    pub workers: Vec<Worker>,
    sweeper: ThreadSweeper,
    last_sweep: Instant,
    isolation_set: CpuSet,
    all_cpus: CpuSet,
    last_timer_expiry: HashMap<u32, u64>,
    start_timer_active: bool,
    start_phase_began_at: Option<Instant>,
    /// Set once a `terminate` control command has been accepted
    /// (spec.md §4.7). The central loop's exit predicate (§4.6) is
    /// gated on this rather than literally "no worker ever ran" - read
    /// that way the loop would exit on its very first idle pass, which
    /// cannot be the intent; see DESIGN.md.
    terminate_requested: bool,
}

impl<P: Platform> Manager<P> {
    /// Build a Manager over the isolation-capable cpus reported by
    /// `platform`, intersected with any `CPU_SUBSET_ID` filter (spec.md
    /// §4.7, §8 scenario 6).
    pub fn new(platform: P, config: ManagerConfig) -> IsolResult<Self> {
        let capable = platform.isolation_capable_cpus()?;
        if capable.is_empty() {
            return Err(isol_core::IsolError::NoIsolationCpus);
        }
        let isolation_set = config.apply_subset(&capable)?;
        if isolation_set.is_empty() {
            return Err(isol_core::IsolError::NoIsolationCpus);
        }

        let workers = isolation_set.iter().map(Worker::new).collect();

        // Best-effort "every cpu on the box", used only to widen the
        // sweeper's rebind target when a foreign thread's affinity is
        // entirely inside the isolation set (spec.md §4.5). Falls back
        // to the isolation set itself (an empty complement) if the
        // platform can't report parallelism, which degrades to "leave
        // it alone" rather than an unsafe empty affinity mask.
        let total_cpus = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(0);
        let all_cpus = if total_cpus > 0 {
            CpuSet::from_cpus(0..total_cpus)
        } else {
            isolation_set.clone()
        };

        Ok(Self {
            platform,
            config,
            workers,
            sweeper: ThreadSweeper::new(),
            last_sweep: Instant::now() - Duration::from_secs(3600),
            isolation_set: isolation_set.clone(),
            all_cpus,
            last_timer_expiry: HashMap::new(),
            start_timer_active: true,
            start_phase_began_at: None,
            terminate_requested: false,
        })
    }

    /// `terminate` control command (spec.md §4.7): set `exit_requested`
    /// on every claimed worker and mark the manager itself as winding
    /// down.
    pub fn request_terminate_all(&mut self) {
        self.terminate_requested = true;
        for w in self.workers.iter_mut().filter(|w| w.is_claimed()) {
            w.exit_requested = true;
        }
    }

    /// Claim a cpu for a new attach (spec.md §4.7's `newtask`). `-1`
    /// (`None`) means "any free cpu". Returns the claimed worker's index.
    pub fn claim_cpu(&mut self, wanted: Option<u32>) -> Option<usize> {
        if self.start_phase_began_at.is_none() {
            self.start_phase_began_at = Some(Instant::now());
        }
        match wanted {
            Some(cpu) => {
                let idx = self.workers.iter().position(|w| w.cpu == cpu)?;
                if self.workers[idx].try_claim() {
                    Some(idx)
                } else {
                    None
                }
            }
            None => self.workers.iter().position(|w| !w.is_claimed() && w.try_claim()),
        }
    }

    /// Worker→manager message kinds whose source `isol-core::Message`
    /// needs a second look before a blanket `on_message` dispatch (the
    /// `StartReady` payload carries the worker's `tid`, spec.md §9).
    fn handle_w2m_message(&mut self, idx: usize, msg: &isol_core::message::Message) {
        if msg.kind == MessageKind::StartReady {
            if let Some(p) = isol_core::message::StartReadyPayload::decode(&msg.payload) {
                self.workers[idx].tid = Some(p.tid);
            }
        }

        let state = self.workers[idx].state;
        let Some(transition) = state_machine::on_message(state, msg.kind) else {
            kdebug!("cpu {}: ignoring {:?} in state {:?}", self.workers[idx].cpu, msg.kind, state);
            return;
        };
        self.apply_transition(idx, transition);
    }

    /// Apply a transition computed outside the central loop's own
    /// `on_message`/`on_tick` calls - used by `control.rs` to fold
    /// `taskisolfail`/`taskisolfinish`/disconnect into the same state
    /// machine a worker's own messages drive.
    pub fn apply_external_transition(&mut self, idx: usize, transition: state_machine::Transition) {
        self.apply_transition(idx, transition);
    }

    fn apply_transition(&mut self, idx: usize, transition: state_machine::Transition) {
        let cpu = self.workers[idx].cpu;
        self.workers[idx].set_state(transition.next);

        let send = |ring: &Ring, kind: MessageKind| {
            if let Err(e) = ring.put(kind, &[]) {
                kwarn!("cpu {}: failed to enqueue {:?}: {}", cpu, kind, e);
            }
        };

        match transition.action {
            StateAction::None => {}
            StateAction::EmitStartLaunch => send(&self.workers[idx].m2w, MessageKind::StartLaunch),
            StateAction::EmitStartConfirmed => send(&self.workers[idx].m2w, MessageKind::StartConfirmed),
            StateAction::EmitExitIsolation => send(&self.workers[idx].m2w, MessageKind::ExitIsolation),
            StateAction::EmitOkLeaveIsolation => send(&self.workers[idx].m2w, MessageKind::OkLeaveIsolation),
            StateAction::EmitTerminate => send(&self.workers[idx].m2w, MessageKind::Terminate),
            StateAction::ReleaseWorker => {
                kinfo!("cpu {}: worker exited, releasing claim", cpu);
                self.workers[idx].release();
            }
        }
    }

    /// Drain every worker's `w2m` ring (spec.md §4.6's inner loop).
    fn drain_w2m(&mut self) {
        for idx in 0..self.workers.len() {
            if !self.workers[idx].is_claimed() {
                continue;
            }
            loop {
                let got = self.workers[idx].w2m.get(MAX_MSG);
                match got {
                    Ok(msg) => self.handle_w2m_message(idx, &msg),
                    Err(RingError::Empty) => break,
                    Err(e) => {
                        kwarn!("cpu {}: w2m.get failed: {}", self.workers[idx].cpu, e);
                        break;
                    }
                }
            }
        }
    }

    /// One `TimerScanner` + `StateMachine` tick pass (spec.md §4.3,
    /// §4.6's `process_ready_launch`).
    fn tick(&mut self) {
        // Barrier: every claimed worker must have reported `StartReady`
        // (i.e. advanced past `Started`) before any of them is allowed
        // to launch, unless `start_timeout` has elapsed (spec.md §4.3).
        let all_ready = self
            .workers
            .iter()
            .filter(|w| w.is_claimed())
            .all(|w| !matches!(w.state, WorkerLifecycleState::Off | WorkerLifecycleState::Started));
        let timeout_elapsed = self
            .start_phase_began_at
            .map(|t| t.elapsed() >= self.config.start_timeout)
            .unwrap_or(false);

        let timer_result = if self.start_timer_active {
            self.platform.read_timer_feed().ok().map(|feed| timer_scanner::scan(std::io::Cursor::new(feed.into_bytes())))
        } else {
            None
        };
        if let Some(r) = &timer_result {
            for obs in &r.observations {
                let latest = self.last_timer_expiry.entry(obs.cpu).or_insert(0);
                if obs.expires > *latest {
                    *latest = obs.expires;
                }
            }
            timer_scanner::reset_expired(&mut self.last_timer_expiry, r.now);
        }

        for idx in 0..self.workers.len() {
            if !self.workers[idx].is_claimed() {
                continue;
            }
            let cpu = self.workers[idx].cpu;
            let state = self.workers[idx].state;
            let isolated_now = IsolationFlag::from_u8(self.workers[idx].isolated.load(Ordering::SeqCst));

            let isolation_lost_observed =
                state.expects_isolation() && isolated_now == IsolationFlag::Absent && state == WorkerLifecycleState::Running;

            let timers_on_self = timer_result.as_ref().map(|r| r.cpus_with_timers.contains(cpu)).unwrap_or(false);

            let ctx = TickContext {
                all_ready_or_timeout: all_ready || timeout_elapsed,
                timers_on_self_cpu: timers_on_self,
                isolation_lost_observed,
                elapsed_in_state: self.workers[idx].elapsed_in_state(),
                restart_delay: self.config.restart_delay,
                exit_requested: self.workers[idx].exit_requested,
            };

            if let Some(transition) = state_machine::on_tick(state, &ctx) {
                self.apply_transition(idx, transition);
            }
        }
    }

    /// Run the sweeper if this pass warrants it (spec.md §4.5: every
    /// Launched-state pass, plus at most once every 3s otherwise).
    fn maybe_sweep(&mut self) {
        let any_launched = self.workers.iter().any(|w| w.state == WorkerLifecycleState::Launched);
        let due = self.last_sweep.elapsed() >= self.config.sweep_interval;
        if !any_launched && !due {
            return;
        }
        self.last_sweep = Instant::now();

        let Ok(records) = self.platform.list_threads() else { return };
        let managed: std::collections::HashSet<(u32, u32)> = self
            .workers
            .iter()
            .filter_map(|w| w.pid.zip(w.tid.map(|t| t as u32)))
            .collect();
        let non_iso = self.all_cpus.difference(&self.isolation_set);
        let actions = self.sweeper.sweep(&records, &managed, &self.isolation_set, &non_iso);
        for action in actions {
            if let Err(e) = self.platform.set_affinity(&action.new_mask) {
                kwarn!("sweep rebind of pid {} tid {} failed: {}", action.pid, action.tid, e);
            }
        }
    }

    /// Body of one central-loop iteration (spec.md §4.6), excluding the
    /// `Control.poll` step (owned by `control.rs`, called by the
    /// top-level `run` function in `cmd/isol-manager`).
    pub fn pass(&mut self) {
        self.drain_w2m();
        self.tick();
        self.maybe_sweep();
    }

    /// True iff any claimed worker is mid-flight or has an outstanding
    /// exit request (spec.md §4.6's `io_expected`).
    pub fn io_expected(&self) -> bool {
        self.workers.iter().any(|w| w.is_claimed() && (w.state.is_transient() || w.exit_requested))
    }

    /// Manager termination predicate (spec.md §4.6): `terminate` was
    /// accepted, every worker is `Off`, and (callers should also check)
    /// no pending outbound control data remains.
    pub fn should_exit(&self) -> bool {
        self.terminate_requested && self.workers.iter().all(|w| w.state == WorkerLifecycleState::Off && !w.is_claimed())
    }

    pub fn idle_poll_timeout(&self) -> Duration {
        if self.io_expected() {
            Duration::ZERO
        } else {
            self.config.idle_poll
        }
    }
}
