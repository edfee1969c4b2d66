//! Worker-side hot loop (spec.md §4.2).
//!
//! This module is what actually runs *inside* the isolated thread: the
//! managed-create and self-connect entry sequences, the
//! `check_new`-gated hot loop, and the worker-side message handler
//! table. Everything the loop needs is reached through an explicit
//! [`WorkerContext`] rather than ambient globals (spec.md §9's "source
//! relies on compiler-provided thread-local storage" note) - the only
//! real thread-local is the tiny slot in [`crate::tls`] that the signal
//! handler reaches through, and even that is set up from here.

use std::cell::Cell;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use isol_core::cpuset::CpuSet;
use isol_core::error::{IsolError, IsolResult};
use isol_core::message::{Message, MessageKind, StartReadyPayload};
use isol_core::ring::Ring;
use isol_core::state::IsolationFlag;
use isol_core::traits::Platform;
use isol_core::{kdebug, kerror};

/// Everything the hot loop and its handlers need, explicit rather than
/// ambient (spec.md §9). Lives on the worker thread's stack for the
/// lifetime of the run; `isolated` is the one field also reachable from
/// outside (the manager's poll, and the `SIGUSR1` handler via
/// [`crate::tls`]).
pub struct WorkerContext<'a> {
    pub cpu: u32,
    pub m2w: &'a Ring,
    pub w2m: &'a Ring,
    pub isolated: &'static AtomicU8,
    continue_flag: Cell<bool>,
    may_leave: Cell<bool>,
    launch_confirmed: Cell<bool>,
}

impl<'a> WorkerContext<'a> {
    pub fn new(cpu: u32, m2w: &'a Ring, w2m: &'a Ring, isolated: &'static AtomicU8) -> Self {
        m2w.bind_reader();
        w2m.bind_writer();
        Self {
            cpu,
            m2w,
            w2m,
            isolated,
            continue_flag: Cell::new(true),
            may_leave: Cell::new(false),
            launch_confirmed: Cell::new(false),
        }
    }

    pub fn should_continue(&self) -> bool {
        self.continue_flag.get()
    }

    pub fn may_leave(&self) -> bool {
        self.may_leave.get()
    }

    pub fn launch_confirmed(&self) -> bool {
        self.launch_confirmed.get()
    }

    fn set_isolation_flag(&self, flag: IsolationFlag) {
        self.isolated.store(flag as u8, Ordering::SeqCst);
    }

    /// Block until a `StartConfirmed` arrives, handling any other
    /// messages that show up first via [`dispatch`] (spec.md §4.2's
    /// "loop get() until StartConfirmed seen").
    fn await_start_confirmed<P: Platform>(&self, platform: &P, poll_interval: Duration) -> IsolResult<()> {
        loop {
            match self.m2w.get(isol_core::constants::MAX_MSG) {
                Ok(msg) => {
                    let confirmed = matches!(msg.kind, MessageKind::StartConfirmed);
                    self.dispatch(platform, &msg)?;
                    if confirmed {
                        return Ok(());
                    }
                }
                Err(isol_core::error::RingError::Empty) => {
                    std::thread::sleep(poll_interval);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The worker-side handler table (spec.md §4.2). Isolation is
    /// disabled before any handler runs except for `None`,
    /// `StartConfirmed`, and `OkLeaveIsolation`, per the spec's explicit
    /// carve-out (those three are the only ones expected to arrive
    /// *while* genuinely isolated and not themselves requiring entry
    /// into the kernel first).
    fn dispatch<P: Platform>(&self, platform: &P, msg: &Message) -> IsolResult<()> {
        if !matches!(msg.kind, MessageKind::None | MessageKind::StartConfirmed | MessageKind::OkLeaveIsolation) {
            let _ = platform.set_isolation(false);
        }

        match msg.kind {
            MessageKind::StartLaunch => {
                // Isolation is neither confirmed nor known absent while
                // pin/mlock/set_isolation are still running (spec.md §4.2,
                // the "initialization is in progress" window isol.c itself
                // calls out around its getpid() branch).
                self.set_isolation_flag(IsolationFlag::Initializing);
                let pin_ok = platform.pin(self.cpu).is_ok();
                let iso_ok = pin_ok && platform.set_isolation(true).is_ok();
                if iso_ok {
                    self.set_isolation_flag(IsolationFlag::Isolated);
                    self.w2m.put(MessageKind::StartLaunchDone, &[])?;
                } else {
                    self.set_isolation_flag(IsolationFlag::Absent);
                    self.w2m.put(MessageKind::StartLaunchFailure, &[])?;
                }
            }
            MessageKind::StartConfirmed => {
                self.launch_confirmed.set(true);
            }
            MessageKind::Terminate => {
                self.continue_flag.set(false);
            }
            MessageKind::ExitIsolation => {
                let _ = platform.set_isolation(false);
                // Affinity restore to the non-isolation complement is the
                // sweeper's job once this thread reappears in its table
                // with a widened mask; here we only drop isolation itself.
                self.set_isolation_flag(IsolationFlag::Absent);
            }
            MessageKind::OkLeaveIsolation => {
                self.may_leave.set(true);
            }
            _ => {
                kdebug!("worker cpu {}: ignoring message kind {:?}", self.cpu, msg.kind);
            }
        }
        Ok(())
    }

    /// One pass of the isolated hot loop: `check_new()` first, full
    /// `get()`/dispatch only when it reports a pending byte (spec.md
    /// §4.1, §4.2).
    pub fn poll_once<P: Platform>(&self, platform: &P) -> IsolResult<()> {
        if !self.m2w.check_new() {
            return Ok(());
        }
        match self.m2w.get(isol_core::constants::MAX_MSG) {
            Ok(msg) => self.dispatch(platform, &msg),
            Err(isol_core::error::RingError::Empty) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Managed-create entry mode (spec.md §4.2.1): the manager has already
/// spawned this thread and wired up `m2w`/`w2m`. Runs `init_routine`,
/// announces readiness, waits for confirmation, then runs
/// `start_routine` with the hot loop available through `ctx`.
pub fn run_managed<P, I, S>(
    platform: &P,
    cpu: u32,
    m2w: &Ring,
    w2m: &Ring,
    isolated: &'static AtomicU8,
    init_routine: I,
    start_routine: S,
) -> IsolResult<()>
where
    P: Platform,
    I: FnOnce(),
    S: FnOnce(&WorkerContext),
{
    platform.pin(cpu)?;
    platform.mlock_all()?;

    let ctx = WorkerContext::new(cpu, m2w, w2m, isolated);
    crate::tls::set_current_isolation_flag(isolated);

    w2m.put(MessageKind::Init, &[])?;
    init_routine();

    let tid = platform.current_tid();
    let payload = StartReadyPayload { tid }.encode();
    w2m.put(MessageKind::StartReady, &payload)?;

    ctx.await_start_confirmed(platform, Duration::from_millis(5))?;

    start_routine(&ctx);

    w2m.put(MessageKind::Exiting, &[])?;
    crate::tls::clear_current_isolation_flag();
    Ok(())
}

/// Self-connect entry mode (spec.md §4.2.2): a thread that already
/// exists sends `newtask cpu,pid/tid\n` over the control socket and
/// binds to the Worker the manager assigns. Returns the parsed
/// `MODE=...`/`INDEX=...`/`CPU=...` attach line so the caller can find
/// its assigned rings; the rest of the lifecycle (await `StartReady`
/// onward) is identical to [`run_managed`] and left to the caller once
/// it has located its `Ring` pair.
pub struct SelfConnectAttach {
    pub mode: String,
    pub index: Option<u32>,
    pub cpu: u32,
}

pub fn self_connect(socket_path: &str, cpu: Option<i64>, pid: u32, tid: u32) -> IsolResult<SelfConnectAttach> {
    let mut stream = UnixStream::connect(socket_path)?;
    let cpu_field = cpu.unwrap_or(-1);
    let request = format!("newtask {},{}/{}\n", cpu_field, pid, tid);
    stream.write_all(request.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut mode = None;
    let mut index = None;
    let mut attached_cpu = None;
    let mut final_code = None;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 4 {
            continue;
        }
        let code: u16 = line[0..3].parse().unwrap_or(0);
        let sep = line.as_bytes()[3] as char;
        let body = &line[4..];
        for kv in body.split(['=', ',', ' ']).collect::<Vec<_>>().chunks(2) {
            // tolerant best-effort KEY=VALUE scan; real parsing lives in
            // isol-manager's client-facing protocol module.
            if let [k, v] = kv {
                match *k {
                    "MODE" => mode = Some(v.to_string()),
                    "INDEX" => index = v.parse().ok(),
                    "CPU" => attached_cpu = v.parse().ok(),
                    _ => {}
                }
            }
        }
        if sep == ' ' {
            final_code = Some(code);
            break;
        }
    }

    match final_code {
        Some(200) => Ok(SelfConnectAttach {
            mode: mode.unwrap_or_default(),
            index,
            cpu: attached_cpu.ok_or_else(|| IsolError::Io("missing CPU in attach response".into()))?,
        }),
        Some(code) => {
            kerror!("self-connect rejected, code {}", code);
            Err(IsolError::CpuUnavailable)
        }
        None => Err(IsolError::Io("connection closed before final response line".into())),
    }
}

/// Restore affinity to everything outside `isolation_set` on the way out
/// of isolation - the worker-local half of spec.md §4.2's
/// `ExitIsolation` handler; the sweeper handles every *other* thread.
pub fn restore_non_isolation_affinity<P: Platform>(platform: &P, all_cpus: &CpuSet, isolation_set: &CpuSet) -> IsolResult<()> {
    let non_iso = all_cpus.difference(isolation_set);
    platform.set_affinity(&non_iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isol_core::constants::AREA_SIZE;
    use isol_core::traits::{PlatformDiscovery, PlatformIsolation, PlatformSignal, PlatformThread, ThreadRawRecord};
    use std::sync::atomic::AtomicBool;

    struct FakePlatform {
        pin_calls: std::cell::RefCell<Vec<u32>>,
        isolation_should_fail: bool,
        isolation_on: AtomicBool,
        flag_during_pin: &'static AtomicU8,
        observed_flag_during_pin: std::cell::Cell<Option<u8>>,
    }

    impl FakePlatform {
        fn new(isolation_should_fail: bool) -> Self {
            Self {
                pin_calls: std::cell::RefCell::new(Vec::new()),
                isolation_should_fail,
                isolation_on: AtomicBool::new(false),
                flag_during_pin: &FLAG,
                observed_flag_during_pin: std::cell::Cell::new(None),
            }
        }
    }

    impl PlatformIsolation for FakePlatform {
        fn set_isolation(&self, on: bool) -> IsolResult<()> {
            if on && self.isolation_should_fail {
                return Err(isol_core::error::PlatformError::IsolationEnableFailed.into());
            }
            self.isolation_on.store(on, Ordering::SeqCst);
            Ok(())
        }
        fn pin(&self, cpu: u32) -> IsolResult<()> {
            self.pin_calls.borrow_mut().push(cpu);
            self.observed_flag_during_pin.set(Some(self.flag_during_pin.load(Ordering::SeqCst)));
            Ok(())
        }
        fn set_affinity(&self, _cpus: &CpuSet) -> IsolResult<()> {
            Ok(())
        }
        fn mlock_all(&self) -> IsolResult<()> {
            Ok(())
        }
    }
    impl PlatformSignal for FakePlatform {
        fn install_isolation_lost_handler(&self) -> IsolResult<()> {
            Ok(())
        }
    }
    impl PlatformThread for FakePlatform {
        fn current_tid(&self) -> u64 {
            4242
        }
    }
    impl PlatformDiscovery for FakePlatform {
        fn isolation_capable_cpus(&self) -> IsolResult<CpuSet> {
            Ok(CpuSet::parse_list("1,2").unwrap())
        }
        fn read_timer_feed(&self) -> IsolResult<String> {
            Ok(String::new())
        }
        fn list_threads(&self) -> IsolResult<Vec<ThreadRawRecord>> {
            Ok(Vec::new())
        }
    }
    impl Platform for FakePlatform {
        fn name(&self) -> &'static str {
            "fake"
        }
    }

    static FLAG: AtomicU8 = AtomicU8::new(0);

    #[test]
    fn test_start_launch_success_path() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(false);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);

        m2w.bind_writer();
        m2w.put(MessageKind::StartLaunch, &[]).unwrap();
        let msg = m2w.get(isol_core::constants::MAX_MSG).unwrap();
        w2m.bind_reader();
        ctx.dispatch(&platform, &msg).unwrap();

        let reply = w2m.get(isol_core::constants::MAX_MSG).unwrap();
        assert_eq!(reply.kind, MessageKind::StartLaunchDone);
        assert_eq!(FLAG.load(Ordering::SeqCst), IsolationFlag::Isolated as u8);
        assert_eq!(platform.pin_calls.borrow().as_slice(), &[1u32]);
    }

    #[test]
    fn test_start_launch_marks_initializing_before_pin() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(false);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);

        m2w.bind_writer();
        m2w.put(MessageKind::StartLaunch, &[]).unwrap();
        let msg = m2w.get(isol_core::constants::MAX_MSG).unwrap();
        w2m.bind_reader();
        ctx.dispatch(&platform, &msg).unwrap();

        assert_eq!(platform.observed_flag_during_pin.get(), Some(IsolationFlag::Initializing as u8));
        assert_eq!(FLAG.load(Ordering::SeqCst), IsolationFlag::Isolated as u8);
    }

    #[test]
    fn test_start_launch_failure_path() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(true);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);

        m2w.bind_writer();
        m2w.put(MessageKind::StartLaunch, &[]).unwrap();
        let msg = m2w.get(isol_core::constants::MAX_MSG).unwrap();
        w2m.bind_reader();
        ctx.dispatch(&platform, &msg).unwrap();

        let reply = w2m.get(isol_core::constants::MAX_MSG).unwrap();
        assert_eq!(reply.kind, MessageKind::StartLaunchFailure);
        assert_eq!(FLAG.load(Ordering::SeqCst), IsolationFlag::Absent as u8);
    }

    #[test]
    fn test_terminate_clears_continue_flag() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(false);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);
        assert!(ctx.should_continue());
        ctx.dispatch(&platform, &Message::empty(MessageKind::Terminate)).unwrap();
        assert!(!ctx.should_continue());
    }

    #[test]
    fn test_ok_leave_isolation_sets_flag() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(false);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);
        assert!(!ctx.may_leave());
        ctx.dispatch(&platform, &Message::empty(MessageKind::OkLeaveIsolation)).unwrap();
        assert!(ctx.may_leave());
    }

    #[test]
    fn test_poll_once_is_noop_when_nothing_pending() {
        let m2w = Ring::new(AREA_SIZE);
        let w2m = Ring::new(AREA_SIZE);
        let platform = FakePlatform::new(false);
        let ctx = WorkerContext::new(1, &m2w, &w2m, &FLAG);
        ctx.poll_once(&platform).unwrap();
        assert!(ctx.should_continue());
    }
}
