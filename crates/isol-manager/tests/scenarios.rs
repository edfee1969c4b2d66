//! End-to-end scenarios over a freshly constructed `Manager` with a fake
//! `Platform` (spec.md §8, §9's "a test is a freshly constructed Manager
//! with a fake Platform"). Worker threads are simulated by writing
//! directly onto each worker's `m2w`/`w2m` rings, the same protocol a real
//! `isol_runtime::worker::run_managed` loop speaks.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, Ordering};

use isol_core::cpuset::CpuSet;
use isol_core::error::IsolResult;
use isol_core::message::MessageKind;
use isol_core::state::{IsolationFlag, WorkerLifecycleState};
use isol_core::traits::{Platform, PlatformDiscovery, PlatformIsolation, PlatformSignal, PlatformThread, ThreadRawRecord};

use isol_manager::config::ManagerConfig;
use isol_manager::manager::Manager;

use std::time::Duration;

struct FakePlatform {
    isolation_cpus: String,
    timer_feed: RefCell<String>,
    threads: RefCell<Vec<ThreadRawRecord>>,
}

impl FakePlatform {
    fn new(isolation_cpus: &str) -> Self {
        Self {
            isolation_cpus: isolation_cpus.to_string(),
            timer_feed: RefCell::new(String::new()),
            threads: RefCell::new(Vec::new()),
        }
    }

    fn set_timer_feed(&self, text: &str) {
        *self.timer_feed.borrow_mut() = text.to_string();
    }
}

impl PlatformIsolation for FakePlatform {
    fn set_isolation(&self, _on: bool) -> IsolResult<()> {
        Ok(())
    }
    fn pin(&self, _cpu: u32) -> IsolResult<()> {
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
        0
    }
}

impl PlatformDiscovery for FakePlatform {
    fn isolation_capable_cpus(&self) -> IsolResult<CpuSet> {
        Ok(CpuSet::parse_list(&self.isolation_cpus).unwrap())
    }
    fn read_timer_feed(&self) -> IsolResult<String> {
        Ok(self.timer_feed.borrow().clone())
    }
    fn list_threads(&self) -> IsolResult<Vec<ThreadRawRecord>> {
        Ok(self.threads.borrow().clone())
    }
}

impl Platform for FakePlatform {
    fn name(&self) -> &'static str {
        "fake"
    }
}

fn test_config() -> ManagerConfig {
    ManagerConfig {
        socket_path: "/tmp/isol_server_test".into(),
        start_timeout: Duration::from_millis(50),
        restart_delay: Duration::from_millis(20),
        idle_poll: Duration::from_millis(1),
        sweep_interval: Duration::from_millis(10),
        cpu_subset_id: None,
        cpu_subset_inline: None,
    }
}

/// Drive a worker's side of the managed-create handshake up through
/// `StartReady`, mirroring `isol_runtime::worker::run_managed`'s first
/// half without a real thread.
fn worker_send_init_and_ready(m: &Manager<FakePlatform>, idx: usize, tid: u64) {
    let w = &m.workers[idx];
    w.w2m.bind_writer();
    w.w2m.put(MessageKind::Init, &[]).unwrap();
    w.w2m
        .put(MessageKind::StartReady, &isol_core::message::StartReadyPayload { tid }.encode())
        .unwrap();
}

fn worker_send(m: &Manager<FakePlatform>, idx: usize, kind: MessageKind) {
    m.workers[idx].w2m.put(kind, &[]).unwrap();
}

fn drain_m2w(m: &Manager<FakePlatform>, idx: usize) -> Vec<MessageKind> {
    let mut out = Vec::new();
    m.workers[idx].m2w.bind_reader();
    while let Ok(msg) = m.workers[idx].m2w.get(isol_core::constants::MAX_MSG) {
        out.push(msg.kind);
    }
    out
}

// `Manager::pass` drains every pending `w2m` message and then runs one
// `StateMachine::on_tick` evaluation in the same call, so a worker that
// reaches `Ready` mid-pass is immediately carried on to `Launching` (and
// likewise `Launched` straight on to `Running` when no timer blocks it)
// without a pass boundary in between - these scenarios assert the state
// actually observable *between* `pass()` calls, not every row of the
// table individually (that's `state_machine`'s own unit tests' job).

#[test]
fn scenario_happy_path() {
    let platform = FakePlatform::new("1,2");
    let mut manager = Manager::new(platform, test_config()).unwrap();

    let idx1 = manager.claim_cpu(Some(1)).unwrap();
    let idx2 = manager.claim_cpu(Some(2)).unwrap();

    worker_send_init_and_ready(&manager, idx1, 101);
    worker_send_init_and_ready(&manager, idx2, 102);

    manager.pass();
    assert_eq!(manager.workers[idx1].state, WorkerLifecycleState::Launching);
    assert_eq!(manager.workers[idx2].state, WorkerLifecycleState::Launching);
    assert_eq!(drain_m2w(&manager, idx1), vec![MessageKind::StartLaunch]);

    worker_send(&manager, idx1, MessageKind::StartLaunchDone);
    worker_send(&manager, idx2, MessageKind::StartLaunchDone);
    manager.pass();
    assert_eq!(manager.workers[idx1].state, WorkerLifecycleState::Running);
    assert_eq!(manager.workers[idx2].state, WorkerLifecycleState::Running);
    assert!(drain_m2w(&manager, idx1).contains(&MessageKind::StartConfirmed));

    manager.request_terminate_all();
    manager.pass();
    assert!(drain_m2w(&manager, idx1).contains(&MessageKind::Terminate));

    worker_send(&manager, idx1, MessageKind::Exiting);
    worker_send(&manager, idx2, MessageKind::Exiting);
    manager.pass();

    assert_eq!(manager.workers[idx1].state, WorkerLifecycleState::Off);
    assert_eq!(manager.workers[idx2].state, WorkerLifecycleState::Off);
    assert!(manager.should_exit());
}

#[test]
fn scenario_timer_blocks_entry() {
    let platform = FakePlatform::new("1");
    let mut manager = Manager::new(platform, test_config()).unwrap();
    let idx = manager.claim_cpu(Some(1)).unwrap();

    worker_send_init_and_ready(&manager, idx, 201);
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::Launching);

    worker_send(&manager, idx, MessageKind::StartLaunchDone);
    manager.platform.set_timer_feed("cpu: 1\n .expires_next : 500\n");
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::TmpExitingIsolation);
    assert!(drain_m2w(&manager, idx).contains(&MessageKind::ExitIsolation));

    manager.platform.set_timer_feed("");
    std::thread::sleep(Duration::from_millis(25));
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::Launching);
    assert!(drain_m2w(&manager, idx).contains(&MessageKind::StartLaunch));

    worker_send(&manager, idx, MessageKind::StartLaunchDone);
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::Running);
}

#[test]
fn scenario_involuntary_loss() {
    let platform = FakePlatform::new("2");
    let mut manager = Manager::new(platform, test_config()).unwrap();
    let idx = manager.claim_cpu(Some(2)).unwrap();

    worker_send_init_and_ready(&manager, idx, 301);
    manager.pass();
    worker_send(&manager, idx, MessageKind::StartLaunchDone);
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::Running);

    manager.workers[idx].isolated.store(IsolationFlag::Absent as u8, Ordering::SeqCst);
    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::LostIsolation);

    manager.pass();
    assert_eq!(manager.workers[idx].state, WorkerLifecycleState::Launching);
    assert!(drain_m2w(&manager, idx).contains(&MessageKind::StartLaunch));
}

#[test]
fn scenario_subset_filtering() {
    let platform = FakePlatform::new("1,2,3,4,5,6,7,8,9,10");
    let mut config = test_config();
    config.cpu_subset_id = Some("lo".to_string());
    config.cpu_subset_inline = Some("lo: 1-4\n".to_string());

    let manager = Manager::new(platform, config).unwrap();
    let mut cpus: Vec<u32> = manager.workers.iter().map(|w| w.cpu).collect();
    cpus.sort_unstable();
    assert_eq!(cpus, vec![1, 2, 3, 4]);
    assert_eq!(manager.config.effective_socket_path(), "/tmp/isol_server_test.lo");
}

#[test]
fn scenario_claim_is_exclusive_per_cpu() {
    let platform = FakePlatform::new("1");
    let mut manager = Manager::new(platform, test_config()).unwrap();

    let first = manager.claim_cpu(Some(1));
    assert!(first.is_some());
    let second = manager.claim_cpu(Some(1));
    assert!(second.is_none());
}
