//! Fixed sizes and defaults shared between manager and worker.

/// Size of one shared memory area backing a `Ring` (bytes).
pub const AREA_SIZE: usize = 4096;

/// Encoded block size: 7 payload bytes + 1 presence bit per byte.
pub const SEVEN: usize = 7;
pub const EIGHT: usize = 8;

/// Header carried by the first block of every message: `{kind: u8, size: u32 LE}`.
pub const HEADER_SIZE: usize = 5;

/// Largest payload a single message may carry.
pub const MAX_MSG: usize = AREA_SIZE - HEADER_SIZE;

/// Maximum number of isolation-capable workers a single manager can own.
pub const MAX_WORKERS: usize = 64;

/// Default "wait for all workers to reach Ready" barrier.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 20_000;

/// Default debounce before re-entering isolation after a forced temporary exit.
pub const DEFAULT_RESTART_DELAY_MS: u64 = 3_000;

/// Default manager poll timeout when no worker is mid-flight.
pub const IDLE_POLL_MS: u64 = 200;

/// ThreadSweeper cadence outside the Launched-state fast path.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 3_000;

/// Sentinel for "no expiration" / "far future". Mirrors the kernel's
/// `KTIME_MAX`, `(int64_t)~((uint64_t)1 << 63)` - i.e. `i64::MAX`, not
/// `u64::MAX`: ktime values are a signed nanosecond count.
pub const KTIME_MAX: u64 = i64::MAX as u64;

/// Default control-socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/isol_server";
