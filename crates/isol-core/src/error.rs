//! Error types for the isolation manager

use core::fmt;

/// Result type for manager/worker operations.
pub type IsolResult<T> = Result<T, IsolError>;

/// Top-level error type. Every component's sub-errors fold into this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolError {
    /// Ring would block (full on put, empty on get) - not a real error, caller retries.
    Ring(RingError),

    /// Platform-level failure (pin, set_isolation, mlock, ...).
    Platform(PlatformError),

    /// Control-protocol level failure.
    Control(ControlError),

    /// No isolation-capable cpus were found at init time.
    NoIsolationCpus,

    /// Requested cpu is not in the isolation-capable set, or already claimed.
    CpuUnavailable,

    /// Socket name is held by a live peer.
    SocketInUse,

    /// Generic I/O failure, preserved as a message (`std::io::Error` is not `Clone`).
    Io(String),
}

impl fmt::Display for IsolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolError::Ring(e) => write!(f, "ring error: {}", e),
            IsolError::Platform(e) => write!(f, "platform error: {}", e),
            IsolError::Control(e) => write!(f, "control error: {}", e),
            IsolError::NoIsolationCpus => write!(f, "no isolation-capable cpus available"),
            IsolError::CpuUnavailable => write!(f, "requested cpu unavailable"),
            IsolError::SocketInUse => write!(f, "control socket already owned by a live manager"),
            IsolError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for IsolError {}

impl From<std::io::Error> for IsolError {
    fn from(e: std::io::Error) -> Self {
        IsolError::Io(e.to_string())
    }
}

impl From<RingError> for IsolError {
    fn from(e: RingError) -> Self {
        IsolError::Ring(e)
    }
}

impl From<PlatformError> for IsolError {
    fn from(e: PlatformError) -> Self {
        IsolError::Platform(e)
    }
}

impl From<ControlError> for IsolError {
    fn from(e: ControlError) -> Self {
        IsolError::Control(e)
    }
}

#[cfg(unix)]
impl From<nix::Error> for IsolError {
    fn from(e: nix::Error) -> Self {
        IsolError::Platform(PlatformError::Other(e.to_string()))
    }
}

/// Errors returned by `Ring::put` / `Ring::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Not enough free blocks to hold the message right now; retry later.
    WouldBlock,
    /// No complete message available to read.
    Empty,
    /// Message is larger than the caller's output buffer.
    TooLarge,
    /// Caller is neither the registered writer nor reader for this ring.
    WrongThread,
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::WouldBlock => write!(f, "ring full, would block"),
            RingError::Empty => write!(f, "ring empty"),
            RingError::TooLarge => write!(f, "message too large for output buffer"),
            RingError::WrongThread => write!(f, "caller is not the ring's registered writer/reader"),
        }
    }
}

/// Errors from the `Platform` abstraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    IsolationEnableFailed,
    IsolationDisableFailed,
    SignalInstallFailed,
    ListTimersFailed,
    Other(String),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::IsolationEnableFailed => write!(f, "failed to enable isolation"),
            PlatformError::IsolationDisableFailed => write!(f, "failed to disable isolation"),
            PlatformError::SignalInstallFailed => write!(f, "failed to install signal handler"),
            PlatformError::ListTimersFailed => write!(f, "failed to read timer feed"),
            PlatformError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Errors from the control-socket protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    InvalidCommand,
    AlreadyConnected,
    NoTaskConnected,
    CantAllocateCpu,
    MalformedLine,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidCommand => write!(f, "Invalid command."),
            ControlError::AlreadyConnected => write!(f, "Already connected."),
            ControlError::NoTaskConnected => write!(f, "No task connected."),
            ControlError::CantAllocateCpu => write!(f, "Can't allocate CPU."),
            ControlError::MalformedLine => write!(f, "malformed request line"),
        }
    }
}
