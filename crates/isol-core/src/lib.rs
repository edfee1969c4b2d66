//! # isol-core
//!
//! Platform-agnostic core types for the task isolation manager.
//!
//! This crate contains no OS-specific code: no syscalls, no `/proc`
//! reading, no signal installation. Those live in `isol-runtime` behind
//! the `Platform` trait. What's here is the wire-level building blocks
//! shared by every component that touches a `Ring`: message framing, the
//! ring itself, cpu set parsing, lifecycle state, logging, and errors.
//!
//! ## Modules
//!
//! - `constants` - fixed sizes and defaults shared across the crate
//! - `message` - `MessageKind` and the framed `Message` type carried by a `Ring`
//! - `ring` - the lock-free single-producer/single-consumer byte ring
//! - `state` - worker lifecycle state and the isolation tri-state flag
//! - `cpuset` - cpu list and hex-mask parsing
//! - `error` - crate-wide error types
//! - `kprint` - kernel-style leveled debug printing macros
//! - `env` - environment variable utilities
//! - `traits` - the `Platform` abstraction implemented by `isol-runtime`

#![allow(dead_code)]

pub mod constants;
pub mod cpuset;
pub mod env;
pub mod error;
pub mod kprint;
pub mod message;
pub mod ring;
pub mod state;
pub mod traits;

pub use cpuset::CpuSet;
pub use error::{ControlError, IsolError, IsolResult, PlatformError, RingError};
pub use message::{Direction, Message, MessageKind, StartReadyPayload};
pub use ring::Ring;
pub use state::{IsolationFlag, WorkerLifecycleState};
pub use traits::{Platform, PlatformDiscovery, PlatformIsolation, PlatformSignal, PlatformThread, ThreadRawRecord};
