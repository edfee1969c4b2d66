//! Message kinds carried over a `Ring`.

use crate::constants::MAX_MSG;

/// Direction a message travels. Not encoded on the wire — each `Ring`
/// has exactly one writer and one reader, so direction is implicit in
/// which ring a message was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ManagerToWorker,
    WorkerToManager,
}

/// Typed record carried by a `Ring`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    None = 0,
    Init = 1,
    StartReady = 2,
    StartLaunch = 3,
    StartLaunchDone = 4,
    StartLaunchFailure = 5,
    StartConfirmed = 6,
    Terminate = 7,
    ExitIsolation = 8,
    Exiting = 9,
    LeaveIsolation = 10,
    OkLeaveIsolation = 11,
    Ping = 12,
    Pong = 13,
    Cmd = 14,
    Print = 15,
}

impl MessageKind {
    /// Direction this kind travels in the canonical protocol. Some kinds
    /// (`None`, `Ping`/`Pong`) are direction-agnostic; callers that care
    /// track direction by which ring they read from instead.
    pub const fn canonical_direction(&self) -> Option<Direction> {
        use MessageKind::*;
        match self {
            Init | StartReady | Exiting | StartLaunchDone | StartLaunchFailure => {
                Some(Direction::WorkerToManager)
            }
            StartLaunch | StartConfirmed | Terminate | ExitIsolation | OkLeaveIsolation
            | LeaveIsolation => Some(Direction::ManagerToWorker),
            None | Ping | Pong | Cmd | Print => Option::None,
        }
    }

    pub const fn from_u8(v: u8) -> Option<Self> {
        use MessageKind::*;
        Some(match v {
            0 => None,
            1 => Init,
            2 => StartReady,
            3 => StartLaunch,
            4 => StartLaunchDone,
            5 => StartLaunchFailure,
            6 => StartConfirmed,
            7 => Terminate,
            8 => ExitIsolation,
            9 => Exiting,
            10 => LeaveIsolation,
            11 => OkLeaveIsolation,
            12 => Ping,
            13 => Pong,
            14 => Cmd,
            15 => Print,
            _ => return Option::None,
        })
    }
}

/// A decoded message: kind plus an owned copy of its payload.
///
/// Payloads are opaque to the `Ring` layer. Only `Print` (a UTF-8-ish
/// text blob) and `StartReady` (which may carry a pointer-sized counter
/// handle, see [`StartReadyPayload`]) have defined shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_MSG);
        Self { kind, payload }
    }

    pub fn empty(kind: MessageKind) -> Self {
        Self { kind, payload: Vec::new() }
    }
}

/// Payload shape for `StartReady`: the worker's OS thread id, obtained via
/// the platform's `gettid`-equivalent call, propagated to the manager so it
/// can be recorded in the `Worker` record without resorting to structure
/// layout hacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartReadyPayload {
    pub tid: u64,
}

impl StartReadyPayload {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        self.tid.to_le_bytes()
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut b = [0u8; 8];
        b.copy_from_slice(buf);
        Some(Self { tid: u64::from_le_bytes(b) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for v in 0u8..=15 {
            let k = MessageKind::from_u8(v).unwrap();
            assert_eq!(k as u8, v);
        }
        assert!(MessageKind::from_u8(16).is_none());
    }

    #[test]
    fn test_start_ready_payload_roundtrip() {
        let p = StartReadyPayload { tid: 0xdead_beef_1234 };
        let encoded = p.encode();
        let decoded = StartReadyPayload::decode(&encoded).unwrap();
        assert_eq!(p, decoded);
    }
}
