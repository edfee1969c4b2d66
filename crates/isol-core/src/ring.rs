//! Lock-free, wait-free single-producer/single-consumer byte-ring IPC.
//!
//! The 7-in-8 encoding lets producer and consumer coordinate through one
//! cacheline's worth of data without a shared index, lock, or atomic
//! counter: the low bit of every stored byte is a presence marker (1 =
//! written, 0 = read/empty). A block is ready for the reader iff all 8
//! low bits are 1; ready for the writer iff all 8 low bits are 0. This is
//! what makes `check_new` a plain load — the isolated worker must not
//! make syscalls or touch shared atomic counters in its hot loop.
//!
//! Each block stores its 8 encoded bytes packed into one `u64` (little
//! endian byte order, so `block.to_le_bytes()[i]` is stored byte `i`).
//! Producer and reader each keep a private cursor plus a cached estimate
//! of how far the other side has progressed; the estimate is corrected
//! by rescanning presence bits forward, never by trusting a shared
//! counter — the presence bits are the only source of truth.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crate::constants::{EIGHT, HEADER_SIZE, SEVEN};
use crate::error::RingError;
use crate::message::{Message, MessageKind};

/// Pack up to 7 raw bytes into one 8-byte block, low bit of every byte
/// set to 1 (presence marker).
fn encode_block(src: &[u8]) -> u64 {
    debug_assert!(src.len() <= SEVEN);
    let mut value: u64 = 0;
    for (i, &b) in src.iter().enumerate() {
        value |= (b as u64) << (8 * i);
    }
    let mut out: u64 = 0;
    for k in 0..EIGHT {
        let group = ((value >> (7 * k)) & 0x7f) as u64;
        let byte = ((group as u8) << 1) | 1;
        out |= (byte as u64) << (8 * k);
    }
    out
}

/// Decode an 8-byte block into up to 7 raw bytes. Returns `None` if the
/// block is not fully marked present (a torn read against an in-flight
/// write, or a block the writer hasn't reached yet).
fn decode_block(block: u64, out_len: usize) -> Option<[u8; SEVEN]> {
    debug_assert!(out_len <= SEVEN);
    let bytes = block.to_le_bytes();
    if bytes.iter().any(|b| b & 1 == 0) {
        return None;
    }
    let mut value: u64 = 0;
    for k in 0..EIGHT {
        let group = ((bytes[k] >> 1) & 0x7f) as u64;
        value |= group << (7 * k);
    }
    let mut out = [0u8; SEVEN];
    for i in 0..out_len {
        out[i] = ((value >> (8 * i)) & 0xff) as u8;
    }
    Some(out)
}

fn blocks_needed(total_bytes: usize) -> usize {
    total_bytes.div_ceil(SEVEN).max(1)
}

/// Writer-private cursor state. Only the bound writer thread touches this.
struct WriterSide {
    /// Next block index to write.
    wptr: Cell<usize>,
    /// Writer's view of the oldest still-occupied block (its estimate of
    /// the reader's `rptr`).
    frontier: Cell<usize>,
    /// Blocks believed occupied (written, not yet known to be read).
    occupied: Cell<usize>,
}

/// Reader-private cursor state. Only the bound reader thread touches this.
struct ReaderSide {
    /// Next block index to read from.
    rptr: Cell<usize>,
    /// Reader's view of how far the writer has progressed.
    frontier: Cell<usize>,
    /// Blocks believed ready to read (written, confirmed by presence bits).
    available: Cell<usize>,
}

/// A fixed-size byte ring carrying framed [`Message`]s between exactly one
/// writer and one reader for the lifetime of the ring.
pub struct Ring {
    blocks: Box<[AtomicU64]>,
    num_blocks: usize,
    writer: Cell<Option<ThreadId>>,
    reader: Cell<Option<ThreadId>>,
    w: WriterSide,
    r: ReaderSide,
}

// Safety: `writer`/`reader`/`w`/`r` are only ever mutated by the thread
// bound to that role; the other side only ever reads the shared `blocks`
// array through atomics. The `Cell`s never alias across threads in
// practice, matching the single-writer/single-reader contract the type
// enforces at the API boundary (`bind_writer`/`bind_reader`).
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create a new ring with `area_size` bytes of backing storage
    /// (rounded down to a whole number of 8-byte blocks).
    pub fn new(area_size: usize) -> Self {
        let num_blocks = (area_size / EIGHT).max(1);
        let blocks = (0..num_blocks).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice();
        Self {
            blocks,
            num_blocks,
            writer: Cell::new(None),
            reader: Cell::new(None),
            w: WriterSide {
                wptr: Cell::new(0),
                frontier: Cell::new(0),
                occupied: Cell::new(0),
            },
            r: ReaderSide {
                rptr: Cell::new(0),
                frontier: Cell::new(0),
                available: Cell::new(0),
            },
        }
    }

    /// Bind the calling thread as this ring's exclusive writer. Must be
    /// called once, before the first `put`, by the thread that will call
    /// `put` for the lifetime of the ring.
    pub fn bind_writer(&self) {
        self.writer.set(Some(thread::current().id()));
    }

    /// Bind the calling thread as this ring's exclusive reader. Must be
    /// called once, before the first `get`/`check_new`.
    pub fn bind_reader(&self) {
        self.reader.set(Some(thread::current().id()));
    }

    fn check_writer(&self) -> Result<(), RingError> {
        match self.writer.get() {
            None => {
                self.bind_writer();
                Ok(())
            }
            Some(id) if id == thread::current().id() => Ok(()),
            Some(_) => Err(RingError::WrongThread),
        }
    }

    fn check_reader(&self) -> Result<(), RingError> {
        match self.reader.get() {
            None => {
                self.bind_reader();
                Ok(())
            }
            Some(id) if id == thread::current().id() => Ok(()),
            Some(_) => Err(RingError::WrongThread),
        }
    }

    fn load_block(&self, idx: usize) -> u64 {
        self.blocks[idx].load(Ordering::SeqCst)
    }

    fn presence_all_clear(&self, idx: usize) -> bool {
        self.load_block(idx).to_le_bytes().iter().all(|b| b & 1 == 0)
    }

    fn presence_all_set(&self, idx: usize) -> bool {
        self.load_block(idx).to_le_bytes().iter().all(|b| b & 1 == 1)
    }

    /// Rescan forward from the writer's cached frontier, releasing blocks
    /// the reader has since cleared.
    fn writer_rescan(&self) {
        while self.w.occupied.get() > 0 && self.presence_all_clear(self.w.frontier.get()) {
            self.w.frontier.set((self.w.frontier.get() + 1) % self.num_blocks);
            self.w.occupied.set(self.w.occupied.get() - 1);
        }
    }

    /// Best-effort enqueue of one message. Returns `WouldBlock` if there
    /// are not enough free blocks right now; the caller retries later.
    pub fn put(&self, kind: MessageKind, payload: &[u8]) -> Result<(), RingError> {
        self.check_writer()?;

        let total = HEADER_SIZE + payload.len();
        let needed = blocks_needed(total);
        if needed > self.num_blocks {
            return Err(RingError::TooLarge);
        }

        self.writer_rescan();
        let free = self.num_blocks - self.w.occupied.get();
        if needed > free {
            return Err(RingError::WouldBlock);
        }

        // Build the flat header+payload stream and split into 7-byte chunks.
        let mut stream = Vec::with_capacity(total);
        stream.push(kind as u8);
        stream.extend_from_slice(&(total as u32).to_le_bytes());
        stream.extend_from_slice(payload);

        std::sync::atomic::fence(Ordering::SeqCst);

        let start = self.w.wptr.get();
        for (i, chunk) in stream.chunks(SEVEN).enumerate() {
            let idx = (start + i) % self.num_blocks;
            let encoded = encode_block(chunk);
            self.blocks[idx].store(encoded, Ordering::SeqCst);
        }

        self.w.wptr.set((start + needed) % self.num_blocks);
        self.w.occupied.set(self.w.occupied.get() + needed);

        std::sync::atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    /// Rescan forward from the reader's cached frontier, discovering
    /// blocks the writer has since filled.
    fn reader_rescan(&self) {
        while self.r.available.get() < self.num_blocks && self.presence_all_set(self.r.frontier.get()) {
            self.r.frontier.set((self.r.frontier.get() + 1) % self.num_blocks);
            self.r.available.set(self.r.available.get() + 1);
        }
    }

    /// Read the next message into `out`, a caller-owned scratch `Message`.
    /// Returns `Empty` if no complete message is ready yet, `TooLarge` if
    /// the message exceeds `out.payload`'s capacity (left untouched, no
    /// state change), otherwise clears the consumed blocks and returns Ok.
    pub fn get(&self, max_payload: usize) -> Result<Message, RingError> {
        self.check_reader()?;
        self.reader_rescan();

        if self.r.available.get() < 1 {
            return Err(RingError::Empty);
        }

        std::sync::atomic::fence(Ordering::SeqCst);

        let header_idx = self.r.rptr.get();
        let header_block = match decode_block(self.load_block(header_idx), SEVEN) {
            Some(b) => b,
            None => return Err(RingError::Empty),
        };
        let kind_byte = header_block[0];
        let total_size = u32::from_le_bytes([header_block[1], header_block[2], header_block[3], header_block[4]]) as usize;

        let needed = blocks_needed(total_size);
        if self.r.available.get() < needed {
            return Err(RingError::Empty);
        }

        let payload_len = total_size - HEADER_SIZE;
        if payload_len > max_payload {
            return Err(RingError::TooLarge);
        }

        let kind = MessageKind::from_u8(kind_byte).unwrap_or(MessageKind::None);
        let mut payload = Vec::with_capacity(payload_len);

        for i in 0..needed {
            let idx = (header_idx + i) % self.num_blocks;
            let remaining_in_stream = total_size - i * SEVEN;
            let this_chunk_len = remaining_in_stream.min(SEVEN);
            let decoded = decode_block(self.load_block(idx), this_chunk_len)
                .ok_or(RingError::Empty)?;
            let start_in_stream = i * SEVEN;
            for j in 0..this_chunk_len {
                let stream_pos = start_in_stream + j;
                if stream_pos >= HEADER_SIZE {
                    payload.push(decoded[j]);
                }
            }
            // Mark block fully read (all presence bits cleared).
            self.blocks[idx].store(0, Ordering::SeqCst);
        }

        self.r.rptr.set((header_idx + needed) % self.num_blocks);
        self.r.available.set(self.r.available.get() - needed);

        std::sync::atomic::fence(Ordering::SeqCst);
        Ok(Message::new(kind, payload))
    }

    /// Allocation-free, syscall-free probe of the block at the reader's
    /// current position. Safe to call from the isolated hot loop on
    /// every iteration; only when it returns `true` should the caller
    /// pay for the full `get()` path.
    #[inline]
    pub fn check_new(&self) -> bool {
        let idx = self.r.rptr.get();
        self.blocks[idx].load(Ordering::SeqCst) & 1 == 1
    }

    /// Number of 8-byte blocks backing this ring.
    pub fn capacity_blocks(&self) -> usize {
        self.num_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::AREA_SIZE;

    #[test]
    fn test_block_roundtrip_full() {
        let src = [1u8, 2, 3, 4, 5, 6, 7];
        let enc = encode_block(&src);
        let dec = decode_block(enc, 7).unwrap();
        assert_eq!(dec, src);
    }

    #[test]
    fn test_block_presence_bits() {
        let enc = encode_block(&[0, 0, 0, 0, 0, 0, 0]);
        for b in enc.to_le_bytes() {
            assert_eq!(b & 1, 1);
        }
        assert!(decode_block(0, 7).is_none()); // all-zero block = not present
    }

    #[test]
    fn test_put_get_roundtrip_small() {
        let ring = Ring::new(AREA_SIZE);
        ring.put(MessageKind::Ping, b"hi").unwrap();
        let msg = ring.get(64).unwrap();
        assert_eq!(msg.kind, MessageKind::Ping);
        assert_eq!(msg.payload, b"hi");
    }

    #[test]
    fn test_put_get_empty_payload() {
        let ring = Ring::new(AREA_SIZE);
        ring.put(MessageKind::Terminate, &[]).unwrap();
        let msg = ring.get(64).unwrap();
        assert_eq!(msg.kind, MessageKind::Terminate);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_boundary_payload_sizes() {
        let ring = Ring::new(AREA_SIZE);
        for &len in &[0usize, 1, 2, 7, 8, 14] {
            let payload: Vec<u8> = (0..len as u8).collect();
            ring.put(MessageKind::Print, &payload).unwrap();
            let msg = ring.get(AREA_SIZE).unwrap();
            assert_eq!(msg.payload, payload, "len={}", len);
        }
    }

    #[test]
    fn test_max_payload_roundtrip() {
        let ring = Ring::new(AREA_SIZE);
        let max = crate::constants::MAX_MSG;
        let payload: Vec<u8> = (0..max).map(|i| (i % 251) as u8).collect();
        ring.put(MessageKind::Print, &payload).unwrap();
        let msg = ring.get(max).unwrap();
        assert_eq!(msg.payload, payload);
    }

    #[test]
    fn test_get_empty_returns_empty() {
        let ring = Ring::new(AREA_SIZE);
        assert_eq!(ring.get(64), Err(RingError::Empty));
    }

    #[test]
    fn test_put_full_returns_would_block() {
        let ring = Ring::new(64); // 8 blocks
        let payload = vec![0u8; 6]; // 1 block each put (5+6=11 -> 2 blocks actually)
        // Fill until WouldBlock.
        let mut puts_ok = 0;
        loop {
            match ring.put(MessageKind::Print, &payload) {
                Ok(()) => puts_ok += 1,
                Err(RingError::WouldBlock) => break,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
            if puts_ok > 100 {
                panic!("ring never reported WouldBlock");
            }
        }
        assert!(puts_ok > 0);
    }

    #[test]
    fn test_too_large_output_buffer() {
        let ring = Ring::new(AREA_SIZE);
        ring.put(MessageKind::Print, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert_eq!(ring.get(4), Err(RingError::TooLarge));
        // State unchanged: a retry with a big enough buffer still succeeds.
        let msg = ring.get(64).unwrap();
        assert_eq!(msg.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_check_new() {
        let ring = Ring::new(AREA_SIZE);
        assert!(!ring.check_new());
        ring.put(MessageKind::Ping, &[]).unwrap();
        assert!(ring.check_new());
        let _ = ring.get(8).unwrap();
        assert!(!ring.check_new());
    }

    #[test]
    fn test_wraparound() {
        let ring = Ring::new(64); // 8 blocks total
        for i in 0..40u8 {
            ring.put(MessageKind::Print, &[i]).unwrap();
            let msg = ring.get(8).unwrap();
            assert_eq!(msg.payload, vec![i]);
        }
    }

    #[test]
    fn test_many_messages_interleaved() {
        let ring = Ring::new(AREA_SIZE);
        for i in 0..50u8 {
            ring.put(MessageKind::Print, &[i, i.wrapping_add(1)]).unwrap();
        }
        for i in 0..50u8 {
            let msg = ring.get(8).unwrap();
            assert_eq!(msg.payload, vec![i, i.wrapping_add(1)]);
        }
        assert_eq!(ring.get(8), Err(RingError::Empty));
    }
}
