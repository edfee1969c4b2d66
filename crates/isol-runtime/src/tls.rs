//! Thread-local slot for the current worker's isolation context.
//!
//! The `SIGUSR1` handler (spec.md §9 Design Notes) must identify "the
//! current worker" with a thread-local lookup and no locks, then perform
//! at most one SeqCst store. It reaches the owning `Worker`'s `isolated`
//! flag through this slot rather than any ambient global: the slot is
//! set by the worker thread itself before entering isolation and cleared
//! on the way out.

use std::cell::Cell;
use std::sync::atomic::AtomicU8;

thread_local! {
    static ISOLATED_FLAG_PTR: Cell<*const AtomicU8> = const { Cell::new(std::ptr::null()) };
}

/// Record the calling thread's owning `Worker::isolated` flag. `flag`
/// must outlive the time this slot stays set; `Worker` records are never
/// freed before process exit (spec.md §3), so a `'static`-lifetime
/// reference from the worker table satisfies this trivially.
pub fn set_current_isolation_flag(flag: &'static AtomicU8) {
    ISOLATED_FLAG_PTR.with(|c| c.set(flag as *const AtomicU8));
}

pub fn clear_current_isolation_flag() {
    ISOLATED_FLAG_PTR.with(|c| c.set(std::ptr::null()));
}

/// Called only from the `SIGUSR1` handler. Async-signal-safe: a
/// thread-local read plus (if set) one atomic store, no allocation.
#[inline]
pub(crate) fn signal_mark_isolation_lost() {
    ISOLATED_FLAG_PTR.with(|c| {
        let ptr = c.get();
        if !ptr.is_null() {
            // Safety: non-null only while the owning worker has the flag
            // bound for the static lifetime of its Worker record.
            unsafe {
                (*ptr).store(super::ISOLATION_FLAG_ABSENT, std::sync::atomic::Ordering::SeqCst);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_set_clear_roundtrip() {
        static FLAG: AtomicU8 = AtomicU8::new(2);
        set_current_isolation_flag(&FLAG);
        signal_mark_isolation_lost();
        assert_eq!(FLAG.load(Ordering::SeqCst), super::super::ISOLATION_FLAG_ABSENT);
        clear_current_isolation_flag();
    }
}
