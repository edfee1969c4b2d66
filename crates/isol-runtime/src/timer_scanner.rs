//! Parses a kernel timer listing (spec.md §4.4), e.g. the text format of
//! `/proc/timer_list`, into the set of cpus still carrying a live timer.
//!
//! Grammar recognized, in the order it appears in the feed:
//!
//! - `now at <N> nsecs` - the feed's reference clock.
//! - `cpu: <N>` - header that all following hrtimer/`.expires_next`
//!   entries belong to, until the next `cpu:` header.
//! - `#<n>: <addr>, <name>, S:<state>` followed by
//!   `# expires at <soft>-<hard> nsecs [...]` - one high-resolution timer.
//! - `.expires_next   : <N> nsecs` - the cpu's next-event timer.
//! - `Tick Device: mode: ...` blocks, either `Per CPU device: <N>` or
//!   `Broadcast device`, each with its own `mode:`/`next_event:` pair and,
//!   for broadcast devices, `tick_broadcast_mask:` /
//!   `tick_broadcast_oneshot_mask:` hex masks.
//!
//! Deliberately a pure function over `BufRead` (spec.md §9's Open
//! Question: don't inherit magic-indexed parsing) so tests can supply
//! fixture strings instead of a real `/proc` file.

use std::collections::HashMap;
use std::io::BufRead;

use isol_core::constants::KTIME_MAX;
use isol_core::cpuset::CpuSet;

const HRTIMER_STATE_INACTIVE: i64 = 0;
// clock_event_state values that mean "armed" (include/linux/clockchips.h);
// distinct from the Tick Device header's own periodic/oneshot mode value.
const CLOCK_EVT_STATE_PERIODIC: i64 = 2;
const CLOCK_EVT_STATE_ONESHOT: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    HrTimer,
    CpuTimer,
    BTickDev,
    CpuTickDev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerObservation {
    pub cpu: u32,
    pub kind: TimerKind,
    pub expires: u64,
}

/// Result of one `TimerScanner` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerScanResult {
    pub now: u64,
    pub cpus_with_timers: CpuSet,
    pub observations: Vec<TimerObservation>,
}

impl TimerScanResult {
    /// `max(lasttimer - now)` across the scanned observations, or
    /// `KTIME_MAX` if there are none (spec.md §4.3's
    /// `remaining_nsec_before_expiration`, informational only).
    pub fn remaining_nsec_before_expiration(&self) -> u64 {
        self.observations
            .iter()
            .map(|o| o.expires.saturating_sub(self.now))
            .max()
            .unwrap_or(KTIME_MAX)
    }
}

#[derive(Default)]
struct DeviceBlock {
    is_broadcast: bool,
    cpu: Option<u32>,
    mode: Option<i64>,
    next_event: Option<u64>,
    bcast_mask: Option<CpuSet>,
    bcast_oneshot_mask: Option<CpuSet>,
}

fn leading_u64(s: &str) -> Option<u64> {
    let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn leading_i64(s: &str) -> Option<i64> {
    leading_u64(s).map(|v| v as i64)
}

fn after(line: &str, prefix: &str) -> Option<String> {
    line.strip_prefix(prefix).map(|s| s.to_string())
}

/// Scan a full timer feed. Never fails: malformed lines are skipped, the
/// same "logged-and-ignored" policy the rest of the manager uses for
/// untrusted input (spec.md §7).
pub fn scan<R: BufRead>(reader: R) -> TimerScanResult {
    let mut now: u64 = KTIME_MAX;
    let mut current_cpu: Option<u32> = None;
    let mut cpus_with_timers = CpuSet::new();
    let mut observations = Vec::new();
    let mut pending_hr_state: Option<i64> = None;
    let mut device = DeviceBlock::default();

    let mut finalize_percpu = |device: &mut DeviceBlock, cpus_with_timers: &mut CpuSet, observations: &mut Vec<TimerObservation>| {
        if let (Some(mode), Some(next_event), Some(cpu)) = (device.mode, device.next_event, device.cpu) {
            if matches!(mode, CLOCK_EVT_STATE_PERIODIC | CLOCK_EVT_STATE_ONESHOT) && next_event != KTIME_MAX {
                cpus_with_timers.insert(cpu);
                observations.push(TimerObservation { cpu, kind: TimerKind::CpuTickDev, expires: next_event });
            }
        }
    };

    let mut finalize_broadcast = |device: &mut DeviceBlock, cpus_with_timers: &mut CpuSet, observations: &mut Vec<TimerObservation>| {
        if let (Some(mode), Some(next_event)) = (device.mode, device.next_event) {
            if matches!(mode, CLOCK_EVT_STATE_PERIODIC | CLOCK_EVT_STATE_ONESHOT) && next_event != KTIME_MAX {
                let mut union = device.bcast_mask.clone().unwrap_or_default();
                if let Some(oneshot) = &device.bcast_oneshot_mask {
                    for cpu in oneshot.iter() {
                        union.insert(cpu);
                    }
                }
                for cpu in union.iter() {
                    cpus_with_timers.insert(cpu);
                    observations.push(TimerObservation { cpu, kind: TimerKind::BTickDev, expires: next_event });
                }
            }
        }
    };

    for line in reader.lines().map_while(Result::ok) {
        let line = line.trim_start();

        if let Some(rest) = after(line, "now at ") {
            if let Some(v) = leading_u64(&rest) {
                now = v;
            }
        } else if let Some(rest) = after(line, "cpu:") {
            current_cpu = leading_u64(&rest).map(|v| v as u32);
            pending_hr_state = None;
        } else if line.starts_with('#') && !line.starts_with("# expires") {
            let parts: Vec<&str> = line.splitn(3, ',').collect();
            if parts.len() == 3 {
                let state_part = parts[2].trim();
                let state = state_part.strip_prefix("S:").and_then(leading_i64).unwrap_or(1);
                pending_hr_state = Some(state);
            }
        } else if line.starts_with("# expires at") {
            if let Some(state) = pending_hr_state.take() {
                if let Some(at) = line.find("at ") {
                    let rest = &line[at + 3..];
                    if let Some((soft_str, hard_str)) = rest.split_once('-') {
                        let softexp = leading_u64(soft_str).unwrap_or(KTIME_MAX);
                        let hardexp = leading_u64(hard_str).unwrap_or(KTIME_MAX);
                        if state != HRTIMER_STATE_INACTIVE && (softexp != KTIME_MAX || hardexp != KTIME_MAX) {
                            if let Some(cpu) = current_cpu {
                                cpus_with_timers.insert(cpu);
                                observations.push(TimerObservation { cpu, kind: TimerKind::HrTimer, expires: hardexp });
                            }
                        }
                    }
                }
            }
        } else if let Some(rest) = after(line, ".expires_next") {
            let rest = rest.trim_start_matches([':', ' ']);
            if let Some(v) = leading_u64(rest) {
                if v != KTIME_MAX {
                    if let Some(cpu) = current_cpu {
                        cpus_with_timers.insert(cpu);
                        observations.push(TimerObservation { cpu, kind: TimerKind::CpuTimer, expires: v });
                    }
                }
            }
        } else if line.starts_with("Tick Device:") {
            device = DeviceBlock::default();
        } else if line == "Broadcast device" {
            device.is_broadcast = true;
        } else if let Some(rest) = after(line, "Per CPU device:") {
            device.is_broadcast = false;
            device.cpu = leading_u64(&rest).map(|v| v as u32);
        } else if let Some(rest) = after(line, "mode:") {
            device.mode = leading_i64(&rest);
        } else if let Some(rest) = after(line, "next_event:") {
            let rest = rest.trim_end_matches("nsecs").trim();
            device.next_event = leading_u64(rest);
            if !device.is_broadcast {
                finalize_percpu(&mut device, &mut cpus_with_timers, &mut observations);
            }
        } else if let Some(rest) = after(line, "tick_broadcast_mask:") {
            device.bcast_mask = Some(CpuSet::parse_hex_mask(rest.trim()));
        } else if let Some(rest) = after(line, "tick_broadcast_oneshot_mask:") {
            device.bcast_oneshot_mask = Some(CpuSet::parse_hex_mask(rest.trim()));
            finalize_broadcast(&mut device, &mut cpus_with_timers, &mut observations);
        }
    }

    TimerScanResult { now, cpus_with_timers, observations }
}

/// Expire any observation whose `expires < now` (run at the end of each
/// scan pass per spec.md §4.4, when the caller keeps a running
/// `HashMap<u32, u64>` of per-worker last-known expiry across passes).
pub fn reset_expired(last_timer_expiry: &mut HashMap<u32, u64>, now: u64) {
    for v in last_timer_expiry.values_mut() {
        if *v < now {
            *v = KTIME_MAX;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn run(text: &str) -> TimerScanResult {
        scan(Cursor::new(text.as_bytes()))
    }

    #[test]
    fn test_empty_feed_has_no_timers_and_ktime_max_now() {
        let r = run("");
        assert!(r.cpus_with_timers.is_empty());
        assert_eq!(r.now, KTIME_MAX);
    }

    #[test]
    fn test_hrtimer_active_is_counted() {
        let text = "now at 100 nsecs\ncpu: 1\n #0: <ffff>, tick_sched_timer, S:01\n # expires at 200-300 nsecs [in 100 to 200 nsecs]\n";
        let r = run(text);
        assert_eq!(r.now, 100);
        assert!(r.cpus_with_timers.contains(1));
    }

    #[test]
    fn test_hrtimer_inactive_not_counted() {
        let text = "now at 100 nsecs\ncpu: 1\n #0: <ffff>, tick_sched_timer, S:00\n # expires at 200-300 nsecs [in 100 to 200 nsecs]\n";
        let r = run(text);
        assert!(!r.cpus_with_timers.contains(1));
    }

    #[test]
    fn test_cpu_next_event_ktime_max_not_counted() {
        let text = "cpu: 2\n .expires_next   : 9223372036854775807 nsecs\n";
        let r = run(text);
        assert!(!r.cpus_with_timers.contains(2));
    }

    #[test]
    fn test_cpu_next_event_counted() {
        let text = "cpu: 2\n .expires_next   : 123456 nsecs\n";
        let r = run(text);
        assert!(r.cpus_with_timers.contains(2));
    }

    #[test]
    fn test_per_cpu_tick_device_oneshot_counted() {
        let text = "Tick Device: mode:     1\nPer CPU device: 3\nmode:           3\nnext_event:     5000 nsecs\n";
        let r = run(text);
        assert!(r.cpus_with_timers.contains(3));
    }

    #[test]
    fn test_per_cpu_tick_device_ktime_max_not_counted() {
        let text = "Tick Device: mode:     1\nPer CPU device: 3\nmode:           3\nnext_event:     9223372036854775807 nsecs\n";
        let r = run(text);
        assert!(!r.cpus_with_timers.contains(3));
    }

    #[test]
    fn test_broadcast_device_expands_mask() {
        let text = "Tick Device: mode:     1\nBroadcast device\nmode:           3\nnext_event:     5000 nsecs\ntick_broadcast_mask: 03\ntick_broadcast_oneshot_mask: 04\n";
        let r = run(text);
        // mask 03 -> cpus 0,1 ; oneshot mask 04 -> cpu 2
        assert!(r.cpus_with_timers.contains(0));
        assert!(r.cpus_with_timers.contains(1));
        assert!(r.cpus_with_timers.contains(2));
    }

    #[test]
    fn test_broadcast_device_all_zero_masks_no_cpus() {
        let text = "Tick Device: mode:     1\nBroadcast device\nmode:           3\nnext_event:     5000 nsecs\ntick_broadcast_mask: 000000\ntick_broadcast_oneshot_mask: 000000\n";
        let r = run(text);
        assert!(r.cpus_with_timers.is_empty());
    }

    #[test]
    fn test_reset_expired() {
        let mut m = HashMap::new();
        m.insert(1u32, 50u64);
        m.insert(2u32, 150u64);
        reset_expired(&mut m, 100);
        assert_eq!(m[&1], KTIME_MAX);
        assert_eq!(m[&2], 150);
    }
}
