//! Enumerates every schedulable entity on the machine and rebinds any
//! whose affinity overlaps the isolation set away from it (spec.md §4.5).

use std::collections::HashMap;

use isol_core::cpuset::CpuSet;
use isol_core::traits::ThreadRawRecord;

/// `/proc/[pid]/stat` field 39 (1-indexed) is `processor`, the cpu the
/// thread last ran on - spec.md §9's Open Question names this exact
/// field and asks that it not be inherited as a bare magic index.
mod stat_fields {
    /// 0-indexed position of `comm`'s closing paren onward; fields after
    /// it are whitespace-separated and 1-indexed starting at `state`=3.
    pub const STATE: usize = 3;
    pub const PROCESSOR: usize = 39;
}

/// One decoded `/proc/[pid]/task/[tid]/stat` + `status` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignThread {
    pub pid: u32,
    pub tid: u32,
    pub name: Option<String>,
    pub cpus_allowed: CpuSet,
    pub current_cpu: Option<u32>,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
}

/// Decode the positional `stat` fields this sweeper cares about. Returns
/// `None` on any parse failure - the caller drops malformed records
/// rather than propagating an error (spec.md §7: logged-and-ignored).
fn parse_stat_line(line: &str) -> Option<(Option<String>, Option<u32>)> {
    let open = line.find('(')?;
    let close = line.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = line[open + 1..close].to_string();
    let rest = line[close + 1..].trim_start();
    // Fields after comm start at position 3 (`state`); rest is fields
    // 3.. space separated.
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let processor_idx_in_rest = stat_fields::PROCESSOR - stat_fields::STATE;
    let current_cpu = fields.get(processor_idx_in_rest).and_then(|s| s.parse().ok());
    Some((Some(name), current_cpu))
}

fn parse_status_text(text: &str) -> (CpuSet, u64, u64) {
    let mut cpus_allowed = CpuSet::new();
    let mut voluntary = 0u64;
    let mut nonvoluntary = 0u64;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Cpus_allowed:") {
            cpus_allowed = CpuSet::parse_hex_mask(rest.trim());
        } else if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
            voluntary = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            nonvoluntary = rest.trim().parse().unwrap_or(0);
        }
    }
    (cpus_allowed, voluntary, nonvoluntary)
}

/// Parse one `ThreadRawRecord` into a `ForeignThread`. Pure function,
/// independently testable against fixture text (spec.md §9).
pub fn parse_thread_record(record: &ThreadRawRecord) -> Option<ForeignThread> {
    let (name, current_cpu) = parse_stat_line(&record.stat_line)?;
    let (cpus_allowed, voluntary_ctxt_switches, nonvoluntary_ctxt_switches) = parse_status_text(&record.status_text);
    Some(ForeignThread {
        pid: record.pid,
        tid: record.tid,
        name,
        cpus_allowed,
        current_cpu,
        voluntary_ctxt_switches,
        nonvoluntary_ctxt_switches,
    })
}

/// A rebind this sweeper pass wants to perform: bring `(pid, tid)`'s
/// affinity down to `new_mask`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebindAction {
    pub pid: u32,
    pub tid: u32,
    pub new_mask: CpuSet,
}

/// Append-grow table keyed by `(pid, tid)`; entries untouched in a pass
/// are removed (spec.md §3's ForeignThread record).
#[derive(Default)]
pub struct ThreadSweeper {
    table: HashMap<(u32, u32), ForeignThread>,
}

impl ThreadSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &HashMap<(u32, u32), ForeignThread> {
        &self.table
    }

    /// One sweep pass. `records` is the machine's current thread list;
    /// `managed_tids` are `(pid, tid)` pairs the manager already owns
    /// (Worker threads, and the manager's own main thread), which are
    /// never rebound even if their affinity overlaps `isolation_set`.
    /// `isolation_set` / `non_isolation_complement` are the current
    /// iso/non-iso cpu partitions.
    ///
    /// Returns the rebinds to perform; the caller applies them via
    /// `Platform::set_affinity` scoped to each target thread and updates
    /// `self.table` bookkeeping only after a successful rebind (a failed
    /// rebind is logged and retried next pass per spec.md §7 item 5).
    pub fn sweep(
        &mut self,
        records: &[ThreadRawRecord],
        managed_tids: &std::collections::HashSet<(u32, u32)>,
        isolation_set: &CpuSet,
        non_isolation_complement: &CpuSet,
    ) -> Vec<RebindAction> {
        let mut seen = std::collections::HashSet::new();
        let mut actions = Vec::new();

        for record in records {
            let key = (record.pid, record.tid);
            let Some(thread) = parse_thread_record(record) else { continue };
            seen.insert(key);

            if managed_tids.contains(&key) {
                self.table.insert(key, thread);
                continue;
            }

            if thread.cpus_allowed.len() > 1 && !thread.cpus_allowed.is_disjoint(isolation_set) {
                let mut new_mask = thread.cpus_allowed.difference(isolation_set);
                if new_mask.is_empty() {
                    new_mask = non_isolation_complement.clone();
                }
                actions.push(RebindAction { pid: thread.pid, tid: thread.tid, new_mask });
            }

            self.table.insert(key, thread);
        }

        self.table.retain(|k, _| seen.contains(k));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pid: u32, tid: u32, name: &str, processor: u32, cpus_allowed_hex: &str, vol: u64, nonvol: u64) -> ThreadRawRecord {
        // Build a minimal /proc/[pid]/stat line with `processor` at field 39.
        let mut fields: Vec<String> = vec!["0".to_string(); 52 - 3 + 1];
        fields[stat_fields::PROCESSOR - stat_fields::STATE] = processor.to_string();
        let stat_line = format!("{} ({}) {}", pid, name, fields.join(" "));
        let status_text = format!(
            "Cpus_allowed:\t{}\nvoluntary_ctxt_switches:\t{}\nnonvoluntary_ctxt_switches:\t{}\n",
            cpus_allowed_hex, vol, nonvol
        );
        ThreadRawRecord { pid, tid, stat_line, status_text }
    }

    #[test]
    fn test_parse_stat_line_basic() {
        let r = rec(100, 100, "myworker", 3, "08", 5, 2);
        let t = parse_thread_record(&r).unwrap();
        assert_eq!(t.name.as_deref(), Some("myworker"));
        assert_eq!(t.current_cpu, Some(3));
        assert_eq!(t.voluntary_ctxt_switches, 5);
        assert_eq!(t.nonvoluntary_ctxt_switches, 2);
        assert!(t.cpus_allowed.contains(3));
    }

    #[test]
    fn test_parse_stat_line_name_with_parens() {
        // comm itself can contain parens e.g. "(sd-pam)"; rfind(')') must
        // grab the LAST paren, not the first.
        let line = "5 ((weird)name) S 0 0 0 0 0".to_string();
        let (name, _) = parse_stat_line(&line).unwrap();
        assert_eq!(name.as_deref(), Some("(weird)name"));
    }

    #[test]
    fn test_sweep_rebinds_intruder() {
        let mut sweeper = ThreadSweeper::new();
        let iso = CpuSet::parse_list("1,2").unwrap();
        let non_iso = CpuSet::parse_list("0,3").unwrap();
        let managed = std::collections::HashSet::new();

        // affinity 0x0f = cpus 0,1,2,3: overlaps iso, cardinality > 1.
        let records = vec![rec(200, 200, "intruder", 1, "0f", 0, 0)];
        let actions = sweeper.sweep(&records, &managed, &iso, &non_iso);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].new_mask, CpuSet::parse_list("0,3").unwrap());
    }

    #[test]
    fn test_sweep_skips_single_cpu_pin() {
        let mut sweeper = ThreadSweeper::new();
        let iso = CpuSet::parse_list("1,2").unwrap();
        let non_iso = CpuSet::parse_list("0,3").unwrap();
        let managed = std::collections::HashSet::new();

        // affinity 0x02 = cpu 1 only: cardinality 1, never touched.
        let records = vec![rec(201, 201, "pinned", 1, "02", 0, 0)];
        let actions = sweeper.sweep(&records, &managed, &iso, &non_iso);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_sweep_skips_managed_thread() {
        let mut sweeper = ThreadSweeper::new();
        let iso = CpuSet::parse_list("1,2").unwrap();
        let non_iso = CpuSet::parse_list("0,3").unwrap();
        let mut managed = std::collections::HashSet::new();
        managed.insert((300u32, 300u32));

        let records = vec![rec(300, 300, "worker", 1, "0f", 0, 0)];
        let actions = sweeper.sweep(&records, &managed, &iso, &non_iso);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_sweep_widens_to_complement_when_fully_overlapping() {
        let mut sweeper = ThreadSweeper::new();
        let iso = CpuSet::parse_list("1,2").unwrap();
        let non_iso = CpuSet::parse_list("0,3").unwrap();
        let managed = std::collections::HashSet::new();

        // affinity 0x06 = cpus 1,2: entirely inside iso set.
        let records = vec![rec(400, 400, "intruder2", 1, "06", 0, 0)];
        let actions = sweeper.sweep(&records, &managed, &iso, &non_iso);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].new_mask, non_iso);
    }

    #[test]
    fn test_sweep_removes_stale_table_entries() {
        let mut sweeper = ThreadSweeper::new();
        let iso = CpuSet::parse_list("1,2").unwrap();
        let non_iso = CpuSet::parse_list("0,3").unwrap();
        let managed = std::collections::HashSet::new();

        let r1 = rec(500, 500, "one", 1, "02", 0, 0);
        sweeper.sweep(&[r1.clone()], &managed, &iso, &non_iso);
        assert!(sweeper.table().contains_key(&(500, 500)));

        sweeper.sweep(&[], &managed, &iso, &non_iso);
        assert!(!sweeper.table().contains_key(&(500, 500)));
    }
}
