//! Opt-in per-opcode profiler.
//!
//! Tracks, per function, cumulative self time and hit count per code
//! offset plus time spent in calls made from each offset, along with a
//! shadow call stack carrying per-call self/callee accumulators. The
//! report annotates the disassembly with time shares.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::unit::{CompiledUnit, LocEntry};

fn unow() -> i64 {
    oxmat_time::monotonic_ns()
}

#[derive(Debug, Clone, Serialize)]
pub struct FnStats {
    pub fn_name: String,
    pub fn_file: String,
    pub n_calls: u64,
    /// Cumulative self time per code offset.
    pub cum_t: Vec<i64>,
    /// Hit count per code offset.
    pub n_cum: Vec<i64>,
    /// Cumulative time spent in calls issued from each code offset.
    pub cum_call_t: Vec<i64>,
    #[serde(skip)]
    pub callers: BTreeSet<String>,
    // Live bookkeeping, one entry per active invocation.
    #[serde(skip)]
    v_callers: Vec<String>,
    #[serde(skip)]
    v_t: Vec<i64>,
    #[serde(skip)]
    v_ip: Vec<usize>,
    // Copied once so the report can disassemble after the unit is gone.
    #[serde(skip)]
    pub code: Vec<u8>,
    #[serde(skip)]
    pub names: Vec<String>,
    #[serde(skip)]
    pub locs: Vec<LocEntry>,
}

impl FnStats {
    fn new(fn_name: String) -> Self {
        FnStats {
            fn_name,
            fn_file: String::new(),
            n_calls: 0,
            cum_t: Vec::new(),
            n_cum: Vec::new(),
            cum_call_t: Vec::new(),
            callers: BTreeSet::new(),
            v_callers: Vec::new(),
            v_t: Vec::new(),
            v_ip: Vec::new(),
            code: Vec::new(),
            names: Vec::new(),
            locs: Vec::new(),
        }
    }

    fn maybe_resize(&mut self, ip: usize) {
        if ip >= self.cum_t.len() {
            self.cum_t.resize(ip + 1, 0);
            self.n_cum.resize(ip + 1, 0);
            self.cum_call_t.resize(ip + 1, 0);
        }
    }

    fn add_t(&mut self, dt: i64) {
        if let Some(&ip) = self.v_ip.last() {
            self.maybe_resize(ip);
            self.cum_t[ip] += dt;
            self.n_cum[ip] += 1;
        }
    }

    /// Total attributed time: self plus callee time, the quantity the
    /// report orders by.
    pub fn total_time(&self) -> i64 {
        self.cum_t.iter().sum::<i64>() + self.cum_call_t.iter().sum::<i64>()
    }

    pub fn self_time(&self) -> i64 {
        self.cum_t.iter().sum()
    }
}

#[derive(Debug, Clone)]
struct CallRec {
    callee: String,
    caller: String,
    entry_time: i64,
    t_self_cum: i64,
    t_call_cum: i64,
}

#[derive(Debug, Default)]
pub struct VmProfiler {
    stats: IndexMap<String, FnStats>,
    first_call_order: Vec<String>,
    shadow: Vec<CallRec>,
}

impl VmProfiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shadow_depth(&self) -> usize {
        self.shadow.len()
    }

    pub fn stats(&self) -> impl Iterator<Item = &FnStats> {
        self.stats.values()
    }

    pub fn stats_for(&self, fn_name: &str) -> Option<&FnStats> {
        self.stats.get(fn_name)
    }

    /// Function entry. `caller` is the empty string at the root.
    pub fn enter_fn(&mut self, fn_name: &str, caller: &str, unit: &CompiledUnit) {
        if !self.stats.contains_key(fn_name) {
            self.first_call_order.push(fn_name.to_string());
        }
        let stat = self
            .stats
            .entry(fn_name.to_string())
            .or_insert_with(|| FnStats::new(fn_name.to_string()));
        stat.callers.insert(caller.to_string());
        stat.v_callers.push(caller.to_string());
        stat.n_calls += 1;

        let now = unow();
        self.shadow.push(CallRec {
            callee: fn_name.to_string(),
            caller: caller.to_string(),
            entry_time: now,
            t_self_cum: 0,
            t_call_cum: 0,
        });
        stat.v_t.push(now);
        stat.v_ip.push(0);

        if stat.code.is_empty() {
            stat.fn_file = unit.unwind.file.clone();
            stat.code = unit.code_bytes();
            stat.names = unit.names.clone();
            stat.locs = unit.unwind.locs.clone();
        }
    }

    /// Per-dispatch accounting: bill elapsed time to the previous offset,
    /// then move the live offset forward.
    pub fn tick(&mut self, fn_name: &str, new_ip: usize) {
        let now = unow();
        let Some(stat) = self.stats.get_mut(fn_name) else {
            return;
        };
        if let Some(t) = stat.v_t.last().copied() {
            let dt = now - t;
            stat.add_t(dt);
            if let Some(rec) = self.shadow.last_mut() {
                rec.t_self_cum += dt;
            }
        }
        if let Some(ip) = stat.v_ip.last_mut() {
            *ip = new_ip;
        }
        if let Some(t) = stat.v_t.last_mut() {
            *t = now;
        }
    }

    /// Function exit, on return or unwind. Balanced with `enter_fn` by
    /// construction: the VM drives both from frame setup/teardown.
    pub fn exit_fn(&mut self, fn_name: &str) {
        let t_exit = unow();

        let Some(stat) = self.stats.get_mut(fn_name) else {
            return;
        };
        // Bill the tail (the return sequence) to the callee.
        if let Some(&t0) = stat.v_t.last() {
            let dt = t_exit - t0;
            stat.add_t(dt);
            if let Some(rec) = self.shadow.last_mut() {
                rec.t_self_cum += dt;
            }
        }

        let is_recursive = self.shadow.iter().any(|c| c.caller == fn_name);
        let Some(call) = self.shadow.pop() else {
            return;
        };
        debug_assert_eq!(call.callee, fn_name, "profiler shadow stack out of sync");

        let stat = self.stats.get_mut(fn_name).unwrap();
        stat.v_callers.pop();
        stat.v_t.pop();
        stat.v_ip.pop();

        if call.caller.is_empty() {
            return;
        }
        let callee_dt = call.t_self_cum + call.t_call_cum;
        let Some(caller_stat) = self.stats.get_mut(&call.caller) else {
            return;
        };
        if let Some(&caller_ip) = caller_stat.v_ip.last() {
            caller_stat.maybe_resize(caller_ip);
            // Recursive calls are not double-billed to the caller.
            if !is_recursive {
                caller_stat.cum_call_t[caller_ip] += callee_dt;
                if let Some(rec) = self.shadow.last_mut() {
                    rec.t_call_cum += callee_dt;
                }
            }
            // The caller's clock restarts now; time spent in the callee
            // must not be billed to the caller's current offset.
            if let Some(t) = caller_stat.v_t.last_mut() {
                *t = unow();
            }
        }
    }

    /// Flat text report, functions in first-call order, each annotated
    /// with per-offset time shares over the disassembly.
    pub fn report(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let grand_total: i64 = self.stats.values().map(FnStats::self_time).sum();
        writeln!(out, "profiled functions: {}", self.first_call_order.len()).unwrap();
        for name in &self.first_call_order {
            let Some(stat) = self.stats.get(name) else {
                continue;
            };
            writeln!(out).unwrap();
            writeln!(
                out,
                "{}  calls: {}  self: {}ns  cumulative: {}ns",
                stat.fn_name,
                stat.n_calls,
                stat.self_time(),
                stat.total_time()
            )
            .unwrap();
            if !stat.callers.is_empty() {
                let callers: Vec<&str> = stat
                    .callers
                    .iter()
                    .map(|c| if c.is_empty() { "<root>" } else { c.as_str() })
                    .collect();
                writeln!(out, "  callers: {}", callers.join(", ")).unwrap();
            }
            let unit_total = stat.self_time().max(1);
            if let Ok(unit) = CompiledUnit::new(
                stat.code.clone(),
                vec![
                    oxmat_builtins::Value::Str(stat.fn_name.clone()),
                    oxmat_builtins::Value::Str("function".into()),
                    oxmat_builtins::Value::Str(stat.fn_name.clone()),
                ],
                stat.names.clone(),
                crate::unit::UnwindData::default(),
            ) {
                if let Ok(rows) = crate::disasm::disassemble(&unit) {
                    for (offset, text) in rows {
                        let t = stat.cum_t.get(offset).copied().unwrap_or(0);
                        let ct = stat.cum_call_t.get(offset).copied().unwrap_or(0);
                        let share = 100.0 * t as f64 / unit_total as f64;
                        if t != 0 || ct != 0 {
                            writeln!(
                                out,
                                "  {offset:6}: {share:5.1}% {t:10}ns {ct:10}ns  {text}"
                            )
                            .unwrap();
                        } else {
                            writeln!(out, "  {offset:6}:                 {text}").unwrap();
                        }
                    }
                }
            }
        }
        if grand_total > 0 {
            writeln!(out).unwrap();
            writeln!(out, "total self time: {grand_total}ns").unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::UnitBuilder;
    use crate::opcodes::Op;

    fn tiny_unit(name: &str) -> CompiledUnit {
        let mut b = UnitBuilder::new(name);
        b.declare_slot("%nargout");
        b.set_frame(1, 0);
        b.emit(Op::PushNil, &[]).unwrap();
        b.emit(Op::Pop, &[]).unwrap();
        b.emit(Op::Ret, &[]).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn enter_exit_balances_shadow_stack() {
        let u = tiny_unit("f");
        let mut p = VmProfiler::new();
        p.enter_fn("f", "", &u);
        p.tick("f", 4);
        p.tick("f", 5);
        p.exit_fn("f");
        assert_eq!(p.shadow_depth(), 0);
        let s = p.stats_for("f").unwrap();
        assert_eq!(s.n_calls, 1);
        assert!(s.self_time() >= 0);
    }

    #[test]
    fn callee_time_bills_to_caller_offset() {
        let uf = tiny_unit("f");
        let ug = tiny_unit("g");
        let mut p = VmProfiler::new();
        p.enter_fn("f", "", &uf);
        p.tick("f", 4);
        p.enter_fn("g", "f", &ug);
        p.tick("g", 4);
        p.exit_fn("g");
        p.exit_fn("f");
        let f = p.stats_for("f").unwrap();
        assert!(f.cum_call_t.iter().sum::<i64>() >= 0);
        assert!(f.callers.contains(""));
        let g = p.stats_for("g").unwrap();
        assert!(g.callers.contains("f"));
        // Accounting law: totals decompose into per-offset buckets.
        assert_eq!(
            f.total_time(),
            f.cum_t.iter().sum::<i64>() + f.cum_call_t.iter().sum::<i64>()
        );
    }

    #[test]
    fn report_mentions_function() {
        let u = tiny_unit("f");
        let mut p = VmProfiler::new();
        p.enter_fn("f", "", &u);
        p.tick("f", 4);
        p.exit_fn("f");
        let r = p.report();
        assert!(r.contains("f  calls: 1"));
    }
}
