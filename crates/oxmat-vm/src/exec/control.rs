//! Control flow: conditional jumps, switch matching, and the two `for`
//! loop families.

use oxmat_builtins::ops::{self, values_equal};
use oxmat_builtins::{Tag, Value};

use crate::error::{exec_err, OpResult, UnwindReason};
use crate::opcodes::Op;
use crate::vm::VmCore;

impl<'i> VmCore<'i> {
    /// `JMP_IF` / `JMP_IFN`: pop the condition, test truthiness, jump.
    /// Signals are polled at every conditional jump. A boolean on top
    /// specializes the opcode to the `_BOOL` form.
    pub(crate) fn op_jmp_cond(&mut self, jump_if_true: bool) -> OpResult {
        self.interp.check_signals()?;
        if self.stack.top_value().tag() == Tag::Bool {
            self.rewrite_opcode(if jump_if_true { Op::JmpIfBool } else { Op::JmpIfnBool });
            return self.op_jmp_cond_bool(jump_if_true);
        }
        let target = self.fetch_u16() as usize;
        let cond = self.stack.pop_value();
        let t = cond.is_true().map_err(|_| match cond {
            Value::Undef => UnwindReason::IfUndefined,
            _ => exec_err(format!(
                "value of class {} cannot be used as a condition",
                cond.class_name()
            )),
        })?;
        if t == jump_if_true {
            self.ip = target;
        }
        Ok(())
    }

    /// Boolean-typed jump specialization: reads the bit directly and
    /// de-specializes when the operand is no longer a bool.
    pub(crate) fn op_jmp_cond_bool(&mut self, jump_if_true: bool) -> OpResult {
        self.interp.check_signals()?;
        if self.stack.top_value().tag() != Tag::Bool {
            self.rewrite_opcode(if jump_if_true { Op::JmpIf } else { Op::JmpIfn });
            let target = self.fetch_u16() as usize;
            let cond = self.stack.pop_value();
            let t = cond.is_true().map_err(|_| match cond {
                Value::Undef => UnwindReason::IfUndefined,
                _ => exec_err("invalid condition value"),
            })?;
            if t == jump_if_true {
                self.ip = target;
            }
            return Ok(());
        }
        let target = self.fetch_u16() as usize;
        let Value::Bool(b) = self.stack.pop_value() else { unreachable!() };
        if b == jump_if_true {
            self.ip = target;
        }
        Ok(())
    }

    /// Jump when the top value is defined and not the magic colon.
    pub(crate) fn op_jmp_ifdef(&mut self) -> OpResult {
        let target = self.fetch_u16() as usize;
        let v = self.stack.pop_value();
        if v.is_defined() && !v.is_magic_colon() {
            self.ip = target;
        }
        Ok(())
    }

    /// `switch` case matching: `[switch_value, label]` on the stack. The
    /// label pops; the switch value stays for the next case. Jumps when
    /// the case does NOT match. A cell label matches if any member does.
    pub(crate) fn op_case_match(&mut self) -> OpResult {
        let target = self.fetch_u16() as usize;
        let label = self.stack.pop_value();
        let subject = self.stack.top_value();
        let matched = match &label {
            Value::Cell(c) => c.data.iter().any(|cand| values_equal(subject, cand)),
            other => values_equal(subject, other),
        };
        if !matched {
            self.ip = target;
        }
        Ok(())
    }

    // -------- numeric for loop --------

    /// `FOR_SETUP`: canonicalize the iterable, push the iteration count
    /// and a counter initialized to -1. Iteration is element-wise for
    /// scalars and ranges, column-wise for arrays/cells/strings.
    pub(crate) fn op_for_setup(&mut self) -> OpResult {
        let iterable = self.stack.top_value().clone();
        let n: usize = match &iterable {
            Value::Range(r) => {
                if r.has_infinite_bound() {
                    log::warn!(
                        "for loop limit is infinite, will stop after {} steps",
                        r.numel()
                    );
                }
                r.numel()
            }
            Value::Tensor(t) => {
                if t.rows() > 0 {
                    t.cols()
                } else {
                    0
                }
            }
            Value::Cell(c) => {
                if c.rows > 0 {
                    c.cols
                } else {
                    0
                }
            }
            Value::Str(s) => s.chars().count(),
            Value::Struct(_) => 1,
            Value::Num(_) | Value::Bool(_) | Value::Complex(_) => 1,
            Value::Undef => 0,
            other => {
                return Err(exec_err(format!(
                    "'{}' values cannot be iterated",
                    other.class_name()
                )))
            }
        };

        self.stack.push_int(n.min(i64::MAX as usize) as i64);
        self.stack.push_int(-1);

        // Empty iterations still bind the (empty) iterable to the
        // induction variable, matching the tree walker.
        if n == 0 && iterable.is_defined() {
            // Peek the slot operand of the FOR_COND that always follows.
            let mut p = self.ip;
            let slot = if self.unit.byte(p) == Op::Wide as u8 {
                p += 2;
                self.unit.u16_at(p) as usize
            } else {
                p += 1;
                self.unit.byte(p) as usize
            };
            self.slot_store(slot, iterable.make_storable());
        }
        Ok(())
    }

    /// `FOR_COND slot after`: poll signals, advance the counter, either
    /// exit the loop or write the next element into the induction slot.
    pub(crate) fn op_for_cond(&mut self) -> OpResult {
        self.interp.check_signals()?;
        let slot = self.fetch_slot();
        let after = self.fetch_u16() as usize;

        let counter = self.stack.int_from_top(0) + 1;
        self.stack.set_int_from_top(0, counter);
        let n = self.stack.int_from_top(1);

        if counter == n {
            self.ip = after;
            return Ok(());
        }

        let idx = counter as usize;
        let element = match self.stack.value_from_top(2) {
            Value::Range(r) => Value::Num(r.elem(idx)),
            Value::Tensor(t) => {
                if t.rows() == 1 {
                    Value::Num(t.data[idx])
                } else {
                    let col = t.column_at(idx).map_err(exec_err)?;
                    Value::Tensor(col)
                }
            }
            Value::Cell(c) => {
                // Iterating a cell yields its columns as sub-cells.
                let mut col = Vec::with_capacity(c.rows);
                for r in 0..c.rows {
                    col.push(c.data[r * c.cols + idx].clone());
                }
                let rows = col.len();
                Value::Cell(
                    oxmat_builtins::CellArray::new(col, rows, 1).map_err(exec_err)?,
                )
            }
            Value::Str(s) => {
                let ch = s.chars().nth(idx).unwrap_or('\0');
                Value::Str(ch.to_string())
            }
            v @ (Value::Num(_) | Value::Bool(_) | Value::Complex(_) | Value::Struct(_)) => {
                v.clone()
            }
            other => {
                return Err(exec_err(format!(
                    "'{}' values cannot be iterated",
                    other.class_name()
                )))
            }
        };
        self.slot_store(slot, element);
        Ok(())
    }

    // -------- struct for loop --------

    /// `FOR_COMPLEX_SETUP after`: the iterable must be a struct (or
    /// undefined, which skips the body). Pushes the field count and the
    /// counter; the counters are pushed even on the error path so the
    /// unwinder sees the loop's stack shape.
    pub(crate) fn op_for_complex_setup(&mut self) -> OpResult {
        let target = self.fetch_u16() as usize;
        let v = self.stack.top_value().clone();
        if v.is_undef() {
            self.stack.push_int(1);
            self.stack.push_int(2);
            self.ip = target;
            return Ok(());
        }
        let Value::Struct(st) = &v else {
            self.stack.push_int(1);
            self.stack.push_int(2);
            return Err(exec_err(
                "in statement 'for [X, Y] = VAL', VAL must be a structure",
            ));
        };
        self.stack.push_int(st.fields.len() as i64);
        self.stack.push_int(-1);
        Ok(())
    }

    /// `FOR_COMPLEX_COND after key_slot value_slot`: step to the next
    /// field, writing its name and contents into the two slots.
    pub(crate) fn op_for_complex_cond(&mut self) -> OpResult {
        self.interp.check_signals()?;
        let after = self.fetch_u16() as usize;
        let key_slot = self.fetch_wslot();
        let value_slot = self.fetch_wslot();

        let counter = self.stack.int_from_top(0) + 1;
        self.stack.set_int_from_top(0, counter);
        let n = self.stack.int_from_top(1);

        if counter == n {
            self.ip = after;
            return Ok(());
        }

        let (key, val) = {
            let Value::Struct(st) = self.stack.value_from_top(2) else {
                return Err(exec_err("struct for loop iterable changed type"));
            };
            let (k, v) = st
                .fields
                .get_index(counter as usize)
                .ok_or_else(|| exec_err("struct field index out of range"))?;
            (k.clone(), v.clone())
        };
        self.slot_store(value_slot, val);
        self.slot_store(key_slot, Value::Str(key));
        Ok(())
    }

    // -------- colon --------

    pub(crate) fn op_colon(&mut self, has_step: bool) -> OpResult {
        let r = if has_step {
            let limit = self.stack.pop_value();
            let step = self.stack.pop_value();
            let base = self.stack.pop_value();
            ops::colon_op(&base, Some(&step), &limit)
        } else {
            let limit = self.stack.pop_value();
            let base = self.stack.pop_value();
            ops::colon_op(&base, None, &limit)
        }
        .map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }
}
