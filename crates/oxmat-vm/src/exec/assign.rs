//! Assignment handlers: simple, multi, compound, indexed (with the
//! scalar-matrix specializations) and chained.

use oxmat_builtins::index::{subsasgn, subsasgn_chain, subsref_chain, SubsKind, SubsLevel};
use oxmat_builtins::ops::{self, BinOp};
use oxmat_builtins::{Tag, Value};

use crate::error::{exec_err, index_err, OpResult, UnwindReason};
use crate::opcodes::Op;
use crate::vm::VmCore;

impl<'i> VmCore<'i> {
    /// Normalize an assignment rhs: cs-lists of one element collapse,
    /// empty cs-lists and (unless forced) undefined values are errors,
    /// lazy types take their storable form.
    fn prepare_rhs(&mut self, rhs: Value, force: bool) -> Result<Value, UnwindReason> {
        let rhs = match rhs {
            Value::CsList(mut l) => {
                if l.is_empty() {
                    return Err(UnwindReason::InvalidNelRhs);
                }
                l.remove(0)
            }
            other => other,
        };
        if rhs.is_undef() && !force {
            return Err(UnwindReason::RhsUndef);
        }
        Ok(rhs.make_storable())
    }

    /// `ASSIGN slot` / `FORCE_ASSIGN slot`.
    pub(crate) fn op_assign(&mut self, force: bool) -> OpResult {
        let slot = self.fetch_slot();
        let rhs = self.stack.pop_value();
        // Fast path: plain value into a plain slot.
        if !rhs.is_cs_list() && !rhs.needs_storable_call() && rhs.is_defined() && !self.slot_is_ref(slot)
        {
            let idx = self.stack.base + slot;
            self.stack.set_value_at(idx, rhs);
            return Ok(());
        }
        let rhs = self.prepare_rhs(rhs, force)?;
        self.slot_store(slot, rhs);
        Ok(())
    }

    /// `ASSIGNN`: multi-target assignment. The value run sits on the
    /// stack with the first target's value on top, and the slot operands
    /// are listed in that same popping order. cs-lists fan out across
    /// consecutive targets.
    pub(crate) fn op_assign_n(&mut self) -> OpResult {
        let n_slots = self.fetch_u8() as usize;
        let mut n_actual = 0usize;
        let mut pending: Vec<Value> = Vec::new();
        while n_actual < n_slots {
            let slot = self.fetch_wslot();
            let v = match pending.pop() {
                Some(v) => v,
                None => {
                    let popped = self.stack.pop_value();
                    match popped {
                        Value::CsList(mut l) => {
                            l.reverse();
                            match l.pop() {
                                Some(first) => {
                                    pending = l;
                                    first
                                }
                                None => {
                                    return Err(UnwindReason::InvalidNelRhs);
                                }
                            }
                        }
                        other => other,
                    }
                }
            };
            if v.is_undef() && !self.assign_target_may_be_undef(slot) {
                // Targets pop last-to-first, so the failing element is
                // numbered from the end.
                return Err(exec_err(format!(
                    "element number {} undefined in return list",
                    n_slots - n_actual
                )));
            }
            self.slot_store(slot, v.make_storable());
            n_actual += 1;
        }
        Ok(())
    }

    /// An undefined value is acceptable in a multi-assignment when the
    /// target is a black-hole slot (`%~` name) or the output position is
    /// marked ignored by this frame's caller.
    fn assign_target_may_be_undef(&self, slot: usize) -> bool {
        let name = self.unit.slot_name(slot);
        if name.starts_with("%~") {
            return true;
        }
        let n_returns = self.unit.n_returns();
        if slot >= 1 && slot < n_returns {
            if let Some(frame) = self.interp.current_frame() {
                if let Some(ignored) = &frame.ignored {
                    return ignored.contains(&slot);
                }
            }
        }
        false
    }

    /// `ASSIGN_COMPOUND slot op`: `lhs OP= rhs`.
    pub(crate) fn op_assign_compound(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let op_code = self.fetch_u8();
        let binop = BinOp::from_compound_code(op_code)
            .ok_or_else(|| exec_err(format!("bad compound-assign operator {op_code}")))?;
        let rhs = self.stack.pop_value();
        let lhs = self.slot_value(slot);
        if lhs.is_undef() {
            return Err(UnwindReason::IdUndefined(self.slot_name(slot).into()));
        }
        let result = ops::binary_op(binop, &lhs, &rhs).map_err(exec_err)?;
        self.slot_store(slot, result);
        Ok(())
    }

    /// `SUBASSIGN_ID slot nargs`: `name(args) = rhs`. The stack holds
    /// the arguments then the rhs on top. A 2-D numeric receiver with
    /// all-scalar arguments specializes to the `MAT_1D/2D` form.
    pub(crate) fn op_subassign_id(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        self.subassign_id_with(slot, nargs, true)
    }

    fn subassign_id_with(&mut self, slot: usize, nargs: usize, specialization_ok: bool) -> OpResult {
        // Specialization probe before anything pops.
        if specialization_ok
            && (nargs == 1 || nargs == 2)
            && self.stack.value_from_top(0).tag() == Tag::Num
            && (1..=nargs).all(|i| self.stack.value_from_top(i).tag() == Tag::Num)
            && self.stack.local(slot).tag() == Tag::Tensor
        {
            // In-place only within bounds; growth goes the generic way.
            if self.mat_subassign_in_bounds(slot, nargs) {
                self.rewrite_opcode(if nargs == 1 {
                    Op::SubassignIdMat1d
                } else {
                    Op::SubassignIdMat2d
                });
                return self.subassign_mat_with(slot, nargs);
            }
        }
        let rhs = self.stack.pop_value();
        let args = self.pop_args(nargs);
        let rhs = self.prepare_rhs(rhs, false)?;
        let base = self.take_slot_base(slot);
        let updated = subsasgn(base, SubsKind::Paren, &args, rhs)
            .map_err(|msg| index_err(msg, Some(&self.slot_name(slot))))?;
        self.slot_store(slot, updated);
        Ok(())
    }

    fn mat_subassign_in_bounds(&self, slot: usize, nargs: usize) -> bool {
        let Value::Tensor(t) = self.stack.local(slot) else { return false };
        if nargs == 1 {
            let Value::Num(i) = self.stack.value_from_top(1) else { return false };
            *i >= 1.0 && i.fract() == 0.0 && (*i as usize) <= t.numel()
        } else {
            let Value::Num(j) = self.stack.value_from_top(1) else { return false };
            let Value::Num(i) = self.stack.value_from_top(2) else { return false };
            *i >= 1.0
                && *j >= 1.0
                && i.fract() == 0.0
                && j.fract() == 0.0
                && (*i as usize) <= t.rows()
                && (*j as usize) <= t.cols()
        }
    }

    /// The specialized scalar-into-matrix stores. Any type or bounds
    /// mismatch rewrites back to `SUBASSIGN_ID`.
    pub(crate) fn op_subassign_mat_specialized(&mut self, ndims: usize) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        if nargs != ndims {
            self.rewrite_opcode(Op::SubassignId);
            return self.subassign_id_with(slot, nargs, false);
        }
        let type_ok = self.stack.value_from_top(0).tag() == Tag::Num
            && (1..=nargs).all(|i| self.stack.value_from_top(i).tag() == Tag::Num)
            && self.stack.local(slot).tag() == Tag::Tensor
            && self.mat_subassign_in_bounds(slot, nargs);
        if !type_ok {
            self.rewrite_opcode(Op::SubassignId);
            return self.subassign_id_with(slot, nargs, false);
        }
        self.subassign_mat_with(slot, nargs)
    }

    /// Bounds-checked in-place write; the probe has already validated
    /// types and bounds.
    fn subassign_mat_with(&mut self, slot: usize, nargs: usize) -> OpResult {
        let Value::Num(val) = self.stack.pop_value() else { unreachable!() };
        let lin = {
            let Value::Tensor(t) = self.stack.local(slot) else { unreachable!() };
            if nargs == 1 {
                let Value::Num(i) = self.stack.value_from_top(0) else { unreachable!() };
                (*i as usize) - 1
            } else {
                let Value::Num(j) = self.stack.value_from_top(0) else { unreachable!() };
                let Value::Num(i) = self.stack.value_from_top(1) else { unreachable!() };
                (*i as usize - 1) + (*j as usize - 1) * t.rows()
            }
        };
        self.stack.destroy(nargs);
        // The slot is uniquely owned here; the write is in place.
        let Value::Tensor(t) = self.stack.local_mut(slot) else { unreachable!() };
        t.data[lin] = val;
        Ok(())
    }

    /// `SUBASSIGN_CELL_ID slot nargs`: `name{args} = rhs`.
    pub(crate) fn op_subassign_cell_id(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        let rhs = self.stack.pop_value();
        let args = self.pop_args(nargs);
        let rhs = self.prepare_rhs(rhs, false)?;
        let base = self.take_slot_base(slot);
        let updated = subsasgn(base, SubsKind::Brace, &args, rhs)
            .map_err(|msg| index_err(msg, Some(&self.slot_name(slot))))?;
        self.slot_store(slot, updated);
        Ok(())
    }

    /// `SUBASSIGN_STRUCT slot field_slot`: `name.field = rhs`.
    pub(crate) fn op_subassign_struct(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let field_slot = self.fetch_wslot();
        let field = self.slot_name(field_slot);
        let rhs = self.stack.pop_value();
        let rhs = self.prepare_rhs(rhs, false)?;
        let base = self.take_slot_base(slot);
        let updated = subsasgn(base, SubsKind::Dot, &[Value::Str(field)], rhs)
            .map_err(|msg| index_err(msg, Some(&self.slot_name(slot))))?;
        self.slot_store(slot, updated);
        Ok(())
    }

    /// `SUBASSIGN_OBJ nargs kind`: indexed assignment into a transient
    /// value on the stack; pushes the updated value back for the
    /// surrounding expression.
    pub(crate) fn op_subassign_obj(&mut self) -> OpResult {
        let nargs = self.fetch_u8() as usize;
        let kind_byte = self.fetch_u8() as char;
        let kind = SubsKind::from_char(kind_byte)
            .ok_or_else(|| exec_err(format!("bad index kind '{kind_byte}'")))?;
        let rhs = self.stack.pop_value();
        let args = self.pop_args(nargs);
        let base = self.stack.pop_value();
        let rhs = self.prepare_rhs(rhs, false)?;
        let updated =
            subsasgn(base, kind, &args, rhs).map_err(|msg| index_err(msg, None))?;
        self.stack.push_value(updated);
        Ok(())
    }

    /// `SUBASSIGN_CHAINED`: chained lvalue like `a.b(2).c = rhs` or a
    /// compound variant. The stack holds `rhs`, then the lhs value, then
    /// each link's arguments with the rightmost link's on top.
    pub(crate) fn op_subassign_chained(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let op_byte = self.fetch_u8();
        let n_chained = self.fetch_u8() as usize;
        let mut shapes = Vec::with_capacity(n_chained);
        for _ in 0..n_chained {
            let nargs = self.fetch_u8() as usize;
            let kind_byte = self.fetch_u8() as char;
            let kind = SubsKind::from_char(kind_byte)
                .ok_or_else(|| exec_err(format!("bad index kind '{kind_byte}'")))?;
            shapes.push((nargs, kind));
        }

        // Rightmost link's arguments are on top.
        let mut levels: Vec<SubsLevel> = Vec::with_capacity(n_chained);
        for &(nargs, kind) in shapes.iter().rev() {
            let args = self.pop_args(nargs);
            levels.push(SubsLevel { kind, args });
        }
        levels.reverse();

        let lhs = self.stack.pop_value();
        let rhs = self.stack.pop_value();
        let rhs = self.prepare_rhs(rhs, false)?;

        let rhs = if op_byte != 0 {
            let binop = BinOp::from_compound_code(op_byte - 1)
                .ok_or_else(|| exec_err(format!("bad compound-assign operator {op_byte}")))?;
            let current = subsref_chain(&lhs, &levels).map_err(|msg| index_err(msg, None))?;
            ops::binary_op(binop, &current, &rhs).map_err(exec_err)?
        } else {
            rhs
        };

        let updated =
            subsasgn_chain(lhs, &levels, rhs).map_err(|msg| index_err(msg, None))?;
        if slot != 0 {
            self.slot_store(slot, updated);
        } else {
            self.stack.push_value(updated);
        }
        Ok(())
    }

    /// `BIND_ANS slot`: copy a non-suppressed statement's value into
    /// `ans`, leaving it on the stack for the display that follows.
    pub(crate) fn op_bind_ans(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let top = self.stack.top_value().clone();
        match top {
            Value::Undef => {}
            Value::CsList(l) => {
                // Each element binds in turn; the last one sticks.
                if let Some(last) = l.into_iter().rev().find(|v| v.is_defined()) {
                    self.slot_store(slot, last.make_storable());
                }
            }
            v => {
                self.slot_store(slot, v.make_storable());
            }
        }
        Ok(())
    }

    /// Take a slot's value for an indexed write, reading through a
    /// reference wrapper but leaving the wrapper in the slot.
    fn take_slot_base(&mut self, slot: usize) -> Value {
        if self.slot_is_ref(slot) {
            self.slot_value(slot)
        } else {
            std::mem::replace(self.stack.local_mut(slot), Value::Undef)
        }
    }
}
