//! Identifier reads and indexed reads: the `PUSH_SLOT` and `INDEX_*`
//! families, the scalar-matrix specializations, chained struct/call
//! expressions, `end` markers, command-syntax calls and handle pushes.

use oxmat_builtins::index::{subsref, SubsKind, SubsLevel};
use oxmat_builtins::{ClosureFrame, FnHandle, Tag, Value};

use crate::error::{exec_err, index_err, OpResult, UnwindReason};
use crate::host::FnDef;
use crate::opcodes::Op;
use crate::vm::{CallDispatch, VmCore};

impl<'i> VmCore<'i> {
    // -------- PUSH_SLOT family --------

    pub(crate) fn op_push_slot(&mut self, nargout: usize) -> OpResult {
        let slot = self.fetch_slot();
        self.push_slot_with(slot, nargout)
    }

    /// Push a slot's value; an undefined slot means a no-argument
    /// function call (command form or plain `f` reference).
    pub(crate) fn push_slot_with(&mut self, slot: usize, nargout: usize) -> OpResult {
        let v = self.slot_value(slot);
        if v.is_maybe_function() {
            return self.call_through_slot(slot, nargout);
        }
        self.stack.push_value(v);
        Ok(())
    }

    /// Zero-argument call of whatever the slot's name resolves to: push
    /// the callee value, then run the ordinary call path.
    fn call_through_slot(&mut self, slot: usize, nargout: usize) -> OpResult {
        let v = self.slot_value(slot);
        self.stack.push_value(v);
        self.perform_call(0, nargout, nargout, Some(slot))
    }

    /// `pi`, `e` and `i` compile to dedicated pushes that still carry a
    /// slot so a shadowing variable or function wins.
    pub(crate) fn op_push_named_const(&mut self, value: f64) -> OpResult {
        let slot = self.fetch_slot();
        let v = self.slot_value(slot);
        if v.is_defined() && !v.is_maybe_function() {
            self.stack.push_value(v);
            return Ok(());
        }
        if v.is_undef() && self.interp.resolve(&self.slot_name(slot)).is_some() {
            return self.call_through_slot(slot, 1);
        }
        self.stack.push_value(Value::Num(value));
        Ok(())
    }

    pub(crate) fn op_push_imaginary(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let v = self.slot_value(slot);
        if v.is_defined() && !v.is_maybe_function() {
            self.stack.push_value(v);
            return Ok(());
        }
        if v.is_undef() && self.interp.resolve(&self.slot_name(slot)).is_some() {
            return self.call_through_slot(slot, 1);
        }
        self.stack
            .push_value(Value::Complex(num_complex::Complex64::new(0.0, 1.0)));
        Ok(())
    }

    /// `PUSH_SLOT_DISP slot was_cmd_slot`: like a 1-value push, but
    /// marks whether the read turned into a command call so the
    /// following `DISP` prints `ans = ...`.
    pub(crate) fn op_push_slot_disp(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let was_cmd_slot = self.fetch_wslot();
        let idx = self.stack.base + was_cmd_slot;
        self.stack.set_value_at(idx, Value::Undef);
        let v = self.slot_value(slot);
        if v.is_maybe_function() {
            if v.is_undef() {
                let idx = self.stack.base + was_cmd_slot;
                self.stack.set_value_at(idx, Value::Bool(true));
            }
            return self.call_through_slot(slot, 0);
        }
        self.stack.push_value(v);
        Ok(())
    }

    // -------- INDEX_ID family --------

    pub(crate) fn op_index_id(&mut self, nargout: usize, specialization_ok: bool) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        self.index_id_with(slot, nargout, nargs, specialization_ok)
    }

    /// `name(args)`: the value to index (pushed by `PUSH_SLOT_INDEXED`)
    /// sits below the `nargs` arguments. Dispatches four ways on the
    /// value; a dense-matrix receiver with scalar double arguments
    /// specializes the opcode to the `MAT_1D/2D` form.
    pub(crate) fn index_id_with(
        &mut self,
        slot: usize,
        nargout: usize,
        nargs: usize,
        specialization_ok: bool,
    ) -> OpResult {
        let callee_pos = self.stack.top - 1 - nargs;
        let receiver = self.stack.value_at(callee_pos);
        if matches!(Self::classify_call(receiver), CallDispatch::Subsref) {
            if specialization_ok
                && nargout == 1
                && (nargs == 1 || nargs == 2)
                && receiver.tag() == Tag::Tensor
                && (0..nargs).all(|i| self.stack.value_from_top(i).tag() == Tag::Num)
            {
                self.rewrite_opcode(if nargs == 1 {
                    Op::IndexId1Mat1d
                } else {
                    Op::IndexId1Mat2d
                });
                return self.index_mat_specialized_with(slot, nargs);
            }
            return self.index_value_on_stack(nargs, nargout, Some(slot));
        }
        self.perform_call(nargs, nargout, nargout, Some(slot))
    }

    /// Plain-value indexed read of the `[receiver, args...]` stack shape.
    pub(crate) fn index_value_on_stack(
        &mut self,
        nargs: usize,
        nargout: usize,
        slot_for_name: Option<usize>,
    ) -> OpResult {
        let args = self.pop_args(nargs);
        let receiver = self.stack.pop_value();
        let result = subsref(&receiver, SubsKind::Paren, &args).map_err(|msg| {
            let name = slot_for_name.map(|s| self.slot_name(s));
            index_err(msg, name.as_deref())
        })?;
        self.push_results(vec![result], nargout);
        Ok(())
    }

    /// The `M(i)` / `M(i,j)` scalar specializations: type-check the
    /// receiver and arguments, read in place, and rewrite back to the
    /// generic opcode on any mismatch.
    pub(crate) fn op_index_mat_specialized(&mut self, ndims: usize) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        if nargs != ndims {
            self.rewrite_opcode(Op::IndexIdNargout1);
            return self.index_id_with(slot, 1, nargs, false);
        }
        self.index_mat_specialized_with(slot, ndims)
    }

    fn index_mat_specialized_with(&mut self, slot: usize, ndims: usize) -> OpResult {
        let callee_pos = self.stack.top - 1 - ndims;
        let ok = self.stack.value_at(callee_pos).tag() == Tag::Tensor
            && (0..ndims).all(|i| self.stack.value_from_top(i).tag() == Tag::Num);
        if !ok {
            self.rewrite_opcode(Op::IndexIdNargout1);
            return self.index_id_with(slot, 1, ndims, false);
        }

        let name = self.slot_name(slot);
        let fallback_needed;
        let mut result = 0.0;
        {
            let Value::Tensor(t) = self.stack.value_at(callee_pos) else { unreachable!() };
            if ndims == 1 {
                let Value::Num(i) = self.stack.value_from_top(0) else { unreachable!() };
                let i = *i;
                if i >= 1.0 && i.fract() == 0.0 && (i as usize) <= t.numel() {
                    result = t.data[i as usize - 1];
                    fallback_needed = false;
                } else if i.fract() != 0.0 {
                    // Non-integer index: no specialization state leaks,
                    // the generic path reports the error.
                    fallback_needed = true;
                } else {
                    return Err(index_err(
                        format!("index ({i}): out of bound {}", t.numel()),
                        Some(&name),
                    ));
                }
            } else {
                let Value::Num(j) = self.stack.value_from_top(0) else { unreachable!() };
                let Value::Num(i) = self.stack.value_from_top(1) else { unreachable!() };
                let (i, j) = (*i, *j);
                if i >= 1.0
                    && j >= 1.0
                    && i.fract() == 0.0
                    && j.fract() == 0.0
                    && (i as usize) <= t.rows()
                    && (j as usize) <= t.cols()
                {
                    result = t.data[(i as usize - 1) + (j as usize - 1) * t.rows()];
                    fallback_needed = false;
                } else if i.fract() != 0.0 || j.fract() != 0.0 {
                    fallback_needed = true;
                } else {
                    return Err(index_err(
                        format!(
                            "index ({i}, {j}): out of bound for {}x{} matrix",
                            t.rows(),
                            t.cols()
                        ),
                        Some(&name),
                    ));
                }
            }
        }
        if fallback_needed {
            self.rewrite_opcode(Op::IndexIdNargout1);
            return self.index_id_with(slot, 1, ndims, false);
        }
        self.stack.destroy(ndims + 1);
        self.stack.push_value(Value::Num(result));
        Ok(())
    }

    /// Specialized `sin(x)`-style call: one scalar argument to a known
    /// math unary. Falls back to the generic identifier-index path when
    /// the argument is not a scalar double or the name is shadowed.
    pub(crate) fn op_index_mathy_ufun(&mut self) -> OpResult {
        let ufun = self.fetch_u8();
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        let applicable = nargs == 1
            && self.stack.top_value().tag() == Tag::Num
            && self.slot_value(slot).is_maybe_function();
        if !applicable {
            return self.index_id_with(slot, 1, nargs, false);
        }
        let f: fn(f64) -> f64 = match ufun {
            0 => f64::abs,
            1 => f64::sqrt,
            2 => f64::sin,
            3 => f64::cos,
            4 => f64::exp,
            5 => f64::ln,
            6 => f64::floor,
            7 => f64::ceil,
            _ => return self.index_id_with(slot, 1, nargs, false),
        };
        let Value::Num(x) = self.stack.pop_value() else { unreachable!() };
        let _ = self.stack.pop_value(); // receiver cell below the arg
        self.stack.push_value(Value::Num(f(x)));
        Ok(())
    }

    // -------- INDEX_CELL family --------

    pub(crate) fn op_index_cell_id(&mut self, nargout: usize) -> OpResult {
        let slot = self.fetch_slot();
        let nargs = self.fetch_u8() as usize;
        self.index_cell_id_with(slot, nargout, nargs)
    }

    /// `name{args}`: brace read of the value below the arguments. The
    /// receiver may also be a function returning a cell.
    pub(crate) fn index_cell_id_with(
        &mut self,
        slot: usize,
        nargout: usize,
        nargs: usize,
    ) -> OpResult {
        let callee_pos = self.stack.top - 1 - nargs;
        let receiver = self.stack.value_at(callee_pos);
        match Self::classify_call(receiver) {
            CallDispatch::Subsref => {
                let args = self.pop_args(nargs);
                let receiver = self.stack.pop_value();
                let result = subsref(&receiver, SubsKind::Brace, &args).map_err(|msg| {
                    let name = self.slot_name(slot);
                    index_err(msg, Some(&name))
                })?;
                self.push_results(vec![result], nargout);
                Ok(())
            }
            // A function in brace position: call it, then brace-index
            // the single result. Kept to one re-dispatch level.
            _ => Err(exec_err(format!(
                "'{}' cannot be indexed with {{}}",
                self.slot_name(slot)
            ))),
        }
    }

    /// General `(`/`{`/`.` index of a transient object on the stack.
    pub(crate) fn op_index_obj(&mut self) -> OpResult {
        let nargout = self.fetch_u8() as usize;
        let _has_slot = self.fetch_u8();
        let slot = self.fetch_wslot();
        let nargs = self.fetch_u8() as usize;
        let kind_byte = self.fetch_u8() as char;
        let kind = SubsKind::from_char(kind_byte)
            .ok_or_else(|| exec_err(format!("bad index kind '{kind_byte}'")))?;

        let callee_pos = self.stack.top - 1 - nargs;
        let receiver = self.stack.value_at(callee_pos);
        if kind == SubsKind::Paren
            && !matches!(Self::classify_call(receiver), CallDispatch::Subsref)
        {
            return self.perform_call(nargs, nargout, nargout, None);
        }
        let args = self.pop_args(nargs);
        let receiver = self.stack.pop_value();
        let result = subsref(&receiver, kind, &args).map_err(|msg| {
            let name = if slot != 0 { Some(self.slot_name(slot)) } else { None };
            index_err(msg, name.as_deref())
        })?;
        self.push_results(vec![result], nargout);
        Ok(())
    }

    // -------- struct reads and chained expressions --------

    /// `base.field` where `base` is on the stack.
    pub(crate) fn op_index_struct(&mut self) -> OpResult {
        let nargout = self.fetch_u8() as usize;
        let slot = self.fetch_wslot();
        let field_slot = self.fetch_wslot();
        let field = self.slot_name(field_slot);
        let base = self.stack.pop_value();
        if base.is_undef() {
            return Err(UnwindReason::IdUndefined(self.slot_name(slot).into()));
        }
        let result = subsref(&base, SubsKind::Dot, &[Value::Str(field)])
            .map_err(|msg| index_err(msg, Some(&self.slot_name(slot))))?;
        self.push_results(vec![result], nargout);
        Ok(())
    }

    /// Head of a chained `a.b(c).d{e}` expression: dispatch the leftmost
    /// link. A callable head is invoked (returning to the next opcode,
    /// which is the first `INDEX_STRUCT_SUBCALL` of the chain); a plain
    /// value is indexed directly.
    pub(crate) fn op_index_struct_call(&mut self) -> OpResult {
        let nargs = self.fetch_u8() as usize;
        let slot = self.fetch_wslot();
        let nargout = self.fetch_u8() as usize;
        let kind_byte = self.fetch_u8() as char;
        let kind = SubsKind::from_char(kind_byte)
            .ok_or_else(|| exec_err(format!("bad index kind '{kind_byte}'")))?;

        let callee_pos = self.stack.top - 1 - nargs;
        let receiver = self.stack.value_at(callee_pos);
        match Self::classify_call(receiver) {
            CallDispatch::Subsref => {
                let args = self.pop_args(nargs);
                let receiver = self.stack.pop_value();
                let levels = vec![SubsLevel { kind, args }];
                let result = oxmat_builtins::index::subsref_chain(&receiver, &levels)
                    .map_err(|msg| index_err(msg, Some(&self.slot_name(slot))))?;
                // Chain continues: exactly one value feeds the next link.
                self.push_results(vec![result], 1);
                Ok(())
            }
            _ => self.perform_call(nargs, 1, 1, Some(slot)),
        }
    }

    /// One link of a chained expression past the head. Collects its
    /// arguments, applies one `subsref` level to the chain value, and on
    /// the final link expands to the requested output count.
    ///
    /// `nargout == 255` is a sentinel re-interpreted as one output with
    /// spread semantics for opaque receivers.
    pub(crate) fn op_index_struct_subcall(&mut self) -> OpResult {
        let mut nargout = self.fetch_u8() as usize;
        let is_last = self.fetch_u8() != 0;
        let _reserved = self.fetch_u8();
        let nargs = self.fetch_u8() as usize;
        let kind_byte = self.fetch_u8() as char;
        let kind = SubsKind::from_char(kind_byte)
            .ok_or_else(|| exec_err(format!("bad index kind '{kind_byte}'")))?;
        if nargout == 255 {
            nargout = 1;
        }

        let chain_pos = self.stack.top - 1 - nargs;
        let chain_val = self.stack.value_at(chain_pos);
        if kind == SubsKind::Paren
            && !matches!(Self::classify_call(chain_val), CallDispatch::Subsref)
        {
            // A callable mid-chain: invoke it; the next link continues
            // from its single result at the next opcode boundary.
            return self.perform_call(nargs, if is_last { nargout } else { 1 }, if is_last { nargout } else { 1 }, None);
        }
        let args = self.pop_args(nargs);
        let receiver = self.stack.pop_value();
        let result = subsref(&receiver, kind, &args).map_err(|msg| index_err(msg, None))?;
        self.push_results(vec![result], if is_last { nargout } else { 1 });
        Ok(())
    }

    // -------- end markers --------

    /// `end` inside indexing of a named variable.
    pub(crate) fn op_end_id(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let idx = self.fetch_u8() as usize;
        let n_idx = self.fetch_u8() as usize;
        let v = self.slot_value(slot);
        if v.is_undef() {
            return Err(UnwindReason::IdUndefined(self.slot_name(slot).into()));
        }
        let e = oxmat_builtins::index::end_value(&v, idx, n_idx).map_err(exec_err)?;
        self.stack.push_value(Value::Num(e));
        Ok(())
    }

    /// `end` inside indexing of a transient value. The companion
    /// `SET_SLOT_TO_STACK_DEPTH` stored the stack depth at which the
    /// value lives.
    pub(crate) fn op_end_obj(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let idx = self.fetch_u8() as usize;
        let n_idx = self.fetch_u8() as usize;
        let depth = self
            .slot_value(slot)
            .double()
            .map_err(exec_err)? as usize;
        let obj = self.stack.value_at(self.stack.base + depth - 1).clone();
        let e = oxmat_builtins::index::end_value(&obj, idx, n_idx).map_err(exec_err)?;
        self.stack.push_value(Value::Num(e));
        Ok(())
    }

    /// `end` with several candidate bases in scope (nested index
    /// expressions): the first live entry wins.
    pub(crate) fn op_end_x_n(&mut self) -> OpResult {
        let n = self.fetch_u8() as usize;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let is_obj = self.fetch_u8() != 0;
            let idx = self.fetch_u8() as usize;
            let n_idx = self.fetch_u8() as usize;
            let slot = self.fetch_wslot();
            entries.push((is_obj, idx, n_idx, slot));
        }
        for (is_obj, idx, n_idx, slot) in entries {
            if is_obj {
                let depth = match self.slot_value(slot).double() {
                    Ok(d) => d as usize,
                    Err(_) => continue,
                };
                let obj = self.stack.value_at(self.stack.base + depth - 1).clone();
                let e = oxmat_builtins::index::end_value(&obj, idx, n_idx).map_err(exec_err)?;
                self.stack.push_value(Value::Num(e));
                return Ok(());
            }
            let v = self.slot_value(slot);
            if v.is_defined() {
                let e = oxmat_builtins::index::end_value(&v, idx, n_idx).map_err(exec_err)?;
                self.stack.push_value(Value::Num(e));
                return Ok(());
            }
        }
        Err(exec_err("'end' used outside an indexing context"))
    }

    // -------- command syntax --------

    /// `WORDCMD slot nargout nargs`: command-form call, `foo bar baz`
    /// with the word arguments pushed as char rows.
    pub(crate) fn op_wordcmd(&mut self, nx: bool) -> OpResult {
        let slot = self.fetch_slot();
        let nargout;
        let nargs;
        if nx {
            nargs = self.fetch_u8() as usize;
            nargout = self.frame_nargout();
        } else {
            nargout = self.fetch_u8() as usize;
            nargs = self.fetch_u8() as usize;
        }
        let name = self.slot_name(slot);
        let args = self.pop_args(nargs);
        let n_expanded = args.len();
        match self.interp.resolve(&name) {
            Some((key, FnDef::Unit(unit))) => {
                self.stack
                    .push_value(Value::Handle(FnHandle::cache(name, key)));
                for a in args {
                    self.stack.push_value(a);
                }
                self.make_bytecode_call(unit, n_expanded, nargout, nargout, None, key)
            }
            Some((_, FnDef::Builtin(b))) => {
                let results = self
                    .interp
                    .call_host(b.name, &args, nargout)
                    .map_err(UnwindReason::Execution)?;
                self.push_results(results, nargout);
                Ok(())
            }
            None => Err(UnwindReason::IdUndefined(name.into())),
        }
    }

    // -------- function handles --------

    /// `@name`: build a handle, resolving eagerly when possible.
    pub(crate) fn op_push_fcn_handle(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let raw = self.slot_name(slot);
        let name = raw.strip_prefix('@').unwrap_or(&raw).to_string();
        let mut h = FnHandle::named(name.clone());
        if let Some((Some(key), _)) = self.interp.resolve(&name) {
            h.fn_key = Some(key);
        }
        self.stack.push_value(Value::Handle(h));
        Ok(())
    }

    /// `@(...) expr`: the operand is the function-table key of the
    /// compiled anonymous body. Captures are taken by value from the
    /// current frame, keyed by the anonymous unit's slot names.
    pub(crate) fn op_push_anon_fcn_handle(&mut self) -> OpResult {
        let key = self.fetch_u32() as usize;
        let Some(FnDef::Unit(anon_unit)) = self.interp.function_by_key(key) else {
            return Err(exec_err("anonymous function body is not compiled"));
        };
        let frame = ClosureFrame::new();
        {
            let n_skip = anon_unit.n_returns() + anon_unit.n_args();
            let mut vars = frame.vars.borrow_mut();
            for (anon_slot, name) in anon_unit.names.iter().enumerate() {
                if anon_slot == 0 || anon_slot < n_skip || name.starts_with('%') {
                    continue;
                }
                if let Some(cur_slot) =
                    self.unit.names.iter().position(|n| n == name)
                {
                    let v = self.slot_value(cur_slot);
                    if v.is_defined() {
                        vars.insert(name.clone(), v);
                    }
                }
            }
        }
        self.stack
            .push_value(Value::Handle(FnHandle::anonymous(key, frame)));
        Ok(())
    }

    /// `INSTALL_FUNCTION slot data_idx`: a command-line function
    /// definition; the data entry holds a handle to the compiled body.
    pub(crate) fn op_install_function(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let data_idx = self.fetch_u32() as usize;
        let name = self.slot_name(slot);
        let Value::Handle(h) = &self.unit.data[data_idx] else {
            return Err(exec_err("INSTALL_FUNCTION data entry is not a handle"));
        };
        let key = h
            .fn_key
            .ok_or_else(|| exec_err("INSTALL_FUNCTION handle has no body"))?;
        let def = self
            .interp
            .function_by_key(key)
            .ok_or_else(|| exec_err("INSTALL_FUNCTION body not registered"))?;
        self.interp.install_function(&name, def);
        // A variable shadowing the name is cleared.
        if !self.slot_is_ref(slot) {
            let idx = self.stack.base + slot;
            self.stack.set_value_at(idx, Value::Undef);
        } else {
            self.slot_store(slot, Value::Undef);
        }
        Ok(())
    }

}
