//! Remaining handlers: stack shuffles, folded constants, display,
//! globals/persistents, output-ignore and the error-object rethrow.

use oxmat_builtins::{MException, RefSlot, Tensor, Value};

use crate::error::{exec_err, OpResult, UnwindReason};
use crate::ignore::IgnoreState;
use crate::vm::VmCore;

impl<'i> VmCore<'i> {
    /// `DUPN offset n`: copy `n` values that start `offset` below them.
    pub(crate) fn op_dupn(&mut self) {
        let offset = self.fetch_u8() as usize;
        let n = self.fetch_u8() as usize;
        let first = self.stack.top - n - offset;
        for i in 0..n {
            let v = self.stack.value_at(first + i).clone();
            self.stack.push_value(v);
        }
    }

    /// `DUP_MOVE n`: copy the top value `n` positions down.
    pub(crate) fn op_dup_move(&mut self) {
        let n = self.fetch_u8() as usize;
        let v = self.stack.top_value().clone();
        let idx = self.stack.top - 1 - n;
        self.stack.set_value_at(idx, v);
    }

    /// `PUSH_FOLDED_CST slot target`: push the cached fold and skip the
    /// initializer, or fall through into it on a cold cache.
    pub(crate) fn op_push_folded_cst(&mut self) {
        let slot = self.fetch_slot();
        let target = self.fetch_u16() as usize;
        let cached = self.stack.local(slot).clone();
        if cached.is_defined() {
            self.stack.push_value(cached);
            self.ip = target;
        }
    }

    /// `SET_FOLDED_CST slot`: cache the freshly computed fold, leaving
    /// it on the stack.
    pub(crate) fn op_set_folded_cst(&mut self) {
        let slot = self.fetch_slot();
        let v = self.stack.top_value().clone();
        let idx = self.stack.base + slot;
        self.stack.set_value_at(idx, v);
    }

    /// `DISP slot was_cmd_slot`: statement display of the top value.
    pub(crate) fn op_disp(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let was_cmd_slot = self.fetch_wslot();
        let call_was_cmd = was_cmd_slot != 0
            && self.stack.local(was_cmd_slot).is_defined();
        let v = self.stack.pop_value();
        if self.interp.statement_printing && v.is_defined() {
            match &v {
                Value::CsList(l) => {
                    for el in l {
                        if el.is_defined() {
                            self.interp.display_value(Some("ans"), el);
                        }
                    }
                }
                _ => {
                    let name = if call_was_cmd {
                        Some("ans".to_string())
                    } else if slot != 0 {
                        Some(self.slot_name(slot))
                    } else {
                        None
                    };
                    self.interp.display_value(name.as_deref(), &v);
                }
            }
        }
        Ok(())
    }

    /// `EVAL nargout tree_idx`: defers to the host's eval hook; pure
    /// bytecode hosts reject it.
    pub(crate) fn op_eval(&mut self) -> OpResult {
        let _nargout = self.fetch_u8();
        let _tree_idx = self.fetch_u32();
        Err(exec_err("eval requires the host tree evaluator"))
    }

    /// `THROW_IFERROBJ`: rethrow the error-info struct an
    /// unwind-protect region received, once its cleanup ran. Within an
    /// interrupt unwind the rethrow stays an interrupt.
    pub(crate) fn op_throw_iferrobj(&mut self) -> OpResult {
        let v = self.stack.pop_value();
        if v.is_undef() {
            return Ok(());
        }
        if self.unwinding_interrupt {
            self.unwinding_interrupt = false;
            return Err(UnwindReason::Interrupt);
        }
        let Value::Struct(st) = &v else {
            return Err(exec_err("malformed error object on stack"));
        };
        let msg = match st.get("message") {
            Some(Value::Str(s)) => s.clone(),
            _ => String::new(),
        };
        let id = match st.get("identifier") {
            Some(Value::Str(s)) => s.clone(),
            _ => String::new(),
        };
        Err(UnwindReason::Execution(MException::new(id, msg)))
    }

    /// Matlab-style short-circuit support: `true` when the operand is a
    /// 1x1 value, so `&`/`|` inside a condition can short-circuit.
    pub(crate) fn op_braindead_precond(&mut self) -> OpResult {
        let v = self.stack.pop_value();
        let is_1x1 = v.numel() == 1;
        self.stack.push_value(Value::Bool(is_1x1));
        Ok(())
    }

    /// One-shot warning for the short-circuit rewrite, latched in a slot.
    pub(crate) fn op_braindead_warning(&mut self) -> OpResult {
        let slot = self.fetch_slot();
        let op_type = self.fetch_u8() as char;
        if self.stack.local(slot).is_undef() {
            let idx = self.stack.base + slot;
            self.stack.set_value_at(idx, Value::Bool(true));
            log::warn!("short-circuit operation performed for operator {op_type}");
        }
        Ok(())
    }

    // -------- globals / persistents --------

    /// `GLOBAL_INIT`: install a reference wrapper in the slot, binding
    /// it to a named global or a scope-indexed persistent. An `after`
    /// target skips the initializer when the binding is already live.
    pub(crate) fn op_global_init(&mut self) -> OpResult {
        let persistent = self.fetch_u8() != 0;
        let slot = self.fetch_u16() as usize;
        let aux = self.fetch_u16() as usize;
        let has_target = self.fetch_u8() != 0;
        let after = if has_target { self.fetch_u16() as usize } else { 0 };

        let name = self.slot_name(slot);
        let slot_val = self.stack.local(slot).clone();
        let already_wrapped = slot_val.is_ref();

        // A local value in the slot becomes the initial binding value.
        let default = match (&slot_val, already_wrapped) {
            (v, false) if v.is_defined() => v.clone(),
            _ => Value::Tensor(Tensor::empty()),
        };

        if !persistent {
            if let Value::Ref(RefSlot::Persistent { .. }) = &slot_val {
                return Err(exec_err(format!(
                    "can't make persistent variable '{name}' global"
                )));
            }
            let was_live = self.interp.global_is_defined(&name);
            if !was_live {
                self.interp.global_set(&name, default);
            }
            if !already_wrapped {
                let idx = self.stack.base + slot;
                self.stack
                    .set_value_at(idx, Value::Ref(RefSlot::Global(name)));
            }
            if has_target && was_live {
                self.ip = after;
            }
        } else {
            if let Value::Ref(RefSlot::Global(_)) = &slot_val {
                return Err(exec_err(format!(
                    "can't make global variable '{name}' persistent"
                )));
            }
            let scope = self.interp.current_frame().map(|f| f.scope).unwrap_or(0);
            let offset = self
                .unit
                .unwind
                .persistents
                .iter()
                .find(|p| p.slot as usize == slot)
                .map(|p| p.offset)
                .unwrap_or(aux);
            let was_live = self.interp.persistent_is_live(scope, offset);
            if !was_live {
                self.interp.persistent_set(scope, offset, default);
            }
            if !already_wrapped {
                let idx = self.stack.base + slot;
                self.stack
                    .set_value_at(idx, Value::Ref(RefSlot::Persistent { scope, offset }));
            }
            if has_target && was_live {
                self.ip = after;
            }
        }
        Ok(())
    }

    // -------- output ignore --------

    /// `SET_IGNORE_OUTPUTS n_ignored n_total idx...`: build the pending
    /// ignore matrix consumed by the next call.
    pub(crate) fn op_set_ignore_outputs(&mut self) -> OpResult {
        let n_ignored = self.fetch_u8() as usize;
        let n_total = self.fetch_u8() as usize;
        let mut ignored = Vec::with_capacity(n_ignored);
        for _ in 0..n_ignored {
            ignored.push(self.fetch_u8() as usize);
        }
        let state = self.ignore.get_or_insert_with(|| Box::new(IgnoreState::new()));
        state.set_ignore(self.interp, ignored, n_total);
        Ok(())
    }

    /// `CLEAR_IGNORE_OUTPUTS n_slots slot...`: restore the prior lvalue
    /// list and clear the `%~` slots.
    pub(crate) fn op_clear_ignore_outputs(&mut self) -> OpResult {
        let n_slots = self.fetch_u8() as usize;
        let mut slots = Vec::with_capacity(n_slots);
        for _ in 0..n_slots {
            slots.push(self.fetch_wslot());
        }
        if let Some(state) = self.ignore.as_mut() {
            state.clear_ignore(self.interp);
        }
        if self.ignore.as_ref().is_some_and(|s| s.can_be_dropped()) {
            self.ignore = None;
        }
        for slot in slots {
            let idx = self.stack.base + slot;
            self.stack.set_value_at(idx, Value::Undef);
        }
        Ok(())
    }

    /// Propagate the caller's ignore matrix into an anonymous-function
    /// call about to be made.
    pub(crate) fn op_anon_maybe_set_ignore(&mut self) -> OpResult {
        let ignored = self
            .interp
            .current_frame()
            .and_then(|f| f.ignored.clone());
        if let Some(ignored) = ignored {
            let state = self.ignore.get_or_insert_with(|| Box::new(IgnoreState::new()));
            state.set_ignore_anon(self.interp, ignored);
        }
        Ok(())
    }
}
