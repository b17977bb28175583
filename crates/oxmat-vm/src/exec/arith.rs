//! Arithmetic, comparison and unary handlers, including the
//! inline-cache specialization: a generic handler that sees two scalar
//! doubles rewrites its own opcode byte to the `_DBL` form; the `_DBL`
//! form rewrites itself back when the operand types change. Opcode bytes
//! are re-read on every dispatch, so the rewrite is always safe.

use oxmat_builtins::ops::{self, BinOp, UnOp};
use oxmat_builtins::{Tag, Value};

use crate::error::{exec_err, OpResult, UnwindReason};
use crate::opcodes::Op;
use crate::vm::VmCore;

/// Operator pairings: generic opcode, specialized opcode, operator.
fn binop_of(op: Op) -> (Op, Op, BinOp) {
    match op {
        Op::Mul | Op::MulDbl => (Op::Mul, Op::MulDbl, BinOp::Mul),
        Op::Div | Op::DivDbl => (Op::Div, Op::DivDbl, BinOp::Div),
        Op::Add | Op::AddDbl => (Op::Add, Op::AddDbl, BinOp::Add),
        Op::Sub | Op::SubDbl => (Op::Sub, Op::SubDbl, BinOp::Sub),
        Op::Pow | Op::PowDbl => (Op::Pow, Op::PowDbl, BinOp::Pow),
        Op::Le | Op::LeDbl => (Op::Le, Op::LeDbl, BinOp::Le),
        Op::LeEq | Op::LeEqDbl => (Op::LeEq, Op::LeEqDbl, BinOp::LeEq),
        Op::Gr | Op::GrDbl => (Op::Gr, Op::GrDbl, BinOp::Gr),
        Op::GrEq | Op::GrEqDbl => (Op::GrEq, Op::GrEqDbl, BinOp::GrEq),
        Op::Eq | Op::EqDbl => (Op::Eq, Op::EqDbl, BinOp::Eq),
        Op::Neq | Op::NeqDbl => (Op::Neq, Op::NeqDbl, BinOp::Neq),
        other => unreachable!("not a specializable binop opcode: {other:?}"),
    }
}

fn plain_binop_of(op: Op) -> BinOp {
    match op {
        Op::Ldiv => BinOp::Ldiv,
        Op::ElMul => BinOp::ElMul,
        Op::ElDiv => BinOp::ElDiv,
        Op::ElPow => BinOp::ElPow,
        Op::ElAnd => BinOp::ElAnd,
        Op::ElOr => BinOp::ElOr,
        Op::ElLdiv => BinOp::ElLdiv,
        other => unreachable!("not a plain binop opcode: {other:?}"),
    }
}

fn cst_binop_of(op: Op) -> (Op, Op, BinOp) {
    match op {
        Op::MulCst | Op::MulCstDbl => (Op::MulCst, Op::MulCstDbl, BinOp::Mul),
        Op::AddCst | Op::AddCstDbl => (Op::AddCst, Op::AddCstDbl, BinOp::Add),
        Op::SubCst | Op::SubCstDbl => (Op::SubCst, Op::SubCstDbl, BinOp::Sub),
        Op::DivCst | Op::DivCstDbl => (Op::DivCst, Op::DivCstDbl, BinOp::Div),
        Op::PowCst | Op::PowCstDbl => (Op::PowCst, Op::PowCstDbl, BinOp::Pow),
        Op::LeCst | Op::LeCstDbl => (Op::LeCst, Op::LeCstDbl, BinOp::Le),
        Op::LeEqCst | Op::LeEqCstDbl => (Op::LeEqCst, Op::LeEqCstDbl, BinOp::LeEq),
        Op::GrCst | Op::GrCstDbl => (Op::GrCst, Op::GrCstDbl, BinOp::Gr),
        Op::GrEqCst | Op::GrEqCstDbl => (Op::GrEqCst, Op::GrEqCstDbl, BinOp::GrEq),
        Op::EqCst | Op::EqCstDbl => (Op::EqCst, Op::EqCstDbl, BinOp::Eq),
        Op::NeqCst | Op::NeqCstDbl => (Op::NeqCst, Op::NeqCstDbl, BinOp::Neq),
        other => unreachable!("not a folded-cst binop opcode: {other:?}"),
    }
}

impl<'i> VmCore<'i> {
    fn both_tops_are_num(&self) -> bool {
        self.stack.value_from_top(0).tag() == Tag::Num
            && self.stack.value_from_top(1).tag() == Tag::Num
    }

    /// Generic binary handler. On a scalar-double pair it specializes the
    /// opcode in place and takes the fast path immediately.
    pub(crate) fn binop_generic(&mut self, op: Op) -> OpResult {
        let (_, dbl, binop) = binop_of(op);
        if self.both_tops_are_num() {
            self.rewrite_opcode(dbl);
            return self.apply_binop_dbl(binop);
        }
        self.apply_binop_generic(binop)
    }

    /// Specialized scalar-double handler. Falls back by rewriting the
    /// opcode byte back to the generic form.
    pub(crate) fn binop_dbl(&mut self, op: Op) -> OpResult {
        let (generic, _, binop) = binop_of(op);
        if !self.both_tops_are_num() {
            self.rewrite_opcode(generic);
            return self.apply_binop_generic(binop);
        }
        self.apply_binop_dbl(binop)
    }

    /// Operators that never specialize.
    pub(crate) fn binop_plain(&mut self, op: Op) -> OpResult {
        self.apply_binop_generic(plain_binop_of(op))
    }

    fn apply_binop_dbl(&mut self, binop: BinOp) -> OpResult {
        let f = ops::lookup_binary_dbl(binop);
        let Value::Num(b) = self.stack.pop_value() else { unreachable!() };
        let Value::Num(a) = self.stack.pop_value() else { unreachable!() };
        self.stack.push_value(f(a, b));
        Ok(())
    }

    fn apply_binop_generic(&mut self, binop: BinOp) -> OpResult {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        let r = ops::binary_op(binop, &a, &b).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    /// Folded-constant rhs: operands are `(data index, reserved)`.
    pub(crate) fn binop_cst_generic(&mut self, op: Op) -> OpResult {
        let (_, dbl, binop) = cst_binop_of(op);
        let idx = self.fetch_u8() as usize;
        let _reserved = self.fetch_u8();
        let rhs = self.unit.data[idx].clone();
        if self.stack.value_from_top(0).tag() == Tag::Num && rhs.tag() == Tag::Num {
            self.rewrite_opcode(dbl);
            let f = ops::lookup_binary_dbl(binop);
            let Value::Num(a) = self.stack.pop_value() else { unreachable!() };
            let Value::Num(b) = rhs else { unreachable!() };
            self.stack.push_value(f(a, b));
            return Ok(());
        }
        let a = self.stack.pop_value();
        let r = ops::binary_op(binop, &a, &rhs).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    pub(crate) fn binop_cst_dbl(&mut self, op: Op) -> OpResult {
        let (generic, _, binop) = cst_binop_of(op);
        let idx = self.fetch_u8() as usize;
        let _reserved = self.fetch_u8();
        let rhs = self.unit.data[idx].clone();
        if self.stack.value_from_top(0).tag() != Tag::Num || rhs.tag() != Tag::Num {
            self.rewrite_opcode(generic);
            let a = self.stack.pop_value();
            let r = ops::binary_op(binop, &a, &rhs).map_err(exec_err)?;
            self.stack.push_value(r);
            return Ok(());
        }
        let f = ops::lookup_binary_dbl(binop);
        let Value::Num(a) = self.stack.pop_value() else { unreachable!() };
        let Value::Num(b) = rhs else { unreachable!() };
        self.stack.push_value(f(a, b));
        Ok(())
    }

    // -------- unary --------

    pub(crate) fn op_not_generic(&mut self) -> OpResult {
        match self.stack.top_value().tag() {
            Tag::Num => {
                self.rewrite_opcode(Op::NotDbl);
                return self.op_not_dbl();
            }
            Tag::Bool => {
                self.rewrite_opcode(Op::NotBool);
                return self.op_not_bool();
            }
            _ => {}
        }
        let v = self.stack.pop_value();
        let r = ops::unary_op(UnOp::Not, &v).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    pub(crate) fn op_not_dbl(&mut self) -> OpResult {
        if self.stack.top_value().tag() != Tag::Num {
            self.rewrite_opcode(Op::Not);
            let v = self.stack.pop_value();
            let r = ops::unary_op(UnOp::Not, &v).map_err(exec_err)?;
            self.stack.push_value(r);
            return Ok(());
        }
        let Value::Num(n) = self.stack.pop_value() else { unreachable!() };
        self.stack.push_value(Value::Bool(n == 0.0));
        Ok(())
    }

    pub(crate) fn op_not_bool(&mut self) -> OpResult {
        if self.stack.top_value().tag() != Tag::Bool {
            self.rewrite_opcode(Op::Not);
            let v = self.stack.pop_value();
            let r = ops::unary_op(UnOp::Not, &v).map_err(exec_err)?;
            self.stack.push_value(r);
            return Ok(());
        }
        let Value::Bool(b) = self.stack.pop_value() else { unreachable!() };
        self.stack.push_value(Value::Bool(!b));
        Ok(())
    }

    pub(crate) fn op_usub_generic(&mut self) -> OpResult {
        if self.stack.top_value().tag() == Tag::Num {
            self.rewrite_opcode(Op::USubDbl);
            return self.op_usub_dbl();
        }
        let v = self.stack.pop_value();
        let r = ops::unary_op(UnOp::UMinus, &v).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    pub(crate) fn op_usub_dbl(&mut self) -> OpResult {
        if self.stack.top_value().tag() != Tag::Num {
            self.rewrite_opcode(Op::USub);
            let v = self.stack.pop_value();
            let r = ops::unary_op(UnOp::UMinus, &v).map_err(exec_err)?;
            self.stack.push_value(r);
            return Ok(());
        }
        let Value::Num(n) = self.stack.pop_value() else { unreachable!() };
        self.stack.push_value(Value::Num(-n));
        Ok(())
    }

    pub(crate) fn op_uadd(&mut self) -> OpResult {
        let v = self.stack.pop_value();
        let r = ops::unary_op(UnOp::UPlus, &v).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    pub(crate) fn op_transpose(&mut self, conj: bool) -> OpResult {
        let v = self.stack.pop_value();
        let op = if conj { UnOp::Herm } else { UnOp::Trans };
        let r = ops::unary_op(op, &v).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    pub(crate) fn op_unary_true(&mut self) -> OpResult {
        let v = self.stack.pop_value();
        let t = v.is_true().map_err(|_| UnwindReason::IfUndefined)?;
        self.stack.push_value(Value::Bool(t));
        Ok(())
    }

    /// Fused transpose-multiply forms: `a.' * b`, `a * b.'` and the
    /// conjugating variants.
    pub(crate) fn op_fused_mul(&mut self, trans_lhs: bool, trans_rhs: bool, conj: bool) -> OpResult {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        let t = if conj { UnOp::Herm } else { UnOp::Trans };
        let a = if trans_lhs {
            ops::unary_op(t, &a).map_err(exec_err)?
        } else {
            a
        };
        let b = if trans_rhs {
            ops::unary_op(t, &b).map_err(exec_err)?
        } else {
            b
        };
        let r = ops::binary_op(BinOp::Mul, &a, &b).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    /// `a.' \ b` and `a' \ b`.
    pub(crate) fn op_fused_ldiv(&mut self, conj: bool) -> OpResult {
        let b = self.stack.pop_value();
        let a = self.stack.pop_value();
        let t = if conj { UnOp::Herm } else { UnOp::Trans };
        let a = ops::unary_op(t, &a).map_err(exec_err)?;
        let r = ops::binary_op(BinOp::Ldiv, &a, &b).map_err(exec_err)?;
        self.stack.push_value(r);
        Ok(())
    }

    // -------- increment / decrement --------

    /// `i++`, `++i`, `i--`, `--i` on a slot. Prefix pushes the updated
    /// value, postfix the prior one. The `_DBL` forms specialize on a
    /// scalar-double slot and de-specialize like the binops.
    pub(crate) fn op_incr_decr_id(&mut self, delta: f64, prefix: bool, dbl: bool) -> OpResult {
        let slot = self.fetch_slot();
        let old = self.slot_value(slot);

        if dbl {
            if old.tag() != Tag::Num {
                self.rewrite_opcode(match (delta > 0.0, prefix) {
                    (true, true) => Op::IncrIdPrefix,
                    (true, false) => Op::IncrIdPostfix,
                    (false, true) => Op::DecrIdPrefix,
                    (false, false) => Op::DecrIdPostfix,
                });
                return self.incr_decr_generic(slot, old, delta, prefix);
            }
            let Value::Num(n) = old else { unreachable!() };
            let updated = Value::Num(n + delta);
            self.slot_store(slot, updated.clone());
            self.stack
                .push_value(if prefix { updated } else { Value::Num(n) });
            return Ok(());
        }

        if old.tag() == Tag::Num {
            self.rewrite_opcode(match (delta > 0.0, prefix) {
                (true, true) => Op::IncrIdPrefixDbl,
                (true, false) => Op::IncrIdPostfixDbl,
                (false, true) => Op::DecrIdPrefixDbl,
                (false, false) => Op::DecrIdPostfixDbl,
            });
        }
        self.incr_decr_generic(slot, old, delta, prefix)
    }

    fn incr_decr_generic(
        &mut self,
        slot: usize,
        old: Value,
        delta: f64,
        prefix: bool,
    ) -> OpResult {
        let updated = ops::binary_op(BinOp::Add, &old, &Value::Num(delta)).map_err(exec_err)?;
        self.slot_store(slot, updated.clone());
        self.stack.push_value(if prefix { updated } else { old });
        Ok(())
    }
}
