//! The dispatch core: registers, the decode loop, the calling convention
//! and the unwind machinery. Per-opcode handlers live in `exec`.

use std::rc::Rc;

use oxmat_builtins::{CellArray, ClosureFrame, FnHandle, HandleKind, Value};

use crate::error::{exec_err, exec_err_id, OpResult, UnwindReason, VmError};
use crate::host::{FnDef, Interp};
use crate::ignore::IgnoreState;
use crate::opcodes::Op;
use crate::stack::{OperandStack, Slot};
use crate::unit::{CompiledUnit, RegionKind, HEADER_SIZE};

/// Bookkeeping slots pushed under a callee frame, lowest first:
/// saved caller arg-base, caller unit, caller base, caller ip, caller
/// requested value count. The callee's `%nargout` int sits at `base`.
pub(crate) const BOOKKEEPING_SLOTS: usize = 5;

/// Headroom a call needs beyond the callee's locals.
const STACK_MIN_FOR_CALL: usize = BOOKKEEPING_SLOTS + 8;

/// Hard cap on positional arguments, matching the calling convention's
/// error message for runaway cs-list expansion.
pub(crate) const MAX_POSITIONAL_ARGS: usize = 512;

pub(crate) enum Flow {
    Continue,
    Return(Vec<Value>),
}

/// Per-bytecode-frame metadata the VM keeps off the operand stack.
pub(crate) struct CallMeta {
    pub prof_name: String,
    /// Copy-out target for nested-handle frames.
    pub closure: Option<Rc<ClosureFrame>>,
}

pub struct VmCore<'i> {
    pub interp: &'i mut Interp,
    pub(crate) stack: OperandStack,
    pub(crate) unit: Rc<CompiledUnit>,
    /// Offset of the next byte to fetch.
    pub(crate) ip: usize,
    /// Start of the current instruction (including a `Wide` prefix).
    pub(crate) op_ip: usize,
    /// Offset of the opcode byte itself, the target of self-rewrites.
    pub(crate) opcode_ip: usize,
    pub(crate) wide: bool,
    pub(crate) arg0_override: Option<u8>,
    pub(crate) ignore: Option<Box<IgnoreState>>,
    pub(crate) unwinding_interrupt: bool,
    pub(crate) metas: Vec<CallMeta>,
    root_nargout: usize,
    frames_at_entry: usize,
}

/// Execute a compiled unit to completion against `interp`.
///
/// This is the single entry point: a fresh VM instance per top-level
/// invocation, sharing the interpreter's tables.
pub fn call(
    interp: &mut Interp,
    unit: Rc<CompiledUnit>,
    args: Vec<Value>,
    nargout: usize,
) -> Result<Vec<Value>, VmError> {
    let stack_size = interp.stack_size;
    let frames_at_entry = interp.frame_depth();
    let prof_name = unit.profiler_name();
    let scope = interp.key_of(&unit.display_name()).unwrap_or(0);
    interp.push_frame(unit.display_name(), args.len(), nargout, scope);
    if let Some(p) = interp.profiler.as_mut() {
        p.enter_fn(&prof_name, "", &unit);
    }

    let mut vm = VmCore {
        interp,
        stack: OperandStack::new(stack_size),
        ip: HEADER_SIZE,
        op_ip: HEADER_SIZE,
        opcode_ip: HEADER_SIZE,
        wide: false,
        arg0_override: None,
        ignore: None,
        unwinding_interrupt: false,
        metas: vec![CallMeta { prof_name, closure: None }],
        root_nargout: nargout,
        frames_at_entry,
        unit,
    };

    let result = match vm.setup_root_frame(args, nargout) {
        Ok(()) => vm.run(),
        Err(reason) => vm.unwind_to_error(reason),
    };
    debug_assert!(vm.stack.guards_ok(), "operand stack guard pads corrupted");
    result
}

impl<'i> VmCore<'i> {
    // -------- frame setup --------

    fn setup_root_frame(&mut self, args: Vec<Value>, nargout: usize) -> Result<(), UnwindReason> {
        let unit = self.unit.clone();
        let n_returns = unit.n_returns();
        let n_args = unit.n_args();
        let n_locals = unit.n_locals();
        let is_varargin = unit.has_varargin();
        let is_varargout = unit.has_varargout();
        let n_root_args = args.len();

        self.stack.push_int(nargout as i64);
        for _ in 1..n_returns {
            self.stack.push_value(Value::Undef);
        }

        let nargin;
        if !is_varargin {
            let mut pushed = 0;
            for a in args {
                self.stack.push_value(a);
                pushed += 1;
            }
            for _ in pushed..n_args {
                self.stack.push_value(Value::Undef);
            }
            nargin = n_root_args;
        } else {
            let n_named = n_args.saturating_sub(1);
            let mut it = args.into_iter();
            let mut pushed = 0;
            for a in it.by_ref().take(n_named) {
                self.stack.push_value(a);
                pushed += 1;
            }
            for _ in pushed..n_named {
                self.stack.push_value(Value::Undef);
            }
            let rest: Vec<Value> = it.collect();
            let n_vararg = rest.len();
            let cell = CellArray::new(rest, if n_vararg > 0 { 1 } else { 0 }, n_vararg)
                .map_err(exec_err)?;
            self.stack.push_value(Value::Cell(cell));
            nargin = pushed.min(n_named) + n_vararg;
        }
        for _ in 0..n_locals.saturating_sub(n_args + n_returns) {
            self.stack.push_value(Value::Undef);
        }

        if let Some(f) = self.interp.current_frame_mut() {
            f.nargin = nargin;
        }

        if !is_varargin && n_root_args > n_args {
            return Err(exec_err_id(
                "OxMat:invalid-fun-call",
                format!("{}: function called with too many inputs", unit.unwind.name),
            ));
        }
        if !is_varargout && nargout > n_returns.saturating_sub(1) && !unit.is_anonymous() {
            return Err(exec_err_id(
                "OxMat:invalid-fun-call",
                format!("{}: function called with too many outputs", unit.unwind.name),
            ));
        }
        Ok(())
    }

    // -------- decode helpers --------

    #[inline]
    pub(crate) fn fetch_u8(&mut self) -> u8 {
        if let Some(v) = self.arg0_override.take() {
            self.ip += 1;
            return v;
        }
        let b = self.unit.byte(self.ip);
        self.ip += 1;
        b
    }

    #[inline]
    pub(crate) fn fetch_u16(&mut self) -> u16 {
        let v = self.unit.u16_at(self.ip);
        self.ip += 2;
        v
    }

    pub(crate) fn fetch_u32(&mut self) -> u32 {
        let v = self.unit.u32_at(self.ip);
        self.ip += 4;
        v
    }

    /// First slot operand of an instruction; widened under `Wide`.
    #[inline]
    pub(crate) fn fetch_slot(&mut self) -> usize {
        if self.wide {
            self.wide = false;
            self.fetch_u16() as usize
        } else {
            self.fetch_u8() as usize
        }
    }

    pub(crate) fn fetch_wslot(&mut self) -> usize {
        self.fetch_u16() as usize
    }

    /// Rewrite the current instruction's opcode byte. The next visit of
    /// this ip decodes the new form.
    pub(crate) fn rewrite_opcode(&self, to: Op) {
        self.unit.set_byte(self.opcode_ip, to as u8);
    }

    // -------- slot access --------

    /// Read a slot, dereferencing global/persistent wrappers.
    pub(crate) fn slot_value(&self, slot: usize) -> Value {
        match self.stack.local(slot) {
            Value::Ref(r) => match r {
                oxmat_builtins::RefSlot::Global(name) => self.interp.global_get(name),
                oxmat_builtins::RefSlot::Persistent { scope, offset } => {
                    self.interp.persistent_get(*scope, *offset)
                }
            },
            v => v.clone(),
        }
    }

    pub(crate) fn slot_is_ref(&self, slot: usize) -> bool {
        self.stack.local(slot).is_ref()
    }

    /// Store through a slot, writing through reference wrappers.
    pub(crate) fn slot_store(&mut self, slot: usize, v: Value) {
        let idx = self.stack.base + slot;
        let wrapper = match self.stack.value_at(idx) {
            Value::Ref(r) => Some(r.clone()),
            _ => None,
        };
        match wrapper {
            Some(oxmat_builtins::RefSlot::Global(name)) => self.interp.global_set(&name, v),
            Some(oxmat_builtins::RefSlot::Persistent { scope, offset }) => {
                self.interp.persistent_set(scope, offset, v)
            }
            None => self.stack.set_value_at(idx, v),
        }
    }

    pub(crate) fn slot_name(&self, slot: usize) -> String {
        self.unit.slot_name(slot).to_string()
    }

    pub(crate) fn frame_nargout(&self) -> usize {
        self.stack.int_at(self.stack.base).max(0) as usize
    }

    // -------- shared value plumbing --------

    /// Pop `n` argument values, expanding cs-lists in place.
    pub(crate) fn pop_args(&mut self, n: usize) -> Vec<Value> {
        let mut rev = Vec::with_capacity(n);
        for _ in 0..n {
            rev.push(self.stack.pop_value());
        }
        let mut out = Vec::with_capacity(n);
        for v in rev.into_iter().rev() {
            match v {
                Value::CsList(l) => out.extend(l),
                other => out.push(other),
            }
        }
        out
    }

    /// Push a call's results. For a single-value consumer a cs-list
    /// result stays on the stack as one transient value (expanded later
    /// at its consumption point); a multi-output request expands
    /// cs-lists and pads with undefined to exactly `nargout` values.
    pub(crate) fn push_results(&mut self, results: Vec<Value>, nargout: usize) {
        if nargout <= 1 {
            let mut it = results.into_iter();
            self.stack.push_value(it.next().unwrap_or(Value::Undef));
            return;
        }
        let mut flat = Vec::with_capacity(results.len());
        for v in results {
            match v {
                Value::CsList(l) => flat.extend(l),
                other => flat.push(other),
            }
        }
        let mut it = flat.into_iter();
        for _ in 0..nargout {
            self.stack.push_value(it.next().unwrap_or(Value::Undef));
        }
    }

    // -------- the loop --------

    fn run(&mut self) -> Result<Vec<Value>, VmError> {
        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Return(vals)) => return Ok(vals),
                Err(reason) => {
                    if let Err(e) = self.unwind(reason) {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn unwind_to_error(&mut self, reason: UnwindReason) -> Result<Vec<Value>, VmError> {
        match self.unwind(reason) {
            Ok(()) => self.run(),
            Err(e) => Err(e),
        }
    }

    fn step(&mut self) -> Result<Flow, UnwindReason> {
        self.op_ip = self.ip;
        self.wide = false;
        let mut b = self.fetch_u8();
        if b == Op::Wide as u8 {
            self.wide = true;
            b = self.fetch_u8();
        }
        self.opcode_ip = self.ip - 1;

        if self.interp.profiler.is_some() {
            let name = self
                .metas
                .last()
                .map(|m| m.prof_name.clone())
                .unwrap_or_default();
            if let Some(p) = self.interp.profiler.as_mut() {
                p.tick(&name, self.op_ip);
            }
        }

        let op = Op::from_u8(b)
            .ok_or_else(|| exec_err(format!("unknown opcode {b} at offset {}", self.opcode_ip)))?;

        match op {
            // -------- stack primitives --------
            Op::Pop => {
                let _ = self.stack.pop_value();
            }
            Op::Dup => {
                let v = self.stack.top_value().clone();
                self.stack.push_value(v);
            }
            Op::DupN => self.op_dupn(),
            Op::DupMove => self.op_dup_move(),
            Op::Rot => {
                let a = self.stack.pop_value();
                let b = self.stack.pop_value();
                self.stack.push_value(a);
                self.stack.push_value(b);
            }
            Op::PushNil => self.stack.push_value(Value::Undef),
            Op::PushTrue => self.stack.push_value(Value::Bool(true)),
            Op::PushFalse => self.stack.push_value(Value::Bool(false)),
            Op::PushDbl0 => self.stack.push_value(Value::Num(0.0)),
            Op::PushDbl1 => self.stack.push_value(Value::Num(1.0)),
            Op::PushDbl2 => self.stack.push_value(Value::Num(2.0)),
            Op::PushPi => self.op_push_named_const(std::f64::consts::PI)?,
            Op::PushE => self.op_push_named_const(std::f64::consts::E)?,
            Op::PushI => self.op_push_imaginary()?,
            Op::PopNInts => {
                let n = self.fetch_u8() as usize;
                for _ in 0..n {
                    let _ = self.stack.pop_int();
                }
            }

            // -------- constants --------
            Op::LoadCst | Op::LoadCstAlt2 | Op::LoadCstAlt3 | Op::LoadCstAlt4 => {
                let idx = self.fetch_u8() as usize;
                let v = self.unit.data[idx].clone();
                self.stack.push_value(v);
            }
            Op::Load2Cst => {
                let idx = self.fetch_u8() as usize;
                let a = self.unit.data[idx].clone();
                let b = self.unit.data[idx + 1].clone();
                self.stack.push_value(a);
                self.stack.push_value(b);
            }
            Op::LoadFarCst => {
                let idx = self.fetch_u32() as usize;
                let v = self.unit.data[idx].clone();
                self.stack.push_value(v);
            }
            Op::PushFoldedCst => self.op_push_folded_cst(),
            Op::SetFoldedCst => self.op_set_folded_cst(),

            // -------- binary ops: generic, specialized, const-folded --------
            Op::Mul => self.binop_generic(Op::Mul)?,
            Op::Div => self.binop_generic(Op::Div)?,
            Op::Add => self.binop_generic(Op::Add)?,
            Op::Sub => self.binop_generic(Op::Sub)?,
            Op::Pow => self.binop_generic(Op::Pow)?,
            Op::Le => self.binop_generic(Op::Le)?,
            Op::LeEq => self.binop_generic(Op::LeEq)?,
            Op::Gr => self.binop_generic(Op::Gr)?,
            Op::GrEq => self.binop_generic(Op::GrEq)?,
            Op::Eq => self.binop_generic(Op::Eq)?,
            Op::Neq => self.binop_generic(Op::Neq)?,
            Op::MulDbl => self.binop_dbl(Op::MulDbl)?,
            Op::DivDbl => self.binop_dbl(Op::DivDbl)?,
            Op::AddDbl => self.binop_dbl(Op::AddDbl)?,
            Op::SubDbl => self.binop_dbl(Op::SubDbl)?,
            Op::PowDbl => self.binop_dbl(Op::PowDbl)?,
            Op::LeDbl => self.binop_dbl(Op::LeDbl)?,
            Op::LeEqDbl => self.binop_dbl(Op::LeEqDbl)?,
            Op::GrDbl => self.binop_dbl(Op::GrDbl)?,
            Op::GrEqDbl => self.binop_dbl(Op::GrEqDbl)?,
            Op::EqDbl => self.binop_dbl(Op::EqDbl)?,
            Op::NeqDbl => self.binop_dbl(Op::NeqDbl)?,
            Op::Ldiv | Op::ElMul | Op::ElDiv | Op::ElPow | Op::ElAnd | Op::ElOr | Op::ElLdiv => {
                self.binop_plain(op)?
            }
            Op::MulCst | Op::AddCst | Op::SubCst | Op::DivCst | Op::PowCst | Op::LeCst
            | Op::LeEqCst | Op::GrCst | Op::GrEqCst | Op::EqCst | Op::NeqCst => {
                self.binop_cst_generic(op)?
            }
            Op::MulCstDbl | Op::AddCstDbl | Op::SubCstDbl | Op::DivCstDbl | Op::PowCstDbl
            | Op::LeCstDbl | Op::LeEqCstDbl | Op::GrCstDbl | Op::GrEqCstDbl | Op::EqCstDbl
            | Op::NeqCstDbl => self.binop_cst_dbl(op)?,

            // -------- unary / transpose --------
            Op::Not => self.op_not_generic()?,
            Op::NotDbl => self.op_not_dbl()?,
            Op::NotBool => self.op_not_bool()?,
            Op::USub => self.op_usub_generic()?,
            Op::USubDbl => self.op_usub_dbl()?,
            Op::UAdd => self.op_uadd()?,
            Op::Trans => self.op_transpose(false)?,
            Op::Herm => self.op_transpose(true)?,
            Op::UnaryTrue => self.op_unary_true()?,
            Op::TransMul => self.op_fused_mul(true, false, false)?,
            Op::MulTrans => self.op_fused_mul(false, true, false)?,
            Op::HermMul => self.op_fused_mul(true, false, true)?,
            Op::MulHerm => self.op_fused_mul(false, true, true)?,
            Op::TransLdiv => self.op_fused_ldiv(false)?,
            Op::HermLdiv => self.op_fused_ldiv(true)?,

            // -------- increment / decrement --------
            Op::IncrIdPrefix => self.op_incr_decr_id(1.0, true, false)?,
            Op::DecrIdPrefix => self.op_incr_decr_id(-1.0, true, false)?,
            Op::IncrIdPostfix => self.op_incr_decr_id(1.0, false, false)?,
            Op::DecrIdPostfix => self.op_incr_decr_id(-1.0, false, false)?,
            Op::IncrIdPrefixDbl => self.op_incr_decr_id(1.0, true, true)?,
            Op::DecrIdPrefixDbl => self.op_incr_decr_id(-1.0, true, true)?,
            Op::IncrIdPostfixDbl => self.op_incr_decr_id(1.0, false, true)?,
            Op::DecrIdPostfixDbl => self.op_incr_decr_id(-1.0, false, true)?,
            Op::IncrPrefix => {
                let v = self.stack.pop_value();
                let r = oxmat_builtins::ops::binary_op(
                    oxmat_builtins::ops::BinOp::Add,
                    &v,
                    &Value::Num(1.0),
                )
                .map_err(exec_err)?;
                self.stack.push_value(r);
            }

            // -------- control flow --------
            Op::Jmp => {
                let target = self.fetch_u16() as usize;
                self.ip = target;
            }
            Op::JmpIf => self.op_jmp_cond(true)?,
            Op::JmpIfn => self.op_jmp_cond(false)?,
            Op::JmpIfBool => self.op_jmp_cond_bool(true)?,
            Op::JmpIfnBool => self.op_jmp_cond_bool(false)?,
            Op::JmpIfdef => self.op_jmp_ifdef()?,
            Op::JmpIfnCaseMatch => self.op_case_match()?,
            Op::ForSetup => self.op_for_setup()?,
            Op::ForCond => self.op_for_cond()?,
            Op::ForComplexSetup => self.op_for_complex_setup()?,
            Op::ForComplexCond => self.op_for_complex_cond()?,

            // -------- colon --------
            Op::Colon2 | Op::Colon2Cmd => self.op_colon(false)?,
            Op::Colon3 | Op::Colon3Cmd => self.op_colon(true)?,

            // -------- construction --------
            Op::Matrix => self.op_matrix()?,
            Op::MatrixUneven => self.op_matrix_uneven()?,
            Op::PushCell => self.op_push_cell(false)?,
            Op::PushCellBig => self.op_push_cell(true)?,
            Op::AppendCell => self.op_append_cell()?,

            // -------- slot pushes & identifier indexing --------
            Op::PushSlotNargout0 => self.op_push_slot(0)?,
            Op::PushSlotNargout1 | Op::PushSlotNargout1Special => self.op_push_slot(1)?,
            Op::PushSlotNargoutN => {
                let slot = self.fetch_slot();
                let nargout = self.fetch_u8() as usize;
                self.push_slot_with(slot, nargout)?
            }
            Op::PushSlotNx => {
                let slot = self.fetch_slot();
                let _ = self.fetch_u8();
                let nargout = self.frame_nargout();
                self.push_slot_with(slot, nargout)?
            }
            Op::PushSlotIndexed => {
                let slot = self.fetch_slot();
                let v = self.slot_value(slot);
                self.stack.push_value(v);
            }
            Op::PushSlotDisp => self.op_push_slot_disp()?,
            Op::IndexIdNargout0 => self.op_index_id(0, false)?,
            Op::IndexIdNargout1 => self.op_index_id(1, true)?,
            Op::IndexIdN => {
                let slot = self.fetch_slot();
                let nargout = self.fetch_u8() as usize;
                let nargs = self.fetch_u8() as usize;
                self.index_id_with(slot, nargout, nargs, false)?
            }
            Op::IndexIdNx => {
                let slot = self.fetch_slot();
                let nargs = self.fetch_u8() as usize;
                let nargout = self.frame_nargout();
                self.index_id_with(slot, nargout, nargs, false)?
            }
            Op::IndexId1Mat1d => self.op_index_mat_specialized(1)?,
            Op::IndexId1Mat2d => self.op_index_mat_specialized(2)?,
            Op::IndexId1MathyUfun => self.op_index_mathy_ufun()?,
            Op::IndexCellIdNargout0 => self.op_index_cell_id(0)?,
            Op::IndexCellIdNargout1 => self.op_index_cell_id(1)?,
            Op::IndexCellIdNargoutN => {
                let slot = self.fetch_slot();
                let nargout = self.fetch_u8() as usize;
                let nargs = self.fetch_u8() as usize;
                self.index_cell_id_with(slot, nargout, nargs)?
            }
            Op::IndexCellIdNx => {
                let slot = self.fetch_slot();
                let nargs = self.fetch_u8() as usize;
                let nargout = self.frame_nargout();
                self.index_cell_id_with(slot, nargout, nargs)?
            }
            Op::IndexObj => self.op_index_obj()?,
            Op::IndexStructNargoutN => self.op_index_struct()?,
            Op::IndexStructCall => self.op_index_struct_call()?,
            Op::IndexStructSubcall => self.op_index_struct_subcall()?,
            Op::EndId => self.op_end_id()?,
            Op::EndObj => self.op_end_obj()?,
            Op::EndXN => self.op_end_x_n()?,

            // -------- assignment --------
            Op::Assign => self.op_assign(false)?,
            Op::ForceAssign => self.op_assign(true)?,
            Op::AssignN => self.op_assign_n()?,
            Op::AssignCompound => self.op_assign_compound()?,
            Op::SubassignId => self.op_subassign_id()?,
            Op::SubassignIdMat1d => self.op_subassign_mat_specialized(1)?,
            Op::SubassignIdMat2d => self.op_subassign_mat_specialized(2)?,
            Op::SubassignCellId => self.op_subassign_cell_id()?,
            Op::SubassignStruct => self.op_subassign_struct()?,
            Op::SubassignObj => self.op_subassign_obj()?,
            Op::SubassignChained => self.op_subassign_chained()?,
            Op::BindAns => self.op_bind_ans()?,

            // -------- calls / returns --------
            Op::Ret => {
                if let Some(vals) = self.do_return(false)? {
                    return Ok(Flow::Return(vals));
                }
            }
            Op::RetAnon => {
                if let Some(vals) = self.do_return(true)? {
                    return Ok(Flow::Return(vals));
                }
            }
            Op::ExtNargout => {
                self.arg0_override = Some(self.frame_nargout().min(255) as u8);
            }
            Op::InstallFunction => self.op_install_function()?,
            Op::PushFcnHandle => self.op_push_fcn_handle()?,
            Op::PushAnonFcnHandle => self.op_push_anon_fcn_handle()?,

            // -------- globals --------
            Op::GlobalInit => self.op_global_init()?,

            // -------- output ignore --------
            Op::SetIgnoreOutputs => self.op_set_ignore_outputs()?,
            Op::ClearIgnoreOutputs => self.op_clear_ignore_outputs()?,
            Op::AnonMaybeSetIgnoreOutputs => self.op_anon_maybe_set_ignore()?,

            // -------- scripts / nested frames --------
            Op::EnterScriptFrame => {
                if let Some(f) = self.interp.current_frame_mut() {
                    f.is_script = true;
                }
            }
            Op::ExitScriptFrame => {
                if let Some(f) = self.interp.current_frame_mut() {
                    f.is_script = false;
                }
            }
            Op::EnterNestedFrame => {
                if let Some(f) = self.interp.current_frame_mut() {
                    f.is_closure = true;
                }
            }
            Op::SetSlotToStackDepth => {
                let slot = self.fetch_slot();
                let depth = self.stack.depth_above_base() as f64;
                let idx = self.stack.base + slot;
                self.stack.set_value_at(idx, Value::Num(depth));
            }

            // -------- misc --------
            Op::HandleSignals => self.interp.check_signals()?,
            Op::Debug => {
                log::trace!("DEBUG opcode at {}", self.op_ip);
            }
            Op::Disp => self.op_disp()?,
            Op::Eval => self.op_eval()?,
            Op::ThrowIfErrObj => self.op_throw_iferrobj()?,
            Op::BraindeadPrecondition => self.op_braindead_precond()?,
            Op::BraindeadWarning => self.op_braindead_warning()?,
            Op::Wordcmd => self.op_wordcmd(false)?,
            Op::WordcmdNx => self.op_wordcmd(true)?,

            Op::Wide => unreachable!("Wide handled by the decoder"),
        }
        Ok(Flow::Continue)
    }

    // -------- calls --------

    /// Four-way classification of a value read in call position.
    pub(crate) fn classify_call(v: &Value) -> CallDispatch {
        match v {
            Value::Undef => CallDispatch::FnLookup,
            Value::Handle(h) if h.is_closure() => CallDispatch::NestedHandle,
            Value::Handle(_) => CallDispatch::Call,
            Value::Object(o) if o.0.is_callable() => CallDispatch::Call,
            _ => CallDispatch::Subsref,
        }
    }

    /// Resolve a named handle into a callable definition, caching the
    /// function-table key on the handle where possible.
    pub(crate) fn resolve_handle(&self, h: &FnHandle) -> Option<(Option<usize>, FnDef)> {
        if let Some(key) = h.fn_key {
            if let Some(def) = self.interp.function_by_key(key) {
                return Some((Some(key), def));
            }
        }
        self.interp.resolve(&h.name)
    }

    /// Perform a call. The stack holds `[callee_value, args...]`; the
    /// callee cell is destroyed on return.
    pub(crate) fn perform_call(
        &mut self,
        n_args_on_stack: usize,
        nargout: usize,
        caller_nvalback: usize,
        slot_for_name: Option<usize>,
    ) -> OpResult {
        let callee_pos = self.stack.top - 1 - n_args_on_stack;
        let callee = self.stack.value_at(callee_pos).clone();
        match Self::classify_call(&callee) {
            CallDispatch::Subsref => self.index_value_on_stack(n_args_on_stack, nargout, slot_for_name),
            CallDispatch::FnLookup => {
                let name = match slot_for_name {
                    Some(slot) => self.slot_name(slot),
                    None => {
                        return Err(exec_err("call to an undefined transient value"));
                    }
                };
                match self.interp.resolve(&name) {
                    Some((key, _)) => {
                        let cache = Value::Handle(FnHandle::cache(name, key));
                        // Install the lookup cache in the slot and retry
                        // through the handle path.
                        if let Some(slot) = slot_for_name {
                            if !self.slot_is_ref(slot) {
                                let idx = self.stack.base + slot;
                                self.stack.set_value_at(idx, cache.clone());
                            }
                        }
                        self.stack.set_value_at(callee_pos, cache);
                        self.perform_call(n_args_on_stack, nargout, caller_nvalback, slot_for_name)
                    }
                    None => Err(UnwindReason::IdUndefined(name.into())),
                }
            }
            CallDispatch::Call => match &callee {
                Value::Handle(h) => {
                    let h = h.clone();
                    match self.resolve_handle(&h) {
                        Some((key, FnDef::Unit(unit))) => self.make_bytecode_call(
                            unit,
                            n_args_on_stack,
                            nargout,
                            caller_nvalback,
                            None,
                            key,
                        ),
                        Some((_, FnDef::Builtin(b))) => {
                            self.call_host_fn(b.name, n_args_on_stack, nargout)
                        }
                        None => Err(UnwindReason::IdUndefined(h.name.clone().into())),
                    }
                }
                Value::Object(_) => self.index_value_on_stack(n_args_on_stack, nargout, slot_for_name),
                _ => unreachable!(),
            },
            CallDispatch::NestedHandle => {
                let Value::Handle(h) = callee else { unreachable!() };
                let key = h.fn_key.ok_or_else(|| exec_err("closure without a function body"))?;
                match self.interp.function_by_key(key) {
                    Some(FnDef::Unit(unit)) => self.make_bytecode_call(
                        unit,
                        n_args_on_stack,
                        nargout,
                        caller_nvalback,
                        h.frame.clone(),
                        Some(key),
                    ),
                    _ => Err(exec_err("closure without a compiled body")),
                }
            }
        }
    }

    /// Host-compiled callee: collect args, invoke, push results. The
    /// callee value below the args is destroyed.
    pub(crate) fn call_host_fn(&mut self, name: &str, n_args: usize, nargout: usize) -> OpResult {
        let args = self.pop_args(n_args);
        let _ = self.stack.pop_value();
        let results = self
            .interp
            .call_host(name, &args, nargout)
            .map_err(UnwindReason::Execution)?;
        self.push_results(results, nargout);
        Ok(())
    }

    /// The bytecode calling convention: push the bookkeeping words,
    /// promote the callee's tables, build its frame with cs-list
    /// expansion and varargin packing.
    pub(crate) fn make_bytecode_call(
        &mut self,
        callee: Rc<CompiledUnit>,
        n_args_on_stack: usize,
        nargout: usize,
        caller_nvalback: usize,
        closure: Option<Rc<ClosureFrame>>,
        fn_key: Option<usize>,
    ) -> OpResult {
        let n_locals = callee.n_locals();
        if self.stack.capacity_left() < n_locals + STACK_MIN_FOR_CALL {
            return Err(exec_err("VM is running out of stack space"));
        }

        // Take the args off the caller stack, leaving their cells dead
        // below the bookkeeping words.
        let first_arg = self.stack.top - n_args_on_stack;
        let mut args = Vec::with_capacity(n_args_on_stack);
        for i in 0..n_args_on_stack {
            args.push(self.stack.take_value_at(first_arg + i));
        }
        for i in 0..n_args_on_stack {
            self.stack.clear_at(first_arg + i);
        }
        self.stack.top = first_arg;

        // Bookkeeping words under the callee frame.
        self.stack.push_int(first_arg as i64);
        self.stack.push_unit(self.unit.clone());
        self.stack.push_int(self.stack.base as i64);
        self.stack.push_int(self.ip as i64);
        self.stack.push_int(caller_nvalback as i64);

        let new_base = self.stack.top;
        self.stack.push_int(nargout as i64);

        // Promote the callee's tables into the registers.
        let caller_prof = self
            .metas
            .last()
            .map(|m| m.prof_name.clone())
            .unwrap_or_default();
        let prof_name = callee.profiler_name();
        if let Some(p) = self.interp.profiler.as_mut() {
            p.enter_fn(&prof_name, &caller_prof, &callee);
        }
        self.unit = callee.clone();
        self.ip = HEADER_SIZE;
        self.stack.base = new_base;

        let n_returns = callee.n_returns();
        let n_args_callee = callee.n_args();
        let is_varargin = callee.has_varargin();
        let is_varargout = callee.has_varargout();

        for _ in 1..n_returns {
            self.stack.push_value(Value::Undef);
        }

        // Arguments, with cs-list expansion.
        let mut flat: Vec<Value> = Vec::with_capacity(args.len());
        let mut too_many_expanded = false;
        for a in args {
            match a {
                Value::CsList(l) => {
                    if flat.len() + l.len() > MAX_POSITIONAL_ARGS {
                        too_many_expanded = true;
                    } else {
                        flat.extend(l);
                    }
                }
                other => flat.push(other),
            }
        }
        let n_args_in = flat.len();

        let nargin;
        if !is_varargin {
            let mut it = flat.into_iter();
            let mut pushed = 0;
            for v in it.by_ref().take(n_args_callee) {
                self.stack.push_value(v);
                pushed += 1;
            }
            for _ in pushed..n_args_callee {
                self.stack.push_value(Value::Undef);
            }
            nargin = n_args_in;
        } else {
            let n_named = n_args_callee.saturating_sub(1);
            let mut it = flat.into_iter();
            let mut pushed = 0;
            for v in it.by_ref().take(n_named) {
                self.stack.push_value(v);
                pushed += 1;
            }
            for _ in pushed..n_named {
                self.stack.push_value(Value::Undef);
            }
            let rest: Vec<Value> = it.collect();
            let n_vararg = rest.len();
            let cell = CellArray::new(rest, if n_vararg > 0 { 1 } else { 0 }, n_vararg)
                .map_err(exec_err)?;
            self.stack.push_value(Value::Cell(cell));
            nargin = pushed + n_vararg;
        }

        for _ in 0..n_locals.saturating_sub(n_args_callee + n_returns) {
            self.stack.push_value(Value::Undef);
        }

        self.interp.push_frame(
            callee.display_name(),
            nargin,
            nargout,
            fn_key.unwrap_or(0),
        );
        if closure.is_some() {
            if let Some(f) = self.interp.current_frame_mut() {
                f.is_closure = true;
            }
        }
        if let Some(ig) = self.ignore.as_mut() {
            ig.push_frame(self.interp);
        }

        // Copy captured variables into matching callee slots.
        let is_nested = closure
            .as_ref()
            .map(|_| {
                matches!(
                    self.stack.value_at(first_arg - 1),
                    Value::Handle(FnHandle { kind: HandleKind::Nested, .. })
                )
            })
            .unwrap_or(false);
        if let Some(cf) = &closure {
            // Captures bind pure locals only; argument and return slots
            // belong to this call.
            let n_skip = n_returns + n_args_callee;
            for (name, val) in cf.vars.borrow().iter() {
                if let Some(slot) = callee.names.iter().position(|n| n == name) {
                    if slot == 0 || slot < n_skip {
                        continue;
                    }
                    let idx = self.stack.base + slot;
                    self.stack.set_value_at(idx, val.clone());
                }
            }
        }
        self.metas.push(CallMeta {
            prof_name,
            closure: if is_nested { closure } else { None },
        });

        // Argument/output checks, after the frame exists so the unwinder
        // tears it down uniformly.
        if too_many_expanded {
            return Err(exec_err_id(
                "OxMat:invalid-fun-call",
                format!(
                    "{}: function called with over {MAX_POSITIONAL_ARGS} inputs; consider varargin",
                    callee.unwind.name
                ),
            ));
        }
        if !is_varargin && n_args_in > n_args_callee {
            return Err(exec_err_id(
                "OxMat:invalid-fun-call",
                format!("{}: function called with too many inputs", callee.unwind.name),
            ));
        }
        if !is_varargout && !callee.is_anonymous() && nargout > n_returns.saturating_sub(1) {
            return Err(exec_err_id(
                "OxMat:invalid-fun-call",
                format!("{}: function called with too many outputs", callee.unwind.name),
            ));
        }
        Ok(())
    }

    // -------- return --------

    /// `RET`/`RET_ANON`. `Ok(Some(values))` leaves the VM at the root.
    /// An anonymous function returns the expression values its body left
    /// above the locals; a named function returns its return slots.
    fn do_return(&mut self, anon: bool) -> Result<Option<Vec<Value>>, UnwindReason> {
        if let Some(ig) = self.ignore.as_mut() {
            ig.pop_frame(self.interp);
        }
        if self.ignore.as_ref().is_some_and(|s| s.can_be_dropped()) {
            self.ignore = None;
        }

        let unit = self.unit.clone();
        let n_returns = unit.n_returns();
        let n_locals = unit.n_locals();
        let is_varargout = unit.has_varargout();

        // Copy-out for nested-handle frames, while the locals are live.
        if let Some(meta) = self.metas.last() {
            if let Some(cf) = &meta.closure {
                let mut vars = cf.vars.borrow_mut();
                for (slot, name) in unit.names.iter().enumerate() {
                    if slot > 0 && vars.contains_key(name) {
                        let v = self.stack.value_at(self.stack.base + slot).clone();
                        vars.insert(name.clone(), v);
                    }
                }
            }
        }

        let mut rets: Vec<Value> = Vec::new();
        if anon {
            // The body's final expression left its values above the
            // locals.
            let extra = self.stack.depth_above_base().saturating_sub(n_locals);
            for _ in 0..extra {
                rets.push(self.stack.pop_value());
            }
            rets.reverse();
        }

        debug_assert_eq!(
            self.stack.depth_above_base(),
            n_locals,
            "stack not neutral at return"
        );

        // Destroy args and pure locals, bottom-up.
        let n_dtor = n_locals - n_returns;
        self.stack.destroy(n_dtor);

        if !anon {
            // Collect return values, dereferencing wrappers.
            for i in 1..n_returns {
                let v = match self.stack.value_at(self.stack.base + i) {
                    Value::Ref(_) => self.slot_value(i),
                    v => v.clone(),
                };
                rets.push(v);
            }
            // Varargout: trailing cell expands into additional returns.
            if is_varargout {
                let vararg = rets.pop().unwrap_or(Value::Undef);
                match vararg {
                    Value::Undef => {}
                    Value::Cell(c) => {
                        for v in c.iter_column_major() {
                            rets.push(v.clone());
                        }
                    }
                    _ => {
                        return Err(exec_err("varargout must be a cell array object"));
                    }
                }
            }
        }
        self.stack.destroy(n_returns - 1);

        if let Some(p) = self.interp.profiler.as_mut() {
            p.exit_fn(&unit.profiler_name());
        }

        // Root frame: hand the results to the host.
        if self.stack.base == self.stack.root {
            let _ = self.stack.pop_int(); // %nargout
            let want = self.root_nargout.max(1);
            rets.truncate(want);
            self.metas.pop();
            self.interp.pop_frame();
            debug_assert_eq!(self.interp.frame_depth(), self.frames_at_entry);
            return Ok(Some(rets));
        }

        self.metas.pop();

        let _ = self.stack.pop_int(); // %nargout

        // Restore the caller registers from the bookkeeping words.
        let caller_nvalback = self.stack.pop_int() as usize;
        let caller_ip = self.stack.pop_int() as usize;
        let caller_base = self.stack.pop_int() as usize;
        let caller_unit = self.stack.pop_unit();
        let first_arg = self.stack.pop_int() as usize;

        // Drop the dead argument cells and the callee value below them.
        self.stack.top = first_arg;
        let _ = self.stack.pop_value();

        self.unit = caller_unit;
        self.base_restore(caller_base);
        self.ip = caller_ip;

        // Push results: first return deepest, padded with undefined; a
        // zero-value request still produces one value for `ans`.
        let want = caller_nvalback.max(1);
        let mut it = rets.into_iter();
        for _ in 0..want {
            self.stack.push_value(it.next().unwrap_or(Value::Undef));
        }

        self.interp.pop_frame();
        Ok(None)
    }

    fn base_restore(&mut self, base: usize) {
        self.stack.base = base;
    }

    // -------- unwind --------

    /// Centralized unwinder: record the error, then pop operands, frames
    /// and bookkeeping until a matching region or the root.
    fn unwind(&mut self, reason: UnwindReason) -> Result<(), VmError> {
        let exc = reason.to_exception();
        let only_up = reason.only_unwind_protect();
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "unwinding at ip {} in {}: {}",
                self.op_ip,
                self.unit.unwind.name,
                exc
            );
        }

        loop {
            let unit = self.unit.clone();
            let n_locals = unit.n_locals();

            let region = if reason.matches_no_handler() {
                None
            } else {
                unit.unwind.find_region(self.op_ip, only_up).cloned()
            };

            // Tear the operand stack down to the locals plus whatever
            // depth the region preserves, stripping for-loop counters.
            let target_depth = n_locals + region.as_ref().map(|r| r.stack_depth).unwrap_or(0);
            while self.stack.depth_above_base() > target_depth {
                let current = self.stack.depth_above_base() - n_locals;
                let in_forloop = unit
                    .unwind
                    .find_forloop_region(self.op_ip, current.saturating_sub(3))
                    .is_some();
                if in_forloop
                    && current >= 3
                    && matches!(self.stack.at(self.stack.top - 1), Slot::Int(_))
                    && matches!(self.stack.at(self.stack.top - 2), Slot::Int(_))
                {
                    self.stack.destroy(3);
                } else {
                    self.stack.destroy(1);
                }
            }

            if let Some(region) = region {
                // Resume at the handler with the error-info struct on the
                // stack (popped right away or bound to the catch id).
                debug_assert!(matches!(
                    region.kind,
                    RegionKind::Try | RegionKind::UnwindProtect
                ));
                let mut err = oxmat_builtins::StructValue::new();
                err.set("message", Value::Str(exc.message.clone()));
                err.set("identifier", Value::Str(exc.identifier.clone()));
                let stack_cell = CellArray::new(
                    self.interp
                        .call_stack_names()
                        .into_iter()
                        .map(Value::Str)
                        .collect::<Vec<_>>(),
                    self.interp.frame_depth(),
                    if self.interp.frame_depth() == 0 { 0 } else { 1 },
                )
                .unwrap_or_else(|_| CellArray::empty());
                err.set("stack", Value::Cell(stack_cell));
                self.stack.push_value(Value::Struct(err));
                self.ip = region.target;
                if matches!(reason, UnwindReason::Interrupt) {
                    self.unwinding_interrupt = true;
                }
                return Ok(());
            }

            // No handler in this frame: destroy the locals and leave.
            while self.stack.depth_above_base() > 1 {
                self.stack.destroy(1);
            }
            let _ = self.stack.pop_int(); // %nargout

            if let Some(p) = self.interp.profiler.as_mut() {
                p.exit_fn(&unit.profiler_name());
            }
            self.metas.pop();

            if self.stack.top == self.stack.root {
                // Root reached: restore the host and rethrow.
                while self.interp.frame_depth() > self.frames_at_entry {
                    self.interp.pop_frame();
                }
                if let Some(ig) = self.ignore.take() {
                    drop(ig);
                    self.interp.lvalue_list = None;
                }
                debug_assert!(self.stack.guards_ok());
                return Err(VmError::from_reason(&reason));
            }

            // Pop the bookkeeping words into the registers and continue
            // unwinding in the caller.
            let _caller_nvalback = self.stack.pop_int();
            let caller_ip = self.stack.pop_int() as usize;
            let caller_base = self.stack.pop_int() as usize;
            let caller_unit = self.stack.pop_unit();
            let first_arg = self.stack.pop_int() as usize;

            self.stack.top = first_arg;
            let _ = self.stack.pop_value(); // callee value

            self.unit = caller_unit;
            self.stack.base = caller_base;
            self.ip = caller_ip;
            // Region search in the caller uses the call-site ip.
            self.op_ip = caller_ip.saturating_sub(1);

            self.interp.pop_frame();
            if let Some(ig) = self.ignore.as_mut() {
                ig.pop_frame(self.interp);
            }
            if self.ignore.as_ref().is_some_and(|s| s.can_be_dropped()) {
                self.ignore = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallDispatch {
    /// Ordinary indexed read of a plain value.
    Subsref,
    /// Nil slot: install a function cache and retry.
    FnLookup,
    /// Invoke the held function (named handle, callable object).
    Call,
    /// Invoke a nested or anonymous handle with its captured frame.
    NestedHandle,
}
