//! Shared scaffolding for the integration tests: a frame-aware builder
//! wrapper and run helpers.

use std::collections::HashMap;
use std::rc::Rc;

use oxmat_builtins::Value;
use oxmat_vm::builder::{A, UnitBuilder};
use oxmat_vm::{CompiledUnit, Interp, Op, VmError};

/// A `UnitBuilder` plus the frame-layout bookkeeping the compiler would
/// normally do: slot 0 is `%nargout`, then returns, then arguments, then
/// locals, with an argument sharing a return's slot when names collide.
pub struct Frame {
    pub b: UnitBuilder,
    slots: HashMap<String, u16>,
}

#[allow(dead_code)]
impl Frame {
    pub fn new(name: &str, returns: &[&str], args: &[&str], locals: &[&str]) -> Self {
        let mut b = UnitBuilder::new(name);
        let mut slots = HashMap::new();
        slots.insert("%nargout".to_string(), b.declare_slot("%nargout"));
        for r in returns {
            slots.insert(r.to_string(), b.declare_slot(r));
        }
        for a in args {
            if !slots.contains_key(*a) {
                slots.insert(a.to_string(), b.declare_slot(a));
            }
        }
        for l in locals {
            if !slots.contains_key(*l) {
                slots.insert(l.to_string(), b.declare_slot(l));
            }
        }
        b.set_frame((returns.len() + 1) as i8, args.len() as i8);
        Frame { b, slots }
    }

    pub fn slot(&self, name: &str) -> u32 {
        self.slots[name] as u32
    }

    pub fn slot16(&self, name: &str) -> u16 {
        self.slots[name]
    }

    pub fn op(&mut self, op: Op, args: &[A]) -> &mut Self {
        self.b.emit(op, args).unwrap();
        self
    }

    pub fn load_num(&mut self, n: f64) -> &mut Self {
        self.b.load_const(Value::Num(n)).unwrap();
        self
    }

    pub fn load_str(&mut self, s: &str) -> &mut Self {
        self.b.load_const(Value::Str(s.to_string())).unwrap();
        self
    }

    pub fn load_value(&mut self, v: Value) -> &mut Self {
        self.b.load_const(v).unwrap();
        self
    }

    pub fn load_colon(&mut self) -> &mut Self {
        self.b.load_const(Value::MagicColon).unwrap();
        self
    }

    /// Push a slot's raw value (no command-call dispatch).
    pub fn push_var(&mut self, name: &str) -> &mut Self {
        let s = self.slot(name);
        self.op(Op::PushSlotIndexed, &[A::U(s)])
    }

    pub fn assign(&mut self, name: &str) -> &mut Self {
        let s = self.slot(name);
        self.op(Op::Assign, &[A::U(s)])
    }

    /// `name(args...)` with the argument pushes supplied by `push_args`.
    pub fn call(
        &mut self,
        fname: &str,
        nargs: u32,
        nargout: u32,
        push_args: impl FnOnce(&mut Self),
    ) -> &mut Self {
        self.push_var(fname);
        push_args(self);
        let s = self.slot(fname);
        self.op(Op::IndexIdN, &[A::U(s), A::U(nargout), A::U(nargs)])
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Op::Ret, &[])
    }

    pub fn finish(self) -> CompiledUnit {
        self.b.finish().unwrap()
    }
}

#[allow(dead_code)]
pub fn run(frame: Frame, args: Vec<Value>, nargout: usize) -> Result<Vec<Value>, VmError> {
    let mut interp = Interp::new();
    run_with(&mut interp, frame.finish(), args, nargout).0
}

/// Run a unit in the given interpreter, returning the result and the
/// live unit (for post-run code-byte inspection).
#[allow(dead_code)]
pub fn run_with(
    interp: &mut Interp,
    unit: CompiledUnit,
    args: Vec<Value>,
    nargout: usize,
) -> (Result<Vec<Value>, VmError>, Rc<CompiledUnit>) {
    let rc = unit.into_rc();
    interp.register_unit(rc.clone());
    (oxmat_vm::call(interp, rc.clone(), args, nargout), rc)
}

#[allow(dead_code)]
pub fn num(v: &Value) -> f64 {
    match v {
        Value::Num(n) => *n,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        other => panic!("expected a number, got {other:?}"),
    }
}

/// The decoded opcode at a code offset, for specialization assertions.
#[allow(dead_code)]
pub fn opcode_at(unit: &CompiledUnit, offset: usize) -> Op {
    Op::from_u8(unit.byte(offset)).unwrap()
}

/// Find the first disassembly row whose text starts with `prefix`.
#[allow(dead_code)]
pub fn find_op(unit: &CompiledUnit, prefix: &str) -> Option<(usize, String)> {
    oxmat_vm::disassemble(unit)
        .unwrap()
        .into_iter()
        .find(|(_, t)| t.starts_with(prefix))
}
