pub mod builder;
pub mod disasm;
pub mod error;
mod exec;
pub mod host;
pub mod ignore;
pub mod opcodes;
pub mod profiler;
pub mod stack;
pub mod unit;
pub mod vm;

pub use builder::{A, Label, UnitBuilder};
pub use disasm::disassemble;
pub use error::{UnwindReason, VmError};
pub use host::{FnDef, Interp};
pub use opcodes::{Op, Operand};
pub use profiler::VmProfiler;
pub use unit::{CompiledUnit, RegionKind, UnwindData, UnwindRegion};
pub use vm::call;

use oxmat_builtins::Value;
use std::rc::Rc;

/// Convenience entry: register a unit and run it with no arguments.
pub fn execute(interp: &mut Interp, unit: CompiledUnit) -> Result<Vec<Value>, VmError> {
    let unit: Rc<CompiledUnit> = unit.into_rc();
    interp.register_unit(unit.clone());
    call(interp, unit, Vec::new(), 0)
}
