//! Error tags raised by opcode handlers and the VM boundary error.
//!
//! Handlers never unwind through Rust panics or exceptions; they return
//! an `UnwindReason` which the central unwinder turns into either a
//! handler resume or a `VmError` at the VM boundary.

use oxmat_builtins::MException;
use thiserror::Error;

/// In-band error signal, the tag pushed (conceptually) next to the error
/// payload before jumping to the unwinder.
#[derive(Debug, Clone)]
pub enum UnwindReason {
    /// Ordinary execution error with a wrapped exception.
    Execution(MException),
    /// Use of an undefined identifier; carries the name.
    IdUndefined(Box<str>),
    /// Condition expression was undefined.
    IfUndefined,
    /// Index out of range or wrong shape; carries the wrapped index
    /// exception and the receiver's name when it is a named variable.
    Index {
        exc: MException,
        var: Option<Box<str>>,
    },
    /// Empty cs-list on the rhs of an assignment.
    InvalidNelRhs,
    /// Undefined rhs in an assignment.
    RhsUndef,
    /// User-requested abort. Only unwind-protect regions run.
    Interrupt,
    /// Debugger quit; matches no handler.
    DebugQuit,
    /// Graceful shutdown request.
    Exit(i32),
    /// Out of memory or index-type overflow.
    BadAlloc,
}

impl UnwindReason {
    /// Interrupts only ever run unwind-protect cleanup.
    pub fn only_unwind_protect(&self) -> bool {
        matches!(self, UnwindReason::Interrupt)
    }

    /// Debug-quit matches no handler at all.
    pub fn matches_no_handler(&self) -> bool {
        matches!(self, UnwindReason::DebugQuit | UnwindReason::Exit(_))
    }

    /// The exception recorded into the error system, also the payload of
    /// the struct a `try` handler receives.
    pub fn to_exception(&self) -> MException {
        match self {
            UnwindReason::Execution(e) => e.clone(),
            UnwindReason::IdUndefined(name) => MException::new(
                "OxMat:undefined-function",
                format!("'{name}' undefined"),
            ),
            UnwindReason::IfUndefined => MException::new(
                "OxMat:undefined-function",
                "undefined value used in conditional expression",
            ),
            UnwindReason::Index { exc, var } => match var {
                Some(name) => MException::new(
                    exc.identifier.clone(),
                    format!("{name}({})", exc.message.trim_start_matches("index (")),
                ),
                None => exc.clone(),
            },
            UnwindReason::InvalidNelRhs => MException::new(
                "OxMat:invalid-assignment",
                "invalid number of elements on rhs of assignment",
            ),
            UnwindReason::RhsUndef => MException::new(
                "OxMat:undefined-function",
                "value on right-hand side of assignment is undefined",
            ),
            UnwindReason::Interrupt => MException::new("OxMat:interrupt", "interrupted"),
            UnwindReason::DebugQuit => MException::new("OxMat:debug-quit", "quit debug mode"),
            UnwindReason::Exit(code) => {
                MException::new("OxMat:exit", format!("exit requested with status {code}"))
            }
            UnwindReason::BadAlloc => {
                MException::new("OxMat:bad-alloc", "out of memory or dimension too large")
            }
        }
    }
}

/// What escapes `VmCore::run` when no bytecode-level handler catches.
#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("{0}")]
    Exception(MException),
    #[error("execution interrupted")]
    Interrupted,
    #[error("quit debug mode")]
    DebugQuit,
    #[error("exit requested with status {0}")]
    Exit(i32),
}

impl VmError {
    pub fn from_reason(reason: &UnwindReason) -> VmError {
        match reason {
            UnwindReason::Interrupt => VmError::Interrupted,
            UnwindReason::DebugQuit => VmError::DebugQuit,
            UnwindReason::Exit(code) => VmError::Exit(*code),
            other => VmError::Exception(other.to_exception()),
        }
    }

    pub fn exception(&self) -> Option<&MException> {
        match self {
            VmError::Exception(e) => Some(e),
            _ => None,
        }
    }
}

/// Shorthand used by every handler.
pub type OpResult = Result<(), UnwindReason>;

pub fn exec_err(msg: impl Into<String>) -> UnwindReason {
    UnwindReason::Execution(MException::new("", msg))
}

pub fn exec_err_id(id: &str, msg: impl Into<String>) -> UnwindReason {
    UnwindReason::Execution(MException::new(id, msg))
}

pub fn index_err(msg: impl Into<String>, var: Option<&str>) -> UnwindReason {
    UnwindReason::Index {
        exc: MException::new("OxMat:index-out-of-bounds", msg),
        var: var.map(Box::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_policy() {
        assert!(UnwindReason::Interrupt.only_unwind_protect());
        assert!(!UnwindReason::BadAlloc.only_unwind_protect());
        assert!(UnwindReason::DebugQuit.matches_no_handler());
    }

    #[test]
    fn index_error_names_variable() {
        let r = index_err("index (5): out of bound 4", Some("M"));
        let e = r.to_exception();
        assert!(e.message.starts_with("M(5"), "got {}", e.message);
    }

    #[test]
    fn boundary_conversion() {
        let e = VmError::from_reason(&UnwindReason::IdUndefined("foo".into()));
        assert!(matches!(e, VmError::Exception(_)));
        assert!(matches!(
            VmError::from_reason(&UnwindReason::Interrupt),
            VmError::Interrupted
        ));
    }
}
