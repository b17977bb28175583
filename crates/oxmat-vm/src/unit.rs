//! Compiled unit: the per-function bytecode container.
//!
//! A unit owns its code bytes, literal data, slot-indexed name table and
//! the unwind bundle. The code buffer is a `Cell<u8>` slice because the
//! inline-cache opcodes rewrite their own byte at runtime; the VM is
//! single-threaded so a plain byte store suffices.

use std::cell::Cell;
use std::rc::Rc;

use oxmat_builtins::Value;
use serde::{Deserialize, Serialize};

/// Size of the code header: `{n_returns, n_args, n_locals_lo, n_locals_hi}`.
pub const HEADER_SIZE: usize = 4;

/// `n_returns` value marking an anonymous function.
pub const ANON_MARKER: i8 = -128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Try,
    UnwindProtect,
    ForLoop,
}

/// A code region with unwind semantics. `start`/`end` are code offsets
/// (opcode starts, end exclusive); `stack_depth` is the operand depth
/// above the locals that must survive when the region's handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnwindRegion {
    pub kind: RegionKind,
    pub start: usize,
    pub end: usize,
    pub target: usize,
    pub stack_depth: usize,
}

/// Source attribution for a code range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LocEntry {
    pub ip_start: usize,
    pub ip_end: usize,
    pub line: u32,
    pub col: u32,
}

/// Argument names in effect for a code range, used to name the culprit in
/// index error messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgNameEntry {
    pub ip_start: usize,
    pub ip_end: usize,
    pub arg_names: Vec<String>,
}

/// Maps a local slot to its persistent storage offset within the
/// function's persistent scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PersistentSlot {
    pub slot: u16,
    pub offset: usize,
}

/// Descriptor tying a nested function's slot in the parent frame to the
/// parent slot it captures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NestedClosure {
    pub depth: u32,
    pub parent_slot: u16,
    pub nested_slot: u16,
}

/// The unwind-data bundle attached to every unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnwindData {
    pub name: String,
    pub file: String,
    pub regions: Vec<UnwindRegion>,
    pub locs: Vec<LocEntry>,
    pub arg_names: Vec<ArgNameEntry>,
    pub persistents: Vec<PersistentSlot>,
    pub nested: Vec<NestedClosure>,
}

impl UnwindData {
    /// Innermost region containing `ip`, optionally restricted to
    /// unwind-protect regions (interrupt unwinding).
    pub fn find_region(&self, ip: usize, only_unwind_protect: bool) -> Option<&UnwindRegion> {
        self.regions
            .iter()
            .filter(|r| r.kind != RegionKind::ForLoop)
            .filter(|r| !only_unwind_protect || r.kind == RegionKind::UnwindProtect)
            .filter(|r| r.start <= ip && ip < r.end)
            .min_by_key(|r| r.end - r.start)
    }

    /// For-loop region whose body spans `ip` at exactly `stack_depth`
    /// operands above the locals, if any. The unwinder uses it to strip
    /// the loop's two counter ints.
    pub fn find_forloop_region(&self, ip: usize, stack_depth: usize) -> Option<&UnwindRegion> {
        self.regions
            .iter()
            .filter(|r| r.kind == RegionKind::ForLoop)
            .filter(|r| r.start <= ip && ip < r.end)
            .find(|r| r.stack_depth == stack_depth)
    }

    pub fn loc_for_ip(&self, ip: usize) -> Option<LocEntry> {
        self.locs
            .iter()
            .find(|l| l.ip_start <= ip && ip < l.ip_end)
            .copied()
    }

    pub fn arg_names_for_ip(&self, ip: usize) -> Option<&[String]> {
        self.arg_names
            .iter()
            .find(|a| a.ip_start <= ip && ip < a.ip_end)
            .map(|a| a.arg_names.as_slice())
    }
}

/// A function compiled to bytecode.
///
/// Data entries 0..3 are reserved: display name, kind string and profiler
/// name, in that order.
#[derive(Debug)]
pub struct CompiledUnit {
    code: Box<[Cell<u8>]>,
    pub data: Vec<Value>,
    pub names: Vec<String>,
    pub unwind: UnwindData,
}

impl CompiledUnit {
    pub fn new(code: Vec<u8>, data: Vec<Value>, names: Vec<String>, unwind: UnwindData) -> Result<Self, String> {
        if code.len() < HEADER_SIZE {
            return Err("code shorter than the frame header".to_string());
        }
        if data.len() < 3 {
            return Err("unit data must carry name, kind and profiler name".to_string());
        }
        let code: Box<[Cell<u8>]> = code.into_iter().map(Cell::new).collect();
        Ok(CompiledUnit { code, data, names, unwind })
    }

    pub fn into_rc(self) -> Rc<CompiledUnit> {
        Rc::new(self)
    }

    // -------- code access --------

    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn byte(&self, ip: usize) -> u8 {
        self.code[ip].get()
    }

    /// The self-rewriting store. Single-threaded by construction; the
    /// dispatch loop re-reads the byte on the next visit.
    #[inline]
    pub fn set_byte(&self, ip: usize, b: u8) {
        self.code[ip].set(b);
    }

    pub fn u16_at(&self, ip: usize) -> u16 {
        u16::from_le_bytes([self.byte(ip), self.byte(ip + 1)])
    }

    pub fn u32_at(&self, ip: usize) -> u32 {
        u32::from_le_bytes([
            self.byte(ip),
            self.byte(ip + 1),
            self.byte(ip + 2),
            self.byte(ip + 3),
        ])
    }

    pub fn code_bytes(&self) -> Vec<u8> {
        self.code.iter().map(Cell::get).collect()
    }

    // -------- header --------

    pub fn n_returns_raw(&self) -> i8 {
        self.byte(0) as i8
    }

    pub fn n_args_raw(&self) -> i8 {
        self.byte(1) as i8
    }

    pub fn n_locals(&self) -> usize {
        self.u16_at(2) as usize
    }

    pub fn is_anonymous(&self) -> bool {
        self.n_returns_raw() == ANON_MARKER
    }

    pub fn has_varargout(&self) -> bool {
        self.n_returns_raw() < 0 && !self.is_anonymous()
    }

    pub fn has_varargin(&self) -> bool {
        self.n_args_raw() < 0
    }

    /// Return-slot count including `%nargout`.
    pub fn n_returns(&self) -> usize {
        let raw = self.n_returns_raw();
        if raw == ANON_MARKER {
            1
        } else {
            raw.unsigned_abs() as usize
        }
    }

    /// Declared argument count; for varargin functions this includes the
    /// trailing varargin slot.
    pub fn n_args(&self) -> usize {
        self.n_args_raw().unsigned_abs() as usize
    }

    // -------- reserved data entries --------

    pub fn display_name(&self) -> String {
        match &self.data[0] {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn kind(&self) -> String {
        match &self.data[1] {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn profiler_name(&self) -> String {
        match &self.data[2] {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn slot_name(&self, slot: usize) -> &str {
        self.names.get(slot).map(String::as_str).unwrap_or("<bad slot>")
    }
}
