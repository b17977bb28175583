//! Interpreter-side state the VM executes against: the function table,
//! global/persistent storage, the dynamic frame stack, signal delivery
//! and the builtin bridge.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use oxmat_builtins::{
    call_builtin, lookup_builtin, BuiltinFunction, CellArray, MException, Tensor, Value,
};

use crate::error::UnwindReason;
use crate::profiler::VmProfiler;
use crate::unit::CompiledUnit;

/// A function reachable by name from bytecode.
#[derive(Clone)]
pub enum FnDef {
    Unit(Rc<CompiledUnit>),
    Builtin(&'static BuiltinFunction),
}

/// One dynamic stack frame, mirroring a bytecode frame for exception
/// bookkeeping and the frame-dependent auto variables.
#[derive(Debug, Default)]
pub struct DynFrame {
    pub name: String,
    pub nargin: usize,
    pub nargout: usize,
    /// 1-based output positions the caller marked as `~`.
    pub ignored: Option<Vec<usize>>,
    pub is_script: bool,
    pub is_closure: bool,
    /// Function-table key, used to address persistent storage.
    pub scope: usize,
}

impl DynFrame {
    fn clear_for_cache(&mut self) {
        self.name.clear();
        self.nargin = 0;
        self.nargout = 0;
        self.ignored = None;
        self.is_script = false;
        self.is_closure = false;
        self.scope = 0;
    }
}

/// The embedding interpreter state. A `VmCore` borrows one of these for
/// the duration of a top-level call.
pub struct Interp {
    functions: Vec<FnDef>,
    by_name: HashMap<String, usize>,
    pub globals: IndexMap<String, Value>,
    pub persistents: HashMap<(usize, usize), Value>,
    pub frames: Vec<DynFrame>,
    interrupt: Arc<AtomicBool>,
    /// Lvalue black-hole flags of the innermost call site, for callees
    /// that ask which outputs are wanted.
    pub lvalue_list: Option<Rc<Vec<bool>>>,
    pub statement_printing: bool,
    /// Captured `disp`/statement output, drained by the embedder.
    pub display_sink: Vec<String>,
    pub profiler: Option<VmProfiler>,
    pub stack_size: usize,
    frame_cache: Vec<DynFrame>,
}

/// Frame records recycled across calls to avoid per-call allocation.
const FRAME_CACHE_LIMIT: usize = 8;

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    pub fn new() -> Self {
        Interp {
            functions: Vec::new(),
            by_name: HashMap::new(),
            globals: IndexMap::new(),
            persistents: HashMap::new(),
            frames: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            lvalue_list: None,
            statement_printing: true,
            display_sink: Vec::new(),
            profiler: None,
            stack_size: 2048,
            frame_cache: Vec::new(),
        }
    }

    // -------- function table --------

    /// Install a compiled unit under its display name. Re-registration
    /// replaces the previous definition, like re-sourcing a file.
    pub fn register_unit(&mut self, unit: Rc<CompiledUnit>) -> usize {
        let name = unit.display_name();
        self.register_unit_as(&name, unit)
    }

    pub fn register_unit_as(&mut self, name: &str, unit: Rc<CompiledUnit>) -> usize {
        if let Some(&key) = self.by_name.get(name) {
            self.functions[key] = FnDef::Unit(unit);
            return key;
        }
        self.functions.push(FnDef::Unit(unit));
        let key = self.functions.len() - 1;
        if !name.is_empty() {
            self.by_name.insert(name.to_string(), key);
        }
        key
    }

    /// Register an anonymous unit reachable only through its key.
    pub fn register_anon_unit(&mut self, unit: Rc<CompiledUnit>) -> usize {
        self.functions.push(FnDef::Unit(unit));
        self.functions.len() - 1
    }

    pub fn function_by_key(&self, key: usize) -> Option<FnDef> {
        self.functions.get(key).cloned()
    }

    pub fn key_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Name lookup: user functions shadow builtins, like the scope
    /// machinery resolves identifiers.
    pub fn resolve(&self, name: &str) -> Option<(Option<usize>, FnDef)> {
        if let Some(&key) = self.by_name.get(name) {
            return Some((Some(key), self.functions[key].clone()));
        }
        lookup_builtin(name).map(|b| (None, FnDef::Builtin(b)))
    }

    /// Clear a variable-shadowed name and (re)install a function, the
    /// `INSTALL_FUNCTION` opcode's backing operation.
    pub fn install_function(&mut self, name: &str, def: FnDef) {
        if let Some(&key) = self.by_name.get(name) {
            self.functions[key] = def;
        } else {
            self.functions.push(def);
            self.by_name.insert(name.to_string(), self.functions.len() - 1);
        }
    }

    // -------- globals / persistents --------

    pub fn global_is_defined(&self, name: &str) -> bool {
        self.globals.get(name).map(Value::is_defined).unwrap_or(false)
    }

    pub fn global_get(&self, name: &str) -> Value {
        self.globals.get(name).cloned().unwrap_or(Value::Undef)
    }

    pub fn global_set(&mut self, name: &str, v: Value) {
        self.globals.insert(name.to_string(), v);
    }

    pub fn persistent_get(&self, scope: usize, offset: usize) -> Value {
        self.persistents
            .get(&(scope, offset))
            .cloned()
            .unwrap_or(Value::Undef)
    }

    pub fn persistent_set(&mut self, scope: usize, offset: usize, v: Value) {
        self.persistents.insert((scope, offset), v);
    }

    pub fn persistent_is_live(&self, scope: usize, offset: usize) -> bool {
        self.persistents.contains_key(&(scope, offset))
    }

    // -------- dynamic frame stack --------

    pub fn push_frame(&mut self, name: String, nargin: usize, nargout: usize, scope: usize) {
        let mut f = self.frame_cache.pop().unwrap_or_default();
        f.name = name;
        f.nargin = nargin;
        f.nargout = nargout;
        f.scope = scope;
        self.frames.push(f);
    }

    pub fn pop_frame(&mut self) {
        if let Some(mut f) = self.frames.pop() {
            if self.frame_cache.len() < FRAME_CACHE_LIMIT && !f.is_closure && !f.is_script {
                f.clear_for_cache();
                self.frame_cache.push(f);
            }
        }
    }

    pub fn current_frame(&self) -> Option<&DynFrame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut DynFrame> {
        self.frames.last_mut()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn call_stack_names(&self) -> Vec<String> {
        self.frames.iter().map(|f| f.name.clone()).collect()
    }

    // -------- signals --------

    /// Handle shared with the embedder's signal handler; setting it makes
    /// the next poll point unwind with an interrupt.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn check_signals(&self) -> Result<(), UnwindReason> {
        if self.interrupt.swap(false, Ordering::Relaxed) {
            Err(UnwindReason::Interrupt)
        } else {
            Ok(())
        }
    }

    // -------- output --------

    pub fn display_line(&mut self, line: String) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("display: {line}");
        }
        self.display_sink.push(line);
    }

    /// The `display` path used by `DISP`: `name = value` or bare value.
    pub fn display_value(&mut self, name: Option<&str>, v: &Value) {
        let line = match name {
            Some(n) => format!("{n} = {v}"),
            None => format!("{v}"),
        };
        self.display_line(line);
    }

    /// Call a host-compiled function. Frame-dependent names are resolved
    /// against the dynamic frame stack here.
    pub fn call_host(
        &mut self,
        name: &str,
        args: &[Value],
        nargout: usize,
    ) -> Result<Vec<Value>, MException> {
        match name {
            "nargin" if args.is_empty() => {
                let n = self.current_frame().map(|f| f.nargin).unwrap_or(0);
                return Ok(vec![Value::Num(n as f64)]);
            }
            "nargout" if args.is_empty() => {
                let n = self.current_frame().map(|f| f.nargout).unwrap_or(0);
                return Ok(vec![Value::Num(n as f64)]);
            }
            // Display routes through the interpreter's sink rather than
            // the registry, like the statement-display opcode.
            "disp" | "display" => {
                if let Some(v) = args.first() {
                    self.display_value(None, v);
                }
                return Ok(Vec::new());
            }
            _ => {}
        }
        call_builtin(name, args, nargout).map_err(|msg| MException::parse(&msg))
    }
}

// -------- core builtins --------

fn scalar_arg(args: &[Value], i: usize, who: &str) -> Result<f64, String> {
    args.get(i)
        .ok_or_else(|| format!("{who}: missing argument {}", i + 1))?
        .double()
        .map_err(|_| format!("{who}: argument {} must be numeric", i + 1))
}

fn builtin_error(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    match args {
        [] => Err("OxMat:error: unspecified error".to_string()),
        [Value::Str(msg)] => {
            if msg.contains(':') && !msg.split(':').next().unwrap_or("").contains(' ') {
                Err(msg.clone())
            } else {
                Err(format!("OxMat:error: {msg}"))
            }
        }
        [Value::Str(id), rest @ ..] if id.contains(':') => {
            let msg: Vec<String> = rest
                .iter()
                .map(|v| String::try_from(v).unwrap_or_else(|_| v.to_string()))
                .collect();
            Err(format!("{id}: {}", msg.join(" ")))
        }
        _ => Err("OxMat:error: invalid call to error".to_string()),
    }
}

fn builtin_size(args: &[Value], nargout: usize) -> Result<Vec<Value>, String> {
    let v = args.first().ok_or("size: missing argument")?;
    let (r, c) = match v {
        Value::Tensor(t) => (t.rows(), t.cols()),
        Value::Cell(c) => (c.rows, c.cols),
        Value::Range(rg) => (1, rg.numel()),
        Value::Str(s) => (1, s.chars().count()),
        Value::Undef => (0, 0),
        _ => (1, 1),
    };
    if nargout >= 2 {
        Ok(vec![Value::Num(r as f64), Value::Num(c as f64)])
    } else if args.len() == 2 {
        let dim = scalar_arg(args, 1, "size")?;
        Ok(vec![Value::Num(if dim <= 1.0 { r as f64 } else { c as f64 })])
    } else {
        Ok(vec![Value::Tensor(Tensor::row(vec![r as f64, c as f64]))])
    }
}

fn builtin_numel(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let v = args.first().ok_or("numel: missing argument")?;
    Ok(vec![Value::Num(v.numel() as f64)])
}

fn builtin_length(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let v = args.first().ok_or("length: missing argument")?;
    let n = match v {
        Value::Tensor(t) => {
            if t.is_empty() {
                0
            } else {
                t.rows().max(t.cols())
            }
        }
        Value::Cell(c) => {
            if c.data.is_empty() {
                0
            } else {
                c.rows.max(c.cols)
            }
        }
        other => other.numel(),
    };
    Ok(vec![Value::Num(n as f64)])
}

fn builtin_isempty(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let v = args.first().ok_or("isempty: missing argument")?;
    Ok(vec![Value::Bool(v.numel() == 0)])
}

fn builtin_class(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let v = args.first().ok_or("class: missing argument")?;
    Ok(vec![Value::Str(v.class_name().to_string())])
}

fn builtin_deal(args: &[Value], nargout: usize) -> Result<Vec<Value>, String> {
    let want = nargout.max(1);
    if args.len() == 1 {
        return Ok(vec![args[0].clone(); want]);
    }
    if args.len() != want {
        return Err("deal: nargin > 1 and nargin != nargout".to_string());
    }
    Ok(args.to_vec())
}

fn builtin_cell(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let (r, c) = match args {
        [] => (0, 0),
        [n] => {
            let n = n.double().map_err(|e| format!("cell: {e}"))? as usize;
            (n, n)
        }
        [r, c, ..] => (
            r.double().map_err(|e| format!("cell: {e}"))? as usize,
            c.double().map_err(|e| format!("cell: {e}"))? as usize,
        ),
    };
    Ok(vec![Value::Cell(CellArray::sized(r, c))])
}

fn builtin_zeros(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let (r, c) = match args {
        [] => (1, 1),
        [_] => {
            let n = scalar_arg(args, 0, "zeros")? as usize;
            (n, n)
        }
        _ => (
            scalar_arg(args, 0, "zeros")? as usize,
            scalar_arg(args, 1, "zeros")? as usize,
        ),
    };
    Ok(vec![Value::Tensor(Tensor::zeros(r, c))])
}

fn builtin_ones(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let (r, c) = match args {
        [] => (1, 1),
        [_] => {
            let n = scalar_arg(args, 0, "ones")? as usize;
            (n, n)
        }
        _ => (
            scalar_arg(args, 0, "ones")? as usize,
            scalar_arg(args, 1, "ones")? as usize,
        ),
    };
    let mut t = Tensor::zeros(r, c);
    t.data.iter_mut().for_each(|v| *v = 1.0);
    Ok(vec![Value::Tensor(t)])
}

fn builtin_strcmp(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    match args {
        [Value::Str(a), Value::Str(b)] => Ok(vec![Value::Bool(a == b)]),
        [_, _] => Ok(vec![Value::Bool(false)]),
        _ => Err("strcmp: needs two arguments".to_string()),
    }
}

fn builtin_getfield(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    match args {
        [base, Value::Str(field)] => {
            oxmat_builtins::index::subsref(
                base,
                oxmat_builtins::index::SubsKind::Dot,
                &[Value::Str(field.clone())],
            )
            .map(|v| vec![v])
        }
        _ => Err("getfield: needs a value and a field name".to_string()),
    }
}

macro_rules! math_ufun {
    ($fname:ident, $name:literal, $f:expr) => {
        fn $fname(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
            let f: fn(f64) -> f64 = $f;
            match args {
                [Value::Num(n)] => Ok(vec![Value::Num(f(*n))]),
                [Value::Bool(b)] => Ok(vec![Value::Num(f(if *b { 1.0 } else { 0.0 }))]),
                [Value::Tensor(t)] => {
                    let data = t.data.iter().map(|&v| f(v)).collect();
                    Ok(vec![Value::Tensor(
                        Tensor::new(data, t.shape.clone())?,
                    )])
                }
                [Value::Range(r)] => {
                    let t = r.to_tensor();
                    let data = t.data.iter().map(|&v| f(v)).collect();
                    Ok(vec![Value::Tensor(Tensor::new(data, t.shape.clone())?)])
                }
                _ => Err(concat!($name, ": wrong type of argument").to_string()),
            }
        }
    };
}

math_ufun!(builtin_abs, "abs", f64::abs);
math_ufun!(builtin_sqrt, "sqrt", f64::sqrt);
math_ufun!(builtin_floor, "floor", f64::floor);
math_ufun!(builtin_ceil, "ceil", f64::ceil);
math_ufun!(builtin_round, "round", f64::round);
math_ufun!(builtin_sin, "sin", f64::sin);
math_ufun!(builtin_cos, "cos", f64::cos);
math_ufun!(builtin_exp, "exp", f64::exp);
math_ufun!(builtin_log, "log", f64::ln);

// Registered so name resolution classifies `disp` as a function; the
// actual output goes through `call_host`'s interception into the sink.
fn builtin_disp(_args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    Ok(Vec::new())
}

// `nargin`/`nargout` read the dynamic frame; `call_host` intercepts them
// before the registry, this entry only makes the names resolvable.
fn builtin_frame_query(_args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    Err("frame query outside a call frame".to_string())
}

fn builtin_mod(args: &[Value], _nargout: usize) -> Result<Vec<Value>, String> {
    let a = scalar_arg(args, 0, "mod")?;
    let b = scalar_arg(args, 1, "mod")?;
    if b == 0.0 {
        return Ok(vec![Value::Num(a)]);
    }
    Ok(vec![Value::Num(a - (a / b).floor() * b)])
}

inventory::submit! { BuiltinFunction { name: "error", category: "core", implementation: builtin_error } }
inventory::submit! { BuiltinFunction { name: "disp", category: "core", implementation: builtin_disp } }
inventory::submit! { BuiltinFunction { name: "display", category: "core", implementation: builtin_disp } }
inventory::submit! { BuiltinFunction { name: "nargin", category: "core", implementation: builtin_frame_query } }
inventory::submit! { BuiltinFunction { name: "nargout", category: "core", implementation: builtin_frame_query } }
inventory::submit! { BuiltinFunction { name: "size", category: "array", implementation: builtin_size } }
inventory::submit! { BuiltinFunction { name: "numel", category: "array", implementation: builtin_numel } }
inventory::submit! { BuiltinFunction { name: "length", category: "array", implementation: builtin_length } }
inventory::submit! { BuiltinFunction { name: "isempty", category: "array", implementation: builtin_isempty } }
inventory::submit! { BuiltinFunction { name: "class", category: "core", implementation: builtin_class } }
inventory::submit! { BuiltinFunction { name: "deal", category: "core", implementation: builtin_deal } }
inventory::submit! { BuiltinFunction { name: "cell", category: "array", implementation: builtin_cell } }
inventory::submit! { BuiltinFunction { name: "zeros", category: "array", implementation: builtin_zeros } }
inventory::submit! { BuiltinFunction { name: "ones", category: "array", implementation: builtin_ones } }
inventory::submit! { BuiltinFunction { name: "strcmp", category: "string", implementation: builtin_strcmp } }
inventory::submit! { BuiltinFunction { name: "getfield", category: "struct", implementation: builtin_getfield } }
inventory::submit! { BuiltinFunction { name: "abs", category: "math", implementation: builtin_abs } }
inventory::submit! { BuiltinFunction { name: "sqrt", category: "math", implementation: builtin_sqrt } }
inventory::submit! { BuiltinFunction { name: "floor", category: "math", implementation: builtin_floor } }
inventory::submit! { BuiltinFunction { name: "ceil", category: "math", implementation: builtin_ceil } }
inventory::submit! { BuiltinFunction { name: "round", category: "math", implementation: builtin_round } }
inventory::submit! { BuiltinFunction { name: "sin", category: "math", implementation: builtin_sin } }
inventory::submit! { BuiltinFunction { name: "cos", category: "math", implementation: builtin_cos } }
inventory::submit! { BuiltinFunction { name: "exp", category: "math", implementation: builtin_exp } }
inventory::submit! { BuiltinFunction { name: "log", category: "math", implementation: builtin_log } }
inventory::submit! { BuiltinFunction { name: "mod", category: "math", implementation: builtin_mod } }
