pub use inventory;
use std::cell::RefCell;
use std::convert::TryFrom;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use num_complex::Complex64;

pub mod index;
pub mod ops;
mod tensor;

pub use tensor::{Range, Tensor};

/// The dynamically typed value exchanged on the VM operand stack.
///
/// The hot-path types are inline variants; everything the VM does not
/// understand natively lives behind the `Object` trait object and is only
/// reached through `subsref`/`subsasgn`/call forwarding.
#[derive(Debug, Clone)]
pub enum Value {
    /// Undefined. Also doubles as the "nil" initial state of a slot.
    Undef,
    Num(f64),
    Bool(bool),
    Complex(Complex64),
    /// Single-quoted char row.
    Str(String),
    Tensor(Tensor),
    /// Lazy `base:step:limit`. Collapsed to a tensor when stored.
    Range(Range),
    Cell(CellArray),
    Struct(StructValue),
    Handle(FnHandle),
    /// Transient comma-separated list, e.g. produced by `c{:}`.
    /// Never stored in a named slot.
    CsList(Vec<Value>),
    /// Global/persistent reference wrapper living in a variable slot.
    Ref(RefSlot),
    /// The ':' argument token.
    MagicColon,
    Exception(MException),
    Object(OpaqueObject),
}

/// Fieldless mirror of `Value`, used as the inline-cache key by the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Undef,
    Num,
    Bool,
    Complex,
    Str,
    Tensor,
    Range,
    Cell,
    Struct,
    Handle,
    CsList,
    Ref,
    MagicColon,
    Exception,
    Object,
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Undef => Tag::Undef,
            Value::Num(_) => Tag::Num,
            Value::Bool(_) => Tag::Bool,
            Value::Complex(_) => Tag::Complex,
            Value::Str(_) => Tag::Str,
            Value::Tensor(_) => Tag::Tensor,
            Value::Range(_) => Tag::Range,
            Value::Cell(_) => Tag::Cell,
            Value::Struct(_) => Tag::Struct,
            Value::Handle(_) => Tag::Handle,
            Value::CsList(_) => Tag::CsList,
            Value::Ref(_) => Tag::Ref,
            Value::MagicColon => Tag::MagicColon,
            Value::Exception(_) => Tag::Exception,
            Value::Object(_) => Tag::Object,
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Value::Undef)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    pub fn is_cs_list(&self) -> bool {
        matches!(self, Value::CsList(_))
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }

    pub fn is_magic_colon(&self) -> bool {
        matches!(self, Value::MagicColon)
    }

    pub fn is_scalar_type(&self) -> bool {
        matches!(
            self,
            Value::Num(_) | Value::Bool(_) | Value::Complex(_)
        )
    }

    /// True if this value could name a function when read in expression
    /// position: an undefined slot or an installed function cache.
    pub fn is_maybe_function(&self) -> bool {
        match self {
            Value::Undef => true,
            Value::Handle(h) => h.is_cache,
            _ => false,
        }
    }

    /// Number of elements, following array-language conventions.
    pub fn numel(&self) -> usize {
        match self {
            Value::Undef => 0,
            Value::Num(_) | Value::Bool(_) | Value::Complex(_) => 1,
            Value::Str(s) => s.chars().count(),
            Value::Tensor(t) => t.numel(),
            Value::Range(r) => r.numel(),
            Value::Cell(c) => c.data.len(),
            Value::Struct(_) => 1,
            Value::Handle(_) => 1,
            Value::CsList(l) => l.len(),
            Value::Ref(_) => 1,
            Value::MagicColon => 1,
            Value::Exception(_) => 1,
            Value::Object(_) => 1,
        }
    }

    /// Truth value of a condition. Empty values are false; arrays are true
    /// iff every element is nonzero.
    pub fn is_true(&self) -> Result<bool, String> {
        match self {
            Value::Undef => Err("undefined value used in conditional expression".to_string()),
            Value::Num(n) => Ok(*n != 0.0),
            Value::Bool(b) => Ok(*b),
            Value::Complex(c) => Ok(c.re != 0.0 || c.im != 0.0),
            Value::Str(s) => Ok(!s.is_empty() && s.chars().all(|c| c != '\0')),
            Value::Tensor(t) => Ok(!t.data.is_empty() && t.data.iter().all(|&v| v != 0.0)),
            Value::Range(r) => {
                let n = r.numel();
                Ok(n != 0 && (0..n).all(|i| r.elem(i) != 0.0))
            }
            Value::CsList(l) => match l.first() {
                Some(v) => v.is_true(),
                None => Err("empty comma-separated list used in conditional expression".to_string()),
            },
            other => Err(format!(
                "value of class {} cannot be converted to a logical value",
                other.class_name()
            )),
        }
    }

    pub fn class_name(&self) -> &str {
        match self {
            Value::Undef => "undefined",
            Value::Num(_) | Value::Tensor(_) | Value::Range(_) => "double",
            Value::Bool(_) => "logical",
            Value::Complex(_) => "double",
            Value::Str(_) => "char",
            Value::Cell(_) => "cell",
            Value::Struct(_) => "struct",
            Value::Handle(_) => "function_handle",
            Value::CsList(_) => "cs-list",
            Value::Ref(_) => "reference",
            Value::MagicColon => "magic-colon",
            Value::Exception(_) => "MException",
            Value::Object(o) => o.0.type_name(),
        }
    }

    /// Collapse lazy representations before a value is stored in a slot.
    /// Ranges are materialized; everything else stores as-is.
    pub fn needs_storable_call(&self) -> bool {
        matches!(self, Value::Range(_))
    }

    pub fn make_storable(self) -> Value {
        match self {
            Value::Range(r) => Value::Tensor(r.to_tensor()),
            other => other,
        }
    }

    /// Scalar double extraction for index arithmetic and counters.
    pub fn double(&self) -> Result<f64, String> {
        f64::try_from(self)
    }
}

// From implementations for Value
impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Num(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

// TryFrom implementations for extracting native types
impl TryFrom<&Value> for f64 {
    type Error = String;
    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Num(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Tensor(t) if t.numel() == 1 => Ok(t.data[0]),
            Value::Range(r) if r.numel() == 1 => Ok(r.base),
            _ => Err(format!("cannot convert {v:?} to f64")),
        }
    }
}

impl TryFrom<&Value> for bool {
    type Error = String;
    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Bool(b) => Ok(*b),
            Value::Num(n) => Ok(*n != 0.0),
            _ => Err(format!("cannot convert {v:?} to bool")),
        }
    }
}

impl TryFrom<&Value> for String {
    type Error = String;
    fn try_from(v: &Value) -> Result<Self, Self::Error> {
        match v {
            Value::Str(s) => Ok(s.clone()),
            Value::Num(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(format!("cannot convert {v:?} to String")),
        }
    }
}

// -------- Cell arrays --------

#[derive(Debug, Clone, Default)]
pub struct CellArray {
    /// Row-major storage, `rows * cols` entries.
    pub data: Vec<Value>,
    pub rows: usize,
    pub cols: usize,
}

impl CellArray {
    pub fn new(data: Vec<Value>, rows: usize, cols: usize) -> Result<Self, String> {
        if rows * cols != data.len() {
            return Err(format!(
                "cell data length {} doesn't match dimensions {}x{}",
                data.len(),
                rows,
                cols
            ));
        }
        Ok(CellArray { data, rows, cols })
    }

    pub fn empty() -> Self {
        CellArray { data: Vec::new(), rows: 0, cols: 0 }
    }

    pub fn sized(rows: usize, cols: usize) -> Self {
        CellArray { data: vec![Value::Undef; rows * cols], rows, cols }
    }

    pub fn get(&self, row: usize, col: usize) -> Result<&Value, String> {
        if row >= self.rows || col >= self.cols {
            return Err(format!(
                "cell index ({}, {}) out of bounds for {}x{} cell array",
                row + 1,
                col + 1,
                self.rows,
                self.cols
            ));
        }
        Ok(&self.data[row * self.cols + col])
    }

    pub fn set(&mut self, row: usize, col: usize, v: Value) -> Result<(), String> {
        if row >= self.rows || col >= self.cols {
            return Err(format!(
                "cell index ({}, {}) out of bounds for {}x{} cell array",
                row + 1,
                col + 1,
                self.rows,
                self.cols
            ));
        }
        self.data[row * self.cols + col] = v;
        Ok(())
    }

    /// Grow or shrink to `rows x cols`, preserving existing entries by
    /// position and filling new cells with undefined.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        let mut data = vec![Value::Undef; rows * cols];
        for r in 0..self.rows.min(rows) {
            for c in 0..self.cols.min(cols) {
                data[r * cols + c] = std::mem::replace(
                    &mut self.data[r * self.cols + c],
                    Value::Undef,
                );
            }
        }
        self.data = data;
        self.rows = rows;
        self.cols = cols;
    }

    /// Column-major element order, the order `c{:}` expands in.
    pub fn iter_column_major(&self) -> impl Iterator<Item = &Value> + '_ {
        (0..self.cols).flat_map(move |c| (0..self.rows).map(move |r| &self.data[r * self.cols + c]))
    }
}

// -------- Structs --------

#[derive(Debug, Clone, Default)]
pub struct StructValue {
    /// Insertion-ordered: field order is user-visible in `for` loops
    /// over structs and in display.
    pub fields: IndexMap<String, Value>,
}

impl StructValue {
    pub fn new() -> Self {
        Self { fields: IndexMap::new() }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn set(&mut self, field: &str, v: Value) {
        self.fields.insert(field.to_string(), v);
    }
}

// -------- Function handles --------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// `@foo` or an installed function cache for the name `foo`.
    Named,
    /// Anonymous function with by-value captures.
    Anonymous,
    /// Nested function sharing its parent's access frame.
    Nested,
}

/// Captured scope shared between a closure handle and its host frame.
/// Ownership flows handle -> frame; the VM only ever holds weak
/// back-references so closure cycles cannot leak.
#[derive(Debug, Default)]
pub struct ClosureFrame {
    pub vars: RefCell<IndexMap<String, Value>>,
}

impl ClosureFrame {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }
}

#[derive(Debug, Clone)]
pub struct FnHandle {
    /// Display name; `@<anonymous>` for anonymous handles.
    pub name: String,
    pub kind: HandleKind,
    /// Resolved function-table key, if the lookup already happened.
    pub fn_key: Option<usize>,
    /// Captured access frame for anonymous/nested handles.
    pub frame: Option<Rc<ClosureFrame>>,
    /// True when this handle is an internal lookup cache installed in a
    /// variable slot rather than a user-visible `@` value.
    pub is_cache: bool,
}

impl FnHandle {
    pub fn named(name: impl Into<String>) -> Self {
        FnHandle {
            name: name.into(),
            kind: HandleKind::Named,
            fn_key: None,
            frame: None,
            is_cache: false,
        }
    }

    pub fn cache(name: impl Into<String>, fn_key: Option<usize>) -> Self {
        FnHandle {
            name: name.into(),
            kind: HandleKind::Named,
            fn_key,
            frame: None,
            is_cache: true,
        }
    }

    pub fn anonymous(fn_key: usize, frame: Rc<ClosureFrame>) -> Self {
        FnHandle {
            name: "@<anonymous>".to_string(),
            kind: HandleKind::Anonymous,
            fn_key: Some(fn_key),
            frame: Some(frame),
            is_cache: false,
        }
    }

    pub fn nested(name: impl Into<String>, fn_key: usize, frame: Rc<ClosureFrame>) -> Self {
        FnHandle {
            name: name.into(),
            kind: HandleKind::Nested,
            fn_key: Some(fn_key),
            frame: Some(frame),
            is_cache: false,
        }
    }

    pub fn is_closure(&self) -> bool {
        !matches!(self.kind, HandleKind::Named)
    }
}

// -------- Reference wrappers --------

/// A slot value that forwards reads and writes to interpreter-owned state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSlot {
    Global(String),
    Persistent { scope: usize, offset: usize },
}

impl RefSlot {
    pub fn is_global(&self) -> bool {
        matches!(self, RefSlot::Global(_))
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, RefSlot::Persistent { .. })
    }
}

// -------- Exceptions --------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MException {
    pub identifier: String,
    pub message: String,
    pub stack: Vec<String>,
}

impl MException {
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Split an `"Identifier:part: message"` string the way the runtime's
    /// error() builtin produces them.
    pub fn parse(err: &str) -> Self {
        if let Some(idx) = err.rfind(": ") {
            let (id, msg) = err.split_at(idx);
            if id.contains(':') && !id.contains(' ') {
                return MException::new(id.trim(), msg.trim_start_matches(':').trim());
            }
        }
        MException::new("OxMat:error", err)
    }
}

impl fmt::Display for MException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.identifier.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.identifier, self.message)
        }
    }
}

// -------- Opaque host objects --------

/// Capability surface for values the VM treats as opaque. Mirrors the
/// whitelisted interface the interpreter core relies on; nothing else of
/// the object is visible to the VM.
pub trait OpaqueValue: fmt::Debug {
    fn type_name(&self) -> &str;

    /// Single-level read with selector kind `(`, `{` or `.`.
    fn subsref(&self, kind: char, args: &[Value], nargout: usize) -> Result<Vec<Value>, String>;

    /// Single-level write; returns the updated object value.
    fn subsasgn(&self, kind: char, args: &[Value], rhs: Value) -> Result<Value, String>;

    /// True if applying `(` arguments means "call" rather than "index".
    fn is_callable(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct OpaqueObject(pub Rc<dyn OpaqueValue>);

impl fmt::Debug for OpaqueObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueObject({})", self.0.type_name())
    }
}

// -------- Builtin registry --------

/// A host-compiled function reachable by name from bytecode.
pub struct BuiltinFunction {
    pub name: &'static str,
    pub category: &'static str,
    pub implementation: fn(&[Value], usize) -> Result<Vec<Value>, String>,
}

impl fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinFunction {{ name: {:?} }}", self.name)
    }
}

inventory::collect!(BuiltinFunction);

pub fn builtin_functions() -> Vec<&'static BuiltinFunction> {
    inventory::iter::<BuiltinFunction>().collect()
}

pub fn lookup_builtin(name: &str) -> Option<&'static BuiltinFunction> {
    inventory::iter::<BuiltinFunction>().find(|b| b.name == name)
}

pub fn call_builtin(name: &str, args: &[Value], nargout: usize) -> Result<Vec<Value>, String> {
    match lookup_builtin(name) {
        Some(b) => (b.implementation)(args, nargout),
        None => Err(format!("'{name}' undefined")),
    }
}

// ----------------------
// Display implementations
// ----------------------

pub fn format_number_short_g(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value.is_sign_negative() { "-Inf" } else { "Inf" }.to_string();
    }
    let abs = value.abs();
    if abs == 0.0 {
        return "0".to_string();
    }
    if !(1e-4..1e6).contains(&abs) {
        let s = format!("{value:.5e}");
        if let Some(idx) = s.find('e') {
            let (mut mantissa, exp) = s.split_at(idx);
            if let Some(dot_idx) = mantissa.find('.') {
                let mut end = mantissa.len();
                while end > dot_idx + 1 && mantissa.as_bytes()[end - 1] == b'0' {
                    end -= 1;
                }
                if end > 0 && mantissa.as_bytes()[end - 1] == b'.' {
                    end -= 1;
                }
                mantissa = &mantissa[..end];
            }
            return format!("{mantissa}{exp}");
        }
        return s;
    }
    let exp10 = abs.log10().floor() as i32;
    let decimals = (11 - exp10).clamp(0, 12) as usize;
    let pow = 10f64.powi(decimals as i32);
    let rounded = (value * pow).round() / pow;
    let mut s = format!("{rounded:.decimals$}");
    if let Some(dot) = s.find('.') {
        let mut end = s.len();
        while end > dot + 1 && s.as_bytes()[end - 1] == b'0' {
            end -= 1;
        }
        if end > 0 && s.as_bytes()[end - 1] == b'.' {
            end -= 1;
        }
        s.truncate(end);
    }
    if s.is_empty() || s == "-0" {
        s = "0".to_string();
    }
    s
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undef => write!(f, "<undefined>"),
            Value::Num(n) => write!(f, "{}", format_number_short_g(*n)),
            Value::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            Value::Complex(c) => {
                if c.im >= 0.0 {
                    write!(f, "{} + {}i", format_number_short_g(c.re), format_number_short_g(c.im))
                } else {
                    write!(f, "{} - {}i", format_number_short_g(c.re), format_number_short_g(-c.im))
                }
            }
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Tensor(t) => write!(f, "{t}"),
            Value::Range(r) => write!(f, "{r}"),
            Value::Cell(c) => c.fmt(f),
            Value::Struct(st) => write!(f, "struct(fields={})", st.fields.len()),
            Value::Handle(h) => write!(f, "@{}", h.name.trim_start_matches('@')),
            Value::CsList(l) => write!(f, "<cs-list of {}>", l.len()),
            Value::Ref(RefSlot::Global(name)) => write!(f, "<global {name}>"),
            Value::Ref(RefSlot::Persistent { scope, offset }) => {
                write!(f, "<persistent {scope}:{offset}>")
            }
            Value::MagicColon => write!(f, ":"),
            Value::Exception(e) => write!(f, "{e}"),
            Value::Object(o) => write!(f, "<{}>", o.0.type_name()),
        }
    }
}

impl fmt::Display for CellArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for r in 0..self.rows {
            for c in 0..self.cols {
                if c > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", self.data[r * self.cols + c])?;
            }
            if r + 1 < self.rows {
                write!(f, "; ")?;
            }
        }
        write!(f, "}}")
    }
}
