//! Indexed reads and writes (`subsref`/`subsasgn`) over `Value`.
//!
//! Selectors are the three source forms `(`, `{` and `.`. Arguments are
//! ordinary values: numeric scalars, index vectors, 0/1 masks and the
//! magic-colon token. All user-facing indices are 1-based.

use crate::{CellArray, StructValue, Tensor, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsKind {
    Paren,
    Brace,
    Dot,
}

impl SubsKind {
    pub fn from_char(c: char) -> Option<SubsKind> {
        match c {
            '(' => Some(SubsKind::Paren),
            '{' => Some(SubsKind::Brace),
            '.' => Some(SubsKind::Dot),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            SubsKind::Paren => '(',
            SubsKind::Brace => '{',
            SubsKind::Dot => '.',
        }
    }
}

/// One level of a chained index expression, e.g. the `.b` or `(c)` links
/// of `a.b(c).d`.
#[derive(Debug, Clone)]
pub struct SubsLevel {
    pub kind: SubsKind,
    pub args: Vec<Value>,
}

#[derive(Clone)]
enum Sel {
    Colon,
    Indices(Vec<usize>),
}

/// Resolve one index argument against a dimension length into 1-based
/// indices. A 0/1 vector containing at least one zero and matching the
/// dimension length is treated as a mask.
fn resolve_one(arg: &Value, dim_len: usize) -> Result<Sel, String> {
    match arg {
        Value::MagicColon => Ok(Sel::Colon),
        Value::Num(n) => {
            let i = *n;
            if i < 1.0 || i.fract() != 0.0 {
                return Err(format!("index ({n}): subscripts must be positive integers"));
            }
            Ok(Sel::Indices(vec![i as usize]))
        }
        Value::Bool(b) => {
            if *b {
                Ok(Sel::Indices(vec![1]))
            } else {
                Ok(Sel::Indices(Vec::new()))
            }
        }
        Value::Range(r) => resolve_one(&Value::Tensor(r.to_tensor()), dim_len),
        Value::Tensor(t) => {
            let is_mask = t.numel() == dim_len
                && t.data.iter().all(|&v| v == 0.0 || v == 1.0)
                && t.data.iter().any(|&v| v == 0.0);
            if is_mask {
                let idx = t
                    .data
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v != 0.0)
                    .map(|(i, _)| i + 1)
                    .collect();
                Ok(Sel::Indices(idx))
            } else {
                let mut idx = Vec::with_capacity(t.numel());
                for &v in &t.data {
                    if v < 1.0 || v.fract() != 0.0 {
                        return Err(format!(
                            "index ({v}): subscripts must be positive integers"
                        ));
                    }
                    idx.push(v as usize);
                }
                Ok(Sel::Indices(idx))
            }
        }
        other => Err(format!(
            "subscript indices must be numeric, got {}",
            other.class_name()
        )),
    }
}

fn expand(sel: &Sel, dim_len: usize) -> Vec<usize> {
    match sel {
        Sel::Colon => (1..=dim_len).collect(),
        Sel::Indices(v) => v.clone(),
    }
}

/// Gather out of a tensor for a `(` read. The caller has already expanded
/// cs-lists in `args`.
fn tensor_subsref(t: &Tensor, args: &[Value]) -> Result<Value, String> {
    if args.is_empty() {
        return Ok(Value::Tensor(t.clone()));
    }
    if args.len() == 1 {
        let total = t.numel();
        let idxs = expand(&resolve_one(&args[0], total)?, total);
        for &i in &idxs {
            if i == 0 || i > total {
                return Err(format!("index ({i}): out of bound {total}"));
            }
        }
        if idxs.len() == 1 {
            return Ok(Value::Num(t.data[idxs[0] - 1]));
        }
        let data: Vec<f64> = idxs.iter().map(|&i| t.data[i - 1]).collect();
        // Result orientation follows the base for vector bases.
        let out = if t.rows() == 1 {
            Tensor::row(data)
        } else {
            Tensor::column(data)
        };
        return Ok(Value::Tensor(out));
    }
    // N-D subscript read; trailing singleton dims beyond the tensor's rank.
    let dims = args.len();
    let mut full_shape = t.shape.clone();
    if full_shape.len() < dims {
        full_shape.resize(dims, 1);
    } else if full_shape.len() > dims {
        // Fold trailing dims into the last subscript.
        let folded: usize = full_shape[dims - 1..].iter().product();
        full_shape.truncate(dims - 1);
        full_shape.push(folded);
    }
    let mut per_dim: Vec<Vec<usize>> = Vec::with_capacity(dims);
    for (d, arg) in args.iter().enumerate() {
        let dim_len = full_shape[d];
        let idxs = expand(&resolve_one(arg, dim_len)?, dim_len);
        for &i in &idxs {
            if i == 0 || i > dim_len {
                return Err(format!("out of bound; value {i} out of bound {dim_len}"));
            }
        }
        per_dim.push(idxs);
    }
    let mut strides = vec![0usize; dims];
    let mut acc = 1usize;
    for d in 0..dims {
        strides[d] = acc;
        acc *= full_shape[d];
    }
    let out_dims: Vec<usize> = per_dim.iter().map(|v| v.len()).collect();
    let total_out: usize = out_dims.iter().product();
    let mut out = Vec::with_capacity(total_out);
    if total_out > 0 {
        // Cartesian gather, first dimension fastest (column-major order).
        let mut idx = vec![0usize; dims];
        loop {
            let mut lin = 0usize;
            for d in 0..dims {
                lin += (per_dim[d][idx[d]] - 1) * strides[d];
            }
            out.push(t.data[lin]);
            let mut d = 0usize;
            while d < dims {
                idx[d] += 1;
                if idx[d] < per_dim[d].len() {
                    break;
                }
                idx[d] = 0;
                d += 1;
            }
            if d == dims {
                break;
            }
        }
    }
    if out.len() == 1 {
        return Ok(Value::Num(out[0]));
    }
    let shape = if dims == 2 {
        vec![out_dims[0], out_dims[1]]
    } else {
        out_dims
    };
    Ok(Value::Tensor(Tensor::new(out, shape)?))
}

/// Scatter into a tensor for a `(` write, growing the array as needed.
fn tensor_subsasgn(mut t: Tensor, args: &[Value], rhs: &Value) -> Result<Value, String> {
    let rhs_vals: Vec<f64> = match rhs {
        Value::Num(n) => vec![*n],
        Value::Bool(b) => vec![if *b { 1.0 } else { 0.0 }],
        Value::Tensor(rt) => rt.data.clone(),
        Value::Range(r) => r.to_tensor().data,
        other => {
            return Err(format!(
                "invalid rhs of class {} in indexed assignment",
                other.class_name()
            ))
        }
    };
    if args.len() == 1 {
        let total = t.numel();
        let idxs = expand(&resolve_one(&args[0], total)?, total);
        let max = idxs.iter().copied().max().unwrap_or(0);
        if max > total {
            // Linear growth is only defined for vectors and empties.
            if t.rows() <= 1 {
                t.resize(1, max);
            } else if t.cols() <= 1 {
                t.resize(max, 1);
            } else {
                return Err(format!(
                    "index ({max}): out of bound {total} (matrices may not be grown by linear indexing)"
                ));
            }
        }
        if rhs_vals.len() != 1 && rhs_vals.len() != idxs.len() {
            return Err(format!(
                "=: nonconformant arguments (lhs selects {} elements, rhs has {})",
                idxs.len(),
                rhs_vals.len()
            ));
        }
        for (k, &i) in idxs.iter().enumerate() {
            let v = if rhs_vals.len() == 1 { rhs_vals[0] } else { rhs_vals[k] };
            t.data[i - 1] = v;
        }
        return Ok(Value::Tensor(t));
    }
    if args.len() != 2 {
        return Err("indexed assignment supports one or two subscripts".to_string());
    }
    let sel_r = resolve_one(&args[0], t.rows())?;
    let sel_c = resolve_one(&args[1], t.cols())?;
    let ridx = expand(&sel_r, t.rows());
    let cidx = expand(&sel_c, t.cols());
    let max_r = ridx.iter().copied().max().unwrap_or(0);
    let max_c = cidx.iter().copied().max().unwrap_or(0);
    if max_r > t.rows() || max_c > t.cols() {
        t.resize(t.rows().max(max_r), t.cols().max(max_c));
    }
    let n_sel = ridx.len() * cidx.len();
    if rhs_vals.len() != 1 && rhs_vals.len() != n_sel {
        return Err(format!(
            "=: nonconformant arguments (lhs selects {} elements, rhs has {})",
            n_sel,
            rhs_vals.len()
        ));
    }
    let rows = t.rows();
    let mut k = 0usize;
    for &c in &cidx {
        for &r in &ridx {
            let v = if rhs_vals.len() == 1 { rhs_vals[0] } else { rhs_vals[k] };
            t.data[(r - 1) + (c - 1) * rows] = v;
            k += 1;
        }
    }
    Ok(Value::Tensor(t))
}

fn cell_subsref_paren(c: &CellArray, args: &[Value]) -> Result<Value, String> {
    // `c(i)` selects a sub-cell.
    if args.len() == 1 {
        let total = c.data.len();
        let idxs = expand(&resolve_one(&args[0], total)?, total);
        let mut data = Vec::with_capacity(idxs.len());
        for &i in &idxs {
            if i == 0 || i > total {
                return Err(format!("index ({i}): out of bound {total}"));
            }
            let r = (i - 1) % c.rows.max(1);
            let col = (i - 1) / c.rows.max(1);
            data.push(c.data[r * c.cols + col].clone());
        }
        let n = data.len();
        let out = if c.rows == 1 {
            CellArray::new(data, 1, n)?
        } else {
            CellArray::new(data, n, 1)?
        };
        return Ok(Value::Cell(out));
    }
    if args.len() != 2 {
        return Err("cell selection supports one or two subscripts".to_string());
    }
    let ridx = expand(&resolve_one(&args[0], c.rows)?, c.rows);
    let cidx = expand(&resolve_one(&args[1], c.cols)?, c.cols);
    let mut data = Vec::with_capacity(ridx.len() * cidx.len());
    for &r in &ridx {
        for &cc in &cidx {
            if r == 0 || r > c.rows || cc == 0 || cc > c.cols {
                return Err(format!(
                    "index ({r}, {cc}): out of bound for {}x{} cell array",
                    c.rows, c.cols
                ));
            }
            data.push(c.data[(r - 1) * c.cols + (cc - 1)].clone());
        }
    }
    Ok(Value::Cell(CellArray::new(data, ridx.len(), cidx.len())?))
}

fn cell_subsref_brace(c: &CellArray, args: &[Value]) -> Result<Value, String> {
    // `c{i}` extracts contents; multiple selections become a cs-list in
    // column-major order.
    let selected: Vec<Value> = if args.len() == 1 {
        let total = c.data.len();
        let idxs = expand(&resolve_one(&args[0], total)?, total);
        let mut out = Vec::with_capacity(idxs.len());
        for &i in &idxs {
            if i == 0 || i > total {
                return Err(format!("index ({i}): out of bound {total}"));
            }
            let r = (i - 1) % c.rows.max(1);
            let col = (i - 1) / c.rows.max(1);
            out.push(c.data[r * c.cols + col].clone());
        }
        out
    } else if args.len() == 2 {
        let ridx = expand(&resolve_one(&args[0], c.rows)?, c.rows);
        let cidx = expand(&resolve_one(&args[1], c.cols)?, c.cols);
        let mut out = Vec::with_capacity(ridx.len() * cidx.len());
        for &cc in &cidx {
            for &r in &ridx {
                if r == 0 || r > c.rows || cc == 0 || cc > c.cols {
                    return Err(format!(
                        "index ({r}, {cc}): out of bound for {}x{} cell array",
                        c.rows, c.cols
                    ));
                }
                out.push(c.data[(r - 1) * c.cols + (cc - 1)].clone());
            }
        }
        out
    } else {
        return Err("cell content selection supports one or two subscripts".to_string());
    };
    match selected.len() {
        1 => Ok(selected.into_iter().next().unwrap()),
        _ => Ok(Value::CsList(selected)),
    }
}

fn field_name(args: &[Value]) -> Result<String, String> {
    match args {
        [Value::Str(s)] => Ok(s.clone()),
        _ => Err("dynamic field name must be a string".to_string()),
    }
}

/// Single-level indexed read. Multi-selection brace/dot reads return a
/// cs-list value; the VM expands it at the opcode boundary.
pub fn subsref(base: &Value, kind: SubsKind, args: &[Value]) -> Result<Value, String> {
    match (base, kind) {
        (Value::Tensor(t), SubsKind::Paren) => tensor_subsref(t, args),
        (Value::Range(r), SubsKind::Paren) => tensor_subsref(&r.to_tensor(), args),
        (Value::Num(_) | Value::Bool(_) | Value::Complex(_), SubsKind::Paren) => {
            // Scalars index like 1x1 arrays.
            for a in args {
                match a {
                    Value::MagicColon => {}
                    _ => {
                        let sel = resolve_one(a, 1)?;
                        let idx = expand(&sel, 1);
                        if idx.iter().any(|&i| i != 1) {
                            return Err(format!("index ({}): out of bound 1", idx[0]));
                        }
                    }
                }
            }
            Ok(base.clone())
        }
        (Value::Str(s), SubsKind::Paren) => {
            let chars: Vec<f64> = s.chars().map(|c| c as u32 as f64).collect();
            let t = Tensor::row(chars);
            match tensor_subsref(&t, args)? {
                Value::Num(n) => {
                    let ch = char::from_u32(n as u32).unwrap_or('\u{fffd}');
                    Ok(Value::Str(ch.to_string()))
                }
                Value::Tensor(t) => {
                    let s: String = t
                        .data
                        .iter()
                        .map(|&n| char::from_u32(n as u32).unwrap_or('\u{fffd}'))
                        .collect();
                    Ok(Value::Str(s))
                }
                other => Ok(other),
            }
        }
        (Value::Cell(c), SubsKind::Paren) => cell_subsref_paren(c, args),
        (Value::Cell(c), SubsKind::Brace) => cell_subsref_brace(c, args),
        (Value::Struct(st), SubsKind::Dot) => {
            let name = field_name(args)?;
            match st.get(&name) {
                Some(v) => Ok(v.clone()),
                None => Err(format!("invalid use of undefined field '{name}'")),
            }
        }
        (Value::Struct(_), SubsKind::Paren) => {
            // Scalar structs select themselves for all-ones subscripts.
            for a in args {
                if !matches!(a, Value::MagicColon) {
                    let idx = expand(&resolve_one(a, 1)?, 1);
                    if idx.iter().any(|&i| i != 1) {
                        return Err("struct array indexing is not supported here".to_string());
                    }
                }
            }
            Ok(base.clone())
        }
        (Value::Exception(e), SubsKind::Dot) => {
            let name = field_name(args)?;
            match name.as_str() {
                "identifier" => Ok(Value::Str(e.identifier.clone())),
                "message" => Ok(Value::Str(e.message.clone())),
                "stack" => Ok(Value::Cell(CellArray::new(
                    e.stack.iter().cloned().map(Value::Str).collect(),
                    e.stack.len(),
                    if e.stack.is_empty() { 0 } else { 1 },
                )?)),
                other => Err(format!("invalid use of undefined field '{other}'")),
            }
        }
        (Value::Object(o), kind) => {
            let mut out = o.0.subsref(kind.to_char(), args, 1)?;
            match out.len() {
                0 => Ok(Value::Undef),
                1 => Ok(out.remove(0)),
                _ => Ok(Value::CsList(out)),
            }
        }
        (Value::Undef, _) => Err("indexing an undefined value".to_string()),
        (base, kind) => Err(format!(
            "'{}' undefined near '{}' indexing",
            base.class_name(),
            kind.to_char()
        )),
    }
}

/// Chained indexed read, e.g. `a.b(2).c`. Intermediate cs-lists of
/// length one collapse; longer ones are an error mid-chain.
pub fn subsref_chain(base: &Value, levels: &[SubsLevel]) -> Result<Value, String> {
    let mut cur = base.clone();
    for (i, level) in levels.iter().enumerate() {
        cur = subsref(&cur, level.kind, &level.args)?;
        if let Value::CsList(mut l) = cur {
            if i + 1 == levels.len() {
                return Ok(Value::CsList(l));
            }
            if l.len() != 1 {
                return Err("a cs-list cannot be further indexed".to_string());
            }
            cur = l.remove(0);
        }
    }
    Ok(cur)
}

/// Single-level indexed write. Consumes the base and returns the updated
/// value; undefined bases auto-vivify the container the selector implies.
pub fn subsasgn(base: Value, kind: SubsKind, args: &[Value], rhs: Value) -> Result<Value, String> {
    match (base, kind) {
        (Value::Tensor(t), SubsKind::Paren) => tensor_subsasgn(t, args, &rhs),
        (Value::Num(n), SubsKind::Paren) => {
            tensor_subsasgn(Tensor::scalar(n), args, &rhs)
        }
        (Value::Bool(b), SubsKind::Paren) => {
            tensor_subsasgn(Tensor::scalar(if b { 1.0 } else { 0.0 }), args, &rhs)
        }
        (Value::Range(r), SubsKind::Paren) => tensor_subsasgn(r.to_tensor(), args, &rhs),
        (Value::Undef, SubsKind::Paren) => tensor_subsasgn(Tensor::empty(), args, &rhs),
        (Value::Undef, SubsKind::Brace) => {
            cell_subsasgn_brace(CellArray::empty(), args, rhs)
        }
        (Value::Undef, SubsKind::Dot) => {
            let mut st = StructValue::new();
            st.set(&field_name(args)?, rhs);
            Ok(Value::Struct(st))
        }
        (Value::Cell(c), SubsKind::Brace) => cell_subsasgn_brace(c, args, rhs),
        (Value::Cell(mut c), SubsKind::Paren) => {
            // `c(i) = {..}` splices a sub-cell.
            let rc = match rhs {
                Value::Cell(rc) => rc,
                _ => return Err("conversion to cell from non-cell is not possible".to_string()),
            };
            if args.len() == 1 {
                let total = c.data.len();
                let idxs = expand(&resolve_one(&args[0], total)?, total);
                if idxs.len() != rc.data.len() && rc.data.len() != 1 {
                    return Err("=: nonconformant cell assignment".to_string());
                }
                for (k, &i) in idxs.iter().enumerate() {
                    if i == 0 {
                        return Err(format!("index ({i}): out of bound"));
                    }
                    if i > c.data.len() {
                        if c.rows <= 1 {
                            c.resize(1, i);
                        } else {
                            return Err(format!("index ({i}): out of bound {total}"));
                        }
                    }
                    let r = (i - 1) % c.rows.max(1);
                    let col = (i - 1) / c.rows.max(1);
                    let v = if rc.data.len() == 1 {
                        rc.data[0].clone()
                    } else {
                        rc.data[k].clone()
                    };
                    c.data[r * c.cols + col] = v;
                }
                Ok(Value::Cell(c))
            } else {
                Err("cell paren-assignment supports one subscript".to_string())
            }
        }
        (Value::Struct(mut st), SubsKind::Dot) => {
            st.set(&field_name(args)?, rhs);
            Ok(Value::Struct(st))
        }
        (Value::Object(o), kind) => o.0.subsasgn(kind.to_char(), args, rhs),
        (base, kind) => Err(format!(
            "indexed assignment with '{}' not supported for '{}' values",
            kind.to_char(),
            base.class_name()
        )),
    }
}

fn cell_subsasgn_brace(mut c: CellArray, args: &[Value], rhs: Value) -> Result<Value, String> {
    if args.len() == 1 {
        let total = c.data.len();
        let idxs = expand(&resolve_one(&args[0], total.max(1))?, total);
        if idxs.len() != 1 {
            return Err("{}-assignment needs exactly one target element".to_string());
        }
        let i = idxs[0];
        if i == 0 {
            return Err(format!("index ({i}): out of bound"));
        }
        if i > c.data.len() {
            if c.rows <= 1 {
                c.resize(1, i);
            } else if c.cols <= 1 {
                c.resize(i, 1);
            } else {
                return Err(format!("index ({i}): out of bound {total}"));
            }
        }
        let r = (i - 1) % c.rows.max(1);
        let col = (i - 1) / c.rows.max(1);
        c.data[r * c.cols + col] = rhs;
        return Ok(Value::Cell(c));
    }
    if args.len() != 2 {
        return Err("cell content assignment supports one or two subscripts".to_string());
    }
    let ridx = expand(&resolve_one(&args[0], c.rows.max(1))?, c.rows);
    let cidx = expand(&resolve_one(&args[1], c.cols.max(1))?, c.cols);
    if ridx.len() != 1 || cidx.len() != 1 {
        return Err("{}-assignment needs exactly one target element".to_string());
    }
    let (r, cc) = (ridx[0], cidx[0]);
    if r > c.rows || cc > c.cols {
        c.resize(c.rows.max(r), c.cols.max(cc));
    }
    c.data[(r - 1) * c.cols + (cc - 1)] = rhs;
    Ok(Value::Cell(c))
}

/// Chained indexed write: read down the chain, write at the leaf, store
/// each intermediate back up.
pub fn subsasgn_chain(base: Value, levels: &[SubsLevel], rhs: Value) -> Result<Value, String> {
    match levels {
        [] => Ok(rhs),
        [last] => subsasgn(base, last.kind, &last.args, rhs),
        [first, rest @ ..] => {
            let inner = match subsref(&base, first.kind, &first.args) {
                Ok(Value::CsList(mut l)) if l.len() == 1 => l.remove(0),
                Ok(Value::CsList(_)) => {
                    return Err("a cs-list cannot be further indexed".to_string())
                }
                Ok(v) => v,
                // Auto-vivify missing intermediates.
                Err(_) => Value::Undef,
            };
            let updated = subsasgn_chain(inner, rest, rhs)?;
            subsasgn(base, first.kind, &first.args, updated)
        }
    }
}

/// The value of `end` for subscript `idx` of `n_idx` subscripts.
pub fn end_value(base: &Value, idx: usize, n_idx: usize) -> Result<f64, String> {
    let dims: (usize, usize) = match base {
        Value::Tensor(t) => (t.rows(), t.cols()),
        Value::Range(r) => (1, r.numel()),
        Value::Str(s) => (1, s.chars().count()),
        Value::Cell(c) => (c.rows, c.cols),
        Value::Num(_) | Value::Bool(_) | Value::Complex(_) => (1, 1),
        other => {
            return Err(format!(
                "'end' not defined for '{}' values",
                other.class_name()
            ))
        }
    };
    if n_idx == 1 {
        return Ok((dims.0 * dims.1) as f64);
    }
    // Last subscript folds the remaining dimensions; with 2-D values this
    // reduces to plain row/column counts.
    Ok(match idx {
        0 => dims.0 as f64,
        _ => dims.1 as f64,
    })
}
