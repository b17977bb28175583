//! Typed binary/unary operator dispatch for `Value`.
//!
//! The VM routes all arithmetic through `binary_op`/`unary_op`. The
//! specialized scalar-double opcode handlers bypass them with the function
//! pointers from `lookup_binary_dbl`/`lookup_unary_dbl`, which is the same
//! split the interpreter core uses for its inline caches.

use num_complex::Complex64;

use crate::{Range, Tensor, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Ldiv,
    Pow,
    ElMul,
    ElDiv,
    ElLdiv,
    ElPow,
    ElAnd,
    ElOr,
    Le,
    LeEq,
    Gr,
    GrEq,
    Eq,
    Neq,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Ldiv => "\\",
            BinOp::Pow => "^",
            BinOp::ElMul => ".*",
            BinOp::ElDiv => "./",
            BinOp::ElLdiv => ".\\",
            BinOp::ElPow => ".^",
            BinOp::ElAnd => "&",
            BinOp::ElOr => "|",
            BinOp::Le => "<",
            BinOp::LeEq => "<=",
            BinOp::Gr => ">",
            BinOp::GrEq => ">=",
            BinOp::Eq => "==",
            BinOp::Neq => "!=",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Le | BinOp::LeEq | BinOp::Gr | BinOp::GrEq | BinOp::Eq | BinOp::Neq
        )
    }

    /// The compound-assignment opcode encodes its operator as a byte.
    pub fn from_compound_code(code: u8) -> Option<BinOp> {
        Some(match code {
            0 => BinOp::Add,
            1 => BinOp::Sub,
            2 => BinOp::Mul,
            3 => BinOp::Div,
            4 => BinOp::Pow,
            5 => BinOp::ElMul,
            6 => BinOp::ElDiv,
            7 => BinOp::ElPow,
            8 => BinOp::Ldiv,
            9 => BinOp::ElLdiv,
            10 => BinOp::ElAnd,
            11 => BinOp::ElOr,
            _ => return None,
        })
    }

    pub fn to_compound_code(&self) -> Option<u8> {
        Some(match self {
            BinOp::Add => 0,
            BinOp::Sub => 1,
            BinOp::Mul => 2,
            BinOp::Div => 3,
            BinOp::Pow => 4,
            BinOp::ElMul => 5,
            BinOp::ElDiv => 6,
            BinOp::ElPow => 7,
            BinOp::Ldiv => 8,
            BinOp::ElLdiv => 9,
            BinOp::ElAnd => 10,
            BinOp::ElOr => 11,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Not,
    UMinus,
    UPlus,
    Trans,
    Herm,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Not => "!",
            UnOp::UMinus => "-",
            UnOp::UPlus => "+",
            UnOp::Trans => ".'",
            UnOp::Herm => "'",
        }
    }
}

fn scalar_fn(op: BinOp) -> fn(f64, f64) -> Value {
    match op {
        BinOp::Add => |a, b| Value::Num(a + b),
        BinOp::Sub => |a, b| Value::Num(a - b),
        BinOp::Mul | BinOp::ElMul => |a, b| Value::Num(a * b),
        BinOp::Div | BinOp::ElDiv => |a, b| Value::Num(a / b),
        BinOp::Ldiv | BinOp::ElLdiv => |a, b| Value::Num(b / a),
        BinOp::Pow | BinOp::ElPow => |a, b| Value::Num(a.powf(b)),
        BinOp::ElAnd => |a, b| Value::Bool(a != 0.0 && b != 0.0),
        BinOp::ElOr => |a, b| Value::Bool(a != 0.0 || b != 0.0),
        BinOp::Le => |a, b| Value::Bool(a < b),
        BinOp::LeEq => |a, b| Value::Bool(a <= b),
        BinOp::Gr => |a, b| Value::Bool(a > b),
        BinOp::GrEq => |a, b| Value::Bool(a >= b),
        BinOp::Eq => |a, b| Value::Bool(a == b),
        BinOp::Neq => |a, b| Value::Bool(a != b),
    }
}

fn scalar_dbl(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul | BinOp::ElMul => a * b,
        BinOp::Div | BinOp::ElDiv => a / b,
        BinOp::Ldiv | BinOp::ElLdiv => b / a,
        BinOp::Pow | BinOp::ElPow => a.powf(b),
        BinOp::ElAnd => ((a != 0.0) && (b != 0.0)) as i32 as f64,
        BinOp::ElOr => ((a != 0.0) || (b != 0.0)) as i32 as f64,
        BinOp::Le => (a < b) as i32 as f64,
        BinOp::LeEq => (a <= b) as i32 as f64,
        BinOp::Gr => (a > b) as i32 as f64,
        BinOp::GrEq => (a >= b) as i32 as f64,
        BinOp::Eq => (a == b) as i32 as f64,
        BinOp::Neq => (a != b) as i32 as f64,
    }
}

/// Specialized scalar-double function for an operator. The inline-cache
/// opcode handlers call this pointer directly, skipping `binary_op`.
pub fn lookup_binary_dbl(op: BinOp) -> fn(f64, f64) -> Value {
    scalar_fn(op)
}

/// Scalar view of a value, for operator purposes.
fn as_scalar(v: &Value) -> Option<f64> {
    match v {
        Value::Num(n) => Some(*n),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Tensor(t) if t.numel() == 1 => Some(t.data[0]),
        Value::Range(r) if r.numel() == 1 => Some(r.base),
        _ => None,
    }
}

fn as_complex(v: &Value) -> Option<Complex64> {
    match v {
        Value::Complex(c) => Some(*c),
        _ => as_scalar(v).map(|re| Complex64::new(re, 0.0)),
    }
}

/// Tensor view of a value; chars coerce to their code points, ranges
/// materialize.
fn as_tensor(v: &Value) -> Option<Tensor> {
    match v {
        Value::Tensor(t) => Some(t.clone()),
        Value::Range(r) => Some(r.to_tensor()),
        Value::Num(n) => Some(Tensor::scalar(*n)),
        Value::Bool(b) => Some(Tensor::scalar(if *b { 1.0 } else { 0.0 })),
        Value::Str(s) => Some(Tensor::row(s.chars().map(|c| c as u32 as f64).collect())),
        _ => None,
    }
}

fn complex_binary(op: BinOp, a: Complex64, b: Complex64) -> Result<Value, String> {
    let v = match op {
        BinOp::Add => Value::Complex(a + b),
        BinOp::Sub => Value::Complex(a - b),
        BinOp::Mul | BinOp::ElMul => Value::Complex(a * b),
        BinOp::Div | BinOp::ElDiv => Value::Complex(a / b),
        BinOp::Ldiv | BinOp::ElLdiv => Value::Complex(b / a),
        BinOp::Pow | BinOp::ElPow => Value::Complex(a.powc(b)),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Neq => Value::Bool(a != b),
        other => {
            return Err(format!(
                "binary operator '{}' not implemented for complex operands",
                other.symbol()
            ))
        }
    };
    // Collapse back to a real scalar when the imaginary part vanished.
    Ok(match v {
        Value::Complex(c) if c.im == 0.0 => Value::Num(c.re),
        other => other,
    })
}

/// Elementwise apply with implicit expansion: dimensions must match or be
/// one on either side.
fn broadcast_elementwise(op: BinOp, a: &Tensor, b: &Tensor) -> Result<Value, String> {
    let (ar, ac) = (a.rows(), a.cols());
    let (br, bc) = (b.rows(), b.cols());
    let rows = if ar == br || br == 1 {
        ar
    } else if ar == 1 {
        br
    } else {
        return Err(format!(
            "operator {}: nonconformant arguments (op1 is {}x{}, op2 is {}x{})",
            op.symbol(),
            ar,
            ac,
            br,
            bc
        ));
    };
    let cols = if ac == bc || bc == 1 {
        ac
    } else if ac == 1 {
        bc
    } else {
        return Err(format!(
            "operator {}: nonconformant arguments (op1 is {}x{}, op2 is {}x{})",
            op.symbol(),
            ar,
            ac,
            br,
            bc
        ));
    };
    let mut data = vec![0.0; rows * cols];
    for c in 0..cols {
        for r in 0..rows {
            let (air, aic) = (if ar == 1 { 0 } else { r }, if ac == 1 { 0 } else { c });
            let (bir, bic) = (if br == 1 { 0 } else { r }, if bc == 1 { 0 } else { c });
            data[r + c * rows] = scalar_dbl(op, a.data[air + aic * ar], b.data[bir + bic * br]);
        }
    }
    Ok(Value::Tensor(Tensor::new_2d(data, rows, cols)?))
}

fn matmul(a: &Tensor, b: &Tensor) -> Result<Value, String> {
    let (ar, ac) = (a.rows(), a.cols());
    let (br, bc) = (b.rows(), b.cols());
    if ac != br {
        return Err(format!(
            "operator *: nonconformant arguments (op1 is {ar}x{ac}, op2 is {br}x{bc})"
        ));
    }
    let mut data = vec![0.0; ar * bc];
    for j in 0..bc {
        for k in 0..ac {
            let bkj = b.data[k + j * br];
            if bkj == 0.0 {
                continue;
            }
            for i in 0..ar {
                data[i + j * ar] += a.data[i + k * ar] * bkj;
            }
        }
    }
    let out = Tensor::new_2d(data, ar, bc)?;
    if out.numel() == 1 {
        Ok(Value::Num(out.data[0]))
    } else {
        Ok(Value::Tensor(out))
    }
}

/// Generic typed binary dispatch.
pub fn binary_op(op: BinOp, a: &Value, b: &Value) -> Result<Value, String> {
    // Scalar fast path.
    if let (Some(x), Some(y)) = (as_scalar(a), as_scalar(b)) {
        return Ok(scalar_fn(op)(x, y));
    }
    // Complex scalars.
    if matches!(a, Value::Complex(_)) || matches!(b, Value::Complex(_)) {
        if let (Some(x), Some(y)) = (as_complex(a), as_complex(b)) {
            return complex_binary(op, x, y);
        }
    }
    // String equality sugar: 'abc' == 'abc' compares per element, but
    // equal-length comparison of identical strings is the common case.
    let (ta, tb) = match (as_tensor(a), as_tensor(b)) {
        (Some(ta), Some(tb)) => (ta, tb),
        _ => {
            return Err(format!(
                "binary operator '{}' not implemented for '{}' by '{}' operations",
                op.symbol(),
                a.class_name(),
                b.class_name()
            ))
        }
    };
    match op {
        BinOp::Mul => {
            if ta.numel() == 1 || tb.numel() == 1 {
                broadcast_elementwise(BinOp::ElMul, &ta, &tb)
            } else {
                matmul(&ta, &tb)
            }
        }
        BinOp::Div => {
            if tb.numel() == 1 {
                broadcast_elementwise(BinOp::ElDiv, &ta, &tb)
            } else {
                Err("operator /: matrix right division is not supported here".to_string())
            }
        }
        BinOp::Ldiv => {
            if ta.numel() == 1 {
                broadcast_elementwise(BinOp::ElLdiv, &ta, &tb)
            } else {
                Err("operator \\: matrix left division is not supported here".to_string())
            }
        }
        BinOp::Pow => {
            if ta.numel() == 1 || tb.numel() == 1 {
                broadcast_elementwise(BinOp::ElPow, &ta, &tb)
            } else {
                Err("operator ^: matrix power is not supported here".to_string())
            }
        }
        other => broadcast_elementwise(other, &ta, &tb),
    }
}

/// Generic unary dispatch.
pub fn unary_op(op: UnOp, a: &Value) -> Result<Value, String> {
    match op {
        UnOp::Not => match a {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            Value::Num(n) => Ok(Value::Bool(*n == 0.0)),
            Value::Tensor(t) => {
                let data = t.data.iter().map(|&v| (v == 0.0) as i32 as f64).collect();
                Ok(Value::Tensor(Tensor::new(data, t.shape.clone())?))
            }
            other => Err(format!(
                "unary operator '!' not implemented for '{}' values",
                other.class_name()
            )),
        },
        UnOp::UMinus => match a {
            Value::Num(n) => Ok(Value::Num(-n)),
            Value::Bool(b) => Ok(Value::Num(if *b { -1.0 } else { 0.0 })),
            Value::Complex(c) => Ok(Value::Complex(-c)),
            Value::Tensor(t) => {
                let data = t.data.iter().map(|&v| -v).collect();
                Ok(Value::Tensor(Tensor::new(data, t.shape.clone())?))
            }
            Value::Range(r) => Ok(Value::Range(Range::new(-r.base, -r.step, -r.limit))),
            other => Err(format!(
                "unary operator '-' not implemented for '{}' values",
                other.class_name()
            )),
        },
        UnOp::UPlus => match a {
            Value::Num(_) | Value::Complex(_) | Value::Tensor(_) | Value::Range(_) => {
                Ok(a.clone())
            }
            Value::Bool(b) => Ok(Value::Num(if *b { 1.0 } else { 0.0 })),
            other => Err(format!(
                "unary operator '+' not implemented for '{}' values",
                other.class_name()
            )),
        },
        UnOp::Trans | UnOp::Herm => match a {
            Value::Num(_) | Value::Bool(_) => Ok(a.clone()),
            Value::Complex(c) => {
                if op == UnOp::Herm {
                    Ok(Value::Complex(c.conj()))
                } else {
                    Ok(a.clone())
                }
            }
            Value::Tensor(t) => Ok(Value::Tensor(t.transpose())),
            Value::Range(r) => Ok(Value::Tensor(r.to_tensor().transpose())),
            other => Err(format!(
                "transpose not implemented for '{}' values",
                other.class_name()
            )),
        },
    }
}

/// Colon expression `base:limit` or `base:step:limit`.
pub fn colon_op(base: &Value, step: Option<&Value>, limit: &Value) -> Result<Value, String> {
    let b = as_scalar(base).ok_or_else(|| "colon arguments must be scalars".to_string())?;
    let l = as_scalar(limit).ok_or_else(|| "colon arguments must be scalars".to_string())?;
    let s = match step {
        Some(v) => as_scalar(v).ok_or_else(|| "colon arguments must be scalars".to_string())?,
        None => 1.0,
    };
    if s == 0.0 || s.is_nan() {
        return Ok(Value::Tensor(Tensor::new_2d(Vec::new(), 1, 0)?));
    }
    Ok(Value::Range(Range::new(b, s, l)))
}

/// Structural equality for `switch`/`case` label matching.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Str(_), _) | (_, Value::Str(_)) => false,
        _ => match (as_scalar(a), as_scalar(b)) {
            (Some(x), Some(y)) => x == y,
            _ => match (as_tensor(a), as_tensor(b)) {
                (Some(ta), Some(tb)) => ta.shape == tb.shape && ta.data == tb.data,
                _ => false,
            },
        },
    }
}
