//! Matrix and cell construction.

use oxmat_builtins::{CellArray, Tensor, Value};

use crate::error::{exec_err, OpResult};
use crate::stack::Slot;
use crate::vm::VmCore;

/// Numeric view of one matrix-literal element: scalars become 1x1.
fn element_tensor(v: &Value) -> Result<Tensor, String> {
    match v {
        Value::Num(n) => Ok(Tensor::scalar(*n)),
        Value::Bool(b) => Ok(Tensor::scalar(if *b { 1.0 } else { 0.0 })),
        Value::Tensor(t) => Ok(t.clone()),
        Value::Range(r) => Ok(r.to_tensor()),
        Value::Str(s) => Ok(Tensor::row(s.chars().map(|c| c as u32 as f64).collect())),
        other => Err(format!(
            "concatenation operator not implemented for '{}' elements",
            other.class_name()
        )),
    }
}

/// Horizontal concatenation of one literal row, then vertical
/// concatenation of the rows. Empty elements vanish.
fn concat_rows(rows: Vec<Vec<Value>>) -> Result<Value, String> {
    let mut row_tensors: Vec<Tensor> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut parts: Vec<Tensor> = Vec::new();
        for v in row {
            let t = element_tensor(&v)?;
            if t.numel() > 0 {
                parts.push(t);
            }
        }
        if parts.is_empty() {
            continue;
        }
        let height = parts[0].rows();
        let mut width = 0;
        for p in &parts {
            if p.rows() != height {
                return Err("vertical dimensions mismatch in matrix literal".to_string());
            }
            width += p.cols();
        }
        let mut data = vec![0.0; height * width];
        let mut col_off = 0;
        for p in &parts {
            for c in 0..p.cols() {
                for r in 0..height {
                    data[r + (col_off + c) * height] = p.data[r + c * p.rows()];
                }
            }
            col_off += p.cols();
        }
        row_tensors.push(Tensor::new_2d(data, height, width)?);
    }
    if row_tensors.is_empty() {
        return Ok(Value::Tensor(Tensor::empty()));
    }
    let width = row_tensors[0].cols();
    let mut height = 0;
    for rt in &row_tensors {
        if rt.cols() != width {
            return Err("horizontal dimensions mismatch in matrix literal".to_string());
        }
        height += rt.rows();
    }
    let mut data = vec![0.0; height * width];
    let mut row_off = 0;
    for rt in &row_tensors {
        for c in 0..width {
            for r in 0..rt.rows() {
                data[(row_off + r) + c * height] = rt.data[r + c * rt.rows()];
            }
        }
        row_off += rt.rows();
    }
    let out = Tensor::new_2d(data, height, width)?;
    if out.numel() == 1 {
        Ok(Value::Num(out.data[0]))
    } else {
        Ok(Value::Tensor(out))
    }
}

impl<'i> VmCore<'i> {
    /// `MATRIX r c`: r*c elements on the stack, first element deepest,
    /// row-major order.
    pub(crate) fn op_matrix(&mut self) -> OpResult {
        let nrows = self.fetch_u8() as usize;
        let ncols = self.fetch_u8() as usize;
        self.build_matrix(vec![ncols; nrows])
    }

    /// `MATRIX_UNEVEN`: mixed row lengths, or rectangles whose dims
    /// exceed a byte; row lengths are ints in the code stream.
    pub(crate) fn op_matrix_uneven(&mut self) -> OpResult {
        let ty = self.fetch_u8();
        if ty == 1 {
            let rows = self.fetch_u32() as usize;
            let cols = self.fetch_u32() as usize;
            return self.build_matrix(vec![cols; rows]);
        }
        let nrows = self.fetch_u32() as usize;
        let mut row_lengths = Vec::with_capacity(nrows);
        for _ in 0..nrows {
            row_lengths.push(self.fetch_u32() as usize);
        }
        self.build_matrix(row_lengths)
    }

    fn build_matrix(&mut self, row_lengths: Vec<usize>) -> OpResult {
        let total: usize = row_lengths.iter().sum();
        let mut flat = Vec::with_capacity(total);
        for _ in 0..total {
            flat.push(self.stack.pop_value());
        }
        flat.reverse();
        let mut rows = Vec::with_capacity(row_lengths.len());
        let mut it = flat.into_iter();
        for len in row_lengths {
            let mut row = Vec::with_capacity(len);
            // cs-lists spread into their row.
            for _ in 0..len {
                match it.next() {
                    Some(Value::CsList(l)) => row.extend(l),
                    Some(v) => row.push(v),
                    None => {}
                }
            }
            rows.push(row);
        }
        let v = concat_rows(rows).map_err(exec_err)?;
        self.stack.push_value(v);
        Ok(())
    }

    /// `PUSH_CELL rows cols`: initialize the construction triple
    /// `(cell, col counter, row counter)` with a size guess.
    pub(crate) fn op_push_cell(&mut self, big: bool) -> OpResult {
        let (rows, cols) = if big {
            (self.fetch_u32() as usize, self.fetch_u32() as usize)
        } else {
            (self.fetch_u8() as usize, self.fetch_u8() as usize)
        };
        self.stack.push_value(Value::Cell(CellArray::sized(rows, cols)));
        self.stack.push_int(0); // column counter
        self.stack.push_int(0); // row counter
        Ok(())
    }

    /// `APPEND_CELL kind`: insert the top element (spreading cs-lists
    /// into the row). `kind` marks the row-terminal appends:
    /// 1 = middle row, 2 = last row of many, 3 = only row,
    /// 4 = first row of many. Terminal appends enforce that every row
    /// matches the first row's width and resize to actual counts.
    pub(crate) fn op_append_cell(&mut self) -> OpResult {
        let last = self.fetch_u8();

        let element = self.stack.pop_value();
        let i_row = self.stack.pop_int() as usize;
        let mut i_col = self.stack.pop_int() as usize;
        let Value::Cell(mut cell) = self.stack.pop_value() else {
            return Err(exec_err("cell construction state corrupted"));
        };

        let n_rows = cell.rows;
        let mut n_cols = cell.cols;

        match element {
            Value::CsList(l) => {
                let n = l.len();
                // The first row grows to fit cs-list spreads.
                if i_row == 0 && i_col + n > n_cols {
                    cell.resize(n_rows.max(1), i_col + n);
                    n_cols = i_col + n;
                }
                if i_col + n <= n_cols {
                    for (k, v) in l.into_iter().enumerate() {
                        cell.data[i_row * cell.cols + i_col + k] = v;
                    }
                }
                i_col += n;
            }
            v if v.is_defined() => {
                if i_row == 0 && i_col >= n_cols {
                    cell.resize(n_rows.max(1), i_col + 1);
                    n_cols = i_col + 1;
                }
                if i_col < n_cols {
                    cell.data[i_row * cell.cols + i_col] = v;
                }
                i_col += 1;
            }
            // Undefined contributes nothing to the row.
            _ => {}
        }

        let mut next_row = i_row;
        let mut next_col = i_col;
        let mut finished = false;

        match last {
            0 => {}
            1 => {
                // Last element of a middle row.
                if i_col != 0 && i_col != n_cols {
                    // Restore the triple so the unwinder sees a coherent
                    // stack, then raise.
                    self.stack.push_value(Value::Cell(cell));
                    self.stack.push_int(i_col as i64);
                    self.stack.push_int(i_row as i64);
                    return Err(exec_err("number of columns must match"));
                }
                if i_col != 0 {
                    next_row = i_row + 1;
                }
                next_col = 0;
            }
            2 => {
                // Last element of the last row of many.
                if i_col != 0 && i_col != n_cols {
                    self.stack.push_value(Value::Cell(cell));
                    self.stack.push_int(i_col as i64);
                    self.stack.push_int(i_row as i64);
                    return Err(exec_err("number of columns must match"));
                }
                let mut final_rows = i_row;
                if i_col != 0 || n_cols == 0 {
                    final_rows += 1;
                }
                if final_rows != cell.rows {
                    cell.resize(final_rows, n_cols);
                }
                finished = true;
            }
            3 => {
                // Only row: shrink to what was actually inserted. An
                // empty row from a single spread collapses to 0x0; a row
                // of several spreads that all came up empty keeps its
                // row, giving `{b{:}, b{:}}` size 1x0.
                if i_col < n_cols {
                    let rows = if i_col > 0 || n_cols >= 2 { 1 } else { 0 };
                    cell.resize(rows, i_col);
                }
                finished = true;
            }
            4 => {
                // First row of many: its width binds the rest.
                if i_col < n_cols {
                    cell.resize(cell.rows, i_col);
                }
                next_col = 0;
                next_row = i_row + 1;
            }
            other => {
                return Err(exec_err(format!("bad APPEND_CELL terminal kind {other}")));
            }
        }

        self.stack.push_value(Value::Cell(cell));
        if !finished {
            self.stack.push_int(next_col as i64);
            self.stack.push_int(next_row as i64);
            debug_assert!(matches!(
                self.stack.at(self.stack.top - 3),
                Slot::Val(Value::Cell(_))
            ));
        }
        Ok(())
    }
}
