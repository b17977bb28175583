use std::fmt;

use crate::format_number_short_g;

/// Dense numeric array. Column-major storage throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub data: Vec<f64>,
    pub shape: Vec<usize>,
    pub rows: usize,
    pub cols: usize,
}

impl Tensor {
    pub fn new(data: Vec<f64>, shape: Vec<usize>) -> Result<Self, String> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(format!(
                "tensor data length {} doesn't match shape {:?} ({} elements)",
                data.len(),
                shape,
                expected
            ));
        }
        let (rows, cols) = if shape.len() >= 2 {
            (shape[0], shape[1])
        } else if shape.len() == 1 {
            (1, shape[0])
        } else {
            (0, 0)
        };
        Ok(Tensor { data, shape, rows, cols })
    }

    pub fn new_2d(data: Vec<f64>, rows: usize, cols: usize) -> Result<Self, String> {
        Self::new(data, vec![rows, cols])
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Tensor {
            data: vec![0.0; rows * cols],
            shape: vec![rows, cols],
            rows,
            cols,
        }
    }

    pub fn scalar(v: f64) -> Self {
        Tensor { data: vec![v], shape: vec![1, 1], rows: 1, cols: 1 }
    }

    pub fn empty() -> Self {
        Tensor { data: Vec::new(), shape: vec![0, 0], rows: 0, cols: 0 }
    }

    pub fn row(data: Vec<f64>) -> Self {
        let n = data.len();
        Tensor { data, shape: vec![1, n], rows: 1, cols: n }
    }

    pub fn column(data: Vec<f64>) -> Self {
        let n = data.len();
        Tensor { data, shape: vec![n, 1], rows: n, cols: 1 }
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    pub fn cols(&self) -> usize {
        self.shape.get(1).copied().unwrap_or(1)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_vector(&self) -> bool {
        self.rows() == 1 || self.cols() == 1
    }

    pub fn is_square(&self) -> bool {
        self.rows() == self.cols()
    }

    /// 0-based checked linear read (column-major order).
    pub fn elem(&self, lin: usize) -> Result<f64, String> {
        self.data
            .get(lin)
            .copied()
            .ok_or_else(|| format!("index ({}): out of bound {}", lin + 1, self.numel()))
    }

    /// 0-based checked 2-D read.
    pub fn get2(&self, row: usize, col: usize) -> Result<f64, String> {
        let rows = self.rows();
        let cols = self.cols();
        if row >= rows || col >= cols {
            return Err(format!(
                "index ({}, {}): out of bound for {}x{} matrix",
                row + 1,
                col + 1,
                rows,
                cols
            ));
        }
        Ok(self.data[row + col * rows])
    }

    /// 0-based checked 2-D write.
    pub fn set2(&mut self, row: usize, col: usize, value: f64) -> Result<(), String> {
        let rows = self.rows();
        let cols = self.cols();
        if row >= rows || col >= cols {
            return Err(format!(
                "index ({}, {}): out of bound for {}x{} matrix",
                row + 1,
                col + 1,
                rows,
                cols
            ));
        }
        self.data[row + col * rows] = value;
        Ok(())
    }

    /// Grow to at least `rows x cols`, zero-filling new elements and
    /// preserving existing ones by position.
    pub fn resize(&mut self, rows: usize, cols: usize) {
        let old_rows = self.rows();
        let old_cols = self.cols();
        if rows == old_rows && cols == old_cols {
            return;
        }
        let mut data = vec![0.0; rows * cols];
        for c in 0..old_cols.min(cols) {
            for r in 0..old_rows.min(rows) {
                data[r + c * rows] = self.data[r + c * old_rows];
            }
        }
        self.data = data;
        self.shape = vec![rows, cols];
        self.rows = rows;
        self.cols = cols;
    }

    pub fn transpose(&self) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        let mut data = vec![0.0; self.data.len()];
        for r in 0..rows {
            for c in 0..cols {
                data[c + r * cols] = self.data[r + c * rows];
            }
        }
        Tensor { data, shape: vec![cols, rows], rows: cols, cols: rows }
    }

    /// One full column as a column vector, for column-wise `for` iteration.
    pub fn column_at(&self, col: usize) -> Result<Tensor, String> {
        let rows = self.rows();
        let cols = self.cols();
        if col >= cols {
            return Err(format!("column {} out of bound {}", col + 1, cols));
        }
        let data = self.data[col * rows..(col + 1) * rows].to_vec();
        Ok(Tensor::column(data))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = self.rows();
        let cols = self.cols();
        write!(f, "[")?;
        for r in 0..rows {
            for c in 0..cols {
                if c > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", format_number_short_g(self.data[r + c * rows]))?;
            }
            if r + 1 < rows {
                write!(f, "; ")?;
            }
        }
        write!(f, "]")
    }
}

/// Lazy `base:step:limit` range. The VM iterates it without materializing;
/// stores collapse it into a tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub base: f64,
    pub step: f64,
    pub limit: f64,
}

impl Range {
    pub fn new(base: f64, step: f64, limit: f64) -> Self {
        Range { base, step, limit }
    }

    pub fn numel(&self) -> usize {
        if self.step == 0.0 || self.step.is_nan() {
            return 0;
        }
        if self.base.is_infinite() || self.limit.is_infinite() {
            // An unbounded range still reports a saturating element count,
            // mirroring the interpreter's infinite-loop warning behavior.
            if (self.limit - self.base).signum() == self.step.signum() {
                return usize::MAX;
            }
            return 0;
        }
        // Tolerate rounding at the limit so 0:0.1:1 has 11 elements.
        let span = (self.limit - self.base) / self.step;
        if span < -1e-10 {
            0
        } else {
            (span + 1e-10).floor() as usize + 1
        }
    }

    /// 0-based element extraction; no bounds check, callers use `numel`.
    pub fn elem(&self, i: usize) -> f64 {
        self.base + self.step * i as f64
    }

    pub fn has_infinite_bound(&self) -> bool {
        self.base.is_infinite() || self.limit.is_infinite()
    }

    /// True when the range can be iterated with the inline extractor:
    /// finite bounds and a nonzero step.
    pub fn is_trivial(&self) -> bool {
        !self.has_infinite_bound() && self.step != 0.0 && !self.step.is_nan()
    }

    pub fn to_tensor(&self) -> Tensor {
        let n = self.numel();
        if n == usize::MAX {
            // Materializing an unbounded range is a caller error; produce
            // the empty row like the interpreter does on bad colon args.
            return Tensor::new_2d(Vec::new(), 1, 0).unwrap();
        }
        let data: Vec<f64> = (0..n).map(|i| self.elem(i)).collect();
        Tensor::row(data)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.step == 1.0 {
            write!(
                f,
                "{}:{}",
                format_number_short_g(self.base),
                format_number_short_g(self.limit)
            )
        } else {
            write!(
                f,
                "{}:{}:{}",
                format_number_short_g(self.base),
                format_number_short_g(self.step),
                format_number_short_g(self.limit)
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_numel_basics() {
        assert_eq!(Range::new(1.0, 1.0, 3.0).numel(), 3);
        assert_eq!(Range::new(1.0, 1.0, 1.0).numel(), 1);
        assert_eq!(Range::new(3.0, 1.0, 1.0).numel(), 0);
        assert_eq!(Range::new(1.0, 2.0, 6.0).numel(), 3); // 1 3 5
        assert_eq!(Range::new(10.0, -2.0, 5.0).numel(), 3); // 10 8 6
    }

    #[test]
    fn range_materializes_column_major_row() {
        let t = Range::new(0.0, 0.5, 1.5).to_tensor();
        assert_eq!(t.rows(), 1);
        assert_eq!(t.data, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn tensor_resize_preserves() {
        let mut t = Tensor::new_2d(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        t.resize(3, 3);
        assert_eq!(t.get2(0, 0).unwrap(), 1.0);
        assert_eq!(t.get2(1, 1).unwrap(), 4.0);
        assert_eq!(t.get2(2, 2).unwrap(), 0.0);
    }

    #[test]
    fn transpose_roundtrip() {
        let t = Tensor::new_2d(vec![1.0, 3.0, 2.0, 4.0], 2, 2).unwrap();
        let tt = t.transpose().transpose();
        assert_eq!(t, tt);
    }

    #[test]
    fn column_extraction() {
        // [1 3; 2 4], columns are [1;2] and [3;4]
        let t = Tensor::new_2d(vec![1.0, 2.0, 3.0, 4.0], 2, 2).unwrap();
        let c0 = t.column_at(0).unwrap();
        assert_eq!(c0.data, vec![1.0, 2.0]);
        let c1 = t.column_at(1).unwrap();
        assert_eq!(c1.data, vec![3.0, 4.0]);
    }
}
