use kryst::matrix::sparse::CsrMatrix;
use nalgebra::DVector;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SparseError {
    #[error("entry ({row}, {col}) is not part of the sparsity pattern")]
    EntryNotInPattern { row: usize, col: usize },
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Row-wise set of structurally non-zero columns. The diagonal is always present.
#[derive(Debug, Clone)]
pub struct SparsityPattern {
    rows: Vec<BTreeSet<usize>>,
}

impl SparsityPattern {
    pub fn new(n: usize) -> Self {
        Self {
            rows: (0..n).map(|i| BTreeSet::from([i])).collect(),
        }
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn add(&mut self, row: usize, col: usize) {
        self.rows[row].insert(col);
    }

    pub fn add_entries(&mut self, row: usize, cols: impl IntoIterator<Item = usize>) {
        self.rows[row].extend(cols);
    }

    pub fn exists(&self, row: usize, col: usize) -> bool {
        self.rows[row].contains(&col)
    }

    pub fn n_nonzero_elements(&self) -> usize {
        self.rows.iter().map(BTreeSet::len).sum()
    }
}

/// Compressed sparse row matrix with a fixed pattern.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    n_rows: usize,
    n_cols: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl SparseMatrix {
    pub fn from_pattern(pattern: &SparsityPattern) -> Self {
        let n = pattern.n_rows();
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx = Vec::with_capacity(pattern.n_nonzero_elements());
        row_ptr.push(0);
        for row in &pattern.rows {
            col_idx.extend(row.iter().copied());
            row_ptr.push(col_idx.len());
        }
        let nnz = col_idx.len();
        Self {
            n_rows: n,
            n_cols: n,
            row_ptr,
            col_idx,
            values: vec![0.0; nnz],
        }
    }

    /// Builds a matrix from `(row, col, value)` triplets; duplicates are summed.
    pub fn from_triplets(n: usize, triplets: &[(usize, usize, f64)]) -> Self {
        let mut pattern = SparsityPattern::new(n);
        for &(i, j, _) in triplets {
            pattern.add(i, j);
        }
        let mut m = Self::from_pattern(&pattern);
        for &(i, j, v) in triplets {
            if let Some(k) = m.find(i, j) {
                m.values[k] += v;
            }
        }
        m
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    pub fn col_idx(&self) -> &[usize] {
        &self.col_idx
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn row_cols(&self, row: usize) -> &[usize] {
        &self.col_idx[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    pub fn row_values(&self, row: usize) -> &[f64] {
        &self.values[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    pub fn row_values_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.values[self.row_ptr[row]..self.row_ptr[row + 1]]
    }

    /// Position of `(row, col)` in the value array.
    #[inline]
    pub fn find(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_ptr[row];
        self.row_cols(row)
            .binary_search(&col)
            .ok()
            .map(|k| start + k)
    }

    pub fn add(&mut self, row: usize, col: usize, value: f64) -> Result<(), SparseError> {
        match self.find(row, col) {
            Some(k) => {
                self.values[k] += value;
                Ok(())
            }
            None if value == 0.0 => Ok(()),
            None => Err(SparseError::EntryNotInPattern { row, col }),
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), SparseError> {
        match self.find(row, col) {
            Some(k) => {
                self.values[k] = value;
                Ok(())
            }
            None if value == 0.0 => Ok(()),
            None => Err(SparseError::EntryNotInPattern { row, col }),
        }
    }

    /// Value at `(row, col)`, zero outside the pattern.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.find(row, col).map_or(0.0, |k| self.values[k])
    }

    pub fn diagonal(&self, row: usize) -> f64 {
        self.get(row, row)
    }

    pub fn zero(&mut self) {
        self.values.iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn zero_row(&mut self, row: usize) {
        self.row_values_mut(row).iter_mut().for_each(|v| *v = 0.0);
    }

    pub fn matvec(&self, x: &DVector<f64>, y: &mut DVector<f64>) {
        for i in 0..self.n_rows {
            let mut sum = 0.0;
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                sum += self.values[k] * x[self.col_idx[k]];
            }
            y[i] = sum;
        }
    }

    pub fn mul(&self, x: &DVector<f64>) -> DVector<f64> {
        let mut y = DVector::zeros(self.n_rows);
        self.matvec(x, &mut y);
        y
    }

    /// `b - A x`.
    pub fn residual(&self, b: &DVector<f64>, x: &DVector<f64>) -> DVector<f64> {
        b - self.mul(x)
    }

    pub fn frobenius_norm(&self) -> f64 {
        self.values.iter().map(|v| v * v).sum::<f64>().sqrt()
    }

    /// Snapshot in kryst's CSR layout for the Krylov solvers.
    pub fn to_csr(&self) -> CsrMatrix<f64> {
        CsrMatrix::from_csr(
            self.n_rows,
            self.n_cols,
            self.row_ptr.clone(),
            self.col_idx.clone(),
            self.values.clone(),
        )
    }

    pub fn to_dense(&self) -> nalgebra::DMatrix<f64> {
        let mut m = nalgebra::DMatrix::zeros(self.n_rows, self.n_cols);
        for i in 0..self.n_rows {
            for k in self.row_ptr[i]..self.row_ptr[i + 1] {
                m[(i, self.col_idx[k])] = self.values[k];
            }
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_bounds_assembly() {
        let mut pattern = SparsityPattern::new(3);
        pattern.add_entries(0, [1, 2]);
        pattern.add(2, 0);
        let mut m = SparseMatrix::from_pattern(&pattern);
        assert_eq!(m.nnz(), 6);
        m.add(0, 2, 1.5).unwrap();
        m.add(0, 2, 0.5).unwrap();
        m.set(1, 1, 4.0).unwrap();
        assert_eq!(m.get(0, 2), 2.0);
        assert_eq!(m.diagonal(1), 4.0);
        assert_eq!(m.get(1, 0), 0.0);
        assert_eq!(
            m.add(1, 2, 1.0),
            Err(SparseError::EntryNotInPattern { row: 1, col: 2 })
        );
        // zero contributions outside the pattern are dropped silently
        assert!(m.add(1, 2, 0.0).is_ok());
    }

    #[test]
    fn matvec_matches_dense_product() {
        let m = SparseMatrix::from_triplets(
            3,
            &[(0, 0, 2.0), (0, 1, -1.0), (1, 1, 3.0), (2, 0, 1.0), (2, 2, 1.0), (2, 2, 1.0)],
        );
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let y = m.mul(&x);
        let dense = m.to_dense() * &x;
        assert_eq!(y, dense);
        assert_eq!(y[2], 7.0);
    }
}
