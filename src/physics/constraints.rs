//! Affine constraints `u_i = sum_j w_ij u_j + g_i` and the constraint-aware
//! scatter of element contributions into the global system.

use crate::numerics::sparse::{SparseError, SparseMatrix, SparsityPattern};
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("constraint chain through dof {dof} is cyclic")]
    Cyclic { dof: usize },
    #[error("constraints must be closed before they are applied")]
    NotClosed,
    #[error("an inhomogeneous constraint needs the local matrix to fold its column")]
    MissingLocalMatrix,
    #[error(transparent)]
    Sparse(#[from] SparseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintLine {
    pub entries: Vec<(usize, f64)>,
    pub inhomogeneity: f64,
}

#[derive(Debug, Clone, Default)]
pub struct AffineConstraints {
    lines: BTreeMap<usize, ConstraintLine>,
    closed: bool,
}

impl AffineConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `u_dof = sum entries + inhomogeneity`. The first line for a dof wins,
    /// so boundary conditions added earlier take precedence.
    pub fn constrain(&mut self, dof: usize, entries: Vec<(usize, f64)>, inhomogeneity: f64) -> bool {
        if self.lines.contains_key(&dof) {
            return false;
        }
        self.lines.insert(
            dof,
            ConstraintLine {
                entries,
                inhomogeneity,
            },
        );
        self.closed = false;
        true
    }

    pub fn constrain_value(&mut self, dof: usize, value: f64) -> bool {
        self.constrain(dof, Vec::new(), value)
    }

    pub fn is_constrained(&self, dof: usize) -> bool {
        self.lines.contains_key(&dof)
    }

    pub fn line(&self, dof: usize) -> Option<&ConstraintLine> {
        self.lines.get(&dof)
    }

    pub fn n_constraints(&self) -> usize {
        self.lines.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn constrained_dofs(&self) -> impl Iterator<Item = usize> + '_ {
        self.lines.keys().copied()
    }

    /// Resolves chains so every entry references an unconstrained dof.
    pub fn close(&mut self) -> Result<(), ConstraintError> {
        let keys: Vec<usize> = self.lines.keys().copied().collect();
        let max_depth = keys.len() + 1;
        let mut resolved = BTreeMap::new();

        for &dof in &keys {
            let mut line = self.lines[&dof].clone();
            let mut depth = 0;
            while line.entries.iter().any(|(j, _)| self.lines.contains_key(j)) {
                depth += 1;
                if depth > max_depth {
                    return Err(ConstraintError::Cyclic { dof });
                }
                let mut acc: BTreeMap<usize, f64> = BTreeMap::new();
                let mut g = line.inhomogeneity;
                for &(j, w) in &line.entries {
                    if j == dof {
                        return Err(ConstraintError::Cyclic { dof });
                    }
                    match self.lines.get(&j) {
                        Some(inner) => {
                            g += w * inner.inhomogeneity;
                            for &(k, wk) in &inner.entries {
                                *acc.entry(k).or_default() += w * wk;
                            }
                        }
                        None => *acc.entry(j).or_default() += w,
                    }
                }
                line = ConstraintLine {
                    entries: acc.into_iter().filter(|(_, w)| *w != 0.0).collect(),
                    inhomogeneity: g,
                };
            }
            resolved.insert(dof, line);
        }

        self.lines = resolved;
        self.closed = true;
        Ok(())
    }

    /// Same constraint structure with all inhomogeneities removed.
    pub fn homogeneous(&self) -> Self {
        Self {
            lines: self
                .lines
                .iter()
                .map(|(&dof, line)| {
                    (
                        dof,
                        ConstraintLine {
                            entries: line.entries.clone(),
                            inhomogeneity: 0.0,
                        },
                    )
                })
                .collect(),
            closed: self.closed,
        }
    }

    /// Constraints on a Newton correction `du` so that `current + du` satisfies
    /// `self`: `g'_i = g_i + sum w_ij u_j - u_i`.
    pub fn relative_to(&self, current: &DVector<f64>) -> Self {
        Self {
            lines: self
                .lines
                .iter()
                .map(|(&dof, line)| {
                    let target = line.inhomogeneity
                        + line.entries.iter().map(|&(j, w)| w * current[j]).sum::<f64>();
                    (
                        dof,
                        ConstraintLine {
                            entries: line.entries.clone(),
                            inhomogeneity: target - current[dof],
                        },
                    )
                })
                .collect(),
            closed: self.closed,
        }
    }

    /// Overwrites constrained entries of `v` with their constrained values.
    pub fn distribute(&self, v: &mut DVector<f64>) {
        for (&dof, line) in &self.lines {
            v[dof] = line.inhomogeneity + line.entries.iter().map(|&(j, w)| w * v[j]).sum::<f64>();
        }
    }

    pub fn set_zero(&self, v: &mut DVector<f64>) {
        for &dof in self.lines.keys() {
            v[dof] = 0.0;
        }
    }

    /// Global rows receiving the contributions of `dof`, with weights.
    fn targets(&self, dof: usize) -> Vec<(usize, f64)> {
        match self.lines.get(&dof) {
            Some(line) => line.entries.clone(),
            None => vec![(dof, 1.0)],
        }
    }

    /// Adds the couplings of one cell, folded through the constraints.
    pub fn add_cell_couplings(&self, pattern: &mut SparsityPattern, dofs: &[usize]) {
        let targets: Vec<Vec<(usize, f64)>> = dofs.iter().map(|&d| self.targets(d)).collect();
        for ti in &targets {
            for &(row, _) in ti {
                for tj in &targets {
                    pattern.add_entries(row, tj.iter().map(|&(col, _)| col));
                }
            }
        }
    }

    fn inhomogeneities(&self, dofs: &[usize]) -> Vec<f64> {
        dofs.iter()
            .map(|d| self.lines.get(d).map_or(0.0, |l| l.inhomogeneity))
            .collect()
    }

    /// True when a cell on `dofs` moves `-K_ij g_j` to the rhs, so even a
    /// residual-only scatter needs its local matrix.
    pub fn needs_local_matrix(&self, dofs: &[usize]) -> bool {
        dofs.iter()
            .any(|d| self.lines.get(d).is_some_and(|l| l.inhomogeneity != 0.0))
    }

    /// True when a cell on `dofs` contributes to a row flagged in `rows`.
    pub fn reaches_any(&self, dofs: &[usize], rows: &[bool]) -> bool {
        dofs.iter()
            .any(|&d| self.targets(d).iter().any(|&(row, _)| rows[row]))
    }

    /// Local rhs entry `i` with the constrained columns folded out.
    fn folded_rhs(local_matrix: Option<&DMatrix<f64>>, local_rhs: &DVector<f64>, inhom: &[f64], i: usize) -> f64 {
        let mut f = local_rhs[i];
        if let Some(k) = local_matrix {
            for (j, &g) in inhom.iter().enumerate() {
                if g != 0.0 {
                    f -= k[(i, j)] * g;
                }
            }
        }
        f
    }

    fn average_diagonal(local_matrix: &DMatrix<f64>) -> f64 {
        let (sum, count) = (0..local_matrix.nrows())
            .map(|i| local_matrix[(i, i)].abs())
            .filter(|d| *d > 0.0)
            .fold((0.0, 0usize), |(s, c), d| (s + d, c + 1));
        if count > 0 { sum / count as f64 } else { 1.0 }
    }

    fn check_closed(&self) -> Result<(), ConstraintError> {
        if !self.closed && !self.lines.is_empty() {
            return Err(ConstraintError::NotClosed);
        }
        Ok(())
    }

    /// Scatters a local element system. Constrained rows are condensed onto
    /// the dofs they depend on; constrained columns move `-K_ij g_j` to the rhs.
    /// Each constrained row receives the mean absolute local diagonal on its
    /// diagonal and that value times `g_i` on the rhs.
    pub fn distribute_local_to_global(
        &self,
        local_matrix: &DMatrix<f64>,
        local_rhs: &DVector<f64>,
        dofs: &[usize],
        matrix: &mut SparseMatrix,
        rhs: &mut DVector<f64>,
    ) -> Result<(), ConstraintError> {
        self.check_closed()?;
        let n = dofs.len();
        let targets: Vec<Vec<(usize, f64)>> = dofs.iter().map(|&d| self.targets(d)).collect();
        let inhom = self.inhomogeneities(dofs);

        for i in 0..n {
            let f = Self::folded_rhs(Some(local_matrix), local_rhs, &inhom, i);
            for &(row, wi) in &targets[i] {
                rhs[row] += wi * f;
                for j in 0..n {
                    let k = local_matrix[(i, j)];
                    if k == 0.0 {
                        continue;
                    }
                    for &(col, wj) in &targets[j] {
                        matrix.add(row, col, wi * wj * k)?;
                    }
                }
            }
        }

        let average_diagonal = Self::average_diagonal(local_matrix);
        for (i, &dof) in dofs.iter().enumerate() {
            if self.lines.contains_key(&dof) {
                matrix.add(dof, dof, average_diagonal)?;
                rhs[dof] += average_diagonal * inhom[i];
            }
        }
        Ok(())
    }

    /// Right-hand-side half of [`Self::distribute_local_to_global`], adding
    /// exactly what the full scatter adds to `rhs`. `local_matrix` may be
    /// omitted when [`Self::needs_local_matrix`] is false for `dofs`.
    pub fn distribute_local_rhs(
        &self,
        local_matrix: Option<&DMatrix<f64>>,
        local_rhs: &DVector<f64>,
        dofs: &[usize],
        rhs: &mut DVector<f64>,
    ) -> Result<(), ConstraintError> {
        self.check_closed()?;
        let inhom = self.inhomogeneities(dofs);
        let folds = inhom.iter().any(|&g| g != 0.0);
        if folds && local_matrix.is_none() {
            return Err(ConstraintError::MissingLocalMatrix);
        }

        for (i, &dof) in dofs.iter().enumerate() {
            let f = Self::folded_rhs(local_matrix, local_rhs, &inhom, i);
            for (row, w) in self.targets(dof) {
                rhs[row] += w * f;
            }
        }
        if let Some(k) = local_matrix {
            let average_diagonal = Self::average_diagonal(k);
            for (i, &dof) in dofs.iter().enumerate() {
                if self.lines.contains_key(&dof) {
                    rhs[dof] += average_diagonal * inhom[i];
                }
            }
        }
        Ok(())
    }

    /// Adds to `diagonal[r]` what [`Self::distribute_local_to_global`] adds to
    /// the matrix entry `(r, r)`, for the rows flagged in `rows`. Additions
    /// happen in the same order, so the sums agree bit for bit.
    pub fn distribute_local_diagonal(
        &self,
        local_matrix: &DMatrix<f64>,
        dofs: &[usize],
        rows: &[bool],
        diagonal: &mut DVector<f64>,
    ) {
        let n = dofs.len();
        let targets: Vec<Vec<(usize, f64)>> = dofs.iter().map(|&d| self.targets(d)).collect();
        for i in 0..n {
            for &(row, wi) in &targets[i] {
                if !rows[row] {
                    continue;
                }
                for j in 0..n {
                    let k = local_matrix[(i, j)];
                    if k == 0.0 {
                        continue;
                    }
                    for &(col, wj) in &targets[j] {
                        if col == row {
                            diagonal[row] += wi * wj * k;
                        }
                    }
                }
            }
        }
        let average_diagonal = Self::average_diagonal(local_matrix);
        for &dof in dofs {
            if rows[dof] && self.lines.contains_key(&dof) {
                diagonal[dof] += average_diagonal;
            }
        }
    }
}

/// The two constraint sets of a Newton solve. `nonzero` imposes the boundary
/// data on the first iteration of a step, `zero` keeps later corrections
/// homogeneous.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSets {
    pub nonzero: AffineConstraints,
    pub zero: AffineConstraints,
}

impl ConstraintSets {
    pub fn new(nonzero: AffineConstraints, zero: AffineConstraints) -> Self {
        Self { nonzero, zero }
    }

    pub fn select(&self, initial_step: bool) -> &AffineConstraints {
        if initial_step { &self.nonzero } else { &self.zero }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn close_resolves_chains_and_detects_cycles() {
        let mut c = AffineConstraints::new();
        c.constrain(0, vec![(1, 0.5)], 1.0);
        c.constrain(1, vec![(2, 2.0)], 3.0);
        c.close().unwrap();
        let line = c.line(0).unwrap();
        assert_eq!(line.entries, vec![(2, 1.0)]);
        assert_relative_eq!(line.inhomogeneity, 2.5);

        let mut v = DVector::from_vec(vec![0.0, 0.0, 4.0]);
        c.distribute(&mut v);
        assert_relative_eq!(v[1], 11.0);
        assert_relative_eq!(v[0], 6.5);

        let mut cyclic = AffineConstraints::new();
        cyclic.constrain(0, vec![(1, 1.0)], 0.0);
        cyclic.constrain(1, vec![(0, 1.0)], 0.0);
        assert!(matches!(cyclic.close(), Err(ConstraintError::Cyclic { .. })));
    }

    #[test]
    fn first_constraint_wins() {
        let mut c = AffineConstraints::new();
        assert!(c.constrain_value(3, 1.0));
        assert!(!c.constrain_value(3, 2.0));
        c.close().unwrap();
        assert_eq!(c.line(3).unwrap().inhomogeneity, 1.0);
    }

    #[test]
    fn relative_constraints_drive_iterate_to_boundary_values() {
        let mut c = AffineConstraints::new();
        c.constrain_value(0, 2.0);
        c.constrain(2, vec![(1, 1.0)], 0.0);
        c.close().unwrap();
        let current = DVector::from_vec(vec![0.5, 1.0, 3.0]);
        let rel = c.relative_to(&current);
        let mut du = DVector::zeros(3);
        rel.distribute(&mut du);
        let next = &current + &du;
        assert_relative_eq!(next[0], 2.0);
        assert_relative_eq!(next[2], next[1]);
    }

    #[test]
    fn condensed_system_reproduces_constrained_solution() {
        // two 1D linear elements on three nodes, left end fixed to 1
        let mut c = AffineConstraints::new();
        c.constrain_value(0, 1.0);
        c.close().unwrap();

        let k = DMatrix::from_row_slice(2, 2, &[1.0, -1.0, -1.0, 1.0]);
        let f = DVector::zeros(2);
        let mut pattern = SparsityPattern::new(3);
        for cell in [[0, 1], [1, 2]] {
            c.add_cell_couplings(&mut pattern, &cell);
        }
        let mut a = SparseMatrix::from_pattern(&pattern);
        let mut b = DVector::zeros(3);
        for cell in [[0, 1], [1, 2]] {
            c.distribute_local_to_global(&k, &f, &cell, &mut a, &mut b).unwrap();
        }
        // row of the fixed dof only holds the average diagonal
        assert_eq!(a.get(0, 1), 0.0);
        assert_eq!(a.get(1, 0), 0.0);
        assert_relative_eq!(a.diagonal(0), 1.0);
        assert_relative_eq!(b[1], 1.0);

        let x = a.to_dense().lu().solve(&b).unwrap();
        assert_relative_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(x[2], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rhs_scatter_folds_inhomogeneities_like_full_scatter() {
        let mut c = AffineConstraints::new();
        c.constrain_value(0, 0.7);
        c.constrain(3, vec![(2, 0.5)], -0.2);
        c.close().unwrap();

        let k = DMatrix::from_fn(3, 3, |i, j| if i == j { 3.0 + i as f64 } else { -0.4 - 0.1 * j as f64 });
        let f = DVector::from_vec(vec![0.3, -1.2, 0.8]);
        let cells = [[0, 1, 2], [1, 2, 3]];
        let mut pattern = SparsityPattern::new(4);
        for cell in &cells {
            c.add_cell_couplings(&mut pattern, cell);
        }
        let mut a = SparseMatrix::from_pattern(&pattern);
        let mut full = DVector::zeros(4);
        let mut only = DVector::zeros(4);
        let rows = vec![false, true, true, false];
        let mut diagonal = DVector::zeros(4);
        for cell in &cells {
            c.distribute_local_to_global(&k, &f, cell, &mut a, &mut full).unwrap();
            assert!(c.needs_local_matrix(cell));
            c.distribute_local_rhs(Some(&k), &f, cell, &mut only).unwrap();
            c.distribute_local_diagonal(&k, cell, &rows, &mut diagonal);
        }
        assert_eq!(only, full);
        assert!(full[0] != 0.0);
        assert_eq!(diagonal[1], a.diagonal(1));
        assert_eq!(diagonal[2], a.diagonal(2));
        assert_eq!(diagonal[0], 0.0);

        let err = c.distribute_local_rhs(None, &f, &cells[0], &mut only).unwrap_err();
        assert_eq!(err, ConstraintError::MissingLocalMatrix);
        // homogeneous cells fold nothing and need no matrix
        let h = c.homogeneous();
        assert!(!h.needs_local_matrix(&cells[1]));
        assert!(h.distribute_local_rhs(None, &f, &cells[1], &mut only).is_ok());
        assert!(c.reaches_any(&cells[1], &[false, false, true, false]));
        assert!(!c.reaches_any(&[0], &rows));
    }

    #[test]
    fn scatter_requires_closed_constraints() {
        let mut c = AffineConstraints::new();
        c.constrain_value(0, 1.0);
        let mut a = SparseMatrix::from_pattern(&SparsityPattern::new(2));
        let mut b = DVector::zeros(2);
        let err = c
            .distribute_local_to_global(&DMatrix::identity(2, 2), &DVector::zeros(2), &[0, 1], &mut a, &mut b)
            .unwrap_err();
        assert_eq!(err, ConstraintError::NotClosed);
    }
}
