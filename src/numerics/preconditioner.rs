//! ILU(k) and aggregation AMG preconditioners.

use crate::numerics::krylov::Preconditioner;
use crate::numerics::sparse::{SparseMatrix, SparsityPattern};
use nalgebra::{DMatrix, DVector, Dyn, LU};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PreconditionerError {
    #[error("non-finite matrix entry in row {row}")]
    NonFiniteEntry { row: usize },
    #[error("cannot factorize an empty matrix")]
    EmptyMatrix,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IluOptions {
    /// Level of fill.
    pub fill: usize,
    /// Absolute diagonal shift.
    pub atol: f64,
    /// Relative diagonal scaling.
    pub rtol: f64,
}

impl Default for IluOptions {
    fn default() -> Self {
        Self {
            fill: 0,
            atol: 0.0,
            rtol: 1.0,
        }
    }
}

/// Incomplete LU factorization with level-of-fill `k`.
///
/// `L` is unit lower triangular and stored without its diagonal; `U` rows start
/// with their diagonal entry.
#[derive(Debug, Clone)]
pub struct IluPreconditioner {
    l_cols: Vec<Vec<usize>>,
    l_vals: Vec<Vec<f64>>,
    u_cols: Vec<Vec<usize>>,
    u_vals: Vec<Vec<f64>>,
}

impl IluPreconditioner {
    pub fn new(a: &SparseMatrix, options: IluOptions) -> Result<Self, PreconditionerError> {
        let n = a.n_rows();
        if n == 0 {
            return Err(PreconditionerError::EmptyMatrix);
        }
        let pattern = Self::symbolic(a, options.fill);

        let mut l_cols = Vec::with_capacity(n);
        let mut l_vals = Vec::with_capacity(n);
        let mut u_cols: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut u_vals: Vec<Vec<f64>> = Vec::with_capacity(n);

        let mut work = vec![0.0; n];
        let mut in_row = vec![false; n];

        for i in 0..n {
            let cols = &pattern[i];
            for &j in cols {
                in_row[j] = true;
                work[j] = 0.0;
            }
            let mut row_norm = 0.0f64;
            for (&j, &v) in a.row_cols(i).iter().zip(a.row_values(i)) {
                if !v.is_finite() {
                    return Err(PreconditionerError::NonFiniteEntry { row: i });
                }
                work[j] = if j == i {
                    options.rtol * v + v.signum() * options.atol
                } else {
                    v
                };
                row_norm = row_norm.max(v.abs());
            }

            for &k in cols.iter().take_while(|&&k| k < i) {
                let pivot = u_vals[k][0];
                let factor = work[k] / pivot;
                work[k] = factor;
                for (&j, &ukj) in u_cols[k].iter().zip(&u_vals[k]).skip(1) {
                    if in_row[j] {
                        work[j] -= factor * ukj;
                    }
                }
            }

            let (lower, upper): (Vec<usize>, Vec<usize>) = cols.iter().partition(|&&j| j < i);
            let mut diag = work[i];
            let floor = 1e-12 * row_norm.max(1e-300);
            if diag.abs() < floor {
                diag = if diag < 0.0 { -floor } else { floor };
                if row_norm == 0.0 {
                    diag = 1.0;
                }
            }
            work[i] = diag;

            l_vals.push(lower.iter().map(|&j| work[j]).collect());
            u_vals.push(upper.iter().map(|&j| work[j]).collect());
            l_cols.push(lower);
            u_cols.push(upper);

            for &j in cols {
                in_row[j] = false;
            }
        }

        Ok(Self {
            l_cols,
            l_vals,
            u_cols,
            u_vals,
        })
    }

    /// Sorted factor pattern per row. The diagonal is always included.
    fn symbolic(a: &SparseMatrix, fill: usize) -> Vec<Vec<usize>> {
        let n = a.n_rows();
        let mut upper_levels: Vec<Vec<(usize, usize)>> = Vec::with_capacity(n);
        let mut pattern = Vec::with_capacity(n);

        for i in 0..n {
            let mut levels: BTreeMap<usize, usize> = a.row_cols(i).iter().map(|&j| (j, 0)).collect();
            levels.insert(i, 0);

            let mut cursor = 0;
            loop {
                let next = levels.range(cursor..i).next().map(|(&k, &l)| (k, l));
                let Some((k, lev_ik)) = next else {
                    break;
                };
                for &(j, lev_kj) in &upper_levels[k] {
                    if j <= k {
                        continue;
                    }
                    let lev = lev_ik + lev_kj + 1;
                    if lev <= fill {
                        levels
                            .entry(j)
                            .and_modify(|l| *l = (*l).min(lev))
                            .or_insert(lev);
                    }
                }
                cursor = k + 1;
            }

            upper_levels.push(levels.range(i..).map(|(&j, &l)| (j, l)).collect());
            pattern.push(levels.into_keys().collect());
        }
        pattern
    }

    pub fn nnz(&self) -> usize {
        self.l_cols.iter().map(Vec::len).sum::<usize>() + self.u_cols.iter().map(Vec::len).sum::<usize>()
    }
}

impl Preconditioner for IluPreconditioner {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        let n = r.len();
        let mut y = r.clone();
        for i in 0..n {
            let mut sum = y[i];
            for (&j, &v) in self.l_cols[i].iter().zip(&self.l_vals[i]) {
                sum -= v * y[j];
            }
            y[i] = sum;
        }
        for i in (0..n).rev() {
            let mut sum = y[i];
            for (&j, &v) in self.u_cols[i].iter().zip(&self.u_vals[i]).skip(1) {
                sum -= v * y[j];
            }
            y[i] = sum / self.u_vals[i][0];
        }
        y
    }
}

/// Matrix handed to kryst's ILU. kryst factors on the pattern it is given, so
/// the level-`fill` pattern is laid out here with explicit zeros for fill-in,
/// and the diagonal carries the `rtol * d + sign(d) * atol` shift.
pub fn ilu_input(a: &SparseMatrix, options: IluOptions) -> Result<SparseMatrix, PreconditionerError> {
    let n = a.n_rows();
    if n == 0 {
        return Err(PreconditionerError::EmptyMatrix);
    }
    let mut pattern = SparsityPattern::new(n);
    for (i, cols) in IluPreconditioner::symbolic(a, options.fill).into_iter().enumerate() {
        pattern.add_entries(i, cols);
    }
    let mut m = SparseMatrix::from_pattern(&pattern);
    for i in 0..n {
        for (&j, &v) in a.row_cols(i).iter().zip(a.row_values(i)) {
            if !v.is_finite() {
                return Err(PreconditionerError::NonFiniteEntry { row: i });
            }
            let Ok(pos) = m.row_cols(i).binary_search(&j) else {
                continue;
            };
            m.row_values_mut(i)[pos] = if j == i {
                options.rtol * v + v.signum() * options.atol
            } else {
                v
            };
        }
    }
    Ok(m)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmgOptions {
    pub n_cycles: usize,
    pub w_cycle: bool,
    pub aggregation_threshold: f64,
    pub smoother_sweeps: usize,
    /// Overlap of the smoother subdomains; a single process has none to add.
    pub smoother_overlap: usize,
    pub smoother: IluOptions,
    /// Levels are not coarsened below this size.
    pub coarse_size: usize,
    pub max_levels: usize,
}

impl Default for AmgOptions {
    fn default() -> Self {
        Self {
            n_cycles: 1,
            w_cycle: false,
            aggregation_threshold: 1e-14,
            smoother_sweeps: 2,
            smoother_overlap: 1,
            smoother: IluOptions::default(),
            coarse_size: 64,
            max_levels: 10,
        }
    }
}

struct AmgLevel {
    matrix: SparseMatrix,
    smoother: IluPreconditioner,
    aggregates: Vec<usize>,
    n_coarse: usize,
}

enum CoarseSolver {
    Direct(LU<f64, Dyn, Dyn>),
    Ilu(IluPreconditioner),
}

/// Plain aggregation AMG. Aggregates never mix dofs of different constant modes,
/// so each velocity component and the pressure are coarsened separately.
pub struct AmgPreconditioner {
    levels: Vec<AmgLevel>,
    coarse_matrix: SparseMatrix,
    coarse: CoarseSolver,
    options: AmgOptions,
}

impl AmgPreconditioner {
    pub fn new(
        a: &SparseMatrix,
        options: AmgOptions,
        constant_modes: &[Vec<bool>],
    ) -> Result<Self, PreconditionerError> {
        if a.n_rows() == 0 {
            return Err(PreconditionerError::EmptyMatrix);
        }
        let mut labels: Vec<usize> = (0..a.n_rows())
            .map(|i| constant_modes.iter().position(|m| m.get(i).copied().unwrap_or(false)).unwrap_or(0))
            .collect();

        let mut levels = Vec::new();
        let mut current = a.clone();
        while current.n_rows() > options.coarse_size && levels.len() + 1 < options.max_levels {
            let (aggregates, n_coarse) = aggregate(&current, &labels, options.aggregation_threshold);
            if n_coarse as f64 > 0.9 * current.n_rows() as f64 {
                break;
            }
            let coarse = galerkin_product(&current, &aggregates, n_coarse);
            let mut coarse_labels = vec![0; n_coarse];
            for (i, &agg) in aggregates.iter().enumerate() {
                coarse_labels[agg] = labels[i];
            }
            let smoother = IluPreconditioner::new(&current, options.smoother)?;
            levels.push(AmgLevel {
                matrix: current,
                smoother,
                aggregates,
                n_coarse,
            });
            current = coarse;
            labels = coarse_labels;
        }

        let lu = current.to_dense().lu();
        let coarse = if lu.is_invertible() {
            CoarseSolver::Direct(lu)
        } else {
            CoarseSolver::Ilu(IluPreconditioner::new(&current, options.smoother)?)
        };
        debug!(
            levels = levels.len() + 1,
            coarse_rows = current.n_rows(),
            overlap = options.smoother_overlap,
            "AMG hierarchy built"
        );

        Ok(Self {
            levels,
            coarse_matrix: current,
            coarse,
            options,
        })
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len() + 1
    }

    fn coarse_solve(&self, b: &DVector<f64>) -> DVector<f64> {
        match &self.coarse {
            CoarseSolver::Direct(lu) => lu
                .solve(b)
                .unwrap_or_else(|| DVector::zeros(b.len())),
            CoarseSolver::Ilu(ilu) => {
                let mut x = ilu.apply(b);
                for _ in 1..self.options.smoother_sweeps.max(1) {
                    let r = self.coarse_matrix.residual(b, &x);
                    x += ilu.apply(&r);
                }
                x
            }
        }
    }

    fn cycle(&self, level: usize, b: &DVector<f64>) -> DVector<f64> {
        let Some(lvl) = self.levels.get(level) else {
            return self.coarse_solve(b);
        };
        let a = &lvl.matrix;
        let mut x = DVector::zeros(b.len());
        for _ in 0..self.options.smoother_sweeps {
            let r = a.residual(b, &x);
            x += lvl.smoother.apply(&r);
        }

        let r = a.residual(b, &x);
        let mut rc = DVector::zeros(lvl.n_coarse);
        for (i, &agg) in lvl.aggregates.iter().enumerate() {
            rc[agg] += r[i];
        }
        let mut ec = self.cycle(level + 1, &rc);
        if self.options.w_cycle && level + 1 < self.levels.len() {
            let coarse_a = &self.levels[level + 1].matrix;
            let rc2 = coarse_a.residual(&rc, &ec);
            ec += self.cycle(level + 1, &rc2);
        }
        for (i, &agg) in lvl.aggregates.iter().enumerate() {
            x[i] += ec[agg];
        }

        for _ in 0..self.options.smoother_sweeps {
            let r = a.residual(b, &x);
            x += lvl.smoother.apply(&r);
        }
        x
    }
}

impl Preconditioner for AmgPreconditioner {
    fn apply(&self, r: &DVector<f64>) -> DVector<f64> {
        let mut x = self.cycle(0, r);
        for _ in 1..self.options.n_cycles.max(1) {
            let residual = match self.levels.first() {
                Some(l) => l.matrix.residual(r, &x),
                None => self.coarse_matrix.residual(r, &x),
            };
            x += self.cycle(0, &residual);
        }
        x
    }
}

/// Greedy two-pass aggregation on the strength graph restricted to equal labels.
fn aggregate(a: &SparseMatrix, labels: &[usize], threshold: f64) -> (Vec<usize>, usize) {
    let n = a.n_rows();
    let diag: Vec<f64> = (0..n).map(|i| a.diagonal(i).abs()).collect();
    let strong: Vec<Vec<usize>> = (0..n)
        .map(|i| {
            a.row_cols(i)
                .iter()
                .zip(a.row_values(i))
                .filter(|&(&j, &v)| {
                    j != i && labels[j] == labels[i] && v.abs() >= threshold * (diag[i] * diag[j]).sqrt()
                })
                .map(|(&j, _)| j)
                .collect()
        })
        .collect();

    const UNSET: usize = usize::MAX;
    let mut agg = vec![UNSET; n];
    let mut n_agg = 0;

    for i in 0..n {
        if agg[i] != UNSET || strong[i].is_empty() {
            continue;
        }
        if strong[i].iter().all(|&j| agg[j] == UNSET) {
            agg[i] = n_agg;
            for &j in &strong[i] {
                agg[j] = n_agg;
            }
            n_agg += 1;
        }
    }
    for i in 0..n {
        if agg[i] != UNSET {
            continue;
        }
        match strong[i].iter().find(|&&j| agg[j] != UNSET) {
            Some(&j) => agg[i] = agg[j],
            None => {
                agg[i] = n_agg;
                n_agg += 1;
            }
        }
    }
    (agg, n_agg)
}

/// `P^T A P` for a piecewise-constant prolongator.
fn galerkin_product(a: &SparseMatrix, aggregates: &[usize], n_coarse: usize) -> SparseMatrix {
    let mut triplets = Vec::with_capacity(a.nnz());
    for i in 0..a.n_rows() {
        for (&j, &v) in a.row_cols(i).iter().zip(a.row_values(i)) {
            triplets.push((aggregates[i], aggregates[j], v));
        }
    }
    SparseMatrix::from_triplets(n_coarse, &triplets)
}

/// Dense fallback used in tests and tiny systems.
pub fn dense_solve(a: &SparseMatrix, b: &DVector<f64>) -> Option<DVector<f64>> {
    let dense: DMatrix<f64> = a.to_dense();
    dense.lu().solve(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::krylov::tests::convection_diffusion;
    use crate::numerics::krylov::{SolverControl, gmres};

    fn laplacian_2d(n: usize) -> SparseMatrix {
        let idx = |i: usize, j: usize| i + n * j;
        let mut t = Vec::new();
        for j in 0..n {
            for i in 0..n {
                t.push((idx(i, j), idx(i, j), 4.0));
                if i > 0 {
                    t.push((idx(i, j), idx(i - 1, j), -1.0));
                }
                if i + 1 < n {
                    t.push((idx(i, j), idx(i + 1, j), -1.0));
                }
                if j > 0 {
                    t.push((idx(i, j), idx(i, j - 1), -1.0));
                }
                if j + 1 < n {
                    t.push((idx(i, j), idx(i, j + 1), -1.0));
                }
            }
        }
        SparseMatrix::from_triplets(n * n, &t)
    }

    #[test]
    fn ilu0_is_exact_for_tridiagonal_matrices() {
        let a = convection_diffusion(30);
        let ilu = IluPreconditioner::new(&a, IluOptions::default()).unwrap();
        let b = DVector::from_fn(30, |i, _| 1.0 + i as f64);
        let x = ilu.apply(&b);
        assert!(a.residual(&b, &x).norm() < 1e-10);
        assert_eq!(ilu.nnz(), a.nnz());
    }

    #[test]
    fn fill_level_grows_the_factor() {
        let a = laplacian_2d(8);
        let ilu0 = IluPreconditioner::new(&a, IluOptions::default()).unwrap();
        let ilu2 = IluPreconditioner::new(&a, IluOptions { fill: 2, ..Default::default() }).unwrap();
        assert!(ilu2.nnz() > ilu0.nnz());

        let b = DVector::from_element(64, 1.0);
        let r0 = a.residual(&b, &ilu0.apply(&b)).norm();
        let r2 = a.residual(&b, &ilu2.apply(&b)).norm();
        assert!(r2 < r0);
    }

    #[test]
    fn ilu_input_widens_pattern_and_shifts_diagonal() {
        let a = laplacian_2d(5);
        let options = IluOptions {
            fill: 1,
            atol: 0.5,
            rtol: 1.1,
        };
        let m = ilu_input(&a, options).unwrap();
        assert!(m.nnz() > a.nnz());
        for i in 0..a.n_rows() {
            assert!((m.diagonal(i) - (1.1 * 4.0 + 0.5)).abs() < 1e-14);
            for (&j, &v) in a.row_cols(i).iter().zip(a.row_values(i)) {
                if j != i {
                    assert_eq!(m.get(i, j), v);
                }
            }
        }
        // fill-in enters as explicit zeros
        let ilu1 = IluPreconditioner::new(&a, options).unwrap();
        assert_eq!(m.nnz(), ilu1.nnz());
        assert!(m.values().iter().any(|&v| v == 0.0));
    }

    #[test]
    fn amg_accelerates_gmres_on_poisson() {
        let a = laplacian_2d(24);
        let n = a.n_rows();
        let modes = vec![vec![true; n]];
        let amg = AmgPreconditioner::new(&a, AmgOptions { coarse_size: 20, ..Default::default() }, &modes).unwrap();
        assert!(amg.n_levels() > 1);

        let b = DVector::from_element(n, 1.0);
        let control = SolverControl {
            max_iterations: 200,
            tolerance: 1e-8 * b.norm(),
        };
        let mut x = DVector::zeros(n);
        let with_amg = gmres(&a, &b, &mut x, &amg, control, 50).unwrap();

        let mut x = DVector::zeros(n);
        let plain = gmres(
            &a,
            &b,
            &mut x,
            &crate::numerics::krylov::IdentityPreconditioner,
            SolverControl {
                max_iterations: 5000,
                ..control
            },
            50,
        )
        .unwrap();
        assert!(with_amg.iterations * 2 < plain.iterations);
    }

    #[test]
    fn aggregation_respects_constant_modes() {
        let a = laplacian_2d(6);
        let labels: Vec<usize> = (0..36).map(|i| i % 2).collect();
        let (agg, n_agg) = aggregate(&a, &labels, 0.0);
        assert!(n_agg < 36);
        for i in 0..36 {
            for j in 0..36 {
                if agg[i] == agg[j] {
                    assert_eq!(labels[i], labels[j]);
                }
            }
        }
    }
}
