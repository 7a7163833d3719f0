//! Process-group abstraction for the synchronization points of a solve.
//!
//! Assembly only touches locally owned cells; shared entries are
//! reconciled in `compress_*`. Krylov reductions run inside kryst on the
//! communicator handed out by [`Communicator::universe`].

use crate::numerics::sparse::SparseMatrix;
use kryst::parallel::UniverseComm;
use nalgebra::DVector;

pub use kryst::parallel::NoComm;

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Global sum of a locally computed scalar.
    fn sum(&self, local: f64) -> f64;
    fn max(&self, local: f64) -> f64;
    /// Accumulates contributions to shared entries of a global vector.
    fn compress_vector(&self, v: &mut DVector<f64>);
    fn compress_matrix(&self, m: &mut SparseMatrix);
    /// Communicator the Krylov solvers reduce over.
    fn universe(&self) -> UniverseComm;
}

/// Single process: every reduction is the identity.
impl Communicator for NoComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum(&self, local: f64) -> f64 {
        local
    }

    fn max(&self, local: f64) -> f64 {
        local
    }

    fn compress_vector(&self, _v: &mut DVector<f64>) {}

    fn compress_matrix(&self, _m: &mut SparseMatrix) {}

    fn universe(&self) -> UniverseComm {
        UniverseComm::NoComm(NoComm {})
    }
}

/// Global 2-norm of a vector whose entries are owned by `owned` on this rank.
pub fn global_norm(comm: &dyn Communicator, v: &DVector<f64>, owned: std::ops::Range<usize>) -> f64 {
    let local: f64 = v.as_slice()[owned].iter().map(|x| x * x).sum();
    comm.sum(local).sqrt()
}
