//! Conjugate-gradient solution of the linearized system.
use crate::Real;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgError {
    /// The iteration cap was reached before the residual converged.
    MaxIterationsReached { iterations: usize },
    /// The operator is not positive definite along a search direction.
    IndefiniteOperator,
}

impl Display for CgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgError::MaxIterationsReached { iterations } => {
                write!(f, "CG failed to converge within {} iterations", iterations)
            }
            CgError::IndefiniteOperator => {
                write!(f, "CG encountered a non-positive-definite operator")
            }
        }
    }
}

impl Error for CgError {}

/// Workspace buffers reused across solves.
#[derive(Debug, Clone)]
struct CgWorkspace<T: Real> {
    r: DVector<T>,
    p: DVector<T>,
    ap: DVector<T>,
}

impl<T: Real> Default for CgWorkspace<T> {
    fn default() -> Self {
        Self {
            r: DVector::zeros(0),
            p: DVector::zeros(0),
            ap: DVector::zeros(0),
        }
    }
}

/// Conjugate-gradient solver for symmetric positive definite CSR systems.
///
/// Convergence is measured by the relative criterion `|r| <= tol * |b|`,
/// using the approximate residual maintained by the recurrence.
#[derive(Debug)]
pub struct CgSolver<T: Real> {
    pub rel_tolerance: T,
    /// Iteration cap. Defaults to ten times the system size when `None`.
    pub max_iterations: Option<usize>,
    workspace: CgWorkspace<T>,
}

impl<T: Real> Default for CgSolver<T> {
    fn default() -> Self {
        Self {
            rel_tolerance: T::from_f64(1e-10).unwrap(),
            max_iterations: None,
            workspace: CgWorkspace::default(),
        }
    }
}

impl<T: Real> CgSolver<T> {
    pub fn with_rel_tolerance(rel_tolerance: T) -> Self {
        Self {
            rel_tolerance,
            ..Self::default()
        }
    }

    /// Solves `a * x = b` starting from the provided `x`. Returns the number
    /// of iterations performed.
    pub fn solve(
        &mut self,
        a: &CsrMatrix<T>,
        x: &mut DVector<T>,
        b: &DVector<T>,
    ) -> Result<usize, CgError> {
        let n = b.len();
        assert_eq!(a.nrows(), n);
        assert_eq!(a.ncols(), n);
        assert_eq!(x.len(), n);

        let b_norm = b.norm();
        if b_norm == T::zero() {
            x.fill(T::zero());
            return Ok(0);
        }

        let max_iterations = self.max_iterations.unwrap_or(10 * n.max(1));
        let ws = &mut self.workspace;
        ws.r.resize_vertically_mut(n, T::zero());
        ws.p.resize_vertically_mut(n, T::zero());
        ws.ap.resize_vertically_mut(n, T::zero());

        // r = b - A x
        spmv(&mut ws.r, a, x);
        ws.r.zip_apply(b, |r, b_i| *r = b_i - *r);
        ws.p.copy_from(&ws.r);

        let mut r_dot_r = ws.r.dot(&ws.r);
        let mut iterations = 0;
        while ws.r.norm() > self.rel_tolerance * b_norm {
            if iterations >= max_iterations {
                return Err(CgError::MaxIterationsReached {
                    iterations: max_iterations,
                });
            }

            spmv(&mut ws.ap, a, &ws.p);
            let p_dot_ap = ws.p.dot(&ws.ap);
            if p_dot_ap <= T::zero() {
                return Err(CgError::IndefiniteOperator);
            }

            let alpha = r_dot_r / p_dot_ap;
            x.axpy(alpha, &ws.p, T::one());
            ws.r.axpy(-alpha, &ws.ap, T::one());

            let r_dot_r_next = ws.r.dot(&ws.r);
            let beta = r_dot_r_next / r_dot_r;
            r_dot_r = r_dot_r_next;
            // p = r + beta p
            ws.p.axpy(T::one(), &ws.r, beta);

            iterations += 1;
        }
        Ok(iterations)
    }
}

/// Computes `y = a * x` for a CSR matrix.
fn spmv<T: Real>(y: &mut DVector<T>, a: &CsrMatrix<T>, x: &DVector<T>) {
    for (i, row) in a.row_iter().enumerate() {
        let mut sum = T::zero();
        for (&j, &value) in row.col_indices().iter().zip(row.values()) {
            sum += value * x[j];
        }
        y[i] = sum;
    }
}
