//! The external solver boundary.
//!
//! The nonlinear system exposes itself to solvers through the
//! [`NonlinearProblem`] callback contract; solvers repeatedly request
//! residual and Jacobian evaluations until they declare convergence or give
//! up. [`NewtonSolver`] is the reference implementation. Any other solver
//! can drive the same callbacks by implementing [`NonlinearSolver`].
use crate::error::SolveError;
use crate::Real;
use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

pub mod cg;

use cg::CgSolver;

/// Callback contract between a nonlinear solver and the assembled system.
pub trait NonlinearProblem<T: Real> {
    fn num_dofs(&self) -> usize;

    /// A zero matrix with the problem's Jacobian sparsity pattern.
    fn create_jacobian_matrix(&self) -> CsrMatrix<T>;

    /// Evaluates the residual at `u`. On a fault the output is zeroed and
    /// must not be used.
    fn residual(&mut self, u: &DVector<T>, out: &mut DVector<T>) -> Result<(), SolveError>;

    /// Evaluates the Jacobian at `u` into a matrix created by
    /// [`create_jacobian_matrix`](Self::create_jacobian_matrix).
    fn jacobian(&mut self, u: &DVector<T>, out: &mut CsrMatrix<T>) -> Result<(), SolveError>;

    /// Damping factor in `(0, 1]` to apply to the proposed update.
    fn damping(&mut self, _u: &DVector<T>, _update: &DVector<T>) -> Result<T, SolveError> {
        Ok(T::one())
    }
}

/// Why the solver stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The residual norm dropped below the tolerance.
    Converged,
    /// The iteration budget was exhausted without convergence.
    MaxIterationsReached,
}

/// The solver's reported final state.
///
/// Non-convergence is data, not an error: retry policy (step cutback,
/// different initial iterate) belongs to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport<T> {
    pub converged: bool,
    pub reason: StopReason,
    pub iterations: usize,
    pub linear_iterations: usize,
    pub final_residual_norm: T,
}

/// A nonlinear solver driving a [`NonlinearProblem`] to convergence.
pub trait NonlinearSolver<T: Real> {
    fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem<T>,
        u: &mut DVector<T>,
    ) -> Result<SolveReport<T>, SolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonSettings<T> {
    pub max_iterations: usize,
    /// Absolute tolerance on the residual norm.
    pub tolerance: T,
}

/// Newton's method with multiplicative damping of the update.
///
/// Solves the linearized system with conjugate gradients, so the assembled
/// Jacobian must be symmetric positive definite.
#[derive(Debug)]
pub struct NewtonSolver<T: Real> {
    pub settings: NewtonSettings<T>,
    pub linear_solver: CgSolver<T>,
}

impl<T: Real> NewtonSolver<T> {
    pub fn new(settings: NewtonSettings<T>) -> Self {
        Self {
            settings,
            linear_solver: CgSolver::default(),
        }
    }
}

impl<T: Real> NonlinearSolver<T> for NewtonSolver<T> {
    fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem<T>,
        u: &mut DVector<T>,
    ) -> Result<SolveReport<T>, SolveError> {
        let n = problem.num_dofs();
        assert_eq!(u.len(), n, "initial guess must match the DOF count");

        let mut residual = DVector::zeros(n);
        let mut dx = DVector::zeros(n);
        let mut jacobian = problem.create_jacobian_matrix();

        problem.residual(u, &mut residual)?;

        let mut iterations = 0;
        let mut linear_iterations = 0;
        loop {
            let norm = residual.norm();
            debug!("Newton iteration {}: |r| = {:?}", iterations, norm);
            if norm <= self.settings.tolerance {
                return Ok(SolveReport {
                    converged: true,
                    reason: StopReason::Converged,
                    iterations,
                    linear_iterations,
                    final_residual_norm: norm,
                });
            }
            if iterations >= self.settings.max_iterations {
                return Ok(SolveReport {
                    converged: false,
                    reason: StopReason::MaxIterationsReached,
                    iterations,
                    linear_iterations,
                    final_residual_norm: norm,
                });
            }

            problem.jacobian(u, &mut jacobian)?;

            // Solve J dx = -r by solving J dx = r and flipping the sign.
            dx.fill(T::zero());
            let lin_iters = self
                .linear_solver
                .solve(&jacobian, &mut dx, &residual)
                .map_err(|err| SolveError::LinearSolveFailure(Box::new(err)))?;
            linear_iterations += lin_iters;
            dx.neg_mut();

            let factor = problem.damping(u, &dx)?;
            debug!("Newton step damping factor at iter {}: {:?}", iterations, factor);
            u.axpy(factor, &dx, T::one());

            problem.residual(u, &mut residual)?;
            iterations += 1;
        }
    }
}
