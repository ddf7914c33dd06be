//! Solution and residual vector state owned by the coordinator.
use crate::Real;
use nalgebra::DVector;

/// The global solution vector together with its history and the auxiliary
/// copies assembly needs.
///
/// All vectors are mutated only between assembly passes. During a parallel
/// pass the state is read-only; workers accumulate into their own buffers.
#[derive(Debug, Clone)]
pub struct SolutionState<T: Real> {
    current: DVector<T>,
    old: DVector<T>,
    older: DVector<T>,
    u_dot: DVector<T>,
    serialized: DVector<T>,
    residual_copy: DVector<T>,
    residual_ghosted: DVector<T>,
}

impl<T: Real> SolutionState<T> {
    pub fn zeros(num_dofs: usize) -> Self {
        Self {
            current: DVector::zeros(num_dofs),
            old: DVector::zeros(num_dofs),
            older: DVector::zeros(num_dofs),
            u_dot: DVector::zeros(num_dofs),
            serialized: DVector::zeros(num_dofs),
            residual_copy: DVector::zeros(num_dofs),
            residual_ghosted: DVector::zeros(num_dofs),
        }
    }

    pub fn num_dofs(&self) -> usize {
        self.current.len()
    }

    pub fn current(&self) -> &DVector<T> {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut DVector<T> {
        &mut self.current
    }

    pub fn old(&self) -> &DVector<T> {
        &self.old
    }

    pub fn older(&self) -> &DVector<T> {
        &self.older
    }

    pub fn u_dot(&self) -> &DVector<T> {
        &self.u_dot
    }

    pub fn u_dot_mut(&mut self) -> &mut DVector<T> {
        &mut self.u_dot
    }

    /// Recomputes the discrete time derivative as the weighted combination
    /// of (current, old, older) prescribed by the time policy.
    pub fn compute_u_dot(&mut self, weights: &[T]) {
        assert!(weights.len() <= 3, "at most three history states are kept");
        self.u_dot.fill(T::zero());
        let history = [&self.current, &self.old, &self.older];
        for (weight, state) in weights.iter().zip(history) {
            self.u_dot.axpy(*weight, state, T::one());
        }
    }

    pub fn set_current(&mut self, solution: &DVector<T>) {
        assert_eq!(solution.len(), self.current.len());
        self.current.copy_from(solution);
    }

    /// Rotates the history at the start of a new time step:
    /// older takes the old value, old takes the current one.
    pub fn shift(&mut self) {
        std::mem::swap(&mut self.older, &mut self.old);
        self.old.copy_from(&self.current);
    }

    /// Restores the current solution from the old one, discarding a rejected
    /// step attempt.
    pub fn restore(&mut self) {
        self.current.copy_from(&self.old);
    }

    /// Extrapolates the initial iterate of a new step from the last two
    /// solutions: `u = u_old + coeff * (u_old - u_older)`.
    pub fn apply_predictor(&mut self, coeff: T) {
        self.current.copy_from(&self.old);
        self.current.axpy(coeff, &self.old, T::one());
        self.current.axpy(-coeff, &self.older, T::one());
    }

    /// Updates the gathered (serialized) copy of the solution.
    pub fn serialize_solution(&mut self) {
        self.serialized.copy_from(&self.current);
    }

    pub fn serialized(&self) -> &DVector<T> {
        &self.serialized
    }

    /// Stores the finalized residual into the copy and ghosted forms.
    pub fn store_residual(&mut self, residual: &DVector<T>) {
        self.residual_copy.copy_from(residual);
        self.residual_ghosted.copy_from(residual);
    }

    pub fn residual_copy(&self) -> &DVector<T> {
        &self.residual_copy
    }

    pub fn residual_ghosted(&self) -> &DVector<T> {
        &self.residual_ghosted
    }
}
