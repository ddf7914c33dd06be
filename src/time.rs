//! Time discretization policy.
//!
//! The policy owns the time stepping state and computes, once per step, the
//! weight vector that blends the solution history into the discrete time
//! derivative. Residual assembly combines a *time* term built from the
//! weighted history with a *non-time* term, whose evaluation point and blend
//! factor also depend on the scheme.
use crate::error::SetupError;
use crate::solution::SolutionState;
use crate::Real;
use numeric_literals::replace_float_literals;

/// Selectable time stepping schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeScheme {
    ImplicitEuler,
    ExplicitEuler,
    Bdf2,
    CrankNicolson,
    /// Weights supplied by an external time integration component.
    External,
}

impl TimeScheme {
    /// Number of solution states entering the time derivative.
    pub fn stages(&self) -> usize {
        match self {
            TimeScheme::Bdf2 => 3,
            _ => 2,
        }
    }

    /// Formal order of accuracy.
    pub fn order(&self) -> usize {
        match self {
            TimeScheme::Bdf2 | TimeScheme::CrankNicolson => 2,
            _ => 1,
        }
    }
}

/// Blend factors applied to the non-time residual term.
///
/// `current` scales the term evaluated at the present iterate, `old` the
/// term evaluated at the previous step's solution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonTimeBlend<T> {
    pub current: T,
    pub old: T,
}

/// Time stepping state: current time, step sizes, step index and the weight
/// vector of the active scheme.
#[derive(Debug, Clone)]
pub struct TimeState<T: Real> {
    scheme: TimeScheme,
    time: T,
    dt: T,
    dt_old: T,
    step: usize,
    weights: Vec<T>,
}

impl<T: Real> TimeState<T> {
    pub fn new(scheme: TimeScheme) -> Self {
        Self {
            scheme,
            time: T::zero(),
            dt: T::zero(),
            dt_old: T::zero(),
            step: 0,
            weights: vec![T::zero(); scheme.stages()],
        }
    }

    pub fn with_start_time(mut self, time: T) -> Self {
        self.time = time;
        self
    }

    pub fn scheme(&self) -> TimeScheme {
        self.scheme
    }

    pub fn time(&self) -> T {
        self.time
    }

    pub fn dt(&self) -> T {
        self.dt
    }

    pub fn dt_old(&self) -> T {
        self.dt_old
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Weight vector blending (U, U_old, U_older, ...) into the discrete
    /// time derivative.
    pub fn weights(&self) -> &[T] {
        &self.weights
    }

    /// Derivative of the discrete time derivative with respect to the
    /// current solution.
    pub fn du_dot_du(&self) -> T {
        self.weights.first().copied().unwrap_or_else(T::zero)
    }

    /// Advances to the next step with step size `dt` and recomputes the
    /// scheme weights.
    pub fn advance(&mut self, dt: T) -> Result<(), SetupError> {
        if dt <= T::zero() {
            return Err(SetupError::MalformedParameter {
                parameter: "dt".to_string(),
                expected: "positive Real",
            });
        }
        self.dt_old = if self.step == 0 { dt } else { self.dt };
        self.dt = dt;
        self.time += dt;
        self.step += 1;
        if self.scheme != TimeScheme::External {
            self.recompute_weights();
        }
        Ok(())
    }

    /// Installs weights supplied by an external stepper. Only meaningful
    /// with [`TimeScheme::External`].
    pub fn set_external_weights(&mut self, weights: Vec<T>) {
        self.weights = weights;
    }

    #[replace_float_literals(T::from_f64(literal).unwrap())]
    fn recompute_weights(&mut self) {
        let dt = self.dt;
        let dt_old = self.dt_old;
        self.weights.clear();
        match self.scheme {
            TimeScheme::ImplicitEuler | TimeScheme::ExplicitEuler | TimeScheme::CrankNicolson => {
                self.weights.extend([1.0 / dt, -1.0 / dt]);
            }
            TimeScheme::Bdf2 => {
                if self.step <= 1 {
                    // No older state yet; single backward difference.
                    self.weights.extend([1.0 / dt, -1.0 / dt, 0.0]);
                } else {
                    // Variable-step three-point backward difference.
                    self.weights.extend([
                        (2.0 * dt + dt_old) / (dt * (dt + dt_old)),
                        -(dt + dt_old) / (dt * dt_old),
                        dt / (dt_old * (dt + dt_old)),
                    ]);
                }
            }
            TimeScheme::External => unreachable!("external weights are never recomputed"),
        }
    }

    /// Blend factors for the non-time residual term.
    #[replace_float_literals(T::from_f64(literal).unwrap())]
    pub fn nontime_blend(&self) -> NonTimeBlend<T> {
        match self.scheme {
            TimeScheme::CrankNicolson => NonTimeBlend {
                current: 0.5,
                old: 0.5,
            },
            TimeScheme::ExplicitEuler => NonTimeBlend {
                current: 0.0,
                old: 1.0,
            },
            _ => NonTimeBlend {
                current: 1.0,
                old: 0.0,
            },
        }
    }

    /// Whether the scheme needs the non-time residual evaluated at the old
    /// solution.
    pub fn needs_old_nontime_residual(&self) -> bool {
        let blend = self.nontime_blend();
        blend.old != T::zero()
    }

    /// Computes the discrete time derivative from the solution history and
    /// stores it in the state's `u_dot` vector.
    pub fn compute_time_derivative(&self, solution: &mut SolutionState<T>) {
        solution.compute_u_dot(&self.weights);
    }
}
