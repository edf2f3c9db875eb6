//! Numerical solvers driving unit operations.
//!
//! # Submodules
//!
//! - [`integration`]: implicit Euler driver for a [`ModelSystem`](crate::ModelSystem),
//!   including section handling and forward sensitivities
//!
//! # Solvers Provided
//!
//! - [`NewtonRaphson`]: dense Newton iteration with user-provided Jacobian,
//!   used by units for their algebraic consistent-initialization problems
//! - [`DaeIntegrator`](integration::DaeIntegrator): time integration through
//!   the unit operation contract
//!
//! # Example
//!
//! ```
//! use nalgebra::DMatrix;
//! use unitflow::solvers::NewtonRaphson;
//!
//! // Solve x^2 - 4 = 0
//! let solver = NewtonRaphson::new(1e-10, 20);
//! let x = solver.solve(|x: &[f64]| Ok((vec![x[0] * x[0] - 4.0], DMatrix::from_element(1, 1, 2.0 * x[0]))), &[1.0]).unwrap();
//! assert!((x[0] - 2.0).abs() < 1e-8);
//! ```

pub mod integration;

use nalgebra::{DMatrix, DVector};

use crate::system::SystemError;
use crate::{ConfigError, UnitError, UnitOpId};

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors raised by Newton iterations and the DAE driver.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// Maximum iterations exceeded without convergence
    #[error("Maximum iterations exceeded")]
    MaxIterationsExceeded,
    /// Singular Jacobian matrix encountered
    #[error("Singular Jacobian matrix")]
    SingularJacobian,
    /// Step size fell below the configured minimum
    #[error("Step size {step:e} too small at t = {time}")]
    StepSizeTooSmall { time: f64, step: f64 },
    /// Solution diverged
    #[error("Solution diverged")]
    Diverged,
    /// A unit reported a non-recoverable failure
    #[error("{unit} failed at t = {time}: {reason}")]
    Fatal { unit: UnitOpId, time: f64, reason: String },
    /// Failure reported by a unit outside time stepping
    #[error(transparent)]
    Unit(#[from] UnitError),
    /// Configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Network misuse outside time stepping
    #[error(transparent)]
    System(#[from] SystemError),
}

/// Dense Newton iteration `x ← x - ω J⁻¹ F(x)` for small algebraic blocks.
///
/// Units use it for the algebraic part of consistent initialization, where
/// the closure evaluates the unit residual and returns the matching Jacobian
/// block. Errors returned by the closure abort the iteration unchanged.
#[derive(Debug, Clone)]
pub struct NewtonRaphson {
    /// Convergence tolerance on the residual norm
    pub tolerance: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relaxation factor (1.0 = full Newton step)
    pub relaxation: f64,
}

impl NewtonRaphson {
    /// Full Newton steps (`ω = 1`).
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        NewtonRaphson { tolerance, max_iterations, relaxation: 1.0 }
    }

    /// Damped Newton steps with relaxation factor `ω`.
    pub fn with_relaxation(tolerance: f64, max_iterations: usize, relaxation: f64) -> Self {
        NewtonRaphson { tolerance, max_iterations, relaxation }
    }

    /// Solves `F(x) = 0` starting from `x0`.
    ///
    /// # Arguments
    ///
    /// * `f` - Function computing residuals and Jacobian; its errors abort the iteration
    /// * `x0` - Initial guess
    ///
    /// # Returns
    ///
    /// The converged `x`.
    pub fn solve<F>(&self, f: F, x0: &[f64]) -> SolverResult<Vec<f64>>
    where
        F: FnMut(&[f64]) -> SolverResult<(Vec<f64>, DMatrix<f64>)>,
    {
        self.solve_with_stats(f, x0).map(|(x, _)| x)
    }

    /// Like [`solve`](Self::solve), also returning iteration counts.
    ///
    /// # Arguments
    ///
    /// * `f` - Function computing residuals and Jacobian
    /// * `x0` - Initial guess
    ///
    /// # Returns
    ///
    /// The converged `x` and the iteration statistics.
    pub fn solve_with_stats<F>(&self, mut f: F, x0: &[f64]) -> SolverResult<(Vec<f64>, SolverStats)>
    where
        F: FnMut(&[f64]) -> SolverResult<(Vec<f64>, DMatrix<f64>)>,
    {
        let mut x = x0.to_vec();
        let mut stats = SolverStats::new();

        for iteration in 0..self.max_iterations {
            stats.iterations = iteration + 1;

            let (residuals, jacobian) = f(&x)?;
            stats.function_evals += 1;
            stats.jacobian_evals += 1;

            // Check convergence
            let norm = residuals.iter().map(|r| r * r).sum::<f64>().sqrt();
            stats.final_residual = norm;
            if !norm.is_finite() {
                return Err(SolverError::Diverged);
            }
            if norm < self.tolerance {
                return Ok((x, stats));
            }

            // Solve J * dx = -F
            let dx = jacobian.lu().solve(&(-DVector::from_vec(residuals))).ok_or(SolverError::SingularJacobian)?;

            // Update: x = x + alpha * dx
            for (xi, dxi) in x.iter_mut().zip(dx.iter()) {
                *xi += self.relaxation * dxi;
            }

            // Check for divergence
            if iteration > 10 && norm > 1e10 {
                return Err(SolverError::Diverged);
            }
        }

        Err(SolverError::MaxIterationsExceeded)
    }
}

impl Default for NewtonRaphson {
    fn default() -> Self {
        Self::new(1e-10, 50)
    }
}

/// Iteration counts of one Newton solve.
#[derive(Debug, Clone, Default)]
pub struct SolverStats {
    /// Number of iterations performed
    pub iterations: usize,
    /// Number of function evaluations
    pub function_evals: usize,
    /// Number of Jacobian evaluations
    pub jacobian_evals: usize,
    /// Final residual norm
    pub final_residual: f64,
}

impl SolverStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration for the DAE integrator.
#[derive(Debug, Clone)]
pub struct DAESolverConfig {
    /// Absolute tolerance
    pub atol: f64,
    /// Relative tolerance
    pub rtol: f64,
    /// Nominal (and maximum) step size
    pub max_step: f64,
    /// Smallest step size before giving up
    pub min_step: f64,
    /// Newton iterations per step
    pub max_newton_iterations: usize,
    /// Use lean consistent initialization at discontinuous section transitions
    pub lean_reinitialization: bool,
}

impl Default for DAESolverConfig {
    fn default() -> Self {
        DAESolverConfig {
            atol: 1e-8,
            rtol: 1e-6,
            max_step: 0.1,
            min_step: 1e-10,
            max_newton_iterations: 8,
            lean_reinitialization: false,
        }
    }
}

/// Weighted root-mean-square norm `sqrt(mean((v_i / (rtol |y_i| + atol_i))^2))`.
pub fn weighted_rms_norm(v: &[f64], y: &[f64], atol: &[f64], rtol: f64) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let sum: f64 = v.iter().zip(error_weights(y, atol, rtol)).map(|(vi, w)| (vi * w).powi(2)).sum();
    (sum / v.len() as f64).sqrt()
}

/// Error weights `1 / (rtol |y_i| + atol_i)`.
pub fn error_weights(y: &[f64], atol: &[f64], rtol: f64) -> Vec<f64> {
    y.iter().zip(atol).map(|(yi, a)| 1.0 / (rtol * yi.abs() + a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_newton_raphson_linear() {
        // Solve x - 5 = 0
        let f = |x: &[f64]| Ok((vec![x[0] - 5.0], DMatrix::from_element(1, 1, 1.0)));

        let solver = NewtonRaphson::new(1e-6, 10);
        let solution = solver.solve(f, &[0.0]).unwrap();

        assert_relative_eq!(solution[0], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_newton_raphson_system() {
        // x^2 + y^2 = 5, x y = 2 near (2, 1)
        let f = |v: &[f64]| {
            let (x, y) = (v[0], v[1]);
            let r = vec![x * x + y * y - 5.0, x * y - 2.0];
            let j = DMatrix::from_row_slice(2, 2, &[2.0 * x, 2.0 * y, y, x]);
            Ok((r, j))
        };

        let (solution, stats) = NewtonRaphson::new(1e-12, 30).solve_with_stats(f, &[1.8, 0.8]).unwrap();
        assert_relative_eq!(solution[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(solution[1], 1.0, epsilon = 1e-9);
        assert!(stats.iterations > 1);
        assert_eq!(stats.function_evals, stats.iterations);
    }

    #[test]
    fn test_newton_raphson_singular() {
        let f = |x: &[f64]| Ok((vec![x[0] - 1.0], DMatrix::zeros(1, 1)));
        assert!(matches!(NewtonRaphson::new(1e-8, 5).solve(f, &[0.0]), Err(SolverError::SingularJacobian)));
    }

    #[test]
    fn test_newton_raphson_propagates_closure_error() {
        let f = |_: &[f64]| Err(SolverError::Unit(UnitError::Recoverable("domain".into())));
        assert!(matches!(NewtonRaphson::default().solve(f, &[0.0]), Err(SolverError::Unit(UnitError::Recoverable(_)))));
    }

    #[test]
    fn test_newton_raphson_max_iterations() {
        // Relaxed steps cannot reach the tolerance in two iterations
        let f = |x: &[f64]| Ok((vec![x[0] - 5.0], DMatrix::from_element(1, 1, 1.0)));
        let solver = NewtonRaphson::with_relaxation(1e-12, 2, 0.5);
        assert!(matches!(solver.solve(f, &[0.0]), Err(SolverError::MaxIterationsExceeded)));
    }

    #[test]
    fn test_weighted_norm() {
        assert_eq!(weighted_rms_norm(&[], &[], &[], 1.0), 0.0);
        // weights: 1/(0.1*10 + 1) = 0.5 and 1/(0 + 1) = 1
        let norm = weighted_rms_norm(&[2.0, 1.0], &[10.0, 0.0], &[1.0, 1.0], 0.1);
        assert_relative_eq!(norm, 1.0);
        assert_eq!(error_weights(&[10.0], &[1.0], 0.1), vec![0.5]);
        assert_eq!(error_weights(&[0.0, 0.0], &[1.0, 0.5], 0.1), vec![1.0, 2.0]);
    }

    #[test]
    fn test_dae_solver_config() {
        let config = DAESolverConfig::default();
        assert_eq!(config.atol, 1e-8);
        assert!(!config.lean_reinitialization);
    }

    #[test]
    fn test_solver_error_display() {
        let err = SolverError::Fatal { unit: UnitOpId(1), time: 2.5, reason: "nan".to_string() };
        assert_eq!(err.to_string(), "unit_001 failed at t = 2.5: nan");

        let err = SolverError::Unit(UnitError::Recoverable("step".to_string()));
        assert_eq!(err.to_string(), "recoverable failure: step");
    }
}
