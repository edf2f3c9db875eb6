//! Time profiles injected by boundary units, and external scalar functions.
//!
//! The default inlet profile is a cubic polynomial per section and
//! component, evaluated in the time elapsed since the section start:
//!
//! ```text
//! c_i(t) = a_i + b_i Δt + c_i Δt² + d_i Δt³,   Δt = t - t_sec
//! ```
//!
//! # Example
//!
//! ```
//! use unitflow::profile::{InletProfile, PiecewiseCubicProfile};
//!
//! let mut profile = PiecewiseCubicProfile::new(1);
//! profile.push_section(&[1.0], &[2.0], &[0.0], &[0.0]);
//! profile.set_section_starts(&[10.0]);
//!
//! let mut c = [0.0];
//! profile.evaluate(11.5, 0, &mut c);
//! assert_eq!(c[0], 4.0);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::autodiff::Scalar;

/// Concentration profile of a boundary unit.
pub trait InletProfile: Send + Sync {
    /// Number of components.
    fn num_components(&self) -> usize;

    /// Writes the concentrations at `t` into `out`.
    fn evaluate(&self, t: f64, sec_idx: usize, out: &mut [f64]);

    /// Writes the time derivatives of the concentrations at `t` into `out`.
    fn evaluate_time_derivative(&self, t: f64, sec_idx: usize, out: &mut [f64]);
}

/// Externally supplied scalar function of time.
///
/// Functions are shared between units and the driver, never owned by a unit.
pub trait ExternalFunction: Send + Sync {
    /// Function value.
    fn value(&self, t: f64, sec_idx: usize) -> f64;

    /// Time derivative.
    fn time_derivative(&self, t: f64, sec_idx: usize) -> f64;
}

/// Shared handle to an external function.
pub type SharedFunction = Arc<dyn ExternalFunction>;

/// Linear ramp `offset + slope (t - t0)`, the simplest external function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearRamp {
    pub offset: f64,
    pub slope: f64,
    pub t0: f64,
}

impl ExternalFunction for LinearRamp {
    fn value(&self, t: f64, _sec_idx: usize) -> f64 {
        self.offset + self.slope * (t - self.t0)
    }

    fn time_derivative(&self, _t: f64, _sec_idx: usize) -> f64 {
        self.slope
    }
}

/// Coefficient order of a cubic polynomial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoeffOrder {
    Const = 0,
    Lin = 1,
    Quad = 2,
    Cube = 3,
}

impl CoeffOrder {
    pub const ALL: [CoeffOrder; 4] = [CoeffOrder::Const, CoeffOrder::Lin, CoeffOrder::Quad, CoeffOrder::Cube];

    /// Configuration key of the coefficient array.
    pub fn key(&self) -> &'static str {
        match self {
            CoeffOrder::Const => "CONST_COEFF",
            CoeffOrder::Lin => "LIN_COEFF",
            CoeffOrder::Quad => "QUAD_COEFF",
            CoeffOrder::Cube => "CUBE_COEFF",
        }
    }
}

/// Piecewise cubic polynomial profile.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseCubicProfile {
    n_comp: usize,
    /// Coefficients, indexed `[sec * n_comp + comp][order]`
    coeffs: Vec<[f64; 4]>,
    section_starts: Vec<f64>,
}

impl PiecewiseCubicProfile {
    /// Creates a profile without sections.
    pub fn new(n_comp: usize) -> Self {
        PiecewiseCubicProfile { n_comp, coeffs: Vec::new(), section_starts: Vec::new() }
    }

    /// Appends the coefficients of one section.
    pub fn push_section(&mut self, constant: &[f64], linear: &[f64], quadratic: &[f64], cubic: &[f64]) {
        for comp in 0..self.n_comp {
            self.coeffs.push([constant[comp], linear[comp], quadratic[comp], cubic[comp]]);
        }
    }

    /// Removes all sections.
    pub fn clear_sections(&mut self) {
        self.coeffs.clear();
    }

    /// Number of sections with coefficients.
    pub fn n_sections(&self) -> usize {
        if self.n_comp == 0 { 0 } else { self.coeffs.len() / self.n_comp }
    }

    /// Sets the start time of every section.
    pub fn set_section_starts(&mut self, starts: &[f64]) {
        self.section_starts = starts.to_vec();
    }

    /// Gets a coefficient.
    pub fn coefficient(&self, sec_idx: usize, comp: usize, order: CoeffOrder) -> Option<f64> {
        self.coeffs.get(sec_idx * self.n_comp + comp).map(|c| c[order as usize])
    }

    /// Sets a coefficient. Returns false if the section or component does not exist.
    pub fn set_coefficient(&mut self, sec_idx: usize, comp: usize, order: CoeffOrder, value: f64) -> bool {
        if comp >= self.n_comp {
            return false;
        }
        match self.coeffs.get_mut(sec_idx * self.n_comp + comp) {
            Some(c) => {
                c[order as usize] = value;
                true
            }
            None => false,
        }
    }

    fn elapsed(&self, t: f64, sec_idx: usize) -> f64 {
        t - self.section_starts.get(sec_idx).copied().unwrap_or(0.0)
    }

    /// Evaluates one component, mapping each coefficient through `coeff`.
    ///
    /// Used by AD callers to turn sensitive coefficients into seeded values.
    pub fn evaluate_with<S, F>(&self, t: f64, sec_idx: usize, comp: usize, coeff: F) -> S
    where
        S: Scalar,
        F: Fn(CoeffOrder, f64) -> S,
    {
        let dt = self.elapsed(t, sec_idx);
        let c = self.coeffs.get(sec_idx * self.n_comp + comp).copied().unwrap_or([0.0; 4]);
        // Horner scheme
        let mut value = coeff(CoeffOrder::Cube, c[3]);
        for order in [CoeffOrder::Quad, CoeffOrder::Lin, CoeffOrder::Const] {
            value = value * dt + coeff(order, c[order as usize]);
        }
        value
    }
}

impl InletProfile for PiecewiseCubicProfile {
    fn num_components(&self) -> usize {
        self.n_comp
    }

    fn evaluate(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        for (comp, o) in out.iter_mut().enumerate().take(self.n_comp) {
            *o = self.evaluate_with(t, sec_idx, comp, |_, c| c);
        }
    }

    fn evaluate_time_derivative(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        let dt = self.elapsed(t, sec_idx);
        for (comp, o) in out.iter_mut().enumerate().take(self.n_comp) {
            let c = self.coeffs.get(sec_idx * self.n_comp + comp).copied().unwrap_or([0.0; 4]);
            *o = c[1] + 2.0 * c[2] * dt + 3.0 * c[3] * dt * dt;
        }
    }
}

/// Profile built from one external function per component.
#[derive(Clone)]
pub struct FunctionProfile {
    functions: Vec<SharedFunction>,
}

impl FunctionProfile {
    pub fn new(functions: Vec<SharedFunction>) -> Self {
        FunctionProfile { functions }
    }
}

impl fmt::Debug for FunctionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionProfile").field("n_comp", &self.functions.len()).finish()
    }
}

impl InletProfile for FunctionProfile {
    fn num_components(&self) -> usize {
        self.functions.len()
    }

    fn evaluate(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        for (o, f) in out.iter_mut().zip(&self.functions) {
            *o = f.value(t, sec_idx);
        }
    }

    fn evaluate_time_derivative(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        for (o, f) in out.iter_mut().zip(&self.functions) {
            *o = f.time_derivative(t, sec_idx);
        }
    }
}
