//! Automatic differentiation support using `num-dual`.
//!
//! Every unit operation shares one pool of forward-mode AD directions. The
//! first `sens_offset` directions carry parameter sensitivities; the
//! remaining directions are used by units to extract their Jacobians
//! (one direction per local degree of freedom for dense seeding).
//!
//! ```text
//! direction:  0 .. sens_offset-1 | sens_offset .. total-1
//!             parameter seeds    | Jacobian seeds
//! ```
//!
//! # Example
//!
//! ```
//! use unitflow::autodiff::*;
//!
//! // No sensitive parameters, two Jacobian directions
//! let dirs = AdDirections::for_system(0, 2);
//! let x = dirs.seeded(2.0, dirs.jacobian_direction(0), 1.0);
//! let y = dirs.seeded(3.0, dirs.jacobian_direction(1), 1.0);
//!
//! // f(x, y) = [x^2, xy]
//! let res = vec![x.clone() * x.clone(), x * y];
//! let jac = jacobian_block(&res, dirs, 2);
//! assert_eq!(jac[(1, 0)], 3.0);
//! assert_eq!(jac[(1, 1)], 2.0);
//! ```

use std::ops::{Add, Div, Mul, Neg, Range, Sub};

use nalgebra::{DMatrix, DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};

/// Active scalar: a value plus a dynamically sized vector of directional derivatives.
pub type Active = DualDVec64;

/// Scalar type usable in residual implementations.
///
/// Implemented for `f64` (plain evaluation) and [`Active`] (AD evaluation) so
/// that one generic residual body serves both paths.
pub trait Scalar:
    Clone
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + Add<f64, Output = Self>
    + Sub<f64, Output = Self>
    + Mul<f64, Output = Self>
    + Div<f64, Output = Self>
{
    /// Creates a constant.
    fn from_f64(value: f64) -> Self;

    /// Converts an active value, dropping derivatives for plain scalars.
    fn from_active(value: &Active) -> Self;

    /// Gets the real part.
    fn value(&self) -> f64;
}

impl Scalar for f64 {
    fn from_f64(value: f64) -> Self {
        value
    }

    fn from_active(value: &Active) -> Self {
        value.re
    }

    fn value(&self) -> f64 {
        *self
    }
}

impl Scalar for Active {
    fn from_f64(value: f64) -> Self {
        constant(value)
    }

    fn from_active(value: &Active) -> Self {
        value.clone()
    }

    fn value(&self) -> f64 {
        self.re
    }
}

/// How parameters enter a residual evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    /// Parameters are constants
    Plain,
    /// Registered sensitive parameters carry their seeds in these directions
    Sensitive(AdDirections),
}

/// Layout of the shared AD direction pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdDirections {
    sens_offset: usize,
    total: usize,
}

impl AdDirections {
    /// Creates a layout with `n_sens` parameter directions followed by
    /// `jacobian_dirs` Jacobian directions.
    pub fn for_system(n_sens: usize, jacobian_dirs: usize) -> Self {
        AdDirections { sens_offset: n_sens, total: n_sens + jacobian_dirs }
    }

    /// First direction available for Jacobian extraction.
    pub fn sens_offset(&self) -> usize {
        self.sens_offset
    }

    /// Total number of directions.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of directions available for Jacobian extraction.
    pub fn jacobian_dirs(&self) -> usize {
        self.total - self.sens_offset
    }

    /// Absolute direction of the `j`-th Jacobian seed.
    pub fn jacobian_direction(&self, j: usize) -> usize {
        self.sens_offset + j
    }

    /// Creates a value whose derivative is `seed` in direction `dir` and zero elsewhere.
    pub fn seeded(&self, value: f64, dir: usize, seed: f64) -> Active {
        let mut eps = DVector::zeros(self.total);
        eps[dir] = seed;
        Active::new(value, Derivative::some(eps))
    }

    /// Reads the derivative of `x` in direction `dir`.
    pub fn derivative(&self, x: &Active, dir: usize) -> f64 {
        if dir >= self.total {
            return 0.0;
        }
        self.derivatives(x)[dir]
    }

    /// Reads all derivatives of `x` (zeros if `x` is a constant).
    pub fn derivatives(&self, x: &Active) -> DVector<f64> {
        let eps = x.eps.clone().unwrap_generic(Dyn(self.total), U1);
        if eps.len() == self.total { eps } else { DVector::zeros(self.total) }
    }

    /// Allocates `n` constant zeros.
    pub fn allocate(&self, n: usize) -> Vec<Active> {
        vec![constant(0.0); n]
    }
}

/// Creates a constant active value.
pub fn constant(value: f64) -> Active {
    Active::new(value, Derivative::none())
}

/// Overwrites the real part, keeping the derivatives (seeds).
pub fn set_value(x: &mut Active, value: f64) {
    x.re = value;
}

/// Borrowed AD residual and state buffers of one unit operation.
///
/// The slices cover exactly the unit's degrees of freedom; the direction
/// layout is shared with the whole system.
pub struct AdVectors<'a> {
    /// AD residual
    pub res: &'a mut [Active],
    /// AD state with Jacobian seeds
    pub y: &'a mut [Active],
    /// Direction layout
    pub dirs: AdDirections,
}

impl<'a> AdVectors<'a> {
    /// Wraps residual and state buffers of equal length.
    pub fn new(res: &'a mut [Active], y: &'a mut [Active], dirs: AdDirections) -> Self {
        debug_assert_eq!(res.len(), y.len());
        AdVectors { res, y, dirs }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.y.len()
    }

    /// Returns true if the buffers are empty (zero-DOF units).
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Borrows a sub-range of both buffers.
    pub fn slice(&mut self, range: Range<usize>) -> AdVectors<'_> {
        AdVectors { res: &mut self.res[range.clone()], y: &mut self.y[range], dirs: self.dirs }
    }

    /// Seeds `y[j]` with unit derivative in Jacobian direction `j` (dense seeding).
    pub fn seed_dense(&mut self) {
        let dirs = self.dirs;
        for (j, yj) in self.y.iter_mut().enumerate() {
            *yj = dirs.seeded(yj.re, dirs.jacobian_direction(j), 1.0);
        }
    }

    /// Copies real values into the seeded state.
    pub fn load_values(&mut self, values: &[f64]) {
        for (yj, &v) in self.y.iter_mut().zip(values) {
            set_value(yj, v);
        }
    }

    /// Copies the real part of the AD residual into `res`.
    pub fn store_residual(&self, res: &mut [f64]) {
        for (r, ad) in res.iter_mut().zip(self.res.iter()) {
            *r = ad.re;
        }
    }
}

/// Extracts the dense Jacobian block `∂res/∂y` from a densely seeded evaluation.
///
/// Column `j` is read from Jacobian direction `j`.
pub fn jacobian_block(res: &[Active], dirs: AdDirections, n_cols: usize) -> DMatrix<f64> {
    let mut jac = DMatrix::zeros(res.len(), n_cols);
    for (i, r) in res.iter().enumerate() {
        let eps = dirs.derivatives(r);
        for j in 0..n_cols {
            jac[(i, j)] = eps[dirs.jacobian_direction(j)];
        }
    }
    jac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_direction_layout() {
        let dirs = AdDirections::for_system(3, 5);
        assert_eq!(dirs.sens_offset(), 3);
        assert_eq!(dirs.total(), 8);
        assert_eq!(dirs.jacobian_dirs(), 5);
        assert_eq!(dirs.jacobian_direction(2), 5);
    }

    #[test]
    fn test_constant_has_zero_derivatives() {
        let dirs = AdDirections::for_system(1, 2);
        let c = constant(4.0);
        assert_eq!(c.re, 4.0);
        assert_eq!(dirs.derivatives(&c).len(), 3);
        assert_eq!(dirs.derivative(&c, 1), 0.0);
    }

    #[test]
    fn test_generic_scalar_arithmetic() {
        fn f<S: Scalar>(x: S, y: S) -> S {
            let two: f64 = 2.0;
            x.clone() * y + x * two
        }
        assert_eq!(f(3.0, 4.0), 18.0);

        let dirs = AdDirections::for_system(0, 2);
        let r = f(dirs.seeded(3.0, 0, 1.0), dirs.seeded(4.0, 1, 1.0));
        assert_eq!(r.value(), 18.0);
        assert_relative_eq!(dirs.derivative(&r, 0), 6.0);
        assert_relative_eq!(dirs.derivative(&r, 1), 3.0);
    }

    #[test]
    fn test_dense_seeding_jacobian() {
        // f(x, y) = [x^2, xy] at (2, 3)
        let dirs = AdDirections::for_system(1, 2);
        let mut res = dirs.allocate(2);
        let mut y = dirs.allocate(2);
        let mut ad = AdVectors::new(&mut res, &mut y, dirs);
        ad.seed_dense();
        ad.load_values(&[2.0, 3.0]);

        let x0 = ad.y[0].clone();
        let x1 = ad.y[1].clone();
        ad.res[0] = x0.clone() * x0.clone();
        ad.res[1] = x0 * x1;

        let mut plain = [0.0; 2];
        ad.store_residual(&mut plain);
        assert_eq!(plain, [4.0, 6.0]);

        let jac = jacobian_block(ad.res, dirs, 2);
        assert_relative_eq!(jac[(0, 0)], 4.0);
        assert_relative_eq!(jac[(0, 1)], 0.0);
        assert_relative_eq!(jac[(1, 0)], 3.0);
        assert_relative_eq!(jac[(1, 1)], 2.0);

        // The sensitivity direction stays untouched by Jacobian seeds
        assert_eq!(dirs.derivative(&ad.res[1], 0), 0.0);
    }

    #[test]
    fn test_parameter_and_state_directions_combine() {
        // r = p * y with p seeded in direction 0 and y in direction 1
        let dirs = AdDirections::for_system(1, 1);
        let p = dirs.seeded(2.0, 0, 1.0);
        let y = dirs.seeded(5.0, dirs.jacobian_direction(0), 1.0);
        let r = p * y;
        assert_relative_eq!(dirs.derivative(&r, 0), 5.0);
        assert_relative_eq!(dirs.derivative(&r, 1), 2.0);
    }

    #[test]
    fn test_sub_slice_shares_layout() {
        let dirs = AdDirections::for_system(0, 4);
        let mut res = dirs.allocate(4);
        let mut y = dirs.allocate(4);
        let mut ad = AdVectors::new(&mut res, &mut y, dirs);
        let sub = ad.slice(1..3);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.dirs, dirs);
        assert!(!sub.is_empty());
    }
}
