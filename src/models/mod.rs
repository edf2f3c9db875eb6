//! Unit operation models.
//!
//! This module provides implementations of the [`UnitOperation`](crate::UnitOperation)
//! contract organized as individual files:
//!
//! - **Inlet**: zero-DOF boundary unit emitting a piecewise cubic (or
//!   externally supplied) concentration profile
//! - **Cstr**: Continuous Stirred Tank Reactor with first-order decay and
//!   optional Langmuir binding (kinetic or quasi-stationary)
//!
//! ## Example
//!
//! ```
//! use unitflow::models::{Cstr, Inlet};
//! use unitflow::{UnitOpId, UnitOperation};
//!
//! let inlet = Inlet::new(UnitOpId(0));
//! let cstr = Cstr::new(UnitOpId(1));
//!
//! assert_eq!(inlet.unit_operation_name(), "INLET");
//! assert_eq!(cstr.unit_operation_name(), "CSTR");
//! assert!(cstr.has_inlet() && !inlet.has_inlet());
//! ```
//!
//! # Creating a New Model
//!
//! ## Step 1: Lay out the local state
//!
//! Stateful units place their inlet coupling DOFs first and report them
//! through `local_inlet_component_index/stride`. Their coupling rows read
//! `res = y_in`; the network subtracts the upstream outlet.
//!
//! ```text
//! [ c_in (n_comp) | pure DOFs ... ]
//! ```
//!
//! ## Step 2: Write one generic residual
//!
//! Write the residual once over [`Scalar`](crate::Scalar). Plain evaluation
//! instantiates it with `f64`; Jacobian and sensitivity sweeps instantiate it
//! with [`Active`](crate::Active). Parameters are fetched through
//! [`UnitBase::param`](crate::UnitBase::param) so that registered sensitive
//! parameters carry their seeds.
//!
//! ## Step 3: Keep the bookkeeping in `UnitBase`
//!
//! [`UnitBase`](crate::UnitBase) tracks the lifecycle phase, section times,
//! the sensitive parameter registry and the initialization guard. Every
//! consistent-initialization method enters its phase through
//! `base.init.enter(..)` before doing any work.
//!
//! ## Step 4: Store the Jacobians
//!
//! `residual_with_jacobian` refreshes `∂F/∂y`; `∂F/∂ẏ` is usually constant
//! per configuration. `linear_solve`, `multiply_with_jacobian` and the
//! sensitivity methods only read the stored matrices.

mod cstr;
mod inlet;

pub use cstr::{BindingMode, Cstr};
pub use inlet::Inlet;
