//! # Unitflow: Unit Operations for Differential-Algebraic Process Simulation
//!
//! A contract through which heterogeneous unit operation models (inlets,
//! stirred tanks, columns, ...) take part in one shared DAE system
//! `F(t, y, ẏ, p) = 0`. Every unit owns a contiguous slice of the global state
//! vector and answers requests from a time-integration driver:
//!
//! - residual evaluation, with or without a Jacobian refresh
//! - linear solves with `∂F/∂y + α ∂F/∂ẏ`
//! - consistent initialization of `y` and `ẏ` (full and lean variants)
//! - forward parameter sensitivities via automatic differentiation
//!
//! ## Example
//!
//! ```
//! use unitflow::{ParameterId, SectionTimes, UnitOpId};
//!
//! // Two sections, continuous transition at t = 10
//! let sections = SectionTimes::new(vec![0.0, 10.0, 20.0], vec![true]).unwrap();
//! assert_eq!(sections.n_sections(), 2);
//!
//! // Parameters are addressed by unit, role, and optional indices
//! let id = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(1);
//! assert_eq!(id.section, Some(1));
//! ```
//!
//! Non-increasing section times are rejected:
//!
//! ```
//! use unitflow::SectionTimes;
//!
//! assert!(SectionTimes::new(vec![0.0, 5.0, 5.0], vec![false]).is_err());
//! ```
//!
//! ## Modules
//!
//! - [`unit`]: the [`UnitOperation`] trait and shared unit bookkeeping
//! - [`autodiff`]: AD values, direction budgets, and borrowed AD slices
//! - [`sensitivity`]: per-unit registry of sensitive parameters
//! - [`initialization`]: guard against mixing lean and full initialization
//! - [`params`]: scoped parameter providers
//! - [`profile`]: inlet profiles and external functions
//! - [`recorder`]: solution sinks
//! - [`models`]: the inlet boundary unit and a stirred tank reactor
//! - [`system`]: a feed-forward network of units
//! - [`solvers`]: Newton iteration and an implicit Euler driver

use std::fmt;

pub mod autodiff;
pub mod initialization;
pub mod models;
pub mod params;
pub mod profile;
pub mod recorder;
pub mod sensitivity;
pub mod solvers;
pub mod system;
pub mod unit;

pub use autodiff::{Active, AdDirections, AdVectors, ParamMode, Scalar};
pub use initialization::{InitGuard, InitMode, InitPhase};
pub use params::{JsonParameterProvider, ParameterProvider};
pub use recorder::{SolutionRecorder, SolutionView, StateOrdering};
pub use sensitivity::{SensParam, SensitivityRegistry};
pub use system::ModelSystem;
pub use unit::{BoundaryProfile, UnitBase, UnitOperation, UnitPhase};

/// Identifier of a unit operation within a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitOpId(pub usize);

impl UnitOpId {
    /// Gets the index value.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitOpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit_{:03}", self.0)
    }
}

/// Hashed name of a parameter role (e.g. `"VOLUME"`, `"CONST_COEFF"`).
///
/// Names are hashed with FNV-1a at compile time so that parameter ids stay
/// `Copy` and can be used as constant match patterns.
///
/// # Examples
///
/// ```
/// use unitflow::ParamName;
///
/// const VOLUME: ParamName = ParamName::new("VOLUME");
/// assert_eq!(VOLUME, ParamName::new("VOLUME"));
/// assert_ne!(VOLUME, ParamName::new("volume"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamName(pub u64);

impl ParamName {
    /// Hashes a parameter name.
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            i += 1;
        }
        ParamName(hash)
    }
}

/// Identifies one tunable scalar inside a unit operation.
///
/// Indices that do not apply to a parameter are `None` ("independent").
/// Equality and ordering cover every field, so two ids only collide when they
/// address the same scalar.
///
/// # Examples
///
/// ```
/// use unitflow::{ParameterId, UnitOpId};
///
/// let ka = ParameterId::new("LANGMUIR_KA", UnitOpId(1)).with_component(2).with_bound_state(0);
/// assert_eq!(ka.component, Some(2));
/// assert_eq!(ka.section, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId {
    /// Unit operation that owns the parameter
    pub unit: UnitOpId,
    /// Semantic role of the parameter
    pub name: ParamName,
    /// Component index
    pub component: Option<usize>,
    /// Bound state index
    pub bound_state: Option<usize>,
    /// Section index
    pub section: Option<usize>,
}

impl ParameterId {
    /// Creates a parameter id that is independent of component, bound state and section.
    pub fn new(name: &str, unit: UnitOpId) -> Self {
        Self::from_name(ParamName::new(name), unit)
    }

    /// Creates a parameter id from an already hashed name.
    pub fn from_name(name: ParamName, unit: UnitOpId) -> Self {
        ParameterId { unit, name, component: None, bound_state: None, section: None }
    }

    /// Sets the component index.
    pub fn with_component(mut self, component: usize) -> Self {
        self.component = Some(component);
        self
    }

    /// Sets the bound state index.
    pub fn with_bound_state(mut self, bound_state: usize) -> Self {
        self.bound_state = Some(bound_state);
        self
    }

    /// Sets the section index.
    pub fn with_section(mut self, section: usize) -> Self {
        self.section = Some(section);
        self
    }
}

/// Partition of the integration time span into sections.
///
/// Section `i` covers `[times[i], times[i + 1])`. `continuity[i]` tells whether
/// the transition from section `i` to `i + 1` is continuous; discontinuous
/// transitions force the driver to re-initialize.
///
/// # Invariants
///
/// - At least one section (two time points)
/// - Times are finite and strictly increasing
/// - `continuity.len() == n_sections - 1`
#[derive(Debug, Clone, PartialEq)]
pub struct SectionTimes {
    times: Vec<f64>,
    continuity: Vec<bool>,
}

impl SectionTimes {
    /// Validates and creates a section partition.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSections`] if fewer than two time points
    /// are given, a time is not finite, times are not strictly increasing, or
    /// the continuity flags have the wrong length.
    pub fn new(times: Vec<f64>, continuity: Vec<bool>) -> ConfigResult<Self> {
        if times.len() < 2 {
            return Err(ConfigError::InvalidSections(format!(
                "at least two section times required, got {}",
                times.len()
            )));
        }
        if let Some(t) = times.iter().find(|t| !t.is_finite()) {
            return Err(ConfigError::InvalidSections(format!("section time {t} is not finite")));
        }
        if let Some(w) = times.windows(2).find(|w| w[1] <= w[0]) {
            return Err(ConfigError::InvalidSections(format!(
                "section times must be strictly increasing ({} followed by {})",
                w[0], w[1]
            )));
        }
        if continuity.len() != times.len() - 2 {
            return Err(ConfigError::InvalidSections(format!(
                "expected {} continuity flags for {} sections, got {}",
                times.len() - 2,
                times.len() - 1,
                continuity.len()
            )));
        }
        Ok(SectionTimes { times, continuity })
    }

    /// Creates a single section `[start, end)`.
    pub fn single(start: f64, end: f64) -> ConfigResult<Self> {
        Self::new(vec![start, end], Vec::new())
    }

    /// Number of sections.
    pub fn n_sections(&self) -> usize {
        self.times.len() - 1
    }

    /// All section boundaries.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Continuity flags of the inner boundaries.
    pub fn continuity(&self) -> &[bool] {
        &self.continuity
    }

    /// Start time of a section.
    pub fn start(&self, sec_idx: usize) -> f64 {
        self.times[sec_idx]
    }

    /// End time of a section.
    pub fn end(&self, sec_idx: usize) -> f64 {
        self.times[sec_idx + 1]
    }

    /// Returns whether the transition into section `sec_idx` is continuous.
    ///
    /// The transition into the first section is never continuous.
    pub fn is_continuous_into(&self, sec_idx: usize) -> bool {
        sec_idx > 0 && self.continuity[sec_idx - 1]
    }

    /// Finds the section containing `t` (the last section includes its end).
    pub fn section_index(&self, t: f64) -> Option<usize> {
        let n = self.n_sections();
        if t < self.times[0] || t > self.times[n] {
            return None;
        }
        Some(self.times[1..n].iter().take_while(|&&b| b <= t).count())
    }
}

/// Result type of unit operation calls.
pub type UnitResult<T = ()> = Result<T, UnitError>;

/// Outcome of a failed unit operation call.
///
/// Replaces integer return codes: callers retry `Recoverable` failures with
/// a smaller step, abort on `Fatal`, and treat `Precondition` as a
/// programming error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    /// Domain violation or non-convergence; retry with a smaller step
    #[error("recoverable failure: {0}")]
    Recoverable(String),
    /// Corrupted state or irrecoverable singularity
    #[error("fatal failure: {0}")]
    Fatal(String),
    /// Contract violated by the caller (call order, mixed initialization modes)
    #[error("precondition violated: {0}")]
    Precondition(String),
}

impl UnitError {
    /// Returns true if the caller may retry with a smaller step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, UnitError::Recoverable(_))
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T = ()> = Result<T, ConfigError>;

/// Errors raised while configuring units, sections, or networks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Required parameter does not exist in the current scope
    #[error("missing parameter: {path}")]
    Missing { path: String },
    /// Parameter exists but has the wrong type or an invalid value
    #[error("invalid parameter {path}: {reason}")]
    Invalid { path: String, reason: String },
    /// Scope could not be entered
    #[error("missing scope: {path}")]
    MissingScope { path: String },
    /// Non-structural reconfiguration requested before configuration
    #[error("{0} has not been configured")]
    NotConfigured(UnitOpId),
    /// Section times violate their invariants
    #[error("invalid section times: {0}")]
    InvalidSections(String),
    /// Units cannot be wired together as requested
    #[error("invalid network: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_param_name_hash_is_stable() {
        const CONST_COEFF: ParamName = ParamName::new("CONST_COEFF");
        assert_eq!(CONST_COEFF, ParamName::new("CONST_COEFF"));
        assert_ne!(CONST_COEFF, ParamName::new("LIN_COEFF"));
        // FNV-1a offset basis for the empty string
        assert_eq!(ParamName::new(""), ParamName(0xcbf2_9ce4_8422_2325));
    }

    #[test]
    fn test_parameter_id_equality_covers_all_fields() {
        let base = ParameterId::new("CONST_COEFF", UnitOpId(0));
        let ids = [
            base,
            base.with_component(0),
            base.with_component(1),
            base.with_component(0).with_section(0),
            base.with_component(0).with_bound_state(0),
            ParameterId::new("CONST_COEFF", UnitOpId(1)),
        ];
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert_eq!(base.with_component(3), ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(3));
    }

    #[test]
    fn test_parameter_id_ordering_starts_with_unit() {
        let a = ParameterId::new("ZZZ", UnitOpId(0));
        let b = ParameterId::new("AAA", UnitOpId(1));
        assert!(a < b);
    }

    #[test]
    fn test_section_times_valid() {
        let sections = SectionTimes::new(vec![0.0, 10.0, 25.0], vec![false]).unwrap();
        assert_eq!(sections.n_sections(), 2);
        assert_eq!(sections.start(1), 10.0);
        assert_eq!(sections.end(1), 25.0);
        assert!(!sections.is_continuous_into(0));
        assert!(!sections.is_continuous_into(1));
    }

    #[test]
    fn test_section_times_rejects_non_increasing() {
        assert!(matches!(
            SectionTimes::new(vec![0.0, 10.0, 10.0], vec![true]),
            Err(ConfigError::InvalidSections(_))
        ));
        assert!(SectionTimes::new(vec![5.0, 1.0], vec![]).is_err());
    }

    #[test]
    fn test_section_times_rejects_bad_flags_and_lengths() {
        assert!(SectionTimes::new(vec![0.0], vec![]).is_err());
        assert!(SectionTimes::new(vec![0.0, 1.0, 2.0], vec![]).is_err());
        assert!(SectionTimes::new(vec![0.0, f64::NAN], vec![]).is_err());
    }

    #[test]
    fn test_section_index_lookup() {
        let sections = SectionTimes::new(vec![0.0, 10.0, 20.0, 30.0], vec![true, false]).unwrap();
        assert_eq!(sections.section_index(0.0), Some(0));
        assert_eq!(sections.section_index(9.99), Some(0));
        assert_eq!(sections.section_index(10.0), Some(1));
        assert_eq!(sections.section_index(30.0), Some(2));
        assert_eq!(sections.section_index(30.1), None);
        assert!(sections.is_continuous_into(1));
        assert!(!sections.is_continuous_into(2));
    }

    #[test]
    fn test_unit_error_classification() {
        assert!(UnitError::Recoverable("negative concentration".into()).is_recoverable());
        assert!(!UnitError::Fatal("nan".into()).is_recoverable());
        assert!(!UnitError::Precondition("order".into()).is_recoverable());
    }
}
