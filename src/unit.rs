//! The unit operation contract.
//!
//! Every model taking part in the global DAE `F(t, y, ẏ, p) = 0` implements
//! [`UnitOperation`]. A unit owns the contiguous slice `y[offset..offset + num_dofs()]`
//! and only ever sees that slice; the network layer (see [`crate::system`])
//! assembles the coupling between units.
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured --configure--> Configured --set_section_times + prepare_ad_vectors--> SectionReady
//!     SectionReady --notify_discontinuous_section_transition--> Active
//!     Active: consistent init -> residual / linear_solve ... -> [sensitivities]
//! ```
//!
//! Operations that need a configured unit fail with
//! [`UnitError::Precondition`] when called too early.
//!
//! # Local layout
//!
//! Stateful units place their inlet coupling DOFs first. For a unit with
//! `n` components the inlet concentrations sit at
//! `local_inlet_component_index() + i * local_inlet_component_stride()`.
//! The coupling rows read `res = y_in`; the network subtracts the upstream
//! outlet so that the global equation becomes `y_in - y_upstream = 0`.

use std::collections::BTreeMap;

use crate::autodiff::{Active, AdDirections, AdVectors, ParamMode, Scalar};
use crate::initialization::InitGuard;
use crate::params::ParameterProvider;
use crate::profile::SharedFunction;
use crate::recorder::SolutionRecorder;
use crate::sensitivity::SensitivityRegistry;
use crate::{ConfigError, ConfigResult, ParameterId, SectionTimes, UnitError, UnitOpId, UnitResult};

/// Time at which a unit is evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationTime {
    /// Simulation time
    pub t: f64,
    /// Index of the section containing `t`
    pub sec_idx: usize,
    /// Factor applied to every `∂/∂ẏ` contribution (time transformation)
    pub time_factor: f64,
}

impl SimulationTime {
    /// Time `t` in section `sec_idx` with unit time factor.
    pub fn new(t: f64, sec_idx: usize) -> Self {
        SimulationTime { t, sec_idx, time_factor: 1.0 }
    }

    /// Replaces the time factor.
    pub fn with_time_factor(mut self, time_factor: f64) -> Self {
        self.time_factor = time_factor;
        self
    }
}

/// Borrowed state and time derivative of one unit.
#[derive(Debug, Clone, Copy)]
pub struct ConstState<'a> {
    /// Local state
    pub y: &'a [f64],
    /// Local time derivative, same layout as `y`
    pub y_dot: &'a [f64],
}

impl<'a> ConstState<'a> {
    /// Pairs a state with its time derivative.
    pub fn new(y: &'a [f64], y_dot: &'a [f64]) -> Self {
        ConstState { y, y_dot }
    }
}

/// Lifecycle phase of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitPhase {
    /// Created, no parameters read yet
    Unconfigured,
    /// Parameters read; structure and DOF count are fixed
    Configured,
    /// Section times known and AD vectors prepared
    SectionReady,
    /// Inside a section after a discontinuous transition
    Active,
}

/// Time profile exposed by zero-DOF boundary units.
pub trait BoundaryProfile {
    /// Outlet concentrations at `t`.
    fn outlet_values(&self, t: f64, sec_idx: usize, out: &mut [f64]);

    /// Time derivatives of the outlet concentrations at `t`.
    fn outlet_time_derivatives(&self, t: f64, sec_idx: usize, out: &mut [f64]);

    /// Outlet concentrations with sensitive parameters seeded in `dirs`.
    fn outlet_values_ad(&self, t: f64, sec_idx: usize, dirs: &AdDirections, out: &mut [Active]);
}

/// Interface every unit operation model implements.
///
/// All state-related slices (`y`, `ẏ`, `res`, AD buffers, sensitivity
/// vectors) cover exactly the unit's `num_dofs()` entries.
pub trait UnitOperation: Send {
    /// Identifier assigned at construction.
    fn unit_operation_id(&self) -> UnitOpId;

    /// Model name, e.g. `"INLET"`.
    fn unit_operation_name(&self) -> &'static str;

    /// Number of chemical components.
    fn num_components(&self) -> usize;

    /// Number of DOFs including coupling DOFs.
    fn num_dofs(&self) -> usize;

    /// Number of DOFs excluding coupling DOFs.
    fn num_pure_dofs(&self) -> usize;

    /// Whether the Jacobian is assembled with AD.
    fn uses_ad(&self) -> bool;

    /// Number of AD directions needed for the Jacobian (sensitivity directions excluded).
    fn required_ad_dirs(&self) -> usize;

    /// Whether the unit receives a stream.
    fn has_inlet(&self) -> bool;

    /// Whether the unit releases a stream.
    fn has_outlet(&self) -> bool;

    /// Whether inlet and outlet flow may differ.
    fn can_accumulate(&self) -> bool;

    /// Local index of the first inlet component DOF.
    fn local_inlet_component_index(&self) -> usize;

    /// Distance between consecutive inlet component DOFs.
    fn local_inlet_component_stride(&self) -> usize;

    /// Local index of the first outlet component DOF.
    fn local_outlet_component_index(&self) -> usize;

    /// Distance between consecutive outlet component DOFs.
    fn local_outlet_component_stride(&self) -> usize;

    /// Loads structural and non-structural parameters.
    ///
    /// # Arguments
    ///
    /// * `provider` - Parameter source scoped to this unit; the scope is unchanged on return
    fn configure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult;

    /// Reloads non-structural parameters. The DOF count does not change.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotConfigured`] before a successful [`configure`](Self::configure).
    fn reconfigure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult;

    /// Current values of every parameter.
    fn all_parameter_values(&self) -> BTreeMap<ParameterId, f64>;

    fn has_parameter(&self, id: &ParameterId) -> bool;

    /// Sets a parameter value. Returns false if the unit does not own the parameter.
    fn set_parameter(&mut self, id: &ParameterId, value: f64) -> bool;

    /// Marks a parameter as sensitive.
    ///
    /// Returns false if the unit does not own the parameter. Registering an
    /// already sensitive parameter keeps its first direction.
    fn set_sensitive_parameter(&mut self, id: &ParameterId, direction: usize, seed: f64) -> bool;

    /// Updates the value of a sensitive parameter; unknown ids are ignored.
    fn set_sensitive_parameter_value(&mut self, id: &ParameterId, value: f64);

    fn clear_sens_params(&mut self);

    /// Switches between analytic and AD Jacobians. Returns the effective setting.
    fn use_analytic_jacobian(&mut self, analytic: bool) -> bool;

    /// Receives the section partition of the run.
    fn set_section_times(&mut self, sections: &SectionTimes) -> ConfigResult;

    /// Sets inlet and outlet volumetric flow for the current section.
    fn set_flow_rates(&mut self, in_flow: &Active, out_flow: &Active);

    /// Injects shared external functions.
    fn set_external_functions(&mut self, _functions: &[SharedFunction]) {}

    /// Seeds the unit's Jacobian directions once per run.
    fn prepare_ad_vectors(&mut self, ad: &mut AdVectors<'_>) -> UnitResult;

    /// Announces the start of the run or a discontinuous section boundary.
    ///
    /// Opens a new initialization event.
    fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize, ad: &mut AdVectors<'_>) -> UnitResult;

    /// Writes the configured initial values.
    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]);

    /// Writes initial values read from `provider` (`INIT_STATE` or per-block keys).
    fn apply_initial_condition_from(&mut self, provider: &mut dyn ParameterProvider, y: &mut [f64], y_dot: &mut [f64]) -> ConfigResult;

    /// Evaluates `F(t, y, ẏ)` into `res`.
    fn residual(&mut self, time: SimulationTime, state: ConstState<'_>, res: &mut [f64]) -> UnitResult;

    /// Evaluates the residual and refreshes the stored Jacobians.
    fn residual_with_jacobian(&mut self, time: SimulationTime, state: ConstState<'_>, res: &mut [f64], ad: &mut AdVectors<'_>) -> UnitResult;

    /// Evaluates the residual with sensitive parameters seeded.
    ///
    /// Afterwards `ad_res[i]` carries `∂F_i/∂p_k` in direction `k`.
    fn residual_sens_fwd_ad_only(&mut self, time: SimulationTime, state: ConstState<'_>, ad_res: &mut [Active], dirs: AdDirections) -> UnitResult;

    /// Fused variant: refreshes the Jacobians and `∂F/∂p` from one evaluation.
    fn residual_sens_fwd_with_jacobian(&mut self, time: SimulationTime, state: ConstState<'_>, ad: &mut AdVectors<'_>) -> UnitResult;

    /// Assembles `res_s[k] = ∂F/∂y s_k + ∂F/∂ẏ ṡ_k + ∂F/∂p_k` for every sensitivity.
    ///
    /// # Arguments
    ///
    /// * `ys` / `ys_dot` - Sensitivity states and their time derivatives
    /// * `res_s` - Output, one slice per sensitivity
    /// * `ad_res` - AD residual from the last sensitivity sweep
    fn residual_sens_fwd_combine(
        &mut self,
        time: SimulationTime,
        ys: &[&[f64]],
        ys_dot: &[&[f64]],
        res_s: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult;

    /// Solves `(∂F/∂y + α ∂F/∂ẏ) x = rhs` in place using the stored Jacobians.
    ///
    /// # Arguments
    ///
    /// * `alpha` - Factor of the time-derivative Jacobian
    /// * `tol` - Accuracy bound for iterative solvers
    /// * `rhs` - Right-hand side, overwritten by the solution
    /// * `weight` - Error weights
    fn linear_solve(&mut self, time: SimulationTime, alpha: f64, tol: f64, rhs: &mut [f64], weight: &[f64], state: ConstState<'_>) -> UnitResult;

    /// Computes `ret = α ∂F/∂y x + β ret`.
    fn multiply_with_jacobian(&self, x: &[f64], alpha: f64, beta: f64, ret: &mut [f64]);

    /// Computes `ret = ∂F/∂ẏ x` including the time factor.
    fn multiply_with_derivative_jacobian(&self, x: &[f64], ret: &mut [f64], time_factor: f64);

    /// Solves the algebraic subset of `y`. Does not touch `ẏ`.
    fn consistent_initial_state(&mut self, time: SimulationTime, y: &mut [f64], ad: &mut AdVectors<'_>, error_tol: f64) -> UnitResult;

    /// Computes `ẏ` so that `F(t, y, ẏ) = 0`.
    fn consistent_initial_time_derivative(&mut self, time: SimulationTime, y: &[f64], y_dot: &mut [f64]) -> UnitResult;

    /// Lean variant of [`consistent_initial_state`](Self::consistent_initial_state).
    fn lean_consistent_initial_state(&mut self, time: SimulationTime, y: &mut [f64], ad: &mut AdVectors<'_>, error_tol: f64) -> UnitResult;

    /// Lean variant of [`consistent_initial_time_derivative`](Self::consistent_initial_time_derivative).
    ///
    /// `res` holds the residual at the current `(y, ẏ)`.
    fn lean_consistent_initial_time_derivative(&mut self, t: f64, time_factor: f64, y_dot: &mut [f64], res: &[f64]) -> UnitResult;

    /// Computes consistent `(s_k, ṡ_k)` at a consistent base point.
    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        state: ConstState<'_>,
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult;

    /// Lean variant of [`consistent_initial_sensitivity`](Self::consistent_initial_sensitivity).
    fn lean_consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        state: ConstState<'_>,
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult;

    /// Expands a short tolerance specification to one tolerance per DOF.
    ///
    /// A single value applies to every DOF; one value per component applies to
    /// every DOF of that component.
    fn expand_error_tol(&self, tol: &[f64], expanded: &mut [f64]) {
        expand_uniform(tol, expanded);
    }

    /// Sends the unit's solution at `time` to `recorder`.
    ///
    /// Zero-DOF units report their profile evaluated at `time`.
    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, time: SimulationTime, solution: &[f64]);

    /// Sends the unit's layout to `recorder`.
    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder);

    /// Boundary profile of zero-DOF units.
    fn as_boundary(&self) -> Option<&dyn BoundaryProfile> {
        None
    }
}

/// Broadcasts a single tolerance, or copies a full one.
pub fn expand_uniform(tol: &[f64], expanded: &mut [f64]) {
    match tol {
        [] => {}
        [single] => expanded.fill(*single),
        _ => {
            for (e, t) in expanded.iter_mut().zip(tol.iter().cycle()) {
                *e = *t;
            }
        }
    }
}

/// Bookkeeping shared by every unit implementation.
#[derive(Clone)]
pub struct UnitBase {
    id: UnitOpId,
    phase: UnitPhase,
    sections: Option<SectionTimes>,
    /// Sensitive parameters
    pub sens: SensitivityRegistry,
    /// Initialization event guard
    pub init: InitGuard,
    functions: Vec<SharedFunction>,
    analytic_jacobian: bool,
}

impl std::fmt::Debug for UnitBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitBase")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("sensitive", &self.sens.len())
            .field("analytic_jacobian", &self.analytic_jacobian)
            .finish()
    }
}

impl UnitBase {
    /// Unconfigured bookkeeping for unit `id`.
    pub fn new(id: UnitOpId) -> Self {
        UnitBase {
            id,
            phase: UnitPhase::Unconfigured,
            sections: None,
            sens: SensitivityRegistry::new(),
            init: InitGuard::new(),
            functions: Vec::new(),
            analytic_jacobian: false,
        }
    }

    pub fn id(&self) -> UnitOpId {
        self.id
    }

    pub fn phase(&self) -> UnitPhase {
        self.phase
    }

    pub fn is_configured(&self) -> bool {
        self.phase != UnitPhase::Unconfigured
    }

    /// Records a successful structural configuration.
    pub fn mark_configured(&mut self) {
        self.phase = UnitPhase::Configured;
        self.init.reset();
        tracing::debug!(unit = %self.id, "configured");
    }

    /// Fails unless the unit has been configured.
    pub fn require_configured(&self, operation: &str) -> UnitResult {
        if self.is_configured() {
            Ok(())
        } else {
            Err(UnitError::Precondition(format!("{operation} called on unconfigured {}", self.id)))
        }
    }

    /// Fails with [`ConfigError::NotConfigured`] before configuration.
    pub fn require_reconfigurable(&self) -> ConfigResult {
        if self.is_configured() {
            Ok(())
        } else {
            tracing::error!(unit = %self.id, "reconfigure called before configure");
            Err(ConfigError::NotConfigured(self.id))
        }
    }

    pub fn set_sections(&mut self, sections: &SectionTimes) {
        self.sections = Some(sections.clone());
    }

    pub fn sections(&self) -> Option<&SectionTimes> {
        self.sections.as_ref()
    }

    /// Records AD preparation; requires configuration and section times.
    pub fn mark_prepared(&mut self) -> UnitResult {
        self.require_configured("prepare_ad_vectors")?;
        if self.sections.is_none() {
            return Err(UnitError::Precondition(format!("{} has no section times", self.id)));
        }
        self.phase = UnitPhase::SectionReady;
        Ok(())
    }

    /// Enters a section after a discontinuous transition.
    pub fn enter_section(&mut self, t: f64, sec_idx: usize) -> UnitResult {
        match self.phase {
            UnitPhase::SectionReady | UnitPhase::Active => {}
            phase => {
                return Err(UnitError::Precondition(format!(
                    "{} notified of section {sec_idx} in phase {phase:?}",
                    self.id
                )));
            }
        }
        if let Some(n) = self.sections.as_ref().map(SectionTimes::n_sections)
            && sec_idx >= n
        {
            return Err(UnitError::Precondition(format!("section {sec_idx} out of range ({n} sections)")));
        }
        self.phase = UnitPhase::Active;
        self.init.reset();
        tracing::debug!(unit = %self.id, t, sec_idx, "discontinuous section transition");
        Ok(())
    }

    /// Value of a parameter as scalar `S`; seeded if sensitive and `mode` asks for it.
    pub fn param<S: Scalar>(&self, id: &ParameterId, value: f64, mode: ParamMode) -> S {
        match mode {
            ParamMode::Plain => S::from_f64(value),
            ParamMode::Sensitive(dirs) => S::from_active(&self.sens.active(id, value, &dirs)),
        }
    }

    pub fn set_functions(&mut self, functions: &[SharedFunction]) {
        self.functions = functions.to_vec();
    }

    /// External function by index.
    pub fn function(&self, idx: usize) -> Option<&SharedFunction> {
        self.functions.get(idx)
    }

    pub fn analytic_jacobian(&self) -> bool {
        self.analytic_jacobian
    }

    pub fn set_analytic_jacobian(&mut self, analytic: bool) {
        self.analytic_jacobian = analytic;
    }
}

/// Fails with [`UnitError::Fatal`] if a buffer does not have the expected length.
pub fn check_len(name: &str, actual: usize, expected: usize) -> UnitResult {
    if actual == expected {
        Ok(())
    } else {
        Err(UnitError::Fatal(format!("{name} has {actual} entries, expected {expected}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::AdDirections;

    #[test]
    fn test_expand_uniform() {
        let mut out = [0.0; 4];
        expand_uniform(&[1e-6], &mut out);
        assert_eq!(out, [1e-6; 4]);
        expand_uniform(&[1.0, 2.0], &mut out);
        assert_eq!(out, [1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_base_lifecycle() {
        let mut base = UnitBase::new(UnitOpId(2));
        assert_eq!(base.phase(), UnitPhase::Unconfigured);
        assert!(base.require_configured("residual").is_err());
        assert_eq!(base.require_reconfigurable(), Err(ConfigError::NotConfigured(UnitOpId(2))));

        base.mark_configured();
        assert!(base.mark_prepared().is_err());
        assert!(base.enter_section(0.0, 0).is_err());

        base.set_sections(&SectionTimes::single(0.0, 10.0).unwrap());
        base.mark_prepared().unwrap();
        assert_eq!(base.phase(), UnitPhase::SectionReady);
        assert!(base.enter_section(0.0, 1).is_err());
        base.enter_section(0.0, 0).unwrap();
        assert_eq!(base.phase(), UnitPhase::Active);
    }

    #[test]
    fn test_param_modes() {
        let mut base = UnitBase::new(UnitOpId(0));
        let id = ParameterId::new("VOLUME", UnitOpId(0));
        base.sens.insert(id, 0, 1.0);
        let dirs = AdDirections::for_system(1, 2);

        let plain: f64 = base.param(&id, 5.0, ParamMode::Sensitive(dirs));
        assert_eq!(plain, 5.0);
        let active: Active = base.param(&id, 5.0, ParamMode::Sensitive(dirs));
        assert_eq!(dirs.derivative(&active, 0), 1.0);
        let constant: Active = base.param(&id, 5.0, ParamMode::Plain);
        assert_eq!(dirs.derivative(&constant, 0), 0.0);
    }

    #[test]
    fn test_check_len() {
        assert!(check_len("res", 3, 3).is_ok());
        assert!(matches!(check_len("res", 2, 3), Err(UnitError::Fatal(_))));
    }
}
