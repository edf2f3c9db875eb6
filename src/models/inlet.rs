//! Inlet boundary unit.
//!
//! The inlet has no degrees of freedom. Its "solution" is a concentration
//! profile over time which downstream units receive through the network
//! coupling. Every contract operation that acts on state is a no-op.
//!
//! # Configuration
//!
//! ```text
//! NCOMP        number of components
//! INLET_TYPE   "PIECEWISE_CUBIC_POLY" (default) or "EXTERNAL"
//! sec_000/     CONST_COEFF, LIN_COEFF, QUAD_COEFF, CUBE_COEFF (one entry per component)
//! sec_001/     ...
//! ```
//!
//! The polynomial coefficients are parameters (component and section
//! dependent) and may be marked sensitive.
//!
//! # Example
//!
//! ```
//! use unitflow::models::Inlet;
//! use unitflow::params::JsonParameterProvider;
//! use unitflow::{SectionTimes, UnitOpId, UnitOperation, BoundaryProfile};
//!
//! let mut provider = JsonParameterProvider::parse(r#"{
//!     "NCOMP": 2,
//!     "sec_000": { "CONST_COEFF": [1.0, 0.0], "LIN_COEFF": [0.5, 0.0] }
//! }"#).unwrap();
//!
//! let mut inlet = Inlet::new(UnitOpId(0));
//! inlet.configure(&mut provider).unwrap();
//! inlet.set_section_times(&SectionTimes::single(0.0, 10.0).unwrap()).unwrap();
//! assert_eq!(inlet.num_dofs(), 0);
//!
//! let mut c = [0.0; 2];
//! inlet.outlet_values(4.0, 0, &mut c);
//! assert_eq!(c, [3.0, 0.0]);
//! ```

use std::collections::BTreeMap;

use crate::autodiff::{Active, AdDirections, AdVectors, constant};
use crate::initialization::{InitMode, InitPhase};
use crate::params::{ParameterProvider, get_double_array_len, section_scope, with_scope};
use crate::profile::{CoeffOrder, InletProfile, PiecewiseCubicProfile};
use crate::recorder::{SolutionRecorder, SolutionView, StridedSlice};
use crate::unit::{BoundaryProfile, ConstState, SimulationTime, UnitBase, UnitOperation, check_len};
use crate::{ConfigError, ConfigResult, ParamName, ParameterId, SectionTimes, UnitOpId, UnitResult};

const CONST_COEFF: ParamName = ParamName::new("CONST_COEFF");
const LIN_COEFF: ParamName = ParamName::new("LIN_COEFF");
const QUAD_COEFF: ParamName = ParamName::new("QUAD_COEFF");
const CUBE_COEFF: ParamName = ParamName::new("CUBE_COEFF");

fn coeff_order(name: ParamName) -> Option<CoeffOrder> {
    match name {
        CONST_COEFF => Some(CoeffOrder::Const),
        LIN_COEFF => Some(CoeffOrder::Lin),
        QUAD_COEFF => Some(CoeffOrder::Quad),
        CUBE_COEFF => Some(CoeffOrder::Cube),
        _ => None,
    }
}

fn coeff_name(order: CoeffOrder) -> ParamName {
    match order {
        CoeffOrder::Const => CONST_COEFF,
        CoeffOrder::Lin => LIN_COEFF,
        CoeffOrder::Quad => QUAD_COEFF,
        CoeffOrder::Cube => CUBE_COEFF,
    }
}

enum ProfileSource {
    Polynomial(PiecewiseCubicProfile),
    External(Box<dyn InletProfile>),
}

/// Zero-DOF boundary unit injecting a concentration profile.
pub struct Inlet {
    base: UnitBase,
    n_comp: usize,
    source: ProfileSource,
    flow_rate: f64,
}

impl Inlet {
    /// Creates an inlet with a piecewise cubic polynomial profile.
    pub fn new(id: UnitOpId) -> Self {
        Inlet {
            base: UnitBase::new(id),
            n_comp: 0,
            source: ProfileSource::Polynomial(PiecewiseCubicProfile::new(0)),
            flow_rate: 0.0,
        }
    }

    /// Creates an inlet driven by an external profile (`INLET_TYPE = "EXTERNAL"`).
    pub fn with_profile(id: UnitOpId, profile: Box<dyn InletProfile>) -> Self {
        Inlet { source: ProfileSource::External(profile), ..Self::new(id) }
    }

    /// Volumetric flow leaving the inlet.
    pub fn flow_rate(&self) -> f64 {
        self.flow_rate
    }

    fn coeff_id(&self, order: CoeffOrder, comp: usize, sec_idx: usize) -> ParameterId {
        ParameterId::from_name(coeff_name(order), self.base.id()).with_component(comp).with_section(sec_idx)
    }

    fn read_coefficients(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        let n_comp = self.n_comp;
        let mut profile = PiecewiseCubicProfile::new(n_comp);
        let mut sec_idx = 0;
        while provider.exists(&section_scope(sec_idx)) {
            let coeffs = with_scope(provider, &section_scope(sec_idx), |p| {
                let mut coeffs = Vec::with_capacity(4);
                for order in CoeffOrder::ALL {
                    let key = order.key();
                    if order == CoeffOrder::Const || p.exists(key) {
                        coeffs.push(get_double_array_len(&*p, key, n_comp)?);
                    } else {
                        coeffs.push(vec![0.0; n_comp]);
                    }
                }
                Ok(coeffs)
            })?;
            profile.push_section(&coeffs[0], &coeffs[1], &coeffs[2], &coeffs[3]);
            sec_idx += 1;
        }
        if sec_idx == 0 {
            let path = provider.path_of(&section_scope(0));
            tracing::error!(unit = %self.base.id(), %path, "inlet profile has no sections");
            return Err(ConfigError::Missing { path });
        }

        // Section start times survive reconfiguration
        if let Some(sections) = self.base.sections() {
            if sec_idx < sections.n_sections() {
                let path = provider.path_of(&section_scope(sec_idx));
                tracing::error!(unit = %self.base.id(), %path, sections = sections.n_sections(), "inlet profile does not cover every section");
                return Err(ConfigError::Invalid {
                    path,
                    reason: format!("profile defines {sec_idx} sections, section times define {}", sections.n_sections()),
                });
            }
            profile.set_section_starts(sections.times());
        }
        self.source = ProfileSource::Polynomial(profile);
        tracing::debug!(unit = %self.base.id(), sections = sec_idx, "inlet profile loaded");
        Ok(())
    }

    fn zero_dof_call(&self, res_len: usize) -> UnitResult {
        self.base.require_configured("residual")?;
        check_len("inlet residual", res_len, 0)
    }
}

impl BoundaryProfile for Inlet {
    fn outlet_values(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        match &self.source {
            ProfileSource::Polynomial(profile) => profile.evaluate(t, sec_idx, out),
            ProfileSource::External(profile) => profile.evaluate(t, sec_idx, out),
        }
    }

    fn outlet_time_derivatives(&self, t: f64, sec_idx: usize, out: &mut [f64]) {
        match &self.source {
            ProfileSource::Polynomial(profile) => profile.evaluate_time_derivative(t, sec_idx, out),
            ProfileSource::External(profile) => profile.evaluate_time_derivative(t, sec_idx, out),
        }
    }

    fn outlet_values_ad(&self, t: f64, sec_idx: usize, dirs: &AdDirections, out: &mut [Active]) {
        match &self.source {
            ProfileSource::Polynomial(profile) => {
                for (comp, o) in out.iter_mut().enumerate().take(self.n_comp) {
                    *o = profile.evaluate_with(t, sec_idx, comp, |order, c| {
                        self.base.sens.active(&self.coeff_id(order, comp, sec_idx), c, dirs)
                    });
                }
            }
            ProfileSource::External(profile) => {
                let mut values = vec![0.0; self.n_comp];
                profile.evaluate(t, sec_idx, &mut values);
                for (o, v) in out.iter_mut().zip(values) {
                    *o = constant(v);
                }
            }
        }
    }
}

impl UnitOperation for Inlet {
    fn unit_operation_id(&self) -> UnitOpId {
        self.base.id()
    }

    fn unit_operation_name(&self) -> &'static str {
        "INLET"
    }

    fn num_components(&self) -> usize {
        self.n_comp
    }

    fn num_dofs(&self) -> usize {
        0
    }

    fn num_pure_dofs(&self) -> usize {
        0
    }

    fn uses_ad(&self) -> bool {
        false
    }

    fn required_ad_dirs(&self) -> usize {
        0
    }

    fn has_inlet(&self) -> bool {
        false
    }

    fn has_outlet(&self) -> bool {
        true
    }

    fn can_accumulate(&self) -> bool {
        true
    }

    fn local_inlet_component_index(&self) -> usize {
        0
    }

    fn local_inlet_component_stride(&self) -> usize {
        0
    }

    fn local_outlet_component_index(&self) -> usize {
        0
    }

    fn local_outlet_component_stride(&self) -> usize {
        0
    }

    fn configure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        let n_comp = provider.get_int("NCOMP")?;
        if n_comp <= 0 {
            return Err(ConfigError::Invalid { path: provider.path_of("NCOMP"), reason: format!("must be positive, got {n_comp}") });
        }
        self.n_comp = n_comp as usize;

        let inlet_type =
            if provider.exists("INLET_TYPE") { provider.get_string("INLET_TYPE")? } else { "PIECEWISE_CUBIC_POLY".to_string() };
        let external_components = match &self.source {
            ProfileSource::External(profile) => Some(profile.num_components()),
            ProfileSource::Polynomial(_) => None,
        };
        match (inlet_type.as_str(), external_components) {
            ("PIECEWISE_CUBIC_POLY", _) => self.read_coefficients(provider)?,
            ("EXTERNAL", Some(n)) => {
                if n != self.n_comp {
                    return Err(ConfigError::Invalid {
                        path: provider.path_of("NCOMP"),
                        reason: format!("external profile has {n} components"),
                    });
                }
            }
            (other, _) => {
                let path = provider.path_of("INLET_TYPE");
                tracing::error!(%path, inlet_type = other, "unsupported inlet type");
                return Err(ConfigError::Invalid { path, reason: format!("unsupported inlet type {other}") });
            }
        }

        self.base.mark_configured();
        tracing::info!(unit = %self.base.id(), n_comp = self.n_comp, inlet_type = %inlet_type, "inlet configured");
        Ok(())
    }

    fn reconfigure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        self.base.require_reconfigurable()?;
        if matches!(self.source, ProfileSource::Polynomial(_)) {
            self.read_coefficients(provider)?;
        }
        Ok(())
    }

    fn all_parameter_values(&self) -> BTreeMap<ParameterId, f64> {
        let mut values = BTreeMap::new();
        if let ProfileSource::Polynomial(profile) = &self.source {
            for sec_idx in 0..profile.n_sections() {
                for comp in 0..self.n_comp {
                    for order in CoeffOrder::ALL {
                        if let Some(v) = profile.coefficient(sec_idx, comp, order) {
                            values.insert(self.coeff_id(order, comp, sec_idx), v);
                        }
                    }
                }
            }
        }
        values
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        let ProfileSource::Polynomial(profile) = &self.source else {
            return false;
        };
        id.unit == self.base.id()
            && coeff_order(id.name).is_some()
            && id.bound_state.is_none()
            && id.component.is_some_and(|c| c < self.n_comp)
            && id.section.is_some_and(|s| s < profile.n_sections())
    }

    fn set_parameter(&mut self, id: &ParameterId, value: f64) -> bool {
        if !self.has_parameter(id) {
            return false;
        }
        match (&mut self.source, coeff_order(id.name), id.component, id.section) {
            (ProfileSource::Polynomial(profile), Some(order), Some(comp), Some(sec_idx)) => {
                profile.set_coefficient(sec_idx, comp, order, value)
            }
            _ => false,
        }
    }

    fn set_sensitive_parameter(&mut self, id: &ParameterId, direction: usize, seed: f64) -> bool {
        if !self.has_parameter(id) {
            return false;
        }
        self.base.sens.insert(*id, direction, seed);
        true
    }

    fn set_sensitive_parameter_value(&mut self, id: &ParameterId, value: f64) {
        if self.base.sens.contains(id) {
            self.set_parameter(id, value);
        }
    }

    fn clear_sens_params(&mut self) {
        self.base.sens.clear();
    }

    fn use_analytic_jacobian(&mut self, _analytic: bool) -> bool {
        // Nothing to differentiate
        true
    }

    fn set_section_times(&mut self, sections: &SectionTimes) -> ConfigResult {
        if let ProfileSource::Polynomial(profile) = &mut self.source {
            if profile.n_sections() < sections.n_sections() {
                let reason = format!("{} sections configured, {} required", profile.n_sections(), sections.n_sections());
                tracing::error!(unit = %self.base.id(), %reason, "inlet profile too short");
                return Err(ConfigError::Invalid { path: section_scope(profile.n_sections()), reason });
            }
            profile.set_section_starts(sections.times());
        }
        self.base.set_sections(sections);
        Ok(())
    }

    fn set_flow_rates(&mut self, _in_flow: &Active, out_flow: &Active) {
        self.flow_rate = out_flow.re;
    }

    fn prepare_ad_vectors(&mut self, _ad: &mut AdVectors<'_>) -> UnitResult {
        self.base.mark_prepared()
    }

    fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize, _ad: &mut AdVectors<'_>) -> UnitResult {
        self.base.enter_section(t, sec_idx)
    }

    fn apply_initial_condition(&self, _y: &mut [f64], _y_dot: &mut [f64]) {}

    fn apply_initial_condition_from(&mut self, _provider: &mut dyn ParameterProvider, _y: &mut [f64], _y_dot: &mut [f64]) -> ConfigResult {
        Ok(())
    }

    fn residual(&mut self, _time: SimulationTime, _state: ConstState<'_>, res: &mut [f64]) -> UnitResult {
        self.zero_dof_call(res.len())
    }

    fn residual_with_jacobian(&mut self, _time: SimulationTime, _state: ConstState<'_>, res: &mut [f64], _ad: &mut AdVectors<'_>) -> UnitResult {
        self.zero_dof_call(res.len())
    }

    fn residual_sens_fwd_ad_only(&mut self, _time: SimulationTime, _state: ConstState<'_>, ad_res: &mut [Active], dirs: AdDirections) -> UnitResult {
        self.base.sens.validate(&dirs)?;
        self.zero_dof_call(ad_res.len())
    }

    fn residual_sens_fwd_with_jacobian(&mut self, _time: SimulationTime, _state: ConstState<'_>, ad: &mut AdVectors<'_>) -> UnitResult {
        self.base.sens.validate(&ad.dirs)?;
        self.zero_dof_call(ad.len())
    }

    fn residual_sens_fwd_combine(
        &mut self,
        _time: SimulationTime,
        _ys: &[&[f64]],
        _ys_dot: &[&[f64]],
        _res_s: &mut [&mut [f64]],
        _ad_res: &[Active],
        _dirs: AdDirections,
    ) -> UnitResult {
        Ok(())
    }

    fn linear_solve(&mut self, _time: SimulationTime, _alpha: f64, _tol: f64, _rhs: &mut [f64], _weight: &[f64], _state: ConstState<'_>) -> UnitResult {
        Ok(())
    }

    fn multiply_with_jacobian(&self, _x: &[f64], _alpha: f64, _beta: f64, _ret: &mut [f64]) {}

    fn multiply_with_derivative_jacobian(&self, _x: &[f64], _ret: &mut [f64], _time_factor: f64) {}

    fn consistent_initial_state(&mut self, _time: SimulationTime, _y: &mut [f64], _ad: &mut AdVectors<'_>, _error_tol: f64) -> UnitResult {
        self.base.init.enter(InitPhase::State, InitMode::Full)
    }

    fn consistent_initial_time_derivative(&mut self, _time: SimulationTime, _y: &[f64], _y_dot: &mut [f64]) -> UnitResult {
        self.base.init.enter(InitPhase::TimeDerivative, InitMode::Full)
    }

    fn lean_consistent_initial_state(&mut self, _time: SimulationTime, _y: &mut [f64], _ad: &mut AdVectors<'_>, _error_tol: f64) -> UnitResult {
        self.base.init.enter(InitPhase::State, InitMode::Lean)
    }

    fn lean_consistent_initial_time_derivative(&mut self, _t: f64, _time_factor: f64, _y_dot: &mut [f64], _res: &[f64]) -> UnitResult {
        self.base.init.enter(InitPhase::TimeDerivative, InitMode::Lean)
    }

    fn consistent_initial_sensitivity(
        &mut self,
        _time: SimulationTime,
        _state: ConstState<'_>,
        _sens_y: &mut [&mut [f64]],
        _sens_y_dot: &mut [&mut [f64]],
        _ad_res: &[Active],
        _dirs: AdDirections,
    ) -> UnitResult {
        self.base.init.enter(InitPhase::Sensitivity, InitMode::Full)
    }

    fn lean_consistent_initial_sensitivity(
        &mut self,
        _time: SimulationTime,
        _state: ConstState<'_>,
        _sens_y: &mut [&mut [f64]],
        _sens_y_dot: &mut [&mut [f64]],
        _ad_res: &[Active],
        _dirs: AdDirections,
    ) -> UnitResult {
        self.base.init.enter(InitPhase::Sensitivity, InitMode::Lean)
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, time: SimulationTime, _solution: &[f64]) {
        let mut values = vec![0.0; self.n_comp];
        self.outlet_values(time.t, time.sec_idx, &mut values);
        recorder.record_solution(&self.view(&values));
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        recorder.record_structure(&self.view(&[]));
    }

    fn as_boundary(&self) -> Option<&dyn BoundaryProfile> {
        Some(self)
    }
}

impl Inlet {
    fn view<'a>(&'a self, outlet: &'a [f64]) -> SolutionView<'a> {
        SolutionView {
            unit: self.base.id(),
            unit_name: self.unit_operation_name(),
            n_comp: self.n_comp,
            n_bound: 0,
            bulk: &[],
            bulk_ordering: &[],
            solid: &[],
            solid_ordering: &[],
            inlet: None,
            outlet: Some(StridedSlice::contiguous(outlet)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::JsonParameterProvider;
    use crate::profile::{FunctionProfile, LinearRamp, SharedFunction};
    use crate::recorder::MemoryRecorder;
    use crate::{UnitError, UnitPhase};
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn configured_inlet() -> Inlet {
        let mut provider = JsonParameterProvider::from_value(json!({
            "NCOMP": 4,
            "INLET_TYPE": "PIECEWISE_CUBIC_POLY",
            "sec_000": { "CONST_COEFF": [50.0, 0.0, 0.0, 0.0] },
            "sec_001": {
                "CONST_COEFF": [0.0, 1.0, 0.0, 0.0],
                "LIN_COEFF": [0.0, 0.5, 0.0, 0.0],
                "QUAD_COEFF": [0.0, 0.0, 0.0, 0.0],
                "CUBE_COEFF": [0.0, 0.0, 0.0, 0.0]
            }
        }));
        let mut inlet = Inlet::new(UnitOpId(0));
        inlet.configure(&mut provider).unwrap();
        inlet.set_section_times(&SectionTimes::new(vec![0.0, 10.0, 20.0], vec![false]).unwrap()).unwrap();
        inlet
    }

    fn run(inlet: &mut Inlet) {
        let dirs = AdDirections::for_system(1, 0);
        let mut res = Vec::new();
        let mut y = Vec::new();
        let mut ad = AdVectors::new(&mut res, &mut y, dirs);
        inlet.prepare_ad_vectors(&mut ad).unwrap();
        inlet.notify_discontinuous_section_transition(0.0, 0, &mut ad).unwrap();
    }

    #[test]
    fn test_zero_dof_invariant() {
        let mut inlet = configured_inlet();
        assert_eq!(inlet.num_dofs(), 0);
        assert_eq!(inlet.num_pure_dofs(), 0);
        assert!(!inlet.has_inlet());
        assert!(inlet.has_outlet());
        assert!(inlet.can_accumulate());
        assert!(!inlet.uses_ad());

        let mut res: [f64; 0] = [];
        let time = SimulationTime::new(1.0, 0);
        assert!(inlet.residual(time, ConstState::new(&[], &[]), &mut res).is_ok());
        let mut rhs: [f64; 0] = [];
        assert!(inlet.linear_solve(time, 1.0, 1e-8, &mut rhs, &[], ConstState::new(&[], &[])).is_ok());
    }

    #[test]
    fn test_residual_rejects_nonempty_buffer() {
        let mut inlet = configured_inlet();
        let mut res = [0.0];
        let result = inlet.residual(SimulationTime::new(0.0, 0), ConstState::new(&[0.0], &[0.0]), &mut res);
        assert!(matches!(result, Err(UnitError::Fatal(_))));
    }

    #[test]
    fn test_profile_per_section() {
        let inlet = configured_inlet();
        let mut c = [0.0; 4];
        inlet.outlet_values(5.0, 0, &mut c);
        assert_eq!(c, [50.0, 0.0, 0.0, 0.0]);

        // Elapsed time is measured from the section start
        inlet.outlet_values(14.0, 1, &mut c);
        assert_eq!(c, [0.0, 3.0, 0.0, 0.0]);
        inlet.outlet_time_derivatives(14.0, 1, &mut c);
        assert_eq!(c, [0.0, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_missing_ncomp() {
        let mut provider = JsonParameterProvider::from_value(json!({ "sec_000": { "CONST_COEFF": [1.0] } }));
        let mut inlet = Inlet::new(UnitOpId(0));
        assert!(matches!(inlet.configure(&mut provider), Err(ConfigError::Missing { .. })));
        assert_eq!(inlet.base.phase(), UnitPhase::Unconfigured);
    }

    #[test]
    fn test_wrong_coefficient_length() {
        let mut provider = JsonParameterProvider::from_value(json!({
            "NCOMP": 2,
            "sec_000": { "CONST_COEFF": [1.0, 2.0, 3.0] }
        }));
        let mut inlet = Inlet::new(UnitOpId(0));
        match inlet.configure(&mut provider) {
            Err(ConfigError::Invalid { path, .. }) => assert_eq!(path, "/sec_000/CONST_COEFF"),
            other => panic!("expected invalid parameter, got {other:?}"),
        }
        assert_eq!(provider.scope_path(), "/");
    }

    #[test]
    fn test_reconfigure_before_configure_fails() {
        let mut provider = JsonParameterProvider::new();
        let mut inlet = Inlet::new(UnitOpId(3));
        assert_eq!(inlet.reconfigure(&mut provider), Err(ConfigError::NotConfigured(UnitOpId(3))));
    }

    #[test]
    fn test_section_count_must_cover_run() {
        let mut inlet = configured_inlet();
        let sections = SectionTimes::new(vec![0.0, 1.0, 2.0, 3.0], vec![true, true]).unwrap();
        assert!(inlet.set_section_times(&sections).is_err());
    }

    #[test]
    fn test_parameters() {
        let mut inlet = configured_inlet();
        let id = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(0);
        assert!(inlet.has_parameter(&id));
        assert!(!inlet.has_parameter(&id.with_section(2)));
        assert!(!inlet.has_parameter(&ParameterId::new("CONST_COEFF", UnitOpId(1)).with_component(0).with_section(0)));
        assert_eq!(inlet.all_parameter_values().len(), 2 * 4 * 4);

        assert!(inlet.set_parameter(&id, 25.0));
        let mut c = [0.0; 4];
        inlet.outlet_values(0.0, 0, &mut c);
        assert_eq!(c[0], 25.0);
        assert!(!inlet.set_parameter(&ParameterId::new("VOLUME", UnitOpId(0)), 1.0));
    }

    #[test]
    fn test_sensitive_coefficient() {
        let mut inlet = configured_inlet();
        let lin = ParameterId::new("LIN_COEFF", UnitOpId(0)).with_component(1).with_section(1);
        assert!(inlet.set_sensitive_parameter(&lin, 0, 1.0));
        assert!(!inlet.set_sensitive_parameter(&ParameterId::new("FOO", UnitOpId(0)), 1, 1.0));

        let dirs = AdDirections::for_system(1, 0);
        let mut out = dirs.allocate(4);
        inlet.outlet_values_ad(16.0, 1, &dirs, &mut out);
        assert_relative_eq!(out[1].re, 4.0);
        // d/d LIN_COEFF = t - t_sec
        assert_relative_eq!(dirs.derivative(&out[1], 0), 6.0);
        assert_eq!(dirs.derivative(&out[0], 0), 0.0);

        inlet.set_sensitive_parameter_value(&lin, 1.0);
        inlet.outlet_values_ad(16.0, 1, &dirs, &mut out);
        assert_relative_eq!(out[1].re, 7.0);

        inlet.clear_sens_params();
        inlet.outlet_values_ad(16.0, 1, &dirs, &mut out);
        assert_eq!(dirs.derivative(&out[1], 0), 0.0);
    }

    #[test]
    fn test_reconfigure_keeps_section_starts() {
        let mut inlet = configured_inlet();
        let mut provider = JsonParameterProvider::from_value(json!({
            "NCOMP": 4,
            "sec_000": { "CONST_COEFF": [10.0, 0.0, 0.0, 0.0] },
            "sec_001": { "CONST_COEFF": [0.0, 1.0, 0.0, 0.0], "LIN_COEFF": [0.0, 0.5, 0.0, 0.0] }
        }));
        inlet.reconfigure(&mut provider).unwrap();
        assert_eq!(inlet.num_dofs(), 0);
        let mut c = [0.0; 4];
        inlet.outlet_values(14.0, 1, &mut c);
        assert_eq!(c[1], 3.0);
        inlet.outlet_values(1.0, 0, &mut c);
        assert_eq!(c[0], 10.0);
    }

    #[test]
    fn test_reconfigure_rejects_uncovered_sections() {
        let mut inlet = configured_inlet();
        let mut provider = JsonParameterProvider::from_value(json!({
            "NCOMP": 4,
            "sec_000": { "CONST_COEFF": [10.0, 0.0, 0.0, 0.0] }
        }));
        match inlet.reconfigure(&mut provider) {
            Err(ConfigError::Invalid { path, .. }) => assert_eq!(path, "/sec_001"),
            other => panic!("expected uncovered section error, got {other:?}"),
        }

        // The previous profile stays in place
        let mut c = [0.0; 4];
        inlet.outlet_values(14.0, 1, &mut c);
        assert_eq!(c[1], 3.0);
        inlet.outlet_values(1.0, 0, &mut c);
        assert_eq!(c[0], 50.0);
    }

    #[test]
    fn test_external_profile() {
        let ramp: SharedFunction = Arc::new(LinearRamp { offset: 0.0, slope: 2.0, t0: 0.0 });
        let mut inlet = Inlet::with_profile(UnitOpId(0), Box::new(FunctionProfile::new(vec![ramp])));
        let mut provider = JsonParameterProvider::from_value(json!({ "NCOMP": 1, "INLET_TYPE": "EXTERNAL" }));
        inlet.configure(&mut provider).unwrap();
        inlet.set_section_times(&SectionTimes::single(0.0, 5.0).unwrap()).unwrap();

        let mut c = [0.0];
        inlet.outlet_values(3.0, 0, &mut c);
        assert_eq!(c[0], 6.0);
        assert!(inlet.all_parameter_values().is_empty());
    }

    #[test]
    fn test_unknown_inlet_type() {
        let mut provider = JsonParameterProvider::from_value(json!({ "NCOMP": 1, "INLET_TYPE": "SPLINE" }));
        let mut inlet = Inlet::new(UnitOpId(0));
        assert!(matches!(inlet.configure(&mut provider), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_initialization_guard() {
        let mut inlet = configured_inlet();
        run(&mut inlet);
        let time = SimulationTime::new(0.0, 0);
        let dirs = AdDirections::for_system(0, 0);
        let mut res = Vec::new();
        let mut y = Vec::new();
        let mut ad = AdVectors::new(&mut res, &mut y, dirs);

        inlet.lean_consistent_initial_state(time, &mut [], &mut ad, 1e-10).unwrap();
        assert!(matches!(inlet.consistent_initial_time_derivative(time, &[], &mut []), Err(UnitError::Precondition(_))));
        inlet.lean_consistent_initial_time_derivative(0.0, 1.0, &mut [], &[]).unwrap();
    }

    #[test]
    fn test_report_solution() {
        let mut inlet = configured_inlet();
        run(&mut inlet);

        // Values come from the reported time, not from the last residual
        let mut res: [f64; 0] = [];
        inlet.residual(SimulationTime::new(14.0, 1), ConstState::new(&[], &[]), &mut res).unwrap();

        let mut recorder = MemoryRecorder::new();
        inlet.report_solution_structure(&mut recorder);
        for time in [SimulationTime::new(2.0, 0), SimulationTime::new(14.0, 1), SimulationTime::new(16.0, 1)] {
            recorder.begin_timestep(time.t);
            inlet.report_solution(&mut recorder, time, &[]);
            recorder.end_timestep();
        }
        assert_eq!(recorder.outlet(UnitOpId(0)), &[vec![50.0, 0.0, 0.0, 0.0], vec![0.0, 3.0, 0.0, 0.0], vec![0.0, 4.0, 0.0, 0.0]]);
        assert_eq!(recorder.structure(UnitOpId(0)).map(|s| s.name), Some("INLET"));
    }
}
