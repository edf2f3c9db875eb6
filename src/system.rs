//! Feed-forward network of unit operations.
//!
//! [`ModelSystem`] owns the units, lays their DOFs out contiguously in one
//! global state vector and supplies the coupling between them. A stateful
//! unit's inlet rows read `res = y_in`; the network subtracts the upstream
//! outlet so that the global equation becomes `y_in - y_upstream = 0`.
//! Upstream zero-DOF units contribute their [`BoundaryProfile`](crate::BoundaryProfile)
//! instead of state entries.
//!
//! Units are added in flow order, so the global Jacobian is block lower
//! triangular and linear solves run unit by unit (block forward substitution).
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use unitflow::models::{Cstr, Inlet};
//! use unitflow::params::JsonParameterProvider;
//! use unitflow::{ModelSystem, UnitOpId};
//!
//! let mut provider = JsonParameterProvider::from_value(json!({
//!     "unit_000": { "NCOMP": 1, "sec_000": { "CONST_COEFF": [1.0] } },
//!     "unit_001": { "NCOMP": 1, "VOLUME": 2.0 }
//! }));
//!
//! let mut system = ModelSystem::new();
//! system.add_unit(Box::new(Inlet::new(UnitOpId(0)))).unwrap();
//! system.add_unit(Box::new(Cstr::new(UnitOpId(1)))).unwrap();
//! system.configure_units(&mut provider).unwrap();
//! system.connect(UnitOpId(0), UnitOpId(1), 0.5).unwrap();
//! system.finalize().unwrap();
//!
//! // The inlet owns no DOFs; the tank owns inlet + bulk
//! assert_eq!(system.n_dofs(), 2);
//! assert_eq!(system.offset(UnitOpId(1)), Some(0));
//! ```

use std::ops::Range;

use crate::autodiff::{Active, AdDirections, AdVectors, constant};
use crate::params::{ParameterProvider, unit_scope, with_scope};
use crate::profile::SharedFunction;
use crate::recorder::SolutionRecorder;
use crate::unit::{ConstState, SimulationTime, UnitOperation};
use crate::{ConfigError, ConfigResult, ParameterId, SectionTimes, UnitError, UnitOpId};

/// Result type for network operations.
pub type SystemResult<T = ()> = Result<T, SystemError>;

/// Errors raised while evaluating the network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SystemError {
    /// A unit operation failed
    #[error("{unit}: {source}")]
    Unit {
        unit: UnitOpId,
        #[source]
        source: UnitError,
    },
    /// Called out of order or with mis-sized buffers
    #[error("system precondition violated: {0}")]
    Precondition(String),
}

impl SystemError {
    /// Returns true if the caller may retry with a smaller step.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SystemError::Unit { source, .. } if source.is_recoverable())
    }
}

fn unit_error(unit: UnitOpId) -> impl Fn(UnitError) -> SystemError {
    move |source| SystemError::Unit { unit, source }
}

/// Directed stream between two units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub from: UnitOpId,
    pub to: UnitOpId,
    /// Volumetric flow rate
    pub flow_rate: f64,
}

/// Units, their coupling and the shared AD buffers.
pub struct ModelSystem {
    units: Vec<Box<dyn UnitOperation>>,
    connections: Vec<Connection>,
    /// Upstream unit index per unit
    upstream: Vec<Option<usize>>,
    offsets: Vec<usize>,
    n_dofs: usize,
    sections: Option<SectionTimes>,
    /// Parameters per sensitivity direction (more than one when fused)
    sens_groups: Vec<Vec<ParameterId>>,
    dirs: AdDirections,
    ad_res: Vec<Active>,
    ad_y: Vec<Active>,
    finalized: bool,
    /// False after the AD buffers were reallocated
    ad_prepared: bool,
}

impl Default for ModelSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelSystem {
    pub fn new() -> Self {
        ModelSystem {
            units: Vec::new(),
            connections: Vec::new(),
            upstream: Vec::new(),
            offsets: Vec::new(),
            n_dofs: 0,
            sections: None,
            sens_groups: Vec::new(),
            dirs: AdDirections::for_system(0, 0),
            ad_res: Vec::new(),
            ad_y: Vec::new(),
            ad_prepared: false,
            finalized: false,
        }
    }

    /// Appends a unit. Units must be added in flow order.
    pub fn add_unit(&mut self, unit: Box<dyn UnitOperation>) -> ConfigResult<UnitOpId> {
        let id = unit.unit_operation_id();
        if self.finalized {
            return Err(ConfigError::Network(format!("cannot add {id} after finalize")));
        }
        if self.units.iter().any(|u| u.unit_operation_id() == id) {
            return Err(ConfigError::Network(format!("duplicate unit id {id}")));
        }
        self.units.push(unit);
        self.upstream.push(None);
        Ok(id)
    }

    fn index_of(&self, id: UnitOpId) -> ConfigResult<usize> {
        self.units.iter().position(|u| u.unit_operation_id() == id).ok_or_else(|| ConfigError::Network(format!("unknown unit {id}")))
    }

    pub fn unit(&self, id: UnitOpId) -> Option<&dyn UnitOperation> {
        self.units.iter().find(|u| u.unit_operation_id() == id).map(|u| u.as_ref())
    }

    pub fn unit_mut(&mut self, id: UnitOpId) -> Option<&mut Box<dyn UnitOperation>> {
        self.units.iter_mut().find(|u| u.unit_operation_id() == id)
    }

    /// Ids of all units in flow order.
    pub fn unit_ids(&self) -> Vec<UnitOpId> {
        self.units.iter().map(|u| u.unit_operation_id()).collect()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Configures every unit from its `unit_NNN` scope.
    pub fn configure_units(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        for unit in self.units.iter_mut() {
            let scope = unit_scope(unit.unit_operation_id().index());
            with_scope(provider, &scope, |p| unit.configure(p))?;
        }
        Ok(())
    }

    /// Reloads non-structural parameters of every unit.
    pub fn reconfigure_units(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        for unit in self.units.iter_mut() {
            let scope = unit_scope(unit.unit_operation_id().index());
            with_scope(provider, &scope, |p| unit.reconfigure(p))?;
        }
        Ok(())
    }

    /// Connects the outlet of `from` to the inlet of `to`. Units must be configured.
    pub fn connect(&mut self, from: UnitOpId, to: UnitOpId, flow_rate: f64) -> ConfigResult {
        let (fi, ti) = (self.index_of(from)?, self.index_of(to)?);
        let reject = |reason: String| {
            tracing::error!(%from, %to, %reason, "invalid connection");
            Err(ConfigError::Network(reason))
        };

        if fi >= ti {
            return reject(format!("{from} -> {to} is not feed-forward, add units in flow order"));
        }
        if !self.units[fi].has_outlet() {
            return reject(format!("{from} has no outlet"));
        }
        if !self.units[ti].has_inlet() {
            return reject(format!("{to} has no inlet"));
        }
        let (n_from, n_to) = (self.units[fi].num_components(), self.units[ti].num_components());
        if n_from != n_to {
            return reject(format!("{from} carries {n_from} components, {to} expects {n_to}"));
        }
        if self.upstream[ti].is_some() {
            return reject(format!("{to} already has an upstream unit"));
        }
        if !flow_rate.is_finite() || flow_rate < 0.0 {
            return reject(format!("flow rate {flow_rate} must be finite and non-negative"));
        }

        self.upstream[ti] = Some(fi);
        self.connections.push(Connection { from, to, flow_rate });
        tracing::debug!(%from, %to, flow_rate, "units connected");
        Ok(())
    }

    /// Lays out DOFs, validates and distributes flow rates, and allocates AD buffers.
    pub fn finalize(&mut self) -> ConfigResult {
        let mut offset = 0;
        self.offsets = self
            .units
            .iter()
            .map(|u| {
                let start = offset;
                offset += u.num_dofs();
                start
            })
            .collect();
        self.n_dofs = offset;

        for (i, unit) in self.units.iter_mut().enumerate() {
            let id = unit.unit_operation_id();
            if unit.has_inlet() && self.upstream[i].is_none() {
                tracing::error!(unit = %id, "unit has an inlet but no upstream unit");
                return Err(ConfigError::Network(format!("{id} has an inlet but no upstream unit")));
            }

            let in_flow: f64 = self.connections.iter().filter(|c| c.to == id).map(|c| c.flow_rate).sum();
            let outgoing: Vec<f64> = self.connections.iter().filter(|c| c.from == id).map(|c| c.flow_rate).collect();
            // A unit without downstream connections releases its inflow
            let out_flow = if outgoing.is_empty() { in_flow } else { outgoing.iter().sum() };

            if !unit.can_accumulate() && (in_flow - out_flow).abs() > 1e-12 * in_flow.abs().max(1.0) {
                tracing::error!(unit = %id, in_flow, out_flow, "flow imbalance on non-accumulating unit");
                return Err(ConfigError::Network(format!("{id} cannot accumulate but receives {in_flow} and releases {out_flow}")));
            }
            unit.set_flow_rates(&constant(in_flow), &constant(out_flow));
        }

        self.allocate_ad();
        self.finalized = true;
        tracing::info!(units = self.units.len(), n_dofs = self.n_dofs, n_sens = self.sens_groups.len(), "network finalized");
        Ok(())
    }

    fn allocate_ad(&mut self) {
        let jacobian_dirs = self.units.iter().map(|u| u.required_ad_dirs()).max().unwrap_or(0);
        self.dirs = AdDirections::for_system(self.sens_groups.len(), jacobian_dirs);
        self.ad_res = self.dirs.allocate(self.n_dofs);
        self.ad_y = self.dirs.allocate(self.n_dofs);
        self.ad_prepared = false;
    }

    /// Direction an already sensitive parameter resolves to.
    pub fn direction_of(&self, id: &ParameterId) -> Option<usize> {
        self.sens_groups.iter().position(|group| group.contains(id))
    }

    /// Registers a group of parameters sharing one sensitivity direction.
    ///
    /// More than one id fuses the parameters: the sensitivity is taken with
    /// respect to a common scalar driving all of them. Returns the direction.
    ///
    /// A group whose ids are all registered in one direction resolves to that
    /// direction and keeps its first seed. A group mixing registered and new
    /// ids, or ids from different directions, is rejected.
    ///
    /// After [`finalize`](Self::finalize) a new group reallocates the AD
    /// buffers and [`prepare_ad_vectors`](Self::prepare_ad_vectors) must run again.
    pub fn set_sensitive_parameter(&mut self, ids: &[ParameterId], seed: f64) -> ConfigResult<usize> {
        if ids.is_empty() {
            return Err(ConfigError::Network("empty sensitive parameter group".to_string()));
        }
        for id in ids {
            let idx = self.index_of(id.unit)?;
            if !self.units[idx].has_parameter(id) {
                return Err(ConfigError::Invalid {
                    path: unit_scope(id.unit.index()),
                    reason: format!("{id:?} is not a parameter of {}", id.unit),
                });
            }
        }

        let mut unique: Vec<ParameterId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        let ids = unique.as_slice();

        let registered: Vec<(ParameterId, usize)> = ids.iter().filter_map(|id| self.direction_of(id).map(|d| (*id, d))).collect();
        if let Some(&(first, direction)) = registered.first() {
            if registered.len() == ids.len() && registered.iter().all(|&(_, d)| d == direction) {
                tracing::debug!(direction, "sensitive parameter group already registered");
                return Ok(direction);
            }
            let reason = format!("{first:?} is already sensitive in direction {direction} and cannot join a new group");
            tracing::error!(%reason, "rejected sensitive parameter group");
            return Err(ConfigError::Invalid { path: unit_scope(first.unit.index()), reason });
        }

        let direction = self.sens_groups.len();
        for id in ids {
            let idx = self.index_of(id.unit)?;
            self.units[idx].set_sensitive_parameter(id, direction, seed);
        }
        self.sens_groups.push(ids.to_vec());
        if self.finalized {
            self.allocate_ad();
        }
        tracing::debug!(direction, fused = ids.len(), "sensitive parameter registered");
        Ok(direction)
    }

    /// Sets the value of every parameter in a sensitivity group.
    pub fn set_sensitive_parameter_value(&mut self, direction: usize, value: f64) {
        let Some(group) = self.sens_groups.get(direction) else {
            return;
        };
        for id in group {
            if let Some(unit) = self.units.iter_mut().find(|u| u.unit_operation_id() == id.unit) {
                unit.set_sensitive_parameter_value(id, value);
            }
        }
    }

    pub fn clear_sens_params(&mut self) {
        for unit in self.units.iter_mut() {
            unit.clear_sens_params();
        }
        self.sens_groups.clear();
        if self.finalized {
            self.allocate_ad();
        }
    }

    pub fn n_dofs(&self) -> usize {
        self.n_dofs
    }

    pub fn n_units(&self) -> usize {
        self.units.len()
    }

    pub fn n_sensitivities(&self) -> usize {
        self.sens_groups.len()
    }

    pub fn dirs(&self) -> AdDirections {
        self.dirs
    }

    /// AD residual from the last sensitivity sweep.
    pub fn ad_residual(&self) -> &[Active] {
        &self.ad_res
    }

    /// First global DOF of a unit (after [`finalize`](Self::finalize)).
    pub fn offset(&self, id: UnitOpId) -> Option<usize> {
        let idx = self.index_of(id).ok()?;
        self.offsets.get(idx).copied()
    }

    pub fn sections(&self) -> Option<&SectionTimes> {
        self.sections.as_ref()
    }

    pub fn set_section_times(&mut self, sections: &SectionTimes) -> ConfigResult {
        for unit in self.units.iter_mut() {
            unit.set_section_times(sections)?;
        }
        self.sections = Some(sections.clone());
        Ok(())
    }

    pub fn set_external_functions(&mut self, functions: &[SharedFunction]) {
        for unit in self.units.iter_mut() {
            unit.set_external_functions(functions);
        }
    }

    fn range(&self, i: usize) -> Range<usize> {
        self.offsets[i]..self.offsets[i] + self.units[i].num_dofs()
    }

    fn require_finalized(&self) -> SystemResult {
        if self.finalized { Ok(()) } else { Err(SystemError::Precondition("finalize the network first".to_string())) }
    }

    fn require_prepared(&self) -> SystemResult {
        self.require_finalized()?;
        if self.ad_prepared {
            Ok(())
        } else {
            Err(SystemError::Precondition("AD vectors are not seeded, call prepare_ad_vectors".to_string()))
        }
    }

    /// Checks that every named buffer spans the global state.
    fn check_global(&self, buffers: &[(&str, usize)]) -> SystemResult {
        self.require_finalized()?;
        for &(name, len) in buffers {
            if len != self.n_dofs {
                return Err(SystemError::Precondition(format!("{name} has {len} entries, expected {}", self.n_dofs)));
            }
        }
        Ok(())
    }

    fn check_sensitivities(&self, name: &str, vectors: &[Vec<f64>]) -> SystemResult {
        if vectors.len() != self.sens_groups.len() {
            return Err(SystemError::Precondition(format!("{name} has {} vectors, expected {}", vectors.len(), self.sens_groups.len())));
        }
        for v in vectors {
            self.check_global(&[(name, v.len())])?;
        }
        Ok(())
    }

    /// Global indices of unit `i`'s inlet DOFs.
    fn inlet_indices(&self, i: usize) -> Vec<usize> {
        let unit = &self.units[i];
        if unit.num_dofs() == 0 || !unit.has_inlet() {
            return Vec::new();
        }
        let base = self.offsets[i] + unit.local_inlet_component_index();
        let stride = unit.local_inlet_component_stride();
        (0..unit.num_components()).map(|c| base + c * stride).collect()
    }

    /// Outlet entries of a stateful upstream unit, read from `global`.
    fn upstream_outlet_dofs(&self, i: usize, global: &[f64]) -> Option<Vec<f64>> {
        let u = self.upstream[i]?;
        let up = &self.units[u];
        if up.num_dofs() == 0 {
            return None;
        }
        let base = self.offsets[u] + up.local_outlet_component_index();
        let stride = up.local_outlet_component_stride();
        Some((0..up.num_components()).map(|c| global[base + c * stride]).collect())
    }

    /// Values (or time derivatives) arriving at unit `i`'s inlet.
    fn upstream_outlet(&self, i: usize, time: SimulationTime, global: &[f64], derivative: bool) -> Option<Vec<f64>> {
        let u = self.upstream[i]?;
        let up = &self.units[u];
        if up.num_dofs() > 0 {
            return self.upstream_outlet_dofs(i, global);
        }
        let mut out = vec![0.0; up.num_components()];
        if let Some(boundary) = up.as_boundary() {
            if derivative {
                boundary.outlet_time_derivatives(time.t, time.sec_idx, &mut out);
            } else {
                boundary.outlet_values(time.t, time.sec_idx, &mut out);
            }
        }
        Some(out)
    }

    /// Active values arriving at unit `i`'s inlet, carrying profile sensitivities.
    fn upstream_outlet_ad(&self, i: usize, time: SimulationTime, y: &[f64]) -> Option<Vec<Active>> {
        let u = self.upstream[i]?;
        let up = &self.units[u];
        if up.num_dofs() > 0 {
            return self.upstream_outlet_dofs(i, y).map(|v| v.into_iter().map(constant).collect());
        }
        let mut out = self.dirs.allocate(up.num_components());
        if let Some(boundary) = up.as_boundary() {
            boundary.outlet_values_ad(time.t, time.sec_idx, &self.dirs, &mut out);
        }
        Some(out)
    }

    fn subtract_upstream(&self, time: SimulationTime, y: &[f64], res: &mut [f64]) {
        for i in 0..self.units.len() {
            if let Some(values) = self.upstream_outlet(i, time, y, false) {
                for (idx, v) in self.inlet_indices(i).into_iter().zip(values) {
                    res[idx] -= v;
                }
            }
        }
    }

    fn subtract_upstream_ad(&mut self, time: SimulationTime, y: &[f64]) {
        for i in 0..self.units.len() {
            if let Some(values) = self.upstream_outlet_ad(i, time, y) {
                for (idx, v) in self.inlet_indices(i).into_iter().zip(values) {
                    self.ad_res[idx] = self.ad_res[idx].clone() - v;
                }
            }
        }
    }

    /// Seeds every unit's Jacobian directions; call once per run.
    pub fn prepare_ad_vectors(&mut self) -> SystemResult {
        self.require_finalized()?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let mut ad = AdVectors::new(&mut self.ad_res[range.clone()], &mut self.ad_y[range], self.dirs);
            self.units[i].prepare_ad_vectors(&mut ad).map_err(unit_error(id))?;
        }
        self.ad_prepared = true;
        Ok(())
    }

    /// Announces the start of the run or a discontinuous section boundary to every unit.
    pub fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize) -> SystemResult {
        self.require_prepared()?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let mut ad = AdVectors::new(&mut self.ad_res[range.clone()], &mut self.ad_y[range], self.dirs);
            self.units[i].notify_discontinuous_section_transition(t, sec_idx, &mut ad).map_err(unit_error(id))?;
        }
        tracing::debug!(t, sec_idx, "section transition announced");
        Ok(())
    }

    /// Writes every unit's configured initial values.
    pub fn apply_initial_conditions(&self, y: &mut [f64], y_dot: &mut [f64]) -> SystemResult {
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len())])?;
        for i in 0..self.units.len() {
            let range = self.range(i);
            self.units[i].apply_initial_condition(&mut y[range.clone()], &mut y_dot[range]);
        }
        Ok(())
    }

    /// Reads initial values from each unit's `unit_NNN` scope.
    pub fn apply_initial_conditions_from(&mut self, provider: &mut dyn ParameterProvider, y: &mut [f64], y_dot: &mut [f64]) -> ConfigResult {
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len())]).map_err(|e| ConfigError::Network(e.to_string()))?;
        for i in 0..self.units.len() {
            let range = self.range(i);
            let scope = unit_scope(self.units[i].unit_operation_id().index());
            let unit = &mut self.units[i];
            with_scope(provider, &scope, |p| unit.apply_initial_condition_from(p, &mut y[range.clone()], &mut y_dot[range.clone()]))?;
        }
        Ok(())
    }

    /// Expands a short tolerance specification to one tolerance per global DOF.
    pub fn expand_error_tol(&self, tol: &[f64]) -> Vec<f64> {
        let mut expanded = vec![0.0; self.n_dofs];
        for i in 0..self.units.len() {
            let range = self.range(i);
            self.units[i].expand_error_tol(tol, &mut expanded[range]);
        }
        expanded
    }

    /// Evaluates the global residual.
    pub fn residual(&mut self, time: SimulationTime, y: &[f64], y_dot: &[f64], res: &mut [f64]) -> SystemResult {
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len()), ("residual", res.len())])?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            self.units[i].residual(time, state, &mut res[range]).map_err(unit_error(id))?;
        }
        self.subtract_upstream(time, y, res);
        Ok(())
    }

    /// Evaluates the global residual and refreshes every unit's Jacobians.
    pub fn residual_with_jacobian(&mut self, time: SimulationTime, y: &[f64], y_dot: &[f64], res: &mut [f64]) -> SystemResult {
        self.require_prepared()?;
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len()), ("residual", res.len())])?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            let mut ad = AdVectors::new(&mut self.ad_res[range.clone()], &mut self.ad_y[range.clone()], self.dirs);
            self.units[i].residual_with_jacobian(time, state, &mut res[range], &mut ad).map_err(unit_error(id))?;
        }
        self.subtract_upstream(time, y, res);
        Ok(())
    }

    /// Solves `(∂F/∂y + α ∂F/∂ẏ) x = rhs` by block forward substitution.
    #[allow(clippy::too_many_arguments)]
    pub fn linear_solve(&mut self, time: SimulationTime, alpha: f64, tol: f64, rhs: &mut [f64], weight: &[f64], y: &[f64], y_dot: &[f64]) -> SystemResult {
        self.require_prepared()?;
        self.check_global(&[("right hand side", rhs.len()), ("weight", weight.len()), ("state", y.len()), ("state derivative", y_dot.len())])?;
        for i in 0..self.units.len() {
            if let Some(x_up) = self.upstream_outlet_dofs(i, rhs) {
                for (idx, v) in self.inlet_indices(i).into_iter().zip(x_up) {
                    rhs[idx] += v;
                }
            }
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            self.units[i].linear_solve(time, alpha, tol, &mut rhs[range.clone()], &weight[range], state).map_err(unit_error(id))?;
        }
        Ok(())
    }

    /// Computes `ret = α ∂F/∂y x + β ret` including the coupling.
    pub fn multiply_with_jacobian(&self, x: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) -> SystemResult {
        self.check_global(&[("direction", x.len()), ("result", ret.len())])?;
        for i in 0..self.units.len() {
            let range = self.range(i);
            self.units[i].multiply_with_jacobian(&x[range.clone()], alpha, beta, &mut ret[range]);
        }
        for i in 0..self.units.len() {
            if let Some(x_up) = self.upstream_outlet_dofs(i, x) {
                for (idx, v) in self.inlet_indices(i).into_iter().zip(x_up) {
                    ret[idx] -= alpha * v;
                }
            }
        }
        Ok(())
    }

    /// Computes `ret = ∂F/∂ẏ x`.
    pub fn multiply_with_derivative_jacobian(&self, x: &[f64], ret: &mut [f64], time_factor: f64) -> SystemResult {
        self.check_global(&[("direction", x.len()), ("result", ret.len())])?;
        for i in 0..self.units.len() {
            let range = self.range(i);
            self.units[i].multiply_with_derivative_jacobian(&x[range.clone()], &mut ret[range], time_factor);
        }
        Ok(())
    }

    fn couple_inlet(&self, i: usize, time: SimulationTime, y: &mut [f64], y_dot: &mut [f64]) {
        let indices = self.inlet_indices(i);
        if let Some(values) = self.upstream_outlet(i, time, y, false) {
            for (&idx, v) in indices.iter().zip(values) {
                y[idx] = v;
            }
        }
        if let Some(values) = self.upstream_outlet(i, time, y_dot, true) {
            for (&idx, v) in indices.iter().zip(values) {
                y_dot[idx] = v;
            }
        }
    }

    /// Makes `(y, ẏ)` consistent, unit by unit in flow order.
    ///
    /// Inlet DOFs are first copied from the upstream unit. `lean` selects the
    /// lean variants, which only update the differential part of `ẏ`.
    pub fn consistent_initial_conditions(&mut self, time: SimulationTime, y: &mut [f64], y_dot: &mut [f64], error_tol: f64, lean: bool) -> SystemResult {
        self.require_prepared()?;
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len())])?;
        for i in 0..self.units.len() {
            self.couple_inlet(i, time, y, y_dot);

            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let mut ad = AdVectors::new(&mut self.ad_res[range.clone()], &mut self.ad_y[range.clone()], self.dirs);
            let unit = &mut self.units[i];
            let (yi, ydi) = (&mut y[range.clone()], &mut y_dot[range]);
            if lean {
                unit.lean_consistent_initial_state(time, yi, &mut ad, error_tol).map_err(unit_error(id))?;
                let mut res = vec![0.0; yi.len()];
                unit.residual(time, ConstState::new(yi, ydi), &mut res).map_err(unit_error(id))?;
                unit.lean_consistent_initial_time_derivative(time.t, time.time_factor, ydi, &res).map_err(unit_error(id))?;
            } else {
                unit.consistent_initial_state(time, yi, &mut ad, error_tol).map_err(unit_error(id))?;
                unit.consistent_initial_time_derivative(time, yi, ydi).map_err(unit_error(id))?;
            }
        }
        tracing::debug!(t = time.t, sec_idx = time.sec_idx, lean, "consistent initial conditions");
        Ok(())
    }

    /// Fills the AD residual with `∂F/∂p` (coupling included).
    pub fn residual_sens_fwd_ad_only(&mut self, time: SimulationTime, y: &[f64], y_dot: &[f64]) -> SystemResult {
        self.require_prepared()?;
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len())])?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            self.units[i].residual_sens_fwd_ad_only(time, state, &mut self.ad_res[range], self.dirs).map_err(unit_error(id))?;
        }
        self.subtract_upstream_ad(time, y);
        Ok(())
    }

    /// Refreshes the Jacobians and `∂F/∂p` in one sweep.
    pub fn residual_sens_fwd_with_jacobian(&mut self, time: SimulationTime, y: &[f64], y_dot: &[f64]) -> SystemResult {
        self.require_prepared()?;
        self.check_global(&[("state", y.len()), ("state derivative", y_dot.len())])?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            let mut ad = AdVectors::new(&mut self.ad_res[range.clone()], &mut self.ad_y[range], self.dirs);
            self.units[i].residual_sens_fwd_with_jacobian(time, state, &mut ad).map_err(unit_error(id))?;
        }
        self.subtract_upstream_ad(time, y);
        Ok(())
    }

    /// Assembles `res_s[k] = ∂F/∂y s_k + ∂F/∂ẏ ṡ_k + ∂F/∂p_k` for the whole network.
    pub fn residual_sens_fwd_combine(&mut self, time: SimulationTime, ys: &[Vec<f64>], ys_dot: &[Vec<f64>], res_s: &mut [Vec<f64>]) -> SystemResult {
        self.require_prepared()?;
        self.check_sensitivities("sensitivity", ys)?;
        self.check_sensitivities("sensitivity derivative", ys_dot)?;
        self.check_sensitivities("sensitivity residual", res_s)?;
        for i in 0..self.units.len() {
            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let ys_i: Vec<&[f64]> = ys.iter().map(|s| &s[range.clone()]).collect();
            let ys_dot_i: Vec<&[f64]> = ys_dot.iter().map(|s| &s[range.clone()]).collect();
            let mut res_i: Vec<&mut [f64]> = res_s.iter_mut().map(|r| &mut r[range.clone()]).collect();
            self.units[i]
                .residual_sens_fwd_combine(time, &ys_i, &ys_dot_i, &mut res_i, &self.ad_res[range.clone()], self.dirs)
                .map_err(unit_error(id))?;
        }
        for (s, r) in ys.iter().zip(res_s.iter_mut()) {
            for i in 0..self.units.len() {
                if let Some(s_up) = self.upstream_outlet_dofs(i, s) {
                    for (idx, v) in self.inlet_indices(i).into_iter().zip(s_up) {
                        r[idx] -= v;
                    }
                }
            }
        }
        Ok(())
    }

    /// Makes the sensitivities consistent at a consistent base point `(y, ẏ)`.
    ///
    /// Inlet sensitivities are copied from the upstream unit; below a
    /// boundary unit they are the derivatives of its profile.
    #[allow(clippy::too_many_arguments)]
    pub fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        y: &[f64],
        y_dot: &[f64],
        sens_y: &mut [Vec<f64>],
        sens_y_dot: &mut [Vec<f64>],
        lean: bool,
    ) -> SystemResult {
        self.check_sensitivities("sensitivity", sens_y)?;
        self.check_sensitivities("sensitivity derivative", sens_y_dot)?;
        self.residual_sens_fwd_ad_only(time, y, y_dot)?;
        let dirs = self.dirs;

        for i in 0..self.units.len() {
            let indices = self.inlet_indices(i);
            if let Some(u) = self.upstream[i] {
                if self.units[u].num_dofs() == 0 {
                    let profile = self.upstream_outlet_ad(i, time, y).unwrap_or_default();
                    for (k, (s, s_dot)) in sens_y.iter_mut().zip(sens_y_dot.iter_mut()).enumerate() {
                        for (&idx, v) in indices.iter().zip(&profile) {
                            s[idx] = dirs.derivative(v, k);
                            s_dot[idx] = 0.0;
                        }
                    }
                } else {
                    for (s, s_dot) in sens_y.iter_mut().zip(sens_y_dot.iter_mut()) {
                        let up = self.upstream_outlet_dofs(i, s).unwrap_or_default();
                        let up_dot = self.upstream_outlet_dofs(i, s_dot).unwrap_or_default();
                        for ((&idx, v), vd) in indices.iter().zip(up).zip(up_dot) {
                            s[idx] = v;
                            s_dot[idx] = vd;
                        }
                    }
                }
            }

            let (id, range) = (self.units[i].unit_operation_id(), self.range(i));
            let state = ConstState::new(&y[range.clone()], &y_dot[range.clone()]);
            let mut sy: Vec<&mut [f64]> = sens_y.iter_mut().map(|s| &mut s[range.clone()]).collect();
            let mut syd: Vec<&mut [f64]> = sens_y_dot.iter_mut().map(|s| &mut s[range.clone()]).collect();
            let ad_res = &self.ad_res[range.clone()];
            let result = if lean {
                self.units[i].lean_consistent_initial_sensitivity(time, state, &mut sy, &mut syd, ad_res, dirs)
            } else {
                self.units[i].consistent_initial_sensitivity(time, state, &mut sy, &mut syd, ad_res, dirs)
            };
            result.map_err(unit_error(id))?;
        }
        Ok(())
    }

    /// Sends every unit's layout to `recorder`.
    pub fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        for unit in &self.units {
            unit.report_solution_structure(recorder);
        }
    }

    /// Records one time point.
    pub fn report_solution(&self, recorder: &mut dyn SolutionRecorder, time: SimulationTime, y: &[f64]) -> SystemResult {
        self.check_global(&[("state", y.len())])?;
        recorder.begin_timestep(time.t);
        for i in 0..self.units.len() {
            self.units[i].report_solution(recorder, time, &y[self.range(i)]);
        }
        recorder.end_timestep();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cstr, Inlet};
    use crate::params::JsonParameterProvider;
    use crate::recorder::MemoryRecorder;
    use approx::assert_relative_eq;
    use serde_json::{Value, json};

    fn config() -> Value {
        json!({
            "unit_000": { "NCOMP": 2, "sec_000": { "CONST_COEFF": [50.0, 0.0] } },
            "unit_001": { "NCOMP": 2, "VOLUME": 5.0, "INIT_C": [1.0, 0.0] },
            "unit_002": { "NCOMP": 2, "VOLUME": 2.0, "REACTION_RATE": [0.1, 0.2] },
            "unit_003": { "NCOMP": 3, "VOLUME": 1.0 }
        })
    }

    /// Inlet followed by `n_tanks` stirred tanks, configured but not connected.
    fn configured(n_tanks: usize) -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitOpId(0)))).unwrap();
        for i in 1..=n_tanks {
            system.add_unit(Box::new(Cstr::new(UnitOpId(i)))).unwrap();
        }
        system.configure_units(&mut JsonParameterProvider::from_value(config())).unwrap();
        system
    }

    /// Inlet -> tank (-> tank), finalized and ready for evaluation.
    fn chain(n_tanks: usize, sensitive: &[ParameterId]) -> ModelSystem {
        let mut system = configured(n_tanks);
        for i in 1..=n_tanks {
            system.connect(UnitOpId(i - 1), UnitOpId(i), 1.0).unwrap();
        }
        for id in sensitive {
            system.set_sensitive_parameter(&[*id], 1.0).unwrap();
        }
        system.finalize().unwrap();
        system.set_section_times(&SectionTimes::single(0.0, 10.0).unwrap()).unwrap();
        system.prepare_ad_vectors().unwrap();
        system.notify_discontinuous_section_transition(0.0, 0).unwrap();
        system
    }

    #[test]
    fn test_layout_and_offsets() {
        let system = chain(2, &[]);
        assert_eq!(system.n_dofs(), 8);
        assert_eq!(system.offset(UnitOpId(0)), Some(0));
        assert_eq!(system.offset(UnitOpId(1)), Some(0));
        assert_eq!(system.offset(UnitOpId(2)), Some(4));
        assert_eq!(system.unit_ids(), vec![UnitOpId(0), UnitOpId(1), UnitOpId(2)]);
        assert_eq!(system.dirs().jacobian_dirs(), 4);
        assert_eq!(system.connections().len(), 2);
    }

    #[test]
    fn test_residual_couples_boundary_profile() {
        let mut system = chain(1, &[]);
        let y = [1.0, 2.0, 3.0, 4.0];
        let mut res = [0.0; 4];
        system.residual(SimulationTime::new(0.0, 0), &y, &[0.0; 4], &mut res).unwrap();
        assert_relative_eq!(res[0], 1.0 - 50.0);
        assert_relative_eq!(res[1], 2.0);
        // -(F c_in - F c) / V
        assert_relative_eq!(res[2], -(1.0 - 3.0) / 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_consistent_initialization_couples_units() {
        let mut system = chain(2, &[]);
        let time = SimulationTime::new(0.0, 0);
        let mut y = vec![0.0; 8];
        let mut y_dot = vec![0.0; 8];
        system.apply_initial_conditions(&mut y, &mut y_dot).unwrap();
        assert_eq!(y[2], 1.0);

        system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, false).unwrap();
        assert_eq!(&y[..2], &[50.0, 0.0]);
        // Second tank sees the first tank's outlet
        assert_eq!(&y[4..6], &y[2..4]);
        assert_relative_eq!(y_dot[2], (50.0 - 1.0) / 5.0, epsilon = 1e-12);

        let mut res = vec![0.0; 8];
        system.residual(time, &y, &y_dot, &mut res).unwrap();
        for r in &res {
            assert!(r.abs() < 1e-10, "residual {res:?}");
        }
    }

    #[test]
    fn test_lean_initialization_updates_derivatives() {
        let mut system = chain(1, &[]);
        let time = SimulationTime::new(0.0, 0);
        let mut y = vec![0.0; 4];
        let mut y_dot = vec![0.0; 4];
        system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, true).unwrap();
        assert_relative_eq!(y_dot[2], 10.0, epsilon = 1e-12);
        assert_relative_eq!(y_dot[3], 0.0);
    }

    #[test]
    fn test_block_forward_linear_solve() {
        let mut system = chain(2, &[]);
        let time = SimulationTime::new(0.0, 0);
        let y = [50.0, 0.0, 10.0, 1.0, 10.0, 1.0, 2.0, 0.5];
        let y_dot = [0.0; 8];
        let mut res = [0.0; 8];
        system.residual_with_jacobian(time, &y, &y_dot, &mut res).unwrap();

        let b = [1.0, 2.0, -1.0, 0.5, 3.0, -2.0, 0.25, 1.0];
        let alpha = 10.0;
        let mut x = b;
        system.linear_solve(time, alpha, 1e-10, &mut x, &[1.0; 8], &y, &y_dot).unwrap();

        let mut jx = [0.0; 8];
        system.multiply_with_jacobian(&x, 1.0, 0.0, &mut jx).unwrap();
        let mut jdx = [0.0; 8];
        system.multiply_with_derivative_jacobian(&x, &mut jdx, 1.0).unwrap();
        for i in 0..8 {
            assert_relative_eq!(jx[i] + alpha * jdx[i], b[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_connection_validation() {
        let mut system = configured(3);
        assert!(matches!(system.connect(UnitOpId(1), UnitOpId(0), 1.0), Err(ConfigError::Network(_))));
        assert!(matches!(system.connect(UnitOpId(0), UnitOpId(9), 1.0), Err(ConfigError::Network(_))));
        assert!(matches!(system.connect(UnitOpId(2), UnitOpId(1), 1.0), Err(ConfigError::Network(_))));
        assert!(matches!(system.connect(UnitOpId(0), UnitOpId(1), -1.0), Err(ConfigError::Network(_))));

        system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
        assert!(matches!(system.connect(UnitOpId(0), UnitOpId(1), 1.0), Err(ConfigError::Network(_))));

        let mut mismatched = ModelSystem::new();
        mismatched.add_unit(Box::new(Inlet::new(UnitOpId(0)))).unwrap();
        mismatched.add_unit(Box::new(Cstr::new(UnitOpId(3)))).unwrap();
        mismatched.configure_units(&mut JsonParameterProvider::from_value(config())).unwrap();
        assert!(matches!(mismatched.connect(UnitOpId(0), UnitOpId(3), 1.0), Err(ConfigError::Network(_))));

        assert!(system.add_unit(Box::new(Cstr::new(UnitOpId(1)))).is_err());
    }

    #[test]
    fn test_finalize_rejects_unconnected_inlet() {
        let mut system = configured(1);
        assert!(matches!(system.finalize(), Err(ConfigError::Network(_))));
    }

    #[test]
    fn test_finalize_rejects_flow_imbalance() {
        let mut system = configured(2);
        system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
        system.connect(UnitOpId(1), UnitOpId(2), 2.0).unwrap();
        match system.finalize() {
            Err(ConfigError::Network(reason)) => assert!(reason.contains("cannot accumulate")),
            other => panic!("expected flow imbalance, got {other:?}"),
        }
    }

    #[test]
    fn test_evaluation_requires_finalize() {
        let mut system = configured(1);
        let mut res = [0.0; 4];
        assert!(matches!(
            system.residual(SimulationTime::new(0.0, 0), &[0.0; 4], &[0.0; 4], &mut res),
            Err(SystemError::Precondition(_))
        ));
        assert!(matches!(system.prepare_ad_vectors(), Err(SystemError::Precondition(_))));
    }

    #[test]
    fn test_fused_parameter_groups() {
        let mut system = configured(2);
        system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
        system.connect(UnitOpId(1), UnitOpId(2), 1.0).unwrap();

        let v1 = ParameterId::new("VOLUME", UnitOpId(1));
        let v2 = ParameterId::new("VOLUME", UnitOpId(2));
        assert_eq!(system.set_sensitive_parameter(&[v1, v2], 1.0), Ok(0));
        let k = ParameterId::new("REACTION_RATE", UnitOpId(2)).with_component(1);
        assert_eq!(system.set_sensitive_parameter(&[k], 1.0), Ok(1));

        // Unknown parameters leave the registry untouched
        let bogus = ParameterId::new("VOLUME", UnitOpId(0));
        assert!(system.set_sensitive_parameter(&[k, bogus], 1.0).is_err());
        assert_eq!(system.n_sensitivities(), 2);

        system.finalize().unwrap();
        assert_eq!(system.dirs().sens_offset(), 2);

        system.set_sensitive_parameter_value(0, 4.0);
        let volumes: Vec<f64> = [v1, v2].iter().map(|id| system.unit(id.unit).unwrap().all_parameter_values()[id]).collect();
        assert_eq!(volumes, vec![4.0, 4.0]);

        system.clear_sens_params();
        assert_eq!(system.n_sensitivities(), 0);
        assert_eq!(system.dirs().sens_offset(), 0);
    }

    #[test]
    fn test_repeated_parameter_keeps_its_direction() {
        let mut system = configured(1);
        system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
        let coeff = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(0);
        let volume = ParameterId::new("VOLUME", UnitOpId(1));

        assert_eq!(system.set_sensitive_parameter(&[coeff], 1.0), Ok(0));
        assert_eq!(system.set_sensitive_parameter(&[coeff], 2.0), Ok(0));
        assert_eq!(system.set_sensitive_parameter(&[volume, volume], 1.0), Ok(1));
        assert_eq!(system.n_sensitivities(), 2);
        assert_eq!(system.direction_of(&coeff), Some(0));

        // Registered ids cannot be fused into another direction
        assert!(matches!(system.set_sensitive_parameter(&[coeff, volume], 1.0), Err(ConfigError::Invalid { .. })));
        let other = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(1).with_section(0);
        assert!(matches!(system.set_sensitive_parameter(&[other, coeff], 1.0), Err(ConfigError::Invalid { .. })));
        assert_eq!(system.n_sensitivities(), 2);
        assert_eq!(system.direction_of(&other), None);

        system.finalize().unwrap();
        assert_eq!(system.dirs().sens_offset(), 2);
    }

    #[test]
    fn test_registry_change_requires_new_preparation() {
        let mut system = chain(1, &[]);
        let time = SimulationTime::new(0.0, 0);
        let y = [50.0, 0.0, 10.0, 1.0];
        let y_dot = [0.0; 4];
        let mut res = [0.0; 4];
        system.residual_with_jacobian(time, &y, &y_dot, &mut res).unwrap();

        system.set_sensitive_parameter(&[ParameterId::new("VOLUME", UnitOpId(1))], 1.0).unwrap();
        assert!(matches!(system.residual_with_jacobian(time, &y, &y_dot, &mut res), Err(SystemError::Precondition(_))));
        assert!(matches!(system.notify_discontinuous_section_transition(0.0, 0), Err(SystemError::Precondition(_))));

        system.prepare_ad_vectors().unwrap();
        system.notify_discontinuous_section_transition(0.0, 0).unwrap();
        system.residual_with_jacobian(time, &y, &y_dot, &mut res).unwrap();
        let mut jx = [0.0; 4];
        system.multiply_with_jacobian(&[1.0; 4], 1.0, 0.0, &mut jx).unwrap();
        assert_relative_eq!(jx[0], 1.0);

        system.clear_sens_params();
        assert!(matches!(system.residual_with_jacobian(time, &y, &y_dot, &mut res), Err(SystemError::Precondition(_))));
        system.prepare_ad_vectors().unwrap();
        system.notify_discontinuous_section_transition(0.0, 0).unwrap();
        system.residual_with_jacobian(time, &y, &y_dot, &mut res).unwrap();
        system.multiply_with_jacobian(&[1.0; 4], 1.0, 0.0, &mut jx).unwrap();
        assert_relative_eq!(jx[0], 1.0);
    }

    #[test]
    fn test_mis_sized_buffers_are_rejected() {
        let mut system = chain(1, &[]);
        let time = SimulationTime::new(0.0, 0);
        let y = [50.0, 0.0, 10.0, 1.0];
        let mut res = [0.0; 4];
        assert!(matches!(system.residual(time, &y, &[0.0; 3], &mut res), Err(SystemError::Precondition(_))));
        assert!(matches!(system.residual_with_jacobian(time, &y, &[0.0; 5], &mut res), Err(SystemError::Precondition(_))));

        system.residual_with_jacobian(time, &y, &[0.0; 4], &mut res).unwrap();
        let mut rhs = [1.0; 4];
        assert!(matches!(system.linear_solve(time, 1.0, 1e-10, &mut rhs, &[1.0; 2], &y, &[0.0; 4]), Err(SystemError::Precondition(_))));
        assert!(matches!(system.linear_solve(time, 1.0, 1e-10, &mut rhs, &[1.0; 4], &y[..3], &[0.0; 4]), Err(SystemError::Precondition(_))));
        assert!(matches!(system.linear_solve(time, 1.0, 1e-10, &mut rhs, &[1.0; 4], &y, &[0.0; 1]), Err(SystemError::Precondition(_))));
        assert_eq!(rhs, [1.0; 4]);

        let mut jx = [0.0; 3];
        assert!(matches!(system.multiply_with_jacobian(&[1.0; 4], 1.0, 0.0, &mut jx), Err(SystemError::Precondition(_))));

        // One sensitivity vector too many
        let s = vec![vec![0.0; 4]];
        let mut res_s = vec![vec![0.0; 4]];
        assert!(matches!(system.residual_sens_fwd_combine(time, &s, &s, &mut res_s), Err(SystemError::Precondition(_))));
    }

    #[test]
    fn test_sensitivity_through_boundary_profile() {
        let coeff = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(0);
        let mut system = chain(1, &[coeff]);
        let time = SimulationTime::new(0.0, 0);
        let mut y = vec![0.0; 4];
        let mut y_dot = vec![0.0; 4];
        system.consistent_initial_conditions(time, &mut y, &mut y_dot, 1e-10, false).unwrap();

        let mut s = vec![vec![0.0; 4]];
        let mut s_dot = vec![vec![0.0; 4]];
        system.consistent_initial_sensitivity(time, &y, &y_dot, &mut s, &mut s_dot, false).unwrap();
        assert_eq!(&s[0][..2], &[1.0, 0.0]);
        assert_relative_eq!(s_dot[0][2], 1.0 / 5.0, epsilon = 1e-12);

        let mut res_s = vec![vec![0.0; 4]];
        system.residual_sens_fwd_combine(time, &s, &s_dot, &mut res_s).unwrap();
        for r in &res_s[0] {
            assert!(r.abs() < 1e-12, "sensitivity residual {res_s:?}");
        }
    }

    #[test]
    fn test_initial_conditions_from_provider() {
        let mut system = chain(2, &[]);
        let mut y = vec![0.0; 8];
        let mut y_dot = vec![0.0; 8];
        let mut provider = JsonParameterProvider::from_value(json!({
            "unit_000": {},
            "unit_001": { "INIT_C": [2.0, 3.0] },
            "unit_002": { "INIT_C": [4.0, 5.0] }
        }));
        system.apply_initial_conditions_from(&mut provider, &mut y, &mut y_dot).unwrap();
        assert_eq!(y, vec![0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0, 5.0]);
        assert_eq!(provider.scope_path(), "/");
    }

    #[test]
    fn test_expand_error_tol_and_reporting() {
        let system = chain(1, &[]);
        assert_eq!(system.expand_error_tol(&[1e-6]), vec![1e-6; 4]);

        let mut recorder = MemoryRecorder::new();
        system.report_solution_structure(&mut recorder);
        system.report_solution(&mut recorder, SimulationTime::new(0.5, 0), &[50.0, 0.0, 7.0, 0.0]).unwrap();
        assert_eq!(recorder.times(), &[0.5]);
        assert_eq!(recorder.outlet(UnitOpId(0)), &[vec![50.0, 0.0]]);
        assert_eq!(recorder.outlet(UnitOpId(1)), &[vec![7.0, 0.0]]);

        assert!(matches!(
            system.report_solution(&mut recorder, SimulationTime::new(1.0, 0), &[0.0; 3]),
            Err(SystemError::Precondition(_))
        ));
        assert_eq!(recorder.times(), &[0.5]);
        assert_eq!(recorder.structure(UnitOpId(0)).map(|s| s.name), Some("INLET"));
    }
}
