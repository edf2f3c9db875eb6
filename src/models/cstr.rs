//! Continuous Stirred Tank Reactor (CSTR) model.
//!
//! A fixed-volume, ideally mixed tank with optional first-order decay and
//! optional multi-component Langmuir binding to a stationary phase.
//!
//! # State Variables
//!
//! ```text
//! [ c_in (n_comp) | c (n_comp) | q (n_bound) ]
//! ```
//!
//! - `c_in`: inlet concentrations (coupling DOFs, set by the network)
//! - `c`: bulk concentrations (differential)
//! - `q`: bound concentrations (differential if kinetic, algebraic if quasi-stationary)
//!
//! # Balance Equations
//!
//! ```text
//! inlet:   0 = c_in_i                     (network subtracts the upstream outlet)
//! bulk:    0 = tf (ċ_i + β q̇_i) - (F_in c_in_i - F_out c_i) / V + k_i(t) c_i
//! bound:   0 = tf q̇_i - f_i              (kinetic)
//!          0 = -f_i                        (quasi-stationary)
//!
//! f_i = ka_i c_i qmax_i (1 - Σ_j q_j / qmax_j) - kd_i q_i
//! ```
//!
//! `k_i(t)` is `REACTION_RATE_i`, optionally scaled by the external function
//! selected with `REACTION_EXTFUN`.
//!
//! # Example
//!
//! ```
//! use unitflow::models::Cstr;
//! use unitflow::params::JsonParameterProvider;
//! use unitflow::{UnitOpId, UnitOperation};
//!
//! let mut provider = JsonParameterProvider::parse(r#"{
//!     "NCOMP": 2,
//!     "VOLUME": 5.0,
//!     "BINDING": "LANGMUIR",
//!     "IS_KINETIC": false,
//!     "PHASE_RATIO": 0.5,
//!     "LANGMUIR_KA": [1.0, 2.0],
//!     "LANGMUIR_KD": [1.0, 1.0],
//!     "LANGMUIR_QMAX": [10.0, 10.0]
//! }"#).unwrap();
//!
//! let mut cstr = Cstr::new(UnitOpId(1));
//! cstr.configure(&mut provider).unwrap();
//!
//! // inlet + bulk + bound
//! assert_eq!(cstr.num_dofs(), 6);
//! assert_eq!(cstr.num_pure_dofs(), 4);
//! assert!(!cstr.can_accumulate());
//! ```

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::autodiff::{Active, AdDirections, AdVectors, ParamMode, Scalar, constant, jacobian_block};
use crate::initialization::{InitMode, InitPhase};
use crate::params::{ParameterProvider, get_double_array_len, get_double_or};
use crate::profile::SharedFunction;
use crate::recorder::{SolutionRecorder, SolutionView, StateOrdering, StridedSlice};
use crate::solvers::{NewtonRaphson, SolverError};
use crate::unit::{ConstState, SimulationTime, UnitBase, UnitOperation, UnitPhase, check_len, expand_uniform};
use crate::{ConfigError, ConfigResult, ParamName, ParameterId, SectionTimes, UnitError, UnitOpId, UnitResult};

const VOLUME: ParamName = ParamName::new("VOLUME");
const PHASE_RATIO: ParamName = ParamName::new("PHASE_RATIO");
const REACTION_RATE: ParamName = ParamName::new("REACTION_RATE");
const LANGMUIR_KA: ParamName = ParamName::new("LANGMUIR_KA");
const LANGMUIR_KD: ParamName = ParamName::new("LANGMUIR_KD");
const LANGMUIR_QMAX: ParamName = ParamName::new("LANGMUIR_QMAX");

const NEWTON_MAX_ITERATIONS: usize = 50;

/// How the bound phase relaxes towards equilibrium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingMode {
    /// Bound concentrations follow a rate equation
    Kinetic,
    /// Bound concentrations are in instantaneous equilibrium (algebraic)
    QuasiStationary,
}

#[derive(Debug, Clone, PartialEq)]
struct LangmuirParams {
    ka: Vec<f64>,
    kd: Vec<f64>,
    qmax: Vec<f64>,
}

/// Non-structural parameters, replaced as a whole on (re)configuration.
#[derive(Debug, Clone, PartialEq)]
struct CstrParams {
    volume: f64,
    phase_ratio: f64,
    reaction_rate: Vec<f64>,
    reaction_extfun: Option<usize>,
    init_c: Vec<f64>,
    init_q: Vec<f64>,
    langmuir: Option<LangmuirParams>,
}

impl CstrParams {
    fn empty() -> Self {
        CstrParams {
            volume: 1.0,
            phase_ratio: 0.0,
            reaction_rate: Vec::new(),
            reaction_extfun: None,
            init_c: Vec::new(),
            init_q: Vec::new(),
            langmuir: None,
        }
    }

    fn read(provider: &dyn ParameterProvider, n_comp: usize, binding: Option<BindingMode>) -> ConfigResult<Self> {
        let volume = provider.get_double("VOLUME")?;
        if volume <= 0.0 {
            return Err(ConfigError::Invalid { path: provider.path_of("VOLUME"), reason: format!("must be positive, got {volume}") });
        }
        let phase_ratio = get_double_or(provider, "PHASE_RATIO", 0.0)?;
        if phase_ratio < 0.0 {
            return Err(ConfigError::Invalid {
                path: provider.path_of("PHASE_RATIO"),
                reason: format!("must not be negative, got {phase_ratio}"),
            });
        }

        let optional_array = |name: &str, len: usize| -> ConfigResult<Vec<f64>> {
            if provider.exists(name) { get_double_array_len(provider, name, len) } else { Ok(vec![0.0; len]) }
        };
        let reaction_rate = optional_array("REACTION_RATE", n_comp)?;
        let n_bound = if binding.is_some() { n_comp } else { 0 };
        let init_c = optional_array("INIT_C", n_comp)?;
        let init_q = optional_array("INIT_Q", n_bound)?;

        let reaction_extfun = if provider.exists("REACTION_EXTFUN") {
            let idx = provider.get_int("REACTION_EXTFUN")?;
            let idx = usize::try_from(idx).map_err(|_| ConfigError::Invalid {
                path: provider.path_of("REACTION_EXTFUN"),
                reason: format!("must not be negative, got {idx}"),
            })?;
            Some(idx)
        } else {
            None
        };

        let langmuir = match binding {
            Some(_) => {
                let qmax = get_double_array_len(provider, "LANGMUIR_QMAX", n_comp)?;
                if let Some(q) = qmax.iter().find(|&&q| q <= 0.0) {
                    return Err(ConfigError::Invalid {
                        path: provider.path_of("LANGMUIR_QMAX"),
                        reason: format!("capacities must be positive, got {q}"),
                    });
                }
                Some(LangmuirParams {
                    ka: get_double_array_len(provider, "LANGMUIR_KA", n_comp)?,
                    kd: get_double_array_len(provider, "LANGMUIR_KD", n_comp)?,
                    qmax,
                })
            }
            None => None,
        };

        Ok(CstrParams { volume, phase_ratio, reaction_rate, reaction_extfun, init_c, init_q, langmuir })
    }
}

/// Continuous stirred tank with inlet coupling DOFs and optional Langmuir binding.
pub struct Cstr {
    base: UnitBase,
    n_comp: usize,
    binding: Option<BindingMode>,
    params: CstrParams,
    flow_in: Active,
    flow_out: Active,
    /// ∂F/∂y at the last Jacobian refresh
    jac: DMatrix<f64>,
    /// ∂F/∂ẏ for a time factor of one
    jac_dot: DMatrix<f64>,
}

impl Cstr {
    /// Creates an unconfigured tank.
    pub fn new(id: UnitOpId) -> Self {
        Cstr {
            base: UnitBase::new(id),
            n_comp: 0,
            binding: None,
            params: CstrParams::empty(),
            flow_in: constant(0.0),
            flow_out: constant(0.0),
            jac: DMatrix::zeros(0, 0),
            jac_dot: DMatrix::zeros(0, 0),
        }
    }

    /// Binding mode, if the tank has a stationary phase.
    pub fn binding(&self) -> Option<BindingMode> {
        self.binding
    }

    fn n_bound(&self) -> usize {
        if self.binding.is_some() { self.n_comp } else { 0 }
    }

    fn offset_c(&self) -> usize {
        self.n_comp
    }

    fn offset_q(&self) -> usize {
        2 * self.n_comp
    }

    fn is_quasi_stationary(&self) -> bool {
        self.binding == Some(BindingMode::QuasiStationary)
    }

    /// Rows whose residual contains a time derivative.
    fn is_differential_row(&self, row: usize) -> bool {
        (self.offset_c()..self.offset_q()).contains(&row) || (row >= self.offset_q() && !self.is_quasi_stationary())
    }

    fn id(&self, name: ParamName, component: Option<usize>) -> ParameterId {
        let mut id = ParameterId::from_name(name, self.base.id());
        id.component = component;
        if matches!(name, LANGMUIR_KA | LANGMUIR_KD | LANGMUIR_QMAX) {
            id.bound_state = Some(0);
        }
        id
    }

    fn param<S: Scalar>(&self, name: ParamName, component: Option<usize>, value: f64, mode: ParamMode) -> S {
        self.base.param(&self.id(name, component), value, mode)
    }

    fn param_value(&self, id: &ParameterId) -> Option<f64> {
        if id.unit != self.base.id() || id.section.is_some() {
            return None;
        }
        let p = &self.params;
        let comp = |v: &Vec<f64>| id.component.and_then(|c| v.get(c).copied());
        match (id.name, id.component, id.bound_state) {
            (VOLUME, None, None) => Some(p.volume),
            (PHASE_RATIO, None, None) if self.binding.is_some() => Some(p.phase_ratio),
            (REACTION_RATE, Some(_), None) => comp(&p.reaction_rate),
            (LANGMUIR_KA, Some(_), Some(0)) => p.langmuir.as_ref().and_then(|l| comp(&l.ka)),
            (LANGMUIR_KD, Some(_), Some(0)) => p.langmuir.as_ref().and_then(|l| comp(&l.kd)),
            (LANGMUIR_QMAX, Some(_), Some(0)) => p.langmuir.as_ref().and_then(|l| comp(&l.qmax)),
            _ => None,
        }
    }

    fn param_slot(&mut self, id: &ParameterId) -> Option<&mut f64> {
        self.param_value(id)?;
        let p = &mut self.params;
        let c = id.component.unwrap_or(0);
        match id.name {
            VOLUME => Some(&mut p.volume),
            PHASE_RATIO => Some(&mut p.phase_ratio),
            REACTION_RATE => p.reaction_rate.get_mut(c),
            LANGMUIR_KA => p.langmuir.as_mut().and_then(|l| l.ka.get_mut(c)),
            LANGMUIR_KD => p.langmuir.as_mut().and_then(|l| l.kd.get_mut(c)),
            LANGMUIR_QMAX => p.langmuir.as_mut().and_then(|l| l.qmax.get_mut(c)),
            _ => None,
        }
    }

    fn reaction_factor(&self, time: SimulationTime) -> UnitResult<f64> {
        match self.params.reaction_extfun {
            None => Ok(1.0),
            Some(idx) => match self.base.function(idx) {
                Some(f) => Ok(f.value(time.t, time.sec_idx)),
                None => Err(UnitError::Fatal(format!("external function {idx} has not been provided"))),
            },
        }
    }

    fn flows<S: Scalar>(&self, mode: ParamMode) -> (S, S) {
        match mode {
            ParamMode::Plain => (S::from_f64(self.flow_in.re), S::from_f64(self.flow_out.re)),
            ParamMode::Sensitive(_) => (S::from_active(&self.flow_in), S::from_active(&self.flow_out)),
        }
    }

    /// Evaluates the residual for plain or active scalars.
    fn residual_impl<S: Scalar>(&self, time: SimulationTime, y: &[S], y_dot: &[f64], res: &mut [S], mode: ParamMode) -> UnitResult {
        let n = self.n_comp;
        let (oc, oq) = (self.offset_c(), self.offset_q());
        check_len("state", y.len(), self.num_dofs())?;
        check_len("state derivative", y_dot.len(), self.num_dofs())?;
        check_len("residual", res.len(), self.num_dofs())?;
        if let Some(i) = y.iter().position(|v| !v.value().is_finite()) {
            return Err(UnitError::Recoverable(format!("state entry {i} is not finite")));
        }

        let tf = time.time_factor;
        let ext = self.reaction_factor(time)?;
        let p = &self.params;
        let volume: S = self.param(VOLUME, None, p.volume, mode);
        let beta: S = self.param(PHASE_RATIO, None, p.phase_ratio, mode);
        let (f_in, f_out) = self.flows::<S>(mode);
        let bound = self.binding.is_some();

        for i in 0..n {
            res[i] = y[i].clone();

            let k: S = self.param(REACTION_RATE, Some(i), p.reaction_rate[i], mode);
            let accumulation = tf * y_dot[oc + i];
            let mut r = S::from_f64(accumulation);
            if bound {
                r = r + beta.clone() * (tf * y_dot[oq + i]);
            }
            let convection = (f_in.clone() * y[i].clone() - f_out.clone() * y[oc + i].clone()) / volume.clone();
            res[oc + i] = r - convection + k * ext * y[oc + i].clone();
        }

        if let (Some(mode_binding), Some(lp)) = (self.binding, p.langmuir.as_ref()) {
            let qmax: Vec<S> = (0..n).map(|i| self.param(LANGMUIR_QMAX, Some(i), lp.qmax[i], mode)).collect();
            let mut load = S::from_f64(0.0);
            for j in 0..n {
                load = load + y[oq + j].clone() / qmax[j].clone();
            }
            let one: f64 = 1.0;
            let free = -(load - one);

            for i in 0..n {
                let ka: S = self.param(LANGMUIR_KA, Some(i), lp.ka[i], mode);
                let kd: S = self.param(LANGMUIR_KD, Some(i), lp.kd[i], mode);
                let flux = ka * y[oc + i].clone() * qmax[i].clone() * free.clone() - kd * y[oq + i].clone();
                res[oq + i] = match mode_binding {
                    BindingMode::Kinetic => S::from_f64(tf * y_dot[oq + i]) - flux,
                    BindingMode::QuasiStationary => -flux,
                };
            }
        }
        Ok(())
    }

    /// Analytic ∂F/∂y.
    fn analytic_jacobian(&self, time: SimulationTime, y: &[f64]) -> UnitResult<DMatrix<f64>> {
        let n = self.n_comp;
        let (oc, oq) = (self.offset_c(), self.offset_q());
        let p = &self.params;
        let ext = self.reaction_factor(time)?;
        let mut jac = DMatrix::zeros(self.num_dofs(), self.num_dofs());

        for i in 0..n {
            jac[(i, i)] = 1.0;
            jac[(oc + i, i)] = -self.flow_in.re / p.volume;
            jac[(oc + i, oc + i)] = self.flow_out.re / p.volume + p.reaction_rate[i] * ext;
        }

        if let Some(lp) = p.langmuir.as_ref() {
            let load: f64 = (0..n).map(|j| y[oq + j] / lp.qmax[j]).sum();
            for i in 0..n {
                jac[(oq + i, oc + i)] = -lp.ka[i] * lp.qmax[i] * (1.0 - load);
                for j in 0..n {
                    jac[(oq + i, oq + j)] = lp.ka[i] * y[oc + i] * lp.qmax[i] / lp.qmax[j];
                }
                jac[(oq + i, oq + i)] += lp.kd[i];
            }
        }
        Ok(jac)
    }

    /// ∂F/∂ẏ for a time factor of one.
    fn assemble_jac_dot(&mut self) {
        let n = self.n_comp;
        let (oc, oq) = (self.offset_c(), self.offset_q());
        let mut jac_dot = DMatrix::zeros(self.num_dofs(), self.num_dofs());
        for i in 0..n {
            jac_dot[(oc + i, oc + i)] = 1.0;
            if self.binding.is_some() {
                jac_dot[(oc + i, oq + i)] = self.params.phase_ratio;
            }
            if self.binding == Some(BindingMode::Kinetic) {
                jac_dot[(oq + i, oq + i)] = 1.0;
            }
        }
        self.jac_dot = jac_dot;
    }

    fn require_prepared(&self, operation: &str) -> UnitResult {
        match self.base.phase() {
            UnitPhase::SectionReady | UnitPhase::Active => Ok(()),
            phase => Err(UnitError::Precondition(format!("{operation} called on {} in phase {phase:?}", self.base.id()))),
        }
    }

    fn check_ad_budget(&self, dirs: &AdDirections) -> UnitResult {
        if self.uses_ad() && dirs.jacobian_dirs() < self.required_ad_dirs() {
            return Err(UnitError::Precondition(format!(
                "{} needs {} Jacobian directions, {} available",
                self.base.id(),
                self.required_ad_dirs(),
                dirs.jacobian_dirs()
            )));
        }
        Ok(())
    }

    /// Evaluates into the AD buffers and refreshes the Jacobians.
    fn evaluate_with_jacobian(&mut self, time: SimulationTime, state: ConstState<'_>, ad: &mut AdVectors<'_>, mode: ParamMode) -> UnitResult {
        self.require_prepared("residual_with_jacobian")?;
        check_len("AD buffers", ad.len(), self.num_dofs())?;
        if self.uses_ad() {
            self.check_ad_budget(&ad.dirs)?;
            ad.load_values(state.y);
            self.residual_impl(time, ad.y, state.y_dot, ad.res, mode)?;
            self.jac = jacobian_block(ad.res, ad.dirs, self.num_dofs());
        } else {
            let y: Vec<Active> = state.y.iter().map(|&v| constant(v)).collect();
            self.residual_impl(time, &y, state.y_dot, ad.res, mode)?;
            self.jac = self.analytic_jacobian(time, state.y)?;
        }
        self.assemble_jac_dot();
        Ok(())
    }

    /// Matrix of the time-derivative problem over the pure DOFs.
    ///
    /// Differential rows use `tf ∂F/∂ẏ`, algebraic rows use `∂F/∂y`
    /// (their total time derivative).
    fn derivative_system(&self, time_factor: f64) -> DMatrix<f64> {
        let n_in = self.n_comp;
        let n_pure = self.num_pure_dofs();
        let mut m = DMatrix::zeros(n_pure, n_pure);
        for r in 0..n_pure {
            let row = n_in + r;
            for c in 0..n_pure {
                m[(r, c)] = if self.is_differential_row(row) {
                    time_factor * self.jac_dot[(row, n_in + c)]
                } else {
                    self.jac[(row, n_in + c)]
                };
            }
        }
        m
    }

    fn solve_dense(&self, m: DMatrix<f64>, rhs: DVector<f64>, what: &str) -> UnitResult<DVector<f64>> {
        m.lu().solve(&rhs).ok_or_else(|| {
            tracing::warn!(unit = %self.base.id(), what, "singular matrix");
            UnitError::Recoverable(format!("singular matrix in {what}"))
        })
    }

    /// `∂F/∂p_k` for every row, read from direction `k`.
    fn parameter_derivatives(&self, ad_res: &[Active], dirs: &AdDirections, k: usize) -> Vec<f64> {
        ad_res.iter().map(|r| dirs.derivative(r, k)).collect()
    }

    fn row_dot(&self, m: &DMatrix<f64>, row: usize, x: &[f64], cols: std::ops::Range<usize>) -> f64 {
        cols.map(|c| m[(row, c)] * x[c]).sum()
    }

    fn check_sensitivity_buffers(&self, sens_y: &[&mut [f64]], sens_y_dot: &[&mut [f64]], ad_res: &[Active], dirs: &AdDirections) -> UnitResult {
        self.base.sens.validate(dirs)?;
        check_len("AD residual", ad_res.len(), self.num_dofs())?;
        check_len("sensitivity derivatives", sens_y_dot.len(), sens_y.len())?;
        if sens_y.len() > dirs.sens_offset() {
            return Err(UnitError::Fatal(format!("{} sensitivities but only {} directions", sens_y.len(), dirs.sens_offset())));
        }
        for (s, sd) in sens_y.iter().zip(sens_y_dot) {
            check_len("sensitivity", s.len(), self.num_dofs())?;
            check_len("sensitivity derivative", sd.len(), self.num_dofs())?;
        }
        Ok(())
    }

    fn view<'a>(&'a self, solution: &'a [f64]) -> SolutionView<'a> {
        let (oc, oq) = (self.offset_c(), self.offset_q());
        let (inlet, bulk, solid) = if solution.len() >= self.num_dofs() {
            (&solution[..oc], &solution[oc..oq], &solution[oq..self.num_dofs()])
        } else {
            (&[][..], &[][..], &[][..])
        };
        SolutionView {
            unit: self.base.id(),
            unit_name: self.unit_operation_name(),
            n_comp: self.n_comp,
            n_bound: self.n_bound(),
            bulk,
            bulk_ordering: &[StateOrdering::Component],
            solid,
            solid_ordering: &[StateOrdering::Component, StateOrdering::BoundState],
            inlet: Some(StridedSlice::new(inlet, 1, inlet.len())),
            outlet: Some(StridedSlice::new(bulk, 1, bulk.len())),
        }
    }
}

impl UnitOperation for Cstr {
    fn unit_operation_id(&self) -> UnitOpId {
        self.base.id()
    }

    fn unit_operation_name(&self) -> &'static str {
        "CSTR"
    }

    fn num_components(&self) -> usize {
        self.n_comp
    }

    fn num_dofs(&self) -> usize {
        2 * self.n_comp + self.n_bound()
    }

    fn num_pure_dofs(&self) -> usize {
        self.n_comp + self.n_bound()
    }

    fn uses_ad(&self) -> bool {
        !self.base.analytic_jacobian()
    }

    fn required_ad_dirs(&self) -> usize {
        if self.uses_ad() { self.num_dofs() } else { 0 }
    }

    fn has_inlet(&self) -> bool {
        true
    }

    fn has_outlet(&self) -> bool {
        true
    }

    fn can_accumulate(&self) -> bool {
        false
    }

    fn local_inlet_component_index(&self) -> usize {
        0
    }

    fn local_inlet_component_stride(&self) -> usize {
        1
    }

    fn local_outlet_component_index(&self) -> usize {
        self.offset_c()
    }

    fn local_outlet_component_stride(&self) -> usize {
        1
    }

    fn configure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        let n_comp = provider.get_int("NCOMP")?;
        if n_comp <= 0 {
            let path = provider.path_of("NCOMP");
            tracing::error!(%path, n_comp, "invalid number of components");
            return Err(ConfigError::Invalid { path, reason: format!("must be positive, got {n_comp}") });
        }
        let n_comp = n_comp as usize;

        let binding = read_binding(provider)?;
        let params = CstrParams::read(provider, n_comp, binding).inspect_err(|e| {
            tracing::error!(unit = %self.base.id(), error = %e, "CSTR configuration failed");
        })?;

        self.n_comp = n_comp;
        self.binding = binding;
        self.params = params;
        self.jac = DMatrix::zeros(self.num_dofs(), self.num_dofs());
        self.assemble_jac_dot();
        self.base.mark_configured();
        tracing::info!(unit = %self.base.id(), n_comp, binding = ?binding, n_dofs = self.num_dofs(), "CSTR configured");
        Ok(())
    }

    fn reconfigure(&mut self, provider: &mut dyn ParameterProvider) -> ConfigResult {
        self.base.require_reconfigurable()?;
        if provider.exists("NCOMP") && provider.get_int("NCOMP")? as i64 != self.n_comp as i64 {
            return Err(ConfigError::Invalid {
                path: provider.path_of("NCOMP"),
                reason: "number of components is structural, call configure".to_string(),
            });
        }
        if read_binding(provider)? != self.binding {
            return Err(ConfigError::Invalid {
                path: provider.path_of("BINDING"),
                reason: "binding model is structural, call configure".to_string(),
            });
        }
        self.params = CstrParams::read(provider, self.n_comp, self.binding)?;
        self.assemble_jac_dot();
        tracing::debug!(unit = %self.base.id(), "CSTR reconfigured");
        Ok(())
    }

    fn all_parameter_values(&self) -> BTreeMap<ParameterId, f64> {
        let mut ids = vec![self.id(VOLUME, None)];
        if self.binding.is_some() {
            ids.push(self.id(PHASE_RATIO, None));
        }
        for i in 0..self.n_comp {
            ids.push(self.id(REACTION_RATE, Some(i)));
            if self.binding.is_some() {
                ids.extend([LANGMUIR_KA, LANGMUIR_KD, LANGMUIR_QMAX].map(|name| self.id(name, Some(i))));
            }
        }
        ids.into_iter().filter_map(|id| self.param_value(&id).map(|v| (id, v))).collect()
    }

    fn has_parameter(&self, id: &ParameterId) -> bool {
        self.param_value(id).is_some()
    }

    fn set_parameter(&mut self, id: &ParameterId, value: f64) -> bool {
        let Some(slot) = self.param_slot(id) else {
            return false;
        };
        *slot = value;
        if id.name == PHASE_RATIO {
            self.assemble_jac_dot();
        }
        true
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

    fn use_analytic_jacobian(&mut self, analytic: bool) -> bool {
        self.base.set_analytic_jacobian(analytic);
        analytic
    }

    fn set_section_times(&mut self, sections: &SectionTimes) -> ConfigResult {
        self.base.set_sections(sections);
        Ok(())
    }

    fn set_flow_rates(&mut self, in_flow: &Active, out_flow: &Active) {
        self.flow_in = in_flow.clone();
        self.flow_out = out_flow.clone();
    }

    fn set_external_functions(&mut self, functions: &[SharedFunction]) {
        self.base.set_functions(functions);
    }

    fn prepare_ad_vectors(&mut self, ad: &mut AdVectors<'_>) -> UnitResult {
        check_len("AD buffers", ad.len(), self.num_dofs())?;
        self.check_ad_budget(&ad.dirs)?;
        self.base.mark_prepared()?;
        if self.uses_ad() {
            ad.seed_dense();
        }
        Ok(())
    }

    fn notify_discontinuous_section_transition(&mut self, t: f64, sec_idx: usize, ad: &mut AdVectors<'_>) -> UnitResult {
        self.base.enter_section(t, sec_idx)?;
        if self.uses_ad() {
            check_len("AD buffers", ad.len(), self.num_dofs())?;
            self.check_ad_budget(&ad.dirs)?;
            ad.seed_dense();
        }
        Ok(())
    }

    fn apply_initial_condition(&self, y: &mut [f64], y_dot: &mut [f64]) {
        let (oc, oq) = (self.offset_c(), self.offset_q());
        y[oc..oq].copy_from_slice(&self.params.init_c);
        y[oq..self.num_dofs()].copy_from_slice(&self.params.init_q);
        y_dot[..self.num_dofs()].fill(0.0);
    }

    fn apply_initial_condition_from(&mut self, provider: &mut dyn ParameterProvider, y: &mut [f64], y_dot: &mut [f64]) -> ConfigResult {
        let n_dofs = self.num_dofs();
        if provider.exists("INIT_STATE") {
            let state = provider.get_double_array("INIT_STATE")?;
            if state.len() >= 2 * n_dofs {
                y[..n_dofs].copy_from_slice(&state[..n_dofs]);
                y_dot[..n_dofs].copy_from_slice(&state[n_dofs..2 * n_dofs]);
            } else if state.len() >= n_dofs {
                y[..n_dofs].copy_from_slice(&state[..n_dofs]);
            } else {
                return Err(ConfigError::Invalid {
                    path: provider.path_of("INIT_STATE"),
                    reason: format!("expected at least {n_dofs} entries, got {}", state.len()),
                });
            }
            return Ok(());
        }

        let (oc, oq) = (self.offset_c(), self.offset_q());
        y[oc..oq].copy_from_slice(&get_double_array_len(provider, "INIT_C", self.n_comp)?);
        if self.binding.is_some() {
            let init_q = if provider.exists("INIT_Q") { get_double_array_len(provider, "INIT_Q", self.n_comp)? } else { vec![0.0; self.n_comp] };
            y[oq..n_dofs].copy_from_slice(&init_q);
        }
        Ok(())
    }

    fn residual(&mut self, time: SimulationTime, state: ConstState<'_>, res: &mut [f64]) -> UnitResult {
        self.base.require_configured("residual")?;
        self.residual_impl(time, state.y, state.y_dot, res, ParamMode::Plain)
    }

    fn residual_with_jacobian(&mut self, time: SimulationTime, state: ConstState<'_>, res: &mut [f64], ad: &mut AdVectors<'_>) -> UnitResult {
        check_len("residual", res.len(), self.num_dofs())?;
        self.evaluate_with_jacobian(time, state, ad, ParamMode::Plain)?;
        ad.store_residual(res);
        Ok(())
    }

    fn residual_sens_fwd_ad_only(&mut self, time: SimulationTime, state: ConstState<'_>, ad_res: &mut [Active], dirs: AdDirections) -> UnitResult {
        self.base.require_configured("residual_sens_fwd_ad_only")?;
        self.base.sens.validate(&dirs)?;
        let y: Vec<Active> = state.y.iter().map(|&v| constant(v)).collect();
        self.residual_impl(time, &y, state.y_dot, ad_res, ParamMode::Sensitive(dirs))
    }

    fn residual_sens_fwd_with_jacobian(&mut self, time: SimulationTime, state: ConstState<'_>, ad: &mut AdVectors<'_>) -> UnitResult {
        self.base.sens.validate(&ad.dirs)?;
        let dirs = ad.dirs;
        self.evaluate_with_jacobian(time, state, ad, ParamMode::Sensitive(dirs))
    }

    fn residual_sens_fwd_combine(
        &mut self,
        time: SimulationTime,
        ys: &[&[f64]],
        ys_dot: &[&[f64]],
        res_s: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult {
        let n_dofs = self.num_dofs();
        check_len("AD residual", ad_res.len(), n_dofs)?;
        check_len("sensitivity derivatives", ys_dot.len(), ys.len())?;
        check_len("sensitivity residuals", res_s.len(), ys.len())?;
        let derivatives: Vec<DVector<f64>> = ad_res.iter().map(|r| dirs.derivatives(r)).collect();

        for (k, ((s, s_dot), out)) in ys.iter().zip(ys_dot).zip(res_s.iter_mut()).enumerate() {
            check_len("sensitivity", s.len(), n_dofs)?;
            check_len("sensitivity derivative", s_dot.len(), n_dofs)?;
            check_len("sensitivity residual", out.len(), n_dofs)?;
            let r = &self.jac * DVector::from_column_slice(s) + (&self.jac_dot * DVector::from_column_slice(s_dot)) * time.time_factor;
            for i in 0..n_dofs {
                out[i] = r[i] + if k < dirs.sens_offset() { derivatives[i][k] } else { 0.0 };
            }
        }
        Ok(())
    }

    fn linear_solve(&mut self, time: SimulationTime, alpha: f64, _tol: f64, rhs: &mut [f64], _weight: &[f64], _state: ConstState<'_>) -> UnitResult {
        check_len("right hand side", rhs.len(), self.num_dofs())?;
        let m = &self.jac + &self.jac_dot * (alpha * time.time_factor);
        let x = self.solve_dense(m, DVector::from_column_slice(rhs), "linear solve")?;
        rhs.copy_from_slice(x.as_slice());
        Ok(())
    }

    fn multiply_with_jacobian(&self, x: &[f64], alpha: f64, beta: f64, ret: &mut [f64]) {
        let jx = &self.jac * DVector::from_column_slice(x);
        for (r, v) in ret.iter_mut().zip(jx.iter()) {
            *r = alpha * v + beta * *r;
        }
    }

    fn multiply_with_derivative_jacobian(&self, x: &[f64], ret: &mut [f64], time_factor: f64) {
        let jx = &self.jac_dot * DVector::from_column_slice(x);
        for (r, v) in ret.iter_mut().zip(jx.iter()) {
            *r = time_factor * v;
        }
    }

    fn consistent_initial_state(&mut self, time: SimulationTime, y: &mut [f64], ad: &mut AdVectors<'_>, error_tol: f64) -> UnitResult {
        self.base.require_configured("consistent_initial_state")?;
        self.base.init.enter(InitPhase::State, InitMode::Full)?;
        let n_dofs = self.num_dofs();
        check_len("state", y.len(), n_dofs)?;
        let zeros = vec![0.0; n_dofs];
        let mut res = vec![0.0; n_dofs];

        if self.is_quasi_stationary() {
            let (oq, nb) = (self.offset_q(), self.n_bound());
            let mut y_work = y.to_vec();
            let solver = NewtonRaphson::new(error_tol, NEWTON_MAX_ITERATIONS);
            let solution = solver.solve(
                |q: &[f64]| {
                    y_work[oq..].copy_from_slice(q);
                    self.residual_with_jacobian(time, ConstState::new(&y_work, &zeros), &mut res, ad)?;
                    Ok((res[oq..].to_vec(), self.jac.view((oq, oq), (nb, nb)).into_owned()))
                },
                &y[oq..],
            );
            match solution {
                Ok(q) => y[oq..].copy_from_slice(&q),
                Err(SolverError::Unit(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!(unit = %self.base.id(), t = time.t, error = %e, "bound state initialization failed");
                    return Err(UnitError::Recoverable(format!("bound state initialization: {e}")));
                }
            }
        }

        // Jacobian at the final point for the time-derivative phase
        self.residual_with_jacobian(time, ConstState::new(y, &zeros), &mut res, ad)
    }

    fn consistent_initial_time_derivative(&mut self, time: SimulationTime, y: &[f64], y_dot: &mut [f64]) -> UnitResult {
        self.base.init.enter(InitPhase::TimeDerivative, InitMode::Full)?;
        let n_in = self.n_comp;
        let n_dofs = self.num_dofs();
        check_len("state derivative", y_dot.len(), n_dofs)?;

        let mut y_dot_work = y_dot.to_vec();
        y_dot_work[n_in..].fill(0.0);
        let mut res = vec![0.0; n_dofs];
        self.residual(time, ConstState::new(y, &y_dot_work), &mut res)?;

        let rhs = DVector::from_fn(self.num_pure_dofs(), |r, _| {
            let row = n_in + r;
            if self.is_differential_row(row) { -res[row] } else { -self.row_dot(&self.jac, row, &*y_dot, 0..n_in) }
        });
        let x = self.solve_dense(self.derivative_system(time.time_factor), rhs, "time derivative initialization")?;
        y_dot[n_in..].copy_from_slice(x.as_slice());
        Ok(())
    }

    fn lean_consistent_initial_state(&mut self, time: SimulationTime, y: &mut [f64], ad: &mut AdVectors<'_>, _error_tol: f64) -> UnitResult {
        self.base.require_configured("lean_consistent_initial_state")?;
        self.base.init.enter(InitPhase::State, InitMode::Lean)?;
        let zeros = vec![0.0; self.num_dofs()];
        let mut res = vec![0.0; self.num_dofs()];
        self.residual_with_jacobian(time, ConstState::new(y, &zeros), &mut res, ad)
    }

    fn lean_consistent_initial_time_derivative(&mut self, _t: f64, time_factor: f64, y_dot: &mut [f64], res: &[f64]) -> UnitResult {
        self.base.init.enter(InitPhase::TimeDerivative, InitMode::Lean)?;
        check_len("state derivative", y_dot.len(), self.num_dofs())?;
        check_len("residual", res.len(), self.num_dofs())?;
        let oc = self.offset_c();
        for i in oc..oc + self.n_comp {
            y_dot[i] -= res[i] / time_factor;
        }
        Ok(())
    }

    fn consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        _state: ConstState<'_>,
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult {
        self.base.init.enter(InitPhase::Sensitivity, InitMode::Full)?;
        self.check_sensitivity_buffers(sens_y, sens_y_dot, ad_res, &dirs)?;
        let n_in = self.n_comp;
        let (oq, nb) = (self.offset_q(), self.n_bound());

        for (k, (s, s_dot)) in sens_y.iter_mut().zip(sens_y_dot.iter_mut()).enumerate() {
            let dfdp = self.parameter_derivatives(ad_res, &dirs, k);

            // Algebraic rows: ∂F/∂q s_q = -(∂F/∂(c_in, c) s + ∂F/∂p)
            if self.is_quasi_stationary() {
                let a = self.jac.view((oq, oq), (nb, nb)).into_owned();
                let b = DVector::from_fn(nb, |i, _| -(self.row_dot(&self.jac, oq + i, s, 0..oq) + dfdp[oq + i]));
                let s_q = self.solve_dense(a, b, "sensitivity initialization")?;
                s[oq..].copy_from_slice(s_q.as_slice());
            }

            let rhs = DVector::from_fn(self.num_pure_dofs(), |r, _| {
                let row = n_in + r;
                if self.is_differential_row(row) {
                    -(self.row_dot(&self.jac, row, s, 0..self.num_dofs()) + dfdp[row])
                } else {
                    -self.row_dot(&self.jac, row, s_dot, 0..n_in)
                }
            });
            let x = self.solve_dense(self.derivative_system(time.time_factor), rhs, "sensitivity derivative initialization")?;
            s_dot[n_in..].copy_from_slice(x.as_slice());
        }
        Ok(())
    }

    fn lean_consistent_initial_sensitivity(
        &mut self,
        time: SimulationTime,
        _state: ConstState<'_>,
        sens_y: &mut [&mut [f64]],
        sens_y_dot: &mut [&mut [f64]],
        ad_res: &[Active],
        dirs: AdDirections,
    ) -> UnitResult {
        self.base.init.enter(InitPhase::Sensitivity, InitMode::Lean)?;
        self.check_sensitivity_buffers(sens_y, sens_y_dot, ad_res, &dirs)?;
        let n_dofs = self.num_dofs();
        let oc = self.offset_c();
        let tf = time.time_factor;

        for (k, (s, s_dot)) in sens_y.iter().zip(sens_y_dot.iter_mut()).enumerate() {
            let dfdp = self.parameter_derivatives(ad_res, &dirs, k);
            for row in oc..oc + self.n_comp {
                let r = self.row_dot(&self.jac, row, s, 0..n_dofs) + tf * self.row_dot(&self.jac_dot, row, s_dot, 0..n_dofs) + dfdp[row];
                s_dot[row] -= r / tf;
            }
        }
        Ok(())
    }

    fn expand_error_tol(&self, tol: &[f64], expanded: &mut [f64]) {
        if tol.len() != self.n_comp || self.n_comp <= 1 {
            expand_uniform(tol, expanded);
            return;
        }
        // One tolerance per component, shared by every block
        for (i, e) in expanded.iter_mut().enumerate() {
            *e = tol[i % self.n_comp];
        }
    }

    fn report_solution(&self, recorder: &mut dyn SolutionRecorder, _time: SimulationTime, solution: &[f64]) {
        recorder.record_solution(&self.view(solution));
    }

    fn report_solution_structure(&self, recorder: &mut dyn SolutionRecorder) {
        recorder.record_structure(&self.view(&[]));
    }
}

fn read_binding(provider: &dyn ParameterProvider) -> ConfigResult<Option<BindingMode>> {
    let kind = if provider.exists("BINDING") { provider.get_string("BINDING")? } else { "NONE".to_string() };
    match kind.as_str() {
        "NONE" => Ok(None),
        "LANGMUIR" => {
            let kinetic = if provider.exists("IS_KINETIC") { provider.get_bool("IS_KINETIC")? } else { true };
            Ok(Some(if kinetic { BindingMode::Kinetic } else { BindingMode::QuasiStationary }))
        }
        other => {
            let path = provider.path_of("BINDING");
            tracing::error!(%path, binding = other, "unsupported binding model");
            Err(ConfigError::Invalid { path, reason: format!("unsupported binding model {other}") })
        }
    }
}
