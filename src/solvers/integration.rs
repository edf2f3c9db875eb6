//! Time integration of a [`ModelSystem`] through the unit operation contract.
//!
//! [`DaeIntegrator`] is a small implicit Euler driver. It walks
//! the section partition, announces discontinuous transitions, runs consistent
//! initialization and then steps with a Newton iteration whose linear systems
//! are delegated to [`ModelSystem::linear_solve`]. Forward sensitivities are
//! advanced with the same discretization after each accepted step.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//! use unitflow::models::{Cstr, Inlet};
//! use unitflow::params::JsonParameterProvider;
//! use unitflow::recorder::MemoryRecorder;
//! use unitflow::solvers::integration::DaeIntegrator;
//! use unitflow::{ModelSystem, SectionTimes, UnitOpId};
//!
//! let mut provider = JsonParameterProvider::from_value(json!({
//!     "unit_000": { "NCOMP": 1, "sec_000": { "CONST_COEFF": [1.0] } },
//!     "unit_001": { "NCOMP": 1, "VOLUME": 1.0 }
//! }));
//! let mut system = ModelSystem::new();
//! system.add_unit(Box::new(Inlet::new(UnitOpId(0)))).unwrap();
//! system.add_unit(Box::new(Cstr::new(UnitOpId(1)))).unwrap();
//! system.configure_units(&mut provider).unwrap();
//! system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
//! system.finalize().unwrap();
//! system.set_section_times(&SectionTimes::single(0.0, 1.0).unwrap()).unwrap();
//!
//! let mut recorder = MemoryRecorder::new();
//! let output = DaeIntegrator::default().integrate(&mut system, &mut recorder).unwrap();
//! assert!(output.y[1] > 0.5);
//! ```

use crate::recorder::SolutionRecorder;
use crate::solvers::{DAESolverConfig, SolverError, SolverResult, error_weights, weighted_rms_norm};
use crate::system::{ModelSystem, SystemError, SystemResult};
use crate::unit::SimulationTime;

/// Counters collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationStats {
    /// Accepted steps
    pub steps: usize,
    /// Steps rejected and retried with half the step size
    pub rejected_steps: usize,
    /// Newton iterations over all attempts
    pub newton_iterations: usize,
    /// Consistent initializations (start and discontinuous transitions)
    pub reinitializations: usize,
}

/// Final state of a run.
#[derive(Debug, Clone)]
pub struct IntegrationOutput {
    pub t: f64,
    pub y: Vec<f64>,
    pub y_dot: Vec<f64>,
    /// One vector per sensitivity direction
    pub sensitivities: Vec<Vec<f64>>,
    pub sensitivity_derivatives: Vec<Vec<f64>>,
    pub stats: IntegrationStats,
}

/// Implicit Euler integrator over the section partition of a [`ModelSystem`].
#[derive(Debug, Clone, Default)]
pub struct DaeIntegrator {
    pub config: DAESolverConfig,
}

/// Converts a network failure at time `t` into a solver error.
fn fatal(error: SystemError, time: f64) -> SolverError {
    match error {
        SystemError::Unit { unit, source } => SolverError::Fatal { unit, time, reason: source.to_string() },
        other => SolverError::System(other),
    }
}

impl DaeIntegrator {
    pub fn new(config: DAESolverConfig) -> Self {
        DaeIntegrator { config }
    }

    /// Sets the step size used from the start (and the upper bound for step growth).
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.config.max_step = max_step;
        self
    }

    /// Selects lean reinitialization at discontinuous section transitions.
    pub fn with_lean_reinitialization(mut self, lean: bool) -> Self {
        self.config.lean_reinitialization = lean;
        self
    }

    /// Integrates `system` over all of its sections, reporting every accepted step.
    ///
    /// The system must be finalized and have section times.
    ///
    /// # Errors
    ///
    /// - [`SolverError::Fatal`] if a unit reports a non-recoverable failure
    /// - [`SolverError::StepSizeTooSmall`] if recoverable failures persist
    ///   below the minimum step size
    pub fn integrate(&self, system: &mut ModelSystem, recorder: &mut dyn SolutionRecorder) -> SolverResult<IntegrationOutput> {
        let sections = system
            .sections()
            .cloned()
            .ok_or_else(|| SolverError::System(SystemError::Precondition("section times not set".to_string())))?;
        let n = system.n_dofs();
        let n_sens = system.n_sensitivities();

        system.prepare_ad_vectors()?;
        let mut y = vec![0.0; n];
        let mut y_dot = vec![0.0; n];
        system.apply_initial_conditions(&mut y, &mut y_dot)?;
        system.report_solution_structure(recorder);
        let atol = system.expand_error_tol(&[self.config.atol]);

        let mut s = vec![vec![0.0; n]; n_sens];
        let mut s_dot = vec![vec![0.0; n]; n_sens];
        let mut stats = IntegrationStats::default();
        let mut h = self.config.max_step;
        let mut t = sections.start(0);

        tracing::info!(n_dofs = n, n_sens, sections = sections.n_sections(), "starting integration");

        for sec in 0..sections.n_sections() {
            let t_end = sections.end(sec);
            if !sections.is_continuous_into(sec) {
                let lean = self.config.lean_reinitialization && sec > 0;
                let time = SimulationTime::new(t, sec);
                system.notify_discontinuous_section_transition(t, sec).map_err(|e| fatal(e, t))?;
                system.consistent_initial_conditions(time, &mut y, &mut y_dot, self.config.atol, lean).map_err(|e| fatal(e, t))?;
                if n_sens > 0 {
                    system.consistent_initial_sensitivity(time, &y, &y_dot, &mut s, &mut s_dot, lean).map_err(|e| fatal(e, t))?;
                }
                stats.reinitializations += 1;
            }
            if sec == 0 {
                system.report_solution(recorder, SimulationTime::new(t, sec), &y)?;
            }

            while t < t_end {
                // Land exactly on the section end
                let step = if t_end - t <= h * (1.0 + 1e-8) { t_end - t } else { h };
                let time = SimulationTime::new(t + step, sec);

                match self.newton_step(system, time, step, &mut y, &mut y_dot, &atol, &mut stats) {
                    Ok(true) => {
                        t = if step == t_end - t { t_end } else { t + step };
                        stats.steps += 1;
                        if n_sens > 0 {
                            self.sensitivity_step(system, time, step, &y, &y_dot, &mut s, &mut s_dot).map_err(|e| fatal(e, t))?;
                        }
                        system.report_solution(recorder, SimulationTime::new(t, sec), &y)?;
                        h = (2.0 * step).min(self.config.max_step).max(h);
                    }
                    Ok(false) => h = self.reject(&mut stats, t, step, "Newton iteration did not converge")?,
                    Err(e) if e.is_recoverable() => h = self.reject(&mut stats, t, step, &e.to_string())?,
                    Err(e) => return Err(fatal(e, time.t)),
                }
            }
        }

        tracing::info!(steps = stats.steps, rejected = stats.rejected_steps, newton = stats.newton_iterations, "integration finished");
        Ok(IntegrationOutput { t, y, y_dot, sensitivities: s, sensitivity_derivatives: s_dot, stats })
    }

    /// Halves the step size after a rejected attempt.
    fn reject(&self, stats: &mut IntegrationStats, t: f64, step: f64, reason: &str) -> SolverResult<f64> {
        stats.rejected_steps += 1;
        let h = 0.5 * step;
        tracing::warn!(t, step, %reason, "step rejected");
        if h < self.config.min_step {
            return Err(SolverError::StepSizeTooSmall { time: t, step: h });
        }
        Ok(h)
    }

    /// One implicit Euler step to `time`; commits `y` and `y_dot` only on convergence.
    #[allow(clippy::too_many_arguments)]
    fn newton_step(
        &self,
        system: &mut ModelSystem,
        time: SimulationTime,
        h: f64,
        y: &mut Vec<f64>,
        y_dot: &mut Vec<f64>,
        atol: &[f64],
        stats: &mut IntegrationStats,
    ) -> SystemResult<bool> {
        let rtol = self.config.rtol;
        let alpha = 1.0 / h;
        // Explicit Euler predictor
        let mut y_new: Vec<f64> = y.iter().zip(y_dot.iter()).map(|(yi, di)| yi + h * di).collect();
        let mut y_dot_new = y_dot.clone();
        let mut res = vec![0.0; y.len()];

        for _ in 0..self.config.max_newton_iterations {
            stats.newton_iterations += 1;
            for ((d, yn), yo) in y_dot_new.iter_mut().zip(&y_new).zip(y.iter()) {
                *d = (yn - yo) * alpha;
            }
            system.residual_with_jacobian(time, &y_new, &y_dot_new, &mut res)?;

            let mut delta: Vec<f64> = res.iter().map(|r| -r).collect();
            let weights = error_weights(&y_new, atol, rtol);
            system.linear_solve(time, alpha, self.config.atol, &mut delta, &weights, &y_new, &y_dot_new)?;
            for (yn, d) in y_new.iter_mut().zip(&delta) {
                *yn += d;
            }

            if weighted_rms_norm(&delta, &y_new, atol, rtol) < 1.0 {
                for ((d, yn), yo) in y_dot_new.iter_mut().zip(&y_new).zip(y.iter()) {
                    *d = (yn - yo) * alpha;
                }
                *y = y_new;
                *y_dot = y_dot_new;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Advances the sensitivities over an accepted step ending at `(y, y_dot)`.
    #[allow(clippy::too_many_arguments)]
    fn sensitivity_step(
        &self,
        system: &mut ModelSystem,
        time: SimulationTime,
        h: f64,
        y: &[f64],
        y_dot: &[f64],
        s: &mut [Vec<f64>],
        s_dot: &mut [Vec<f64>],
    ) -> SystemResult {
        let alpha = 1.0 / h;
        system.residual_sens_fwd_with_jacobian(time, y, y_dot)?;

        // res_k = ∂F/∂y s_k + ∂F/∂p_k with ṡ = 0
        let zeros = vec![vec![0.0; y.len()]; s.len()];
        let mut res = zeros.clone();
        system.residual_sens_fwd_combine(time, s, &zeros, &mut res)?;

        let weights = error_weights(y, &vec![self.config.atol; y.len()], self.config.rtol);
        for ((sk, sdk), mut delta) in s.iter_mut().zip(s_dot.iter_mut()).zip(res) {
            delta.iter_mut().for_each(|d| *d = -*d);
            system.linear_solve(time, alpha, self.config.atol, &mut delta, &weights, y, y_dot)?;
            for ((si, sdi), d) in sk.iter_mut().zip(sdk.iter_mut()).zip(&delta) {
                *si += d;
                *sdi = d * alpha;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cstr, Inlet};
    use crate::params::JsonParameterProvider;
    use crate::recorder::MemoryRecorder;
    use crate::{ParameterId, SectionTimes, UnitOpId};
    use approx::assert_relative_eq;
    use serde_json::{Value, json};

    /// Routes solver logs to the test output; filter with `RUST_LOG`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
    }

    fn tank_system(config: Value, sections: SectionTimes, sensitive: &[ParameterId]) -> ModelSystem {
        let mut system = ModelSystem::new();
        system.add_unit(Box::new(Inlet::new(UnitOpId(0)))).unwrap();
        system.add_unit(Box::new(Cstr::new(UnitOpId(1)))).unwrap();
        system.configure_units(&mut JsonParameterProvider::from_value(config)).unwrap();
        system.connect(UnitOpId(0), UnitOpId(1), 1.0).unwrap();
        for id in sensitive {
            system.set_sensitive_parameter(&[*id], 1.0).unwrap();
        }
        system.finalize().unwrap();
        system.set_section_times(&sections).unwrap();
        system
    }

    fn step_feed() -> Value {
        json!({
            "unit_000": { "NCOMP": 4, "sec_000": { "CONST_COEFF": [50.0, 0.0, 0.0, 0.0] } },
            "unit_001": { "NCOMP": 4, "VOLUME": 5.0 }
        })
    }

    #[test]
    fn test_tank_mass_balance() {
        init_tracing();
        let mut system = tank_system(step_feed(), SectionTimes::single(0.0, 10.0).unwrap(), &[]);
        let mut recorder = MemoryRecorder::new();
        let output = DaeIntegrator::default().with_max_step(0.05).integrate(&mut system, &mut recorder).unwrap();

        assert_relative_eq!(output.t, 10.0);
        assert_eq!(output.stats.reinitializations, 1);
        assert_eq!(output.stats.rejected_steps, 0);

        // Implicit Euler is conservative with the right-endpoint rule
        let times = recorder.times();
        let outlet = recorder.outlet(UnitOpId(1));
        assert_eq!(times.len(), outlet.len());
        let released: f64 = (1..times.len()).map(|k| (times[k] - times[k - 1]) * outlet[k][0]).sum();
        let fed = 50.0 * 10.0;
        let held = 5.0 * (outlet[outlet.len() - 1][0] - outlet[0][0]);
        assert_relative_eq!(fed - released - held, 0.0, epsilon = 1e-6);

        let exact = 50.0 * (1.0 - (-2.0f64).exp());
        assert_relative_eq!(output.y[4], exact, max_relative = 0.01);
        for c in &output.y[5..8] {
            assert_eq!(*c, 0.0);
        }
    }

    #[test]
    fn test_sensitivity_to_inlet_concentration() {
        let coeff = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(0);
        let mut system = tank_system(step_feed(), SectionTimes::single(0.0, 2.0).unwrap(), &[coeff]);
        let output = DaeIntegrator::default().integrate(&mut system, &mut MemoryRecorder::new()).unwrap();

        // The tank is linear in the feed: ∂c/∂c_feed = c / c_feed
        let s = &output.sensitivities[0];
        assert_relative_eq!(s[0], 1.0, epsilon = 1e-10);
        assert_relative_eq!(s[4], output.y[4] / 50.0, epsilon = 1e-8);
        assert_relative_eq!(s[5], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_repeated_sensitive_parameter_shares_one_direction() {
        let coeff = ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(0).with_section(0);
        let mut system = tank_system(step_feed(), SectionTimes::single(0.0, 2.0).unwrap(), &[coeff, coeff]);
        assert_eq!(system.n_sensitivities(), 1);
        let output = DaeIntegrator::default().integrate(&mut system, &mut MemoryRecorder::new()).unwrap();

        assert_eq!(output.sensitivities.len(), 1);
        let s = &output.sensitivities[0];
        assert_relative_eq!(s[4], output.y[4] / 50.0, epsilon = 1e-8);
    }

    #[test]
    fn test_discontinuous_sections_reinitialize() {
        let config = json!({
            "unit_000": {
                "NCOMP": 1,
                "sec_000": { "CONST_COEFF": [50.0] },
                "sec_001": { "CONST_COEFF": [0.0] }
            },
            "unit_001": { "NCOMP": 1, "VOLUME": 5.0 }
        });
        let sections = SectionTimes::new(vec![0.0, 5.0, 10.0], vec![false]).unwrap();
        let mut system = tank_system(config, sections, &[]);
        let mut recorder = MemoryRecorder::new();
        let output = DaeIntegrator::default().integrate(&mut system, &mut recorder).unwrap();

        assert_eq!(output.stats.reinitializations, 2);
        // Washout after the feed stops
        let outlet = recorder.outlet(UnitOpId(1));
        let at_switch = recorder.times().iter().position(|&t| t == 5.0).unwrap();
        assert!(outlet[at_switch][0] > 30.0);
        assert!(output.y[1] < outlet[at_switch][0]);
        assert_eq!(output.y[0], 0.0);

        // The feed is reported from the section the time point belongs to
        let feed = recorder.outlet(UnitOpId(0));
        assert_eq!(feed[0], vec![50.0]);
        assert_eq!(feed[at_switch], vec![50.0]);
        assert_eq!(feed[at_switch + 1], vec![0.0]);
        assert_eq!(feed[feed.len() - 1], vec![0.0]);
    }

    #[test]
    fn test_lean_reinitialization() {
        let config = json!({
            "unit_000": {
                "NCOMP": 1,
                "sec_000": { "CONST_COEFF": [10.0] },
                "sec_001": { "CONST_COEFF": [20.0] }
            },
            "unit_001": { "NCOMP": 1, "VOLUME": 1.0 }
        });
        let sections = SectionTimes::new(vec![0.0, 1.0, 2.0], vec![false]).unwrap();
        let mut system = tank_system(config, sections, &[]);
        let integrator = DaeIntegrator::default().with_lean_reinitialization(true);
        let output = integrator.integrate(&mut system, &mut MemoryRecorder::new()).unwrap();
        assert_eq!(output.stats.reinitializations, 2);
        assert!(output.y[1] > 10.0 && output.y[1] < 20.0);
    }

    #[test]
    fn test_missing_external_function_is_fatal() {
        init_tracing();
        let config = json!({
            "unit_000": { "NCOMP": 1, "sec_000": { "CONST_COEFF": [1.0] } },
            "unit_001": { "NCOMP": 1, "VOLUME": 1.0, "REACTION_RATE": [0.1], "REACTION_EXTFUN": 0 }
        });
        let mut system = tank_system(config, SectionTimes::single(0.0, 1.0).unwrap(), &[]);
        match DaeIntegrator::default().integrate(&mut system, &mut MemoryRecorder::new()) {
            Err(SolverError::Fatal { unit, time, .. }) => {
                assert_eq!(unit, UnitOpId(1));
                assert_eq!(time, 0.0);
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[test]
    fn test_requires_section_times() {
        let mut system = ModelSystem::new();
        system.finalize().unwrap();
        assert!(matches!(
            DaeIntegrator::default().integrate(&mut system, &mut MemoryRecorder::new()),
            Err(SolverError::System(SystemError::Precondition(_)))
        ));
    }
}
