//! Bookkeeping for consistent initialization events.
//!
//! An initialization event consists of up to three phases, always in this
//! order:
//!
//! 1. state (`y`)
//! 2. time derivative (`ẏ`)
//! 3. sensitivities (`s`, `ṡ`)
//!
//! All phases of one event must use the same [`InitMode`]. A new event starts
//! with every state phase and at every discontinuous section transition.

use crate::{UnitError, UnitResult};

/// Full or lean initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Solve every algebraic constraint
    Full,
    /// Only update the fast bulk subset
    Lean,
}

/// Phase of an initialization event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitPhase {
    /// Consistent state
    State,
    /// Consistent time derivative
    TimeDerivative,
    /// Consistent sensitivities
    Sensitivity,
}

#[derive(Debug, Clone, Copy)]
struct InitEvent {
    mode: InitMode,
    last: InitPhase,
}

/// Runtime guard rejecting mixed lean/full initialization and out-of-order phases.
///
/// # Example
///
/// ```
/// use unitflow::{InitGuard, InitMode, InitPhase};
///
/// let mut guard = InitGuard::new();
/// guard.enter(InitPhase::State, InitMode::Lean).unwrap();
/// assert!(guard.enter(InitPhase::TimeDerivative, InitMode::Full).is_err());
/// guard.enter(InitPhase::TimeDerivative, InitMode::Lean).unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct InitGuard {
    event: Option<InitEvent>,
}

impl InitGuard {
    /// Creates a guard with no open event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the current event.
    pub fn reset(&mut self) {
        self.event = None;
    }

    /// Mode of the open event, if any.
    pub fn mode(&self) -> Option<InitMode> {
        self.event.map(|e| e.mode)
    }

    /// Records entry into a phase.
    ///
    /// # Errors
    ///
    /// Returns [`UnitError::Precondition`] if the mode differs from the open
    /// event's mode, or the phase's predecessor has not run in this event.
    pub fn enter(&mut self, phase: InitPhase, mode: InitMode) -> UnitResult {
        if phase == InitPhase::State {
            self.event = Some(InitEvent { mode, last: InitPhase::State });
            return Ok(());
        }

        let required = match phase {
            InitPhase::TimeDerivative => InitPhase::State,
            _ => InitPhase::TimeDerivative,
        };

        let event = match self.event.as_mut() {
            Some(event) => event,
            None => return Err(violation(format!("{phase:?} initialization without a preceding state phase"))),
        };
        if event.mode != mode {
            return Err(violation(format!(
                "{mode:?} {phase:?} initialization mixed into a {:?} initialization event",
                event.mode
            )));
        }
        // Sensitivity phases may repeat; they do not change the base point
        let ordered = event.last == required || (phase == InitPhase::Sensitivity && event.last == phase);
        if !ordered {
            return Err(violation(format!("{phase:?} initialization must follow {required:?}, last phase was {:?}", event.last)));
        }
        event.last = phase;
        Ok(())
    }
}

fn violation(reason: String) -> UnitError {
    tracing::error!(%reason, "initialization order violated");
    UnitError::Precondition(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_sequence() {
        let mut guard = InitGuard::new();
        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        guard.enter(InitPhase::TimeDerivative, InitMode::Full).unwrap();
        guard.enter(InitPhase::Sensitivity, InitMode::Full).unwrap();
        assert_eq!(guard.mode(), Some(InitMode::Full));
    }

    #[test]
    fn test_mixing_modes_rejected() {
        let mut guard = InitGuard::new();
        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        assert!(matches!(
            guard.enter(InitPhase::TimeDerivative, InitMode::Lean),
            Err(UnitError::Precondition(_))
        ));

        guard.enter(InitPhase::State, InitMode::Lean).unwrap();
        guard.enter(InitPhase::TimeDerivative, InitMode::Lean).unwrap();
        assert!(guard.enter(InitPhase::Sensitivity, InitMode::Full).is_err());
    }

    #[test]
    fn test_time_derivative_requires_state() {
        let mut guard = InitGuard::new();
        assert!(guard.enter(InitPhase::TimeDerivative, InitMode::Full).is_err());

        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        guard.reset();
        assert!(guard.enter(InitPhase::TimeDerivative, InitMode::Full).is_err());
    }

    #[test]
    fn test_sensitivity_requires_time_derivative() {
        let mut guard = InitGuard::new();
        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        assert!(guard.enter(InitPhase::Sensitivity, InitMode::Full).is_err());
    }

    #[test]
    fn test_repeated_state_opens_new_event() {
        let mut guard = InitGuard::new();
        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        guard.enter(InitPhase::State, InitMode::Full).unwrap();
        guard.enter(InitPhase::TimeDerivative, InitMode::Full).unwrap();
        guard.enter(InitPhase::Sensitivity, InitMode::Full).unwrap();
        guard.enter(InitPhase::Sensitivity, InitMode::Full).unwrap();
        assert!(guard.enter(InitPhase::TimeDerivative, InitMode::Full).is_err());
    }
}
