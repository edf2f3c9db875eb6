//! Registry of sensitive parameters owned by each unit operation.
//!
//! A sensitive parameter is a [`ParameterId`] mapped to an AD direction and a
//! seed value. During AD sweeps in [`ParamMode::Sensitive`](crate::ParamMode)
//! the parameter enters the residual with derivative `seed` in its direction,
//! so the residual's derivative in that direction is `∂F/∂p · seed`.
//!
//! Registering the same id twice keeps the first direction ("fused"
//! parameters share a direction through distinct ids registered with the
//! same direction).

use std::collections::BTreeMap;

use crate::autodiff::{Active, AdDirections, constant};
use crate::{ParameterId, UnitError, UnitResult};

/// AD direction and seed of one sensitive parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensParam {
    /// AD direction carrying `∂/∂p`
    pub direction: usize,
    /// Derivative seed
    pub seed: f64,
}

/// Per-unit map of sensitive parameters.
#[derive(Debug, Clone, Default)]
pub struct SensitivityRegistry {
    entries: BTreeMap<ParameterId, SensParam>,
}

impl SensitivityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensitive parameter.
    ///
    /// Returns `false` if the id was already registered; the existing
    /// direction is kept and only the seed is updated.
    pub fn insert(&mut self, id: ParameterId, direction: usize, seed: f64) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                if entry.direction != direction {
                    tracing::debug!(
                        ?id,
                        kept = entry.direction,
                        requested = direction,
                        "parameter already sensitive, keeping first direction"
                    );
                }
                entry.seed = seed;
                false
            }
            None => {
                self.entries.insert(id, SensParam { direction, seed });
                true
            }
        }
    }

    /// Gets the entry of a parameter.
    pub fn get(&self, id: &ParameterId) -> Option<&SensParam> {
        self.entries.get(id)
    }

    /// Returns true if the parameter is sensitive.
    pub fn contains(&self, id: &ParameterId) -> bool {
        self.entries.contains_key(id)
    }

    /// Direction of a parameter, if sensitive.
    pub fn direction_of(&self, id: &ParameterId) -> Option<usize> {
        self.entries.get(id).map(|e| e.direction)
    }

    /// Number of registered parameters.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no parameter is sensitive.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ParameterId, &SensParam)> {
        self.entries.iter()
    }

    /// Checks that every direction lies in the parameter part of `dirs`.
    pub fn validate(&self, dirs: &AdDirections) -> UnitResult {
        match self.entries.iter().find(|(_, e)| e.direction >= dirs.sens_offset()) {
            Some((id, e)) => Err(UnitError::Precondition(format!(
                "sensitive parameter {:?} uses direction {} but only {} sensitivity directions exist",
                id,
                e.direction,
                dirs.sens_offset()
            ))),
            None => Ok(()),
        }
    }

    /// Builds the active value of a parameter: seeded if sensitive, constant otherwise.
    pub fn active(&self, id: &ParameterId, value: f64, dirs: &AdDirections) -> Active {
        match self.entries.get(id) {
            Some(e) if e.direction < dirs.sens_offset() => dirs.seeded(value, e.direction, e.seed),
            _ => constant(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UnitOpId;

    fn id(comp: usize) -> ParameterId {
        ParameterId::new("CONST_COEFF", UnitOpId(0)).with_component(comp).with_section(0)
    }

    #[test]
    fn test_first_direction_wins() {
        let mut reg = SensitivityRegistry::new();
        assert!(reg.insert(id(0), 0, 1.0));
        assert!(!reg.insert(id(0), 3, 2.0));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.direction_of(&id(0)), Some(0));
        assert_eq!(reg.get(&id(0)).map(|e| e.seed), Some(2.0));
    }

    #[test]
    fn test_fused_ids_share_direction() {
        let mut reg = SensitivityRegistry::new();
        reg.insert(id(0), 1, 1.0);
        reg.insert(id(1), 1, 1.0);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.direction_of(&id(0)), reg.direction_of(&id(1)));
    }

    #[test]
    fn test_validate_direction_budget() {
        let mut reg = SensitivityRegistry::new();
        reg.insert(id(0), 1, 1.0);
        assert!(reg.validate(&AdDirections::for_system(2, 4)).is_ok());
        assert!(matches!(
            reg.validate(&AdDirections::for_system(1, 4)),
            Err(UnitError::Precondition(_))
        ));
    }

    #[test]
    fn test_active_value_seeding() {
        let mut reg = SensitivityRegistry::new();
        reg.insert(id(0), 1, 0.5);
        let dirs = AdDirections::for_system(2, 3);

        let p = reg.active(&id(0), 7.0, &dirs);
        assert_eq!(p.re, 7.0);
        assert_eq!(dirs.derivative(&p, 1), 0.5);
        assert_eq!(dirs.derivative(&p, 0), 0.0);

        let q = reg.active(&id(2), 3.0, &dirs);
        assert_eq!(dirs.derivative(&q, 1), 0.0);
    }

    #[test]
    fn test_clear() {
        let mut reg = SensitivityRegistry::new();
        reg.insert(id(0), 0, 1.0);
        reg.clear();
        assert!(reg.is_empty());
        assert!(!reg.contains(&id(0)));
    }
}
