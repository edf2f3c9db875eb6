//! Solution recording.
//!
//! Units describe their layout once through
//! [`UnitOperation::report_solution_structure`](crate::UnitOperation::report_solution_structure)
//! and then hand out borrowed views of their state slice on every
//! [`report_solution`](crate::UnitOperation::report_solution) call. Units
//! without state report values computed for the reported time.

use std::collections::BTreeMap;

use crate::UnitOpId;

/// Order of the axes in a flattened state block, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOrdering {
    /// Component index
    Component,
    /// Axial discretization cell
    AxialCell,
    /// Radial discretization cell
    RadialCell,
    /// Bound state of a component
    BoundState,
}

/// Strided view of `len` values.
#[derive(Debug, Clone, Copy)]
pub struct StridedSlice<'a> {
    data: &'a [f64],
    stride: usize,
    len: usize,
}

impl<'a> StridedSlice<'a> {
    /// Views `len` values of `data` starting at index 0 with `stride`.
    pub fn new(data: &'a [f64], stride: usize, len: usize) -> Self {
        StridedSlice { data, stride: stride.max(1), len }
    }

    /// Contiguous view.
    pub fn contiguous(data: &'a [f64]) -> Self {
        Self::new(data, 1, data.len())
    }

    /// Number of viewed values.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distance between consecutive values in the underlying slice.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Gets the `i`-th value.
    pub fn get(&self, i: usize) -> Option<f64> {
        if i < self.len { self.data.get(i * self.stride).copied() } else { None }
    }

    /// Copies the values into a vector.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.len).filter_map(|i| self.get(i)).collect()
    }
}

/// Borrowed snapshot of one unit's solution.
#[derive(Debug, Clone, Copy)]
pub struct SolutionView<'a> {
    /// Reporting unit
    pub unit: UnitOpId,
    /// Model name, e.g. `"CSTR"`
    pub unit_name: &'static str,
    /// Number of components
    pub n_comp: usize,
    /// Total number of bound states over all components
    pub n_bound: usize,
    /// Bulk (mobile phase) block
    pub bulk: &'a [f64],
    /// Axis order of `bulk`
    pub bulk_ordering: &'a [StateOrdering],
    /// Bound (stationary phase) block
    pub solid: &'a [f64],
    /// Axis order of `solid`
    pub solid_ordering: &'a [StateOrdering],
    /// Concentrations at the unit inlet
    pub inlet: Option<StridedSlice<'a>>,
    /// Concentrations at the unit outlet
    pub outlet: Option<StridedSlice<'a>>,
}

/// Sink for unit solutions.
pub trait SolutionRecorder {
    /// Starts a new output time point.
    fn begin_timestep(&mut self, t: f64);

    /// Receives a unit's layout, once per run.
    fn record_structure(&mut self, view: &SolutionView<'_>);

    /// Receives a unit's solution at the current time point.
    fn record_solution(&mut self, view: &SolutionView<'_>);

    /// Finishes the current time point.
    fn end_timestep(&mut self) {}
}

/// Layout information captured from [`SolutionRecorder::record_structure`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnitStructure {
    pub name: &'static str,
    pub n_comp: usize,
    pub n_bound: usize,
    pub bulk_ordering: Vec<StateOrdering>,
    pub solid_ordering: Vec<StateOrdering>,
    pub has_inlet: bool,
    pub has_outlet: bool,
}

/// Recorded time series of one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitSeries {
    pub bulk: Vec<Vec<f64>>,
    pub solid: Vec<Vec<f64>>,
    pub inlet: Vec<Vec<f64>>,
    pub outlet: Vec<Vec<f64>>,
}

/// Recorder keeping everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    times: Vec<f64>,
    structures: BTreeMap<UnitOpId, UnitStructure>,
    series: BTreeMap<UnitOpId, UnitSeries>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded time points.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Layout of a unit.
    pub fn structure(&self, unit: UnitOpId) -> Option<&UnitStructure> {
        self.structures.get(&unit)
    }

    /// Time series of a unit.
    pub fn series(&self, unit: UnitOpId) -> Option<&UnitSeries> {
        self.series.get(&unit)
    }

    /// Outlet concentrations of a unit, one row per time point.
    pub fn outlet(&self, unit: UnitOpId) -> &[Vec<f64>] {
        self.series.get(&unit).map(|s| s.outlet.as_slice()).unwrap_or(&[])
    }
}

impl SolutionRecorder for MemoryRecorder {
    fn begin_timestep(&mut self, t: f64) {
        self.times.push(t);
    }

    fn record_structure(&mut self, view: &SolutionView<'_>) {
        self.structures.insert(
            view.unit,
            UnitStructure {
                name: view.unit_name,
                n_comp: view.n_comp,
                n_bound: view.n_bound,
                bulk_ordering: view.bulk_ordering.to_vec(),
                solid_ordering: view.solid_ordering.to_vec(),
                has_inlet: view.inlet.is_some(),
                has_outlet: view.outlet.is_some(),
            },
        );
    }

    fn record_solution(&mut self, view: &SolutionView<'_>) {
        let series = self.series.entry(view.unit).or_default();
        series.bulk.push(view.bulk.to_vec());
        series.solid.push(view.solid.to_vec());
        if let Some(inlet) = view.inlet {
            series.inlet.push(inlet.to_vec());
        }
        if let Some(outlet) = view.outlet {
            series.outlet.push(outlet.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_slice() {
        let data = [1.0, 10.0, 2.0, 20.0, 3.0];
        let s = StridedSlice::new(&data, 2, 3);
        assert_eq!(s.to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(s.get(3), None);
        assert_eq!(StridedSlice::contiguous(&data[1..3]).to_vec(), vec![10.0, 2.0]);
    }

    #[test]
    fn test_memory_recorder() {
        let bulk = [1.0, 2.0];
        let view = SolutionView {
            unit: UnitOpId(3),
            unit_name: "CSTR",
            n_comp: 2,
            n_bound: 0,
            bulk: &bulk,
            bulk_ordering: &[StateOrdering::Component],
            solid: &[],
            solid_ordering: &[],
            inlet: None,
            outlet: Some(StridedSlice::contiguous(&bulk)),
        };

        let mut recorder = MemoryRecorder::new();
        recorder.record_structure(&view);
        recorder.begin_timestep(0.0);
        recorder.record_solution(&view);
        recorder.end_timestep();

        let structure = recorder.structure(UnitOpId(3)).unwrap();
        assert_eq!(structure.name, "CSTR");
        assert!(structure.has_outlet);
        assert!(!structure.has_inlet);
        assert_eq!(recorder.times(), &[0.0]);
        assert_eq!(recorder.outlet(UnitOpId(3)), &[vec![1.0, 2.0]]);
        assert!(recorder.outlet(UnitOpId(0)).is_empty());
    }
}
