use crate::error::HydroError;
use crate::probability::CumulativeProbabilityTable;
use crate::transition::TransitionMatrix;
use bioreactor_common::NeighborTable;
use log::debug;

/// Everything the movement kernel needs from one flow snapshot, for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct HydroState {
    transition: TransitionMatrix,
    outflow: Vec<f64>,
    cumulative_probability: CumulativeProbabilityTable,
    volume: Vec<f64>,
    inverse_volume: Vec<f64>,
}

impl HydroState {
    /// Runs both builders over a raw flow table and attaches the volumes.
    pub fn compute(
        flows: &[f64],
        volume: &[f64],
        neighbors: &NeighborTable,
    ) -> Result<Self, HydroError> {
        let n = volume.len();
        check_shape("flow table", flows.len(), n * n)?;
        check_shape("neighbor table rows", neighbors.n_rows(), n)?;

        let transition = TransitionMatrix::build(flows, n);
        let cumulative_probability = CumulativeProbabilityTable::build(neighbors, &transition);
        Self::assemble(transition, cumulative_probability, volume)
    }

    /// State of a phase that exchanges nothing between compartments; only the
    /// volumes are meaningful.
    pub fn volumes_only(volume: &[f64], neighbors: &NeighborTable) -> Result<Self, HydroError> {
        let n = volume.len();
        check_shape("neighbor table rows", neighbors.n_rows(), n)?;
        let transition = TransitionMatrix::empty(n);
        let cumulative_probability = CumulativeProbabilityTable::build(neighbors, &transition);
        Self::assemble(transition, cumulative_probability, volume)
    }

    fn assemble(
        transition: TransitionMatrix,
        cumulative_probability: CumulativeProbabilityTable,
        volume: &[f64],
    ) -> Result<Self, HydroError> {
        let inverse_volume = inverse_volume(volume)?;
        Ok(Self {
            outflow: transition.outflow(),
            transition,
            cumulative_probability,
            volume: volume.to_vec(),
            inverse_volume,
        })
    }

    pub fn n_compartments(&self) -> usize {
        self.volume.len()
    }

    pub fn transition(&self) -> &TransitionMatrix {
        &self.transition
    }

    /// Total outflow rate per compartment (negated matrix diagonal).
    pub fn outflow(&self) -> &[f64] {
        &self.outflow
    }

    pub fn cumulative_probability(&self) -> &CumulativeProbabilityTable {
        &self.cumulative_probability
    }

    pub fn volume(&self) -> &[f64] {
        &self.volume
    }

    pub fn inverse_volume(&self) -> &[f64] {
        &self.inverse_volume
    }
}

fn check_shape(what: &'static str, len: usize, expected: usize) -> Result<(), HydroError> {
    if len != expected {
        return Err(HydroError::Shape { what, len, expected });
    }
    Ok(())
}

fn inverse_volume(volume: &[f64]) -> Result<Vec<f64>, HydroError> {
    volume
        .iter()
        .enumerate()
        .map(|(compartment, &v)| {
            if v == 0.0 {
                Err(HydroError::NullVolume { compartment })
            } else {
                Ok(1.0 / v)
            }
        })
        .collect()
}

/// Fixed set of hydro-state slots, one per flow map of the loop window.
///
/// A slot goes from empty to computed at most once; there is no way back
/// within a run.
#[derive(Debug)]
pub struct HydroStateCache {
    slots: Vec<Option<HydroState>>,
}

impl HydroStateCache {
    pub fn new(n_flowmap: usize) -> Self {
        Self { slots: (0..n_flowmap).map(|_| None).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_computed(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(Some(_)))
    }

    pub fn computed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, slot: usize) -> Option<&HydroState> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Returns the slot's state, computing it first if the slot is still empty.
    ///
    /// The state is fully built before it is stored, so a failing `compute`
    /// leaves the slot empty.
    pub fn get_or_try_compute<E, F>(&mut self, slot: usize, compute: F) -> Result<&HydroState, E>
    where
        F: FnOnce() -> Result<HydroState, E>,
    {
        let entry = &mut self.slots[slot];
        let state = match entry.take() {
            Some(state) => state,
            None => {
                debug!("Computing hydro state for slot {}", slot);
                compute()?
            }
        };
        Ok(&*entry.insert(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbors() -> NeighborTable {
        NeighborTable::from_rows(&[vec![1, 0], vec![0, 2], vec![1, 2]])
    }

    const FLOWS: [f64; 9] = [0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 1.0, 0.0];

    #[test]
    fn compute_bundles_all_artifacts() {
        let state = HydroState::compute(&FLOWS, &[1.0, 2.0, 4.0], &neighbors()).unwrap();
        assert_eq!(state.outflow(), &[2.0, 4.0, 1.0]);
        assert_eq!(state.cumulative_probability().row(0), &[1.0]);
        assert_eq!(state.inverse_volume(), &[1.0, 0.5, 0.25]);
        assert_eq!(state.n_compartments(), 3);
    }

    #[test]
    fn null_volume_is_rejected() {
        let err = HydroState::compute(&FLOWS, &[1.0, 0.0, 4.0], &neighbors()).unwrap_err();
        assert!(matches!(err, HydroError::NullVolume { compartment: 1 }));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let err = HydroState::compute(&FLOWS[..4], &[1.0, 1.0, 1.0], &neighbors()).unwrap_err();
        assert!(matches!(err, HydroError::Shape { expected: 9, .. }));
    }

    #[test]
    fn volumes_only_state_never_moves() {
        let state = HydroState::volumes_only(&[1.0, 1.0, 1.0], &neighbors()).unwrap();
        assert_eq!(state.outflow(), &[0.0, 0.0, 0.0]);
        assert_eq!(state.cumulative_probability().row(1), &[0.0, 0.0]);
    }

    #[test]
    fn cache_computes_each_slot_once() {
        let mut cache = HydroStateCache::new(2);
        let mut calls = 0;
        for _ in 0..3 {
            cache
                .get_or_try_compute(1, || {
                    calls += 1;
                    HydroState::compute(&FLOWS, &[1.0; 3], &neighbors())
                })
                .unwrap();
        }
        assert_eq!(calls, 1);
        assert!(cache.is_computed(1));
        assert!(!cache.is_computed(0));
        assert_eq!(cache.computed_count(), 1);
    }

    #[test]
    fn failed_compute_leaves_slot_empty() {
        let mut cache = HydroStateCache::new(1);
        let result =
            cache.get_or_try_compute(0, || HydroState::compute(&FLOWS, &[0.0; 3], &neighbors()));
        assert!(result.is_err());
        assert!(!cache.is_computed(0));
    }
}
