use crate::error::SourceError;
use bioreactor_common::{FlowSnapshot, NeighborTable, SourceConfig};
use log::{debug, info};
use rand::prelude::*;

/// Supplier of raw flow snapshots, indexed `0..loop_size()`.
pub trait FlowSnapshotSource: Send {
    fn get(&self, index: usize) -> Result<&FlowSnapshot, SourceError>;

    /// Number of distinct snapshots in the loop window.
    fn loop_size(&self) -> usize;

    /// Shortest liquid residence time `volume / outflow` over every snapshot
    /// and compartment. Compartments without outflow are ignored.
    fn min_residence_time(&self) -> f64 {
        let mut min_time = f64::INFINITY;
        for index in 0..self.loop_size() {
            let Ok(snapshot) = self.get(index) else { continue };
            let n = snapshot.n_compartments();
            for i in 0..n {
                let outflow: f64 = (0..n).filter(|&j| j != i).map(|j| snapshot.flow(i, j)).sum();
                if outflow > 0.0 {
                    min_time = min_time.min(snapshot.liquid_volume()[i] / outflow);
                }
            }
        }
        min_time
    }
}

/// Snapshots already held in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    snapshots: Vec<FlowSnapshot>,
}

impl InMemorySource {
    pub fn new(snapshots: Vec<FlowSnapshot>) -> Result<Self, SourceError> {
        if snapshots.is_empty() {
            return Err(SourceError::Empty);
        }
        Ok(Self { snapshots })
    }
}

impl FlowSnapshotSource for InMemorySource {
    fn get(&self, index: usize) -> Result<&FlowSnapshot, SourceError> {
        self.snapshots
            .get(index)
            .ok_or(SourceError::IndexOob { index, len: self.snapshots.len() })
    }

    fn loop_size(&self) -> usize {
        self.snapshots.len()
    }
}

/// Seeded generator of mass-conserving flow fields.
///
/// Each compartment pushes a circulation flow to the next one on a ring, and
/// random pairs of compartments exchange equal flows in both directions, so
/// inflow matches outflow everywhere. Topology is shared by all snapshots;
/// flow magnitudes and volumes vary from one snapshot to the next.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    inner: InMemorySource,
}

impl SyntheticSource {
    pub fn generate(config: &SourceConfig, two_phase: bool) -> Result<Self, SourceError> {
        let n = config.n_compartments;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let adjacency = build_adjacency(n, config.max_neighbors.max(2), &mut rng);
        let neighbors = NeighborTable::from_rows(&adjacency);
        debug!(
            "Synthetic topology: {} compartments, {} neighbor slots per row",
            n,
            neighbors.n_cols()
        );

        let base_volume: Vec<f64> =
            (0..n).map(|_| config.mean_volume * rng.random_range(0.5..1.5)).collect();

        let mut snapshots = Vec::with_capacity(config.n_flowmap);
        for _ in 0..config.n_flowmap {
            let ring_flow = config.mean_flow * rng.random_range(0.5..1.5);
            let mut liquid_flow = vec![0.0; n * n];
            for i in 0..n {
                let next = (i + 1) % n;
                if next != i {
                    liquid_flow[i * n + next] += ring_flow;
                }
                for &j in &adjacency[i] {
                    if j > i && j != next && (j + 1) % n != i {
                        let exchange = config.mean_flow * rng.random_range(0.0..1.0);
                        liquid_flow[i * n + j] += exchange;
                        liquid_flow[j * n + i] += exchange;
                    }
                }
            }
            let liquid_volume: Vec<f64> =
                base_volume.iter().map(|v| v * rng.random_range(0.95..1.05)).collect();

            let mut snapshot =
                FlowSnapshot::new(liquid_flow.clone(), liquid_volume.clone(), neighbors.clone())?;
            if two_phase {
                let gas_flow = liquid_flow.iter().map(|q| 0.1 * q).collect();
                let gas_volume = liquid_volume.iter().map(|v| 0.1 * v).collect();
                snapshot = snapshot.with_gas(gas_flow, gas_volume)?;
            }
            snapshots.push(snapshot);
        }

        info!("Generated {} synthetic flow snapshots over {} compartments", snapshots.len(), n);
        Ok(Self { inner: InMemorySource::new(snapshots)? })
    }
}

impl FlowSnapshotSource for SyntheticSource {
    fn get(&self, index: usize) -> Result<&FlowSnapshot, SourceError> {
        self.inner.get(index)
    }

    fn loop_size(&self) -> usize {
        self.inner.loop_size()
    }
}

/// Ring neighbors first, then random extra partners, each row capped at
/// `max_neighbors` entries. Adjacency is symmetric.
fn build_adjacency(n: usize, max_neighbors: usize, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    if n < 2 {
        return adjacency;
    }
    let link = |adjacency: &mut Vec<Vec<usize>>, a: usize, b: usize| {
        if a != b && !adjacency[a].contains(&b) {
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
    };
    for i in 0..n {
        link(&mut adjacency, i, (i + 1) % n);
    }
    for i in 0..n {
        for _ in 0..max_neighbors {
            let j = rng.random_range(0..n);
            if adjacency[i].len() < max_neighbors && adjacency[j].len() < max_neighbors {
                link(&mut adjacency, i, j);
            }
        }
    }
    adjacency
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config(n_compartments: usize) -> SourceConfig {
        SourceConfig {
            n_compartments,
            n_flowmap: 3,
            max_neighbors: 4,
            seed: 7,
            mean_flow: 2.0,
            mean_volume: 10.0,
        }
    }

    #[test]
    fn synthetic_flows_conserve_volume() {
        let source = SyntheticSource::generate(&config(12), false).unwrap();
        assert_eq!(source.loop_size(), 3);
        for index in 0..3 {
            let snapshot = source.get(index).unwrap();
            let n = snapshot.n_compartments();
            for i in 0..n {
                let outflow: f64 = (0..n).map(|j| snapshot.flow(i, j)).sum();
                let inflow: f64 = (0..n).map(|j| snapshot.flow(j, i)).sum();
                assert_abs_diff_eq!(outflow, inflow, epsilon = 1e-9);
                assert!(outflow > 0.0);
                // Every compartment receiving flow is listed as a neighbor.
                for j in (0..n).filter(|&j| snapshot.flow(i, j) > 0.0) {
                    assert!(snapshot.neighbors().row(i).contains(&j));
                }
            }
        }
    }

    #[test]
    fn same_seed_same_field() {
        let a = SyntheticSource::generate(&config(8), true).unwrap();
        let b = SyntheticSource::generate(&config(8), true).unwrap();
        assert_eq!(a.get(2).unwrap(), b.get(2).unwrap());
        assert!(a.get(0).unwrap().gas_flow().is_some());
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let source = SyntheticSource::generate(&config(4), false).unwrap();
        assert!(matches!(source.get(3), Err(SourceError::IndexOob { index: 3, len: 3 })));
    }

    #[test]
    fn min_residence_time_uses_smallest_ratio() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let a =
            FlowSnapshot::new(vec![0.0, 2.0, 2.0, 0.0], vec![4.0, 1.0], neighbors.clone()).unwrap();
        let b = FlowSnapshot::new(vec![0.0, 0.0, 0.0, 0.0], vec![4.0, 1.0], neighbors).unwrap();
        let source = InMemorySource::new(vec![a, b]).unwrap();
        assert_abs_diff_eq!(source.min_residence_time(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(matches!(InMemorySource::new(Vec::new()), Err(SourceError::Empty)));
    }
}
