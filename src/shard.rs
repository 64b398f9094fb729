use crate::hydro::HydroState;
use crate::transitioner::IterationState;
use bioreactor_common::{NeighborTable, ShardStatistics};
use log::trace;
use rand::prelude::*;
use rayon::prelude::*;

/// Simulation step run by every rank on its own particles once per iteration.
pub trait ShardStep: Send {
    fn step(&mut self, state: &IterationState<'_>, delta_time: f64);

    fn statistics(&self) -> ShardStatistics;
}

/// Reference movement kernel: particles only carry the compartment they sit
/// in and are carried around by the liquid flow.
#[derive(Debug, Clone)]
pub struct ParticleShard {
    rank: u32,
    n_compartments: usize,
    compartments: Vec<usize>,
    n_moves: u64,
    seed: u64,
    step_count: u64,
}

impl ParticleShard {
    /// Spreads `n_particles` uniformly at random over the compartments.
    pub fn new(rank: u32, n_particles: u64, n_compartments: usize, seed: u64) -> Self {
        let rank_seed = seed.wrapping_add((rank as u64).wrapping_mul(0x9E37_79B9));
        let mut rng = StdRng::seed_from_u64(rank_seed);
        let compartments = if n_compartments == 0 {
            Vec::new()
        } else {
            (0..n_particles).map(|_| rng.random_range(0..n_compartments)).collect()
        };
        Self::from_compartments(rank, compartments, n_compartments, seed)
    }

    pub fn from_compartments(
        rank: u32,
        compartments: Vec<usize>,
        n_compartments: usize,
        seed: u64,
    ) -> Self {
        Self { rank, n_compartments, compartments, n_moves: 0, seed, step_count: 0 }
    }

    pub fn compartments(&self) -> &[usize] {
        &self.compartments
    }

    pub fn n_particles(&self) -> usize {
        self.compartments.len()
    }
}

impl ShardStep for ParticleShard {
    fn step(&mut self, state: &IterationState<'_>, delta_time: f64) {
        let liquid = state.liquid;
        let neighbors = state.neighbors;
        let rank_seed = self.seed.wrapping_add((self.rank as u64).wrapping_mul(0x9E37_79B9));
        let time_step = self.step_count;

        let moves: u64 = self
            .compartments
            .par_iter_mut()
            .enumerate()
            .map(|(idx, compartment)| {
                let particle_seed = rank_seed
                    .wrapping_add((idx as u64).wrapping_mul(0x1F3A))
                    .wrapping_add(time_step.wrapping_mul(0x58C7));
                let mut rng = StdRng::seed_from_u64(particle_seed);
                match find_next_compartment(liquid, neighbors, *compartment, delta_time, &mut rng) {
                    Some(next) => {
                        *compartment = next;
                        1
                    }
                    None => 0,
                }
            })
            .sum();

        self.n_moves += moves;
        self.step_count += 1;
        trace!("rank {}: iteration {} moved {} particles", self.rank, state.iteration, moves);
    }

    fn statistics(&self) -> ShardStatistics {
        let mut compartment_counts = vec![0u64; self.n_compartments];
        for &c in &self.compartments {
            compartment_counts[c] += 1;
        }
        ShardStatistics {
            rank: self.rank,
            n_particles: self.compartments.len() as u64,
            n_moves: self.n_moves,
            compartment_counts,
        }
    }
}

/// Destination of a particle sitting in `current`, or `None` if it stays.
///
/// The particle leaves when `dt * outflow / volume` beats a uniform draw; the
/// destination is the first neighbor whose cumulative probability exceeds a
/// second draw.
pub fn find_next_compartment<R: Rng>(
    state: &HydroState,
    neighbors: &NeighborTable,
    current: usize,
    delta_time: f64,
    rng: &mut R,
) -> Option<usize> {
    let leave = delta_time * state.outflow()[current] * state.inverse_volume()[current];
    if !(leave > rng.random::<f64>()) {
        return None;
    }
    let cumulative = state.cumulative_probability().row(current);
    let candidates = &neighbors.row(current)[..cumulative.len()];
    let draw = rng.random::<f64>();
    let next = cumulative
        .iter()
        .position(|&p| p > draw)
        .map(|k| candidates[k])
        // Rounding can leave the last entry just below 1.
        .or_else(|| candidates.last().copied())?;
    (next != current).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> (HydroState, NeighborTable) {
        let neighbors = NeighborTable::from_rows(&[vec![1, 0], vec![0, 2], vec![1, 2]]);
        let flows = [0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 1.0, 0.0];
        (HydroState::compute(&flows, &[1.0, 1.0, 1.0], &neighbors).unwrap(), neighbors)
    }

    fn iteration<'a>(liquid: &'a HydroState, neighbors: &'a NeighborTable) -> IterationState<'a> {
        IterationState { iteration: 0, slot: 0, liquid, gas: None, neighbors, inputs: None }
    }

    #[test]
    fn long_step_empties_compartment_zero_into_one() {
        let (liquid, neighbors) = scenario();
        let mut shard = ParticleShard::from_compartments(0, vec![0; 100], 3, 1);
        shard.step(&iteration(&liquid, &neighbors), 10.0);
        assert!(shard.compartments().iter().all(|&c| c == 1));
        assert_eq!(shard.statistics().n_moves, 100);
        assert_eq!(shard.statistics().compartment_counts, vec![0, 100, 0]);
    }

    #[test]
    fn zero_time_step_moves_nothing() {
        let (liquid, neighbors) = scenario();
        let mut shard = ParticleShard::new(1, 500, 3, 9);
        let before = shard.compartments().to_vec();
        shard.step(&iteration(&liquid, &neighbors), 0.0);
        assert_eq!(shard.compartments(), &before[..]);
        assert_eq!(shard.statistics().n_moves, 0);
    }

    #[test]
    fn particles_without_outflow_stay() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let liquid = HydroState::compute(&[0.0; 4], &[1.0, 1.0], &neighbors).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(find_next_compartment(&liquid, &neighbors, 0, 1e6, &mut rng), None);
        }
    }

    #[test]
    fn split_follows_cumulative_probability() {
        // Compartment 1 sends 1/4 of its outflow to 0 and 3/4 to 2.
        let (liquid, neighbors) = scenario();
        let mut rng = StdRng::seed_from_u64(11);
        let to_two = (0..10_000)
            .filter(|_| find_next_compartment(&liquid, &neighbors, 1, 10.0, &mut rng) == Some(2))
            .count();
        assert!((7_000..8_000).contains(&to_two), "{}", to_two);
    }

    #[test]
    fn same_seed_same_trajectory() {
        let (liquid, neighbors) = scenario();
        let state = iteration(&liquid, &neighbors);
        let mut a = ParticleShard::new(2, 1_000, 3, 42);
        let mut b = ParticleShard::new(2, 1_000, 3, 42);
        for _ in 0..5 {
            a.step(&state, 0.2);
            b.step(&state, 0.2);
        }
        assert_eq!(a.statistics(), b.statistics());
        assert_eq!(a.statistics().compartment_counts.iter().sum::<u64>(), 1_000);
    }
}
