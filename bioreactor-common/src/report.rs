use serde::{Serialize, Deserialize};

/// Lightweight statistics one rank reports about its particle shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardStatistics {
    pub rank: u32,
    /// Particles simulated by this rank.
    pub n_particles: u64,
    /// Number of compartment changes since the start of the run.
    pub n_moves: u64,
    /// Particle count per compartment.
    pub compartment_counts: Vec<u64>,
}

/// Merged view of every shard at the end of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub n_iterations: u64,
    pub total_particles: u64,
    pub total_moves: u64,
    pub compartment_counts: Vec<u64>,
    pub shards: Vec<ShardStatistics>,
}

impl RunReport {
    /// Merges per-rank statistics; shards are kept in rank order.
    pub fn merge(n_iterations: u64, mut shards: Vec<ShardStatistics>) -> Self {
        shards.sort_by_key(|s| s.rank);
        let n_compartments = shards.iter().map(|s| s.compartment_counts.len()).max().unwrap_or(0);
        let mut compartment_counts = vec![0; n_compartments];
        for shard in &shards {
            for (total, count) in compartment_counts.iter_mut().zip(&shard.compartment_counts) {
                *total += count;
            }
        }
        RunReport {
            n_iterations,
            total_particles: shards.iter().map(|s| s.n_particles).sum(),
            total_moves: shards.iter().map(|s| s.n_moves).sum(),
            compartment_counts,
            shards,
        }
    }
}
