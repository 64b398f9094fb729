use serde::{Deserialize, Serialize};
use crate::config::TransitionPolicyKind;

/// Run parameters derived from the configuration, read by every rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    // Time
    pub delta_time: f64,
    pub final_time: f64,
    pub n_timestep: u64,

    // Flow-map window
    pub n_flowmap: usize,
    pub n_per_flowmap: u64,
    pub two_phase: bool,
    pub policy: TransitionPolicyKind,

    // Population
    pub total_particles: u64,
    pub ranks: u32,
    pub seed: u64,
}
