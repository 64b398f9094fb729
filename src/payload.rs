//! Per-iteration payload exchanged between the coordinator and the workers.
//!
//! Order on the wire is fixed: flow table, liquid volumes, gas volumes, then
//! the neighbor table. The control signal precedes the payload.

use crate::error::TransportError;
use crate::transitioner::{HydroInputs, TransitionParams, TransitionPolicy};
use crate::transport::{Tag, Transport};
use bioreactor_common::{NeighborTable, RunParams, TransitionPolicyKind};
use serde::{Deserialize, Serialize};

/// Values every rank needs before the first iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInit {
    pub n_compartments: usize,
    pub n_neighbors: usize,
    pub delta_time: f64,
    pub n_flowmap: usize,
    pub n_per_flowmap: u64,
    pub n_timestep: u64,
    pub two_phase: bool,
    pub policy: TransitionPolicyKind,
    pub total_particles: u64,
    pub seed: u64,
}

impl RunInit {
    pub fn new(params: &RunParams, n_compartments: usize, n_neighbors: usize) -> Self {
        Self {
            n_compartments,
            n_neighbors,
            delta_time: params.delta_time,
            n_flowmap: params.n_flowmap,
            n_per_flowmap: params.n_per_flowmap,
            n_timestep: params.n_timestep,
            two_phase: params.two_phase,
            policy: params.policy,
            total_particles: params.total_particles,
            seed: params.seed,
        }
    }

    pub fn transition_params(&self) -> TransitionParams {
        TransitionParams {
            n_flowmap: self.n_flowmap,
            n_per_flowmap: self.n_per_flowmap,
            n_timestep: self.n_timestep,
            two_phase: self.two_phase,
            policy: TransitionPolicy::from(self.policy),
        }
    }
}

/// Sends the raw inputs of one iteration to `dest`.
pub fn send_iteration<T: Transport>(
    transport: &T,
    dest: usize,
    inputs: &HydroInputs<'_>,
) -> Result<(), TransportError> {
    transport.send(dest, Tag::Flow, inputs.liquid_flow)?;
    transport.send(dest, Tag::LiquidVolume, inputs.liquid_volume)?;
    transport.send(dest, Tag::GasVolume, inputs.gas_volume)?;
    transport.send(dest, Tag::Neighbor, inputs.neighbors.as_slice())
}

/// Owned copy of the inputs a worker received for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationPayload {
    pub liquid_flow: Vec<f64>,
    pub liquid_volume: Vec<f64>,
    pub gas_volume: Vec<f64>,
    pub neighbors: NeighborTable,
}

impl IterationPayload {
    /// Receives the four parts from `source` and checks them against the
    /// compartment count announced in `init`.
    pub fn recv<T: Transport>(
        transport: &T,
        source: usize,
        init: &RunInit,
    ) -> Result<Self, TransportError> {
        let n = init.n_compartments;
        let liquid_flow: Vec<f64> = transport.recv(source, Tag::Flow)?;
        check_len("liquid flow table", liquid_flow.len(), n * n)?;
        let liquid_volume: Vec<f64> = transport.recv(source, Tag::LiquidVolume)?;
        check_len("liquid volume vector", liquid_volume.len(), n)?;
        let gas_volume: Vec<f64> = transport.recv(source, Tag::GasVolume)?;
        check_len("gas volume vector", gas_volume.len(), n)?;
        let neighbor_data: Vec<usize> = transport.recv(source, Tag::Neighbor)?;
        let neighbors = NeighborTable::new(neighbor_data, n)?;
        neighbors.validate(n)?;
        Ok(Self { liquid_flow, liquid_volume, gas_volume, neighbors })
    }

    pub fn inputs(&self) -> HydroInputs<'_> {
        HydroInputs {
            liquid_flow: &self.liquid_flow,
            liquid_volume: &self.liquid_volume,
            gas_volume: &self.gas_volume,
            neighbors: &self.neighbors,
        }
    }
}

fn check_len(what: &'static str, len: usize, expected: usize) -> Result<(), TransportError> {
    if len != expected {
        return Err(TransportError::Truncated { what, len, expected });
    }
    Ok(())
}
