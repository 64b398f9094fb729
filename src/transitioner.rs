//! Maps the iteration counter onto cached hydro states.
//!
//! Snapshot `k` of the loop window is used for `n_per_flowmap` consecutive
//! iterations, then the window repeats. Hydro states are built only during the
//! first pass through the window; later passes reuse the cached slots.

use crate::error::TransitionError;
use crate::hydro::{HydroState, HydroStateCache};
use crate::source::FlowSnapshotSource;
use bioreactor_common::{FlowSnapshot, NeighborTable, RunParams, TransitionPolicyKind};
use log::{debug, info};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// Each snapshot is held constant over its window.
    Discontinuous,
    /// Flows and volumes are blended linearly between the current snapshot and
    /// the next one according to the position inside the window.
    Interpolated,
}

impl From<TransitionPolicyKind> for TransitionPolicy {
    fn from(kind: TransitionPolicyKind) -> Self {
        match kind {
            TransitionPolicyKind::Discontinuous => TransitionPolicy::Discontinuous,
            TransitionPolicyKind::Interpolated => TransitionPolicy::Interpolated,
        }
    }
}

impl fmt::Display for TransitionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionPolicy::Discontinuous => write!(f, "discontinuous"),
            TransitionPolicy::Interpolated => write!(f, "linear interpolation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionParams {
    pub n_flowmap: usize,
    pub n_per_flowmap: u64,
    pub n_timestep: u64,
    pub two_phase: bool,
    pub policy: TransitionPolicy,
}

impl TransitionParams {
    pub fn from_run_params(params: &RunParams) -> Self {
        Self {
            n_flowmap: params.n_flowmap,
            n_per_flowmap: params.n_per_flowmap,
            n_timestep: params.n_timestep,
            two_phase: params.two_phase,
            policy: params.policy.into(),
        }
    }

    fn validate(&self) -> Result<(), TransitionError> {
        if self.n_flowmap == 0 {
            return Err(TransitionError::InvalidArg { what: "n_flowmap must be at least 1" });
        }
        if self.n_per_flowmap == 0 {
            return Err(TransitionError::InvalidArg { what: "n_per_flowmap must be at least 1" });
        }
        Ok(())
    }

    /// Cache slot used at `iteration`.
    #[inline]
    pub fn select_slot(&self, iteration: u64) -> usize {
        ((iteration / self.n_per_flowmap) % self.n_flowmap as u64) as usize
    }

    /// Position of `iteration` inside its window, in `0..n_per_flowmap`.
    #[inline]
    pub fn window_position(&self, iteration: u64) -> u64 {
        iteration % self.n_per_flowmap
    }

    /// True while the loop window is traversed for the first time, the only
    /// period in which slots may be computed.
    #[inline]
    pub fn in_first_pass(&self, iteration: u64) -> bool {
        iteration < self.n_flowmap as u64 * self.n_per_flowmap
    }
}

/// Raw inputs behind the hydro state of one iteration, as they are sent to
/// worker ranks.
#[derive(Debug, Clone, Copy)]
pub struct HydroInputs<'a> {
    pub liquid_flow: &'a [f64],
    pub liquid_volume: &'a [f64],
    pub gas_volume: &'a [f64],
    pub neighbors: &'a NeighborTable,
}

/// What one simulation step receives.
#[derive(Debug, Clone, Copy)]
pub struct IterationState<'a> {
    pub iteration: u64,
    pub slot: usize,
    pub liquid: &'a HydroState,
    pub gas: Option<&'a HydroState>,
    pub neighbors: &'a NeighborTable,
    /// Raw inputs, only known on the rank that owns the snapshot source.
    pub inputs: Option<HydroInputs<'a>>,
}

#[derive(Debug, Default)]
struct BlendBuffers {
    liquid_flow: Vec<f64>,
    liquid_volume: Vec<f64>,
    gas_flow: Vec<f64>,
    gas_volume: Vec<f64>,
    liquid: Option<HydroState>,
    gas: Option<HydroState>,
}

pub struct FlowMapTransitioner {
    params: TransitionParams,
    source: Option<Box<dyn FlowSnapshotSource>>,
    /// Raw snapshot of each slot, read from the source on first use only.
    raw: Vec<Option<FlowSnapshot>>,
    liquid: HydroStateCache,
    gas: HydroStateCache,
    blend: BlendBuffers,
    iteration: u64,
    computations: usize,
}

impl FlowMapTransitioner {
    /// Transitioner of the rank that reads the snapshots.
    ///
    /// Fails if the source cannot hold the requested window or cannot supply
    /// its first snapshot: a run cannot start without an initial flow field.
    pub fn new(
        params: TransitionParams,
        source: Box<dyn FlowSnapshotSource>,
    ) -> Result<Self, TransitionError> {
        params.validate()?;
        let available = source.loop_size();
        if available < params.n_flowmap {
            return Err(TransitionError::NotEnoughSnapshots {
                n_flowmap: params.n_flowmap,
                available,
            });
        }
        let first = source.get(0).map_err(TransitionError::SourceUnavailable)?.clone();
        if params.two_phase && first.gas_flow().is_none() {
            return Err(TransitionError::MissingGasFlow { index: 0 });
        }
        info!(
            "FlowMapTransitioner: using {} transition over {} flow maps ({} iterations each)",
            params.policy, params.n_flowmap, params.n_per_flowmap
        );
        let mut transitioner = Self::with_source(params, Some(source));
        transitioner.raw[0] = Some(first);
        Ok(transitioner)
    }

    /// Transitioner of a worker rank, fed by received payloads.
    pub fn for_worker(params: TransitionParams) -> Result<Self, TransitionError> {
        params.validate()?;
        Ok(Self::with_source(params, None))
    }

    fn with_source(params: TransitionParams, source: Option<Box<dyn FlowSnapshotSource>>) -> Self {
        let gas_slots = if params.two_phase { params.n_flowmap } else { 0 };
        let raw_slots = if source.is_some() { params.n_flowmap } else { 0 };
        Self {
            params,
            source,
            raw: (0..raw_slots).map(|_| None).collect(),
            liquid: HydroStateCache::new(params.n_flowmap),
            gas: HydroStateCache::new(gas_slots),
            blend: BlendBuffers::default(),
            iteration: 0,
            computations: 0,
        }
    }

    pub fn params(&self) -> &TransitionParams {
        &self.params
    }

    /// Number of iterations already served.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn n_timestep(&self) -> u64 {
        self.params.n_timestep
    }

    pub fn is_finished(&self) -> bool {
        self.iteration >= self.params.n_timestep
    }

    pub fn is_two_phase_flow(&self) -> bool {
        self.params.two_phase
    }

    /// How many hydro states have been built from scratch so far.
    pub fn computations(&self) -> usize {
        self.computations
    }

    pub fn liquid_cache(&self) -> &HydroStateCache {
        &self.liquid
    }

    /// Raw snapshot of `slot`, if it has been read already. Slot 0 is read at
    /// construction.
    pub fn snapshot(&self, slot: usize) -> Option<&FlowSnapshot> {
        self.raw.get(slot).and_then(Option::as_ref)
    }

    /// Serves the hydro state of the current iteration, computing its slot on
    /// first use, then moves to the next iteration.
    ///
    /// Each snapshot is read from the source at most once per run; later
    /// iterations use the retained copy.
    pub fn advance(&mut self) -> Result<IterationState<'_>, TransitionError> {
        let iteration = self.start_iteration()?;
        let slot = self.params.select_slot(iteration);
        let position = self.params.window_position(iteration);
        let blended = self.params.policy == TransitionPolicy::Interpolated && position != 0;
        let next = (slot + 1) % self.params.n_flowmap;

        let source = self.source.as_deref().ok_or(TransitionError::NoSource)?;
        load_raw(&mut self.raw, source, slot)?;
        if blended {
            load_raw(&mut self.raw, source, next)?;
        }
        let current = raw_slot(&self.raw, slot)?;

        if self.params.in_first_pass(iteration) && !self.liquid.is_computed(slot) {
            self.computations += compute_slot(
                &mut self.liquid,
                &mut self.gas,
                slot,
                self.params.two_phase,
                || {
                    HydroState::compute(
                        current.liquid_flow(),
                        current.liquid_volume(),
                        current.neighbors(),
                    )
                },
                || match current.gas_flow() {
                    Some(gas_flow) => Ok(HydroState::compute(
                        gas_flow,
                        current.gas_volume(),
                        current.neighbors(),
                    )?),
                    None => Err(TransitionError::MissingGasFlow { index: slot }),
                },
            )?;
        }

        if blended {
            let t = position as f64 / self.params.n_per_flowmap as f64;
            let upcoming = raw_slot(&self.raw, next)?;
            self.blend.fill_from_snapshots(current, upcoming, t, self.params.two_phase, slot)?;
            self.computations += 1 + self.params.two_phase as usize;
        }

        self.iteration += 1;
        let this = &*self;
        let snapshot = raw_slot(&this.raw, slot)?;
        let inputs = if blended {
            HydroInputs {
                liquid_flow: &this.blend.liquid_flow,
                liquid_volume: &this.blend.liquid_volume,
                gas_volume: &this.blend.gas_volume,
                neighbors: snapshot.neighbors(),
            }
        } else {
            HydroInputs {
                liquid_flow: snapshot.liquid_flow(),
                liquid_volume: snapshot.liquid_volume(),
                gas_volume: snapshot.gas_volume(),
                neighbors: snapshot.neighbors(),
            }
        };
        let mut state = this.state(iteration, slot, blended, snapshot.neighbors())?;
        state.inputs = Some(inputs);
        Ok(state)
    }

    /// Worker-side counterpart of [`advance`](Self::advance): the raw inputs
    /// come from the coordinator and the hydro state is rebuilt locally.
    pub fn advance_with_inputs<'a>(
        &'a mut self,
        inputs: HydroInputs<'a>,
    ) -> Result<IterationState<'a>, TransitionError> {
        let iteration = self.start_iteration()?;
        let slot = self.params.select_slot(iteration);
        let position = self.params.window_position(iteration);
        let two_phase = self.params.two_phase;
        let blended = self.params.policy == TransitionPolicy::Interpolated && position != 0;

        if blended {
            let liquid =
                HydroState::compute(inputs.liquid_flow, inputs.liquid_volume, inputs.neighbors)?;
            self.blend.liquid = Some(liquid);
            if two_phase {
                let gas = HydroState::volumes_only(inputs.gas_volume, inputs.neighbors)?;
                self.blend.gas = Some(gas);
            }
            self.computations += 1 + two_phase as usize;
        } else if self.params.in_first_pass(iteration) && !self.liquid.is_computed(slot) {
            self.computations += compute_slot(
                &mut self.liquid,
                &mut self.gas,
                slot,
                two_phase,
                || HydroState::compute(inputs.liquid_flow, inputs.liquid_volume, inputs.neighbors),
                || Ok(HydroState::volumes_only(inputs.gas_volume, inputs.neighbors)?),
            )?;
        }

        self.iteration += 1;
        let this: &'a Self = self;
        this.state(iteration, slot, blended, inputs.neighbors)
    }

    fn start_iteration(&self) -> Result<u64, TransitionError> {
        if self.is_finished() {
            return Err(TransitionError::Exhausted { n_timestep: self.params.n_timestep });
        }
        Ok(self.iteration)
    }

    fn state<'a>(
        &'a self,
        iteration: u64,
        slot: usize,
        blended: bool,
        neighbors: &'a NeighborTable,
    ) -> Result<IterationState<'a>, TransitionError> {
        let (liquid, gas) = if blended {
            (self.blend.liquid.as_ref(), self.blend.gas.as_ref())
        } else {
            (self.liquid.get(slot), self.gas.get(slot))
        };
        let liquid = liquid.ok_or(TransitionError::SlotNotComputed { slot })?;
        let gas = match (self.params.two_phase, gas) {
            (false, _) => None,
            (true, Some(gas)) => Some(gas),
            (true, None) => return Err(TransitionError::SlotNotComputed { slot }),
        };
        Ok(IterationState { iteration, slot, liquid, gas, neighbors, inputs: None })
    }
}

/// Reads snapshot `index` into `raw` unless it is already there.
fn load_raw(
    raw: &mut [Option<FlowSnapshot>],
    source: &dyn FlowSnapshotSource,
    index: usize,
) -> Result<(), TransitionError> {
    if raw[index].is_none() {
        let snapshot =
            source.get(index).map_err(|source| TransitionError::Source { index, source })?;
        debug!("Snapshot {} read from source", index);
        raw[index] = Some(snapshot.clone());
    }
    Ok(())
}

fn raw_slot(raw: &[Option<FlowSnapshot>], slot: usize) -> Result<&FlowSnapshot, TransitionError> {
    raw[slot].as_ref().ok_or(TransitionError::SlotNotComputed { slot })
}

/// Fills `slot` of both caches. Returns the number of states built.
fn compute_slot<L, G>(
    liquid: &mut HydroStateCache,
    gas: &mut HydroStateCache,
    slot: usize,
    two_phase: bool,
    build_liquid: L,
    build_gas: G,
) -> Result<usize, TransitionError>
where
    L: FnOnce() -> Result<HydroState, crate::error::HydroError>,
    G: FnOnce() -> Result<HydroState, TransitionError>,
{
    let mut built = 0;
    if two_phase {
        gas.get_or_try_compute(slot, build_gas)?;
        built += 1;
    }
    liquid.get_or_try_compute(slot, build_liquid)?;
    built += 1;
    debug!("Hydro state slot {} computed ({} phase(s))", slot, built);
    Ok(built)
}

fn blend_into(out: &mut Vec<f64>, a: &[f64], b: &[f64], t: f64) {
    out.clear();
    out.extend(a.iter().zip(b).map(|(x, y)| (1.0 - t) * x + t * y));
}

impl BlendBuffers {
    fn fill_from_snapshots(
        &mut self,
        current: &FlowSnapshot,
        next: &FlowSnapshot,
        t: f64,
        two_phase: bool,
        slot: usize,
    ) -> Result<(), TransitionError> {
        blend_into(&mut self.liquid_flow, current.liquid_flow(), next.liquid_flow(), t);
        blend_into(&mut self.liquid_volume, current.liquid_volume(), next.liquid_volume(), t);
        blend_into(&mut self.gas_volume, current.gas_volume(), next.gas_volume(), t);
        let neighbors = current.neighbors();
        self.liquid =
            Some(HydroState::compute(&self.liquid_flow, &self.liquid_volume, neighbors)?);
        if two_phase {
            let (Some(a), Some(b)) = (current.gas_flow(), next.gas_flow()) else {
                return Err(TransitionError::MissingGasFlow { index: slot });
            };
            blend_into(&mut self.gas_flow, a, b, t);
            self.gas = Some(HydroState::compute(&self.gas_flow, &self.gas_volume, neighbors)?);
        }
        Ok(())
    }
}
