//! Drives one run across a process group.
//!
//! The coordinator (rank 0) owns the snapshot source and the only full
//! transitioner. Every iteration it sends each worker a control signal and the
//! raw hydro inputs; workers rebuild the hydro state locally and step their
//! own particles.

use crate::load_balance::LoadBalancer;
use crate::payload::{send_iteration, IterationPayload, RunInit};
use crate::shard::{ParticleShard, ShardStep};
use crate::source::FlowSnapshotSource;
use crate::transitioner::{FlowMapTransitioner, TransitionParams};
use crate::transport::{ProcessGroup, Signal, Tag, Transport};
use anyhow::{Context, Result};
use bioreactor_common::{RunParams, RunReport};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Requests checked by the coordinator once per iteration.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    checkpoint: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks every rank to report its statistics at the next iteration.
    pub fn request_checkpoint(&self) {
        self.checkpoint.store(true, Ordering::SeqCst);
    }

    /// Ends the run early; the group still stops cleanly.
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    fn take_checkpoint(&self) -> bool {
        self.checkpoint.swap(false, Ordering::SeqCst)
    }

    fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }
}

/// Final report plus every statistics dump taken during the run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: RunReport,
    pub checkpoints: Vec<RunReport>,
}

/// Builds the default movement shard of a rank.
pub fn particle_shard(rank: u32, n_particles: u64, init: &RunInit) -> ParticleShard {
    ParticleShard::new(rank, n_particles, init.n_compartments, init.seed)
}

fn rank_share(
    transport: &impl Transport,
    balancer: &LoadBalancer,
    init: &RunInit,
) -> Result<(u32, u64)> {
    let rank = transport.rank() as u32;
    let share = balancer
        .balance(rank, init.total_particles)
        .with_context(|| format!("rank {} could not compute its particle share", rank))?;
    debug!("rank {}: simulating {} of {} particles", rank, share, init.total_particles);
    Ok((rank, share))
}

pub fn coordinator_process<T, S, F>(
    transport: &T,
    params: &RunParams,
    balancer: &LoadBalancer,
    source: Box<dyn FlowSnapshotSource>,
    control: &RunControl,
    make_shard: F,
) -> Result<RunOutcome>
where
    T: Transport,
    S: ShardStep,
    F: Fn(u32, u64, &RunInit) -> S,
{
    let transition_params = TransitionParams::from_run_params(params);
    let mut transitioner = FlowMapTransitioner::new(transition_params, source)
        .context("Failed to initialise the flow-map transitioner")?;
    let first = transitioner
        .snapshot(0)
        .context("coordinator transitioner holds no initial snapshot")?;
    let init = RunInit::new(params, first.n_compartments(), first.neighbors().n_cols());
    transport.broadcast(Tag::Init, Some(init.clone()))?;
    info!(
        "Run initialised: {} compartments, {} iterations, {} ranks",
        init.n_compartments,
        init.n_timestep,
        transport.size()
    );
    balancer.allocations(init.total_particles)?;

    let (rank, share) = rank_share(transport, balancer, &init)?;
    let mut shard = make_shard(rank, share, &init);
    let mut checkpoints = Vec::new();

    let start_time = Instant::now();
    let progress_interval = (init.n_timestep / 10).max(1);
    while !transitioner.is_finished() {
        if control.is_interrupted() {
            warn!("Run interrupted at iteration {}", transitioner.iteration());
            break;
        }
        if control.take_checkpoint() {
            for peer in 1..transport.size() {
                transport.send(peer, Tag::Signal, &Signal::Dump)?;
            }
            let shards = transport.gather(Tag::Statistics, shard.statistics())?.unwrap_or_default();
            info!("Statistics dumped at iteration {}", transitioner.iteration());
            checkpoints.push(RunReport::merge(transitioner.iteration(), shards));
        }

        let state = transitioner.advance()?;
        let inputs = state.inputs.context("coordinator iteration carries no raw inputs")?;
        for peer in 1..transport.size() {
            transport.send(peer, Tag::Signal, &Signal::Run)?;
            send_iteration(transport, peer, &inputs)?;
        }
        shard.step(&state, init.delta_time);

        let done = state.iteration + 1;
        if done % progress_interval == 0 || done == init.n_timestep {
            info!(
                "Iteration {}/{} ({:.1}%), elapsed {:.2?}",
                done,
                init.n_timestep,
                100.0 * done as f64 / init.n_timestep as f64,
                start_time.elapsed()
            );
        }
    }

    for peer in 1..transport.size() {
        transport.send(peer, Tag::Signal, &Signal::Stop)?;
    }
    transport.barrier()?;
    let shards = transport.gather(Tag::Statistics, shard.statistics())?.unwrap_or_default();
    let report = RunReport::merge(transitioner.iteration(), shards);
    info!(
        "Run finished after {} iterations: {} particles, {} moves",
        report.n_iterations, report.total_particles, report.total_moves
    );
    Ok(RunOutcome { report, checkpoints })
}

pub fn worker_process<T, S, F>(transport: &T, balancer: &LoadBalancer, make_shard: F) -> Result<()>
where
    T: Transport,
    S: ShardStep,
    F: Fn(u32, u64, &RunInit) -> S,
{
    let init: RunInit = transport.broadcast(Tag::Init, None)?;
    let mut transitioner = FlowMapTransitioner::for_worker(init.transition_params())?;
    let (rank, share) = rank_share(transport, balancer, &init)?;
    let mut shard = make_shard(rank, share, &init);

    loop {
        match transport.recv::<Signal>(0, Tag::Signal)? {
            Signal::Stop => {
                transport.barrier()?;
                transport.gather(Tag::Statistics, shard.statistics())?;
                debug!("rank {}: stopped after {} iterations", rank, transitioner.iteration());
                return Ok(());
            }
            Signal::Dump => {
                transport.gather(Tag::Statistics, shard.statistics())?;
            }
            Signal::Nop => {}
            Signal::Run => {
                let payload = IterationPayload::recv(transport, 0, &init)?;
                let state = transitioner.advance_with_inputs(payload.inputs())?;
                shard.step(&state, init.delta_time);
            }
        }
    }
}

/// Runs a whole group of `params.ranks` in-process ranks with the default
/// particle shard.
pub fn run_group(
    params: &RunParams,
    balancer: &LoadBalancer,
    source: Box<dyn FlowSnapshotSource>,
    control: &RunControl,
) -> Result<RunOutcome> {
    if balancer.rank_count() != params.ranks {
        anyhow::bail!(
            "load balancer covers {} ranks but the run uses {}",
            balancer.rank_count(),
            params.ranks
        );
    }
    if !balancer.check(params.total_particles) {
        anyhow::bail!("load balancer ratios do not sum to one");
    }

    let source = Mutex::new(Some(source));
    let outcomes = ProcessGroup::new(params.ranks as usize).run(|transport| {
        if transport.is_root() {
            let source = source
                .lock()
                .map_err(|_| anyhow::anyhow!("snapshot source lock poisoned"))?
                .take()
                .context("snapshot source already taken")?;
            coordinator_process(transport, params, balancer, source, control, particle_shard)
                .map(Some)
        } else {
            worker_process(transport, balancer, particle_shard)?;
            Ok(None)
        }
    })?;
    outcomes.into_iter().flatten().next().context("coordinator produced no report")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransitionError;
    use crate::source::{InMemorySource, SyntheticSource};
    use crate::transitioner::HydroInputs;
    use bioreactor_common::{
        FlowSnapshot, NeighborTable, ShardStatistics, SourceConfig, TransitionPolicyKind,
    };

    fn source_config(n_flowmap: usize) -> SourceConfig {
        SourceConfig {
            n_compartments: 8,
            n_flowmap,
            max_neighbors: 4,
            seed: 5,
            mean_flow: 1e-3,
            mean_volume: 1e-2,
        }
    }

    fn params(ranks: u32, two_phase: bool, policy: TransitionPolicyKind) -> RunParams {
        RunParams {
            delta_time: 0.5,
            final_time: 7.5,
            n_timestep: 15,
            n_flowmap: 3,
            n_per_flowmap: 2,
            two_phase,
            policy,
            total_particles: 1_000,
            ranks,
            seed: 17,
        }
    }

    fn synthetic(two_phase: bool) -> Box<dyn FlowSnapshotSource> {
        Box::new(SyntheticSource::generate(&source_config(3), two_phase).unwrap())
    }

    #[test]
    fn group_run_conserves_particles() {
        let params = params(4, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::host_weighted(4, 2.0).unwrap();
        let outcome = run_group(&params, &balancer, synthetic(false), &RunControl::new()).unwrap();

        let report = outcome.report;
        assert_eq!(report.n_iterations, 15);
        assert_eq!(report.total_particles, 1_000);
        assert_eq!(report.compartment_counts.iter().sum::<u64>(), 1_000);
        assert_eq!(report.shards.len(), 4);
        assert_eq!(report.shards[0].n_particles, 400);
        assert!(report.total_moves > 0);
        assert!(outcome.checkpoints.is_empty());
    }

    #[test]
    fn two_phase_interpolated_run_completes() {
        let params = params(3, true, TransitionPolicyKind::Interpolated);
        let balancer = LoadBalancer::uniform(3).unwrap();
        let outcome = run_group(&params, &balancer, synthetic(true), &RunControl::new()).unwrap();
        assert_eq!(outcome.report.n_iterations, 15);
        assert_eq!(outcome.report.total_particles, 1_000);
    }

    #[test]
    fn single_rank_runs_are_reproducible() {
        let params = params(1, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(1).unwrap();
        let a = run_group(&params, &balancer, synthetic(false), &RunControl::new()).unwrap();
        let b = run_group(&params, &balancer, synthetic(false), &RunControl::new()).unwrap();
        assert_eq!(a.report.shards, b.report.shards);
    }

    #[test]
    fn interrupt_stops_before_the_first_iteration() {
        let control = RunControl::new();
        control.request_interrupt();
        let params = params(2, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(2).unwrap();
        let outcome = run_group(&params, &balancer, synthetic(false), &control).unwrap();
        assert_eq!(outcome.report.n_iterations, 0);
        assert_eq!(outcome.report.total_moves, 0);
        assert_eq!(outcome.report.total_particles, 1_000);
    }

    #[test]
    fn checkpoint_dumps_every_shard() {
        let control = RunControl::new();
        control.request_checkpoint();
        let params = params(3, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(3).unwrap();
        let outcome = run_group(&params, &balancer, synthetic(false), &control).unwrap();
        assert_eq!(outcome.checkpoints.len(), 1);
        assert_eq!(outcome.checkpoints[0].n_iterations, 0);
        assert_eq!(outcome.checkpoints[0].shards.len(), 3);
        assert_eq!(outcome.checkpoints[0].total_particles, 1_000);
    }

    #[test]
    fn unbalanced_custom_ratios_are_rejected_before_start() {
        let params = params(2, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::custom(2, vec![0.500_000_9, 0.5]).unwrap();
        let err = run_group(&params, &balancer, synthetic(false), &RunControl::new()).unwrap_err();
        assert!(err.to_string().contains("do not sum to one"));
    }

    #[test]
    fn failed_construction_aborts_every_rank() {
        // Three flow maps requested, the source only has two.
        let source = SyntheticSource::generate(&source_config(2), false).unwrap();
        let params = params(4, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(4).unwrap();
        let err = run_group(&params, &balancer, Box::new(source), &RunControl::new()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransitionError>(),
            Some(TransitionError::NotEnoughSnapshots { n_flowmap: 3, available: 2 })
        ));
    }

    #[test]
    fn null_volume_mid_run_aborts_the_group() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let flows = vec![0.0, 1.0, 1.0, 0.0];
        let good = FlowSnapshot::new(flows.clone(), vec![1.0, 1.0], neighbors.clone()).unwrap();
        let bad = FlowSnapshot::new(flows, vec![1.0, 0.0], neighbors).unwrap();
        let source = InMemorySource::new(vec![good.clone(), bad, good]).unwrap();
        let params = params(2, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(2).unwrap();
        let err = run_group(&params, &balancer, Box::new(source), &RunControl::new()).unwrap_err();
        assert!(err.downcast_ref::<TransitionError>().is_some(), "{:#}", err);
    }

    #[test]
    fn mismatched_balancer_is_rejected_before_start() {
        let params = params(2, false, TransitionPolicyKind::Discontinuous);
        let balancer = LoadBalancer::uniform(3).unwrap();
        assert!(run_group(&params, &balancer, synthetic(false), &RunControl::new()).is_err());
    }

    /// Shard that only counts steps, to observe what a worker was told to do.
    struct CountingShard {
        rank: u32,
        steps: u64,
    }

    impl ShardStep for CountingShard {
        fn step(&mut self, _state: &crate::transitioner::IterationState<'_>, _delta_time: f64) {
            self.steps += 1;
        }

        fn statistics(&self) -> ShardStatistics {
            ShardStatistics { rank: self.rank, n_moves: self.steps, ..Default::default() }
        }
    }

    #[test]
    fn worker_follows_the_signal_protocol() {
        let neighbors = NeighborTable::from_rows(&[vec![1], vec![0]]);
        let init = RunInit {
            n_compartments: 2,
            n_neighbors: 2,
            delta_time: 0.1,
            n_flowmap: 1,
            n_per_flowmap: 1,
            n_timestep: 10,
            two_phase: false,
            policy: TransitionPolicyKind::Discontinuous,
            total_particles: 10,
            seed: 0,
        };
        let balancer = LoadBalancer::uniform(2).unwrap();

        let results = ProcessGroup::new(2)
            .run(|transport| {
                if !transport.is_root() {
                    worker_process(transport, &balancer, |rank, _, _| CountingShard {
                        rank,
                        steps: 0,
                    })?;
                    return Ok(Vec::new());
                }
                transport.broadcast(Tag::Init, Some(init.clone()))?;
                let inputs = HydroInputs {
                    liquid_flow: &[0.0, 1.0, 1.0, 0.0],
                    liquid_volume: &[1.0, 1.0],
                    gas_volume: &[0.0, 0.0],
                    neighbors: &neighbors,
                };
                transport.send(1, Tag::Signal, &Signal::Nop)?;
                for _ in 0..2 {
                    transport.send(1, Tag::Signal, &Signal::Run)?;
                    send_iteration(transport, 1, &inputs)?;
                }
                transport.send(1, Tag::Signal, &Signal::Dump)?;
                let dumped = transport
                    .gather(Tag::Statistics, ShardStatistics::default())?
                    .unwrap_or_default();
                transport.send(1, Tag::Signal, &Signal::Run)?;
                send_iteration(transport, 1, &inputs)?;
                transport.send(1, Tag::Signal, &Signal::Stop)?;
                transport.barrier()?;
                let last = transport
                    .gather(Tag::Statistics, ShardStatistics::default())?
                    .unwrap_or_default();
                Ok(vec![dumped[1].n_moves, last[1].n_moves])
            })
            .unwrap();
        assert_eq!(results[0], vec![2, 3]);
    }
}
