//! Flow-map caching and particle distribution for compartment-model
//! bioreactor runs.
//!
//! Raw CFD flow snapshots are turned into transition matrices and cumulative
//! probability tables once per snapshot, cached for the whole run, and
//! replayed cyclically. The particle population is split across cooperating
//! ranks that receive the raw hydro inputs every iteration.

pub mod error;
pub mod hydro;
pub mod load_balance;
pub mod payload;
pub mod probability;
pub mod runner;
pub mod shard;
pub mod source;
pub mod transition;
pub mod transitioner;
pub mod transport;

pub use error::{HydroError, LoadBalanceError, SourceError, TransitionError, TransportError};
pub use hydro::{HydroState, HydroStateCache};
pub use load_balance::LoadBalancer;
pub use payload::{IterationPayload, RunInit};
pub use probability::CumulativeProbabilityTable;
pub use runner::{coordinator_process, run_group, worker_process, RunControl, RunOutcome};
pub use shard::{ParticleShard, ShardStep};
pub use source::{FlowSnapshotSource, InMemorySource, SyntheticSource};
pub use transition::TransitionMatrix;
pub use transitioner::{
    FlowMapTransitioner, HydroInputs, IterationState, TransitionParams, TransitionPolicy,
};
pub use transport::{ChannelTransport, ProcessGroup, Signal, Tag, Transport};
