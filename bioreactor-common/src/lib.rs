pub mod config;
pub mod report;
pub mod run_params;
pub mod snapshot;

// Re-export key types for easier use by dependent crates
pub use config::{
    FlowMapConfig, LoadBalancerConfig, OutputConfig, ParallelConfig, ParticlesConfig, RunConfig,
    SourceConfig, TimingConfig, TransitionPolicyKind,
};
pub use report::{RunReport, ShardStatistics};
pub use run_params::RunParams;
pub use snapshot::{FlowSnapshot, NeighborTable, SnapshotError};
