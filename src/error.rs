//! Error types for each concern of the engine.
//!
//! Construction-time validation errors are returned to the caller, who decides
//! whether to retry with other parameters. Run-time data and transport errors
//! are fatal for the whole process group.

use bioreactor_common::SnapshotError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("snapshot {index} requested but the source holds {len}")]
    IndexOob { index: usize, len: usize },

    #[error("source holds no snapshot")]
    Empty,

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

#[derive(Error, Debug)]
pub enum HydroError {
    #[error("compartment {compartment} has a null volume, its inverse is undefined")]
    NullVolume { compartment: usize },

    #[error("{what} has length {len}, expected {expected}")]
    Shape { what: &'static str, len: usize, expected: usize },
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("flow snapshot source unavailable at start-up: {0}")]
    SourceUnavailable(#[source] SourceError),

    #[error("{n_flowmap} flow maps requested but the source only holds {available}")]
    NotEnoughSnapshots { n_flowmap: usize, available: usize },

    #[error("invalid transitioner parameter: {what}")]
    InvalidArg { what: &'static str },

    #[error("two-phase flow requested but snapshot {index} has no gas flow")]
    MissingGasFlow { index: usize },

    #[error("transitioner has no snapshot source (worker rank); use the payload path")]
    NoSource,

    #[error("hydro state slot {slot} was never computed")]
    SlotNotComputed { slot: usize },

    #[error("all {n_timestep} iterations have been consumed")]
    Exhausted { n_timestep: u64 },

    #[error("failed to read snapshot {index}: {source}")]
    Source {
        index: usize,
        #[source]
        source: SourceError,
    },

    #[error(transparent)]
    Hydro(#[from] HydroError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadBalanceError {
    #[error("a load balancer needs at least one rank")]
    ZeroRanks,

    #[error("host weight alpha must be strictly positive, got {alpha}")]
    NonPositiveAlpha { alpha: f64 },

    #[error("{len} ratios supplied for {ranks} ranks")]
    CustomRatioLength { len: usize, ranks: u32 },

    #[error("rank {rank} is outside a group of {ranks}")]
    RankOutOfRange { rank: u32, ranks: u32 },

    #[error("ratios allocate {allocated} particles out of {n}")]
    OverAllocated { allocated: u64, n: u64 },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("process group aborted")]
    Aborted,

    #[error("rank {rank} is outside a group of {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("link to rank {peer} is closed")]
    Disconnected { peer: usize },

    #[error("expected a {expected:?} frame from rank {peer}, got {got}")]
    UnexpectedTag { peer: usize, expected: crate::transport::Tag, got: u8 },

    #[error("expected a {expected} message, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("{what} carries {len} values, expected {expected}")]
    Truncated { what: &'static str, len: usize, expected: usize },

    #[error("frame codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
