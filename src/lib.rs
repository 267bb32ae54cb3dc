//! insarflow: A Resumable, Parallel Orchestration Core for GMTSAR
//! Interferometric Time-Series Processing
//!
//! This library drives a multi-stage SAR interferometric (SBAS) workflow by
//! invoking an external processing toolchain in a fixed but branchable stage
//! order. It manages the on-disk project layout, skips stages whose outputs
//! already exist, fans independent work out across sub-swaths and
//! interferometric pairs, aggregates live progress from concurrent workers,
//! and builds the baseline pair network from a ranked candidate list.

pub mod config;
pub mod core;
pub mod io;
pub mod paths;
pub mod types;

// Re-export main types for easier access
pub use types::{
    AtmCorrection, InsarError, InsarResult, InversionMode, Pair, Subswath, SubswathId,
    TrackDirection,
};

pub use config::{CommandTemplate, RunConfig, Toolchain};
pub use paths::RunPaths;

pub use crate::core::{
    AcquisitionNode, EditSession, MasterRanking, Network, NetworkEdge, PairSelector, Pipeline,
    Progress, RankingWeights, RunLog, RunObserver, RunReport, StageId, ThresholdSelector,
    WorkerPool,
};
pub use io::{CommandOutcome, CommandRunner, CommandStatus, Completion, MarkerStore};
