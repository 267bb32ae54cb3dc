//! Orchestration core: baseline network construction, bounded fan-out,
//! progress aggregation, and the stage pipeline itself.

pub mod network;
pub mod pipeline;
pub mod pool;
pub mod progress;

pub use network::{
    AcquisitionNode, EditSession, MasterRanking, Network, NetworkEdge, PairSelector,
    RankingWeights, ThresholdSelector,
};
pub use pipeline::{Pipeline, RunLog, RunObserver, RunReport, StageId, StageRecord};
pub use pool::WorkerPool;
pub use progress::{Progress, ProgressTicker};
