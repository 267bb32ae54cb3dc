use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Sentinel-1 IW sub-swath identifier.
///
/// A sub-swath is one independently processable partition of the input
/// data; every fan-out stage of the pipeline iterates over the configured
/// subset of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubswathId {
    F1,
    F2,
    F3,
}

impl SubswathId {
    pub const ALL: [SubswathId; 3] = [SubswathId::F1, SubswathId::F2, SubswathId::F3];

    /// The sub-swath number as used in scene tokens and file names (1..=3).
    pub fn number(&self) -> u8 {
        match self {
            SubswathId::F1 => 1,
            SubswathId::F2 => 2,
            SubswathId::F3 => 3,
        }
    }
}

impl std::fmt::Display for SubswathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.number())
    }
}

impl std::str::FromStr for SubswathId {
    type Err = InsarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "F1" => Ok(SubswathId::F1),
            "F2" => Ok(SubswathId::F2),
            "F3" => Ok(SubswathId::F3),
            other => Err(InsarError::InvalidFormat(format!(
                "invalid sub-swath identifier: {}",
                other
            ))),
        }
    }
}

/// One processing unit: a sub-swath together with its working directories.
///
/// Created once from the run configuration and never renamed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subswath {
    pub id: SubswathId,
    /// Unit root, e.g. `<project>/<asc|des>/F2`.
    pub root: PathBuf,
    /// Raw scene links and per-unit manifests live here.
    pub raw: PathBuf,
    /// Per-unit topography products.
    pub topo: PathBuf,
}

impl Subswath {
    /// Directory holding the per-pair interferogram products of this unit.
    pub fn intf_dir(&self) -> PathBuf {
        self.root.join("intf_all")
    }

    /// The per-unit pair manifest (`intf.in`).
    pub fn pair_manifest(&self) -> PathBuf {
        self.root.join("intf.in")
    }

    /// The per-unit ordered scene manifest (`data.in`).
    pub fn scene_manifest(&self) -> PathBuf {
        self.raw.join("data.in")
    }

    /// The per-unit baseline table, written next to the scene manifest
    /// by the preprocessing stage.
    pub fn baseline_table(&self) -> PathBuf {
        self.raw.join("baseline_table.dat")
    }
}

/// Orbit track direction; selects the path prefix of the run layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackDirection {
    Ascending,
    Descending,
}

impl TrackDirection {
    /// Three-letter lowercase directory prefix (`asc` / `des`).
    pub fn prefix(&self) -> &'static str {
        match self {
            TrackDirection::Ascending => "asc",
            TrackDirection::Descending => "des",
        }
    }
}

/// A candidate interferometric pair of two acquisitions, ordered by date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pair {
    pub early: NaiveDate,
    pub late: NaiveDate,
}

impl Pair {
    /// Builds a pair with the two dates in chronological order.
    pub fn new(a: NaiveDate, b: NaiveDate) -> Self {
        if a <= b {
            Pair { early: a, late: b }
        } else {
            Pair { early: b, late: a }
        }
    }

    /// Scene token for one date in the given unit, e.g. `S1_20200103_ALL_F2`.
    pub fn scene_token(date: NaiveDate, unit: SubswathId) -> String {
        format!("S1_{}_ALL_{}", date.format("%Y%m%d"), unit)
    }

    /// One `intf.in` record for the given unit.
    pub fn manifest_record(&self, unit: SubswathId) -> String {
        format!(
            "{}:{}",
            Pair::scene_token(self.early, unit),
            Pair::scene_token(self.late, unit)
        )
    }

    /// Product directory name in `intf_all`, GMTSAR year+day-of-year form,
    /// e.g. `2020003_2020015`.
    pub fn dir_name(&self) -> String {
        format!(
            "{}{:03}_{}{:03}",
            self.early.year(),
            self.early.ordinal(),
            self.late.year(),
            self.late.ordinal()
        )
    }

    /// Name of the single-pair input file handed to the interferogram tool.
    pub fn in_file_name(&self) -> String {
        format!(
            "intf_{}_{}.in",
            self.early.format("%Y%m%d"),
            self.late.format("%Y%m%d")
        )
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.early.format("%Y%m%d"),
            self.late.format("%Y%m%d")
        )
    }
}

/// Time-series inversion execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InversionMode {
    /// Single-threaded `sbas` invocation.
    Serial,
    /// Internally parallel `sbas_parallel` invocation.
    Parallel,
}

/// Atmospheric correction selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtmCorrection {
    None,
    /// GACOS zenith-delay grids matched per acquisition date.
    Gacos,
}

/// Error types for pipeline orchestration.
#[derive(Debug, thiserror::Error)]
pub enum InsarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data format: {0}")]
    InvalidFormat(String),

    #[error("configuration errors: {}", .0.join("; "))]
    Config(Vec<String>),

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error("stage '{stage}' failed: {detail}")]
    StageFailed { stage: String, detail: String },

    #[error("worker pool: {0}")]
    Pool(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pipeline operations.
pub type InsarResult<T> = Result<T, InsarError>;
