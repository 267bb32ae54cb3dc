//! Stage completion detection from on-disk artifacts.
//!
//! No bookkeeping file records what has run; each stage declares which
//! artifacts its completed work leaves behind, and a stage is complete
//! exactly when all of them are present. Deleting an artifact re-queues
//! the corresponding work on the next run, which is the whole resume
//! mechanism.

use crate::io::manifest;
use crate::types::Pair;
use std::fs;
use std::path::{Path, PathBuf};

/// Declarative completion predicate for one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The file exists and is non-empty.
    FileNonEmpty(PathBuf),
    /// The directory contains at least `min_count` files whose names
    /// start with `prefix` and end with `suffix`. An empty prefix
    /// matches any name; a non-empty one keeps unrelated products in the
    /// same directory from being miscounted.
    FilesMatching {
        dir: PathBuf,
        prefix: String,
        suffix: String,
        min_count: usize,
    },
    /// Every pair's subdirectory under `root` holds a non-empty copy of
    /// `artifact`. A stage with a partially processed batch is
    /// incomplete as a whole, while the per-pair predicates still let
    /// the finished pairs be skipped individually.
    AllPairArtifacts {
        root: PathBuf,
        pairs: Vec<Pair>,
        artifact: String,
    },
    /// The scene manifest exists and every record carries an orbit file.
    ManifestWithOrbits(PathBuf),
    /// Always incomplete; the stage runs on every invocation.
    Never,
}

impl Completion {
    /// Convenience constructor for the common single-artifact case.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Completion::FileNonEmpty(path.into())
    }
}

/// Evaluates [`Completion`] predicates against the filesystem.
///
/// Stateless; every query goes to disk so that work finished by a
/// previous process, or artifacts deleted by the operator, are seen
/// immediately.
#[derive(Debug, Default, Clone)]
pub struct MarkerStore;

impl MarkerStore {
    pub fn new() -> Self {
        MarkerStore
    }

    pub fn is_complete(&self, completion: &Completion) -> bool {
        let complete = match completion {
            Completion::FileNonEmpty(path) => file_non_empty(path),
            Completion::FilesMatching {
                dir,
                prefix,
                suffix,
                min_count,
            } => matching_count(dir, prefix, suffix) >= *min_count,
            Completion::AllPairArtifacts {
                root,
                pairs,
                artifact,
            } => {
                !pairs.is_empty()
                    && pairs
                        .iter()
                        .all(|p| file_non_empty(&root.join(p.dir_name()).join(artifact)))
            }
            Completion::ManifestWithOrbits(path) => match manifest::read_scene_manifest(path) {
                Ok(records) => !records.is_empty() && records.iter().all(|r| r.has_orbit()),
                Err(_) => false,
            },
            Completion::Never => false,
        };
        log::debug!("completion check {:?} -> {}", completion, complete);
        complete
    }
}

fn file_non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

fn matching_count(dir: &Path, prefix: &str, suffix: &str) -> usize {
    let Ok(rd) = fs::read_dir(dir) else {
        return 0;
    };
    rd.filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(prefix) && name.ends_with(suffix))
                .unwrap_or(false)
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn pair(e: (i32, u32, u32), l: (i32, u32, u32)) -> Pair {
        Pair::new(
            NaiveDate::from_ymd_opt(e.0, e.1, e.2).unwrap(),
            NaiveDate::from_ymd_opt(l.0, l.1, l.2).unwrap(),
        )
    }

    #[test]
    fn test_empty_file_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("topo_ra.grd");
        let store = MarkerStore::new();
        assert!(!store.is_complete(&Completion::file(&path)));
        fs::write(&path, "").unwrap();
        assert!(!store.is_complete(&Completion::file(&path)));
        fs::write(&path, "grid").unwrap();
        assert!(store.is_complete(&Completion::file(&path)));
    }

    #[test]
    fn test_matching_count_threshold() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.SLC"), "x").unwrap();
        fs::write(dir.path().join("b.SLC"), "x").unwrap();
        fs::write(dir.path().join("b.PRM"), "x").unwrap();
        let store = MarkerStore::new();
        let at = |min_count| Completion::FilesMatching {
            dir: dir.path().to_path_buf(),
            prefix: String::new(),
            suffix: ".SLC".to_string(),
            min_count,
        };
        assert!(store.is_complete(&at(2)));
        assert!(!store.is_complete(&at(3)));
    }

    #[test]
    fn test_prefix_excludes_unrelated_products() {
        // A displacement-grid count must not be satisfied by other .grd
        // products written into the same directory later in the run.
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("disp_2020003.grd"), "x").unwrap();
        fs::write(dir.path().join("disp_2020015.grd"), "x").unwrap();
        fs::write(dir.path().join("vel_ll.grd"), "x").unwrap();
        let store = MarkerStore::new();
        let at = |min_count| Completion::FilesMatching {
            dir: dir.path().to_path_buf(),
            prefix: "disp_".to_string(),
            suffix: ".grd".to_string(),
            min_count,
        };
        assert!(store.is_complete(&at(2)));
        assert!(!store.is_complete(&at(3)));
    }

    #[test]
    fn test_all_pair_artifacts_requires_every_pair() {
        let dir = TempDir::new().unwrap();
        let pairs = vec![pair((2020, 1, 3), (2020, 1, 15)), pair((2020, 1, 15), (2020, 1, 27))];
        let store = MarkerStore::new();
        let completion = Completion::AllPairArtifacts {
            root: dir.path().to_path_buf(),
            pairs: pairs.clone(),
            artifact: "corr.grd".to_string(),
        };

        let first = dir.path().join(pairs[0].dir_name());
        fs::create_dir_all(&first).unwrap();
        fs::write(first.join("corr.grd"), "grid").unwrap();
        assert!(!store.is_complete(&completion));

        let second = dir.path().join(pairs[1].dir_name());
        fs::create_dir_all(&second).unwrap();
        fs::write(second.join("corr.grd"), "grid").unwrap();
        assert!(store.is_complete(&completion));
    }

    #[test]
    fn test_no_pairs_means_incomplete() {
        let store = MarkerStore::new();
        assert!(!store.is_complete(&Completion::AllPairArtifacts {
            root: PathBuf::from("/nonexistent"),
            pairs: vec![],
            artifact: "corr.grd".to_string(),
        }));
    }

    #[test]
    fn test_manifest_with_orbits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.in");
        let store = MarkerStore::new();
        let completion = Completion::ManifestWithOrbits(path.clone());

        assert!(!store.is_complete(&completion));
        fs::write(&path, "s1a-iw1-slc-vv-20200103t170815-001:\n").unwrap();
        assert!(!store.is_complete(&completion));
        fs::write(&path, "s1a-iw1-slc-vv-20200103t170815-001:S1A_ORB.EOF\n").unwrap();
        assert!(store.is_complete(&completion));
    }

    #[test]
    fn test_never_is_never_complete() {
        assert!(!MarkerStore::new().is_complete(&Completion::Never));
    }
}
