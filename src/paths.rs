use crate::config::RunConfig;
use crate::types::{InsarResult, Subswath, SubswathId};
use std::fs;
use std::path::{Path, PathBuf};

/// Immutable mapping from logical role to absolute directory path for one
/// project run.
///
/// Computed once from the run configuration and shared read-only with
/// every stage. The layout nests under
/// `<output>/<project>/<asc|des>/` with one `F<n>/{raw,topo}` tree per
/// configured sub-swath plus the shared `data`, `reframed`, `topo`,
/// `SBAS` and (for multi-unit runs) `merge` roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPaths {
    /// `<output>/<project>`.
    pub project_root: PathBuf,
    /// `<output>/<project>/<asc|des>`.
    pub base: PathBuf,
    /// Shared links to the input `.SAFE` scene directories.
    pub data: PathBuf,
    /// Per-unit working trees, in the configured order.
    pub units: Vec<Subswath>,
    /// Cross-unit merge root; present only when more than one unit merges.
    pub merge: Option<PathBuf>,
    /// Reframing root holding the pin file link.
    pub reframed: PathBuf,
    /// Shared topography root.
    pub topo: PathBuf,
    /// Inversion working directory.
    pub sbas: PathBuf,
}

impl RunPaths {
    pub fn new(config: &RunConfig) -> Self {
        let project_root = config.output_dir.join(&config.project_name);
        let base = project_root.join(config.direction.prefix());

        let units = config
            .subswaths
            .iter()
            .map(|&id| {
                let root = base.join(id.to_string());
                Subswath {
                    id,
                    raw: root.join("raw"),
                    topo: root.join("topo"),
                    root,
                }
            })
            .collect();

        let merge = if config.merge_enabled() {
            Some(base.join("merge"))
        } else {
            None
        };

        RunPaths {
            data: base.join("data"),
            reframed: base.join("reframed"),
            topo: base.join("topo"),
            sbas: base.join("SBAS"),
            project_root,
            base,
            units,
            merge,
        }
    }

    /// Creates the full directory tree; existing directories are left alone.
    pub fn create_all(&self) -> InsarResult<()> {
        let mut dirs: Vec<&Path> = vec![&self.data, &self.reframed, &self.topo, &self.sbas];
        if let Some(merge) = &self.merge {
            dirs.push(merge);
        }
        for unit in &self.units {
            dirs.push(&unit.root);
            dirs.push(&unit.raw);
            dirs.push(&unit.topo);
        }
        for dir in dirs {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn unit(&self, id: SubswathId) -> Option<&Subswath> {
        self.units.iter().find(|u| u.id == id)
    }

    /// The first configured unit; its pair manifest is the primary one
    /// from which the others are derived.
    pub fn primary_unit(&self) -> &Subswath {
        &self.units[0]
    }

    /// Root of the per-pair product tree consumed by unwrapping and
    /// inversion: the merge root for multi-unit runs, else the primary
    /// unit's `intf_all`.
    pub fn intf_root(&self) -> PathBuf {
        match &self.merge {
            Some(merge) => merge.clone(),
            None => self.primary_unit().intf_dir(),
        }
    }

    /// Cached master ranking, keyed by the scene set it was computed for.
    pub fn ranking_cache(&self) -> PathBuf {
        self.project_root.join("master_ranking.json")
    }

    /// Candidate baseline table used for master ranking.
    pub fn candidate_table(&self) -> PathBuf {
        self.data.join("candidates.dat")
    }

    /// Persistent append-only run log.
    pub fn run_log(&self) -> PathBuf {
        self.project_root.join("run.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrackDirection;

    fn config(subswaths: Vec<SubswathId>) -> RunConfig {
        RunConfig {
            project_name: "track42".to_string(),
            output_dir: PathBuf::from("/work/out"),
            direction: TrackDirection::Descending,
            subswaths,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_layout_nests_under_direction_prefix() {
        let paths = RunPaths::new(&config(vec![SubswathId::F1, SubswathId::F2]));
        assert_eq!(paths.base, PathBuf::from("/work/out/track42/des"));
        assert_eq!(paths.data, PathBuf::from("/work/out/track42/des/data"));
        let f2 = paths.unit(SubswathId::F2).unwrap();
        assert_eq!(f2.raw, PathBuf::from("/work/out/track42/des/F2/raw"));
        assert_eq!(f2.topo, PathBuf::from("/work/out/track42/des/F2/topo"));
    }

    #[test]
    fn test_single_unit_run_has_no_merge_root() {
        let paths = RunPaths::new(&config(vec![SubswathId::F2]));
        assert!(paths.merge.is_none());
        assert_eq!(
            paths.intf_root(),
            PathBuf::from("/work/out/track42/des/F2/intf_all")
        );
    }

    #[test]
    fn test_multi_unit_run_merges() {
        let paths = RunPaths::new(&config(vec![SubswathId::F1, SubswathId::F3]));
        assert_eq!(paths.merge, Some(PathBuf::from("/work/out/track42/des/merge")));
        assert_eq!(paths.intf_root(), PathBuf::from("/work/out/track42/des/merge"));
    }

    #[test]
    fn test_create_all_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = RunConfig {
            output_dir: dir.path().to_path_buf(),
            ..config(vec![SubswathId::F1, SubswathId::F2])
        };
        let paths = RunPaths::new(&cfg);
        paths.create_all().unwrap();
        paths.create_all().unwrap();
        assert!(paths.unit(SubswathId::F1).unwrap().raw.is_dir());
        assert!(paths.sbas.is_dir());
    }
}
