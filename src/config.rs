use crate::types::{AtmCorrection, InsarError, InsarResult, InversionMode, SubswathId, TrackDirection};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Flat set of named options for one pipeline run.
///
/// No ambient state: a `RunConfig` is constructed once, validated eagerly,
/// and passed by reference to every stage. Defaults mirror the values the
/// processing scripts were tuned for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub project_name: String,
    /// Directory containing the input `.SAFE` scene directories.
    pub data_dir: PathBuf,
    /// Root under which the project layout is created.
    pub output_dir: PathBuf,
    /// Digital elevation model grid linked into every unit.
    pub dem_file: PathBuf,
    /// Frame pin file linked into the reframed directory.
    pub pin_file: PathBuf,
    pub direction: TrackDirection,
    /// Which sub-swaths to create and process; a strict subset is allowed.
    pub subswaths: Vec<SubswathId>,
    /// Optional user override of the ranked master scene.
    pub master_override: Option<NaiveDate>,
    /// Inclusive temporal baseline bound for pair generation, in days.
    pub temporal_threshold_days: f64,
    /// Inclusive perpendicular baseline bound for pair generation, in meters.
    pub perpendicular_threshold_m: f64,
    /// Multilook factors (range, azimuth).
    pub range_looks: u32,
    pub azimuth_looks: u32,
    /// Interferogram filter wavelength in meters.
    pub filter_wavelength: u32,
    /// Coherence threshold for the optional mask; 0 disables masking.
    pub masking_threshold: f64,
    /// Coherence threshold handed to the unwrapper.
    pub unwrapping_threshold: f64,
    /// Radar incidence angle in degrees, used by correction and inversion.
    pub incidence_angle: f64,
    /// Upper bound on concurrently running external commands.
    pub cores: usize,
    pub inversion_mode: InversionMode,
    /// Spatial smoothing factor for the inversion.
    pub smooth_factor: f64,
    /// Atmospheric-iteration count for the inversion (0 = none).
    pub atm_iterations: u32,
    pub atm_correction: AtmCorrection,
    /// Directory of `.ztd` zenith-delay grids; required for GACOS runs.
    pub gacos_dir: Option<PathBuf>,
    /// Align with enhanced spectral diversity.
    pub esd_align: bool,
    /// ESD estimation mode (0 average, 1 median, 2 interpolation).
    pub esd_mode: u8,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            project_name: String::new(),
            data_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            dem_file: PathBuf::new(),
            pin_file: PathBuf::new(),
            direction: TrackDirection::Descending,
            subswaths: SubswathId::ALL.to_vec(),
            master_override: None,
            temporal_threshold_days: 50.0,
            perpendicular_threshold_m: 100.0,
            range_looks: 8,
            azimuth_looks: 2,
            filter_wavelength: 200,
            masking_threshold: 0.0,
            unwrapping_threshold: 0.01,
            incidence_angle: 37.0,
            cores: 4,
            inversion_mode: InversionMode::Serial,
            smooth_factor: 5.0,
            atm_iterations: 0,
            atm_correction: AtmCorrection::None,
            gacos_dir: None,
            esd_align: true,
            esd_mode: 2,
        }
    }
}

impl RunConfig {
    /// Eager validation before any stage runs.
    ///
    /// Collects every problem instead of stopping at the first so the
    /// caller can surface the complete list; the pipeline refuses to start
    /// on any error.
    pub fn validate(&self) -> InsarResult<()> {
        let mut errors = Vec::new();

        if self.project_name.trim().is_empty() {
            errors.push("project name must not be empty".to_string());
        }
        if !self.data_dir.is_dir() {
            errors.push(format!("data directory not found: {}", self.data_dir.display()));
        }
        if !self.output_dir.is_dir() {
            errors.push(format!("output directory not found: {}", self.output_dir.display()));
        }
        if !self.dem_file.is_file() {
            errors.push(format!("DEM file not found: {}", self.dem_file.display()));
        }
        if !self.pin_file.is_file() {
            errors.push(format!("pin file not found: {}", self.pin_file.display()));
        }
        if self.subswaths.is_empty() {
            errors.push("at least one sub-swath must be selected".to_string());
        }
        let mut seen = self.subswaths.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.subswaths.len() {
            errors.push("sub-swath selection contains duplicates".to_string());
        }
        if self.temporal_threshold_days < 0.0 {
            errors.push("temporal baseline threshold must be non-negative".to_string());
        }
        if self.perpendicular_threshold_m < 0.0 {
            errors.push("perpendicular baseline threshold must be non-negative".to_string());
        }
        if self.range_looks == 0 || self.azimuth_looks == 0 {
            errors.push("multilook factors must be at least 1".to_string());
        }
        if self.filter_wavelength == 0 {
            errors.push("filter wavelength must be a positive integer".to_string());
        }
        if !(0.0..=1.0).contains(&self.masking_threshold) {
            errors.push("masking threshold must lie in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.unwrapping_threshold) {
            errors.push("unwrapping threshold must lie in [0, 1]".to_string());
        }
        if self.cores == 0 {
            errors.push("core count must be at least 1".to_string());
        }
        if self.esd_mode > 2 {
            errors.push("ESD mode must be 0, 1 or 2".to_string());
        }
        if self.atm_correction == AtmCorrection::Gacos {
            match &self.gacos_dir {
                Some(dir) if dir.is_dir() => {}
                Some(dir) => {
                    errors.push(format!("GACOS directory not found: {}", dir.display()))
                }
                None => errors.push("GACOS correction selected but no data directory given".to_string()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(InsarError::Config(errors))
        }
    }

    /// Merging applies only when more than one unit is configured.
    pub fn merge_enabled(&self) -> bool {
        self.subswaths.len() > 1
    }
}

/// One external command template with `{token}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate(pub String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        CommandTemplate(template.into())
    }

    /// Substitutes `{name}` placeholders; unknown placeholders are left
    /// untouched so a bad template surfaces in the command log rather
    /// than vanishing silently.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = self.0.clone();
        for (name, value) in vars {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }
}

/// The external processing toolchain, expressed purely as command
/// templates. These are configuration data: nothing in the core depends
/// on the concrete flags of any particular tool distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolchain {
    /// Writes a candidate baseline table for master ranking into `{out}`.
    pub candidate_query: CommandTemplate,
    /// Emits the per-unit `data.in` manifest with orbit records; run in `raw/`.
    pub orbit_prep: CommandTemplate,
    /// Baseline-table preprocessing (mode 1); run in `raw/`.
    pub baseline_table: CommandTemplate,
    /// Secondary-image alignment without ESD (mode 2); run in `raw/`.
    pub align: CommandTemplate,
    /// Secondary-image alignment with ESD (mode 2); run in `raw/`.
    pub align_esd: CommandTemplate,
    /// Single-pair interferogram generation; run in the unit root.
    pub interferogram: CommandTemplate,
    /// Cross-unit merge of per-pair products; run in the merge root.
    pub merge: CommandTemplate,
    /// Mean-coherence stack over `{list}` into `{out}`; run in the intf root.
    pub mean_coherence: CommandTemplate,
    /// Threshold mask from the mean-coherence product.
    pub mask: CommandTemplate,
    /// Phase unwrapping; run inside one pair directory.
    pub unwrap: CommandTemplate,
    /// GACOS correction of one pair; run inside the pair directory.
    pub gacos: CommandTemplate,
    /// Inversion input preparation (`intf.tab` / `scene.tab`); run in SBAS root.
    pub inversion_prep: CommandTemplate,
    /// Serial inversion; run in the SBAS root.
    pub inversion: CommandTemplate,
    /// Internally-parallel inversion; run in the SBAS root.
    pub inversion_parallel: CommandTemplate,
    /// Projection of inversion products to geographic coordinates.
    pub project: CommandTemplate,
    /// KML velocity export.
    pub velocity_kml: CommandTemplate,
}

impl Default for Toolchain {
    fn default() -> Self {
        Toolchain {
            candidate_query: CommandTemplate::new("asf_baseline_query.csh {data} {out}"),
            orbit_prep: CommandTemplate::new("prep_data_orbits.csh {data} {raw}"),
            baseline_table: CommandTemplate::new("preproc_batch_tops.csh data.in {dem} 1"),
            align: CommandTemplate::new("preproc_batch_tops.csh data.in {dem} 2"),
            align_esd: CommandTemplate::new("preproc_batch_tops_esd.csh data.in {dem} 2 {esd_mode}"),
            interferogram: CommandTemplate::new("intf_tops.csh {pair_file} batch_tops.config"),
            merge: CommandTemplate::new("merge_batch_parallel.sh merge_list batch_tops.config"),
            mean_coherence: CommandTemplate::new("stack_corr.csh {list} {out}"),
            mask: CommandTemplate::new("make_mask.csh {mean} {threshold} mask_def.grd"),
            unwrap: CommandTemplate::new("snaphu_interp.csh {threshold} 0"),
            gacos: CommandTemplate::new("gacos_correct.csh {pair_dir} {gacos} {incidence}"),
            inversion_prep: CommandTemplate::new(
                "prep_sbas.csh {pairs} {baseline_table} {intf_dir} {unwrap_grd} corr.grd",
            ),
            inversion: CommandTemplate::new(
                "sbas intf.tab scene.tab {n_intf} {n_scene} -incidence {incidence} -smooth {smooth} -atm {atm} -rms -dem",
            ),
            inversion_parallel: CommandTemplate::new(
                "sbas_parallel intf.tab scene.tab {n_intf} {n_scene} -incidence {incidence} -smooth {smooth} -atm {atm} -rms -dem -mmap",
            ),
            project: CommandTemplate::new("proj_ra2ll.csh {sbas_dir}"),
            velocity_kml: CommandTemplate::new("vel_kml.csh {sbas_dir}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_template_render_substitutes_tokens() {
        let t = CommandTemplate::new("preproc_batch_tops.csh data.in {dem} 1");
        assert_eq!(
            t.render(&[("dem", "/tmp/dem.grd")]),
            "preproc_batch_tops.csh data.in /tmp/dem.grd 1"
        );
    }

    #[test]
    fn test_template_leaves_unknown_tokens() {
        let t = CommandTemplate::new("tool {missing}");
        assert_eq!(t.render(&[("dem", "x")]), "tool {missing}");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let cfg = RunConfig {
            project_name: " ".to_string(),
            temporal_threshold_days: -1.0,
            cores: 0,
            ..RunConfig::default()
        };
        match cfg.validate() {
            Err(InsarError::Config(errors)) => {
                assert!(errors.iter().any(|e| e.contains("project name")));
                assert!(errors.iter().any(|e| e.contains("temporal")));
                assert!(errors.iter().any(|e| e.contains("core count")));
                // Missing paths are also reported in the same pass.
                assert!(errors.iter().any(|e| e.contains("data directory")));
            }
            other => panic!("expected config error list, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.grd");
        let pin = dir.path().join("pin.II");
        std::fs::write(&dem, "grid").unwrap();
        std::fs::write(&pin, "pin").unwrap();

        let cfg = RunConfig {
            project_name: "track42".to_string(),
            data_dir: dir.path().to_path_buf(),
            output_dir: dir.path().to_path_buf(),
            dem_file: dem,
            pin_file: pin,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_gacos_requires_directory() {
        let dir = TempDir::new().unwrap();
        let dem = dir.path().join("dem.grd");
        let pin = dir.path().join("pin.II");
        std::fs::write(&dem, "grid").unwrap();
        std::fs::write(&pin, "pin").unwrap();

        let cfg = RunConfig {
            project_name: "track42".to_string(),
            data_dir: dir.path().to_path_buf(),
            output_dir: dir.path().to_path_buf(),
            dem_file: dem,
            pin_file: pin,
            atm_correction: AtmCorrection::Gacos,
            gacos_dir: None,
            ..RunConfig::default()
        };
        match cfg.validate() {
            Err(InsarError::Config(errors)) => {
                assert!(errors.iter().any(|e| e.contains("GACOS")));
            }
            _ => panic!("expected config error"),
        }
    }

    #[test]
    fn test_merge_enabled_only_for_multiple_units() {
        let mut cfg = RunConfig::default();
        assert!(cfg.merge_enabled());
        cfg.subswaths = vec![SubswathId::F2];
        assert!(!cfg.merge_enabled());
    }
}
