//! The ordered stage state machine driving one processing run.
//!
//! A single driver thread advances the stages strictly in order; fan-out
//! stages dispatch through a [`WorkerPool`] and join before the next
//! stage's completion checks run. Every stage consults the marker store
//! first, so re-running a partially completed project redoes no
//! finished external work.

use crate::config::{CommandTemplate, RunConfig, Toolchain};
use crate::core::network::{MasterRanking, Network, PairSelector, RankingWeights, ThresholdSelector};
use crate::core::pool::WorkerPool;
use crate::core::progress::{Progress, ProgressTicker};
use crate::io::command::{CommandOutcome, CommandRunner, CommandStatus};
use crate::io::manifest;
use crate::io::markers::{Completion, MarkerStore};
use crate::paths::RunPaths;
use crate::types::{AtmCorrection, InsarError, InsarResult, InversionMode, Pair, Subswath, SubswathId};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(200);

/// Cumulative progress checkpoint reached at the end of each stage.
const CEILINGS: [u32; 13] = [4, 8, 14, 20, 24, 32, 55, 62, 68, 80, 85, 95, 100];

/// The fixed stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Structure,
    MasterSelection,
    OrbitPreparation,
    BaselineTables,
    PairGeneration,
    Alignment,
    Interferograms,
    Merge,
    MeanCoherence,
    Unwrapping,
    AtmosphericCorrection,
    Inversion,
    Export,
}

impl StageId {
    pub const ALL: [StageId; 13] = [
        StageId::Structure,
        StageId::MasterSelection,
        StageId::OrbitPreparation,
        StageId::BaselineTables,
        StageId::PairGeneration,
        StageId::Alignment,
        StageId::Interferograms,
        StageId::Merge,
        StageId::MeanCoherence,
        StageId::Unwrapping,
        StageId::AtmosphericCorrection,
        StageId::Inversion,
        StageId::Export,
    ];

    pub fn ordinal(self) -> usize {
        StageId::ALL.iter().position(|&s| s == self).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::Structure => "structure",
            StageId::MasterSelection => "master selection",
            StageId::OrbitPreparation => "orbit preparation",
            StageId::BaselineTables => "baseline tables",
            StageId::PairGeneration => "pair generation",
            StageId::Alignment => "alignment",
            StageId::Interferograms => "interferograms",
            StageId::Merge => "merge",
            StageId::MeanCoherence => "mean coherence",
            StageId::Unwrapping => "unwrapping",
            StageId::AtmosphericCorrection => "atmospheric correction",
            StageId::Inversion => "inversion",
            StageId::Export => "export",
        }
    }

    /// Progress value reached exactly when this stage's workers join.
    pub fn ceiling(self) -> u32 {
        CEILINGS[self.ordinal()]
    }

    /// Progress value this stage starts from.
    pub fn floor(self) -> u32 {
        match self.ordinal() {
            0 => 0,
            n => CEILINGS[n - 1],
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stage-start/stage-end events and the textual log-line stream.
///
/// The core has no opinion on rendering; a console, a GUI or a plain
/// file can observe the same run.
pub trait RunObserver {
    fn stage_started(&self, _stage: StageId) {}
    fn stage_finished(&self, _stage: StageId, _skipped: bool) {}
    fn log_line(&self, _line: &str) {}
}

/// Append-only run log mirrored to a file.
pub struct RunLog {
    file: Mutex<fs::File>,
}

impl RunLog {
    pub fn create(path: &Path) -> InsarResult<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(RunLog {
            file: Mutex::new(file),
        })
    }

    fn write(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let _ = writeln!(file, "[{}] {}", stamp, line);
        }
    }
}

impl RunObserver for RunLog {
    fn stage_started(&self, stage: StageId) {
        self.write(&format!("stage started: {}", stage));
    }

    fn stage_finished(&self, stage: StageId, skipped: bool) {
        let verb = if skipped { "skipped" } else { "finished" };
        self.write(&format!("stage {}: {}", verb, stage));
    }

    fn log_line(&self, line: &str) {
        self.write(line);
    }
}

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub stage: StageId,
    pub skipped: bool,
    pub duration: Duration,
}

/// What one [`Pipeline::run`] did: every external command it executed,
/// per-stage outcomes and timings, and how the run ended.
#[derive(Debug, Default)]
pub struct RunReport {
    pub executed: Vec<CommandOutcome>,
    pub stages: Vec<StageRecord>,
    /// True only when the terminal stage reported success.
    pub completed: bool,
    /// The failure that halted the run, if any.
    pub failure: Option<InsarError>,
}

impl RunReport {
    pub fn commands_run(&self) -> usize {
        self.executed.len()
    }

    pub fn failed_commands(&self) -> usize {
        self.executed.iter().filter(|o| !o.success()).count()
    }
}

/// The pipeline driver for one configured run.
pub struct Pipeline {
    config: RunConfig,
    toolchain: Toolchain,
    paths: RunPaths,
    runner: CommandRunner,
    markers: MarkerStore,
    progress: Progress,
    selector: Box<dyn PairSelector>,
    observers: Vec<Box<dyn RunObserver>>,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: RunConfig, toolchain: Toolchain) -> Self {
        let paths = RunPaths::new(&config);
        let selector = Box::new(ThresholdSelector {
            perpendicular_m: config.perpendicular_threshold_m,
            temporal_days: config.temporal_threshold_days,
        });
        Pipeline {
            paths,
            toolchain,
            runner: CommandRunner::new(),
            markers: MarkerStore::new(),
            progress: Progress::new(),
            selector,
            observers: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Replaces the default threshold-only pair selection, e.g. with an
    /// interactive network editor.
    pub fn with_selector(mut self, selector: Box<dyn PairSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn RunObserver>) {
        self.observers.push(observer);
    }

    /// Shared progress value for the presentation layer to poll.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Setting the flag halts the run at the next stage boundary; a
    /// dispatched worker pool always runs to completion first.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Runs the pipeline from the first incomplete stage to the end.
    ///
    /// Configuration problems are returned as an error before any stage
    /// runs. Mid-run failures end up in the report instead: the run
    /// halts at the failed stage boundary with `failure` set, progress
    /// frozen short of that stage's ceiling, and every command outcome
    /// collected so far preserved.
    pub fn run(&self) -> InsarResult<RunReport> {
        self.config.validate()?;
        self.paths.create_all()?;

        let mut report = RunReport::default();
        let run_started = Instant::now();
        self.log(&format!("run started: project {}", self.config.project_name));

        for stage in StageId::ALL {
            if self.stop.load(Ordering::SeqCst) {
                self.log(&format!("stop requested; halting before {}", stage));
                return Ok(report);
            }

            for observer in &self.observers {
                observer.stage_started(stage);
            }
            self.progress.set_floor(stage.floor());
            let ticker = ProgressTicker::start(self.progress.clone(), stage.ceiling(), TICK);

            let started = Instant::now();
            let result = self.run_stage(stage, &mut report);
            let duration = started.elapsed();

            match result {
                Ok(skipped) => {
                    ticker.complete();
                    for observer in &self.observers {
                        observer.stage_finished(stage, skipped);
                    }
                    let verb = if skipped { "skipped" } else { "finished" };
                    self.log(&format!("{} {} in {:.1?}", stage, verb, duration));
                    report.stages.push(StageRecord {
                        stage,
                        skipped,
                        duration,
                    });
                }
                Err(e) => {
                    ticker.cancel();
                    self.log(&format!("{} failed after {:.1?}: {}", stage, duration, e));
                    report.failure = Some(e);
                    return Ok(report);
                }
            }
        }

        report.completed = true;
        self.log(&format!("run complete in {:.1?}", run_started.elapsed()));
        Ok(report)
    }

    fn run_stage(&self, stage: StageId, report: &mut RunReport) -> InsarResult<bool> {
        match stage {
            StageId::Structure => self.stage_structure(),
            StageId::MasterSelection => self.stage_master_selection(report),
            StageId::OrbitPreparation => self.stage_orbit_preparation(report),
            StageId::BaselineTables => self.stage_baseline_tables(report),
            StageId::PairGeneration => self.stage_pair_generation(),
            StageId::Alignment => self.stage_alignment(report),
            StageId::Interferograms => self.stage_interferograms(report),
            StageId::Merge => self.stage_merge(report),
            StageId::MeanCoherence => self.stage_mean_coherence(report),
            StageId::Unwrapping => self.stage_unwrapping(report),
            StageId::AtmosphericCorrection => self.stage_atmospheric_correction(report),
            StageId::Inversion => self.stage_inversion(report),
            StageId::Export => self.stage_export(report),
        }
    }

    // ---- stage 1: directory layout and shared-input links ----
    //
    // Always re-runs; link creation is itself idempotent.
    fn stage_structure(&self) -> InsarResult<bool> {
        link_if_absent(&self.config.pin_file, &self.paths.reframed.join("pins.ll"))?;
        link_if_absent(&self.config.dem_file, &self.paths.topo.join("dem.grd"))?;
        for unit in &self.paths.units {
            link_if_absent(&self.config.dem_file, &unit.topo.join("dem.grd"))?;
        }

        // One link per input scene into the shared data root.
        for entry in fs::read_dir(&self.config.data_dir)? {
            let entry = entry?;
            link_if_absent(&entry.path(), &self.paths.data.join(entry.file_name()))?;
        }
        Ok(false)
    }

    // ---- stage 2: master ranking with a scene-set-validated cache ----
    fn stage_master_selection(&self, report: &mut RunReport) -> InsarResult<bool> {
        let table = self.paths.candidate_table();
        let mut ran_query = false;

        if !self.markers.is_complete(&Completion::file(&table)) {
            let command = self.toolchain.candidate_query.render(&[
                ("data", &path_str(&self.config.data_dir)),
                ("out", &path_str(&table)),
            ]);
            let outcome = self.runner.run(&command, &self.paths.data);
            let ok = outcome.success();
            report.executed.push(outcome);
            ran_query = true;
            if !ok || !self.markers.is_complete(&Completion::file(&table)) {
                return Err(InsarError::StageFailed {
                    stage: StageId::MasterSelection.name().to_string(),
                    detail: "candidate baseline query produced no table".to_string(),
                });
            }
        }

        let network = Network::from_baseline_table(&table)?;
        let cache = self.paths.ranking_cache();
        if let Some(cached) = MasterRanking::load(&cache) {
            if cached.is_valid_for(&network) {
                self.log("master ranking cache is valid for the current scene set");
                return Ok(!ran_query);
            }
            // Cache miss, not an error: the scene set changed.
            self.log("master ranking cache is stale; recomputing");
        }

        let ranking = MasterRanking::compute(&network, RankingWeights::default());
        ranking.store(&cache)?;
        self.log(&format!(
            "ranked {} master candidates; default master {}",
            ranking.ranked.len(),
            ranking.default_master()?.format("%Y%m%d")
        ));
        Ok(false)
    }

    // ---- stage 3: per-unit orbit attachment and scene manifest ----
    fn stage_orbit_preparation(&self, report: &mut RunReport) -> InsarResult<bool> {
        let data = path_str(&self.paths.data);
        let template = &self.toolchain.orbit_prep;
        self.run_unit_stage(
            StageId::OrbitPreparation,
            report,
            |unit| Completion::ManifestWithOrbits(unit.scene_manifest()),
            |unit| {
                let command =
                    template.render(&[("data", data.as_str()), ("raw", &path_str(&unit.raw))]);
                (command, unit.raw.clone())
            },
        )
    }

    // ---- stage 4: per-unit baseline tables ----
    fn stage_baseline_tables(&self, report: &mut RunReport) -> InsarResult<bool> {
        let dem = path_str(&self.config.dem_file);
        let template = &self.toolchain.baseline_table;
        self.run_unit_stage(
            StageId::BaselineTables,
            report,
            |unit| Completion::file(unit.baseline_table()),
            |unit| {
                let command = template.render(&[("dem", dem.as_str())]);
                (command, unit.raw.clone())
            },
        )
    }

    // ---- stage 5: baseline network and pair manifests ----
    //
    // Runs no external command: the selector finalizes the edge set and
    // the identical pair list is written to every unit with its own
    // naming tokens.
    fn stage_pair_generation(&self) -> InsarResult<bool> {
        let complete = self
            .paths
            .units
            .iter()
            .all(|u| self.markers.is_complete(&Completion::file(u.pair_manifest())));
        if complete {
            return Ok(true);
        }

        let table = self.paths.primary_unit().baseline_table();
        if !table.is_file() {
            return Err(InsarError::MissingPrerequisite(format!(
                "baseline table not found: {}",
                table.display()
            )));
        }
        let mut network = Network::from_baseline_table(&table)?;
        self.selector.select(&mut network)?;

        let pairs = network.pairs();
        if pairs.is_empty() {
            return Err(InsarError::StageFailed {
                stage: StageId::PairGeneration.name().to_string(),
                detail: "no pair satisfies the baseline constraints".to_string(),
            });
        }
        for node in network.unconnected() {
            self.log(&format!(
                "unconnected image: {} takes part in no pair",
                node.scene_id
            ));
        }

        for unit in &self.paths.units {
            manifest::write_pair_manifest(&unit.pair_manifest(), &pairs, unit.id)?;
        }
        self.log(&format!(
            "pair manifests written: {} pairs across {} units",
            pairs.len(),
            self.paths.units.len()
        ));
        Ok(false)
    }

    // ---- stage 6: per-unit alignment to the master ----
    fn stage_alignment(&self, report: &mut RunReport) -> InsarResult<bool> {
        let pairs = self.pairs()?;
        let connected: HashSet<NaiveDate> =
            pairs.iter().flat_map(|p| [p.early, p.late]).collect();
        let master = self.master_date()?;

        // Manifest rework before the fan-out: the master record moves to
        // the front and unconnected scenes leave the alignment input.
        let mut scene_counts: HashMap<SubswathId, usize> = HashMap::new();
        for unit in &self.paths.units {
            let manifest_path = unit.scene_manifest();
            if !manifest_path.is_file() {
                return Err(InsarError::MissingPrerequisite(format!(
                    "scene manifest not found: {}",
                    manifest_path.display()
                )));
            }
            let mut records = manifest::read_scene_manifest(&manifest_path)?;
            let dropped = manifest::drop_unconnected(&mut records, &connected);
            for record in &dropped {
                self.log(&format!(
                    "unconnected image dropped from {} alignment input: {}",
                    unit.id, record.stem
                ));
            }
            manifest::reorder_master_first(&mut records, master)?;
            manifest::write_scene_manifest(&manifest_path, &records)?;
            scene_counts.insert(unit.id, records.len());
        }

        let template = if self.config.esd_align {
            &self.toolchain.align_esd
        } else {
            &self.toolchain.align
        };
        let dem = path_str(&self.config.dem_file);
        let esd_mode = self.config.esd_mode.to_string();
        self.run_unit_stage(
            StageId::Alignment,
            report,
            |unit| Completion::FilesMatching {
                dir: unit.raw.clone(),
                prefix: String::new(),
                suffix: ".SLC".to_string(),
                min_count: scene_counts.get(&unit.id).copied().unwrap_or(usize::MAX),
            },
            |unit| {
                let command =
                    template.render(&[("dem", dem.as_str()), ("esd_mode", esd_mode.as_str())]);
                (command, unit.raw.clone())
            },
        )
    }

    // ---- stage 7: per-pair interferograms, primed single-threaded ----
    fn stage_interferograms(&self, report: &mut RunReport) -> InsarResult<bool> {
        let pairs = self.pairs()?;
        let master = self.master_date()?;
        let mut skipped = true;

        for unit in &self.paths.units {
            let intf_root = unit.intf_dir();
            let whole = Completion::AllPairArtifacts {
                root: intf_root.clone(),
                pairs: pairs.clone(),
                artifact: "corr.grd".to_string(),
            };
            if self.markers.is_complete(&whole) {
                continue;
            }
            skipped = false;

            manifest::update_batch_config(
                &unit.root.join("batch_tops.config"),
                &[
                    ("master_image", Pair::scene_token(master, unit.id)),
                    ("proc_stage", "1".to_string()),
                    ("filter_wavelength", self.config.filter_wavelength.to_string()),
                    ("range_dec", self.config.range_looks.to_string()),
                    ("azimuth_dec", self.config.azimuth_looks.to_string()),
                    ("threshold_snaphu", "0".to_string()),
                    ("threshold_geocode", "0".to_string()),
                ],
            )?;

            // The first pair runs alone so the shared elevation-phase
            // products exist before the fan-out hammers them.
            let mut remaining: Vec<Pair> = pairs.clone();
            let primer = Completion::file(unit.topo.join("topo_ra.grd"));
            if !self.markers.is_complete(&primer) {
                let first = remaining.remove(0);
                let outcome = run_pair_interferogram(
                    &self.runner,
                    &self.toolchain.interferogram,
                    &unit.root,
                    unit.id,
                    first,
                );
                let ok = outcome.success();
                report.executed.push(outcome);
                if !ok {
                    return Err(InsarError::StageFailed {
                        stage: StageId::Interferograms.name().to_string(),
                        detail: format!("priming pair {} failed in {}", first, unit.id),
                    });
                }
            }

            let todo: Vec<Pair> = remaining
                .into_iter()
                .filter(|p| {
                    !self.markers.is_complete(&Completion::file(
                        intf_root.join(p.dir_name()).join("corr.grd"),
                    ))
                })
                .collect();

            let runner = &self.runner;
            let template = &self.toolchain.interferogram;
            let unit_root = &unit.root;
            let unit_id = unit.id;
            let pool = WorkerPool::new(self.config.cores)?;
            let outcomes = pool.run_all(todo, |pair| {
                run_pair_interferogram(runner, template, unit_root, unit_id, pair)
            });
            report.executed.extend(outcomes);

            if !self.markers.is_complete(&whole) {
                return Err(InsarError::StageFailed {
                    stage: StageId::Interferograms.name().to_string(),
                    detail: format!("per-pair products missing in {} after fan-out", unit.id),
                });
            }
        }
        Ok(skipped)
    }

    // ---- stage 8: cross-unit merge (multi-unit runs only) ----
    fn stage_merge(&self, report: &mut RunReport) -> InsarResult<bool> {
        let Some(merge_root) = &self.paths.merge else {
            return Ok(true);
        };
        let pairs = self.pairs()?;
        let whole = Completion::AllPairArtifacts {
            root: merge_root.clone(),
            pairs: pairs.clone(),
            artifact: "corr.grd".to_string(),
        };
        if self.markers.is_complete(&whole) {
            return Ok(true);
        }

        // One record per pair listing the corresponding per-unit product
        // directories in sub-swath order.
        let mut list = String::new();
        for pair in &pairs {
            let dirs: Vec<String> = self
                .paths
                .units
                .iter()
                .map(|u| format!("{}/", u.intf_dir().join(pair.dir_name()).display()))
                .collect();
            list.push_str(&dirs.join(":"));
            list.push('\n');
        }
        fs::write(merge_root.join("merge_list"), list)?;

        let master = self.master_date()?;
        manifest::update_batch_config(
            &merge_root.join("batch_tops.config"),
            &[(
                "master_image",
                Pair::scene_token(master, self.paths.primary_unit().id),
            )],
        )?;

        let command = self.toolchain.merge.render(&[]);
        let outcome = self.runner.run(&command, merge_root);
        report.executed.push(outcome);

        if !self.markers.is_complete(&whole) {
            return Err(InsarError::StageFailed {
                stage: StageId::Merge.name().to_string(),
                detail: "merged per-pair products missing after merge".to_string(),
            });
        }
        Ok(false)
    }

    // ---- stage 9: mean coherence and the optional mask ----
    fn stage_mean_coherence(&self, report: &mut RunReport) -> InsarResult<bool> {
        let intf_root = self.paths.intf_root();
        let mean = intf_root.join("mean_corr.grd");
        if self.markers.is_complete(&Completion::file(&mean)) {
            return Ok(true);
        }

        let pairs = self.pairs()?;
        let mut list = String::new();
        for pair in &pairs {
            list.push_str(&format!("{}/corr.grd\n", pair.dir_name()));
        }
        fs::write(intf_root.join("corr_list"), list)?;

        let command = self
            .toolchain
            .mean_coherence
            .render(&[("list", "corr_list"), ("out", "mean_corr.grd")]);
        let outcome = self.runner.run(&command, &intf_root);
        report.executed.push(outcome);

        if self.config.masking_threshold > 0.0 {
            let command = self.toolchain.mask.render(&[
                ("mean", "mean_corr.grd"),
                ("threshold", &self.config.masking_threshold.to_string()),
            ]);
            let outcome = self.runner.run(&command, &intf_root);
            report.executed.push(outcome);
        }

        if !self.markers.is_complete(&Completion::file(&mean)) {
            return Err(InsarError::StageFailed {
                stage: StageId::MeanCoherence.name().to_string(),
                detail: "mean coherence product missing".to_string(),
            });
        }
        Ok(false)
    }

    // ---- stage 10: per-pair unwrapping ----
    fn stage_unwrapping(&self, report: &mut RunReport) -> InsarResult<bool> {
        let intf_root = self.paths.intf_root();
        let pairs = self.pairs()?;

        let todo: Vec<Pair> = pairs
            .iter()
            .copied()
            .filter(|pair| {
                let dir = intf_root.join(pair.dir_name());
                let unwrapped = self.markers.is_complete(&Completion::file(dir.join("unwrap.grd")));
                let input_present = dir.join("phasefilt.grd").is_file();
                !(unwrapped && input_present)
            })
            .collect();
        if todo.is_empty() {
            return Ok(true);
        }

        let runner = &self.runner;
        let template = &self.toolchain.unwrap;
        let threshold = self.config.unwrapping_threshold.to_string();
        let root = intf_root.clone();
        let pool = WorkerPool::new(self.config.cores)?;
        let outcomes = pool.run_all(todo, |pair| {
            let dir = root.join(pair.dir_name());
            if !dir.join("phasefilt.grd").is_file() {
                return failed_launch(
                    template.0.clone(),
                    &dir,
                    format!("filtered-phase input missing for pair {}", pair),
                );
            }
            let command = template.render(&[("threshold", threshold.as_str())]);
            runner.run(&command, &dir)
        });
        report.executed.extend(outcomes);

        let missing: Vec<String> = pairs
            .iter()
            .filter(|p| {
                !self
                    .markers
                    .is_complete(&Completion::file(intf_root.join(p.dir_name()).join("unwrap.grd")))
            })
            .map(|p| p.to_string())
            .collect();
        if missing.is_empty() {
            Ok(false)
        } else {
            Err(InsarError::StageFailed {
                stage: StageId::Unwrapping.name().to_string(),
                detail: format!("unwrapped products missing for pairs: {}", missing.join(", ")),
            })
        }
    }

    // ---- stage 11: optional per-pair atmospheric correction ----
    fn stage_atmospheric_correction(&self, report: &mut RunReport) -> InsarResult<bool> {
        if self.config.atm_correction != AtmCorrection::Gacos {
            return Ok(true);
        }
        // Validation guarantees the directory is set for GACOS runs.
        let Some(gacos_dir) = &self.config.gacos_dir else {
            return Ok(true);
        };

        let intf_root = self.paths.intf_root();
        let pairs = self.pairs()?;
        let mut eligible = Vec::new();
        for pair in &pairs {
            if ztd_available(gacos_dir, pair.early) && ztd_available(gacos_dir, pair.late) {
                eligible.push(*pair);
            } else {
                self.log(&format!(
                    "no zenith-delay grids for pair {}; correction skipped",
                    pair
                ));
            }
        }

        let todo: Vec<Pair> = eligible
            .iter()
            .copied()
            .filter(|p| {
                !self.markers.is_complete(&Completion::file(
                    intf_root.join(p.dir_name()).join("unwrap_gacos.grd"),
                ))
            })
            .collect();
        if todo.is_empty() {
            return Ok(true);
        }

        let runner = &self.runner;
        let template = &self.toolchain.gacos;
        let gacos = path_str(gacos_dir);
        let incidence = self.config.incidence_angle.to_string();
        let root = intf_root.clone();
        let pool = WorkerPool::new(self.config.cores)?;
        let outcomes = pool.run_all(todo, |pair| {
            let dir = root.join(pair.dir_name());
            let command = template.render(&[
                ("pair_dir", &path_str(&dir)),
                ("gacos", gacos.as_str()),
                ("incidence", incidence.as_str()),
            ]);
            runner.run(&command, &dir)
        });
        report.executed.extend(outcomes);

        let missing = eligible
            .iter()
            .filter(|p| {
                !self.markers.is_complete(&Completion::file(
                    intf_root.join(p.dir_name()).join("unwrap_gacos.grd"),
                ))
            })
            .count();
        if missing == 0 {
            Ok(false)
        } else {
            Err(InsarError::StageFailed {
                stage: StageId::AtmosphericCorrection.name().to_string(),
                detail: format!("{} corrected pairs missing after fan-out", missing),
            })
        }
    }

    // ---- stage 12: time-series inversion ----
    fn stage_inversion(&self, report: &mut RunReport) -> InsarResult<bool> {
        let pairs = self.pairs()?;
        let scenes = self.scene_count()?;
        let sbas = &self.paths.sbas;

        // One displacement grid per scene marks the inversion complete.
        // The prefix matters: export writes vel_ll.grd into the same
        // directory, and counting it would let a rerun over a grown
        // scene set report a stale inversion as done.
        let whole = Completion::FilesMatching {
            dir: sbas.clone(),
            prefix: "disp_".to_string(),
            suffix: ".grd".to_string(),
            min_count: scenes,
        };
        if self.markers.is_complete(&whole) {
            return Ok(true);
        }

        let primary = self.paths.primary_unit();
        let unwrap_grd = if self.config.atm_correction == AtmCorrection::Gacos {
            "unwrap_gacos.grd"
        } else {
            "unwrap.grd"
        };
        let prep = self.toolchain.inversion_prep.render(&[
            ("pairs", &path_str(&primary.pair_manifest())),
            ("baseline_table", &path_str(&primary.baseline_table())),
            ("intf_dir", &path_str(&self.paths.intf_root())),
            ("unwrap_grd", unwrap_grd),
        ]);
        let outcome = self.runner.run(&prep, sbas);
        let prep_ok = outcome.success();
        report.executed.push(outcome);
        if !prep_ok {
            return Err(InsarError::StageFailed {
                stage: StageId::Inversion.name().to_string(),
                detail: "inversion input preparation failed".to_string(),
            });
        }

        let vars: Vec<(&str, String)> = vec![
            ("n_intf", pairs.len().to_string()),
            ("n_scene", scenes.to_string()),
            ("incidence", self.config.incidence_angle.to_string()),
            ("smooth", self.config.smooth_factor.to_string()),
            ("atm", self.config.atm_iterations.to_string()),
        ];
        let vars: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let outcome = match self.config.inversion_mode {
            InversionMode::Serial => {
                let command = self.toolchain.inversion.render(&vars);
                self.runner.run(&command, sbas)
            }
            InversionMode::Parallel => {
                let command = self.toolchain.inversion_parallel.render(&vars);
                let cores = self.config.cores.to_string();
                self.runner
                    .run_with_env(&command, sbas, &[("OMP_NUM_THREADS", cores.as_str())])
            }
        };
        report.executed.push(outcome);

        if !self.markers.is_complete(&whole) {
            return Err(InsarError::StageFailed {
                stage: StageId::Inversion.name().to_string(),
                detail: format!("expected {} displacement grids in {}", scenes, sbas.display()),
            });
        }
        Ok(false)
    }

    // ---- stage 13: projection and presentation export ----
    fn stage_export(&self, report: &mut RunReport) -> InsarResult<bool> {
        let sbas = &self.paths.sbas;
        let projected = sbas.join("vel_ll.grd");
        let kml = sbas.join("vel_ll.kml");
        if self.markers.is_complete(&Completion::file(&projected))
            && self.markers.is_complete(&Completion::file(&kml))
        {
            return Ok(true);
        }

        let sbas_dir = path_str(sbas);
        for template in [&self.toolchain.project, &self.toolchain.velocity_kml] {
            let command = template.render(&[("sbas_dir", sbas_dir.as_str())]);
            let outcome = self.runner.run(&command, sbas);
            report.executed.push(outcome);
        }

        if !self.markers.is_complete(&Completion::file(&projected))
            || !self.markers.is_complete(&Completion::file(&kml))
        {
            return Err(InsarError::StageFailed {
                stage: StageId::Export.name().to_string(),
                detail: "projected velocity products missing".to_string(),
            });
        }
        Ok(false)
    }

    /// Per-unit fan-out with a shared shape: check the completion marker,
    /// dispatch the pending units, verify every unit's marker after join.
    fn run_unit_stage<C, M>(
        &self,
        stage: StageId,
        report: &mut RunReport,
        completion: C,
        command: M,
    ) -> InsarResult<bool>
    where
        C: Fn(&Subswath) -> Completion + Sync,
        M: Fn(&Subswath) -> (String, PathBuf) + Sync,
    {
        let pending: Vec<&Subswath> = self
            .paths
            .units
            .iter()
            .filter(|u| !self.markers.is_complete(&completion(u)))
            .collect();
        if pending.is_empty() {
            return Ok(true);
        }

        let runner = &self.runner;
        let pool = WorkerPool::new(pending.len())?;
        let outcomes = pool.run_all(pending, |unit| {
            let (cmd, dir) = command(unit);
            runner.run(&cmd, &dir)
        });
        report.executed.extend(outcomes);

        let incomplete: Vec<String> = self
            .paths
            .units
            .iter()
            .filter(|u| !self.markers.is_complete(&completion(u)))
            .map(|u| u.id.to_string())
            .collect();
        if incomplete.is_empty() {
            Ok(false)
        } else {
            Err(InsarError::StageFailed {
                stage: stage.name().to_string(),
                detail: format!("incomplete units: {}", incomplete.join(", ")),
            })
        }
    }

    /// The finalized pair list, read back from the primary unit's manifest.
    fn pairs(&self) -> InsarResult<Vec<Pair>> {
        let path = self.paths.primary_unit().pair_manifest();
        if !path.is_file() {
            return Err(InsarError::MissingPrerequisite(format!(
                "pair manifest not found: {}",
                path.display()
            )));
        }
        manifest::read_pair_manifest(&path)
    }

    fn scene_count(&self) -> InsarResult<usize> {
        let path = self.paths.primary_unit().scene_manifest();
        if !path.is_file() {
            return Err(InsarError::MissingPrerequisite(format!(
                "scene manifest not found: {}",
                path.display()
            )));
        }
        Ok(manifest::read_scene_manifest(&path)?.len())
    }

    /// The user's override if given, otherwise the cached ranking's best.
    fn master_date(&self) -> InsarResult<NaiveDate> {
        if let Some(date) = self.config.master_override {
            return Ok(date);
        }
        MasterRanking::load(&self.paths.ranking_cache())
            .ok_or_else(|| {
                InsarError::MissingPrerequisite("master ranking has not been computed".to_string())
            })?
            .default_master()
    }

    fn log(&self, line: &str) {
        log::info!("{}", line);
        for observer in &self.observers {
            observer.log_line(line);
        }
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

/// Creates a symlink unless something already sits at the destination.
fn link_if_absent(src: &Path, dest: &Path) -> InsarResult<()> {
    if dest.symlink_metadata().is_ok() {
        return Ok(());
    }
    std::os::unix::fs::symlink(src, dest)?;
    Ok(())
}

fn run_pair_interferogram(
    runner: &CommandRunner,
    template: &CommandTemplate,
    unit_root: &Path,
    unit: SubswathId,
    pair: Pair,
) -> CommandOutcome {
    let in_file = unit_root.join(pair.in_file_name());
    if let Err(e) = fs::write(&in_file, format!("{}\n", pair.manifest_record(unit))) {
        return failed_launch(template.0.clone(), unit_root, e.to_string());
    }
    let command = template.render(&[("pair_file", &pair.in_file_name())]);
    runner.run(&command, unit_root)
}

/// A per-item failure recorded without spawning anything.
fn failed_launch(command: String, dir: &Path, detail: String) -> CommandOutcome {
    CommandOutcome {
        command,
        working_dir: dir.to_path_buf(),
        status: CommandStatus::LaunchFailed(detail),
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Any zenith-delay grid for the given date makes correction available.
fn ztd_available(dir: &Path, date: NaiveDate) -> bool {
    let stamp = date.format("%Y%m%d").to_string();
    let Ok(rd) = fs::read_dir(dir) else {
        return false;
    };
    rd.filter_map(|e| e.ok()).any(|entry| {
        let name = entry.file_name().to_string_lossy().into_owned();
        name.contains(&stamp) && name.ends_with(".ztd")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_ceilings_are_increasing_and_end_at_100() {
        let mut last = 0;
        for stage in StageId::ALL {
            assert!(stage.ceiling() > last, "{} does not advance", stage);
            assert_eq!(stage.floor(), last);
            last = stage.ceiling();
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn test_link_if_absent_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("dem.grd");
        let dest = dir.path().join("link.grd");
        fs::write(&src, "grid").unwrap();
        link_if_absent(&src, &dest).unwrap();
        link_if_absent(&src, &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "grid");
    }

    #[test]
    fn test_ztd_availability_is_per_date() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("20200103.ztd"), "z").unwrap();
        let d = |y, m, day| NaiveDate::from_ymd_opt(y, m, day).unwrap();
        assert!(ztd_available(dir.path(), d(2020, 1, 3)));
        assert!(!ztd_available(dir.path(), d(2020, 1, 15)));
    }

    #[test]
    fn test_run_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.log");
        let log = RunLog::create(&path).unwrap();
        log.log_line("first");
        log.stage_started(StageId::Structure);
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("stage started: structure"));
        assert_eq!(text.lines().count(), 2);
    }
}
