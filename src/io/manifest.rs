//! Plain-text manifest formats exchanged with the processing toolchain.
//!
//! Two record shapes exist: the ordered scene manifest (`data.in`, one
//! `scene-stem:orbit-file` record per acquisition) and the pair manifest
//! (`intf.in`, one `token:token` record per interferometric pair). These
//! are the only persisted artifacts the core itself reads and writes;
//! everything heavier is opaque to it.

use crate::types::{InsarError, InsarResult, Pair, SubswathId};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

fn scene_date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{8})(?:[tT]\d{6})?").unwrap())
}

/// One `data.in` record: an acquisition stem plus its orbit file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneRecord {
    pub stem: String,
    pub orbit: String,
}

impl SceneRecord {
    /// Acquisition date embedded in the scene stem.
    pub fn date(&self) -> InsarResult<NaiveDate> {
        let caps = scene_date_regex()
            .captures(&self.stem)
            .ok_or_else(|| InsarError::InvalidFormat(format!("no date in scene stem: {}", self.stem)))?;
        NaiveDate::parse_from_str(&caps[1], "%Y%m%d")
            .map_err(|e| InsarError::InvalidFormat(format!("bad date in {}: {}", self.stem, e)))
    }

    /// A record is orbit-complete once its orbit field is filled in;
    /// this is the sentinel the orbit-preparation skip check looks for.
    pub fn has_orbit(&self) -> bool {
        !self.orbit.is_empty()
    }

    fn to_line(&self) -> String {
        format!("{}:{}", self.stem, self.orbit)
    }
}

/// Reads an ordered scene manifest. Blank lines are ignored.
pub fn read_scene_manifest(path: &Path) -> InsarResult<Vec<SceneRecord>> {
    let text = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // The orbit file is the last `:`-separated field; multi-frame
        // stems keep their internal separators.
        match line.rsplit_once(':') {
            Some((stem, orbit)) => records.push(SceneRecord {
                stem: stem.to_string(),
                orbit: orbit.to_string(),
            }),
            None => records.push(SceneRecord {
                stem: line.to_string(),
                orbit: String::new(),
            }),
        }
    }
    Ok(records)
}

pub fn write_scene_manifest(path: &Path, records: &[SceneRecord]) -> InsarResult<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_line());
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Moves the master scene's record to the head of the manifest, as the
/// alignment tool treats the first record as the geometric reference.
pub fn reorder_master_first(records: &mut Vec<SceneRecord>, master: NaiveDate) -> InsarResult<()> {
    let pos = records
        .iter()
        .position(|r| r.date().map(|d| d == master).unwrap_or(false))
        .ok_or_else(|| {
            InsarError::MissingPrerequisite(format!(
                "master scene {} not present in scene manifest",
                master.format("%Y%m%d")
            ))
        })?;
    let record = records.remove(pos);
    records.insert(0, record);
    Ok(())
}

/// Removes scenes that take part in no pair from the alignment input.
///
/// Returns the dropped records so the caller can log each one; the
/// network value object itself is untouched.
pub fn drop_unconnected(
    records: &mut Vec<SceneRecord>,
    connected: &HashSet<NaiveDate>,
) -> Vec<SceneRecord> {
    let mut dropped = Vec::new();
    records.retain(|r| match r.date() {
        Ok(date) if connected.contains(&date) => true,
        _ => {
            dropped.push(r.clone());
            false
        }
    });
    dropped
}

/// Reads a pair manifest (`intf.in`).
pub fn read_pair_manifest(path: &Path) -> InsarResult<Vec<Pair>> {
    let text = fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (a, b) = line.split_once(':').ok_or_else(|| {
            InsarError::InvalidFormat(format!("pair record without separator: {}", line))
        })?;
        pairs.push(Pair::new(token_date(a)?, token_date(b)?));
    }
    Ok(pairs)
}

/// Writes a pair manifest with the given unit's naming tokens.
pub fn write_pair_manifest(path: &Path, pairs: &[Pair], unit: SubswathId) -> InsarResult<()> {
    let mut out = String::new();
    for pair in pairs {
        out.push_str(&pair.manifest_record(unit));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

fn token_date(token: &str) -> InsarResult<NaiveDate> {
    let caps = scene_date_regex()
        .captures(token)
        .ok_or_else(|| InsarError::InvalidFormat(format!("no date in scene token: {}", token)))?;
    NaiveDate::parse_from_str(&caps[1], "%Y%m%d")
        .map_err(|e| InsarError::InvalidFormat(format!("bad date in {}: {}", token, e)))
}

/// Rewrites `key = value` assignments in a toolchain batch-configuration
/// file; keys not present are appended so a sparse template still ends
/// up fully parameterized.
pub fn update_batch_config(path: &Path, params: &[(&str, String)]) -> InsarResult<()> {
    let text = if path.exists() {
        fs::read_to_string(path)?
    } else {
        String::new()
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let key = line.split('=').next().map(str::trim).unwrap_or("");
        match params.iter().find(|(name, _)| *name == key) {
            Some((name, value)) => {
                seen.insert(name);
                lines.push(format!("{} = {}", name, value));
            }
            None => lines.push(line.to_string()),
        }
    }
    for (name, value) in params {
        if !seen.contains(name) {
            lines.push(format!("{} = {}", name, value));
        }
    }

    fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn record(stem: &str, orbit: &str) -> SceneRecord {
        SceneRecord {
            stem: stem.to_string(),
            orbit: orbit.to_string(),
        }
    }

    #[test]
    fn test_scene_manifest_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.in");
        let records = vec![
            record("s1a-iw2-slc-vv-20200103t170815-001", "S1A_ORB_A.EOF"),
            record("s1a-iw2-slc-vv-20200115t170815-001", "S1A_ORB_B.EOF"),
        ];
        write_scene_manifest(&path, &records).unwrap();
        let read = read_scene_manifest(&path).unwrap();
        assert_eq!(read, records);
        assert_eq!(read[0].date().unwrap(), d(2020, 1, 3));
        assert!(read[0].has_orbit());
    }

    #[test]
    fn test_reorder_master_first() {
        let mut records = vec![
            record("s1a-iw1-slc-vv-20200103t170815-001", "a.EOF"),
            record("s1a-iw1-slc-vv-20200115t170815-001", "b.EOF"),
            record("s1a-iw1-slc-vv-20200127t170815-001", "c.EOF"),
        ];
        reorder_master_first(&mut records, d(2020, 1, 15)).unwrap();
        assert_eq!(records[0].date().unwrap(), d(2020, 1, 15));
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_reorder_missing_master_is_a_prerequisite_error() {
        let mut records = vec![record("s1a-iw1-slc-vv-20200103t170815-001", "a.EOF")];
        let err = reorder_master_first(&mut records, d(2021, 6, 1)).unwrap_err();
        assert!(matches!(err, InsarError::MissingPrerequisite(_)));
    }

    #[test]
    fn test_drop_unconnected_keeps_paired_scenes() {
        let mut records = vec![
            record("s1a-iw1-slc-vv-20200103t170815-001", "a.EOF"),
            record("s1a-iw1-slc-vv-20200115t170815-001", "b.EOF"),
            record("s1a-iw1-slc-vv-20200301t170815-001", "c.EOF"),
        ];
        let connected: HashSet<NaiveDate> = [d(2020, 1, 3), d(2020, 1, 15)].into_iter().collect();
        let dropped = drop_unconnected(&mut records, &connected);
        assert_eq!(records.len(), 2);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].date().unwrap(), d(2020, 3, 1));
    }

    #[test]
    fn test_pair_manifest_round_trip_with_unit_tokens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("intf.in");
        let pairs = vec![
            Pair::new(d(2020, 1, 3), d(2020, 1, 15)),
            Pair::new(d(2020, 1, 15), d(2020, 1, 27)),
        ];
        write_pair_manifest(&path, &pairs, SubswathId::F3).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("S1_20200103_ALL_F3:S1_20200115_ALL_F3"));

        let read = read_pair_manifest(&path).unwrap();
        assert_eq!(read, pairs);
    }

    #[test]
    fn test_update_batch_config_rewrites_and_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_tops.config");
        fs::write(&path, "proc_stage = 1\nmaster_image = none\nother = keep\n").unwrap();

        update_batch_config(
            &path,
            &[
                ("proc_stage", "2".to_string()),
                ("filter_wavelength", "200".to_string()),
            ],
        )
        .unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("proc_stage = 2"));
        assert!(text.contains("other = keep"));
        assert!(text.contains("filter_wavelength = 200"));
        assert!(!text.contains("proc_stage = 1"));
    }
}
