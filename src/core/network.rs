//! Baseline network construction: master ranking, threshold-based pair
//! generation, interactive edge editing, and connectivity pruning.

use crate::types::{InsarError, InsarResult, Pair};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

/// One input scene, positioned by its temporal and perpendicular
/// baselines relative to the table's reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionNode {
    pub scene_id: String,
    pub date: NaiveDate,
    /// Days relative to the earliest scene in the table.
    pub temporal: f64,
    /// Meters relative to the reference viewing geometry.
    pub perpendicular: f64,
}

/// An undirected candidate pair, stored as node indices with `a < b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkEdge {
    pub a: usize,
    pub b: usize,
}

impl NetworkEdge {
    pub fn new(a: usize, b: usize) -> Self {
        if a < b {
            NetworkEdge { a, b }
        } else {
            NetworkEdge { a: b, b: a }
        }
    }
}

/// Relative weights of the two baseline magnitudes in master fitness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    /// Per day of temporal baseline.
    pub temporal: f64,
    /// Per meter of perpendicular baseline.
    pub perpendicular: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        RankingWeights {
            temporal: 1.0,
            perpendicular: 1.0,
        }
    }
}

/// The node set plus edge set for one processing-unit family.
///
/// A plain value object: ranking, edge generation and pruning are
/// functions over it, and the interactive editor mutates a session copy
/// of the edge set rather than the network observing its presentation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Network {
    nodes: Vec<AcquisitionNode>,
    edges: BTreeSet<NetworkEdge>,
}

impl Network {
    pub fn new(nodes: Vec<AcquisitionNode>) -> Self {
        Network {
            nodes,
            edges: BTreeSet::new(),
        }
    }

    /// Parses a whitespace-separated baseline table.
    ///
    /// Each record carries the scene token in column 0 (date embedded as
    /// its second `_` field) and the perpendicular baseline in column 4.
    /// Temporal baselines are taken relative to the earliest scene.
    pub fn from_baseline_table(path: &Path) -> InsarResult<Self> {
        let text = fs::read_to_string(path)?;
        let mut raw: Vec<(String, NaiveDate, f64)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 {
                return Err(InsarError::InvalidFormat(format!(
                    "baseline table record has {} columns, expected 5: {}",
                    cols.len(),
                    line
                )));
            }
            let scene_id = cols[0].to_string();
            let date_field = scene_id.split('_').nth(1).ok_or_else(|| {
                InsarError::InvalidFormat(format!("no date field in scene token: {}", scene_id))
            })?;
            let date = NaiveDate::parse_from_str(date_field, "%Y%m%d").map_err(|e| {
                InsarError::InvalidFormat(format!("bad date in {}: {}", scene_id, e))
            })?;
            let perpendicular: f64 = cols[4].parse().map_err(|e| {
                InsarError::InvalidFormat(format!("bad perpendicular baseline in {}: {}", line, e))
            })?;
            raw.push((scene_id, date, perpendicular));
        }

        let reference = raw
            .iter()
            .map(|(_, date, _)| *date)
            .min()
            .ok_or_else(|| InsarError::InvalidFormat("empty baseline table".to_string()))?;

        let nodes = raw
            .into_iter()
            .map(|(scene_id, date, perpendicular)| AcquisitionNode {
                scene_id,
                date,
                temporal: (date - reference).num_days() as f64,
                perpendicular,
            })
            .collect();
        Ok(Network::new(nodes))
    }

    pub fn nodes(&self) -> &[AcquisitionNode] {
        &self.nodes
    }

    pub fn edges(&self) -> impl Iterator<Item = NetworkEdge> + '_ {
        self.edges.iter().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Ranks master candidates: central scenes (small magnitude of both
    /// baselines) rank best. Returns node indices, best first; ties fall
    /// back to the scene identifier so the order is total.
    pub fn rank_masters(&self, weights: RankingWeights) -> Vec<usize> {
        let fitness = |i: usize| {
            let n = &self.nodes[i];
            weights.temporal * n.temporal.abs() + weights.perpendicular * n.perpendicular.abs()
        };
        let mut ranked: Vec<usize> = (0..self.nodes.len()).collect();
        ranked.sort_by(|&a, &b| {
            fitness(a)
                .partial_cmp(&fitness(b))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.nodes[a].scene_id.cmp(&self.nodes[b].scene_id))
        });
        ranked
    }

    /// Replaces the edge set with every pair within the inclusive
    /// perpendicular (`p_meters`) and temporal (`t_days`) bounds.
    ///
    /// An all-pairs scan; node counts are tens to low hundreds, so no
    /// spatial index is warranted.
    pub fn generate_edges(&mut self, p_meters: f64, t_days: f64) {
        self.edges.clear();
        for a in 0..self.nodes.len() {
            for b in (a + 1)..self.nodes.len() {
                let dp = (self.nodes[a].perpendicular - self.nodes[b].perpendicular).abs();
                let dt = (self.nodes[a].temporal - self.nodes[b].temporal).abs();
                if dp <= p_meters && dt <= t_days {
                    self.edges.insert(NetworkEdge::new(a, b));
                }
            }
        }
        log::info!(
            "generated {} pairs from {} scenes (perp <= {} m, temporal <= {} days)",
            self.edges.len(),
            self.nodes.len(),
            p_meters,
            t_days
        );
    }

    /// Adds one edge; self-loops and out-of-range indices are rejected.
    pub fn add_edge(&mut self, a: usize, b: usize) -> InsarResult<()> {
        if a == b {
            return Err(InsarError::InvalidFormat(
                "a pair must connect two distinct scenes".to_string(),
            ));
        }
        if a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(InsarError::InvalidFormat(format!(
                "scene index out of range: {}-{}",
                a, b
            )));
        }
        self.edges.insert(NetworkEdge::new(a, b));
        Ok(())
    }

    pub fn remove_edge(&mut self, a: usize, b: usize) {
        self.edges.remove(&NetworkEdge::new(a, b));
    }

    pub fn degree(&self, node: usize) -> usize {
        self.edges.iter().filter(|e| e.a == node || e.b == node).count()
    }

    /// Dates of every scene that takes part in at least one pair; scenes
    /// outside this set are dropped from the alignment manifest (but not
    /// from the network itself).
    pub fn connected_dates(&self) -> HashSet<NaiveDate> {
        self.edges
            .iter()
            .flat_map(|e| [self.nodes[e.a].date, self.nodes[e.b].date])
            .collect()
    }

    /// Degree-0 nodes, for logging as "unconnected image".
    pub fn unconnected(&self) -> Vec<&AcquisitionNode> {
        (0..self.nodes.len())
            .filter(|&i| self.degree(i) == 0)
            .map(|i| &self.nodes[i])
            .collect()
    }

    /// The edge set as date pairs, early-first, in manifest order.
    pub fn pairs(&self) -> Vec<Pair> {
        let mut pairs: Vec<Pair> = self
            .edges
            .iter()
            .map(|e| Pair::new(self.nodes[e.a].date, self.nodes[e.b].date))
            .collect();
        pairs.sort();
        pairs.dedup();
        pairs
    }
}

/// Cached master ranking, valid only for the exact scene set it was
/// computed from. A mismatch is a cache miss, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRanking {
    /// Scene identifiers the ranking was computed over.
    pub scene_ids: BTreeSet<String>,
    /// Scene identifiers, best master first.
    pub ranked: Vec<String>,
}

impl MasterRanking {
    pub fn compute(network: &Network, weights: RankingWeights) -> Self {
        let ranked = network
            .rank_masters(weights)
            .into_iter()
            .map(|i| network.nodes()[i].scene_id.clone())
            .collect();
        MasterRanking {
            scene_ids: network.nodes().iter().map(|n| n.scene_id.clone()).collect(),
            ranked,
        }
    }

    /// Loads a previously stored ranking; `None` when absent or unreadable.
    pub fn load(path: &Path) -> Option<Self> {
        let text = fs::read_to_string(path).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn store(&self, path: &Path) -> InsarResult<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn is_valid_for(&self, network: &Network) -> bool {
        let current: BTreeSet<String> =
            network.nodes().iter().map(|n| n.scene_id.clone()).collect();
        self.scene_ids == current
    }

    /// The default selection: the best-ranked scene's date.
    pub fn default_master(&self) -> InsarResult<NaiveDate> {
        let best = self.ranked.first().ok_or_else(|| {
            InsarError::MissingPrerequisite("master ranking is empty".to_string())
        })?;
        let field = best.split('_').nth(1).ok_or_else(|| {
            InsarError::InvalidFormat(format!("no date field in scene token: {}", best))
        })?;
        NaiveDate::parse_from_str(field, "%Y%m%d")
            .map_err(|e| InsarError::InvalidFormat(format!("bad date in {}: {}", best, e)))
    }
}

/// The decision seam between the core and whatever drives it: given the
/// generated network, finalize the edge set (interactively or not).
pub trait PairSelector {
    fn select(&self, network: &mut Network) -> InsarResult<()>;
}

/// Non-interactive selector: keeps exactly the threshold-generated edges.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdSelector {
    pub perpendicular_m: f64,
    pub temporal_days: f64,
}

impl PairSelector for ThresholdSelector {
    fn select(&self, network: &mut Network) -> InsarResult<()> {
        network.generate_edges(self.perpendicular_m, self.temporal_days);
        Ok(())
    }
}

/// One manual editing session over a network's edge set.
///
/// Edits accumulate on a copy; closing the session either applies them
/// or discards them, and the caller must ask the user which when the
/// edits actually changed something.
pub struct EditSession {
    baseline: BTreeSet<NetworkEdge>,
    working: Network,
}

impl EditSession {
    pub fn open(network: &Network) -> Self {
        EditSession {
            baseline: network.edges().collect(),
            working: network.clone(),
        }
    }

    pub fn add_edge(&mut self, a: usize, b: usize) -> InsarResult<()> {
        self.working.add_edge(a, b)
    }

    pub fn remove_edge(&mut self, a: usize, b: usize) {
        self.working.remove_edge(a, b);
    }

    pub fn network(&self) -> &Network {
        &self.working
    }

    /// Whether closing this session requires a keep/discard decision.
    pub fn is_dirty(&self) -> bool {
        self.baseline != self.working.edges().collect()
    }

    /// Applies the session's edits to the live network.
    pub fn apply(self, network: &mut Network) {
        *network = self.working;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, date: (i32, u32, u32), temporal: f64, perpendicular: f64) -> AcquisitionNode {
        AcquisitionNode {
            scene_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            temporal,
            perpendicular,
        }
    }

    fn three_scene_network() -> Network {
        Network::new(vec![
            node("S1_20200101_ALL_F2", (2020, 1, 1), 0.0, 0.0),
            node("S1_20200220_ALL_F2", (2020, 2, 20), 50.0, 80.0),
            node("S1_20200430_ALL_F2", (2020, 4, 30), 120.0, 250.0),
        ])
    }

    #[test]
    fn test_edge_generation_respects_both_thresholds() {
        let mut net = three_scene_network();
        net.generate_edges(100.0, 60.0);
        let edges: Vec<NetworkEdge> = net.edges().collect();
        assert_eq!(edges, vec![NetworkEdge::new(0, 1)]);
        for e in edges {
            let dp = (net.nodes()[e.a].perpendicular - net.nodes()[e.b].perpendicular).abs();
            let dt = (net.nodes()[e.a].temporal - net.nodes()[e.b].temporal).abs();
            assert!(dp <= 100.0 && dt <= 60.0);
        }
    }

    #[test]
    fn test_unconnected_node_is_reported_but_kept() {
        let mut net = three_scene_network();
        net.generate_edges(100.0, 60.0);
        assert_eq!(net.degree(0), 1);
        assert_eq!(net.degree(1), 1);
        assert_eq!(net.degree(2), 0);
        let unconnected = net.unconnected();
        assert_eq!(unconnected.len(), 1);
        assert_eq!(unconnected[0].scene_id, "S1_20200430_ALL_F2");
        // The node stays in the network; only the manifest drops it.
        assert_eq!(net.nodes().len(), 3);
        assert!(!net
            .connected_dates()
            .contains(&NaiveDate::from_ymd_opt(2020, 4, 30).unwrap()));
    }

    #[test]
    fn test_thresholds_are_inclusive() {
        let mut net = Network::new(vec![
            node("S1_20200101_ALL_F1", (2020, 1, 1), 0.0, 0.0),
            node("S1_20200301_ALL_F1", (2020, 3, 1), 60.0, 100.0),
        ]);
        net.generate_edges(100.0, 60.0);
        assert_eq!(net.edge_count(), 1);
        net.generate_edges(99.9, 60.0);
        assert_eq!(net.edge_count(), 0);
    }

    #[test]
    fn test_ranking_prefers_central_scenes() {
        let net = three_scene_network();
        let ranked = net.rank_masters(RankingWeights::default());
        assert_eq!(ranked, vec![0, 1, 2]);
    }

    #[test]
    fn test_ranking_ties_break_on_scene_id() {
        let net = Network::new(vec![
            node("S1_20200113_ALL_F1", (2020, 1, 13), 12.0, 30.0),
            node("S1_20200101_ALL_F1", (2020, 1, 1), 30.0, 12.0),
        ]);
        let ranked = net.rank_masters(RankingWeights::default());
        // Equal fitness; the lexically smaller scene id wins.
        assert_eq!(ranked, vec![1, 0]);
    }

    #[test]
    fn test_baseline_table_parsing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("baseline_table.dat");
        fs::write(
            &path,
            "S1_20200103_ALL_F2 2020003.5 100 0.0 12.5\n\
             S1_20200115_ALL_F2 2020015.5 112 0.0 -40.0\n",
        )
        .unwrap();
        let net = Network::from_baseline_table(&path).unwrap();
        assert_eq!(net.nodes().len(), 2);
        approx::assert_relative_eq!(net.nodes()[0].temporal, 0.0);
        approx::assert_relative_eq!(net.nodes()[1].temporal, 12.0);
        approx::assert_relative_eq!(net.nodes()[1].perpendicular, -40.0);
    }

    #[test]
    fn test_ranking_cache_validity_is_scene_set_equality() {
        let net = three_scene_network();
        let ranking = MasterRanking::compute(&net, RankingWeights::default());
        assert!(ranking.is_valid_for(&net));
        assert_eq!(
            ranking.default_master().unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );

        let grown = Network::new(
            net.nodes()
                .iter()
                .cloned()
                .chain([node("S1_20200512_ALL_F2", (2020, 5, 12), 132.0, 10.0)])
                .collect(),
        );
        assert!(!ranking.is_valid_for(&grown));
    }

    #[test]
    fn test_ranking_cache_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("master_ranking.json");
        let net = three_scene_network();
        let ranking = MasterRanking::compute(&net, RankingWeights::default());
        ranking.store(&path).unwrap();
        let loaded = MasterRanking::load(&path).unwrap();
        assert_eq!(loaded.ranked, ranking.ranked);
        assert!(loaded.is_valid_for(&net));
        assert!(MasterRanking::load(&dir.path().join("absent.json")).is_none());
    }

    #[test]
    fn test_edit_session_keep_and_discard() {
        let mut net = three_scene_network();
        net.generate_edges(100.0, 60.0);

        let mut session = EditSession::open(&net);
        assert!(!session.is_dirty());
        session.add_edge(1, 2).unwrap();
        assert!(session.is_dirty());

        // Discarding is just dropping the session.
        drop(session);
        assert_eq!(net.edge_count(), 1);

        let mut session = EditSession::open(&net);
        session.add_edge(1, 2).unwrap();
        session.apply(&mut net);
        assert_eq!(net.edge_count(), 2);
        assert_eq!(net.degree(2), 1);
    }

    #[test]
    fn test_self_loops_are_rejected() {
        let mut net = three_scene_network();
        assert!(net.add_edge(1, 1).is_err());
        assert!(net.add_edge(0, 7).is_err());
    }

    #[test]
    fn test_pairs_are_date_ordered_and_unique() {
        let mut net = three_scene_network();
        net.generate_edges(1000.0, 1000.0);
        let pairs = net.pairs();
        assert_eq!(pairs.len(), 3);
        for p in &pairs {
            assert!(p.early < p.late);
        }
    }
}
