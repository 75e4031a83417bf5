//! Approximate nearest-neighbor index.
//!
//! A navigable small-world graph: every node links to up to `connectivity`
//! near neighbors (twice that after back-links) and search is a best-first
//! beam of width `expansion_search` from the first node. Small indexes are
//! scanned exhaustively instead, see [`IndexConfig::exact_search_limit`].

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, ChatResult};

/// Distance function. Smaller is closer for every metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    L2Squared,
    /// `1 - a·b`, for normalized embeddings
    InnerProduct,
    /// `1 - cos(a, b)`
    Cosine,
}

impl Metric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2Squared => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
            Metric::InnerProduct => 1.0 - dot(a, b),
            Metric::Cosine => {
                let norm = dot(a, a).sqrt() * dot(b, b).sqrt();
                if norm == 0.0 {
                    1.0
                } else {
                    1.0 - dot(a, b) / norm
                }
            }
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Index shape and the accuracy/latency knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimensions: usize,
    #[serde(default)]
    pub metric: Metric,
    /// Links per node. Higher means better recall, more memory and slower inserts.
    #[serde(default = "default_connectivity")]
    pub connectivity: usize,
    /// Beam width while inserting
    #[serde(default = "default_expansion")]
    pub expansion_add: usize,
    /// Beam width while searching. Higher means better recall, slower queries.
    #[serde(default = "default_expansion")]
    pub expansion_search: usize,
    /// At or below this many live records, search scans every record and is exact.
    #[serde(default = "default_exact_search_limit")]
    pub exact_search_limit: usize,
}

fn default_connectivity() -> usize {
    16
}

fn default_expansion() -> usize {
    64
}

fn default_exact_search_limit() -> usize {
    256
}

impl IndexConfig {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            metric: Metric::default(),
            connectivity: default_connectivity(),
            expansion_add: default_expansion(),
            expansion_search: default_expansion(),
            exact_search_limit: default_exact_search_limit(),
        }
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    distance: f32,
    /// node position, which is insertion order
    node: usize,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Node {
    label: u64,
    vector: Vec<f32>,
    neighbors: Vec<usize>,
    live: bool,
}

/// Serialized form: live records in insertion order. The graph is rebuilt on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub config: IndexConfig,
    pub records: Vec<(u64, Vec<f32>)>,
}

/// Label → vector index.
///
/// Adding an existing label overwrites it: the old record is retired and the
/// new one takes a fresh insertion position. Once retired records outnumber
/// live ones the graph is rebuilt without them.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    config: IndexConfig,
    nodes: Vec<Node>,
    labels: HashMap<u64, usize>,
}

impl VectorIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            nodes: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, label: u64) -> bool {
        self.labels.contains_key(&label)
    }

    pub fn get(&self, label: u64) -> Option<&[f32]> {
        self.labels
            .get(&label)
            .map(|&node| self.nodes[node].vector.as_slice())
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.labels.clear();
    }

    pub fn check_dimensions(&self, vector: &[f32]) -> ChatResult<()> {
        if vector.len() != self.config.dimensions {
            return Err(ChatError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    pub fn add(&mut self, label: u64, vector: &[f32]) -> ChatResult<()> {
        self.check_dimensions(vector)?;

        if let Some(old) = self.labels.remove(&label) {
            tracing::debug!("overwriting vector for label {label}");
            self.nodes[old].live = false;
        }
        self.insert(label, vector.to_vec());

        if self.nodes.len() - self.len() > self.len() {
            self.compact();
        }
        Ok(())
    }

    /// Rebuild the graph from the live records, keeping their order.
    fn compact(&mut self) {
        let retired = self.nodes.len() - self.len();
        let records: Vec<(u64, Vec<f32>)> = std::mem::take(&mut self.nodes)
            .into_iter()
            .filter(|n| n.live)
            .map(|n| (n.label, n.vector))
            .collect();
        self.labels.clear();
        for (label, vector) in records {
            self.insert(label, vector);
        }
        tracing::debug!("compacted index, dropped {retired} retired nodes");
    }

    fn insert(&mut self, label: u64, vector: Vec<f32>) {
        let id = self.nodes.len();
        let neighbors = if self.nodes.is_empty() {
            Vec::new()
        } else {
            let ef = self.config.expansion_add.max(self.config.connectivity);
            self.beam_search(&vector, ef)
                .into_iter()
                .take(self.config.connectivity)
                .map(|s| s.node)
                .collect()
        };

        self.nodes.push(Node {
            label,
            vector,
            neighbors: neighbors.clone(),
            live: true,
        });
        self.labels.insert(label, id);

        for neighbor in neighbors {
            self.nodes[neighbor].neighbors.push(id);
            self.prune_links(neighbor);
        }
    }

    /// The `k` nearest live records as `(label, distance)`, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> ChatResult<Vec<(u64, f32)>> {
        self.check_dimensions(query)?;
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let scored: Vec<Scored> = if self.len() <= self.config.exact_search_limit {
            let mut all: Vec<Scored> = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.live)
                .map(|(node, n)| Scored {
                    distance: self.config.metric.distance(query, &n.vector),
                    node,
                })
                .collect();
            all.sort();
            all
        } else {
            // retired nodes still route traffic, so widen the beam by their count
            let retired = self.nodes.len() - self.len();
            let ef = self.config.expansion_search.max(k) + retired;
            self.beam_search(query, ef)
                .into_iter()
                .filter(|s| self.nodes[s.node].live)
                .collect()
        };

        Ok(scored
            .into_iter()
            .take(k)
            .map(|s| (self.nodes[s.node].label, s.distance))
            .collect())
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            config: self.config.clone(),
            records: self
                .nodes
                .iter()
                .filter(|n| n.live)
                .map(|n| (n.label, n.vector.clone()))
                .collect(),
        }
    }

    pub fn restore(snapshot: IndexSnapshot) -> ChatResult<Self> {
        let mut index = Self::new(snapshot.config);
        for (label, vector) in &snapshot.records {
            index.add(*label, vector)?;
        }
        Ok(index)
    }

    fn beam_search(&self, query: &[f32], ef: usize) -> Vec<Scored> {
        let Some(entry) = self.nodes.first() else {
            return Vec::new();
        };
        let start = Scored {
            distance: self.config.metric.distance(query, &entry.vector),
            node: 0,
        };
        let mut visited = HashSet::from([0usize]);
        let mut candidates = BinaryHeap::from([Reverse(start)]);
        let mut results = BinaryHeap::from([start]);

        while let Some(Reverse(current)) = candidates.pop() {
            let worst = results.peek().copied().unwrap_or(current);
            if results.len() >= ef && current > worst {
                break;
            }
            for &next in &self.nodes[current.node].neighbors {
                if !visited.insert(next) {
                    continue;
                }
                let scored = Scored {
                    distance: self.config.metric.distance(query, &self.nodes[next].vector),
                    node: next,
                };
                let admit = results.len() < ef || results.peek().map_or(true, |w| scored < *w);
                if admit {
                    candidates.push(Reverse(scored));
                    results.push(scored);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn prune_links(&mut self, node: usize) {
        let limit = self.config.connectivity * 2;
        if self.nodes[node].neighbors.len() <= limit {
            return;
        }
        let base = &self.nodes[node].vector;
        let mut scored: Vec<Scored> = self.nodes[node]
            .neighbors
            .iter()
            .map(|&n| Scored {
                distance: self.config.metric.distance(base, &self.nodes[n].vector),
                node: n,
            })
            .collect();
        scored.sort();
        scored.truncate(limit);
        self.nodes[node].neighbors = scored.into_iter().map(|s| s.node).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random vectors (xorshift)
    fn random_vectors(count: usize, dims: usize, mut seed: u64) -> Vec<Vec<f32>> {
        (0..count)
            .map(|_| {
                (0..dims)
                    .map(|_| {
                        seed ^= seed << 13;
                        seed ^= seed >> 7;
                        seed ^= seed << 17;
                        (seed % 10_000) as f32 / 10_000.0
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn search_finds_exact_match_at_zero() {
        let mut index = VectorIndex::new(IndexConfig::new(3));
        index.add(1, &[1.0, 0.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0, 0.0]).unwrap();

        let a = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(a, vec![(1, 0.0)]);
        let b = index.search(&[0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(b, vec![(2, 0.0)]);
    }

    #[test]
    fn results_ordered_ascending() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(10, &[3.0, 0.0]).unwrap();
        index.add(11, &[1.0, 0.0]).unwrap();
        index.add(12, &[2.0, 0.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 3).unwrap();
        let labels: Vec<u64> = results.iter().map(|r| r.0).collect();
        assert_eq!(labels, vec![11, 12, 10]);
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(7, &[1.0, 0.0]).unwrap();
        index.add(3, &[-1.0, 0.0]).unwrap();
        index.add(5, &[0.0, 1.0]).unwrap();

        let results = index.search(&[0.0, 0.0], 3).unwrap();
        let labels: Vec<u64> = results.iter().map(|r| r.0).collect();
        assert_eq!(labels, vec![7, 3, 5]);
    }

    #[test]
    fn fewer_results_than_k_only_when_index_small() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(1, &[0.0, 0.0]).unwrap();
        index.add(2, &[1.0, 1.0]).unwrap();
        assert_eq!(index.search(&[0.0, 0.0], 5).unwrap().len(), 2);
        assert!(index.search(&[0.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let mut index = VectorIndex::new(IndexConfig::new(3));
        let err = index.add(0, &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            ChatError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(index.is_empty());

        index.add(0, &[1.0, 0.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn existing_label_overwritten() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(1, &[0.0, 0.0]).unwrap();
        index.add(2, &[5.0, 5.0]).unwrap();
        index.add(1, &[9.0, 9.0]).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1), Some([9.0, 9.0].as_slice()));
        let results = index.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, 2);
        assert_eq!(results[1].0, 1);
    }

    #[test]
    fn repeated_overwrites_stay_bounded() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(2, &[5.0, 5.0]).unwrap();
        for i in 0..1_000 {
            index.add(1, &[i as f32, 0.0]).unwrap();
            assert!(index.nodes.len() <= 2 * index.len() + 1);
        }

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1), Some([999.0, 0.0].as_slice()));
        assert_eq!(index.search(&[5.0, 5.0], 1).unwrap(), vec![(2, 0.0)]);
    }

    #[test]
    fn graph_search_after_overwriting_every_label() {
        let config = IndexConfig {
            exact_search_limit: 0,
            ..IndexConfig::new(8)
        };
        let mut index = VectorIndex::new(config);
        for (label, v) in random_vectors(300, 8, 11).iter().enumerate() {
            index.add(label as u64, v).unwrap();
        }
        let fresh = random_vectors(300, 8, 12);
        for (label, v) in fresh.iter().enumerate() {
            index.add(label as u64, v).unwrap();
        }

        assert_eq!(index.len(), 300);
        assert!(index.nodes.len() <= 2 * index.len());
        let hits = fresh
            .iter()
            .enumerate()
            .filter(|(label, v)| index.search(v, 1).unwrap()[0].0 == *label as u64)
            .count();
        assert!(hits as f64 / fresh.len() as f64 >= 0.95, "recall {hits}/300");
    }

    #[test]
    fn clear_removes_everything() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(1, &[0.0, 0.0]).unwrap();
        index.clear();
        assert!(index.is_empty());
        assert!(!index.contains(1));
        assert!(index.search(&[0.0, 0.0], 1).unwrap().is_empty());
    }

    #[test]
    fn cosine_and_inner_product_metrics() {
        let cos = Metric::Cosine;
        assert!(cos.distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cos.distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cos.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);

        let ip = Metric::InnerProduct;
        assert!(ip.distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn graph_search_recalls_inserted_vectors() {
        let config = IndexConfig {
            exact_search_limit: 0,
            ..IndexConfig::new(8)
        };
        let mut index = VectorIndex::new(config);
        let vectors = random_vectors(400, 8, 0x9E37_79B9_7F4A_7C15);
        for (label, v) in vectors.iter().enumerate() {
            index.add(label as u64, v).unwrap();
        }

        let hits = vectors
            .iter()
            .enumerate()
            .filter(|(label, v)| index.search(v, 1).unwrap()[0].0 == *label as u64)
            .count();
        assert!(hits as f64 / vectors.len() as f64 >= 0.95, "recall {hits}/400");
    }

    #[test]
    fn graph_search_matches_exact_top_k_mostly() {
        let vectors = random_vectors(300, 6, 42);
        let mut approx = VectorIndex::new(IndexConfig {
            exact_search_limit: 0,
            ..IndexConfig::new(6)
        });
        let mut exact = VectorIndex::new(IndexConfig {
            exact_search_limit: usize::MAX,
            ..IndexConfig::new(6)
        });
        for (label, v) in vectors.iter().enumerate() {
            approx.add(label as u64, v).unwrap();
            exact.add(label as u64, v).unwrap();
        }

        let queries = random_vectors(20, 6, 7);
        let mut overlap = 0;
        for q in &queries {
            let a: HashSet<u64> = approx.search(q, 5).unwrap().into_iter().map(|r| r.0).collect();
            let e: HashSet<u64> = exact.search(q, 5).unwrap().into_iter().map(|r| r.0).collect();
            overlap += a.intersection(&e).count();
        }
        assert!(overlap as f64 / 100.0 >= 0.8, "overlap {overlap}/100");
    }

    #[test]
    fn snapshot_restores_same_results() {
        let mut index = VectorIndex::new(IndexConfig::new(2));
        index.add(4, &[1.0, 2.0]).unwrap();
        index.add(8, &[3.0, 4.0]).unwrap();
        index.add(4, &[0.5, 0.5]).unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.records.len(), 2);
        let restored = VectorIndex::restore(snapshot).unwrap();
        assert_eq!(
            restored.search(&[0.0, 0.0], 2).unwrap(),
            index.search(&[0.0, 0.0], 2).unwrap()
        );
    }
}
