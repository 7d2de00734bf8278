use crate::domain::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Inverted-file index over unit-normalized template embeddings.
///
/// Entries are clustered into `nlist` cells with k-means; a query scores the
/// `nprobe` closest cells exhaustively. Raising `nprobe` trades speed for
/// recall, and `nprobe >= nlist` degenerates into an exact scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvfConfig {
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
    #[serde(default = "default_kmeans_iterations")]
    pub kmeans_iterations: usize,
}

fn default_nlist() -> usize {
    16
}

fn default_nprobe() -> usize {
    4
}

fn default_kmeans_iterations() -> usize {
    10
}

impl Default for IvfConfig {
    fn default() -> Self {
        Self {
            nlist: default_nlist(),
            nprobe: default_nprobe(),
            kmeans_iterations: default_kmeans_iterations(),
        }
    }
}

#[derive(Debug, Clone)]
struct IvfEntry {
    id: i64,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IvfHit {
    pub id: i64,
    pub similarity: f32,
}

/// Immutable once built. Inserting produces a new index, which lets the
/// catalog publish it as part of a fresh snapshot.
#[derive(Debug, Clone)]
pub struct IvfIndex {
    config: IvfConfig,
    dims: Option<usize>,
    centroids: Vec<Vec<f32>>,
    posting_lists: Vec<Vec<IvfEntry>>,
    count: usize,
}

impl IvfIndex {
    pub fn empty(config: IvfConfig) -> Self {
        Self {
            config,
            dims: None,
            centroids: Vec::new(),
            posting_lists: Vec::new(),
            count: 0,
        }
    }

    /// Trains centroids over `entries` and assigns every entry to its cell.
    /// Entries are sorted by id first so the same input always yields the
    /// same partition.
    pub fn build(config: IvfConfig, entries: &[(i64, Vec<f32>)]) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::empty(config));
        }

        let dims = entries[0].1.len();
        if dims == 0 {
            return Err(AppError::Embedding("Empty embedding vector".to_string()));
        }

        let mut sorted: Vec<IvfEntry> = Vec::with_capacity(entries.len());
        for (id, vector) in entries {
            if vector.len() != dims {
                return Err(AppError::Embedding(format!(
                    "Embedding for template {} has {} dimensions, index expects {}",
                    id,
                    vector.len(),
                    dims
                )));
            }
            sorted.push(IvfEntry {
                id: *id,
                vector: normalize(vector),
            });
        }
        sorted.sort_by_key(|e| e.id);
        sorted.dedup_by_key(|e| e.id);

        let data: Vec<&[f32]> = sorted.iter().map(|e| e.vector.as_slice()).collect();
        let centroids = train_centroids(&data, config.nlist.max(1), config.kmeans_iterations);

        let mut posting_lists: Vec<Vec<IvfEntry>> = vec![Vec::new(); centroids.len()];
        let count = sorted.len();
        for entry in sorted {
            let cell = nearest_centroid(&centroids, &entry.vector);
            posting_lists[cell].push(entry);
        }

        Ok(Self {
            config,
            dims: Some(dims),
            centroids,
            posting_lists,
            count,
        })
    }

    /// Returns a rebuilt index containing every current entry plus `(id, vector)`.
    pub fn with_entry(&self, id: i64, vector: &[f32]) -> Result<Self> {
        let mut entries = self.entries();
        entries.retain(|(existing, _)| *existing != id);
        entries.push((id, vector.to_vec()));
        Self::build(self.config, &entries)
    }

    fn entries(&self) -> Vec<(i64, Vec<f32>)> {
        self.posting_lists
            .iter()
            .flatten()
            .map(|e| (e.id, e.vector.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn config(&self) -> IvfConfig {
        self.config
    }

    pub fn cell_occupancy(&self) -> Vec<usize> {
        self.posting_lists.iter().map(|list| list.len()).collect()
    }

    /// Top-`k` entries by cosine similarity, highest first, ties broken by
    /// lower id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<IvfHit>> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if let Some(dims) = self.dims {
            if query.len() != dims {
                return Err(AppError::Embedding(format!(
                    "Query embedding has {} dimensions, index expects {}",
                    query.len(),
                    dims
                )));
            }
        }

        let query = normalize(query);

        let mut cells: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(&query, c)))
            .collect();
        cells.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let nprobe = self.config.nprobe.max(1).min(cells.len());
        let mut hits: Vec<IvfHit> = cells
            .iter()
            .take(nprobe)
            .flat_map(|(cell, _)| self.posting_lists[*cell].iter())
            .map(|entry| IvfHit {
                id: entry.id,
                similarity: dot(&query, &entry.vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = dot(vector, vector).sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::MIN;
    for (i, c) in centroids.iter().enumerate() {
        let score = dot(vector, c);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

/// Spherical k-means: centroids are renormalized after each update so
/// assignment by dot product equals assignment by cosine.
fn train_centroids(data: &[&[f32]], k: usize, max_iters: usize) -> Vec<Vec<f32>> {
    if data.is_empty() {
        return Vec::new();
    }

    let n = data.len();
    let d = data[0].len();
    let actual_k = k.min(n);

    let mut centroids: Vec<Vec<f32>> = (0..actual_k)
        .map(|i| data[i * n / actual_k].to_vec())
        .collect();

    let mut assignments = vec![usize::MAX; n];

    for _ in 0..max_iters.max(1) {
        let mut changed = false;
        for (i, point) in data.iter().enumerate() {
            let best = nearest_centroid(&centroids, point);
            if assignments[i] != best {
                assignments[i] = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0_f32; d]; actual_k];
        let mut counts = vec![0usize; actual_k];
        for (i, point) in data.iter().enumerate() {
            let cluster = assignments[i];
            counts[cluster] += 1;
            for (j, &v) in point.iter().enumerate() {
                sums[cluster][j] += v;
            }
        }
        for c in 0..actual_k {
            // Empty clusters keep their previous centroid.
            if counts[c] > 0 {
                centroids[c] = normalize(&sums[c]);
            }
        }
    }

    centroids
}
