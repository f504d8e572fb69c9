//! Search indexer
//!
//! Holds a per-process index over all completed jobs and answers exact and
//! semantic entity queries. Readers proceed concurrently under a read-write
//! lock; the writer (after the indexing stage) briefly blocks readers while
//! swapping in the new per-job rows. The whole index is rebuildable from the
//! store's completed jobs plus their persisted entity maps.
//!
//! Semantic matching uses the optional [`Embedder`] capability; when no
//! embedder is available the query degrades to normalized-token Jaccard
//! overlap and stays well-defined.

pub mod embed;

use chrono::{DateTime, Utc};
use entity_index_common::normalize::normalize_label;
use entity_index_common::{EntitySummary, Job, JobStatus};
use entity_index_core::Embedder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One indexed `(video, label)` tuple
#[derive(Debug, Clone)]
pub struct IndexRow {
    pub label: String,
    pub presence: f64,
    pub appearances: usize,
}

/// Per-job index entry
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub video_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub duration_sec: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub rows: Vec<IndexRow>,
}

/// Search query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    /// Cosine floor for the semantic pass, clamped to [0.5, 1.0]
    pub similarity: f64,
    pub min_presence: f64,
    pub min_frames: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            q: String::new(),
            similarity: 0.7,
            min_presence: 0.0,
            min_frames: 0,
        }
    }
}

/// A matched entity inside one video
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchMatch {
    pub label: String,
    pub presence: f64,
    pub frames: usize,
}

/// Per-video search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub video_id: String,
    pub filename: String,
    pub status: JobStatus,
    pub duration_sec: Option<f64>,
    pub matched_entities: Vec<SearchMatch>,
}

/// A semantically similar label with its score
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimilarEntity {
    pub label: String,
    pub similarity: f64,
}

/// Full query response
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub exact_matches_count: usize,
    pub ai_enhancements_count: usize,
    pub total_unique_videos: usize,
    pub similar_entities: Vec<SimilarEntity>,
    pub results: Vec<SearchResult>,
}

impl SearchResponse {
    fn empty() -> Self {
        Self {
            exact_matches_count: 0,
            ai_enhancements_count: 0,
            total_unique_videos: 0,
            similar_entities: Vec::new(),
            results: Vec::new(),
        }
    }
}

/// The per-process search index
pub struct SearchIndex {
    entries: RwLock<BTreeMap<String, JobEntry>>,
    embedder: Option<Mutex<Box<dyn Embedder>>>,
    /// Label -> dense embedding, populated lazily
    label_vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl SearchIndex {
    #[must_use]
    pub fn new(embedder: Option<Box<dyn Embedder>>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            embedder: embedder.map(Mutex::new),
            label_vectors: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild from scratch out of the store's completed jobs
    pub fn rebuild(&self, jobs: &[Job]) {
        let mut fresh = BTreeMap::new();
        for job in jobs {
            if job.status != JobStatus::Completed {
                continue;
            }
            match entry_from_job(job) {
                Some(entry) => {
                    fresh.insert(job.video_id.clone(), entry);
                }
                None => warn!("Job {} has no parseable entity map, skipping", job.video_id),
            }
        }
        let count = fresh.len();
        *write_lock(&self.entries) = fresh;
        info!("Search index rebuilt over {count} completed jobs");
    }

    /// Swap in the rows for one newly completed job
    pub fn upsert_job(&self, job: &Job, entities: &BTreeMap<String, EntitySummary>) {
        let entry = JobEntry {
            video_id: job.video_id.clone(),
            filename: job.filename.clone(),
            status: job.status,
            duration_sec: job.duration_sec,
            created_at: job.created_at,
            rows: rows_from_entities(entities),
        };
        write_lock(&self.entries).insert(job.video_id.clone(), entry);
        debug!("Search index updated for job {}", job.video_id);
    }

    /// Drop a deleted job's rows
    pub fn remove_job(&self, video_id: &str) {
        write_lock(&self.entries).remove(video_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answer a query: exact substring pass, semantic pass, filters, ranking
    pub fn query(&self, params: &SearchQuery) -> SearchResponse {
        let Some(needle) = normalize_label(&params.q) else {
            return SearchResponse::empty();
        };
        let similarity_floor = params.similarity.clamp(0.5, 1.0);

        // Distinct labels currently in the index
        let all_labels: Vec<String> = {
            let entries = read_lock(&self.entries);
            let mut labels: HashSet<String> = HashSet::new();
            for entry in entries.values() {
                for row in &entry.rows {
                    labels.insert(row.label.clone());
                }
            }
            labels.into_iter().collect()
        };

        // Semantic pass over distinct labels
        let mut similar: Vec<SimilarEntity> = Vec::new();
        for label in &all_labels {
            let score = self.label_similarity(&needle, label);
            if score >= similarity_floor {
                similar.push(SimilarEntity {
                    label: label.clone(),
                    similarity: entity_index_common::round4(score),
                });
            }
        }
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });
        let similar_labels: HashSet<&str> = similar.iter().map(|s| s.label.as_str()).collect();

        // Per-job matching with the presence/frames filters
        let mut exact_labels: HashSet<String> = HashSet::new();
        let mut results = Vec::new();
        {
            let entries = read_lock(&self.entries);
            for entry in entries.values() {
                let mut matched = Vec::new();
                for row in &entry.rows {
                    let exact = row.label.contains(&needle);
                    let semantic = similar_labels.contains(row.label.as_str());
                    if !exact && !semantic {
                        continue;
                    }
                    if row.presence < params.min_presence || row.appearances < params.min_frames {
                        continue;
                    }
                    if exact {
                        exact_labels.insert(row.label.clone());
                    }
                    matched.push(SearchMatch {
                        label: row.label.clone(),
                        presence: row.presence,
                        frames: row.appearances,
                    });
                }
                if !matched.is_empty() {
                    matched.sort_by(|a, b| {
                        b.presence
                            .partial_cmp(&a.presence)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.label.cmp(&b.label))
                    });
                    results.push(SearchResult {
                        video_id: entry.video_id.clone(),
                        filename: entry.filename.clone(),
                        status: entry.status,
                        duration_sec: entry.duration_sec,
                        matched_entities: matched,
                    });
                }
            }
        }

        let ai_enhancements_count = similar
            .iter()
            .filter(|s| !exact_labels.contains(&s.label))
            .count();

        SearchResponse {
            exact_matches_count: exact_labels.len(),
            ai_enhancements_count,
            total_unique_videos: results.len(),
            similar_entities: similar,
            results,
        }
    }

    /// Cosine similarity through the embedder, or token Jaccard fallback
    fn label_similarity(&self, query: &str, label: &str) -> f64 {
        match &self.embedder {
            Some(embedder) => {
                let query_vec = self.embedding_for(embedder, query);
                let label_vec = self.embedding_for(embedder, label);
                match (query_vec, label_vec) {
                    (Some(a), Some(b)) => f64::from(cosine(&a, &b)),
                    _ => jaccard(query, label),
                }
            }
            None => jaccard(query, label),
        }
    }

    fn embedding_for(&self, embedder: &Mutex<Box<dyn Embedder>>, text: &str) -> Option<Vec<f32>> {
        if let Some(cached) = read_lock(&self.label_vectors).get(text) {
            return Some(cached.clone());
        }
        let vector = match embedder.lock() {
            Ok(mut guard) => guard.embed(text),
            Err(_) => return None,
        };
        match vector {
            Ok(v) => {
                write_lock(&self.label_vectors).insert(text.to_string(), v.clone());
                Some(v)
            }
            Err(e) => {
                warn!("Embedding failed for '{text}': {e}");
                None
            }
        }
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rows_from_entities(entities: &BTreeMap<String, EntitySummary>) -> Vec<IndexRow> {
    entities
        .iter()
        .map(|(label, summary)| IndexRow {
            label: label.clone(),
            presence: summary.presence,
            appearances: summary.appearances,
        })
        .collect()
}

fn entry_from_job(job: &Job) -> Option<JobEntry> {
    let entities_json = job.entities_json.as_deref()?;
    let entities: BTreeMap<String, EntitySummary> = serde_json::from_str(entities_json).ok()?;
    Some(JobEntry {
        video_id: job.video_id.clone(),
        filename: job.filename.clone(),
        status: job.status,
        duration_sec: job.duration_sec,
        created_at: job.created_at,
        rows: rows_from_entities(&entities),
    })
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

/// Normalized-token Jaccard overlap, the embedder-less fallback
fn jaccard(a: &str, b: &str) -> f64 {
    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }
    let intersection = tokens_a.intersection(&tokens_b).count();
    let union = tokens_a.union(&tokens_b).count();
    intersection as f64 / union as f64
}
