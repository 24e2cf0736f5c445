//! Episodic memory: the verbatim interaction log
//!
//! The store embeds entries on the way in, delegates storage and similarity
//! search to a pluggable [`EpisodicBackend`], and applies temporal scoring on
//! the way out.

pub mod backend;
pub mod hnsw;
pub mod types;

pub use backend::{EpisodicBackend, LinearBackend};
pub use hnsw::HnswBackend;
pub use types::{EpisodicEntry, EpisodicHit, EpisodicQuery, Role};

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BackendKind, EpisodicConfig, HnswConfig};
use crate::error::{MemoryError, Result};
use crate::ports::{Clock, EmbeddingPort, StatePersistencePort};

/// Over-fetch factor when temporal boosting may reorder hits
const BOOST_FETCH_FACTOR: usize = 4;

/// Build the configured backend for a given embedding dimension
pub fn build_backend(
    kind: BackendKind,
    dimensions: usize,
    hnsw: &HnswConfig,
) -> Result<Arc<dyn EpisodicBackend>> {
    Ok(match kind {
        BackendKind::Linear => Arc::new(LinearBackend::new()),
        BackendKind::Hnsw => Arc::new(HnswBackend::new(dimensions, hnsw)?),
    })
}

/// Append-only interaction log with similarity search
pub struct EpisodicStore {
    backend: Arc<dyn EpisodicBackend>,
    embedder: Arc<dyn EmbeddingPort>,
    clock: Arc<dyn Clock>,
    config: EpisodicConfig,
}

impl EpisodicStore {
    pub fn new(
        backend: Arc<dyn EpisodicBackend>,
        embedder: Arc<dyn EmbeddingPort>,
        clock: Arc<dyn Clock>,
        config: EpisodicConfig,
    ) -> Self {
        debug!(
            "EpisodicStore using {} backend with {} embeddings",
            backend.name(),
            embedder.name()
        );
        Self {
            backend,
            embedder,
            clock,
            config,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Record an interaction stamped with the store's clock
    pub async fn record(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Uuid> {
        let entry = EpisodicEntry::new(session_id, role, content).with_timestamp(self.clock.now());
        self.add(entry).await
    }

    /// Store an entry, embedding its content when no vector is supplied.
    ///
    /// An embedding failure is not an error: the entry is kept without a
    /// vector and is only reachable through listing.
    pub async fn add(&self, mut entry: EpisodicEntry) -> Result<Uuid> {
        match entry.embedding.as_ref() {
            Some(v) if v.len() != self.embedder.dimensions() => {
                return Err(MemoryError::Validation(format!(
                    "embedding has {} dimensions, expected {}",
                    v.len(),
                    self.embedder.dimensions()
                )));
            }
            Some(_) => {}
            None => match self.embedder.embed(&entry.content).await {
                Ok(v) if v.len() == self.embedder.dimensions() => entry.embedding = Some(v),
                Ok(v) => warn!(
                    "Embedder returned {} dimensions for entry {}, storing without embedding",
                    v.len(),
                    entry.id
                ),
                Err(e) => warn!(
                    "Embedding failed for entry {}, storing without embedding: {}",
                    entry.id, e
                ),
            },
        }

        let id = entry.id;
        self.backend.insert(entry)?;
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<EpisodicEntry> {
        self.backend.get(id)
    }

    /// Ranked search.
    ///
    /// The relevance threshold is applied to the raw similarity, so boosting
    /// can reorder hits but never admit one that missed the threshold.
    pub async fn search(&self, query: &EpisodicQuery) -> Result<Vec<EpisodicHit>> {
        let limit = query.limit.unwrap_or(self.config.default_limit);
        let min_relevance = query.min_relevance.unwrap_or(self.config.min_relevance);
        if !(0.0..=1.0).contains(&min_relevance) {
            return Err(MemoryError::Validation(format!(
                "min_relevance must be within [0, 1], got {min_relevance}"
            )));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let session = query.session_id.as_deref();
        let scored: Vec<(EpisodicEntry, f32)> = match query.text.as_deref() {
            Some(text) => {
                let vector = match self.embedder.embed(text).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("Query embedding failed, returning no episodic hits: {}", e);
                        return Ok(Vec::new());
                    }
                };
                if vector.iter().all(|x| *x == 0.0) {
                    return Ok(Vec::new());
                }
                let fetch = if query.temporal_boost {
                    limit.saturating_mul(BOOST_FETCH_FACTOR)
                } else {
                    limit
                };
                self.backend
                    .nearest(&vector, fetch, session)?
                    .into_iter()
                    .map(|(e, sim)| (e, sim.max(0.0)))
                    .collect()
            }
            None => self
                .backend
                .list(session)
                .into_iter()
                .rev()
                .map(|e| (e, 1.0))
                .collect(),
        };

        let now = self.clock.now();
        let mut timelines: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();
        let mut hits = Vec::with_capacity(scored.len());

        for (entry, relevance) in scored {
            if relevance < min_relevance {
                continue;
            }
            let temporal = if query.temporal_boost {
                let timeline = timelines
                    .entry(entry.session_id.clone())
                    .or_insert_with(|| {
                        self.backend
                            .list(Some(&entry.session_id))
                            .into_iter()
                            .map(|e| e.timestamp)
                            .collect()
                    });
                self.temporal_factor(&entry, timeline, now)
            } else {
                1.0
            };
            hits.push(EpisodicHit {
                final_score: relevance * temporal,
                relevance,
                temporal,
                entry,
            });
        }

        hits.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.entry.timestamp.cmp(&a.entry.timestamp))
                .then(a.entry.id.cmp(&b.entry.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// `1 + λ·exp(-decay·age_days) + μ·frequency`
    fn temporal_factor(
        &self,
        entry: &EpisodicEntry,
        session_timeline: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> f32 {
        let age_days = ((now - entry.timestamp).num_seconds().max(0) as f32) / 86_400.0;
        let recency = (-self.config.decay_rate * age_days).exp();

        let window = chrono::Duration::hours(self.config.frequency_window_hours);
        let frequency = if session_timeline.len() > 1 {
            let within = session_timeline
                .iter()
                .filter(|t| (**t - entry.timestamp).abs() <= window)
                .count();
            // The entry itself is always inside its own window
            within.saturating_sub(1) as f32 / (session_timeline.len() - 1) as f32
        } else {
            0.0
        };

        1.0 + self.config.recency_weight * recency + self.config.frequency_weight * frequency
    }

    /// Flag entries as consolidated. Idempotent; returns how many changed.
    pub fn mark_processed(&self, ids: &[Uuid]) -> usize {
        let changed = self.backend.mark_consolidated(ids);
        debug!("Marked {} of {} episodic entries processed", changed, ids.len());
        changed
    }

    /// All entries, oldest first, optionally for one session
    pub fn export(&self, session_id: Option<&str>) -> Vec<EpisodicEntry> {
        self.backend.list(session_id)
    }

    /// Write every entry, embeddings included, as JSON under `key`
    pub async fn snapshot(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<()> {
        let entries = self.export(None);
        let bytes = serde_json::to_vec(&entries)?;
        persistence.set(key, &bytes).await?;
        info!(
            "Saved episodic snapshot: {} entries ({} bytes) under '{}'",
            entries.len(),
            bytes.len(),
            key
        );
        Ok(())
    }

    /// Load entries from the snapshot under `key`. Entries already present
    /// are kept as they are; stored vectors of the wrong dimension are
    /// recomputed. Returns false when no snapshot exists.
    pub async fn restore(&self, persistence: &dyn StatePersistencePort, key: &str) -> Result<bool> {
        let Some(bytes) = persistence.get(key).await? else {
            return Ok(false);
        };
        let entries: Vec<EpisodicEntry> = serde_json::from_slice(&bytes)?;
        let total = entries.len();
        let mut restored = 0;
        for mut entry in entries {
            if self.backend.get(&entry.id).is_some() {
                continue;
            }
            if entry
                .embedding
                .as_ref()
                .is_some_and(|v| v.len() != self.embedder.dimensions())
            {
                warn!("Discarding stale embedding of episodic entry {}", entry.id);
                entry.embedding = None;
            }
            self.add(entry).await?;
            restored += 1;
        }
        info!("Restored {} of {} episodic entries from '{}'", restored, total, key);
        Ok(true)
    }

    /// Delete entries older than `before`; the only deletion path
    pub fn apply_retention(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self.backend.remove_before(before)?;
        if removed > 0 {
            debug!("Retention removed {} episodic entries older than {}", removed, before);
        }
        Ok(removed)
    }

    /// Oldest-first unconsolidated entries of a session
    pub fn unconsolidated(&self, session_id: &str, limit: usize) -> Vec<EpisodicEntry> {
        self.backend
            .list(Some(session_id))
            .into_iter()
            .filter(|e| !e.consolidated)
            .take(limit)
            .collect()
    }

    pub fn count_unconsolidated(&self, session_id: Option<&str>) -> usize {
        self.backend
            .list(session_id)
            .iter()
            .filter(|e| !e.consolidated)
            .count()
    }

    /// Sessions with pending work, most recently active first
    pub fn sessions_with_unconsolidated(&self) -> Vec<String> {
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for entry in self.backend.list(None).into_iter().filter(|e| !e.consolidated) {
            latest
                .entry(entry.session_id)
                .and_modify(|t| *t = (*t).max(entry.timestamp))
                .or_insert(entry.timestamp);
        }
        let mut sessions: Vec<(String, DateTime<Utc>)> = latest.into_iter().collect();
        sessions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        sessions.into_iter().map(|(s, _)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }
}
