//! HNSW-accelerated episodic backend (usearch)
//!
//! Entries live in a concurrent map; embedded entries are also added to a
//! usearch index under a monotonically increasing u64 key. Searches read the
//! index concurrently, while inserts and removals take the index write lock.
//! Writers always lock the index before touching the entry map.
//! The index only proposes candidates: scores are recomputed exactly, and a
//! filtered search that comes back short falls back to a full scan. A key
//! without an entry behind it is ignored, so a vector the index failed to
//! drop never resurfaces.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};
use uuid::Uuid;

use crate::config::HnswConfig;
use crate::error::{MemoryError, Result};
use crate::ports::cosine_similarity;

use super::backend::EpisodicBackend;
use super::types::EpisodicEntry;

struct Slot {
    key: u64,
    entry: EpisodicEntry,
    indexed: bool,
}

/// Approximate nearest-neighbour backend
pub struct HnswBackend {
    index: RwLock<Index>,
    dimensions: usize,
    oversample: usize,
    slots: DashMap<Uuid, Slot>,
    key_to_id: DashMap<u64, Uuid>,
    next_key: AtomicU64,
    indexed: AtomicUsize,
}

impl HnswBackend {
    pub fn new(dimensions: usize, config: &HnswConfig) -> Result<Self> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index = Index::new(&options)
            .map_err(|e| MemoryError::Storage(format!("index creation failed: {e}")))?;

        Ok(Self {
            index: RwLock::new(index),
            dimensions,
            oversample: config.oversample.max(1),
            slots: DashMap::new(),
            key_to_id: DashMap::new(),
            next_key: AtomicU64::new(0),
            indexed: AtomicUsize::new(0),
        })
    }

    /// Number of vectors currently in the ANN index
    pub fn indexed(&self) -> usize {
        self.indexed.load(Ordering::SeqCst)
    }

    fn exact_scan(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&str>,
    ) -> Vec<(u64, EpisodicEntry, f32)> {
        let mut scored: Vec<(u64, EpisodicEntry, f32)> = self
            .slots
            .iter()
            .filter(|s| session.is_none_or(|sid| s.entry.session_id == sid))
            .filter_map(|s| {
                s.entry
                    .embedding
                    .as_deref()
                    .map(|v| (s.key, s.entry.clone(), cosine_similarity(query, v)))
            })
            .collect();
        sort_scored(&mut scored);
        scored.truncate(limit);
        scored
    }
}

fn sort_scored(scored: &mut [(u64, EpisodicEntry, f32)]) {
    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
}

impl EpisodicBackend for HnswBackend {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn insert(&self, entry: EpisodicEntry) -> Result<()> {
        if let Some(vector) = entry.embedding.as_deref() {
            if vector.len() != self.dimensions {
                return Err(MemoryError::Validation(format!(
                    "embedding has {} dimensions, index expects {}",
                    vector.len(),
                    self.dimensions
                )));
            }
        }

        let index = entry
            .embedding
            .is_some()
            .then(|| self.index.write().unwrap_or_else(PoisonError::into_inner));
        // The vacant entry holds its shard until the slot is filled
        let vacant = match self.slots.entry(entry.id) {
            Entry::Occupied(_) => {
                return Err(MemoryError::Validation(format!(
                    "episodic entry {} already exists",
                    entry.id
                )));
            }
            Entry::Vacant(vacant) => vacant,
        };

        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let indexed = match (index, entry.embedding.as_deref()) {
            (Some(index), Some(vector)) => {
                // usearch requires reserve() before add()
                let capacity = index.capacity();
                if index.size() >= capacity {
                    index
                        .reserve(std::cmp::max(capacity * 2, 16))
                        .map_err(|e| MemoryError::Storage(format!("failed to reserve capacity: {e}")))?;
                }
                index
                    .add(key, vector)
                    .map_err(|e| MemoryError::Storage(format!("failed to add vector: {e}")))?;
                self.indexed.fetch_add(1, Ordering::SeqCst);
                true
            }
            _ => false,
        };

        self.key_to_id.insert(key, entry.id);
        vacant.insert(Slot {
            key,
            entry,
            indexed,
        });
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Option<EpisodicEntry> {
        self.slots.get(id).map(|s| s.entry.clone())
    }

    fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&str>,
    ) -> Result<Vec<(EpisodicEntry, f32)>> {
        if limit == 0 || query.len() != self.dimensions {
            return Ok(Vec::new());
        }

        if self.indexed() == 0 {
            return Ok(Vec::new());
        }

        let (size, fetch, matches) = {
            let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
            let size = index.size();
            let fetch = limit.saturating_mul(self.oversample).min(size);
            let matches = index
                .search(query, fetch)
                .map_err(|e| MemoryError::Storage(format!("search failed: {e}")))?;
            (size, fetch, matches)
        };

        let mut scored: Vec<(u64, EpisodicEntry, f32)> = matches
            .keys
            .iter()
            .filter_map(|key| {
                let id = *self.key_to_id.get(key)?;
                let slot = self.slots.get(&id)?;
                if session.is_some_and(|s| slot.entry.session_id != s) {
                    return None;
                }
                let vector = slot.entry.embedding.as_deref()?;
                Some((slot.key, slot.entry.clone(), cosine_similarity(query, vector)))
            })
            .collect();

        if scored.len() < limit && fetch < size {
            debug!(
                "HNSW returned {} of {} filtered hits, falling back to exact scan",
                scored.len(),
                limit
            );
            scored = self.exact_scan(query, limit, session);
        } else {
            sort_scored(&mut scored);
            scored.truncate(limit);
        }

        Ok(scored.into_iter().map(|(_, e, s)| (e, s)).collect())
    }

    fn list(&self, session: Option<&str>) -> Vec<EpisodicEntry> {
        let mut out: Vec<(u64, EpisodicEntry)> = self
            .slots
            .iter()
            .filter(|s| session.is_none_or(|sid| s.entry.session_id == sid))
            .map(|s| (s.key, s.entry.clone()))
            .collect();
        out.sort_by(|a, b| a.1.timestamp.cmp(&b.1.timestamp).then(a.0.cmp(&b.0)));
        out.into_iter().map(|(_, e)| e).collect()
    }

    fn mark_consolidated(&self, ids: &[Uuid]) -> usize {
        let mut changed = 0;
        for id in ids {
            if let Some(mut slot) = self.slots.get_mut(id) {
                if !slot.entry.consolidated {
                    slot.entry.consolidated = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Uuid> = self
            .slots
            .iter()
            .filter(|s| s.entry.timestamp < cutoff)
            .map(|s| s.entry.id)
            .collect();

        let index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for id in expired {
            let Some((_, slot)) = self.slots.remove(&id) else {
                continue;
            };
            self.key_to_id.remove(&slot.key);
            removed += 1;
            if slot.indexed {
                self.indexed.fetch_sub(1, Ordering::SeqCst);
                if let Err(e) = index.remove(slot.key) {
                    warn!("Vector {} of removed entry {} stays in the index: {}", slot.key, id, e);
                }
            }
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::types::Role;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[hot % dims] = 1.0;
        v
    }

    fn backend(dims: usize) -> HnswBackend {
        HnswBackend::new(dims, &HnswConfig::default()).unwrap()
    }

    #[test]
    fn test_add_and_search() {
        let backend = backend(8);
        for i in 0..5 {
            let mut e = EpisodicEntry::new("s", Role::User, format!("entry {i}"));
            e.embedding = Some(unit(8, i));
            backend.insert(e).unwrap();
        }
        assert_eq!(backend.indexed(), 5);

        let hits = backend.nearest(&unit(8, 3), 1, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "entry 3");
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_capacity_grows_past_initial_reserve() {
        let backend = backend(4);
        for i in 0..40 {
            let mut e = EpisodicEntry::new("s", Role::User, format!("{i}"));
            e.embedding = Some(vec![1.0, i as f32, 0.5, 0.25]);
            backend.insert(e).unwrap();
        }
        assert_eq!(backend.indexed(), 40);
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        let backend = backend(4);
        let mut e = EpisodicEntry::new("s", Role::User, "x");
        e.embedding = Some(vec![1.0; 3]);
        assert!(matches!(backend.insert(e), Err(MemoryError::Validation(_))));
        assert!(backend.is_empty());
    }

    #[test]
    fn test_filtered_search_falls_back_to_exact() {
        let backend = backend(4);
        // Many close neighbours in s1, a single far entry in s2
        for _ in 0..30 {
            let mut e = EpisodicEntry::new("s1", Role::User, "near");
            e.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
            backend.insert(e).unwrap();
        }
        let mut far = EpisodicEntry::new("s2", Role::User, "far");
        far.embedding = Some(vec![0.0, 0.0, 0.0, 1.0]);
        backend.insert(far).unwrap();

        let hits = backend.nearest(&[1.0, 0.0, 0.0, 0.0], 1, Some("s2")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "far");
    }

    #[test]
    fn test_concurrent_duplicate_insert_admits_one() {
        let backend = backend(4);
        let mut entry = EpisodicEntry::new("s", Role::User, "racy");
        entry.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);

        let results: Vec<Result<()>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let entry = entry.clone();
                    let backend = &backend;
                    scope.spawn(move || backend.insert(entry))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.indexed(), 1);
        assert_eq!(backend.key_to_id.len(), 1);
    }

    #[test]
    fn test_indexed_counts_only_embedded_entries() {
        let backend = backend(4);
        backend.insert(EpisodicEntry::new("s", Role::User, "plain")).unwrap();
        let mut embedded = EpisodicEntry::new("s", Role::User, "vector");
        embedded.embedding = Some(vec![0.0, 1.0, 0.0, 0.0]);
        backend.insert(embedded).unwrap();
        assert_eq!((backend.len(), backend.indexed()), (2, 1));
    }

    #[test]
    fn test_remove_before_drops_vectors() {
        let backend = backend(4);
        let now = Utc::now();
        let mut old = EpisodicEntry::new("s", Role::User, "old")
            .with_timestamp(now - chrono::Duration::days(30));
        old.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        backend.insert(old).unwrap();
        backend
            .insert(EpisodicEntry::new("s", Role::User, "plain").with_timestamp(now))
            .unwrap();

        assert_eq!(backend.remove_before(now - chrono::Duration::days(1)).unwrap(), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.indexed(), 0);
        assert!(backend.nearest(&[1.0, 0.0, 0.0, 0.0], 5, None).unwrap().is_empty());
    }
}
