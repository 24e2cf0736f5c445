//! Episodic search backends
//!
//! [`EpisodicBackend`] is the seam between the store and its index. The
//! linear backend scans every entry; the HNSW backend in [`super::hnsw`]
//! answers from an approximate index. Both return exact cosine scores so the
//! store behaves the same regardless of which one it runs on.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::ports::cosine_similarity;

use super::types::EpisodicEntry;

/// Storage and nearest-neighbour contract shared by all episodic backends
pub trait EpisodicBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Store a new entry. Fails if the id is already present.
    fn insert(&self, entry: EpisodicEntry) -> Result<()>;

    fn get(&self, id: &Uuid) -> Option<EpisodicEntry>;

    /// Up to `limit` embedded entries most similar to `query`, with their
    /// cosine similarity, best first.
    fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&str>,
    ) -> Result<Vec<(EpisodicEntry, f32)>>;

    /// Entries in insertion-time order (timestamp, then insertion sequence)
    fn list(&self, session: Option<&str>) -> Vec<EpisodicEntry>;

    /// Flag entries as consolidated; returns how many changed state
    fn mark_consolidated(&self, ids: &[Uuid]) -> usize;

    /// Physically remove entries older than `cutoff`
    fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct LinearInner {
    entries: Vec<EpisodicEntry>,
    index: HashMap<Uuid, usize>,
}

impl LinearInner {
    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
    }
}

/// O(n) in-memory scan. Suitable for tests and small sessions.
#[derive(Default)]
pub struct LinearBackend {
    inner: RwLock<LinearInner>,
}

impl LinearBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EpisodicBackend for LinearBackend {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn insert(&self, entry: EpisodicEntry) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.index.contains_key(&entry.id) {
            return Err(MemoryError::Validation(format!(
                "episodic entry {} already exists",
                entry.id
            )));
        }
        let idx = inner.entries.len();
        inner.index.insert(entry.id, idx);
        inner.entries.push(entry);
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Option<EpisodicEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.index.get(id).map(|&i| inner.entries[i].clone())
    }

    fn nearest(
        &self,
        query: &[f32],
        limit: usize,
        session: Option<&str>,
    ) -> Result<Vec<(EpisodicEntry, f32)>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut scored: Vec<(EpisodicEntry, f32)> = inner
            .entries
            .iter()
            .filter(|e| session.is_none_or(|s| e.session_id == s))
            .filter_map(|e| {
                e.embedding
                    .as_deref()
                    .map(|v| (e.clone(), cosine_similarity(query, v)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    fn list(&self, session: Option<&str>) -> Vec<EpisodicEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<EpisodicEntry> = inner
            .entries
            .iter()
            .filter(|e| session.is_none_or(|s| e.session_id == s))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps
        out.sort_by_key(|e| e.timestamp);
        out
    }

    fn mark_consolidated(&self, ids: &[Uuid]) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut changed = 0;
        for id in ids {
            if let Some(&i) = inner.index.get(id) {
                let entry = &mut inner.entries[i];
                if !entry.consolidated {
                    entry.consolidated = true;
                    changed += 1;
                }
            }
        }
        changed
    }

    fn remove_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.entries.len();
        inner.entries.retain(|e| e.timestamp >= cutoff);
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.reindex();
        }
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodic::types::Role;

    fn entry(session: &str, content: &str, embedding: Vec<f32>) -> EpisodicEntry {
        let mut e = EpisodicEntry::new(session, Role::User, content);
        e.embedding = Some(embedding);
        e
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let backend = LinearBackend::new();
        let e = entry("s", "a", vec![1.0, 0.0]);
        backend.insert(e.clone()).unwrap();
        assert!(backend.insert(e).is_err());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_nearest_orders_by_similarity_and_filters_session() {
        let backend = LinearBackend::new();
        backend.insert(entry("s1", "x", vec![1.0, 0.0])).unwrap();
        backend.insert(entry("s1", "y", vec![0.6, 0.8])).unwrap();
        backend.insert(entry("s2", "z", vec![1.0, 0.0])).unwrap();
        backend
            .insert(EpisodicEntry::new("s1", Role::User, "no embedding"))
            .unwrap();

        let hits = backend.nearest(&[1.0, 0.0], 10, Some("s1")).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0.content, "x");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_remove_before_reindexes() {
        let backend = LinearBackend::new();
        let now = Utc::now();
        let old = entry("s", "old", vec![1.0]).with_timestamp(now - chrono::Duration::days(10));
        let new = entry("s", "new", vec![1.0]).with_timestamp(now);
        let new_id = new.id;
        backend.insert(old).unwrap();
        backend.insert(new).unwrap();

        assert_eq!(backend.remove_before(now - chrono::Duration::days(1)).unwrap(), 1);
        assert_eq!(backend.get(&new_id).unwrap().content, "new");
        assert_eq!(backend.mark_consolidated(&[new_id]), 1);
        assert_eq!(backend.mark_consolidated(&[new_id]), 0);
    }
}
