//! Episodic -> semantic consolidation
//!
//! A pass reads the oldest unconsolidated entries of a session together with
//! the most recent current facts, asks the generation capability for graph
//! operations, normalises them and applies them. Each session has its own
//! async mutex, so at most one pass per session is analysing or applying at
//! any time. Entries are only marked consolidated after every operation of
//! their batch applied cleanly.
//!
//! When generation is unavailable and the batch contains recognisable
//! relationship statements, a pattern-extracted set of additions stands in
//! for the model's answer.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConsolidationConfig;
use crate::episodic::{EpisodicEntry, EpisodicStore};
use crate::error::{MemoryError, Result};
use crate::ports::{GenerationOptions, GenerationPort};
use crate::semantic::{FactUpdate, RegexExtractor, SemanticFact, SemanticGraphStore};

use super::prompts::{build_prompt, parse_operations};
use super::types::{
    ApplyStats, ConsolidationMode, ConsolidationOperation, ConsolidationReport, ConsolidationState,
};

/// Entity type given to entities created by consolidation
const AUTO_ENTITY_TYPE: &str = "concept";

/// Confidence given to facts found by pattern extraction
const PATTERN_CONFIDENCE: f32 = 0.6;

pub struct ConsolidationEngine {
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticGraphStore>,
    generator: Arc<dyn GenerationPort>,
    settings: RwLock<ConsolidationConfig>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    states: DashMap<String, ConsolidationState>,
}

impl ConsolidationEngine {
    pub fn new(
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticGraphStore>,
        generator: Arc<dyn GenerationPort>,
        config: ConsolidationConfig,
    ) -> Self {
        Self {
            episodic,
            semantic,
            generator,
            settings: RwLock::new(config),
            locks: DashMap::new(),
            states: DashMap::new(),
        }
    }

    /// Current settings
    pub fn settings(&self) -> ConsolidationConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change the background interval, batch size or model.
    /// `None` leaves a setting unchanged.
    pub fn configure(
        &self,
        interval: Option<Duration>,
        batch_size: Option<usize>,
        model: Option<String>,
    ) -> Result<()> {
        if let Some(interval) = interval {
            if interval.as_secs() == 0 {
                return Err(MemoryError::Validation(
                    "consolidation interval must be at least one second".to_string(),
                ));
            }
        }
        if batch_size == Some(0) {
            return Err(MemoryError::Validation(
                "batch size must be at least 1".to_string(),
            ));
        }
        if model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            return Err(MemoryError::Validation(
                "model name must not be empty".to_string(),
            ));
        }

        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(interval) = interval {
            settings.interval_secs = interval.as_secs();
        }
        if let Some(batch_size) = batch_size {
            settings.batch_size = batch_size;
        }
        if let Some(model) = model {
            settings.model = model;
        }
        info!(
            "Consolidation configured: interval={}s batch_size={} model={}",
            settings.interval_secs, settings.batch_size, settings.model
        );
        Ok(())
    }

    pub fn state(&self, session_id: &str) -> ConsolidationState {
        self.states
            .get(session_id)
            .map(|s| *s)
            .unwrap_or(ConsolidationState::Idle)
    }

    /// Sessions with unconsolidated entries, most recently active first
    pub fn pending_sessions(&self) -> Vec<String> {
        self.episodic.sessions_with_unconsolidated()
    }

    /// Unconsolidated entries across all sessions
    pub fn pending_entries(&self) -> usize {
        self.episodic.count_unconsolidated(None)
    }

    fn set_state(&self, session_id: &str, state: ConsolidationState) {
        debug!("Consolidation state for {}: {:?}", session_id, state);
        if state == ConsolidationState::Idle {
            self.states.remove(session_id);
        } else {
            self.states.insert(session_id.to_string(), state);
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the session's mutex once nobody else holds or waits on it
    fn release_session(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Sessions with a live mutex or a non-idle state
    pub fn tracked_sessions(&self) -> usize {
        self.locks.len().max(self.states.len())
    }

    /// Run consolidation for a session.
    ///
    /// `Immediate` and `Manual` wait for a running pass to finish;
    /// `Background` returns a skipped report instead.
    pub async fn consolidate(
        &self,
        session_id: &str,
        mode: ConsolidationMode,
    ) -> Result<ConsolidationReport> {
        let result = self.consolidate_session(session_id, mode).await;
        self.release_session(session_id);
        result
    }

    async fn consolidate_session(
        &self,
        session_id: &str,
        mode: ConsolidationMode,
    ) -> Result<ConsolidationReport> {
        let batch_size = self.settings().batch_size;

        match mode {
            ConsolidationMode::Background => {
                let pending = self.episodic.count_unconsolidated(Some(session_id));
                if pending < batch_size {
                    return Ok(ConsolidationReport::skipped(
                        session_id,
                        mode,
                        format!("{pending} pending entries, threshold is {batch_size}"),
                    ));
                }
                let lock = self.session_lock(session_id);
                let Ok(_guard) = lock.try_lock() else {
                    debug!("Session {} busy, dropping background trigger", session_id);
                    return Ok(ConsolidationReport::skipped(session_id, mode, "session busy"));
                };
                self.run_locked(session_id, mode, 1).await
            }
            ConsolidationMode::Manual => {
                let lock = self.session_lock(session_id);
                let _guard = lock.lock().await;
                self.run_locked(session_id, mode, 1).await
            }
            ConsolidationMode::Immediate => {
                let lock = self.session_lock(session_id);
                let _guard = lock.lock().await;
                self.run_locked(session_id, mode, usize::MAX).await
            }
        }
    }

    /// One batch if the session is idle, `None` if it is busy. Used by the daemon.
    pub async fn consolidate_if_idle(&self, session_id: &str) -> Result<Option<ConsolidationReport>> {
        let result = {
            let lock = self.session_lock(session_id);
            match lock.try_lock() {
                Ok(_guard) => self
                    .run_locked(session_id, ConsolidationMode::Background, 1)
                    .await
                    .map(Some),
                Err(_) => Ok(None),
            }
        };
        self.release_session(session_id);
        result
    }

    async fn run_locked(
        &self,
        session_id: &str,
        mode: ConsolidationMode,
        max_batches: usize,
    ) -> Result<ConsolidationReport> {
        let started = Instant::now();
        let mut report = ConsolidationReport::new(session_id, mode);
        let result = self.run_batches(session_id, max_batches, &mut report).await;
        self.set_state(session_id, ConsolidationState::Idle);
        report.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                if report.batches > 0 {
                    info!(
                        "Consolidated session {}: {} entries, {} added, {} updated, {} deleted, {} skipped",
                        session_id,
                        report.entries_processed,
                        report.stats.added,
                        report.stats.updated,
                        report.stats.deleted,
                        report.stats.skipped
                    );
                }
                Ok(report)
            }
            Err(e) => {
                warn!(
                    "Consolidation of session {} failed after {} batches, entries left pending: {}",
                    session_id, report.batches, e
                );
                Err(e)
            }
        }
    }

    async fn run_batches(
        &self,
        session_id: &str,
        max_batches: usize,
        report: &mut ConsolidationReport,
    ) -> Result<()> {
        let settings = self.settings();

        while report.batches < max_batches {
            let batch = self.episodic.unconsolidated(session_id, settings.batch_size);
            if batch.is_empty() {
                if report.batches == 0 {
                    report
                        .operations
                        .push(ConsolidationOperation::noop("no unconsolidated entries"));
                    report.stats.noops += 1;
                }
                break;
            }

            self.set_state(session_id, ConsolidationState::Analyzing);
            let facts = self.semantic.recent_facts(settings.max_prompt_facts).await;
            let proposed = self.analyze(&batch, &facts).await?;
            let (operations, dropped) = self.normalize(proposed, settings.min_confidence).await;

            self.set_state(session_id, ConsolidationState::Applying);
            let mut stats = self.apply(&operations).await?;
            stats.skipped += dropped;

            let ids: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
            self.episodic.mark_processed(&ids);

            report.batches += 1;
            report.entries_processed += batch.len();
            report.stats.merge(stats);
            report.operations.extend(operations);
        }
        Ok(())
    }

    /// Ask the generation capability for operations over a batch
    pub async fn analyze(
        &self,
        entries: &[EpisodicEntry],
        facts: &[SemanticFact],
    ) -> Result<Vec<ConsolidationOperation>> {
        let settings = self.settings();
        let prompt = build_prompt(entries, facts);
        let options = GenerationOptions {
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            model: Some(settings.model.clone()),
        };

        let response = match self.generator.generate(&prompt, options).await {
            Ok(response) => response,
            Err(e @ MemoryError::GenerationParse(_)) => return Err(e),
            Err(other) => {
                if settings.extraction_fallback {
                    let extracted = extract_operations(entries);
                    if !extracted.is_empty() {
                        warn!(
                            "Generation failed ({}), using {} pattern-extracted operations",
                            other,
                            extracted.len()
                        );
                        return Ok(extracted);
                    }
                }
                return Err(MemoryError::Consolidation(format!(
                    "generation failed: {other}"
                )));
            }
        };
        debug!("Consolidation response: {}", response);

        parse_operations(&response)
    }

    /// Validate and de-conflict a batch of operations against the graph.
    ///
    /// Returns the operations to apply and how many were dropped.
    pub async fn normalize(
        &self,
        operations: Vec<ConsolidationOperation>,
        min_confidence: f32,
    ) -> (Vec<ConsolidationOperation>, usize) {
        let mut dropped = 0;

        // Confidence gate
        let gated: Vec<ConsolidationOperation> = operations
            .into_iter()
            .filter(|op| match op.confidence() {
                Some(c) if !(0.0..=1.0).contains(&c) || c < min_confidence => {
                    debug!("Dropping low-confidence operation: {}", op);
                    dropped += 1;
                    false
                }
                _ => true,
            })
            .collect();

        // Delete wins over Add/Update on the same fact
        let deleted: HashSet<(String, String, String)> = gated
            .iter()
            .filter(|op| matches!(op, ConsolidationOperation::Delete { .. }))
            .filter_map(ConsolidationOperation::key)
            .collect();

        // Duplicate Adds collapse to the most confident one
        let mut best_add: HashMap<(String, String, String), f32> = HashMap::new();
        for op in &gated {
            if let (ConsolidationOperation::Add { confidence, .. }, Some(key)) = (op, op.key()) {
                let best = best_add.entry(key).or_insert(*confidence);
                *best = best.max(*confidence);
            }
        }

        // One mutation per fact and one supersession per (subject, relationship)
        let mut claimed: HashSet<(String, String, String)> = HashSet::new();
        let mut superseded: HashSet<(String, String)> = HashSet::new();
        let mut out = Vec::with_capacity(gated.len());

        for op in gated {
            let Some(key) = op.key() else {
                out.push(op);
                continue;
            };
            let is_delete = matches!(op, ConsolidationOperation::Delete { .. });
            if !is_delete && deleted.contains(&key) {
                debug!("Delete wins over {}", op);
                dropped += 1;
                continue;
            }
            if let ConsolidationOperation::Add { confidence, .. } = &op {
                if best_add.get(&key).is_some_and(|best| *confidence < *best) {
                    dropped += 1;
                    continue;
                }
            }

            let resolved = self.resolve_against_graph(op).await;
            if resolved.is_noop() {
                out.push(resolved);
                continue;
            }
            let is_update = matches!(resolved, ConsolidationOperation::Update { .. });
            if !claimed.insert(key.clone())
                || (is_update && !superseded.insert((key.0, key.1)))
            {
                debug!("Dropping duplicate {}", resolved);
                dropped += 1;
                continue;
            }
            out.push(resolved);
        }

        (out, dropped)
    }

    /// Rewrite an operation according to what the graph currently holds
    async fn resolve_against_graph(&self, op: ConsolidationOperation) -> ConsolidationOperation {
        match op {
            ConsolidationOperation::Add {
                subject,
                relationship,
                object,
                confidence,
                reason,
            } => {
                if self.find_current(&subject, &relationship, &object).await.is_some() {
                    ConsolidationOperation::noop(format!(
                        "already known: {subject} {relationship} {object}"
                    ))
                } else {
                    ConsolidationOperation::Add {
                        subject,
                        relationship,
                        object,
                        confidence,
                        reason,
                    }
                }
            }
            ConsolidationOperation::Update {
                subject,
                relationship,
                object,
                new_confidence,
                reason,
            } => {
                let exact = self.find_current(&subject, &relationship, &object).await;
                let any = self.semantic.current_for(&subject, &relationship).await;
                match exact {
                    Some(fact) if (fact.confidence - new_confidence).abs() < f32::EPSILON => {
                        ConsolidationOperation::noop(format!(
                            "unchanged: {subject} {relationship} {object}"
                        ))
                    }
                    None if any.len() != 1 => ConsolidationOperation::Add {
                        subject,
                        relationship,
                        object,
                        confidence: new_confidence,
                        reason,
                    },
                    _ => ConsolidationOperation::Update {
                        subject,
                        relationship,
                        object,
                        new_confidence,
                        reason,
                    },
                }
            }
            ConsolidationOperation::Delete {
                subject,
                relationship,
                object,
                reason,
            } => {
                if self.find_current(&subject, &relationship, &object).await.is_none() {
                    ConsolidationOperation::noop(format!(
                        "nothing to delete: {subject} {relationship} {object}"
                    ))
                } else {
                    ConsolidationOperation::Delete {
                        subject,
                        relationship,
                        object,
                        reason,
                    }
                }
            }
            noop @ ConsolidationOperation::Noop { .. } => noop,
        }
    }

    async fn find_current(
        &self,
        subject: &str,
        relationship: &str,
        object: &str,
    ) -> Option<SemanticFact> {
        self.semantic
            .current_for(subject, relationship)
            .await
            .into_iter()
            .find(|f| f.object.eq_ignore_ascii_case(object))
    }

    /// Apply operations to the graph in order, stopping at the first one the
    /// graph rejects. Operations applied before the failure stay applied; a
    /// retry of the same batch resolves them to no-ops.
    pub async fn apply(&self, operations: &[ConsolidationOperation]) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();
        for op in operations {
            match self.apply_one(op).await {
                Ok(Applied::Added) => stats.added += 1,
                Ok(Applied::Updated) => stats.updated += 1,
                Ok(Applied::Deleted) => stats.deleted += 1,
                Ok(Applied::Nothing) => stats.noops += 1,
                Err(e) => {
                    warn!("Failed to apply {}: {}", op, e);
                    return Err(MemoryError::Consolidation(format!(
                        "failed to apply {op}: {e}"
                    )));
                }
            }
        }
        Ok(stats)
    }

    async fn apply_one(&self, op: &ConsolidationOperation) -> Result<Applied> {
        match op {
            ConsolidationOperation::Add {
                subject,
                relationship,
                object,
                confidence,
                reason,
            } => {
                if self.find_current(subject, relationship, object).await.is_some() {
                    return Ok(Applied::Nothing);
                }
                self.add_fact(subject, relationship, object, *confidence, reason)
                    .await?;
                Ok(Applied::Added)
            }
            ConsolidationOperation::Update {
                subject,
                relationship,
                object,
                new_confidence,
                ..
            } => {
                let target = match self.find_current(subject, relationship, object).await {
                    Some(fact) => Some(fact),
                    None => {
                        let mut current = self.semantic.current_for(subject, relationship).await;
                        if current.len() == 1 { current.pop() } else { None }
                    }
                };
                let Some(target) = target else {
                    return Ok(Applied::Nothing);
                };
                if self.semantic.now() <= target.event_time_start {
                    return Err(MemoryError::Validation(format!(
                        "fact {} started at {} and cannot be superseded at the same instant",
                        target.id, target.event_time_start
                    )));
                }
                let object = self.semantic.ensure_entity(object, AUTO_ENTITY_TYPE).await?;
                self.semantic
                    .update_fact(
                        &target.id,
                        FactUpdate {
                            object: Some(object),
                            confidence: Some(*new_confidence),
                            effective_at: None,
                        },
                    )
                    .await?;
                Ok(Applied::Updated)
            }
            ConsolidationOperation::Delete {
                subject,
                relationship,
                object,
                ..
            } => match self.find_current(subject, relationship, object).await {
                Some(fact) => {
                    self.semantic.delete_fact(&fact.id, None).await?;
                    Ok(Applied::Deleted)
                }
                None => Ok(Applied::Nothing),
            },
            ConsolidationOperation::Noop { .. } => Ok(Applied::Nothing),
        }
    }

    async fn add_fact(
        &self,
        subject: &str,
        relationship: &str,
        object: &str,
        confidence: f32,
        reason: &str,
    ) -> Result<Uuid> {
        let subject = self.semantic.ensure_entity(subject, AUTO_ENTITY_TYPE).await?;
        let object = self.semantic.ensure_entity(object, AUTO_ENTITY_TYPE).await?;
        let mut fact = SemanticFact::new(subject, relationship, object, confidence, self.semantic.now())
            .with_metadata("source", serde_json::json!("consolidation"));
        if !reason.is_empty() {
            fact = fact.with_metadata("reason", serde_json::json!(reason));
        }
        self.semantic.add_fact(fact).await
    }
}

/// Additions for every relationship statement the pattern extractor finds
fn extract_operations(entries: &[EpisodicEntry]) -> Vec<ConsolidationOperation> {
    let Some(extractor) = RegexExtractor::shared() else {
        return Vec::new();
    };
    entries
        .iter()
        .flat_map(|entry| extractor.extract_relationships(&entry.content))
        .map(|rel| ConsolidationOperation::Add {
            subject: rel.subject,
            relationship: rel.relationship,
            object: rel.object,
            confidence: PATTERN_CONFIDENCE,
            reason: "pattern extraction".to_string(),
        })
        .collect()
}

enum Applied {
    Added,
    Updated,
    Deleted,
    Nothing,
}
