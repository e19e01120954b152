//! Transcript compaction with levels, rollback, and quality accounting.
//!
//! `compact` is pure with respect to the input transcript: the same
//! messages and options always select the same output subset, with ties
//! broken by original position and then content hash. System messages are
//! never dropped or reordered. Rollback snapshots live in an arena keyed
//! by opaque token and are swept opportunistically on access, never by a
//! background timer.

use crate::analyzer::content_hash;
use crate::config::{CompactionLevel, CompactionOptions, ContentTypeWeights, PreservationRule};
use crate::error::{CoreError, CoreResult};
use crate::scoring::{score_messages, ScoringOptions};
use crate::semantic;
use crate::threads::{self, thread_coherence};
use crate::tokenizer::Tokenizer;
use crate::types::{Adjustment, ConversationThread, Message, QualityMetrics};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SemanticMetrics {
    pub topics: Vec<String>,
    pub breakpoints: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadMetrics {
    pub thread_count: usize,
    pub preserved_threads: usize,
    pub avg_importance: f64,
    pub avg_coherence: f64,
}

/// Per-type message counts used for context preservation accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextCounts {
    pub code_blocks: usize,
    pub questions: usize,
    pub system_messages: usize,
    pub error_messages: usize,
    pub solutions: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextMetrics {
    pub original: ContextCounts,
    pub compacted: ContextCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompactionResult {
    pub messages: Vec<Message>,
    pub original_count: usize,
    /// Populated whenever level selection actually ran.
    pub selected_level: Option<CompactionLevel>,
    pub rollback_token: Option<String>,
    pub metrics: QualityMetrics,
    /// Populated when dynamic adjustment was enabled and examined the
    /// result; an empty vec means it ran and found nothing to correct.
    pub adjustments: Option<Vec<Adjustment>>,
    pub semantic_metrics: Option<SemanticMetrics>,
    pub thread_metrics: Option<ThreadMetrics>,
    pub context_metrics: Option<ContextMetrics>,
}

/// Utility comparison between an original and compacted transcript.
#[derive(Debug, Clone, Serialize)]
pub struct UtilityReport {
    pub questions_covered: f64,
    pub topic_continuity: f64,
    pub context_preservation: f64,
}

// ---------------------------------------------------------------------------
// Rollback registry
// ---------------------------------------------------------------------------

struct RollbackSlot {
    messages: Vec<Message>,
    created: Instant,
    created_at_ms: i64,
    ttl: Option<Duration>,
}

/// Arena of pre-compaction snapshots keyed by opaque token. Expired slots
/// are collected whenever the registry is queried.
#[derive(Default)]
pub struct RollbackRegistry {
    slots: Mutex<HashMap<String, RollbackSlot>>,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, messages: Vec<Message>, ttl: Option<Duration>) -> String {
        let token = Uuid::new_v4().to_string();
        let slot = RollbackSlot {
            messages,
            created: Instant::now(),
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            ttl,
        };
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).insert(token.clone(), slot);
        token
    }

    /// Restore the exact original transcript for an unexpired token. The
    /// returned messages are free-standing; the slot stays usable until it
    /// expires.
    pub fn rollback(&self, token: &str) -> CoreResult<Vec<Message>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(token) {
            None => Err(CoreError::NotFound(format!("rollback token {token}"))),
            Some(slot) => {
                if slot.ttl.is_some_and(|ttl| slot.created.elapsed() > ttl) {
                    slots.remove(token);
                    return Err(CoreError::Expired(format!("rollback token {token}")));
                }
                Ok(slot.messages.clone())
            }
        }
    }

    /// Live tokens with their creation times, sweeping expired slots first.
    pub fn history(&self) -> Vec<(String, i64)> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.retain(|_, slot| !slot.ttl.is_some_and(|ttl| slot.created.elapsed() > ttl));
        let mut entries: Vec<(String, i64)> =
            slots.iter().map(|(k, s)| (k.clone(), s.created_at_ms)).collect();
        entries.sort();
        entries
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CompactionEngine {
    tokenizer: Arc<dyn Tokenizer>,
    rollback: RollbackRegistry,
}

impl CompactionEngine {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer, rollback: RollbackRegistry::new() }
    }

    pub fn rollback(&self, token: &str) -> CoreResult<Vec<Message>> {
        self.rollback.rollback(token)
    }

    pub fn rollback_history(&self) -> Vec<(String, i64)> {
        self.rollback.history()
    }

    pub fn compact(
        &self,
        messages: &[Message],
        options: &CompactionOptions,
    ) -> CoreResult<CompactionResult> {
        options.validate()?;
        let started = Instant::now();

        // Empty transcript: empty output, metrics all zero.
        if messages.is_empty() {
            return Ok(CompactionResult {
                messages: Vec::new(),
                original_count: 0,
                selected_level: None,
                rollback_token: None,
                metrics: QualityMetrics::default(),
                adjustments: None,
                semantic_metrics: None,
                thread_metrics: None,
                context_metrics: None,
            });
        }

        let original = messages.to_vec();

        // Tiny transcripts pass through untouched.
        if messages.len() <= 3 {
            let metrics = self.quality_metrics(&original, &original, started);
            return Ok(self.finish(original.clone(), original, None, None, metrics, options));
        }

        let (level, level_was_selected) = self.select_level(messages, options);
        let retention = level.retention_rate();
        let target_keep =
            ((messages.len() as f64 * retention).round() as usize).clamp(1, messages.len());

        let scores = score_messages(
            messages,
            &ScoringOptions {
                weights: options.weights,
                current_context: options.current_context.clone(),
                ..Default::default()
            },
        )?;
        let weighted: Vec<f64> = scores
            .iter()
            .map(|s| {
                s.composite
                    * content_type_multiplier(
                        &messages[s.index],
                        options.content_type_weights.as_ref(),
                    )
            })
            .collect();

        let mut kept_indices = if options.use_threads {
            self.thread_based_selection(messages, target_keep, options)
        } else {
            self.score_based_selection(messages, &weighted, target_keep, options)
        };

        let mut adjustments: Option<Vec<Adjustment>> = None;
        if options.target_compression.is_some() && options.allow_dynamic_adjustment {
            let log = self.adjust_to_target(messages, &weighted, &mut kept_indices, options);
            adjustments = Some(log);
        }

        let compacted: Vec<Message> =
            kept_indices.iter().map(|&i| messages[i].clone()).collect();

        let metrics = self.quality_metrics(&original, &compacted, started);
        info!(
            original = original.len(),
            compacted = compacted.len(),
            level = ?level,
            compression = metrics.compression_ratio,
            "compaction complete"
        );

        let selected = level_was_selected.then_some(level);
        Ok(self.finish(original, compacted, selected, adjustments, metrics, options))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        original: Vec<Message>,
        compacted: Vec<Message>,
        selected_level: Option<CompactionLevel>,
        adjustments: Option<Vec<Adjustment>>,
        metrics: QualityMetrics,
        options: &CompactionOptions,
    ) -> CompactionResult {
        let rollback_token = options
            .enable_rollback
            .then(|| self.rollback.register(original.clone(), options.rollback_ttl));

        let semantic_metrics = options.include_semantic_metrics.then(|| SemanticMetrics {
            topics: semantic::identify_topics(&original),
            breakpoints: semantic::detect_breakpoints(&original),
        });

        let thread_metrics = options.include_thread_metrics.then(|| {
            let all = threads::identify_threads(&original);
            let kept_texts: HashSet<&str> =
                compacted.iter().map(|m| m.content.as_str()).collect();
            let preserved = all
                .iter()
                .filter(|t| {
                    t.message_indices
                        .iter()
                        .any(|&i| kept_texts.contains(original[i].content.as_str()))
                })
                .count();
            let n = all.len().max(1) as f64;
            ThreadMetrics {
                thread_count: all.len(),
                preserved_threads: preserved,
                avg_importance: all.iter().map(|t| t.importance).sum::<f64>() / n,
                avg_coherence: all.iter().map(|t| thread_coherence(t, &original)).sum::<f64>() / n,
            }
        });

        let context_metrics = options.include_context_metrics.then(|| ContextMetrics {
            original: context_counts(&original),
            compacted: context_counts(&compacted),
        });

        CompactionResult {
            messages: compacted,
            original_count: original.len(),
            selected_level,
            rollback_token,
            metrics,
            adjustments,
            semantic_metrics,
            thread_metrics,
            context_metrics,
        }
    }

    /// Level priority: explicit > auto-select from token ratio > target
    /// compression > transcript length. The bool reports whether selection
    /// logic (rather than an explicit level) produced the answer.
    fn select_level(
        &self,
        messages: &[Message],
        options: &CompactionOptions,
    ) -> (CompactionLevel, bool) {
        if let Some(level) = options.level {
            return (level, false);
        }
        if options.auto_select_level {
            if let Some(max_tokens) = options.max_tokens {
                let current: usize =
                    messages.iter().map(|m| self.tokenizer.count_tokens(&m.content)).sum();
                let ratio = current as f64 / max_tokens.max(1) as f64;
                let level = if ratio <= 1.25 {
                    CompactionLevel::Light
                } else if ratio <= 2.0 {
                    CompactionLevel::Moderate
                } else {
                    CompactionLevel::Aggressive
                };
                return (level, true);
            }
        }
        if let Some(target) = options.target_compression {
            let retention = 1.0 - target;
            let level = [
                CompactionLevel::Light,
                CompactionLevel::Moderate,
                CompactionLevel::Aggressive,
            ]
            .into_iter()
            .min_by(|a, b| {
                let da = (a.retention_rate() - retention).abs();
                let db = (b.retention_rate() - retention).abs();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("three candidates");
            return (level, true);
        }
        let level = if messages.len() > 100 {
            CompactionLevel::Aggressive
        } else if messages.len() > 30 {
            CompactionLevel::Moderate
        } else {
            CompactionLevel::Light
        };
        (level, true)
    }

    // -----------------------------------------------------------------------
    // Score-based selection
    // -----------------------------------------------------------------------

    fn score_based_selection(
        &self,
        messages: &[Message],
        weighted: &[f64],
        target_keep: usize,
        options: &CompactionOptions,
    ) -> Vec<usize> {
        let mut kept: BTreeSet<usize> = BTreeSet::new();

        // System messages are unconditionally preserved.
        for (i, msg) in messages.iter().enumerate() {
            if msg.is_system() {
                kept.insert(i);
            }
        }

        for (i, msg) in messages.iter().enumerate() {
            if preserved_by_rules(msg, options) {
                kept.insert(i);
            }
        }

        // Fill the remaining budget with the highest-scoring messages.
        // Deterministic: score desc, then original order, then content hash.
        let mut candidates: Vec<usize> = (0..messages.len()).filter(|i| !kept.contains(i)).collect();
        candidates.sort_by(|&a, &b| {
            weighted[b]
                .partial_cmp(&weighted[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cmp(&b))
                .then_with(|| {
                    content_hash(messages[a].content.as_bytes())
                        .cmp(&content_hash(messages[b].content.as_bytes()))
                })
        });
        for i in candidates {
            if kept.len() >= target_keep {
                break;
            }
            kept.insert(i);
        }

        kept.into_iter().collect()
    }

    // -----------------------------------------------------------------------
    // Thread-based selection
    // -----------------------------------------------------------------------

    fn thread_based_selection(
        &self,
        messages: &[Message],
        target_keep: usize,
        options: &CompactionOptions,
    ) -> Vec<usize> {
        let mut all_threads = threads::identify_threads(messages);
        if options.merge_related_threads {
            all_threads = merge_adjacent_threads(all_threads, messages);
        }
        let deps = threads::thread_dependencies(&all_threads, messages);

        // Rank threads by importance × coherence; complete threads first
        // when requested.
        let mut order: Vec<usize> = (0..all_threads.len()).collect();
        let rank = |t: &ConversationThread| t.importance * thread_coherence(t, messages);
        order.sort_by(|&a, &b| {
            let ta = &all_threads[a];
            let tb = &all_threads[b];
            let complete_cmp = if options.prefer_complete_threads {
                let ca = threads::is_thread_complete(ta, messages);
                let cb = threads::is_thread_complete(tb, messages);
                cb.cmp(&ca)
            } else {
                std::cmp::Ordering::Equal
            };
            complete_cmp
                .then_with(|| rank(tb).partial_cmp(&rank(ta)).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| ta.start_index.cmp(&tb.start_index))
        });

        let mut kept: BTreeSet<usize> = BTreeSet::new();
        for (i, msg) in messages.iter().enumerate() {
            if msg.is_system() {
                kept.insert(i);
            }
        }

        let mut picked_threads: HashSet<usize> = HashSet::new();
        for &t_idx in &order {
            if kept.len() >= target_keep {
                break;
            }
            self.pick_thread_with_deps(t_idx, &all_threads, &deps, &mut picked_threads, &mut kept);
        }

        kept.into_iter().collect()
    }

    /// Keep a thread and, transitively, its prerequisites.
    fn pick_thread_with_deps(
        &self,
        t_idx: usize,
        all_threads: &[ConversationThread],
        deps: &[(usize, usize)],
        picked: &mut HashSet<usize>,
        kept: &mut BTreeSet<usize>,
    ) {
        if !picked.insert(t_idx) {
            return;
        }
        for &i in &all_threads[t_idx].message_indices {
            kept.insert(i);
        }
        for &(dependent, prerequisite) in deps {
            if dependent == t_idx {
                self.pick_thread_with_deps(prerequisite, all_threads, deps, picked, kept);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dynamic adjustment
    // -----------------------------------------------------------------------

    /// Correct the kept set toward `target_compression` when the absolute
    /// error exceeds 0.1. System messages are untouchable.
    fn adjust_to_target(
        &self,
        messages: &[Message],
        weighted: &[f64],
        kept: &mut Vec<usize>,
        options: &CompactionOptions,
    ) -> Vec<Adjustment> {
        let target = options.target_compression.expect("caller checked");
        let total = messages.len() as f64;
        let mut log = Vec::new();

        let achieved = 1.0 - kept.len() as f64 / total;
        if (achieved - target).abs() <= 0.1 {
            return log;
        }

        let target_keep =
            ((total * (1.0 - target)).round() as usize).clamp(1, messages.len());

        if kept.len() > target_keep {
            // Too many kept: drop the lowest-scoring removable messages.
            let mut removable: Vec<usize> = kept
                .iter()
                .copied()
                .filter(|&i| !messages[i].is_system() && !preserved_by_rules(&messages[i], options))
                .collect();
            removable.sort_by(|&a, &b| {
                weighted[a]
                    .partial_cmp(&weighted[b])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.cmp(&a))
            });
            let excess = kept.len() - target_keep;
            let to_drop: HashSet<usize> = removable.into_iter().take(excess).collect();
            if !to_drop.is_empty() {
                kept.retain(|i| !to_drop.contains(i));
                log.push(Adjustment {
                    added: 0,
                    removed: to_drop.len(),
                    reason: format!(
                        "compression below target {target:.2}, removed lowest-scoring messages"
                    ),
                });
            }
        } else {
            // Too few kept: add back the highest-scoring excluded messages.
            let kept_set: HashSet<usize> = kept.iter().copied().collect();
            let mut excluded: Vec<usize> =
                (0..messages.len()).filter(|i| !kept_set.contains(i)).collect();
            excluded.sort_by(|&a, &b| {
                weighted[b]
                    .partial_cmp(&weighted[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.cmp(&b))
            });
            let deficit = target_keep - kept.len();
            let to_add: Vec<usize> = excluded.into_iter().take(deficit).collect();
            if !to_add.is_empty() {
                let added = to_add.len();
                kept.extend(to_add);
                kept.sort_unstable();
                log.push(Adjustment {
                    added,
                    removed: 0,
                    reason: format!(
                        "compression above target {target:.2}, restored highest-scoring messages"
                    ),
                });
            }
        }

        debug!(adjustments = log.len(), "dynamic adjustment pass");
        log
    }

    // -----------------------------------------------------------------------
    // Quality metrics
    // -----------------------------------------------------------------------

    fn quality_metrics(
        &self,
        original: &[Message],
        compacted: &[Message],
        started: Instant,
    ) -> QualityMetrics {
        if original.is_empty() {
            return QualityMetrics::default();
        }

        let compression_ratio = 1.0 - compacted.len() as f64 / original.len() as f64;
        let original_tokens: usize =
            original.iter().map(|m| self.tokenizer.count_tokens(&m.content)).sum();
        let compacted_tokens: usize =
            compacted.iter().map(|m| self.tokenizer.count_tokens(&m.content)).sum();
        let token_reduction = if original_tokens == 0 {
            0.0
        } else {
            1.0 - compacted_tokens as f64 / original_tokens as f64
        };

        let information_preservation = information_preservation(original, compacted);

        let mut effectiveness =
            (compression_ratio.min(0.8).max(0.0) * information_preservation).sqrt();
        if information_preservation > 0.9 && compression_ratio > 0.4 {
            effectiveness += 0.05;
        }

        QualityMetrics {
            compression_ratio,
            token_reduction,
            message_reduction: compression_ratio,
            information_preservation,
            processing_time_ms: started.elapsed().as_millis() as u64,
            effectiveness_score: effectiveness.min(1.0),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Compare a compacted transcript against its original outside of a
    /// compaction run.
    pub fn evaluate_utility(&self, original: &[Message], compacted: &[Message]) -> UtilityReport {
        if original.is_empty() {
            return UtilityReport {
                questions_covered: 1.0,
                topic_continuity: 1.0,
                context_preservation: 1.0,
            };
        }
        let kept: HashSet<&str> = compacted.iter().map(|m| m.content.as_str()).collect();

        let questions: Vec<&Message> =
            original.iter().filter(|m| semantic::is_question(&m.content)).collect();
        let questions_covered = if questions.is_empty() {
            1.0
        } else {
            questions.iter().filter(|m| kept.contains(m.content.as_str())).count() as f64
                / questions.len() as f64
        };

        let original_topics: BTreeSet<String> =
            semantic::identify_topics(original).into_iter().collect();
        let compacted_topics: BTreeSet<String> =
            semantic::identify_topics(compacted).into_iter().collect();
        let topic_continuity = if original_topics.is_empty() {
            1.0
        } else {
            original_topics.intersection(&compacted_topics).count() as f64
                / original_topics.len() as f64
        };

        UtilityReport {
            questions_covered,
            topic_continuity,
            context_preservation: context_preservation_score(original, compacted),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn preserved_by_rules(msg: &Message, options: &CompactionOptions) -> bool {
    for rule in &options.preservation_rules {
        let hit = match rule {
            PreservationRule::ErrorResolution => semantic::has_error_vocabulary(&msg.content),
            PreservationRule::CodeBlocks => msg.has_code_block(),
            PreservationRule::TechnicalDiscussion => {
                semantic::has_technical_vocabulary(&msg.content)
            }
        };
        if hit {
            return true;
        }
    }
    options.custom_preservers.iter().any(|p| p(msg))
}

fn content_type_multiplier(msg: &Message, weights: Option<&ContentTypeWeights>) -> f64 {
    let Some(w) = weights else { return 1.0 };
    let mut m = 1.0;
    if msg.has_code_block() {
        m *= w.code_blocks;
    }
    if semantic::has_error_vocabulary(&msg.content) {
        m *= w.errors;
    }
    if semantic::is_question(&msg.content) {
        m *= w.questions;
    }
    if semantic::has_solution_language(&msg.content) {
        m *= w.solutions;
    }
    if semantic::has_technical_vocabulary(&msg.content) {
        m *= w.technical;
    }
    m
}

/// Merge adjacent threads whose topic-word Jaccard is at least 0.7.
fn merge_adjacent_threads(
    threads_in: Vec<ConversationThread>,
    messages: &[Message],
) -> Vec<ConversationThread> {
    let mut merged: Vec<ConversationThread> = Vec::new();
    for thread in threads_in {
        let merge = match merged.last() {
            Some(prev) => {
                let a: BTreeSet<&str> = prev.keywords.iter().map(|s| s.as_str()).collect();
                let b: BTreeSet<&str> = thread.keywords.iter().map(|s| s.as_str()).collect();
                let union = a.union(&b).count();
                union > 0 && a.intersection(&b).count() as f64 / union as f64 >= 0.7
            }
            None => false,
        };
        if merge {
            let prev = merged.last_mut().expect("checked above");
            prev.message_indices.extend(thread.message_indices);
            prev.end_index = thread.end_index;
            let member_messages: Vec<Message> =
                prev.message_indices.iter().map(|&i| messages[i].clone()).collect();
            prev.keywords = semantic::identify_topics(&member_messages);
            prev.topic = prev.keywords.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
            prev.importance = prev.importance.max(thread.importance);
        } else {
            merged.push(thread);
        }
    }
    merged
}

fn context_counts(messages: &[Message]) -> ContextCounts {
    let mut counts = ContextCounts::default();
    for msg in messages {
        if msg.has_code_block() {
            counts.code_blocks += 1;
        }
        if semantic::is_question(&msg.content) {
            counts.questions += 1;
        }
        if msg.is_system() {
            counts.system_messages += 1;
        }
        if semantic::has_error_vocabulary(&msg.content) {
            counts.error_messages += 1;
        }
        if semantic::has_solution_language(&msg.content) {
            counts.solutions += 1;
        }
    }
    counts
}

fn context_preservation_score(original: &[Message], compacted: &[Message]) -> f64 {
    let orig = context_counts(original);
    let comp = context_counts(compacted);
    let pairs = [
        (orig.code_blocks, comp.code_blocks),
        (orig.questions, comp.questions),
        (orig.system_messages, comp.system_messages),
        (orig.error_messages, comp.error_messages),
        (orig.solutions, comp.solutions),
    ];
    let ratios: Vec<f64> = pairs
        .iter()
        .map(|&(o, c)| if o == 0 { 1.0 } else { (c as f64 / o as f64).min(1.0) })
        .collect();
    ratios.iter().sum::<f64>() / ratios.len() as f64
}

/// 0.4·content + 0.3·context + 0.3·importance.
fn information_preservation(original: &[Message], compacted: &[Message]) -> f64 {
    let original_texts: HashSet<&str> = original.iter().map(|m| m.content.as_str()).collect();
    let kept_texts: HashSet<&str> = compacted.iter().map(|m| m.content.as_str()).collect();
    let content = if original_texts.is_empty() {
        1.0
    } else {
        original_texts.intersection(&kept_texts).count() as f64 / original_texts.len() as f64
    };

    let context = context_preservation_score(original, compacted);

    // High-importance: messages whose normalized composite is ≥ 0.7.
    let importance = match score_messages(original, &ScoringOptions::default()) {
        Ok(scores) => {
            let high: Vec<usize> =
                scores.iter().filter(|s| s.composite >= 0.7).map(|s| s.index).collect();
            if high.is_empty() {
                1.0
            } else {
                high.iter()
                    .filter(|&&i| kept_texts.contains(original[i].content.as_str()))
                    .count() as f64
                    / high.len() as f64
            }
        }
        Err(_) => 1.0,
    };

    0.4 * content + 0.3 * context + 0.3 * importance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::CharEstimateTokenizer;
    use crate::types::Role;

    fn engine() -> CompactionEngine {
        CompactionEngine::new(Arc::new(CharEstimateTokenizer))
    }

    fn user(content: &str) -> Message {
        Message::new(Role::User, content)
    }

    fn assistant(content: &str) -> Message {
        Message::new(Role::Assistant, content)
    }

    fn alternating(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    user(&format!("question number {i} about topic {}", i / 4))
                } else {
                    assistant(&format!("answer number {i} about topic {}", i / 4))
                }
            })
            .collect()
    }

    #[test]
    fn empty_transcript_compacts_to_empty() {
        let result = engine().compact(&[], &CompactionOptions::default()).unwrap();
        assert!(result.messages.is_empty());
        assert_eq!(result.metrics.compression_ratio, 0.0);
        assert_eq!(result.metrics.token_reduction, 0.0);
        assert_eq!(result.metrics.effectiveness_score, 0.0);
    }

    #[test]
    fn three_messages_pass_through() {
        let messages = vec![
            Message::new(Role::System, "be helpful"),
            user("hello"),
            assistant("hi"),
        ];
        let result = engine().compact(&messages, &CompactionOptions::default()).unwrap();
        assert_eq!(result.messages, messages);
        assert_eq!(result.metrics.compression_ratio, 0.0);
    }

    #[test]
    fn system_messages_always_survive() {
        let mut messages = alternating(30);
        messages.insert(0, Message::new(Role::System, "system prompt"));
        messages.insert(15, Message::new(Role::System, "mid-stream instruction"));

        let options = CompactionOptions {
            level: Some(CompactionLevel::Aggressive),
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        let systems: Vec<&Message> =
            result.messages.iter().filter(|m| m.is_system()).collect();
        assert_eq!(systems.len(), 2);
    }

    #[test]
    fn aggressive_on_twenty_messages_hits_band() {
        let mut messages = alternating(20);
        messages[7] = user("here is the snippet ```js\nconsole.log('x');\n```");

        let options = CompactionOptions {
            level: Some(CompactionLevel::Aggressive),
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        assert!(
            (5..=8).contains(&result.messages.len()),
            "kept {}",
            result.messages.len()
        );
        assert!(
            result.messages.iter().any(|m| m.has_code_block()),
            "code-block message must survive aggressive compaction"
        );
    }

    #[test]
    fn retention_bands_hold_for_all_levels() {
        let messages = alternating(40);
        for level in
            [CompactionLevel::Light, CompactionLevel::Moderate, CompactionLevel::Aggressive]
        {
            let options = CompactionOptions { level: Some(level), ..Default::default() };
            let result = engine().compact(&messages, &options).unwrap();
            let retention = result.messages.len() as f64 / messages.len() as f64;
            assert!(
                (retention - level.retention_rate()).abs() <= 0.05,
                "{level:?}: retention {retention}"
            );
        }
    }

    #[test]
    fn compaction_is_deterministic() {
        let messages = alternating(35);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            ..Default::default()
        };
        let e = engine();
        let a = e.compact(&messages, &options).unwrap();
        let b = e.compact(&messages, &options).unwrap();
        assert_eq!(a.messages, b.messages);
    }

    #[test]
    fn output_preserves_original_order() {
        let messages = alternating(30);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        let positions: Vec<usize> = result
            .messages
            .iter()
            .map(|m| messages.iter().position(|o| o == m).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "positions: {positions:?}");
    }

    #[test]
    fn code_block_rule_retains_every_fence() {
        let mut messages = alternating(24);
        messages[3] = user("first snippet ```py\nprint(1)\n```");
        messages[17] = assistant("second snippet ```py\nprint(2)\n```");

        let options = CompactionOptions {
            level: Some(CompactionLevel::Aggressive),
            preservation_rules: vec![PreservationRule::CodeBlocks],
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        let fences = result.messages.iter().filter(|m| m.has_code_block()).count();
        assert_eq!(fences, 2);
    }

    #[test]
    fn custom_preserver_is_honored() {
        let messages = alternating(24);
        let marker = messages[5].content.clone();
        let options = CompactionOptions {
            level: Some(CompactionLevel::Aggressive),
            custom_preservers: vec![Arc::new(move |m: &Message| m.content == marker)],
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        assert!(result.messages.iter().any(|m| m.content == messages[5].content));
    }

    #[test]
    fn rollback_restores_exact_original() {
        let messages = alternating(25);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Aggressive),
            enable_rollback: true,
            ..Default::default()
        };
        let e = engine();
        let result = e.compact(&messages, &options).unwrap();
        assert!(result.messages.len() < messages.len());

        let token = result.rollback_token.as_deref().unwrap();
        let restored = e.rollback(token).unwrap();
        assert_eq!(restored, messages);
        // Rollback is repeatable while the token lives.
        assert_eq!(e.rollback(token).unwrap(), messages);
    }

    #[test]
    fn rollback_unknown_token_is_not_found() {
        let err = engine().rollback("no-such-token").unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn rollback_expires_by_ttl() {
        let messages = alternating(25);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            enable_rollback: true,
            rollback_ttl: Some(Duration::from_millis(0)),
            ..Default::default()
        };
        let e = engine();
        let result = e.compact(&messages, &options).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let err = e.rollback(result.rollback_token.as_deref().unwrap()).unwrap_err();
        assert_eq!(err.kind(), "expired");
        // The expired slot is collected when history is queried.
        assert!(e.rollback_history().is_empty());
    }

    #[test]
    fn selected_level_reported_only_when_selection_ran() {
        let messages = alternating(40);
        let explicit = CompactionOptions {
            level: Some(CompactionLevel::Light),
            ..Default::default()
        };
        let result = engine().compact(&messages, &explicit).unwrap();
        assert_eq!(result.selected_level, None);

        let auto = CompactionOptions::default();
        let result = engine().compact(&messages, &auto).unwrap();
        assert_eq!(result.selected_level, Some(CompactionLevel::Moderate));
    }

    #[test]
    fn auto_select_by_token_ratio() {
        let messages = alternating(40);
        let total_tokens: usize =
            messages.iter().map(|m| CharEstimateTokenizer.count_tokens(&m.content)).sum();
        let options = CompactionOptions {
            auto_select_level: true,
            max_tokens: Some(total_tokens / 3),
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        assert_eq!(result.selected_level, Some(CompactionLevel::Aggressive));
    }

    #[test]
    fn dynamic_adjustment_converges_to_target() {
        let messages = alternating(40);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Light),
            target_compression: Some(0.5),
            allow_dynamic_adjustment: true,
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        let achieved = 1.0 - result.messages.len() as f64 / messages.len() as f64;
        assert!((achieved - 0.5).abs() <= 0.1, "achieved {achieved}");
        let adjustments = result.adjustments.unwrap();
        assert!(!adjustments.is_empty());
        assert!(adjustments[0].removed > 0);
    }

    #[test]
    fn dynamic_adjustment_runs_but_records_nothing_when_on_target() {
        let messages = alternating(40);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            target_compression: Some(0.5),
            allow_dynamic_adjustment: true,
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        assert_eq!(result.adjustments.map(|a| a.len()), Some(0));
    }

    #[test]
    fn thread_mode_keeps_whole_threads() {
        let mut messages = Vec::new();
        messages.push(user("how do I fix the database error?"));
        messages.push(assistant("the database error needs an index, try this fix"));
        messages.push(user("thanks, that works"));
        messages.push(user("completely different poetry request"));
        messages.push(assistant("roses are red"));
        messages.push(user("more poetry please"));
        messages.push(assistant("violets are blue"));
        messages.push(user("what about the cache bug? ```rust\ncache.get()\n```"));
        messages.push(assistant("the cache bug is fixed by eviction"));

        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            use_threads: true,
            prefer_complete_threads: true,
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        // The high-importance technical threads beat the poetry thread.
        assert!(result.messages.iter().any(|m| m.content.contains("database error")));
        assert!(result.messages.len() < messages.len());
    }

    #[test]
    fn quality_metrics_monotone_in_retention() {
        let messages = alternating(40);
        let e = engine();
        let mut last_preservation = -1.0;
        for level in
            [CompactionLevel::Aggressive, CompactionLevel::Moderate, CompactionLevel::Light]
        {
            let options = CompactionOptions { level: Some(level), ..Default::default() };
            let result = e.compact(&messages, &options).unwrap();
            assert!(
                result.metrics.information_preservation >= last_preservation,
                "{level:?}: {} < {last_preservation}",
                result.metrics.information_preservation
            );
            last_preservation = result.metrics.information_preservation;
        }
    }

    #[test]
    fn metrics_flags_populate_sections() {
        let messages = alternating(30);
        let options = CompactionOptions {
            level: Some(CompactionLevel::Moderate),
            include_semantic_metrics: true,
            include_thread_metrics: true,
            include_context_metrics: true,
            ..Default::default()
        };
        let result = engine().compact(&messages, &options).unwrap();
        assert!(result.semantic_metrics.is_some());
        assert!(result.thread_metrics.is_some());
        let ctx = result.context_metrics.unwrap();
        assert_eq!(ctx.original.system_messages, 0);
        assert!(ctx.original.questions > 0);
    }

    #[test]
    fn utility_report_full_coverage_when_unchanged() {
        let messages = alternating(20);
        let report = engine().evaluate_utility(&messages, &messages);
        assert_eq!(report.questions_covered, 1.0);
        assert_eq!(report.topic_continuity, 1.0);
        assert_eq!(report.context_preservation, 1.0);
    }

    #[test]
    fn utility_report_degrades_when_questions_drop() {
        let messages = alternating(20);
        let answers_only: Vec<Message> =
            messages.iter().filter(|m| m.role == Role::Assistant).cloned().collect();
        let report = engine().evaluate_utility(&messages, &answers_only);
        assert_eq!(report.questions_covered, 0.0);
    }

    #[test]
    fn invalid_weights_surface_as_config_error() {
        let messages = alternating(10);
        let options = CompactionOptions {
            weights: crate::config::ScoringWeights {
                recency: 0.9,
                relevance: 0.9,
                interaction: 0.1,
                complexity: 0.1,
            },
            ..Default::default()
        };
        let err = engine().compact(&messages, &options).unwrap_err();
        assert_eq!(err.kind(), "invalid_config");
    }
}
