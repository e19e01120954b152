//! Multi-dimensional message scoring.
//!
//! Four normalized dimensions (recency, relevance, interaction,
//! complexity) combined with validated weights. Composite scores are
//! normalized by the maximum so the best message in a batch scores 1.0.

use crate::analyzer::content_hash;
use crate::config::ScoringWeights;
use crate::error::CoreResult;
use crate::semantic;
use crate::types::Message;
use serde::Serialize;
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Caller-observed interaction history for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InteractionFlags {
    pub edited: bool,
    pub referenced: bool,
    pub followed_up: bool,
}

#[derive(Debug, Clone)]
pub struct ScoringOptions {
    pub weights: ScoringWeights,
    /// Conversation focus the relevance dimension scores against. Empty
    /// yields a uniform 0.5.
    pub current_context: String,
    /// Base of the per-minute exponential recency decay, in [0,1).
    pub decay_rate: f64,
    /// Reference time for age computation. Defaults to the newest message
    /// timestamp so scoring stays deterministic for a fixed transcript.
    pub now_ms: Option<i64>,
    /// Per-message-index interaction flags; absent indices use defaults.
    pub interactions: HashMap<usize, InteractionFlags>,
}

impl Default for ScoringOptions {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            current_context: String::new(),
            decay_rate: 0.95,
            now_ms: None,
            interactions: HashMap::new(),
        }
    }
}

/// Per-message score across all dimensions, each in [0,1].
#[derive(Debug, Clone, Serialize)]
pub struct MessageScore {
    pub index: usize,
    pub recency: f64,
    pub relevance: f64,
    pub interaction: f64,
    pub complexity: f64,
    /// Weighted composite, normalized by the batch maximum.
    pub composite: f64,
}

// ---------------------------------------------------------------------------
// Dimensions
// ---------------------------------------------------------------------------

fn recency_score(msg: &Message, index: usize, len: usize, now_ms: i64, decay_rate: f64) -> f64 {
    match msg.timestamp {
        Some(ts) => {
            let age_minutes = ((now_ms - ts).max(0) as f64) / 60_000.0;
            decay_rate.powf(age_minutes).clamp(0.0, 1.0)
        }
        // No timestamp: position-based score in [0.3, 0.7], newer is higher.
        None => {
            let span = (len.saturating_sub(1)).max(1) as f64;
            0.3 + 0.4 * (index as f64 / span)
        }
    }
}

fn relevance_score(msg: &Message, current_context: &str) -> f64 {
    if current_context.trim().is_empty() {
        return 0.5;
    }
    semantic::similarity(&msg.content, current_context)
}

fn interaction_score(flags: InteractionFlags) -> f64 {
    let mut score: f64 = 0.20;
    if flags.edited {
        score += 0.50;
    }
    if flags.referenced {
        score += 0.35;
    }
    if flags.followed_up {
        score += 0.25;
    }
    score.min(1.0)
}

fn complexity_score(msg: &Message) -> f64 {
    let mut score: f64 = 0.0;
    if msg.has_code_block() {
        score += 0.35;
    }
    if semantic::has_error_vocabulary(&msg.content) {
        score += 0.20;
    }
    if semantic::has_technical_vocabulary(&msg.content) {
        score += 0.20;
    }
    if semantic::is_question(&msg.content) {
        score += 0.15;
    }
    if semantic::has_solution_language(&msg.content) {
        score += 0.20;
    }
    score.min(1.0)
}

// ---------------------------------------------------------------------------
// Batch scoring
// ---------------------------------------------------------------------------

/// Score every message in the transcript. Fails with `InvalidConfig` when
/// the weights don't sum to 1.
pub fn score_messages(
    messages: &[Message],
    options: &ScoringOptions,
) -> CoreResult<Vec<MessageScore>> {
    options.weights.validate()?;
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let now_ms = options
        .now_ms
        .or_else(|| messages.iter().filter_map(|m| m.timestamp).max())
        .unwrap_or(0);

    let w = &options.weights;
    let mut scores: Vec<MessageScore> = messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let recency = recency_score(msg, i, messages.len(), now_ms, options.decay_rate);
            let relevance = relevance_score(msg, &options.current_context);
            let interaction =
                interaction_score(options.interactions.get(&i).copied().unwrap_or_default());
            let complexity = complexity_score(msg);
            let composite = w.recency * recency
                + w.relevance * relevance
                + w.interaction * interaction
                + w.complexity * complexity;
            MessageScore { index: i, recency, relevance, interaction, complexity, composite }
        })
        .collect();

    // Normalize composites by the batch maximum.
    let max = scores.iter().map(|s| s.composite).fold(0.0_f64, f64::max);
    if max > 0.0 {
        for s in &mut scores {
            s.composite /= max;
        }
    }

    Ok(scores)
}

/// Stable cache key over message contents and the scoring options.
pub fn scoring_cache_key(messages: &[Message], options: &ScoringOptions) -> String {
    let mut material = String::new();
    for msg in messages {
        material.push_str(&msg.content);
        material.push('\u{1}');
        if let Some(ts) = msg.timestamp {
            material.push_str(&ts.to_string());
        }
        material.push('\u{2}');
    }
    material.push_str(&format!(
        "{}|{}|{}|{}|{}|{}",
        options.weights.recency,
        options.weights.relevance,
        options.weights.interaction,
        options.weights.complexity,
        options.current_context,
        options.decay_rate,
    ));
    let mut flags: Vec<(&usize, &InteractionFlags)> = options.interactions.iter().collect();
    flags.sort_by_key(|(i, _)| **i);
    for (i, f) in flags {
        material.push_str(&format!("{i}:{}{}{}", f.edited, f.referenced, f.followed_up));
    }
    content_hash(material.as_bytes())
}
