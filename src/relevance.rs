//! Multi-signal file relevance ranking.
//!
//! Query terms are the primary signal; import-graph proximity, recent
//! access, and learned access patterns fill in when lexical evidence is
//! thin. All five signals are bounded to [0,1] before weighting, so a
//! single noisy signal can never dominate the ranking.

use crate::analyzer::content_hash;
use crate::types::{ImportGraph, RelevanceScore, RelevanceSignals};
use crate::index::IndexSnapshot;
use std::collections::{HashMap, VecDeque};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Conversation-side state feeding the non-lexical signals.
#[derive(Debug, Clone, Default)]
pub struct RelevanceContext {
    /// File the user is currently looking at; anchors the import-chain
    /// signal.
    pub current_file: Option<String>,
    /// Recently accessed files with their last-access epoch milliseconds.
    pub recent_files: Vec<(String, i64)>,
    /// Lifetime access counts per file.
    pub access_counts: HashMap<String, u32>,
    /// Reference time for access decay; defaults to the newest recent-file
    /// timestamp so ranking is deterministic for fixed inputs.
    pub now_ms: Option<i64>,
}

/// Signal weights. The defaults favor direct lexical evidence.
#[derive(Debug, Clone, Copy)]
pub struct RelevanceWeights {
    pub direct_reference: f64,
    pub symbol_match: f64,
    pub import_chain: f64,
    pub recent_access: f64,
    pub user_pattern: f64,
    /// Per-minute base of the recent-access decay.
    pub access_decay_rate: f64,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            direct_reference: 0.30,
            symbol_match: 0.25,
            import_chain: 0.20,
            recent_access: 0.15,
            user_pattern: 0.10,
            access_decay_rate: 0.95,
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '.' && c != '/')
        .filter(|w| w.len() >= 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Query tokens matching the file basename or path.
fn direct_reference_signal(path: &str, terms: &[String]) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let path_lower = path.to_lowercase();
    let basename = path_lower.rsplit('/').next().unwrap_or(&path_lower);
    let stem = basename.rsplit_once('.').map(|(s, _)| s).unwrap_or(basename);

    let mut hits = 0usize;
    for term in terms {
        if stem == term || basename == term.as_str() {
            hits += 2;
        } else if path_lower.contains(term.as_str()) {
            hits += 1;
        }
    }
    (hits as f64 / (terms.len() * 2) as f64).min(1.0)
}

/// Query tokens matching exported symbol names.
fn symbol_match_signal(exports: &[String], terms: &[String]) -> f64 {
    if terms.is_empty() || exports.is_empty() {
        return 0.0;
    }
    let exports_lower: Vec<String> = exports.iter().map(|e| e.to_lowercase()).collect();
    let mut hits = 0usize;
    for term in terms {
        if exports_lower.iter().any(|e| e == term) {
            hits += 2;
        } else if exports_lower.iter().any(|e| e.contains(term.as_str())) {
            hits += 1;
        }
    }
    (hits as f64 / (terms.len() * 2) as f64).min(1.0)
}

/// BFS distances from `start` over the import graph, treating edges as
/// undirected: a dependency and a dependent are equally nearby.
fn import_distances(graph: &ImportGraph, start: &str, max_depth: usize) -> HashMap<String, usize> {
    let mut dist: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    dist.insert(start.to_string(), 0);
    queue.push_back((start.to_string(), 0));

    while let Some((node, d)) = queue.pop_front() {
        if d >= max_depth {
            continue;
        }
        let forward = graph.imports.get(&node).into_iter().flatten();
        let backward = graph.imported_by.get(&node).into_iter().flatten();
        for next in forward.chain(backward) {
            if !dist.contains_key(next) {
                dist.insert(next.clone(), d + 1);
                queue.push_back((next.clone(), d + 1));
            }
        }
    }
    dist
}

/// 1.0 at distance 0, decaying by 0.7 per hop, zero beyond reach.
fn import_chain_signal(distances: Option<&HashMap<String, usize>>, path: &str) -> f64 {
    match distances.and_then(|d| d.get(path)) {
        Some(&d) => 0.7_f64.powi(d as i32),
        None => 0.0,
    }
}

fn recent_access_signal(
    path: &str,
    context: &RelevanceContext,
    now_ms: i64,
    decay_rate: f64,
) -> f64 {
    let last = context
        .recent_files
        .iter()
        .filter(|(p, _)| p == path)
        .map(|(_, ts)| *ts)
        .max();
    match last {
        Some(ts) => {
            let age_minutes = ((now_ms - ts).max(0) as f64) / 60_000.0;
            decay_rate.powf(age_minutes).clamp(0.0, 1.0)
        }
        None => 0.0,
    }
}

fn user_pattern_signal(path: &str, context: &RelevanceContext, max_count: u32) -> f64 {
    if max_count == 0 {
        return 0.0;
    }
    context.access_counts.get(path).copied().unwrap_or(0) as f64 / max_count as f64
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Rank candidate files against a query and conversation context. With no
/// explicit candidate list, every indexed file is a candidate. Results are
/// sorted best-first; ties break by confidence, then lexicographic path.
pub fn rank_files(
    snapshot: &IndexSnapshot,
    graph: &ImportGraph,
    query: &str,
    candidates: Option<&[String]>,
    context: &RelevanceContext,
    weights: &RelevanceWeights,
) -> Vec<RelevanceScore> {
    let terms = query_terms(query);

    let candidate_paths: Vec<&str> = match candidates {
        Some(list) => list.iter().map(|s| s.as_str()).collect(),
        None => snapshot.files.keys().map(|s| s.as_str()).collect(),
    };

    let distances = context
        .current_file
        .as_deref()
        .map(|cf| import_distances(graph, cf, 4));

    let now_ms = context
        .now_ms
        .or_else(|| context.recent_files.iter().map(|(_, ts)| *ts).max())
        .unwrap_or(0);
    let max_count = context.access_counts.values().copied().max().unwrap_or(0);

    let mut scores: Vec<RelevanceScore> = candidate_paths
        .into_iter()
        .filter(|p| snapshot.files.contains_key(*p))
        .map(|path| {
            let file = &snapshot.files[path];
            let signals = RelevanceSignals {
                direct_reference: direct_reference_signal(path, &terms),
                symbol_match: symbol_match_signal(&file.exports, &terms),
                import_chain: import_chain_signal(distances.as_ref(), path),
                recent_access: recent_access_signal(
                    path,
                    context,
                    now_ms,
                    weights.access_decay_rate,
                ),
                user_pattern: user_pattern_signal(path, context, max_count),
            };
            let score = (weights.direct_reference * signals.direct_reference
                + weights.symbol_match * signals.symbol_match
                + weights.import_chain * signals.import_chain
                + weights.recent_access * signals.recent_access
                + weights.user_pattern * signals.user_pattern)
                .min(1.0);
            let contributing = [
                signals.direct_reference,
                signals.symbol_match,
                signals.import_chain,
                signals.recent_access,
                signals.user_pattern,
            ]
            .iter()
            .filter(|&&s| s > 0.1)
            .count();
            let confidence = contributing as f64 / 5.0;
            RelevanceScore { path: path.to_string(), score, confidence, signals }
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.path.cmp(&b.path))
    });

    scores
}

/// Cache key over `(current_file, query, sorted candidate set)`.
pub fn relevance_cache_key(query: &str, candidates: &[String], current_file: Option<&str>) -> String {
    let mut sorted: Vec<&str> = candidates.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    let material = format!("{}\u{1}{}\u{1}{}", current_file.unwrap_or(""), query, sorted.join("\u{2}"));
    content_hash(material.as_bytes())
}
