//! Budget-bounded content sampling from ranked files.
//!
//! The total token budget is split proportionally to relevance scores with
//! a minimum floor per included file, then each file contributes contiguous
//! windows centered on matched symbols and query terms. When the budget
//! runs out mid-file, the last window is truncated on a line boundary.

use crate::tokenizer::Tokenizer;
use crate::types::{ContentSample, FileIndex, RelevanceScore};

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Minimum tokens a file must receive to be included at all.
    pub min_file_budget: usize,
    /// Context lines kept around each matched line.
    pub context_lines: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { min_file_budget: 50, context_lines: 3 }
    }
}

// ---------------------------------------------------------------------------
// Budget allocation
// ---------------------------------------------------------------------------

/// Proportional split of `total` across scores with a per-file floor.
/// Zero-score files receive the floor; an all-zero ranking splits evenly.
pub fn allocate_budgets(scores: &[f64], total: usize, floor: usize) -> Vec<usize> {
    let n = scores.len();
    if n == 0 || total == 0 {
        return vec![0; n];
    }
    let sum: f64 = scores.iter().sum();
    if sum <= 0.0 {
        let even = (total / n).max(floor);
        return vec![even; n];
    }
    scores.iter().map(|s| ((total as f64 * s / sum) as usize).max(floor)).collect()
}

// ---------------------------------------------------------------------------
// Window extraction
// ---------------------------------------------------------------------------

struct Window {
    start: usize, // 0-based inclusive
    end: usize,   // 0-based inclusive
    hits: usize,
    reason: String,
}

fn merge_windows(mut windows: Vec<Window>) -> Vec<Window> {
    windows.sort_by_key(|w| w.start);
    let mut merged: Vec<Window> = Vec::new();
    for w in windows {
        match merged.last_mut() {
            Some(prev) if w.start <= prev.end + 1 => {
                prev.end = prev.end.max(w.end);
                prev.hits += w.hits;
                if !prev.reason.contains(&w.reason) {
                    prev.reason = format!("{}, {}", prev.reason, w.reason);
                }
            }
            _ => merged.push(w),
        }
    }
    merged
}

fn find_windows(
    file: &FileIndex,
    lines: &[&str],
    query_terms: &[String],
    context_lines: usize,
) -> Vec<Window> {
    let mut windows = Vec::new();
    let last = lines.len().saturating_sub(1);

    // Symbols whose names appear in the query anchor windows at their
    // declaration lines.
    for sym in &file.symbols {
        let name_lower = sym.name.to_lowercase();
        if query_terms.iter().any(|t| name_lower.contains(t.as_str())) && sym.line >= 1 {
            let line0 = (sym.line - 1).min(last);
            windows.push(Window {
                start: line0.saturating_sub(context_lines),
                end: (line0 + context_lines).min(last),
                hits: 2,
                reason: format!("symbol:{}", sym.name),
            });
        }
    }

    // Plain query-term hits in content.
    for (i, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if query_terms.iter().any(|t| lower.contains(t.as_str())) {
            windows.push(Window {
                start: i.saturating_sub(context_lines),
                end: (i + context_lines).min(last),
                hits: 1,
                reason: "query-match".to_string(),
            });
        }
    }

    merge_windows(windows)
}

/// Extract samples from one file within `budget` tokens. Windows are taken
/// highest-hit first; the final window is truncated on a line boundary when
/// the budget runs out mid-window. With no matches the head of the file is
/// sampled instead.
pub fn sample_file(
    file: &FileIndex,
    content: &str,
    query_terms: &[String],
    budget: usize,
    config: &SamplerConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<ContentSample> {
    if budget == 0 || content.is_empty() {
        return Vec::new();
    }
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }

    let mut windows = if query_terms.is_empty() {
        Vec::new()
    } else {
        find_windows(file, &lines, query_terms, config.context_lines)
    };

    if windows.is_empty() {
        // No lexical anchors: sample the head of the file.
        windows.push(Window {
            start: 0,
            end: lines.len() - 1,
            hits: 0,
            reason: "head".to_string(),
        });
    }

    // Highest-hit windows first; stable on document order for equal hits.
    windows.sort_by(|a, b| b.hits.cmp(&a.hits).then(a.start.cmp(&b.start)));

    let mut samples = Vec::new();
    let mut remaining = budget;

    for window in windows {
        if remaining == 0 {
            break;
        }
        let mut taken_lines: Vec<&str> = Vec::new();
        let mut tokens_used = 0usize;
        let mut end_line = window.start;

        for (offset, line) in lines[window.start..=window.end].iter().copied().enumerate() {
            let cost = tokenizer.count_tokens(line).max(1);
            if tokens_used + cost > remaining {
                break;
            }
            taken_lines.push(line);
            tokens_used += cost;
            end_line = window.start + offset;
        }

        if taken_lines.is_empty() {
            continue;
        }
        remaining -= tokens_used;
        samples.push(ContentSample {
            file: file.path.clone(),
            text: taken_lines.join("\n"),
            start_line: window.start + 1,
            end_line: end_line + 1,
            tokens: tokens_used,
            reason: window.reason,
        });
    }

    // Emit in document order regardless of selection order.
    samples.sort_by_key(|s| s.start_line);
    samples
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Sample a ranked file list under a total budget. `load` resolves a path
/// to its content; unreadable files are skipped and their budget freed for
/// the files after them.
pub fn sample_ranked(
    ranked: &[(RelevanceScore, FileIndex)],
    load: impl Fn(&str) -> Option<String>,
    query: &str,
    total_budget: usize,
    config: &SamplerConfig,
    tokenizer: &dyn Tokenizer,
) -> Vec<ContentSample> {
    let query_terms: Vec<String> = query
        .split_whitespace()
        .filter(|w| w.len() >= 2)
        .map(|w| w.to_lowercase())
        .collect();

    let scores: Vec<f64> = ranked.iter().map(|(r, _)| r.score).collect();
    let budgets = allocate_budgets(&scores, total_budget, config.min_file_budget);

    let mut samples = Vec::new();
    let mut remaining = total_budget;

    for ((_, file), base_budget) in ranked.iter().zip(budgets) {
        if remaining < config.min_file_budget {
            break;
        }
        let Some(content) = load(&file.path) else { continue };
        let file_budget = base_budget.min(remaining);
        let file_samples =
            sample_file(file, &content, &query_terms, file_budget, config, tokenizer);
        let used: usize = file_samples.iter().map(|s| s.tokens).sum();
        remaining = remaining.saturating_sub(used);
        samples.extend(file_samples);
    }

    samples
}
