//! Surface lexical primitives over conversation messages: keyword
//! extraction, similarity, topic identification, and breakpoint detection.
//!
//! Everything here is deliberately non-learned: stopword filtering, a
//! curated technical-term dictionary, and weighted set overlap. Identical
//! inputs always produce identical outputs.

use crate::types::{Message, Role};
use std::collections::{BTreeSet, HashMap};

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "for", "of", "to", "in", "on",
    "at", "by", "with", "from", "as", "is", "are", "was", "were", "be", "been", "being", "it",
    "its", "this", "that", "these", "those", "i", "you", "he", "she", "we", "they", "me", "my",
    "your", "our", "their", "not", "no", "yes", "do", "does", "did", "done", "can", "could",
    "will", "would", "should", "shall", "may", "might", "must", "have", "has", "had", "there",
    "here", "what", "when", "where", "who", "why", "how", "all", "any", "some", "more", "most",
    "just", "about", "into", "over", "out", "up", "down", "than", "too", "very", "also", "so",
    "get", "got", "make", "made", "like", "want", "need", "use", "using", "used",
];

/// Curated technical vocabulary. Presence of these terms raises keyword
/// importance and drives the technical-discussion preservation rule.
pub const TECHNICAL_TERMS: &[&str] = &[
    "error", "exception", "stack", "trace", "bug", "crash", "panic", "timeout", "function",
    "method", "class", "interface", "struct", "enum", "trait", "module", "namespace", "import",
    "export", "variable", "constant", "array", "object", "string", "integer", "boolean", "null",
    "undefined", "pointer", "reference", "api", "endpoint", "request", "response", "http",
    "json", "xml", "database", "query", "index", "schema", "migration", "transaction", "cache",
    "server", "client", "socket", "thread", "async", "await", "promise", "callback", "mutex",
    "lock", "compile", "compiler", "runtime", "syntax", "parser", "lexer", "token", "build",
    "deploy", "docker", "kubernetes", "test", "assert", "mock", "debug", "refactor", "commit",
    "branch", "merge", "rebase", "config", "configuration", "dependency", "package", "library",
    "framework", "algorithm", "recursion", "iterator", "closure", "memory", "heap", "leak",
    "performance", "latency", "throughput", "optimize", "authentication", "authorization",
    "encryption", "hash", "serialize", "deserialize", "regex", "typescript", "javascript",
    "python", "rust",
];

/// Small canonical list of conversation-important terms. Sharing these
/// between two messages is a strong signal they belong together.
const IMPORTANT_TERMS: &[&str] = &[
    "error", "bug", "fix", "issue", "problem", "solution", "implement", "feature", "fail",
    "broken", "working",
];

/// Phrases that open a new topic when a user message starts with them.
const NEW_TOPIC_INDICATORS: &[&str] = &[
    "now", "next", "also", "another", "what about", "how about", "let me ask", "switching to",
    "moving to", "changing to", "new question", "different topic", "one more thing", "unrelated",
    "btw", "by the way",
];

/// Closure vocabulary signalling a finished exchange.
pub const CLOSURE_TOKENS: &[&str] = &[
    "thanks", "thank you", "great", "perfect", "that works", "solved", "got it", "makes sense",
    "awesome", "bye", "goodbye", "that's all", "done",
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "good morning", "good afternoon", "good evening"];

const FOLLOW_UP_INDICATORS: &[&str] = &[
    "and", "but", "so", "then", "what if", "can you also", "additionally", "furthermore",
    "following up", "continuing",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

pub fn is_technical_term(word: &str) -> bool {
    TECHNICAL_TERMS.contains(&word)
}

/// Does the text start with a phrase that opens a new topic?
pub fn starts_new_topic(text: &str) -> bool {
    let lower = text.trim_start().to_lowercase();
    NEW_TOPIC_INDICATORS.iter().any(|p| lower.starts_with(p))
}

pub fn starts_with_greeting(text: &str) -> bool {
    let lower = text.trim_start().to_lowercase();
    GREETINGS.iter().any(|g| {
        lower.starts_with(g)
            && lower[g.len()..].chars().next().map_or(true, |c| !c.is_alphanumeric())
    })
}

pub fn contains_closure(text: &str) -> bool {
    let lower = text.to_lowercase();
    CLOSURE_TOKENS.iter().any(|t| lower.contains(t))
}

pub fn starts_with_follow_up(text: &str) -> bool {
    let lower = text.trim_start().to_lowercase();
    FOLLOW_UP_INDICATORS.iter().any(|p| lower.starts_with(p))
}

const ERROR_VOCAB: &[&str] = &[
    "error", "exception", "fail", "failed", "failure", "crash", "panic", "broken", "fix",
    "fixed", "bug", "traceback", "stack trace", "segfault", "undefined behavior",
];

const SOLUTION_VOCAB: &[&str] = &[
    "solution", "solved", "resolve", "resolved", "works now", "that works", "should work",
    "try this", "the fix", "fixed by", "workaround",
];

/// Error/fix/exception lexicon used by preservation rules and complexity
/// scoring.
pub fn has_error_vocabulary(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_VOCAB.iter().any(|t| lower.contains(t))
}

pub fn has_solution_language(text: &str) -> bool {
    let lower = text.to_lowercase();
    SOLUTION_VOCAB.iter().any(|t| lower.contains(t))
}

/// Question heuristic: a question mark, or an opening how/what/why/explain.
pub fn is_question(text: &str) -> bool {
    if text.contains('?') {
        return true;
    }
    let lower = text.trim_start().to_lowercase();
    ["how ", "what ", "why ", "explain ", "can you", "could you"]
        .iter()
        .any(|p| lower.starts_with(p))
}

/// At least two distinct technical-dictionary terms present.
pub fn has_technical_vocabulary(text: &str) -> bool {
    extract_keywords(text).iter().filter(|w| is_technical_term(w)).take(2).count() >= 2
}

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

/// Lowercased, stopword-filtered keyword set. Tokens shorter than three
/// characters are dropped.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| w.len() >= 3 && !is_stopword(w))
        .map(|w| w.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Weighted Jaccard similarity over keyword sets in [0,1]. Three boosts
/// ride on top of the base overlap: shared technical terms, shared
/// canonical important terms, and a high overlap ratio (≥ 0.5) of the
/// smaller set. Identical content short-circuits to 1.0.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let ka = extract_keywords(a);
    let kb = extract_keywords(b);
    if ka.is_empty() || kb.is_empty() {
        return 0.0;
    }

    let intersection: Vec<&String> = ka.intersection(&kb).collect();
    let union_len = ka.union(&kb).count();
    let jaccard = intersection.len() as f64 / union_len as f64;

    let tech_common = intersection.iter().filter(|w| is_technical_term(w)).count();
    let tech_boost = (tech_common as f64 * 0.05).min(0.15);

    let important_common =
        intersection.iter().filter(|w| IMPORTANT_TERMS.contains(&w.as_str())).count();
    let important_boost = (important_common as f64 * 0.10).min(0.20);

    let smaller = ka.len().min(kb.len());
    let overlap_ratio = intersection.len() as f64 / smaller as f64;
    let overlap_boost = if overlap_ratio >= 0.5 { 0.15 } else { 0.0 };

    (jaccard + tech_boost + important_boost + overlap_boost).min(1.0)
}

/// Plain content-word overlap ratio against the smaller set, in [0,1].
pub fn word_overlap(a: &str, b: &str) -> f64 {
    let ka = extract_keywords(a);
    let kb = extract_keywords(b);
    let smaller = ka.len().min(kb.len());
    if smaller == 0 {
        return 0.0;
    }
    ka.intersection(&kb).count() as f64 / smaller as f64
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Identify the dominant topics across a message window. Keywords are
/// scored frequency × importance, where technical terms and long tokens
/// weigh higher and tokens appearing in user messages are weighted up.
/// Returns the top `max(5, ceil(0.4 × message_count))` keywords.
pub fn identify_topics(messages: &[Message]) -> Vec<String> {
    let mut freq: HashMap<String, f64> = HashMap::new();
    let mut in_user: BTreeSet<String> = BTreeSet::new();

    for msg in messages {
        for word in extract_keywords(&msg.content) {
            *freq.entry(word.clone()).or_insert(0.0) += 1.0;
            if msg.role == Role::User {
                in_user.insert(word);
            }
        }
    }

    let mut scored: Vec<(String, f64)> = freq
        .into_iter()
        .map(|(word, count)| {
            let mut importance = 1.0;
            if is_technical_term(&word) {
                importance *= 2.0;
            }
            if word.len() >= 8 {
                importance *= 1.5;
            }
            if in_user.contains(&word) {
                importance *= 1.5;
            }
            (word, count * importance)
        })
        .collect();

    // Deterministic: score descending, then lexicographic.
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(&b.0))
    });

    let k = 5usize.max((messages.len() as f64 * 0.4).ceil() as usize);
    scored.into_iter().take(k).map(|(w, _)| w).collect()
}

// ---------------------------------------------------------------------------
// Breakpoints
// ---------------------------------------------------------------------------

/// Indices where the conversation plausibly changes subject: both adjacent
/// similarities fall below 0.3, or a user message opens with a new-topic
/// indicator.
pub fn detect_breakpoints(messages: &[Message]) -> Vec<usize> {
    let mut breakpoints = Vec::new();
    for i in 1..messages.len() {
        let msg = &messages[i];
        if msg.role == Role::User && starts_new_topic(&msg.content) {
            breakpoints.push(i);
            continue;
        }
        if i + 1 < messages.len() {
            let before = similarity(&messages[i - 1].content, &msg.content);
            let after = similarity(&msg.content, &messages[i + 1].content);
            if before < 0.3 && after < 0.3 {
                breakpoints.push(i);
            }
        }
    }
    breakpoints
}
