use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Conversation model
// ---------------------------------------------------------------------------

/// Who produced a message. System messages are never reordered or removed
/// by compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single transcript entry. Identity is positional: messages are
/// append-only and compaction returns new transcripts rather than mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds. Absent for messages imported from transcripts
    /// that never recorded wall-clock time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), timestamp: None }
    }

    pub fn with_timestamp(role: Role, content: impl Into<String>, ts: i64) -> Self {
        Self { role, content: content.into(), timestamp: Some(ts) }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// Whether the content carries a fenced code block.
    pub fn has_code_block(&self) -> bool {
        self.content.contains("```")
    }
}

// ---------------------------------------------------------------------------
// Workspace index model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Class,
    Interface,
    TypeAlias,
    Enum,
    Function,
    Method,
    Property,
    Variable,
    Namespace,
}

/// A named declaration within a file. Members form a shallow one-level
/// tree: classes list their methods/properties, which carry no members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based line of the declaration.
    pub line: usize,
    pub exported: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<Symbol>,
}

/// Per-file record of symbols, imports, exports, and a content hash used
/// for change detection. Uniquely keyed by `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIndex {
    pub path: String,
    pub symbols: Vec<Symbol>,
    /// Raw import specifiers as written in the source. Resolution against
    /// the index happens in the import graph; unresolved specifiers are
    /// retained as opaque strings.
    pub imports: Vec<String>,
    pub exports: Vec<String>,
    /// First 16 hex chars of SHA-256 over the file bytes.
    pub content_hash: String,
    pub size: u64,
    /// Epoch milliseconds of the last observed modification.
    pub last_modified: i64,
}

/// A change observed between the filesystem and the stored index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(String),
    Modified(String),
    Deleted(String),
}

impl ChangeEvent {
    pub fn path(&self) -> &str {
        match self {
            ChangeEvent::Added(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
        }
    }
}

/// Bidirectional import graph over indexed files. `imported_by` is a view
/// rebuilt from forward edges: an inverse entry exists iff the target path
/// is present in the index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportGraph {
    /// file -> resolved paths it imports
    pub imports: BTreeMap<String, Vec<String>>,
    /// file -> files that import it
    pub imported_by: BTreeMap<String, Vec<String>>,
}

/// Summary returned by a full `index_roots` pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub files_indexed: usize,
    pub files_skipped: usize,
    pub files_unchanged: usize,
    pub deletions: usize,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Relevance and sampling
// ---------------------------------------------------------------------------

/// The five bounded signals combined into a relevance score, each in [0,1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RelevanceSignals {
    pub direct_reference: f64,
    pub symbol_match: f64,
    pub import_chain: f64,
    pub recent_access: f64,
    pub user_pattern: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelevanceScore {
    pub path: String,
    /// Weighted combination of the signals, in [0,1].
    pub score: f64,
    /// How many signals contributed non-trivially, normalized to [0,1].
    pub confidence: f64,
    pub signals: RelevanceSignals,
}

/// A bounded content window extracted from a ranked file.
#[derive(Debug, Clone, Serialize)]
pub struct ContentSample {
    pub file: String,
    pub text: String,
    /// 1-based inclusive line range.
    pub start_line: usize,
    pub end_line: usize,
    pub tokens: usize,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// A contiguous run of non-system messages sharing a coherent topic.
/// Threads partition the non-system subsequence of a transcript: every
/// non-system message belongs to exactly one thread.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationThread {
    pub id: String,
    pub topic: String,
    /// Transcript indices of the member messages, in original order.
    pub message_indices: Vec<usize>,
    pub start_index: usize,
    pub end_index: usize,
    /// [0,1] importance from size, questions, code, and resolution cues.
    pub importance: f64,
    pub keywords: Vec<String>,
}

// ---------------------------------------------------------------------------
// Compaction accounting
// ---------------------------------------------------------------------------

/// Quality accounting for one compaction run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QualityMetrics {
    /// 1 − compacted/original message count.
    pub compression_ratio: f64,
    /// 1 − tokens(compacted)/tokens(original), same estimator throughout.
    pub token_reduction: f64,
    pub message_reduction: f64,
    /// 0.4·content + 0.3·context + 0.3·importance.
    pub information_preservation: f64,
    pub processing_time_ms: u64,
    pub effectiveness_score: f64,
    /// Epoch milliseconds when the metrics were computed.
    pub timestamp: i64,
}

/// One dynamic-adjustment step recorded when `target_compression` drove
/// post-selection correction.
#[derive(Debug, Clone, Serialize)]
pub struct Adjustment {
    pub added: usize,
    pub removed: usize,
    pub reason: String,
}
