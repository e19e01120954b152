//! Validated configuration records.
//!
//! Every tunable from the public option surface lives here as an explicit
//! field with a default. Validation happens at construction via
//! `validate()`; operations never re-check options at use sites.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

/// Default source extensions indexed when no allowlist is configured.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "rs", "go", "java", "kt", "rb", "c", "h",
    "cpp", "hpp", "cs", "swift", "scala",
];

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Root directories to walk.
    pub roots: Vec<PathBuf>,
    /// Maximum directory-walk depth.
    pub max_depth: usize,
    /// Extension allowlist. Empty falls back to [`DEFAULT_EXTENSIONS`].
    pub file_extensions: HashSet<String>,
    /// Glob denylist applied to relative paths.
    pub exclude_patterns: Vec<String>,
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    /// Caps the in-memory LRU of FileIndex records.
    pub max_loaded_files: usize,
    /// Test files are excluded unless set.
    pub include_tests: bool,
    /// Concurrent file reads per root.
    pub concurrency: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            max_depth: 20,
            file_extensions: HashSet::new(),
            exclude_patterns: Vec::new(),
            max_file_size: 1024 * 1024,
            max_loaded_files: 10_000,
            include_tests: false,
            concurrency: 10,
        }
    }
}

impl IndexerConfig {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots, ..Self::default() }
    }

    /// Effective extension set: the configured allowlist or the defaults.
    pub fn extensions(&self) -> HashSet<String> {
        if self.file_extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
        } else {
            self.file_extensions.clone()
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.roots.is_empty() {
            return Err(CoreError::InvalidConfig("at least one root is required".into()));
        }
        if self.max_file_size == 0 {
            return Err(CoreError::InvalidConfig("max_file_size must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(CoreError::InvalidConfig("concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Caches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_bytes: usize,
    pub max_entries: usize,
    pub ttl: Option<Duration>,
    /// Directory for the persistent tier. `None` keeps the cache
    /// memory-only.
    pub cache_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            max_entries: 4096,
            ttl: Some(Duration::from_secs(60 * 60)),
            cache_dir: None,
        }
    }
}

impl CacheConfig {
    /// Relevance scores go stale quickly as conversation state moves.
    pub fn relevance_default() -> Self {
        Self { ttl: Some(Duration::from_secs(30 * 60)), ..Self::default() }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.max_entries == 0 {
            return Err(CoreError::InvalidConfig("cache max_entries must be positive".into()));
        }
        if self.max_bytes == 0 {
            return Err(CoreError::InvalidConfig("cache max_bytes must be positive".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Message scoring
// ---------------------------------------------------------------------------

/// Weights over the four message-scoring dimensions. Must sum to 1 within
/// 1e-3 or scoring fails with `InvalidConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub recency: f64,
    pub relevance: f64,
    pub interaction: f64,
    pub complexity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { recency: 0.25, relevance: 0.35, interaction: 0.20, complexity: 0.20 }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> CoreResult<()> {
        for (name, w) in [
            ("recency", self.recency),
            ("relevance", self.relevance),
            ("interaction", self.interaction),
            ("complexity", self.complexity),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(CoreError::InvalidConfig(format!(
                    "scoring weight `{name}` must be in [0,1], got {w}"
                )));
            }
        }
        let sum = self.recency + self.relevance + self.interaction + self.complexity;
        if (sum - 1.0).abs() > 1e-3 {
            return Err(CoreError::InvalidConfig(format!(
                "scoring weights must sum to 1.0 (±1e-3), got {sum}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionLevel {
    Light,
    Moderate,
    Aggressive,
}

impl CompactionLevel {
    /// Fraction of messages retained at this level.
    pub fn retention_rate(&self) -> f64 {
        match self {
            CompactionLevel::Light => 0.80,
            CompactionLevel::Moderate => 0.50,
            CompactionLevel::Aggressive => 0.25,
        }
    }
}

/// Named preservation rules applied during score-based compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreservationRule {
    ErrorResolution,
    CodeBlocks,
    TechnicalDiscussion,
}

/// Multipliers applied to raw message scores by detected content kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContentTypeWeights {
    pub code_blocks: f64,
    pub errors: f64,
    pub questions: f64,
    pub solutions: f64,
    pub technical: f64,
}

impl Default for ContentTypeWeights {
    fn default() -> Self {
        Self { code_blocks: 1.0, errors: 1.0, questions: 1.0, solutions: 1.0, technical: 1.0 }
    }
}

/// A caller-supplied predicate that forces retention of matching messages.
pub type MessagePredicate = std::sync::Arc<dyn Fn(&crate::types::Message) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct CompactionOptions {
    /// Explicit level always wins over selection heuristics.
    pub level: Option<CompactionLevel>,
    /// Target compression ratio in (0,1); drives level selection when no
    /// explicit level is given, and dynamic adjustment when enabled.
    pub target_compression: Option<f64>,
    /// Token ceiling used by `auto_select_level`.
    pub max_tokens: Option<usize>,
    pub auto_select_level: bool,
    /// Run thread-based compaction instead of score-based.
    pub use_threads: bool,
    pub prefer_complete_threads: bool,
    pub merge_related_threads: bool,
    pub enable_rollback: bool,
    pub rollback_ttl: Option<Duration>,
    pub preservation_rules: Vec<PreservationRule>,
    pub custom_preservers: Vec<MessagePredicate>,
    pub content_type_weights: Option<ContentTypeWeights>,
    pub allow_dynamic_adjustment: bool,
    pub include_semantic_metrics: bool,
    pub include_thread_metrics: bool,
    pub include_context_metrics: bool,
    /// Conversation focus used by the relevance dimension. Empty yields a
    /// uniform 0.5 relevance.
    pub current_context: String,
    pub weights: ScoringWeights,
}

impl std::fmt::Debug for CompactionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionOptions")
            .field("level", &self.level)
            .field("target_compression", &self.target_compression)
            .field("max_tokens", &self.max_tokens)
            .field("auto_select_level", &self.auto_select_level)
            .field("use_threads", &self.use_threads)
            .field("enable_rollback", &self.enable_rollback)
            .field("preservation_rules", &self.preservation_rules)
            .field("custom_preservers", &self.custom_preservers.len())
            .field("allow_dynamic_adjustment", &self.allow_dynamic_adjustment)
            .finish_non_exhaustive()
    }
}

impl CompactionOptions {
    pub fn validate(&self) -> CoreResult<()> {
        self.weights.validate()?;
        if let Some(t) = self.target_compression {
            if !(0.0..1.0).contains(&t) {
                return Err(CoreError::InvalidConfig(format!(
                    "target_compression must be in [0,1), got {t}"
                )));
            }
        }
        if let Some(w) = &self.content_type_weights {
            for (name, v) in [
                ("code_blocks", w.code_blocks),
                ("errors", w.errors),
                ("questions", w.questions),
                ("solutions", w.solutions),
                ("technical", w.technical),
            ] {
                if v < 0.0 {
                    return Err(CoreError::InvalidConfig(format!(
                        "content type weight `{name}` must be non-negative, got {v}"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool size. Defaults to `max(2, min(8, ceil(0.75 * cores)))`.
    pub workers: usize,
    /// Soft queue bound; submissions past it only grow the queued counter.
    pub queue_soft_limit: usize,
    pub default_timeout: Duration,
}

/// Default pool size derived from the machine's core count.
pub fn default_worker_count() -> usize {
    let cores = num_cpus::get();
    ((cores as f64 * 0.75).ceil() as usize).clamp(2, 8)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            queue_soft_limit: 256,
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.workers == 0 {
            return Err(CoreError::InvalidConfig("worker pool needs at least one worker".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub indexer: IndexerConfig,
    pub file_index_cache: CacheConfig,
    pub relevance_cache: CacheConfig,
    pub symbol_cache: CacheConfig,
    pub persistent_cache: CacheConfig,
    pub workers: WorkerConfig,
    /// Base of the exponential decay used by recency scoring.
    pub recency_decay_rate: f64,
    /// Interval for the background auto-save thread. `None` disables it.
    pub auto_save_interval: Option<Duration>,
    /// Session file location. `None` disables persistence.
    pub session_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            indexer: IndexerConfig::default(),
            file_index_cache: CacheConfig::default(),
            relevance_cache: CacheConfig::relevance_default(),
            symbol_cache: CacheConfig::default(),
            persistent_cache: CacheConfig::default(),
            workers: WorkerConfig::default(),
            recency_decay_rate: 0.95,
            auto_save_interval: None,
            session_path: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.indexer.validate()?;
        self.file_index_cache.validate()?;
        self.relevance_cache.validate()?;
        self.symbol_cache.validate()?;
        self.persistent_cache.validate()?;
        self.workers.validate()?;
        if !(0.0..1.0).contains(&self.recency_decay_rate) {
            return Err(CoreError::InvalidConfig(format!(
                "recency_decay_rate must be in [0,1), got {}",
                self.recency_decay_rate
            )));
        }
        Ok(())
    }
}
