//! Root engine value owning the semantic index, caches, worker pool, and
//! rollback registry.
//!
//! There is no global state: construct an [`Engine`] from an
//! [`EngineConfig`] and pass it where it is needed. Tests build fresh
//! engines per case.

use crate::cache::{LruCache, PersistentCache};
use crate::compaction::{CompactionEngine, CompactionResult, UtilityReport};
use crate::config::{CompactionOptions, EngineConfig};
use crate::error::{CoreError, CoreResult};
use crate::index::{SharedIndex, SymbolRef};
use crate::indexer::WorkspaceIndexer;
use crate::relevance::{self, RelevanceContext, RelevanceWeights};
use crate::sampler::{self, SamplerConfig};
use crate::session::{AutoSaver, LoadedSession, SessionMetadata, SessionState, SessionStore};
use crate::tokenizer::{CharEstimateTokenizer, Tokenizer};
use crate::types::{
    ChangeEvent, ContentSample, FileIndex, IndexStats, Message, RelevanceScore,
};
use crate::watch::{relativize_batch, FileWatcher};
use crate::workers::{PoolStats, Task, TaskHandle, WorkerPool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Access tracking
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AccessTracker {
    recent: Vec<(String, i64)>,
    counts: HashMap<String, u32>,
}

impl AccessTracker {
    fn record(&mut self, path: &str, now_ms: i64) {
        self.recent.retain(|(p, _)| p != path);
        self.recent.push((path.to_string(), now_ms));
        // A short tail is enough for the recency signal.
        if self.recent.len() > 64 {
            self.recent.remove(0);
        }
        *self.counts.entry(path.to_string()).or_insert(0) += 1;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: EngineConfig,
    index: SharedIndex,
    indexer: Arc<WorkspaceIndexer>,
    tokenizer: Arc<dyn Tokenizer>,
    compaction: CompactionEngine,
    pool: WorkerPool,
    file_cache: LruCache<FileIndex>,
    relevance_cache: LruCache<Vec<RelevanceScore>>,
    symbol_cache: LruCache<Vec<SymbolRef>>,
    persistent: Option<PersistentCache>,
    session: Option<SessionStore>,
    access: Mutex<AccessTracker>,
    current_file: Mutex<Option<String>>,
    user_preferences: Mutex<serde_json::Map<String, serde_json::Value>>,
    cancel: Arc<AtomicBool>,
    total_queries: AtomicU64,
    session_start: String,
    watcher: Mutex<Option<FileWatcher>>,
    auto_saver: Mutex<Option<AutoSaver>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        config.validate()?;
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(CharEstimateTokenizer);
        let indexer = Arc::new(WorkspaceIndexer::new(config.indexer.clone())?);
        let pool = WorkerPool::new(&config.workers)?;

        let persistent = match &config.persistent_cache.cache_dir {
            Some(dir) => Some(PersistentCache::open(dir.clone(), &config.persistent_cache)?),
            None => None,
        };
        let session = config.session_path.clone().map(SessionStore::new);

        // The file-index cache is memory-only and capped by
        // `max_loaded_files` rather than the generic entry bound.
        let file_cache_config = crate::config::CacheConfig {
            max_entries: config.indexer.max_loaded_files.max(1),
            cache_dir: None,
            ..config.file_index_cache.clone()
        };

        let engine = Self {
            file_cache: LruCache::new(&file_cache_config),
            relevance_cache: LruCache::new(&config.relevance_cache),
            symbol_cache: LruCache::new(&config.symbol_cache),
            index: SharedIndex::new(),
            compaction: CompactionEngine::new(Arc::clone(&tokenizer)),
            tokenizer,
            indexer,
            pool,
            persistent,
            session,
            access: Mutex::new(AccessTracker::default()),
            current_file: Mutex::new(None),
            user_preferences: Mutex::new(serde_json::Map::new()),
            cancel: Arc::new(AtomicBool::new(false)),
            total_queries: AtomicU64::new(0),
            session_start: chrono::Utc::now().to_rfc3339(),
            watcher: Mutex::new(None),
            auto_saver: Mutex::new(None),
            config,
        };
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn index(&self) -> &SharedIndex {
        &self.index
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Cooperative cancellation token for long operations.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    // -----------------------------------------------------------------------
    // Indexing
    // -----------------------------------------------------------------------

    pub fn index_roots(&self) -> CoreResult<IndexStats> {
        self.indexer.index_roots(&self.index, Some(&self.cancel))
    }

    pub fn sync_root(&self, root: &Path) -> CoreResult<Vec<ChangeEvent>> {
        self.indexer.sync_root(root, &self.index)
    }

    pub fn file_index(&self, path: &str) -> Option<FileIndex> {
        let revision = self.index.read(|idx| idx.last_updated());
        let key = format!("{path}:{revision}");
        if let Some(cached) = self.file_cache.get(&key) {
            return Some(cached);
        }
        let file = self.index.read(|idx| idx.get_file(path).map(|f| (*f).clone()))?;
        self.file_cache.insert(key, file.clone());
        Some(file)
    }

    /// Start watching every configured root, feeding incremental syncs.
    pub fn start_watcher(&self) -> CoreResult<()> {
        let roots = self.config.indexer.roots.clone();
        let indexer = Arc::clone(&self.indexer);
        let index = self.index.clone();
        let watch_roots = roots.clone();
        let watcher = FileWatcher::start(&roots, move |batch| {
            for root in &watch_roots {
                if relativize_batch(root, &batch).is_empty() {
                    continue;
                }
                if let Err(e) = indexer.sync_root(root, &index) {
                    debug!(root = %root.display(), error = %e, "watch sync failed");
                }
            }
        })?;
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Access patterns
    // -----------------------------------------------------------------------

    /// Record that the user opened or referenced a file.
    pub fn record_access(&self, path: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        self.access.lock().unwrap_or_else(|e| e.into_inner()).record(path, now);
    }

    pub fn set_current_file(&self, path: Option<String>) {
        *self.current_file.lock().unwrap_or_else(|e| e.into_inner()) = path;
    }

    fn relevance_context(&self) -> RelevanceContext {
        let access = self.access.lock().unwrap_or_else(|e| e.into_inner());
        RelevanceContext {
            current_file: self.current_file.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            recent_files: access.recent.clone(),
            access_counts: access.counts.clone(),
            now_ms: None,
        }
    }

    // -----------------------------------------------------------------------
    // Relevance and sampling
    // -----------------------------------------------------------------------

    /// Rank all indexed files against a query, consulting the score cache.
    pub fn rank(&self, query: &str) -> CoreResult<Vec<RelevanceScore>> {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let snapshot = self.index.snapshot();
        let candidates: Vec<String> = snapshot.files.keys().cloned().collect();
        let context = self.relevance_context();

        // The index revision rides on the key so mutations invalidate
        // cached rankings without waiting out the TTL.
        let key = format!(
            "{}:{}",
            relevance::relevance_cache_key(query, &candidates, context.current_file.as_deref()),
            snapshot.last_updated
        );
        if let Some(cached) = self.relevance_cache.get(&key) {
            debug!(query, "relevance cache hit");
            return Ok(cached);
        }

        let graph = self.index.read(|idx| idx.build_import_graph());
        let ranked = relevance::rank_files(
            &snapshot,
            &graph,
            query,
            None,
            &context,
            &RelevanceWeights {
                access_decay_rate: self.config.recency_decay_rate,
                ..Default::default()
            },
        );
        self.relevance_cache.insert(key, ranked.clone());
        Ok(ranked)
    }

    /// Rank files and assemble a budgeted content sample set.
    pub fn rank_with_samples(
        &self,
        query: &str,
        budget: usize,
    ) -> CoreResult<Vec<ContentSample>> {
        if budget == 0 {
            return Err(CoreError::InvalidConfig("sample budget must be positive".to_string()));
        }
        let ranked = self.rank(query)?;
        let top: Vec<(RelevanceScore, FileIndex)> = ranked
            .into_iter()
            .filter_map(|score| {
                self.file_index(&score.path).map(|fi| (score, fi))
            })
            .take(16)
            .collect();

        let roots = self.config.indexer.roots.clone();
        let samples = sampler::sample_ranked(
            &top,
            |rel| read_from_roots(&roots, rel),
            query,
            budget,
            &SamplerConfig::default(),
            self.tokenizer.as_ref(),
        );
        Ok(samples)
    }

    pub fn symbol_references(&self, name: &str) -> Vec<SymbolRef> {
        let revision = self.index.read(|idx| idx.last_updated());
        let key = format!("{name}:{revision}");
        if let Some(cached) = self.symbol_cache.get(&key) {
            return cached;
        }
        let refs = self.index.read(|idx| idx.symbol_references(name));
        self.symbol_cache.insert(key, refs.clone());
        refs
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    pub fn compact(
        &self,
        messages: &[Message],
        options: &CompactionOptions,
    ) -> CoreResult<CompactionResult> {
        self.compaction.compact(messages, options)
    }

    pub fn rollback(&self, token: &str) -> CoreResult<Vec<Message>> {
        self.compaction.rollback(token)
    }

    pub fn evaluate_utility(&self, original: &[Message], compacted: &[Message]) -> UtilityReport {
        self.compaction.evaluate_utility(original, compacted)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn session_store(&self) -> CoreResult<&SessionStore> {
        self.session.as_ref().ok_or_else(|| {
            CoreError::InvalidConfig("no session_path configured".to_string())
        })
    }

    /// Snapshot the engine into a serializable session state.
    pub fn session_state(&self) -> SessionState {
        let index = self.index.read(|idx| idx.serialize()).unwrap_or_default();
        let access = self.access.lock().unwrap_or_else(|e| e.into_inner());
        let current_files: Vec<String> =
            access.recent.iter().rev().map(|(p, _)| p.clone()).collect();
        SessionState {
            index,
            current_files,
            user_preferences: self
                .user_preferences
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            session_metadata: SessionMetadata {
                start_time: self.session_start.clone(),
                last_activity: chrono::Utc::now().to_rfc3339(),
                total_queries: self.total_queries.load(Ordering::Relaxed),
                cost_analytics: None,
                extra: None,
            },
            ..Default::default()
        }
    }

    pub fn save_session(&self) -> CoreResult<()> {
        let store = self.session_store()?;
        // Keep a known-good snapshot before overwriting.
        store.create_backup()?;
        store.save(&self.session_state())
    }

    /// Load the saved session and restore the semantic index from it.
    /// Returns `None` when nothing was ever saved; recoveries surface as
    /// warnings on the loaded value.
    pub fn load_session(&self) -> CoreResult<Option<LoadedSession>> {
        let store = self.session_store()?;
        let Some(mut loaded) = store.load()? else { return Ok(None) };

        if !loaded.state.index.is_empty() {
            match crate::index::SemanticIndex::deserialize(&loaded.state.index) {
                Ok(restored) => {
                    self.index.write(|idx| *idx = restored);
                    info!(files = self.index.read(|i| i.len()), "index restored from session");
                }
                Err(e) => {
                    loaded.warnings.push(format!("index unreadable ({e}), starting empty"));
                }
            }
        }
        for path in &loaded.state.current_files {
            self.record_access(path);
        }
        *self.user_preferences.lock().unwrap_or_else(|e| e.into_inner()) =
            loaded.state.user_preferences.clone();
        Ok(Some(loaded))
    }

    pub fn create_backup(&self) -> CoreResult<()> {
        self.session_store()?.create_backup()
    }

    pub fn restore_from_backup(&self) -> CoreResult<Option<LoadedSession>> {
        self.session_store()?.restore_from_backup()
    }

    pub fn set_preference(&self, key: &str, value: serde_json::Value) {
        self.user_preferences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
    }

    /// Start the periodic auto-save loop, if an interval is configured.
    pub fn start_auto_save(self: &Arc<Self>) -> CoreResult<()> {
        let Some(interval) = self.config.auto_save_interval else {
            return Ok(());
        };
        let store = SessionStore::new(
            self.session_store()?.path().clone(),
        );
        let engine = Arc::clone(self);
        let saver = AutoSaver::start(store, interval, move || engine.session_state());
        *self.auto_saver.lock().unwrap_or_else(|e| e.into_inner()) = Some(saver);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker pool
    // -----------------------------------------------------------------------

    pub fn submit(&self, task: Task) -> TaskHandle {
        self.pool.submit(task)
    }

    pub fn submit_batch(&self, tasks: Vec<Task>) -> Vec<TaskHandle> {
        self.pool.submit_batch(tasks)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Persist the serialized index into the persistent cache tier, when
    /// one is configured.
    pub fn cache_serialized_index(&self) -> CoreResult<()> {
        let Some(cache) = &self.persistent else {
            return Ok(());
        };
        let serialized = self.index.read(|idx| idx.serialize())?;
        cache.set("semantic-index", &serialized);
        Ok(())
    }

    pub fn cached_serialized_index(&self) -> Option<String> {
        self.persistent.as_ref()?.get("semantic-index")
    }

    /// Stop the watcher and auto-saver. The pool shuts down on drop.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(saver) = self.auto_saver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            saver.stop();
        }
    }
}

fn read_from_roots(roots: &[PathBuf], rel: &str) -> Option<String> {
    for root in roots {
        let candidate = root.join(rel);
        if candidate.exists() {
            return std::fs::read_to_string(candidate).ok();
        }
    }
    None
}
