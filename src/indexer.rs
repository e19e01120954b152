//! Workspace walking and incremental index maintenance.
//!
//! Walks configured roots honoring `.gitignore` and `.platoignore`, applies
//! the extension allowlist, exclude globs, and size cap, then analyzes
//! files in bounded batches. Change detection is hash-based: a file whose
//! content hash matches the stored record is skipped. Per-file failures
//! are logged and skipped; a failing root aborts only that root's scan.

use crate::analyzer::{analyze_file, content_hash};
use crate::config::IndexerConfig;
use crate::error::{CoreError, CoreResult};
use crate::index::SharedIndex;
use crate::types::{ChangeEvent, IndexStats};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Path fragments that mark test files, excluded unless configured in.
const TEST_MARKERS: &[&str] =
    &[".test.", ".spec.", "_test.", "/tests/", "/test/", "/__tests__/"];

#[derive(Debug)]
pub struct WorkspaceIndexer {
    config: IndexerConfig,
    exclude: GlobSet,
    /// Paths attributed to each root by the most recent scan; drives
    /// deletion detection in `sync_root`.
    seen: Mutex<HashMap<PathBuf, BTreeSet<String>>>,
}

impl WorkspaceIndexer {
    pub fn new(config: IndexerConfig) -> CoreResult<Self> {
        config.validate()?;
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                CoreError::InvalidConfig(format!("exclude pattern `{pattern}`: {e}"))
            })?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| CoreError::InvalidConfig(format!("exclude patterns: {e}")))?;
        Ok(Self { config, exclude, seen: Mutex::new(HashMap::new()) })
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Full pass over every configured root. Unchanged files are skipped by
    /// hash; files present in the index but gone from disk are removed.
    /// Cancellation is observed at batch boundaries.
    pub fn index_roots(
        &self,
        index: &SharedIndex,
        cancel: Option<&AtomicBool>,
    ) -> CoreResult<IndexStats> {
        let started = Instant::now();
        let mut stats = IndexStats::default();
        let mut on_disk: BTreeSet<String> = BTreeSet::new();

        for root in &self.config.roots {
            match self.scan_root(root, index, cancel, &mut stats) {
                Ok(paths) => {
                    self.seen
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(root.clone(), paths.clone());
                    on_disk.extend(paths);
                }
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "root scan aborted");
                }
            }
        }

        // Deletion pass: anything indexed but no longer on disk.
        let stale: Vec<String> = index.read(|idx| {
            idx.paths().filter(|p| !on_disk.contains(*p)).map(|p| p.to_string()).collect()
        });
        for path in &stale {
            index.write(|idx| idx.remove_file(path));
        }
        stats.deletions = stale.len();
        stats.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            indexed = stats.files_indexed,
            unchanged = stats.files_unchanged,
            skipped = stats.files_skipped,
            deletions = stats.deletions,
            time_ms = stats.duration_ms,
            "workspace index pass complete"
        );
        Ok(stats)
    }

    /// Incremental pass over one root, returning the observed changes.
    pub fn sync_root(&self, root: &Path, index: &SharedIndex) -> CoreResult<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        let candidates = self.collect_candidates(root)?;

        let previous: BTreeSet<String> = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(root)
            .cloned()
            .unwrap_or_default();

        let mut current: BTreeSet<String> = BTreeSet::new();
        for batch in candidates.chunks(self.config.concurrency.max(1)) {
            let analyzed = self.analyze_batch(batch, index);
            for (rel_path, file) in analyzed {
                current.insert(rel_path.clone());
                match file {
                    BatchOutcome::Added(fi) => {
                        index.write(|idx| idx.add_file(fi));
                        events.push(ChangeEvent::Added(rel_path));
                    }
                    BatchOutcome::Modified(fi) => {
                        index.write(|idx| idx.add_file(fi));
                        events.push(ChangeEvent::Modified(rel_path));
                    }
                    BatchOutcome::Unchanged => {}
                    BatchOutcome::Failed => {}
                }
            }
        }

        for gone in previous.difference(&current) {
            if index.write(|idx| idx.remove_file(gone)) {
                events.push(ChangeEvent::Deleted(gone.clone()));
            }
        }

        self.seen.lock().unwrap_or_else(|e| e.into_inner()).insert(root.to_path_buf(), current);
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Walking
    // -----------------------------------------------------------------------

    fn collect_candidates(&self, root: &Path) -> CoreResult<Vec<(PathBuf, String)>> {
        if !root.exists() {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("root {} not found", root.display()),
            )));
        }

        let extensions = self.config.extensions();
        let mut candidates = Vec::new();

        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .add_custom_ignore_filename(".platoignore")
            .max_depth(Some(self.config.max_depth))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "walk entry error");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let abs = entry.into_path();
            let ext = abs.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !extensions.contains(ext) {
                continue;
            }
            let rel = abs
                .strip_prefix(root)
                .unwrap_or(&abs)
                .to_string_lossy()
                .replace('\\', "/");
            if self.exclude.is_match(&rel) {
                continue;
            }
            if !self.config.include_tests {
                let probe = format!("/{rel}");
                if TEST_MARKERS.iter().any(|m| probe.contains(m)) {
                    continue;
                }
            }
            if let Ok(meta) = abs.metadata() {
                if meta.len() > self.config.max_file_size {
                    debug!(path = rel.as_str(), size = meta.len(), "file over size cap, skipped");
                    continue;
                }
            }
            candidates.push((abs, rel));
        }

        candidates.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(candidates)
    }

    fn scan_root(
        &self,
        root: &Path,
        index: &SharedIndex,
        cancel: Option<&AtomicBool>,
        stats: &mut IndexStats,
    ) -> CoreResult<BTreeSet<String>> {
        let candidates = self.collect_candidates(root)?;
        let mut seen: BTreeSet<String> = BTreeSet::new();

        // Bounded batches keep memory flat on large roots and give the
        // cancellation token a place to land.
        for batch in candidates.chunks(self.config.concurrency.max(1)) {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                return Err(CoreError::Cancelled);
            }
            let analyzed = self.analyze_batch(batch, index);
            for (rel_path, outcome) in analyzed {
                seen.insert(rel_path);
                match outcome {
                    BatchOutcome::Added(fi) | BatchOutcome::Modified(fi) => {
                        index.write(|idx| idx.add_file(fi));
                        stats.files_indexed += 1;
                    }
                    BatchOutcome::Unchanged => stats.files_unchanged += 1,
                    BatchOutcome::Failed => stats.files_skipped += 1,
                }
            }
        }

        Ok(seen)
    }

    fn analyze_batch(
        &self,
        batch: &[(PathBuf, String)],
        index: &SharedIndex,
    ) -> Vec<(String, BatchOutcome)> {
        let known: HashMap<String, String> = index.read(|idx| {
            batch
                .iter()
                .filter_map(|(_, rel)| {
                    idx.get_file(rel).map(|f| (rel.clone(), f.content_hash.clone()))
                })
                .collect()
        });

        batch
            .par_iter()
            .map(|(abs, rel)| {
                let content = match fs::read_to_string(abs) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path = rel.as_str(), error = %e, "read failed, file skipped");
                        return (rel.clone(), BatchOutcome::Failed);
                    }
                };
                let hash = content_hash(content.as_bytes());
                let previously = known.get(rel);
                if previously == Some(&hash) {
                    return (rel.clone(), BatchOutcome::Unchanged);
                }

                let modified = abs
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                let file = analyze_file(rel, &content, modified);
                let outcome = if previously.is_some() {
                    BatchOutcome::Modified(file)
                } else {
                    BatchOutcome::Added(file)
                };
                (rel.clone(), outcome)
            })
            .collect()
    }
}

enum BatchOutcome {
    Added(crate::types::FileIndex),
    Modified(crate::types::FileIndex),
    Unchanged,
    Failed,
}
