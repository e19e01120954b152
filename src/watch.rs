//! File watcher for incremental live re-indexing.
//!
//! Wraps a `notify` watcher with a debounce window (100 ms of quiet) and a
//! coalescing ceiling (1 s): changes are batched until the filesystem goes
//! quiet, but a steady stream of events still flushes at least once per
//! second. The watcher handle must be kept alive; dropping it stops
//! watching.

use crate::error::CoreResult;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE_MS: u64 = 100;

/// Coalesce ceiling: a pending change never waits longer than this.
const COALESCE_MS: u64 = 1000;

pub struct FileWatcher {
    // Held only to keep the OS watches registered.
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Watch `roots` recursively, invoking `on_batch` with coalesced change
    /// batches. The callback runs on a dedicated thread.
    pub fn start(
        roots: &[PathBuf],
        on_batch: impl Fn(Vec<PathBuf>) + Send + 'static,
    ) -> CoreResult<Self> {
        let (tx, rx) = mpsc::channel::<Event>();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| std::io::Error::other(format!("watcher init: {e}")))?;

        for root in roots {
            if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
                warn!(root = %root.display(), error = %e, "failed to watch root");
            } else {
                debug!(root = %root.display(), "watching");
            }
        }

        std::thread::spawn(move || debounce_loop(rx, on_batch));
        Ok(Self { _watcher: watcher })
    }
}

/// Collect file events and flush them once the debounce window passes or
/// the oldest pending change hits the coalesce ceiling.
fn debounce_loop(rx: mpsc::Receiver<Event>, on_batch: impl Fn(Vec<PathBuf>)) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(DEBOUNCE_MS)) {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.entry(path).or_insert(now);
                    }
                }
                flush_ready(&mut pending, &on_batch, false);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                flush_ready(&mut pending, &on_batch, true);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                if !pending.is_empty() {
                    let batch: Vec<PathBuf> = pending.drain().map(|(p, _)| p).collect();
                    on_batch(batch);
                }
                break;
            }
        }
    }
}

fn flush_ready(
    pending: &mut HashMap<PathBuf, Instant>,
    on_batch: &impl Fn(Vec<PathBuf>),
    quiet: bool,
) {
    if pending.is_empty() {
        return;
    }
    let now = Instant::now();
    let oldest_age = pending.values().map(|t| now.duration_since(*t)).max().unwrap_or_default();

    // Flush on quiet (debounce elapsed) or when changes have been held for
    // the full coalesce window.
    if quiet || oldest_age >= Duration::from_millis(COALESCE_MS) {
        let mut batch: Vec<PathBuf> = pending.drain().map(|(p, _)| p).collect();
        batch.sort();
        debug!(changes = batch.len(), "flushing watch batch");
        on_batch(batch);
    }
}

/// Filter a raw change batch down to paths under `root`, rel-path encoded.
pub fn relativize_batch(root: &Path, batch: &[PathBuf]) -> Vec<String> {
    batch
        .iter()
        .filter_map(|p| p.strip_prefix(root).ok())
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect()
}
