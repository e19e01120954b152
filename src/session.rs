//! Durable session persistence with backup and tolerant loading.
//!
//! The session file is JSON with a fixed top-level shape; a sibling
//! `.backup.json` holds the last known-good snapshot and is consulted when
//! the primary fails to parse. Loading never crashes on bad data: corrupt
//! or mistyped fields fall back to defaults and surface as structured
//! warnings on the loaded value.

use crate::cache::atomic_write;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const SESSION_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// State shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// ISO-8601 creation time of the session.
    pub start_time: String,
    pub last_activity: String,
    pub total_queries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_analytics: Option<Value>,
    /// Opaque adapter-owned slot (e.g. the auth collaborator's
    /// `{logged_in, user: {login, email?}}` record). The core never reads it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_activity: now,
            total_queries: 0,
            cost_analytics: None,
            extra: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: String,
    /// ISO-8601 time of the save.
    pub timestamp: String,
    /// Serialized semantic index (see `SemanticIndex::serialize`).
    pub index: String,
    pub current_files: Vec<String>,
    pub user_preferences: serde_json::Map<String, Value>,
    pub session_metadata: SessionMetadata,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            version: SESSION_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            index: String::new(),
            current_files: Vec::new(),
            user_preferences: serde_json::Map::new(),
            session_metadata: SessionMetadata::default(),
        }
    }
}

/// A loaded session plus any recoveries performed while reading it.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub state: SessionState,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("backup.json")
    }

    /// Persist the state atomically, stamping version and timestamp.
    pub fn save(&self, state: &SessionState) -> CoreResult<()> {
        let mut stamped = state.clone();
        stamped.version = SESSION_VERSION.to_string();
        stamped.timestamp = chrono::Utc::now().to_rfc3339();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&stamped)?;
        atomic_write(&self.path, body.as_bytes())?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }

    /// Copy the current primary into the backup slot. Called before risky
    /// operations so a bad write can be undone.
    pub fn create_backup(&self) -> CoreResult<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let body = fs::read(&self.path)?;
        atomic_write(&self.backup_path(), &body)?;
        debug!(path = %self.backup_path().display(), "session backup written");
        Ok(())
    }

    /// Load the session. `Ok(None)` means nothing was ever saved. Corrupt
    /// primaries fall back to the backup, then to a fresh state; every
    /// recovery is reported in `warnings`.
    pub fn load(&self) -> CoreResult<Option<LoadedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        match parse_session(&raw) {
            Ok(loaded) => Ok(Some(loaded)),
            Err(primary_err) => {
                warn!(error = %primary_err, "primary session corrupt, trying backup");
                match self.restore_from_backup()? {
                    Some(mut loaded) => {
                        loaded
                            .warnings
                            .insert(0, format!("primary session unreadable: {primary_err}"));
                        Ok(Some(loaded))
                    }
                    None => Ok(Some(LoadedSession {
                        state: SessionState::default(),
                        warnings: vec![
                            format!("primary session unreadable: {primary_err}"),
                            "no backup available, starting fresh".to_string(),
                        ],
                    })),
                }
            }
        }
    }

    /// Load from the backup slot, if present and parsable.
    pub fn restore_from_backup(&self) -> CoreResult<Option<LoadedSession>> {
        let backup = self.backup_path();
        if !backup.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&backup)?;
        match parse_session(&raw) {
            Ok(mut loaded) => {
                loaded.warnings.push("restored from backup".to_string());
                info!(path = %backup.display(), "session restored from backup");
                Ok(Some(loaded))
            }
            Err(e) => {
                warn!(error = %e, "backup session also corrupt");
                Ok(None)
            }
        }
    }
}

/// Field-tolerant parse: the document must be a JSON object, but each
/// field independently falls back to its default with a warning.
fn parse_session(raw: &str) -> CoreResult<LoadedSession> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| CoreError::Corrupt(format!("session: {e}")))?;
    let Value::Object(map) = value else {
        return Err(CoreError::Corrupt("session: not a JSON object".to_string()));
    };

    let mut warnings = Vec::new();
    let mut state = SessionState::default();

    match map.get("version") {
        Some(Value::String(v)) => state.version = v.clone(),
        Some(_) => warnings.push("version field mistyped, defaulted".to_string()),
        None => {}
    }
    match map.get("timestamp") {
        Some(Value::String(v)) => state.timestamp = v.clone(),
        Some(_) => warnings.push("timestamp field mistyped, defaulted".to_string()),
        None => {}
    }
    match map.get("index") {
        Some(Value::String(v)) => state.index = v.clone(),
        Some(_) => warnings.push("index field mistyped, reset to empty".to_string()),
        None => {}
    }
    match map.get("current_files") {
        Some(Value::Array(items)) => {
            state.current_files =
                items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect();
        }
        Some(_) => warnings.push("current_files not an array, reset".to_string()),
        None => {}
    }
    match map.get("user_preferences") {
        Some(Value::Object(prefs)) => state.user_preferences = prefs.clone(),
        Some(_) => warnings.push("user_preferences not an object, reset".to_string()),
        None => {}
    }
    match map.get("session_metadata") {
        Some(meta @ Value::Object(_)) => {
            match serde_json::from_value::<SessionMetadata>(meta.clone()) {
                Ok(parsed) => state.session_metadata = parsed,
                Err(e) => warnings.push(format!("session_metadata unreadable ({e}), defaulted")),
            }
        }
        Some(_) => warnings.push("session_metadata mistyped, defaulted".to_string()),
        None => {}
    }

    Ok(LoadedSession { state, warnings })
}

// ---------------------------------------------------------------------------
// Smart resume
// ---------------------------------------------------------------------------

/// Merge a saved runtime state with the current one. Saved preferences win
/// on conflict; file lists union (saved first when `prefer_saved`);
/// metadata keeps the earliest `start_time` and sums `total_queries`. The
/// merged state must carry `index`, `scorer`, and `sampler` components and
/// an array `current_files`, or the merge is rejected.
pub fn smart_resume(saved: &Value, current: &Value, prefer_saved: bool) -> CoreResult<Value> {
    let mut merged = current.clone();
    let Value::Object(out) = &mut merged else {
        return Err(CoreError::InvalidConfig("current state must be an object".to_string()));
    };
    let Value::Object(saved_map) = saved else {
        return Err(CoreError::InvalidConfig("saved state must be an object".to_string()));
    };

    // Components the saved state carries override absent current ones.
    for component in ["index", "scorer", "sampler"] {
        if !out.contains_key(component) {
            if let Some(v) = saved_map.get(component) {
                out.insert(component.to_string(), v.clone());
            }
        }
    }

    // Preferences: union, saved wins on conflict.
    let mut prefs = out
        .get("user_preferences")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    if let Some(saved_prefs) = saved_map.get("user_preferences").and_then(|v| v.as_object()) {
        for (k, v) in saved_prefs {
            prefs.insert(k.clone(), v.clone());
        }
    }
    out.insert("user_preferences".to_string(), Value::Object(prefs));

    // File lists: union, order governed by prefer_saved.
    let saved_files = string_list(saved_map.get("current_files"));
    let current_files = string_list(out.get("current_files"));
    let (first, second) =
        if prefer_saved { (&saved_files, &current_files) } else { (&current_files, &saved_files) };
    let mut files: Vec<String> = Vec::new();
    for f in first.iter().chain(second.iter()) {
        if !files.contains(f) {
            files.push(f.clone());
        }
    }
    out.insert("current_files".to_string(), json!(files));

    // Metadata: earliest start, summed query counts.
    let saved_meta = saved_map.get("session_metadata").and_then(|v| v.as_object());
    let current_meta = out.get("session_metadata").and_then(|v| v.as_object());
    let mut meta = current_meta.cloned().unwrap_or_default();
    if let Some(sm) = saved_meta {
        let saved_start = sm.get("start_time").and_then(|v| v.as_str());
        let current_start = meta.get("start_time").and_then(|v| v.as_str());
        if let Some(earliest) = match (saved_start, current_start) {
            (Some(a), Some(b)) => Some(if a <= b { a } else { b }),
            (Some(a), None) => Some(a),
            (None, b) => b,
        } {
            let earliest = earliest.to_string();
            meta.insert("start_time".to_string(), json!(earliest));
        }
        let total = sm.get("total_queries").and_then(|v| v.as_u64()).unwrap_or(0)
            + meta.get("total_queries").and_then(|v| v.as_u64()).unwrap_or(0);
        meta.insert("total_queries".to_string(), json!(total));
    }
    out.insert("session_metadata".to_string(), Value::Object(meta));

    validate_resume_state(&merged)?;
    Ok(merged)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect())
        .unwrap_or_default()
}

fn validate_resume_state(state: &Value) -> CoreResult<()> {
    let Value::Object(map) = state else {
        return Err(CoreError::InvalidConfig("merged state must be an object".to_string()));
    };
    for component in ["index", "scorer", "sampler"] {
        if !map.contains_key(component) || map[component].is_null() {
            return Err(CoreError::InvalidConfig(format!(
                "merged state is missing the `{component}` component"
            )));
        }
    }
    if !map.get("current_files").is_some_and(|v| v.is_array()) {
        return Err(CoreError::InvalidConfig("merged current_files must be an array".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Auto-save
// ---------------------------------------------------------------------------

/// Background auto-save loop. The snapshot closure produces the state to
/// persist; failures are logged and retried on the next tick.
pub struct AutoSaver {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AutoSaver {
    pub fn start(
        store: SessionStore,
        interval: Duration,
        snapshot: impl Fn() -> SessionState + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::spawn(move || {
            // Wake frequently so shutdown is prompt even with long intervals.
            let tick = interval.min(Duration::from_millis(200));
            let mut elapsed = Duration::ZERO;
            loop {
                if stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(tick);
                elapsed += tick;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    if let Err(e) = store.save(&snapshot()) {
                        warn!(error = %e, "auto-save failed");
                    }
                }
            }
        });
        Self { stop, handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AutoSaver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("session.json"))
    }

    fn sample_state() -> SessionState {
        SessionState {
            index: "{\"version\":1}".to_string(),
            current_files: vec!["src/a.ts".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample_state()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.warnings.is_empty());
        assert_eq!(loaded.state.version, SESSION_VERSION);
        assert_eq!(loaded.state.current_files, vec!["src/a.ts".to_string()]);
        assert_eq!(loaded.state.index, "{\"version\":1}");
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(&dir).load().unwrap().is_none());
    }

    #[test]
    fn mistyped_fields_default_with_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            r#"{"version":"1.0.0","current_files":"nope","user_preferences":{"theme":"dark"}}"#,
        )
        .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert!(loaded.state.current_files.is_empty());
        assert_eq!(loaded.state.user_preferences["theme"], json!("dark"));
        assert!(loaded.warnings.iter().any(|w| w.contains("current_files")));
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save(&sample_state()).unwrap();
        store.create_backup().unwrap();

        fs::write(store.path(), "{{{ definitely not json").unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.state.current_files, vec!["src/a.ts".to_string()]);
        assert!(loaded.warnings.iter().any(|w| w.contains("primary session unreadable")));
        assert!(loaded.warnings.iter().any(|w| w.contains("restored from backup")));
    }

    #[test]
    fn corrupt_primary_without_backup_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "garbage").unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.state.index, "");
        assert!(loaded.warnings.iter().any(|w| w.contains("starting fresh")));
    }

    fn resume_state(files: &[&str], start: &str, queries: u64) -> Value {
        json!({
            "index": {"files": 1},
            "scorer": {},
            "sampler": {},
            "current_files": files,
            "user_preferences": {},
            "session_metadata": {"start_time": start, "total_queries": queries},
        })
    }

    #[test]
    fn smart_resume_merges_preferences_saved_wins() {
        let mut saved = resume_state(&["a.ts"], "2026-01-01T00:00:00Z", 5);
        saved["user_preferences"] = json!({"theme": "dark", "budget": 1000});
        let mut current = resume_state(&["b.ts"], "2026-02-01T00:00:00Z", 3);
        current["user_preferences"] = json!({"theme": "light", "fresh": true});

        let merged = smart_resume(&saved, &current, true).unwrap();
        assert_eq!(merged["user_preferences"]["theme"], json!("dark"));
        assert_eq!(merged["user_preferences"]["budget"], json!(1000));
        assert_eq!(merged["user_preferences"]["fresh"], json!(true));
    }

    #[test]
    fn smart_resume_unions_files_in_requested_order() {
        let saved = resume_state(&["a.ts", "shared.ts"], "2026-01-01T00:00:00Z", 0);
        let current = resume_state(&["b.ts", "shared.ts"], "2026-02-01T00:00:00Z", 0);

        let merged = smart_resume(&saved, &current, true).unwrap();
        assert_eq!(merged["current_files"], json!(["a.ts", "shared.ts", "b.ts"]));

        let merged = smart_resume(&saved, &current, false).unwrap();
        assert_eq!(merged["current_files"], json!(["b.ts", "shared.ts", "a.ts"]));
    }

    #[test]
    fn smart_resume_metadata_rules() {
        let saved = resume_state(&[], "2026-01-01T00:00:00Z", 5);
        let current = resume_state(&[], "2026-02-01T00:00:00Z", 3);
        let merged = smart_resume(&saved, &current, true).unwrap();
        assert_eq!(merged["session_metadata"]["start_time"], json!("2026-01-01T00:00:00Z"));
        assert_eq!(merged["session_metadata"]["total_queries"], json!(8));
    }

    #[test]
    fn smart_resume_rejects_missing_components() {
        let saved = resume_state(&[], "2026-01-01T00:00:00Z", 0);
        let mut current = resume_state(&[], "2026-02-01T00:00:00Z", 0);
        current.as_object_mut().unwrap().remove("scorer");
        let mut saved_no_scorer = saved.clone();
        saved_no_scorer.as_object_mut().unwrap().remove("scorer");

        let err = smart_resume(&saved_no_scorer, &current, true).unwrap_err();
        assert_eq!(err.kind(), "invalid_config");

        // But a saved component fills a hole in the current state.
        let merged = smart_resume(&saved, &current, true).unwrap();
        assert!(merged.get("scorer").is_some());
    }

    #[test]
    fn auto_saver_persists_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let path = store.path().clone();
        let saver = AutoSaver::start(store, Duration::from_millis(50), sample_state);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !path.exists() {
            assert!(std::time::Instant::now() < deadline, "auto-save never ran");
            std::thread::sleep(Duration::from_millis(25));
        }
        saver.stop();
    }
}
