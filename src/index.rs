//! In-memory semantic index over workspace files.
//!
//! Primary data is the path-keyed map of [`FileIndex`] records; the symbol
//! table and the inverse import map are views rebuilt from it and never
//! serialized. Mutations go through a single writer ([`SharedIndex`]);
//! readers take cheap snapshots backed by `Arc`-shared records.

use crate::error::{CoreError, CoreResult};
use crate::types::{FileIndex, ImportGraph, SymbolKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

/// A resolved location of a named symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolRef {
    pub path: String,
    pub line: usize,
    pub kind: SymbolKind,
    pub exported: bool,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Default, Debug)]
pub struct SemanticIndex {
    files: BTreeMap<String, Arc<FileIndex>>,
    /// name -> locations, covering top-level symbols and class members.
    symbols: BTreeMap<String, Vec<SymbolRef>>,
    /// Monotonic: strictly increases on every mutation even when the wall
    /// clock does not.
    last_updated: i64,
}

/// Read-only view of the index at a point in time. File records are shared
/// structurally, so taking a snapshot is cheap.
#[derive(Clone, Default)]
pub struct IndexSnapshot {
    pub files: BTreeMap<String, Arc<FileIndex>>,
    pub last_updated: i64,
}

/// Serialized wire form. Views are rebuilt on load, never persisted.
#[derive(Serialize, Deserialize)]
struct IndexOnDisk {
    version: u32,
    last_updated: i64,
    files: Vec<FileIndex>,
}

const INDEX_FORMAT_VERSION: u32 = 1;

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_updated = now.max(self.last_updated + 1);
    }

    /// Insert or replace a file. Replacing removes the old record's symbol
    /// entries before installing the new ones; inverse import edges are a
    /// view and recompute lazily on the next graph build.
    pub fn add_file(&mut self, file: FileIndex) {
        let path = file.path.clone();
        if self.files.contains_key(&path) {
            self.unregister_symbols(&path);
        }
        let file = Arc::new(file);
        self.register_symbols(&file);
        self.files.insert(path, file);
        self.touch();
    }

    /// Remove a file and every trace of it: symbol entries, outgoing
    /// edges (primary data), and, by rebuild, inverse references.
    pub fn remove_file(&mut self, path: &str) -> bool {
        if self.files.remove(path).is_none() {
            return false;
        }
        self.unregister_symbols(path);
        self.touch();
        debug!(path, "removed file from semantic index");
        true
    }

    pub fn get_file(&self, path: &str) -> Option<Arc<FileIndex>> {
        self.files.get(path).cloned()
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(|s| s.as_str())
    }

    pub fn files(&self) -> impl Iterator<Item = &Arc<FileIndex>> {
        self.files.values()
    }

    pub fn last_updated(&self) -> i64 {
        self.last_updated
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot { files: self.files.clone(), last_updated: self.last_updated }
    }

    /// All locations declaring `name`, ordered by path then line so the
    /// answer is independent of insertion history.
    pub fn symbol_references(&self, name: &str) -> Vec<SymbolRef> {
        let mut refs = self.symbols.get(name).cloned().unwrap_or_default();
        refs.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        refs
    }

    fn register_symbols(&mut self, file: &Arc<FileIndex>) {
        for sym in &file.symbols {
            self.symbols.entry(sym.name.clone()).or_default().push(SymbolRef {
                path: file.path.clone(),
                line: sym.line,
                kind: sym.kind,
                exported: sym.exported,
            });
            for member in &sym.members {
                self.symbols.entry(member.name.clone()).or_default().push(SymbolRef {
                    path: file.path.clone(),
                    line: member.line,
                    kind: member.kind,
                    exported: member.exported,
                });
            }
        }
    }

    fn unregister_symbols(&mut self, path: &str) {
        self.symbols.retain(|_, refs| {
            refs.retain(|r| r.path != path);
            !refs.is_empty()
        });
    }

    // -----------------------------------------------------------------------
    // Import resolution
    // -----------------------------------------------------------------------

    /// Resolve an import specifier from `from_path` to an indexed path.
    /// Relative specifiers resolve against the importing file's directory,
    /// trying the bare path, known extensions, and index files. Bare
    /// specifiers fall back to a unique stem match. `None` means the
    /// specifier stays opaque.
    pub fn resolve_import(&self, from_path: &str, specifier: &str) -> Option<String> {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            let dir = from_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
            let joined = normalize_path(&format!("{dir}/{specifier}"));
            if self.files.contains_key(&joined) {
                return Some(joined);
            }
            for ext in ["ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go"] {
                let candidate = format!("{joined}.{ext}");
                if self.files.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
            for ext in ["ts", "js"] {
                let candidate = format!("{joined}/index.{ext}");
                if self.files.contains_key(&candidate) {
                    return Some(candidate);
                }
            }
            return None;
        }

        // Bare specifier: match the last component against file stems.
        let last = specifier.rsplit(&['.', '/'][..]).next().unwrap_or(specifier);
        let mut matched: Option<&str> = None;
        for path in self.files.keys() {
            let file_name = path.rsplit('/').next().unwrap_or(path);
            let stem = file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name);
            if stem == last && path != from_path {
                if matched.is_some() {
                    // Ambiguous stem: leave the specifier opaque.
                    return None;
                }
                matched = Some(path);
            }
        }
        matched.map(|s| s.to_string())
    }

    /// Build the bidirectional import graph from primary data. Forward
    /// edges keep unresolved specifiers as opaque strings; inverse entries
    /// exist iff the target path is present in the index.
    pub fn build_import_graph(&self) -> ImportGraph {
        let mut imports: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut imported_by: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (path, file) in &self.files {
            let mut edges: Vec<String> = Vec::new();
            for spec in &file.imports {
                match self.resolve_import(path, spec) {
                    Some(target) => {
                        imported_by.entry(target.clone()).or_default().push(path.clone());
                        edges.push(target);
                    }
                    None => edges.push(spec.clone()),
                }
            }
            edges.sort();
            edges.dedup();
            if !edges.is_empty() {
                imports.insert(path.clone(), edges);
            }
        }

        for list in imported_by.values_mut() {
            list.sort();
            list.dedup();
        }

        ImportGraph { imports, imported_by }
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    pub fn serialize(&self) -> CoreResult<String> {
        let on_disk = IndexOnDisk {
            version: INDEX_FORMAT_VERSION,
            last_updated: self.last_updated,
            files: self.files.values().map(|f| (**f).clone()).collect(),
        };
        Ok(serde_json::to_string(&on_disk)?)
    }

    pub fn deserialize(data: &str) -> CoreResult<Self> {
        let on_disk: IndexOnDisk = serde_json::from_str(data)
            .map_err(|e| CoreError::Corrupt(format!("semantic index: {e}")))?;
        if on_disk.version != INDEX_FORMAT_VERSION {
            return Err(CoreError::Corrupt(format!(
                "semantic index version {} unsupported",
                on_disk.version
            )));
        }
        let mut index = SemanticIndex { last_updated: on_disk.last_updated, ..Default::default() };
        for file in on_disk.files {
            let path = file.path.clone();
            let file = Arc::new(file);
            index.register_symbols(&file);
            index.files.insert(path, file);
        }
        Ok(index)
    }
}

/// Collapse `.` and `..` segments in a slash-separated relative path.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    parts.join("/")
}

// ---------------------------------------------------------------------------
// Thread-safe facade
// ---------------------------------------------------------------------------

/// Single-writer, many-reader handle over the index. Writers serialize
/// through the inner lock; readers either take a snapshot or run a short
/// closure under the read guard.
#[derive(Clone, Default)]
pub struct SharedIndex {
    inner: Arc<RwLock<SemanticIndex>>,
}

impl SharedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_index(index: SemanticIndex) -> Self {
        Self { inner: Arc::new(RwLock::new(index)) }
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut SemanticIndex) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn read<R>(&self, f: impl FnOnce(&SemanticIndex) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        self.read(|idx| idx.snapshot())
    }
}
