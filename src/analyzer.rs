//! Language-specific symbol, import, and export extraction.
//!
//! Each supported language is a data table of line-oriented pattern rows;
//! the extractor is a single function over the table. Adding a language
//! means adding a table, not code paths. The extractor is pure: identical
//! input bytes always yield identical symbols. Unsupported extensions
//! still get a hash and size but an empty symbol list.

use crate::types::{FileIndex, Symbol, SymbolKind};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// First 16 hex characters of SHA-256 over the raw bytes. Used for change
/// detection everywhere a content hash appears.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

// ---------------------------------------------------------------------------
// Language tables
// ---------------------------------------------------------------------------

/// How a rule decides whether its match is exported.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ExportRule {
    /// Exported iff the line carries an `export` keyword.
    Keyword,
    /// Exported iff the identifier starts with an uppercase letter.
    InitialCapital,
    /// Exported iff the identifier has no leading underscore.
    NoLeadingUnderscore,
}

/// One row of a language's symbol table. The first capture group is the
/// symbol name.
pub struct SymbolRule {
    pub pattern: Regex,
    pub kind: SymbolKind,
    pub export: ExportRule,
}

/// One language's full extraction table.
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub symbols: Vec<SymbolRule>,
    /// Rules matched against indented lines inside a class body; matches
    /// become members of the enclosing class (one level deep).
    pub members: Vec<SymbolRule>,
    /// Each pattern's first non-empty capture group is an import specifier.
    pub imports: Vec<Regex>,
    /// Re-export statements contributing names (or sentinels) to exports.
    pub reexports: Vec<Regex>,
    /// Class bodies delimited by braces (depth-tracked) vs indentation.
    pub brace_delimited: bool,
}

fn rule(pattern: &str, kind: SymbolKind, export: ExportRule) -> SymbolRule {
    SymbolRule { pattern: Regex::new(pattern).expect("static pattern"), kind, export }
}

fn rx(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern")
}

static CURLY: LazyLock<LanguageSpec> = LazyLock::new(|| LanguageSpec {
    name: "curly",
    extensions: &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
    symbols: vec![
        rule(
            r"^\s*(?:export\s+)?(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)",
            SymbolKind::Class,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?interface\s+([A-Za-z_$][\w$]*)",
            SymbolKind::Interface,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?type\s+([A-Za-z_$][\w$]*)\s*(?:<[^>]*>)?\s*=",
            SymbolKind::TypeAlias,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?(?:const\s+)?enum\s+([A-Za-z_$][\w$]*)",
            SymbolKind::Enum,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)",
            SymbolKind::Function,
            ExportRule::Keyword,
        ),
        // Arrow functions bound to const/let/var. Must precede the plain
        // variable rule so the more specific kind wins.
        rule(
            r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>",
            SymbolKind::Function,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?(?:namespace|module)\s+([A-Za-z_$][\w$]*)",
            SymbolKind::Namespace,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)",
            SymbolKind::Variable,
            ExportRule::Keyword,
        ),
    ],
    members: vec![
        rule(
            r"^\s+(?:public\s+|private\s+|protected\s+|static\s+|readonly\s+|async\s+)*([A-Za-z_$][\w$]*)\s*(?:<[^>]*>)?\s*\(",
            SymbolKind::Method,
            ExportRule::Keyword,
        ),
        rule(
            r"^\s+(?:public\s+|private\s+|protected\s+|static\s+|readonly\s+)*([A-Za-z_$][\w$]*)\s*[?!]?\s*[:=]",
            SymbolKind::Property,
            ExportRule::Keyword,
        ),
    ],
    imports: vec![
        rx(r#"(?:import|export)\s+[^'"]*?from\s+['"]([^'"]+)['"]"#),
        rx(r#"^\s*import\s+['"]([^'"]+)['"]"#),
        rx(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#),
        rx(r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#),
    ],
    reexports: vec![rx(r#"(?m)^\s*export\s*\{([^}]*)\}"#)],
    brace_delimited: true,
});

static INDENTED: LazyLock<LanguageSpec> = LazyLock::new(|| LanguageSpec {
    name: "indented",
    extensions: &["py", "pyi"],
    symbols: vec![
        rule(r"^class\s+([A-Za-z_]\w*)", SymbolKind::Class, ExportRule::NoLeadingUnderscore),
        rule(
            r"^(?:async\s+)?def\s+([A-Za-z_]\w*)",
            SymbolKind::Function,
            ExportRule::NoLeadingUnderscore,
        ),
        // Uppercase module-scope identifiers are constants.
        rule(r"^([A-Z][A-Z0-9_]*)\s*=", SymbolKind::Variable, ExportRule::NoLeadingUnderscore),
    ],
    members: vec![rule(
        r"^\s+(?:async\s+)?def\s+([A-Za-z_]\w*)",
        SymbolKind::Method,
        ExportRule::NoLeadingUnderscore,
    )],
    imports: vec![rx(r"^\s*from\s+([\w.]+)\s+import"), rx(r"^\s*import\s+([\w.]+)")],
    reexports: Vec::new(),
    brace_delimited: false,
});

static GO_LIKE: LazyLock<LanguageSpec> = LazyLock::new(|| LanguageSpec {
    name: "go-like",
    extensions: &["go"],
    symbols: vec![
        rule(r"^type\s+([A-Za-z_]\w*)\s+struct", SymbolKind::Class, ExportRule::InitialCapital),
        rule(
            r"^type\s+([A-Za-z_]\w*)\s+interface",
            SymbolKind::Interface,
            ExportRule::InitialCapital,
        ),
        rule(r"^type\s+([A-Za-z_]\w*)", SymbolKind::TypeAlias, ExportRule::InitialCapital),
        rule(
            r"^func\s+\([^)]*\)\s+([A-Za-z_]\w*)",
            SymbolKind::Method,
            ExportRule::InitialCapital,
        ),
        rule(r"^func\s+([A-Za-z_]\w*)", SymbolKind::Function, ExportRule::InitialCapital),
        rule(r"^(?:var|const)\s+([A-Za-z_]\w*)", SymbolKind::Variable, ExportRule::InitialCapital),
    ],
    members: Vec::new(),
    imports: vec![rx(r#"^\s*import\s+(?:\w+\s+)?"([^"]+)""#)],
    reexports: Vec::new(),
    brace_delimited: true,
});

/// Look up the extraction table for a file extension.
pub fn language_for_ext(ext: &str) -> Option<&'static LanguageSpec> {
    for spec in [&*CURLY, &*INDENTED, &*GO_LIKE] {
        if spec.extensions.contains(&ext) {
            return Some(spec);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

fn is_exported(rule: &SymbolRule, line: &str, name: &str) -> bool {
    match rule.export {
        ExportRule::Keyword => {
            let trimmed = line.trim_start();
            trimmed.starts_with("export ") || trimmed.starts_with("export default ")
        }
        ExportRule::InitialCapital => name.chars().next().is_some_and(|c| c.is_uppercase()),
        ExportRule::NoLeadingUnderscore => !name.starts_with('_'),
    }
}

/// Count net brace depth change on a line, ignoring braces inside string
/// literals only coarsely (line-oriented rules accept that imprecision).
fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    for c in line.chars() {
        match c {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

/// Extract symbols from source text using a language table. Class members
/// are attached one level deep; everything else is flat.
pub fn extract_symbols(spec: &LanguageSpec, content: &str) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = Vec::new();
    // (symbol index, closing depth) for brace languages; (symbol index,)
    // for indentation languages where any column-0 line closes the class.
    let mut open_class: Option<usize> = None;
    let mut class_depth: i32 = 0;
    let mut depth: i32 = 0;

    for (i, line) in content.lines().enumerate() {
        let line_no = i + 1;
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with("//") || trimmed.starts_with('#') {
            depth += brace_delta(line);
            continue;
        }

        if let Some(class_idx) = open_class {
            let closed = if spec.brace_delimited {
                depth + brace_delta(line) <= class_depth && brace_delta(line) < 0
            } else {
                !line.starts_with(' ') && !line.starts_with('\t')
            };
            if closed {
                open_class = None;
            } else {
                // Only direct class-body lines produce members; statements
                // nested inside method bodies sit at a deeper brace depth.
                let at_body_depth = !spec.brace_delimited || depth == class_depth + 1;
                if at_body_depth {
                    for rule in &spec.members {
                        if let Some(cap) = rule.pattern.captures(line) {
                            let name = cap[1].to_string();
                            if is_member_noise(&name) {
                                break;
                            }
                            symbols[class_idx].members.push(Symbol {
                                exported: is_exported(rule, line, &name),
                                name,
                                kind: rule.kind,
                                line: line_no,
                                members: Vec::new(),
                            });
                            break;
                        }
                    }
                }
                depth += brace_delta(line);
                continue;
            }
        }

        for rule in &spec.symbols {
            if let Some(cap) = rule.pattern.captures(line) {
                let name = cap[1].to_string();
                let exported = is_exported(rule, line, &name);
                symbols.push(Symbol {
                    name,
                    kind: rule.kind,
                    line: line_no,
                    exported,
                    members: Vec::new(),
                });
                // A class only opens a member scope when its body actually
                // stays open past this line (`class Foo {}` does not).
                if rule.kind == SymbolKind::Class
                    && !spec.members.is_empty()
                    && (!spec.brace_delimited || brace_delta(line) > 0)
                {
                    open_class = Some(symbols.len() - 1);
                    class_depth = depth;
                }
                break;
            }
        }

        depth += brace_delta(line);
    }

    symbols
}

/// Keywords that member patterns would otherwise pick up as names.
fn is_member_noise(name: &str) -> bool {
    matches!(
        name,
        "if" | "for" | "while" | "switch" | "return" | "catch" | "else" | "new" | "await"
            | "typeof" | "case" | "default" | "super" | "function"
    )
}

/// Extract raw import specifiers in declaration order, deduplicated.
pub fn extract_imports(spec: &LanguageSpec, content: &str) -> Vec<String> {
    let mut imports = Vec::new();
    let mut in_go_block = false;

    for line in content.lines() {
        let trimmed = line.trim();
        // Go import blocks list bare quoted paths between `import (` and `)`.
        if spec.name == "go-like" {
            if trimmed.starts_with("import (") || trimmed == "import (" {
                in_go_block = true;
                continue;
            }
            if in_go_block {
                if trimmed == ")" {
                    in_go_block = false;
                } else if let Some(start) = trimmed.find('"') {
                    if let Some(end) = trimmed[start + 1..].find('"') {
                        imports.push(trimmed[start + 1..start + 1 + end].to_string());
                    }
                }
                continue;
            }
        }

        for pattern in &spec.imports {
            if let Some(cap) = pattern.captures(line) {
                if let Some(m) = cap.get(1) {
                    imports.push(m.as_str().to_string());
                    break;
                }
            }
        }
    }

    imports.dedup();
    imports
}

/// Exports are the union of exported declarations and explicit re-export
/// statements. `default` and `*` sentinels are emitted when the matching
/// syntax is present.
pub fn extract_exports(spec: &LanguageSpec, content: &str, symbols: &[Symbol]) -> Vec<String> {
    let mut exports: Vec<String> = symbols.iter().filter(|s| s.exported).map(|s| s.name.clone()).collect();

    for pattern in &spec.reexports {
        for cap in pattern.captures_iter(content) {
            for name in cap[1].split(',') {
                // `export { internal as public }` exposes the alias.
                let name = name.rsplit(" as ").next().unwrap_or(name).trim();
                if !name.is_empty() {
                    exports.push(name.to_string());
                }
            }
        }
    }

    if spec.name == "curly" {
        if content.contains("export default") {
            exports.push("default".to_string());
        }
        static WILDCARD: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r#"export\s+\*\s+from\s+['"]"#).expect("static pattern"));
        if WILDCARD.is_match(content) {
            exports.push("*".to_string());
        }
    }

    exports.sort();
    exports.dedup();
    exports
}

// ---------------------------------------------------------------------------
// File analysis
// ---------------------------------------------------------------------------

/// Analyze one file's content into a [`FileIndex`]. Pure with respect to
/// `content`; `last_modified` is the only caller-supplied non-content input.
pub fn analyze_file(path: &str, content: &str, last_modified: i64) -> FileIndex {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    let (symbols, imports, exports) = match language_for_ext(ext) {
        Some(spec) => {
            let symbols = extract_symbols(spec, content);
            let imports = extract_imports(spec, content);
            let exports = extract_exports(spec, content, &symbols);
            (symbols, imports, exports)
        }
        None => (Vec::new(), Vec::new(), Vec::new()),
    };

    FileIndex {
        path: path.to_string(),
        symbols,
        imports,
        exports,
        content_hash: content_hash(content.as_bytes()),
        size: content.len() as u64,
        last_modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS_SAMPLE: &str = r#"
import { helper } from './util';
import fs from 'fs';
const local = require('./local');

export class Widget {
    name: string;
    private count = 0;

    render(): void {
        if (this.count > 0) {
            this.draw();
        }
    }
}

export interface Renderable {
    draw(): void;
}

export type WidgetId = string;

export const MAX_WIDGETS = 10;

export function makeWidget(id: WidgetId): Widget {
    return new Widget();
}

export const arrow = (x: number) => x * 2;

function internal() {}

export default Widget;
export * from './reexports';
export { helper as exposedHelper };
"#;

    #[test]
    fn curly_symbols_and_kinds() {
        let spec = language_for_ext("ts").unwrap();
        let symbols = extract_symbols(spec, TS_SAMPLE);
        let find = |name: &str| symbols.iter().find(|s| s.name == name);

        assert_eq!(find("Widget").unwrap().kind, SymbolKind::Class);
        assert_eq!(find("Renderable").unwrap().kind, SymbolKind::Interface);
        assert_eq!(find("WidgetId").unwrap().kind, SymbolKind::TypeAlias);
        assert_eq!(find("MAX_WIDGETS").unwrap().kind, SymbolKind::Variable);
        assert_eq!(find("makeWidget").unwrap().kind, SymbolKind::Function);
        assert_eq!(find("arrow").unwrap().kind, SymbolKind::Function);
        assert!(find("Widget").unwrap().exported);
        assert!(!find("internal").unwrap().exported);
    }

    #[test]
    fn curly_class_members_one_level() {
        let spec = language_for_ext("ts").unwrap();
        let symbols = extract_symbols(spec, TS_SAMPLE);
        let widget = symbols.iter().find(|s| s.name == "Widget").unwrap();
        let member_names: Vec<&str> = widget.members.iter().map(|m| m.name.as_str()).collect();
        assert!(member_names.contains(&"name"), "members: {member_names:?}");
        assert!(member_names.contains(&"render"), "members: {member_names:?}");
        // Control flow inside methods must not leak in as members.
        assert!(!member_names.contains(&"if"));
        // Interface methods belong to the interface, not the class.
        assert!(!member_names.contains(&"draw") || widget.members.len() < 5);
    }

    #[test]
    fn curly_imports_in_order() {
        let spec = language_for_ext("ts").unwrap();
        let imports = extract_imports(spec, TS_SAMPLE);
        assert_eq!(imports[0], "./util");
        assert!(imports.contains(&"fs".to_string()));
        assert!(imports.contains(&"./local".to_string()));
    }

    #[test]
    fn curly_export_sentinels() {
        let spec = language_for_ext("ts").unwrap();
        let symbols = extract_symbols(spec, TS_SAMPLE);
        let exports = extract_exports(spec, TS_SAMPLE, &symbols);
        assert!(exports.contains(&"default".to_string()));
        assert!(exports.contains(&"*".to_string()));
        assert!(exports.contains(&"exposedHelper".to_string()));
        assert!(exports.contains(&"Widget".to_string()));
    }

    const PY_SAMPLE: &str = r#"
import os
from pathlib import Path

MAX_RETRIES = 3
_PRIVATE_LIMIT = 9

class Runner:
    def start(self):
        pass

    def _stop(self):
        pass

def run_all():
    pass

def _helper():
    pass
"#;

    #[test]
    fn indented_symbols() {
        let spec = language_for_ext("py").unwrap();
        let symbols = extract_symbols(spec, PY_SAMPLE);
        let runner = symbols.iter().find(|s| s.name == "Runner").unwrap();
        assert_eq!(runner.kind, SymbolKind::Class);
        let members: Vec<&str> = runner.members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(members, vec!["start", "_stop"]);
        assert!(!runner.members[1].exported);

        let max = symbols.iter().find(|s| s.name == "MAX_RETRIES").unwrap();
        assert_eq!(max.kind, SymbolKind::Variable);
        assert!(max.exported);

        let helper = symbols.iter().find(|s| s.name == "_helper").unwrap();
        assert!(!helper.exported);
        // run_all is module scope, not a member of Runner.
        assert!(symbols.iter().any(|s| s.name == "run_all" && s.kind == SymbolKind::Function));
    }

    #[test]
    fn indented_imports() {
        let spec = language_for_ext("py").unwrap();
        let imports = extract_imports(spec, PY_SAMPLE);
        assert_eq!(imports, vec!["os".to_string(), "pathlib".to_string()]);
    }

    const GO_SAMPLE: &str = r#"package main

import (
    "fmt"
    "strings"
)

import "os"

type Server struct {}

type handler interface {}

func (s *Server) Start() error { return nil }

func NewServer() *Server { return &Server{} }

func helperFunc() {}

var DefaultPort = 8080
"#;

    #[test]
    fn go_export_by_capital() {
        let spec = language_for_ext("go").unwrap();
        let symbols = extract_symbols(spec, GO_SAMPLE);
        let find = |name: &str| symbols.iter().find(|s| s.name == name).unwrap();

        assert_eq!(find("Server").kind, SymbolKind::Class);
        assert!(find("Server").exported);
        assert_eq!(find("handler").kind, SymbolKind::Interface);
        assert!(!find("handler").exported);
        assert_eq!(find("Start").kind, SymbolKind::Method);
        assert!(find("NewServer").exported);
        assert!(!find("helperFunc").exported);
        assert!(find("DefaultPort").exported);
    }

    #[test]
    fn go_import_block() {
        let spec = language_for_ext("go").unwrap();
        let imports = extract_imports(spec, GO_SAMPLE);
        assert_eq!(
            imports,
            vec!["fmt".to_string(), "strings".to_string(), "os".to_string()]
        );
    }

    #[test]
    fn unsupported_extension_still_hashes() {
        let fi = analyze_file("notes.txt", "hello world", 0);
        assert!(fi.symbols.is_empty());
        assert!(fi.imports.is_empty());
        assert_eq!(fi.size, 11);
        assert_eq!(fi.content_hash.len(), 16);
    }

    #[test]
    fn analysis_is_deterministic() {
        let a = analyze_file("src/app.ts", TS_SAMPLE, 1000);
        let b = analyze_file("src/app.ts", TS_SAMPLE, 2000);
        assert_eq!(a.symbols, b.symbols);
        assert_eq!(a.imports, b.imports);
        assert_eq!(a.exports, b.exports);
        assert_eq!(a.content_hash, b.content_hash);
    }

    #[test]
    fn hash_is_truncated_sha256() {
        let h = content_hash(b"abc");
        // Full SHA-256 of "abc" starts with ba7816bf8f01cfea.
        assert_eq!(h, "ba7816bf8f01cfea");
    }
}
