//! Language-specific import scanners.
//!
//! Scanners are deliberately shallow: a handful of anchored regexes per
//! language, enough to recover the import graph without parsing. Anything
//! the regexes miss shows up as a missing edge, which is safe: the content
//! digest still changes when the file does.

use lazy_regex::{Lazy, lazy_regex, regex::Regex};

use crate::{
    analyzer::{Import, ImportKind},
    target::Language,
};

static C_INCLUDE: Lazy<Regex> = lazy_regex!(r#"^\s*#\s*include\s+(?:<([^>]+)>|"([^"]+)")"#);
static RUST_USE: Lazy<Regex> = lazy_regex!(r#"^\s*(?:pub\s+)?use\s+([A-Za-z_][\w:]*)"#);
static RUST_MOD: Lazy<Regex> = lazy_regex!(r#"^\s*(?:pub\s+)?mod\s+([A-Za-z_]\w*)\s*;"#);
static RUST_EXTERN: Lazy<Regex> = lazy_regex!(r#"^\s*extern\s+crate\s+([A-Za-z_]\w*)"#);
static GO_IMPORT: Lazy<Regex> = lazy_regex!(r#"^\s*(?:import\s+)?(?:[A-Za-z_.]+\s+)?"([^"]+)"\s*$"#);
static GO_IMPORT_SINGLE: Lazy<Regex> = lazy_regex!(r#"^\s*import\s+(?:[A-Za-z_.]+\s+)?"([^"]+)""#);
static PY_IMPORT: Lazy<Regex> = lazy_regex!(r#"^\s*import\s+([A-Za-z_][\w.]*)"#);
static PY_FROM: Lazy<Regex> = lazy_regex!(r#"^\s*from\s+(\.*[A-Za-z_][\w.]*|\.+)\s+import"#);
static JS_IMPORT: Lazy<Regex> =
    lazy_regex!(r#"^\s*import\b[^'"]*['"]([^'"]+)['"]|^\s*(?:const|let|var)?.*\brequire\s*\(\s*['"]([^'"]+)['"]"#);

/// Extract imports from source text.
pub fn scan(language: Language, text: &str) -> Vec<Import> {
    let mut imports = Vec::new();
    let mut in_go_import_block = false;

    for (idx, line) in text.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        match language {
            Language::C | Language::Cpp => {
                if let Some(caps) = C_INCLUDE.captures(line) {
                    if let Some(system) = caps.get(1) {
                        imports.push(import(
                            system.as_str(),
                            classify_c_system(system.as_str()),
                            line_no,
                        ));
                    } else if let Some(quoted) = caps.get(2) {
                        imports.push(import(quoted.as_str(), ImportKind::Relative, line_no));
                    }
                }
            }
            Language::Rust => {
                if let Some(caps) = RUST_USE.captures(line) {
                    let path = caps[1].to_string();
                    imports.push(import(&path, classify_rust(&path), line_no));
                } else if let Some(caps) = RUST_MOD.captures(line) {
                    imports.push(import(&caps[1], ImportKind::Relative, line_no));
                } else if let Some(caps) = RUST_EXTERN.captures(line) {
                    imports.push(import(&caps[1], ImportKind::External, line_no));
                }
            }
            Language::Go => {
                let trimmed = line.trim();
                if trimmed.starts_with("import (") {
                    in_go_import_block = true;
                    continue;
                }
                if in_go_import_block {
                    if trimmed.starts_with(')') {
                        in_go_import_block = false;
                        continue;
                    }
                    if let Some(caps) = GO_IMPORT.captures(line) {
                        let path = caps[1].to_string();
                        imports.push(import(&path, classify_go(&path), line_no));
                    }
                } else if let Some(caps) = GO_IMPORT_SINGLE.captures(line) {
                    let path = caps[1].to_string();
                    imports.push(import(&path, classify_go(&path), line_no));
                }
            }
            Language::Python => {
                if let Some(caps) = PY_FROM.captures(line) {
                    let module = caps[1].to_string();
                    imports.push(import(&module, classify_python(&module), line_no));
                } else if let Some(caps) = PY_IMPORT.captures(line) {
                    let module = caps[1].to_string();
                    imports.push(import(&module, classify_python(&module), line_no));
                }
            }
            Language::JavaScript | Language::TypeScript => {
                if let Some(caps) = JS_IMPORT.captures(line) {
                    let module = caps
                        .get(1)
                        .or_else(|| caps.get(2))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    if !module.is_empty() {
                        imports.push(import(&module, classify_js(&module), line_no));
                    }
                }
            }
            Language::Custom => {}
        }
    }

    imports
}

fn import(raw: &str, kind: ImportKind, line: u32) -> Import {
    Import {
        raw: raw.to_string(),
        kind,
        line,
    }
}

const C_STDLIB: &[&str] = &[
    "assert.h", "ctype.h", "errno.h", "float.h", "inttypes.h", "limits.h", "locale.h", "math.h",
    "setjmp.h", "signal.h", "stdarg.h", "stdbool.h", "stddef.h", "stdint.h", "stdio.h",
    "stdlib.h", "string.h", "time.h", "unistd.h", "algorithm", "array", "chrono", "cstddef",
    "cstdint", "cstdio", "cstdlib", "cstring", "functional", "iostream", "map", "memory",
    "optional", "set", "sstream", "string", "string_view", "thread", "tuple", "unordered_map",
    "utility", "vector",
];

fn classify_c_system(header: &str) -> ImportKind {
    if C_STDLIB.contains(&header) {
        ImportKind::Stdlib
    } else {
        ImportKind::External
    }
}

fn classify_rust(path: &str) -> ImportKind {
    let root = path.split("::").next().unwrap_or(path);
    match root {
        "std" | "core" | "alloc" => ImportKind::Stdlib,
        "crate" | "super" | "self" => ImportKind::Relative,
        _ => ImportKind::External,
    }
}

fn classify_go(path: &str) -> ImportKind {
    if path.starts_with("./") || path.starts_with("../") {
        ImportKind::Relative
    } else if path.split('/').next().is_some_and(|first| first.contains('.')) {
        // Hosted module paths start with a domain (github.com/..., etc).
        ImportKind::External
    } else {
        ImportKind::Stdlib
    }
}

const PY_STDLIB: &[&str] = &[
    "abc", "argparse", "asyncio", "collections", "contextlib", "copy", "dataclasses", "datetime",
    "enum", "functools", "hashlib", "io", "itertools", "json", "logging", "math", "os",
    "pathlib", "re", "shutil", "subprocess", "sys", "tempfile", "threading", "time", "typing",
    "unittest", "uuid",
];

fn classify_python(module: &str) -> ImportKind {
    if module.starts_with('.') {
        return ImportKind::Relative;
    }
    let root = module.split('.').next().unwrap_or(module);
    if PY_STDLIB.contains(&root) {
        ImportKind::Stdlib
    } else {
        ImportKind::External
    }
}

const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "crypto", "events", "fs", "http", "https", "net", "os",
    "path", "process", "stream", "url", "util", "zlib",
];

fn classify_js(module: &str) -> ImportKind {
    if module.starts_with("./") || module.starts_with("../") {
        ImportKind::Relative
    } else if module.starts_with("node:") {
        ImportKind::Stdlib
    } else if NODE_BUILTINS.contains(&module) {
        ImportKind::Stdlib
    } else {
        ImportKind::External
    }
}
