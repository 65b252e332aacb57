// Purpose: Discover translation units and statically scan them for dependency signals.
// Inputs/Outputs: Input paths -> SourceUnits; source text -> include signals, fetch directives, local declarations.
// Invariants: Scanning only reads files; results are sets/deduplicated lists, so scan order never matters.
// Gotchas: Preprocessor conditionals are not evaluated; an include under `#if 0` is still reported.

use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::split_flags;
use crate::error::BuildError;
use crate::report::Reporter;

pub const SOURCE_EXTENSIONS: &[&str] = &["c", "C", "cpp", "CPP", "cc", "cxx"];
const SKIP_DIRS: &[&str] = &[".git", "out", "build", "node_modules"];
pub const DEFAULT_FETCH_VERSION: &str = "main";

static INCLUDE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"^\s*#include\s*[<"]([^>"]+)[>"]"#).ok());
static FETCH_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"//\s*@fetch\s+(https://github\.com/[^\s@]+)(?:\s*@?\s*([^\s]+))?").ok()
});
static LOCAL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"//\s*@local\s+(.+)$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    C,
    Cxx,
}

impl SourceKind {
    /// `.c`/`.C` is C; every other extension goes to the C++ driver.
    pub fn from_path(p: &Path) -> Self {
        match p.extension().and_then(|e| e.to_str()) {
            Some("c") | Some("C") => SourceKind::C,
            _ => SourceKind::Cxx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub path: PathBuf,
    pub kind: SourceKind,
}

impl SourceUnit {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = SourceKind::from_path(&path);
        Self { path, kind }
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchDirective {
    pub repo_url: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalLibDeclaration {
    /// Resolved against the declaring source's directory.
    pub root: PathBuf,
    pub flags: Vec<String>,
    pub declared_in: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub includes: BTreeSet<String>,
    pub fetches: Vec<FetchDirective>,
    pub locals: Vec<LocalLibDeclaration>,
}

impl ScanResult {
    /// Union; fetches dedupe on (repo_url, version), locals on root.
    pub fn merge(&mut self, other: ScanResult) {
        self.includes.extend(other.includes);
        for f in other.fetches {
            if !self.fetches.contains(&f) {
                self.fetches.push(f);
            }
        }
        for l in other.locals {
            if !self.locals.iter().any(|x| x.root == l.root) {
                self.locals.push(l);
            }
        }
    }
}

pub fn is_source_file(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Expand explicit files and directories into absolute, first-occurrence-unique units.
pub fn expand_inputs(inputs: &[PathBuf]) -> anyhow::Result<Vec<SourceUnit>> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for input in inputs {
        if !input.exists() {
            return Err(BuildError::MissingInput(input.clone()).into());
        }
        let abs = std::path::absolute(input).unwrap_or_else(|_| input.clone());
        let mut found = Vec::new();
        if abs.is_dir() {
            walk_sources(&abs, &mut found)?;
        } else {
            found.push(abs);
        }
        for p in found {
            if seen.insert(p.clone()) {
                out.push(SourceUnit::new(p));
            }
        }
    }
    Ok(out)
}

fn walk_sources(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| anyhow::anyhow!("read {}: {}", dir.display(), e))?
        .flatten()
        .map(|e| e.path())
        .collect::<Vec<_>>();
    entries.sort();
    for p in entries {
        if p.is_dir() {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if SKIP_DIRS.contains(&name) {
                continue;
            }
            walk_sources(&p, out)?;
        } else if is_source_file(&p) {
            out.push(p);
        }
    }
    Ok(())
}

/// Scan already-loaded text. `origin_dir` anchors `@local` paths.
pub fn scan_text(text: &str, origin: &Path) -> ScanResult {
    let origin_dir = origin.parent().unwrap_or(Path::new("."));
    let mut res = ScanResult::default();
    for line in text.lines() {
        if let Some(re) = INCLUDE_RE.as_ref()
            && let Some(c) = re.captures(line)
            && let Some(m) = c.get(1)
        {
            res.includes.insert(m.as_str().trim().to_string());
            continue;
        }
        if let Some(re) = FETCH_RE.as_ref()
            && let Some(c) = re.captures(line)
            && let Some(url) = c.get(1)
        {
            let version = c
                .get(2)
                .map(|m| m.as_str().trim_start_matches('@').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_FETCH_VERSION.to_string());
            let d = FetchDirective {
                repo_url: url.as_str().trim_end_matches('/').to_string(),
                version,
            };
            if !res.fetches.contains(&d) {
                res.fetches.push(d);
            }
            continue;
        }
        if let Some(re) = LOCAL_RE.as_ref()
            && let Some(c) = re.captures(line)
            && let Some(rest) = c.get(1)
        {
            let mut tokens = split_flags(rest.as_str()).into_iter();
            if let Some(dir) = tokens.next() {
                let root = origin_dir.join(dir);
                if !res.locals.iter().any(|l| l.root == root) {
                    res.locals.push(LocalLibDeclaration {
                        root,
                        flags: tokens.collect(),
                        declared_in: origin.to_path_buf(),
                    });
                }
            }
        }
    }
    res
}

/// Scan one file. An unreadable file is logged and contributes nothing.
pub fn scan(file: &Path, reporter: Reporter<'_>) -> ScanResult {
    match fs::read_to_string(file) {
        Ok(text) => scan_text(&text, file),
        Err(e) => {
            reporter.warn(&format!("could not scan {}: {}", file.display(), e));
            ScanResult::default()
        }
    }
}

pub fn scan_all(units: &[SourceUnit], reporter: Reporter<'_>) -> ScanResult {
    let mut all = ScanResult::default();
    for u in units {
        all.merge(scan(&u.path, reporter));
    }
    tracing::debug!(
        target: "cmpile::scan",
        includes = all.includes.len(),
        fetches = all.fetches.len(),
        locals = all.locals.len(),
        "scan complete"
    );
    all
}
