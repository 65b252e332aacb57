// Purpose: Guess include/lib/bin directories of an arbitrary extracted or built source tree.
// Inputs/Outputs: A DirSnapshot (relative file list) -> ordered, pure directory choices.
// Invariants: Every decision is a function of the snapshot alone; capture is the only I/O.
// Gotchas: Fetched repositories have no canonical layout, so each list is a priority order, not a rule.

use anyhow::Context;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

const HEADER_EXTS: &[&str] = &["h", "hh", "hpp", "hxx", "inl", "ipp"];
const SKIP_DIRS: &[&str] = &[".git", ".github", "CMakeFiles"];
const MAX_DEPTH: usize = 12;

const INCLUDE_PRIORITY: &[&str] = &["build/install/include", "include", "single_include"];
const LIB_PRIORITY: &[&str] = &[
    "build/install/lib",
    "build/install/lib64",
    "build/lib",
    "build/Release",
    "build",
    "lib",
    "lib64",
];
const BIN_PRIORITY: &[&str] = &[
    "build/install/bin",
    "build/bin",
    "build/Release",
    "build",
    "bin",
];

/// Relative paths of every regular file under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    files: BTreeSet<PathBuf>,
}

impl DirSnapshot {
    pub fn from_files<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    pub fn capture(root: &Path) -> anyhow::Result<Self> {
        let mut files = BTreeSet::new();
        walk(root, Path::new(""), 0, &mut files)
            .with_context(|| format!("scan {}", root.display()))?;
        Ok(Self { files })
    }

    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files.iter().map(PathBuf::as_path)
    }

    fn files_under<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        self.files().filter(move |f| f.starts_with(dir) && *f != dir)
    }

    /// Files whose parent is exactly `dir`.
    fn direct_files<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        self.files()
            .filter(move |f| f.parent().unwrap_or(Path::new("")) == dir)
    }

    fn has_files_under(&self, dir: &Path) -> bool {
        self.files_under(dir).next().is_some()
    }

    fn header_count_under(&self, dir: &Path) -> usize {
        self.files_under(dir).filter(|f| is_header(f)).count()
    }
}

fn walk(root: &Path, rel: &Path, depth: usize, out: &mut BTreeSet<PathBuf>) -> std::io::Result<()> {
    if depth > MAX_DEPTH {
        return Ok(());
    }
    for ent in fs::read_dir(root.join(rel))? {
        let ent = ent?;
        let name = ent.file_name();
        let child = rel.join(&name);
        let ty = ent.file_type()?;
        if ty.is_dir() {
            if SKIP_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            walk(root, &child, depth + 1, out)?;
        } else if ty.is_file() {
            out.insert(child);
        }
    }
    Ok(())
}

fn ext_of(p: &Path) -> &str {
    p.extension().and_then(|e| e.to_str()).unwrap_or_default()
}

fn file_name_of(p: &Path) -> &str {
    p.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

pub fn is_header(p: &Path) -> bool {
    HEADER_EXTS.contains(&ext_of(p))
}

pub fn is_archive(p: &Path) -> bool {
    matches!(ext_of(p), "a" | "lib")
}

pub fn is_shared_lib(p: &Path) -> bool {
    let name = file_name_of(p);
    name.ends_with(".dll") || name.ends_with(".dylib") || name.ends_with(".so") || name.contains(".so.")
}

/// Library name for a linkable archive, or `None` for anything else.
pub fn library_name(file_name: &str) -> Option<String> {
    let name = if let Some(rest) = file_name.strip_prefix("lib") {
        rest.strip_suffix(".dll.a").or_else(|| rest.strip_suffix(".a"))
    } else {
        file_name.strip_suffix(".lib")
    }?;
    (!name.is_empty()).then(|| name.to_string())
}

/// Include root, relative to the snapshot root; the root itself is the last resort.
pub fn detect_include_dir(snap: &DirSnapshot) -> PathBuf {
    for cand in INCLUDE_PRIORITY {
        let p = Path::new(cand);
        if snap.has_files_under(p) {
            return p.to_path_buf();
        }
    }
    let mut include_dirs: BTreeMap<PathBuf, usize> = BTreeMap::new();
    for f in snap.files() {
        let mut cur = PathBuf::new();
        for comp in f.parent().into_iter().flat_map(Path::components) {
            cur.push(comp);
            if comp.as_os_str() == "include" && !include_dirs.contains_key(&cur) {
                let n = snap.header_count_under(&cur);
                include_dirs.insert(cur.clone(), n);
            }
        }
    }
    // Most headers wins; BTreeMap order makes ties resolve to the lexically first path.
    if let Some((dir, n)) = include_dirs
        .iter()
        .fold(None::<(&PathBuf, usize)>, |best, (d, n)| match best {
            Some((_, bn)) if bn >= *n => best,
            _ => Some((d, *n)),
        })
        && n > 0
    {
        return dir.clone();
    }
    let src = Path::new("src");
    if snap.header_count_under(src) > 0 {
        return src.to_path_buf();
    }
    PathBuf::new()
}

/// First directory holding a linkable archive directly.
pub fn detect_lib_dir(snap: &DirSnapshot) -> Option<PathBuf> {
    for cand in LIB_PRIORITY {
        let p = Path::new(cand);
        if snap.direct_files(p).any(is_archive) {
            return Some(p.to_path_buf());
        }
    }
    // Anywhere else: shallowest directory with an archive.
    snap.files()
        .filter(|f| is_archive(f))
        .filter_map(|f| f.parent())
        .min_by_key(|d| (d.components().count(), d.to_path_buf()))
        .map(Path::to_path_buf)
}

pub fn detect_bin_dirs(snap: &DirSnapshot) -> Vec<PathBuf> {
    BIN_PRIORITY
        .iter()
        .map(Path::new)
        .filter(|p| snap.direct_files(p).any(is_shared_lib))
        .map(Path::to_path_buf)
        .collect()
}

/// `-l<name>` candidates from the archives directly inside `lib_dir`, sorted and deduplicated.
pub fn library_names(snap: &DirSnapshot, lib_dir: &Path) -> Vec<String> {
    snap.direct_files(lib_dir)
        .filter_map(|f| library_name(file_name_of(f)))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedLayout {
    pub include_dir: PathBuf,
    pub lib_dir: Option<PathBuf>,
    pub bin_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
}

/// Run every detector and anchor the answers at `root`.
pub fn detect_layout(root: &Path, snap: &DirSnapshot) -> DetectedLayout {
    let include_rel = detect_include_dir(snap);
    let lib_rel = detect_lib_dir(snap);
    let libraries = lib_rel
        .as_deref()
        .map(|d| library_names(snap, d))
        .unwrap_or_default();
    tracing::debug!(
        target: "cmpile::ext",
        root = %root.display(),
        include = %include_rel.display(),
        lib = ?lib_rel,
        "detected layout"
    );
    DetectedLayout {
        include_dir: root.join(include_rel),
        lib_dir: lib_rel.map(|d| root.join(d)),
        bin_dirs: detect_bin_dirs(snap).into_iter().map(|d| root.join(d)).collect(),
        libraries,
    }
}
