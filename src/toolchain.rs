// Purpose: Resolve compiler/generator executables once per build into an immutable context.
// Inputs/Outputs: Reads PATH and Settings; produces ToolchainContext threaded through every stage.
// Invariants: Discovery never mutates the process environment; extra search dirs live only in the context.
// Gotchas: Portable tool copies under <home>/tools are a fallback, not a preference over PATH.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::Settings;
use crate::scan::SourceKind;

/// Answers whether a logical tool is reachable and where.
pub trait ToolLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf>;

    fn is_available(&self, tool: &str) -> bool {
        self.locate(tool).is_some()
    }
}

/// Searches a fixed list of directories (normally PATH, then portable tool dirs).
#[derive(Debug, Clone)]
pub struct PathLocator {
    dirs: Vec<PathBuf>,
}

impl PathLocator {
    pub fn from_env(settings: &Settings) -> Self {
        let mut dirs: Vec<PathBuf> = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        dirs.extend(portable_bin_dirs(&settings.tools_dir()));
        Self { dirs }
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

impl ToolLocator for PathLocator {
    fn locate(&self, tool: &str) -> Option<PathBuf> {
        let direct = Path::new(tool);
        if direct.components().count() > 1 {
            return direct.is_file().then(|| direct.to_path_buf());
        }
        for dir in &self.dirs {
            for name in exe_names(tool) {
                let candidate = dir.join(&name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }
}

fn exe_names(tool: &str) -> Vec<String> {
    if cfg!(windows) && !tool.to_ascii_lowercase().ends_with(".exe") {
        vec![format!("{}.exe", tool), tool.to_string()]
    } else {
        vec![tool.to_string()]
    }
}

fn portable_bin_dirs(tools_dir: &Path) -> Vec<PathBuf> {
    ["llvm", "gcc", "cmake", "git"]
        .iter()
        .map(|t| tools_dir.join(t).join("bin"))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ToolchainContext {
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub cmake: Option<PathBuf>,
    pub git: Option<PathBuf>,
    /// Directories discovered during resolution; prepended to a child's PATH when it needs them.
    pub search_dirs: Vec<PathBuf>,
}

impl ToolchainContext {
    pub fn discover(settings: &Settings) -> Self {
        let locator = PathLocator::from_env(settings);
        Self::discover_with(settings, &locator)
    }

    pub fn discover_with(settings: &Settings, locator: &dyn ToolLocator) -> Self {
        let fallback_bin = settings.tools_dir().join("llvm").join("bin");
        let cc = resolve_compiler(settings.cc.as_deref(), &["clang", "gcc"], locator)
            .unwrap_or_else(|| fallback_bin.join(exe_names("clang").remove(0)));
        let cxx = resolve_compiler(settings.cxx.as_deref(), &["clang++", "g++"], locator)
            .unwrap_or_else(|| fallback_bin.join(exe_names("clang++").remove(0)));
        let mut search_dirs = Vec::new();
        for tool in [&cc, &cxx] {
            if let Some(dir) = tool.parent()
                && !dir.as_os_str().is_empty()
                && !search_dirs.iter().any(|d: &PathBuf| d == dir)
            {
                search_dirs.push(dir.to_path_buf());
            }
        }
        let ctx = Self {
            cc,
            cxx,
            cmake: locator.locate("cmake"),
            git: locator.locate("git"),
            search_dirs,
        };
        tracing::debug!(
            target: "cmpile::toolchain",
            cc = %ctx.cc.display(),
            cxx = %ctx.cxx.display(),
            cmake = ?ctx.cmake,
            "toolchain resolved"
        );
        ctx
    }

    /// Explicit context, no discovery.
    pub fn fixed(cc: impl Into<PathBuf>, cxx: impl Into<PathBuf>) -> Self {
        Self {
            cc: cc.into(),
            cxx: cxx.into(),
            cmake: None,
            git: None,
            search_dirs: Vec::new(),
        }
    }

    pub fn compiler_for(&self, kind: SourceKind) -> &Path {
        match kind {
            SourceKind::C => &self.cc,
            SourceKind::Cxx => &self.cxx,
        }
    }

    /// C++ driver when any unit is C++, C driver otherwise.
    pub fn linker_for(&self, kinds: impl IntoIterator<Item = SourceKind>) -> &Path {
        if kinds.into_iter().any(|k| k == SourceKind::Cxx) {
            &self.cxx
        } else {
            &self.cc
        }
    }

    pub fn is_gcc_driver(tool: &Path) -> bool {
        let stem = tool
            .file_stem()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if stem.contains("clang") {
            return false;
        }
        // gcc-13, x86_64-linux-gnu-g++-12: drop a trailing version before matching.
        let base = match stem.rsplit_once('-') {
            Some((head, ver)) if !ver.is_empty() && ver.chars().all(|c| c.is_ascii_digit() || c == '.') => head,
            _ => stem.as_str(),
        };
        matches!(base, "gcc" | "g++") || base.ends_with("-gcc") || base.ends_with("-g++")
    }

    /// PATH value for a child process: context dirs, extra dirs, then the inherited PATH.
    pub fn child_path(&self, extra: &[PathBuf]) -> Option<OsString> {
        let mut dirs: Vec<PathBuf> = extra.to_vec();
        dirs.extend(self.search_dirs.iter().cloned());
        if let Some(cur) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&cur));
        }
        std::env::join_paths(dirs).ok()
    }

    pub fn command(&self, tool: &Path) -> Command {
        let mut cmd = Command::new(tool);
        if !self.search_dirs.is_empty()
            && let Some(path) = self.child_path(&[])
        {
            cmd.env("PATH", path);
        }
        cmd
    }
}

fn resolve_compiler(
    explicit: Option<&str>,
    candidates: &[&str],
    locator: &dyn ToolLocator,
) -> Option<PathBuf> {
    if let Some(cc) = explicit {
        return Some(locator.locate(cc).unwrap_or_else(|| PathBuf::from(cc)));
    }
    candidates.iter().find_map(|c| locator.locate(c))
}
