// Purpose: Describe one build invocation and the environment-derived settings around it.
// Inputs/Outputs: BuildOptions comes from the caller; Settings is read from the environment exactly once.
// Invariants: Neither value is mutated after construction; stages receive them by reference.
// Gotchas: Compiler flags arrive as one free-form string and are split shell-style.

use std::path::{Path, PathBuf};
use std::thread;

use crate::cache::{default_cache_dir, default_home};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub inputs: Vec<PathBuf>,
    pub compiler_flags: String,
    pub clean: bool,
    pub shared: bool,
    pub no_console: bool,
    pub use_generator: bool,
    pub run: bool,
    pub extra_includes: Vec<PathBuf>,
    pub extra_lib_dirs: Vec<PathBuf>,
    pub extra_link_flags: Vec<String>,
}

impl BuildOptions {
    pub fn new<I, P>(inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn split_compiler_flags(&self) -> Vec<String> {
        split_flags(&self.compiler_flags)
    }
}

/// Shell-style split; unbalanced quoting degrades to a plain whitespace split.
pub fn split_flags(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    shlex::split(raw).unwrap_or_else(|| raw.split_whitespace().map(str::to_string).collect())
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root for extensions, the manifest and portable tools.
    pub home: PathBuf,
    /// Downloaded archives.
    pub cache_dir: PathBuf,
    pub jobs: Option<usize>,
    pub cc: Option<String>,
    pub cxx: Option<String>,
    pub vcpkg_root: Option<PathBuf>,
    pub vcpkg_triplet: Option<String>,
    pub auto_build: bool,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = match env_nonempty("CMPILE_HOME") {
            Some(p) => PathBuf::from(p),
            None => default_home()?,
        };
        let cache_dir = match env_nonempty("CMPILE_CACHE_DIR") {
            Some(p) => PathBuf::from(p),
            None => default_cache_dir().unwrap_or_else(|_| home.join("cache")),
        };
        Ok(Self {
            home,
            cache_dir,
            jobs: env_nonempty("CMPILE_JOBS")
                .and_then(|s| s.parse::<usize>().ok())
                .filter(|n| *n > 0),
            cc: env_nonempty("CMPILE_CC"),
            cxx: env_nonempty("CMPILE_CXX"),
            vcpkg_root: env_nonempty("VCPKG_ROOT").map(PathBuf::from),
            vcpkg_triplet: env_nonempty("CMPILE_VCPKG_TRIPLET"),
            auto_build: env_nonempty("CMPILE_NO_AUTOBUILD")
                .map(|v| v == "0")
                .unwrap_or(true),
        })
    }

    /// Settings rooted at an explicit directory, ignoring the environment.
    pub fn rooted_at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            cache_dir: home.join("cache"),
            jobs: None,
            cc: None,
            cxx: None,
            vcpkg_root: None,
            vcpkg_triplet: None,
            auto_build: true,
        }
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.home.join("extensions")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.home.join("tools")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.extensions_dir().join("custom_extensions.json")
    }

    pub fn job_count(&self, task_count: usize) -> usize {
        if task_count == 0 {
            return 1;
        }
        let default = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        self.jobs.unwrap_or(default).clamp(1, task_count)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
