// Purpose: Source-fetch extensions: download a GitHub archive, extract, optionally build, detect paths.
// Inputs/Outputs: (repo_url, version) + Settings -> tree under <home>/extensions/<owner>-<repo>@<ref>.
// Invariants: The marker file is written last; without it the tree is never reported as installed.
// Gotchas: Extraction lands in a `.partial` sibling and is renamed into place, so a crash mid-unzip
//          leaves nothing that looks installed. Archive entries with `..`/absolute paths are rejected.

use anyhow::{Context, bail};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use zip::ZipArchive;

use super::detect::{DirSnapshot, detect_layout};
use super::{ExtensionProvider, InstallContext};
use crate::cache::{CacheLock, ensure_dir, escape_segment, remove_dir_forced, url_hash};
use crate::config::Settings;
use crate::error::{BuildError, classify};
use crate::process::run_checked;
use crate::report::Reporter;

pub const MARKER_FILE: &str = ".cmpile-fetch.json";
const GITHUB_PREFIX: &str = "https://github.com/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub name: String,
    pub repo_url: String,
    pub version: String,
    /// Archive ref when it differs from the displayed version (e.g. `v3.16.0` for `3.16.0`).
    pub tag: Option<String>,
    pub header_only: bool,
    pub system_flags: Vec<String>,
    /// Substrings that pull matching libraries to the front of the link order.
    pub link_priority: Vec<String>,
}

impl FetchSpec {
    pub fn from_repo(repo_url: &str, version: &str) -> Self {
        Self {
            name: repo_name(repo_url),
            repo_url: normalize_repo_url(repo_url),
            version: version.to_string(),
            tag: None,
            header_only: false,
            system_flags: Vec::new(),
            link_priority: Vec::new(),
        }
    }

    pub fn reference(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct FetchMarker {
    repo_url: String,
    version: String,
    archive_url: String,
    include_dir: PathBuf,
    #[serde(default)]
    lib_dir: Option<PathBuf>,
    #[serde(default)]
    bin_dirs: Vec<PathBuf>,
    #[serde(default)]
    libraries: Vec<String>,
    #[serde(default)]
    built: bool,
}

#[derive(Debug, Clone)]
pub struct FetchExtension {
    spec: FetchSpec,
    root: PathBuf,
    lock_root: PathBuf,
    archive_cache: PathBuf,
    archive_url: Option<String>,
}

pub fn normalize_repo_url(url: &str) -> String {
    url.trim()
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .to_string()
}

fn owner_and_repo(url: &str) -> (String, String) {
    let url = normalize_repo_url(url);
    let path = url.strip_prefix(GITHUB_PREFIX).unwrap_or(&url);
    let mut parts = path.rsplit('/').filter(|s| !s.is_empty());
    let repo = parts.next().unwrap_or("repo").to_string();
    let owner = parts.next().unwrap_or("unknown").to_string();
    (owner, repo)
}

pub fn repo_name(url: &str) -> String {
    owner_and_repo(url).1
}

/// `<owner>-<repo>@<ref>`, every part made path-safe.
pub fn install_dir_name(repo_url: &str, reference: &str) -> String {
    let (owner, repo) = owner_and_repo(repo_url);
    format!(
        "{}-{}@{}",
        escape_segment(&owner),
        escape_segment(&repo),
        escape_segment(reference)
    )
}

fn looks_like_sha(s: &str) -> bool {
    (7..=40).contains(&s.len()) && s.bytes().all(|c| c.is_ascii_hexdigit())
}

fn parse_version_loose(raw: &str) -> Option<Version> {
    let t = raw.trim();
    Version::parse(t.strip_prefix('v').unwrap_or(t)).ok()
}

/// Release-style refs (`5.5`, `v3.16.0`, `11.0.2`) are tags; everything else is a branch or sha.
fn is_tag_like(r: &str) -> bool {
    if parse_version_loose(r).is_some() {
        return true;
    }
    let t = r.strip_prefix('v').unwrap_or(r);
    t.starts_with(|c: char| c.is_ascii_digit()) && t.contains('.')
}

pub fn archive_url_for(repo_url: &str, reference: &str) -> String {
    let base = normalize_repo_url(repo_url);
    if is_tag_like(reference) {
        format!("{}/archive/refs/tags/{}.zip", base, reference)
    } else if looks_like_sha(reference) {
        format!("{}/archive/{}.zip", base, reference)
    } else {
        format!("{}/archive/refs/heads/{}.zip", base, reference)
    }
}

fn file_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    #[cfg(windows)]
    {
        if rest.len() >= 3 && rest.starts_with('/') && rest.as_bytes()[2] == b':' {
            return Some(PathBuf::from(&rest[1..]));
        }
    }
    Some(PathBuf::from(rest))
}

fn safe_rel_path(p: &Path) -> anyhow::Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::Prefix(_) | Component::RootDir | Component::ParentDir => {
                bail!("unsafe path in archive entry: {}", p.display())
            }
        }
    }
    Ok(out)
}

/// Leading directory shared by every entry, when the archive has one (GitHub always adds `<repo>-<ref>/`).
fn common_root(entries: &[PathBuf]) -> Option<PathBuf> {
    let first = entries.first()?.components().next()?;
    let shared = entries.iter().all(|e| e.components().next() == Some(first));
    let deeper = entries.iter().any(|e| e.components().count() > 1);
    (shared && deeper).then(|| PathBuf::from(first.as_os_str()))
}

/// Unpack `bytes` into `dst`, stripping a single shared top-level directory.
pub fn extract_archive(bytes: &[u8], dst: &Path) -> anyhow::Result<usize> {
    ensure_dir(dst)?;
    let mut zip = ZipArchive::new(Cursor::new(bytes)).context("invalid zip archive")?;
    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        let rel = safe_rel_path(Path::new(entry.name()))?;
        names.push(rel);
    }
    let strip = common_root(
        &names
            .iter()
            .filter(|n| !n.as_os_str().is_empty())
            .cloned()
            .collect::<Vec<_>>(),
    );

    let mut written = 0usize;
    for (i, rel) in names.iter().enumerate() {
        let rel = match strip.as_ref() {
            Some(root) => rel.strip_prefix(root).unwrap_or(rel.as_path()),
            None => rel.as_path(),
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let mut entry = zip.by_index(i)?;
        let out = dst.join(rel);
        if entry.is_dir() {
            ensure_dir(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            ensure_dir(parent)?;
        }
        let mut w = fs::File::create(&out).with_context(|| format!("create {}", out.display()))?;
        std::io::copy(&mut entry, &mut w).with_context(|| format!("write {}", out.display()))?;
        written += 1;
    }
    Ok(written)
}

fn http_get_bytes(url: &str) -> anyhow::Result<Vec<u8>> {
    let resp = ureq::get(url)
        .call()
        .map_err(|e| anyhow::anyhow!("http GET {} failed: {}", url, e))?;
    let mut buf = Vec::new();
    resp.into_reader()
        .read_to_end(&mut buf)
        .with_context(|| format!("read body of {}", url))?;
    Ok(buf)
}

impl FetchExtension {
    pub fn new(spec: FetchSpec, settings: &Settings) -> Self {
        let extensions = settings.extensions_dir();
        let root = extensions.join(install_dir_name(&spec.repo_url, spec.reference()));
        Self {
            spec,
            root,
            lock_root: extensions,
            archive_cache: settings.cache_dir.join("archives"),
            archive_url: None,
        }
    }

    /// Fetch from `url` instead of the GitHub archive endpoint (mirrors, `file://` fixtures).
    pub fn with_archive_url(mut self, url: impl Into<String>) -> Self {
        self.archive_url = Some(url.into());
        self
    }

    pub fn spec(&self) -> &FetchSpec {
        &self.spec
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_url(&self) -> String {
        self.archive_url
            .clone()
            .unwrap_or_else(|| archive_url_for(&self.spec.repo_url, self.spec.reference()))
    }

    fn partial_path(&self) -> PathBuf {
        let file_name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.spec.name.clone());
        self.root.with_file_name(format!("{}.partial", file_name))
    }

    fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    fn marker(&self) -> Option<FetchMarker> {
        let text = fs::read_to_string(self.marker_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn download(&self, reporter: Reporter<'_>) -> anyhow::Result<Vec<u8>> {
        let url = self.archive_url();
        if let Some(p) = file_url_to_path(&url) {
            return fs::read(&p).with_context(|| format!("read {}", p.display()));
        }
        let cached = self.archive_cache.join(format!("{}.zip", url_hash(&url)));
        if let Ok(bytes) = fs::read(&cached) {
            tracing::debug!(target: "cmpile::ext", url = %url, "archive cache hit");
            return Ok(bytes);
        }
        reporter.info(&format!("downloading {}", url));
        let bytes = http_get_bytes(&url)?;
        if ensure_dir(&self.archive_cache).is_ok() {
            let _ = fs::write(&cached, &bytes);
        }
        Ok(bytes)
    }

    fn cmake_build(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<bool> {
        if !self.root.join("CMakeLists.txt").is_file() {
            return Ok(false);
        }
        let Some(cmake) = ctx.toolchain.cmake.as_ref() else {
            reporter.warn(&format!(
                "cmake not found; using {} sources without building",
                self.spec.name
            ));
            return Ok(false);
        };
        let build = self.root.join("build");
        let install = build.join("install");
        reporter.info(&format!("configuring {} with CMake", self.spec.name));
        let mut configure = ctx.toolchain.command(cmake);
        configure
            .arg("-S")
            .arg(&self.root)
            .arg("-B")
            .arg(&build)
            .arg("-DBUILD_SHARED_LIBS=OFF")
            .arg("-DBUILD_TESTING=OFF")
            .arg("-DCMAKE_BUILD_TYPE=Release")
            .arg(format!("-DCMAKE_INSTALL_PREFIX={}", install.display()))
            .arg(format!("-DCMAKE_C_COMPILER={}", ctx.toolchain.cc.display()))
            .arg(format!("-DCMAKE_CXX_COMPILER={}", ctx.toolchain.cxx.display()));
        run_checked(&mut configure, ctx.cancel)?;

        reporter.info(&format!("building {}", self.spec.name));
        let mut compile = ctx.toolchain.command(cmake);
        compile.arg("--build").arg(&build).args(["--config", "Release"]);
        run_checked(&mut compile, ctx.cancel)?;

        let mut inst: Command = ctx.toolchain.command(cmake);
        inst.arg("--install").arg(&build).args(["--config", "Release"]);
        if let Err(e) = run_checked(&mut inst, ctx.cancel) {
            if matches!(classify(&e), Some(BuildError::Cancelled)) {
                return Err(e);
            }
            tracing::debug!(target: "cmpile::ext", "cmake --install skipped: {e:#}");
        }
        Ok(true)
    }

    fn install_unlocked(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        let bytes = self.download(reporter)?;
        if ctx.cancel.is_cancelled() {
            return Err(BuildError::Cancelled.into());
        }
        let partial = self.partial_path();
        remove_dir_forced(&partial)?;
        reporter.info(&format!("extracting {}", self.spec.name));
        let n = extract_archive(&bytes, &partial)?;
        tracing::debug!(target: "cmpile::ext", files = n, "extracted");
        remove_dir_forced(&self.root)?;
        fs::rename(&partial, &self.root).with_context(|| {
            format!("rename {} -> {}", partial.display(), self.root.display())
        })?;

        let built = if ctx.settings.auto_build && !self.spec.header_only {
            self.cmake_build(ctx, reporter)?
        } else {
            false
        };

        let snap = DirSnapshot::capture(&self.root)?;
        let layout = detect_layout(&self.root, &snap);
        let marker = FetchMarker {
            repo_url: self.spec.repo_url.clone(),
            version: self.spec.version.clone(),
            archive_url: self.archive_url(),
            include_dir: layout.include_dir,
            lib_dir: layout.lib_dir,
            bin_dirs: layout.bin_dirs,
            libraries: layout.libraries,
            built,
        };
        let text = serde_json::to_string_pretty(&marker)?;
        let tmp = self.root.join(format!("{}.tmp", MARKER_FILE));
        fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, self.marker_path())
            .with_context(|| format!("write {}", self.marker_path().display()))?;
        Ok(())
    }

    fn ordered_libraries(&self, libs: &[String]) -> Vec<String> {
        let mut ordered = Vec::new();
        for p in &self.spec.link_priority {
            for l in libs.iter().filter(|l| l.contains(p.as_str())) {
                if !ordered.contains(l) {
                    ordered.push(l.clone());
                }
            }
        }
        for l in libs {
            if !ordered.contains(l) {
                ordered.push(l.clone());
            }
        }
        ordered
    }
}

impl ExtensionProvider for FetchExtension {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn is_installed(&self) -> bool {
        self.marker().is_some_and(|m| m.include_dir.is_dir())
    }

    fn install(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        if self.is_installed() {
            reporter.info(&format!("{} already installed", self.spec.name));
            return Ok(());
        }
        let _lock = CacheLock::acquire(&self.lock_root)?;
        if self.is_installed() {
            return Ok(());
        }
        reporter.info(&format!(
            "fetching {} ({})",
            self.spec.repo_url,
            self.spec.reference()
        ));
        if let Err(e) = self.install_unlocked(ctx, reporter) {
            let _ = remove_dir_forced(&self.partial_path());
            let _ = remove_dir_forced(&self.root);
            if matches!(classify(&e), Some(BuildError::Cancelled)) {
                return Err(e);
            }
            return Err(BuildError::FetchFailed {
                repo: self.spec.repo_url.clone(),
                cause: format!("{:#}", e),
            }
            .into());
        }
        reporter.success(&format!("{} installed", self.spec.name));
        Ok(())
    }

    fn uninstall(&self, reporter: Reporter<'_>) -> anyhow::Result<()> {
        if !self.root.exists() {
            reporter.info(&format!("{} is not installed", self.spec.name));
            return Ok(());
        }
        remove_dir_forced(&self.root)?;
        reporter.info(&format!("{} uninstalled", self.spec.name));
        Ok(())
    }

    fn include_path(&self) -> Option<PathBuf> {
        self.marker().map(|m| m.include_dir)
    }

    fn lib_path(&self) -> Option<PathBuf> {
        if self.spec.header_only {
            return None;
        }
        let m = self.marker()?;
        Some(m.lib_dir.unwrap_or(m.include_dir))
    }

    fn link_flags(&self) -> Vec<String> {
        let Some(m) = self.marker() else {
            return Vec::new();
        };
        let mut flags = Vec::new();
        if !self.spec.header_only {
            flags.extend(
                self.ordered_libraries(&m.libraries)
                    .into_iter()
                    .map(|l| format!("-l{}", l)),
            );
        }
        flags.extend(self.spec.system_flags.iter().cloned());
        flags
    }

    fn version(&self) -> Option<String> {
        Some(self.spec.version.clone())
    }

    fn runtime_dirs(&self) -> Vec<PathBuf> {
        self.marker().map(|m| m.bin_dirs).unwrap_or_default()
    }
}
