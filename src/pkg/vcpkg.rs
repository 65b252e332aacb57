// Purpose: vcpkg-backed PackageManager (classic mode, one triplet per build).
// Inputs/Outputs: Root dir + triplet -> installed/<triplet>/{include,lib,bin}; installs via `vcpkg install`.
// Invariants: Installed state is read from vcpkg's own info/*.list records, never cached here.
// Gotchas: Package names in info records are separated by `_`, so `sdl2` must not match `sdl2-image`.

use std::fs;
use std::path::{Path, PathBuf};

use super::PackageManager;
use crate::config::Settings;
use crate::process::{CancelToken, run_checked};
use crate::report::Reporter;

#[derive(Debug, Clone)]
pub struct Vcpkg {
    root: PathBuf,
    triplet: String,
}

pub fn default_triplet() -> &'static str {
    if cfg!(windows) {
        "x64-mingw-dynamic"
    } else if cfg!(target_os = "macos") {
        if cfg!(target_arch = "aarch64") {
            "arm64-osx"
        } else {
            "x64-osx"
        }
    } else if cfg!(target_arch = "aarch64") {
        "arm64-linux"
    } else {
        "x64-linux"
    }
}

impl Vcpkg {
    pub fn new(root: impl Into<PathBuf>, triplet: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            triplet: triplet.into(),
        }
    }

    /// `VCPKG_ROOT`, else the portable copy under `<home>/tools/vcpkg`.
    pub fn from_settings(settings: &Settings) -> Self {
        let root = settings
            .vcpkg_root
            .clone()
            .unwrap_or_else(|| settings.tools_dir().join("vcpkg"));
        let triplet = settings
            .vcpkg_triplet
            .clone()
            .unwrap_or_else(|| default_triplet().to_string());
        Self::new(root, triplet)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn triplet(&self) -> &str {
        &self.triplet
    }

    fn executable(&self) -> PathBuf {
        self.root
            .join(if cfg!(windows) { "vcpkg.exe" } else { "vcpkg" })
    }

    fn installed_root(&self) -> PathBuf {
        self.root.join("installed").join(&self.triplet)
    }
}

impl PackageManager for Vcpkg {
    fn name(&self) -> &str {
        "vcpkg"
    }

    fn is_available(&self) -> bool {
        self.executable().is_file()
    }

    fn is_package_installed(&self, package: &str) -> bool {
        let info = self.root.join("installed").join("vcpkg").join("info");
        let Ok(entries) = fs::read_dir(&info) else {
            return false;
        };
        let prefix = format!("{}_", package);
        let suffix = format!("_{}.list", self.triplet);
        entries.flatten().any(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with(&prefix) && name.ends_with(&suffix)
        })
    }

    fn install_package(
        &self,
        package: &str,
        cancel: &CancelToken,
        reporter: Reporter<'_>,
    ) -> anyhow::Result<()> {
        let mut cmd = std::process::Command::new(self.executable());
        cmd.arg("install")
            .arg(format!("{}:{}", package, self.triplet))
            .current_dir(&self.root);
        let out = run_checked(&mut cmd, cancel)?;
        for line in out.stdout.lines().filter(|l| !l.trim().is_empty()).take(200) {
            tracing::debug!(target: "cmpile::pkg", "{line}");
        }
        if !self.is_package_installed(package) {
            reporter.warn(&format!(
                "vcpkg reported success but {} has no install record",
                package
            ));
        }
        Ok(())
    }

    fn include_dir(&self) -> PathBuf {
        self.installed_root().join("include")
    }

    fn lib_dir(&self) -> PathBuf {
        self.installed_root().join("lib")
    }

    fn bin_dir(&self) -> PathBuf {
        self.installed_root().join("bin")
    }
}
