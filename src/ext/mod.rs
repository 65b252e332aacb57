// Purpose: Extension provider contract and its closed set of acquisition strategies.
// Inputs/Outputs: Each variant answers install state and contributes include/lib dirs and link flags.
// Invariants: Accessors are pure re-reads of on-disk state; only `install`/`uninstall` mutate anything.
// Gotchas: `lib_path` may fall back to the include path for header-only trees; callers dedupe dirs.

pub mod catalog;
pub mod detect;
pub mod fetch;
pub mod manifest;
pub mod registry;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::error::BuildError;
use crate::link::resolve_library_token;
use crate::pkg::{PackageManager, install_required};
use crate::process::CancelToken;
use crate::report::Reporter;
use crate::toolchain::ToolchainContext;

pub use detect::{DetectedLayout, DirSnapshot};
pub use fetch::{FetchExtension, FetchSpec};
pub use registry::ExtensionRegistry;

/// Everything an install may need; borrowed for the duration of one install.
pub struct InstallContext<'a> {
    pub settings: &'a Settings,
    pub toolchain: &'a ToolchainContext,
    pub cancel: &'a CancelToken,
}

pub trait ExtensionProvider {
    fn name(&self) -> &str;
    fn is_installed(&self) -> bool;
    /// No-op (reported to `reporter`) when already installed.
    fn install(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()>;
    fn uninstall(&self, reporter: Reporter<'_>) -> anyhow::Result<()>;
    fn include_path(&self) -> Option<PathBuf>;
    fn lib_path(&self) -> Option<PathBuf>;
    fn link_flags(&self) -> Vec<String>;
    fn version(&self) -> Option<String>;

    /// Directories whose shared libraries must sit next to the produced binary.
    fn runtime_dirs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn contributions(&self) -> Contributions {
        let mut c = Contributions::default();
        c.push_dir_opt(self.include_path(), DirKind::Include);
        c.push_dir_opt(self.lib_path(), DirKind::Lib);
        c.push_flags(self.link_flags());
        for d in self.runtime_dirs() {
            c.push_dir(d, DirKind::Runtime);
        }
        c
    }
}

#[derive(Debug, Clone, Copy)]
enum DirKind {
    Include,
    Lib,
    Runtime,
}

/// Linker flags whose value is the following argument (`-framework Cocoa`).
const VALUE_FLAGS: &[&str] = &["-framework", "-weak_framework", "-Xlinker", "-l", "-L", "-rpath", "-u"];

fn flag_units(flags: &[String]) -> Vec<&[String]> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < flags.len() {
        let width = if VALUE_FLAGS.contains(&flags[i].as_str()) && i + 1 < flags.len() {
            2
        } else {
            1
        };
        units.push(&flags[i..i + width]);
        i += width;
    }
    units
}

/// Accumulated include/lib/flag/runtime inputs, in discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Contributions {
    pub include_dirs: Vec<PathBuf>,
    pub lib_dirs: Vec<PathBuf>,
    pub link_flags: Vec<String>,
    pub runtime_dirs: Vec<PathBuf>,
}

impl Contributions {
    fn push_dir_opt(&mut self, dir: Option<PathBuf>, kind: DirKind) {
        if let Some(d) = dir {
            self.push_dir(d, kind);
        }
    }

    fn push_dir(&mut self, dir: PathBuf, kind: DirKind) {
        let list = match kind {
            DirKind::Include => &mut self.include_dirs,
            DirKind::Lib => &mut self.lib_dirs,
            DirKind::Runtime => &mut self.runtime_dirs,
        };
        if !list.contains(&dir) {
            list.push(dir);
        }
    }

    /// Skips flags already contributed; a value-taking flag and its value count as one entry.
    fn push_flags(&mut self, flags: Vec<String>) {
        let mut seen: Vec<Vec<String>> = flag_units(&self.link_flags)
            .into_iter()
            .map(<[String]>::to_vec)
            .collect();
        for unit in flag_units(&flags) {
            if seen.iter().any(|u| u.as_slice() == unit) {
                continue;
            }
            self.link_flags.extend_from_slice(unit);
            seen.push(unit.to_vec());
        }
    }

    pub fn merge(&mut self, other: Contributions) {
        for d in other.include_dirs {
            self.push_dir(d, DirKind::Include);
        }
        for d in other.lib_dirs {
            self.push_dir(d, DirKind::Lib);
        }
        self.push_flags(other.link_flags);
        for d in other.runtime_dirs {
            self.push_dir(d, DirKind::Runtime);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include_dirs.is_empty()
            && self.lib_dirs.is_empty()
            && self.link_flags.is_empty()
            && self.runtime_dirs.is_empty()
    }
}

/// A prebuilt package from the package manager.
#[derive(Debug, Clone)]
pub struct PackagedExtension {
    pub package: String,
    pub manager: Arc<dyn PackageManager>,
}

impl ExtensionProvider for PackagedExtension {
    fn name(&self) -> &str {
        &self.package
    }

    fn is_installed(&self) -> bool {
        self.manager.is_package_installed(&self.package)
    }

    fn install(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        let one = BTreeSet::from([self.package.clone()]);
        install_required(self.manager.as_ref(), &one, ctx.cancel, reporter)?;
        Ok(())
    }

    fn uninstall(&self, _reporter: Reporter<'_>) -> anyhow::Result<()> {
        anyhow::bail!(
            "{} is managed by {}; remove it there",
            self.package,
            self.manager.name()
        )
    }

    fn include_path(&self) -> Option<PathBuf> {
        self.is_installed().then(|| self.manager.include_dir())
    }

    fn lib_path(&self) -> Option<PathBuf> {
        self.is_installed().then(|| self.manager.lib_dir())
    }

    fn link_flags(&self) -> Vec<String> {
        if !self.is_installed() {
            return Vec::new();
        }
        resolve_library_token(&self.package, &self.manager.lib_dir())
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn runtime_dirs(&self) -> Vec<PathBuf> {
        if !self.is_installed() {
            return Vec::new();
        }
        vec![self.manager.bin_dir()]
    }
}

/// A prebuilt tree declared in source with `// @local <dir> [flags...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExtension {
    pub root: PathBuf,
    pub flags: Vec<String>,
}

impl LocalExtension {
    pub fn new(root: impl Into<PathBuf>, flags: Vec<String>) -> Self {
        Self {
            root: root.into(),
            flags,
        }
    }

    fn layout(&self) -> Option<DetectedLayout> {
        if !self.root.is_dir() {
            return None;
        }
        let snap = DirSnapshot::capture(&self.root).ok()?;
        Some(detect::detect_layout(&self.root, &snap))
    }

    fn flags_for(&self, layout: &DetectedLayout) -> Vec<String> {
        let mut flags: Vec<String> = layout
            .libraries
            .iter()
            .map(|l| format!("-l{}", l))
            .collect();
        for f in &self.flags {
            if !flags.contains(f) {
                flags.push(f.clone());
            }
        }
        flags
    }
}

impl ExtensionProvider for LocalExtension {
    fn name(&self) -> &str {
        self.root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("local")
    }

    fn is_installed(&self) -> bool {
        self.root.is_dir()
    }

    fn install(&self, _ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        if !self.is_installed() {
            return Err(BuildError::MissingLocalLibrary(self.root.clone()).into());
        }
        reporter.info(&format!("using local library {}", self.root.display()));
        Ok(())
    }

    fn uninstall(&self, reporter: Reporter<'_>) -> anyhow::Result<()> {
        reporter.info(&format!("{} is user-managed; nothing to remove", self.root.display()));
        Ok(())
    }

    fn include_path(&self) -> Option<PathBuf> {
        self.layout().map(|l| l.include_dir)
    }

    fn lib_path(&self) -> Option<PathBuf> {
        self.layout().map(|l| l.lib_dir.unwrap_or(l.include_dir))
    }

    fn link_flags(&self) -> Vec<String> {
        match self.layout() {
            Some(l) => self.flags_for(&l),
            None => self.flags.clone(),
        }
    }

    fn version(&self) -> Option<String> {
        None
    }

    fn runtime_dirs(&self) -> Vec<PathBuf> {
        self.layout().map(|l| l.bin_dirs).unwrap_or_default()
    }

    fn contributions(&self) -> Contributions {
        let mut c = Contributions::default();
        let Some(layout) = self.layout() else {
            return c;
        };
        c.push_flags(self.flags_for(&layout));
        c.push_dir(layout.include_dir.clone(), DirKind::Include);
        c.push_dir(layout.lib_dir.unwrap_or(layout.include_dir), DirKind::Lib);
        for d in layout.bin_dirs {
            c.push_dir(d, DirKind::Runtime);
        }
        c
    }
}

/// User-registered include/lib paths persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomExtension {
    pub name: String,
    pub include_path: PathBuf,
    pub lib_path: PathBuf,
    pub flags: Vec<String>,
}

fn dir_ok(p: &Path) -> bool {
    p.as_os_str().is_empty() || p.is_dir()
}

impl ExtensionProvider for CustomExtension {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_installed(&self) -> bool {
        !self.include_path.as_os_str().is_empty()
            && self.include_path.is_dir()
            && dir_ok(&self.lib_path)
    }

    fn install(&self, _ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        if !self.is_installed() {
            anyhow::bail!(
                "custom extension {} points at missing paths ({}, {})",
                self.name,
                self.include_path.display(),
                self.lib_path.display()
            );
        }
        reporter.info(&format!("custom extension {} is manually managed", self.name));
        Ok(())
    }

    fn uninstall(&self, reporter: Reporter<'_>) -> anyhow::Result<()> {
        reporter.info(&format!(
            "custom extension {} can only be removed from the list",
            self.name
        ));
        Ok(())
    }

    fn include_path(&self) -> Option<PathBuf> {
        (!self.include_path.as_os_str().is_empty()).then(|| self.include_path.clone())
    }

    fn lib_path(&self) -> Option<PathBuf> {
        if self.lib_path.as_os_str().is_empty() {
            return self.include_path();
        }
        Some(self.lib_path.clone())
    }

    fn link_flags(&self) -> Vec<String> {
        self.flags.clone()
    }

    fn version(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub enum Extension {
    Packaged(PackagedExtension),
    Fetch(FetchExtension),
    Local(LocalExtension),
    Custom(CustomExtension),
}

impl Extension {
    pub fn provider(&self) -> &dyn ExtensionProvider {
        match self {
            Extension::Packaged(e) => e,
            Extension::Fetch(e) => e,
            Extension::Local(e) => e,
            Extension::Custom(e) => e,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Extension::Packaged(_) => "package",
            Extension::Fetch(_) => "fetch",
            Extension::Local(_) => "local",
            Extension::Custom(_) => "custom",
        }
    }
}

impl ExtensionProvider for Extension {
    fn name(&self) -> &str {
        self.provider().name()
    }
    fn is_installed(&self) -> bool {
        self.provider().is_installed()
    }
    fn install(&self, ctx: &InstallContext<'_>, reporter: Reporter<'_>) -> anyhow::Result<()> {
        self.provider().install(ctx, reporter)
    }
    fn uninstall(&self, reporter: Reporter<'_>) -> anyhow::Result<()> {
        self.provider().uninstall(reporter)
    }
    fn include_path(&self) -> Option<PathBuf> {
        self.provider().include_path()
    }
    fn lib_path(&self) -> Option<PathBuf> {
        self.provider().lib_path()
    }
    fn link_flags(&self) -> Vec<String> {
        self.provider().link_flags()
    }
    fn version(&self) -> Option<String> {
        self.provider().version()
    }
    fn runtime_dirs(&self) -> Vec<PathBuf> {
        self.provider().runtime_dirs()
    }
    fn contributions(&self) -> Contributions {
        self.provider().contributions()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Contributions, CustomExtension, Extension, ExtensionProvider, InstallContext,
        LocalExtension, PackagedExtension,
    };
    use crate::pkg::testing::FakeManager;
    use std::sync::Arc;
    use crate::config::Settings;
    use crate::error::{BuildError, classify};
    use crate::process::CancelToken;
    use crate::report::{NullSink, Reporter};
    use crate::toolchain::ToolchainContext;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-ext-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    #[test]
    fn local_extension_detects_prebuilt_layout() {
        let root = temp_dir("local");
        fs::create_dir_all(root.join("include")).expect("mkdir include");
        fs::create_dir_all(root.join("lib")).expect("mkdir lib");
        fs::write(root.join("include").join("box2d.h"), "").expect("write h");
        fs::write(root.join("lib").join("libbox2d.a"), "").expect("write a");

        let ext = Extension::Local(LocalExtension::new(&root, vec!["-DB2_STATIC".into(), "-lbox2d".into()]));
        assert!(ext.is_installed());
        let c = ext.contributions();
        assert_eq!(c.include_dirs, vec![root.join("include")]);
        assert_eq!(c.lib_dirs, vec![root.join("lib")]);
        assert_eq!(c.link_flags, vec!["-lbox2d", "-DB2_STATIC"]);
        assert_eq!(ext.kind(), "local");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_local_root_is_an_input_error() {
        let root = temp_dir("local-missing");
        let settings = Settings::rooted_at(&root);
        let tc = ToolchainContext::fixed("cc", "c++");
        let cancel = CancelToken::new();
        let ctx = InstallContext {
            settings: &settings,
            toolchain: &tc,
            cancel: &cancel,
        };
        let ext = LocalExtension::new(root.join("nope"), vec![]);
        assert!(ext.contributions().is_empty());
        let err = ext.install(&ctx, Reporter::new(&NullSink)).expect_err("missing");
        assert!(matches!(classify(&err), Some(BuildError::MissingLocalLibrary(_))));
    }

    #[test]
    fn custom_extension_lib_falls_back_to_include() {
        let root = temp_dir("custom");
        fs::create_dir_all(&root).expect("mkdir");
        let ext = CustomExtension {
            name: "stb".into(),
            include_path: root.clone(),
            lib_path: PathBuf::new(),
            flags: vec![],
        };
        assert!(ext.is_installed());
        assert_eq!(ext.lib_path(), Some(root.clone()));

        let gone = CustomExtension {
            name: "gone".into(),
            include_path: root.join("missing"),
            lib_path: root.clone(),
            flags: vec!["-lgone".into()],
        };
        assert!(!gone.is_installed());
        assert_eq!(gone.link_flags(), vec!["-lgone"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn contributions_merge_dedupes_in_order() {
        let mut a = Contributions {
            include_dirs: vec![PathBuf::from("/a/include")],
            link_flags: vec!["-lraylib".into(), "-lm".into()],
            ..Contributions::default()
        };
        a.merge(Contributions {
            include_dirs: vec![PathBuf::from("/b/include"), PathBuf::from("/a/include")],
            link_flags: vec!["-lm".into(), "-lpthread".into()],
            ..Contributions::default()
        });
        assert_eq!(a.include_dirs, vec![PathBuf::from("/a/include"), PathBuf::from("/b/include")]);
        assert_eq!(a.link_flags, vec!["-lraylib", "-lm", "-lpthread"]);
    }

    #[test]
    fn packaged_paths_appear_only_once_installed() {
        let root = temp_dir("packaged");
        let settings = Settings::rooted_at(&root);
        let toolchain = ToolchainContext::fixed("cc", "c++");
        let cancel = CancelToken::new();
        let ctx = InstallContext {
            settings: &settings,
            toolchain: &toolchain,
            cancel: &cancel,
        };
        let pkg = PackagedExtension {
            package: "zlib".into(),
            manager: Arc::new(FakeManager {
                root: PathBuf::from("/pm"),
                available: true,
                ..FakeManager::default()
            }),
        };
        assert!(!pkg.is_installed());
        assert_eq!(pkg.include_path(), None);
        assert_eq!(pkg.lib_path(), None);
        assert!(pkg.link_flags().is_empty());
        assert!(pkg.runtime_dirs().is_empty());

        pkg.install(&ctx, Reporter::new(&NullSink)).expect("install");
        assert_eq!(pkg.include_path(), Some(PathBuf::from("/pm/include")));
        assert_eq!(pkg.lib_path(), Some(PathBuf::from("/pm/lib")));
        assert_eq!(pkg.link_flags(), vec!["-lzlib"]);
        assert_eq!(pkg.runtime_dirs(), vec![PathBuf::from("/pm/bin")]);
    }

    #[test]
    fn framework_pairs_survive_merging() {
        let mut a = Contributions {
            link_flags: vec!["-framework".into(), "Cocoa".into()],
            ..Contributions::default()
        };
        a.merge(Contributions {
            link_flags: vec![
                "-framework".into(),
                "Cocoa".into(),
                "-framework".into(),
                "OpenGL".into(),
                "-lm".into(),
            ],
            ..Contributions::default()
        });
        assert_eq!(a.link_flags, vec!["-framework", "Cocoa", "-framework", "OpenGL", "-lm"]);
    }
}
