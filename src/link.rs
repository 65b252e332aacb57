// Purpose: Link stage: derive library tokens, assemble one linker command, copy runtime libraries.
// Inputs/Outputs: Object files + LinkPlan + toolchain -> linked artifact path (or verbatim linker diagnostics).
// Invariants: Exactly one linker invocation per build; plan order is search dirs, tokens, then raw flags.
// Gotchas: Token derivation sniffs file names in the package manager's lib dir and is best-effort by nature.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::BuildOptions;
use crate::error::{BuildError, classify};
use crate::ext::Contributions;
use crate::ext::detect::is_shared_lib;
use crate::process::{CancelToken, run_captured};
use crate::report::Reporter;
use crate::toolchain::ToolchainContext;

/// Packages that ship headers only and never produce a link token.
pub const HEADER_ONLY_PACKAGES: &[&str] = &["nlohmann-json", "glm", "eigen3"];

/// Packages whose library names diverge from the package name.
const LIBRARY_OVERRIDES: &[(&str, &[&str])] = &[
    ("qtbase", &["Qt6Widgets", "Qt6Gui", "Qt6Core", "Qt6Network"]),
    ("sdl2", &["SDL2main", "SDL2"]),
];

/// Link tokens for `package`, probing `lib_dir` for the names actually on disk.
pub fn resolve_library_token(package: &str, lib_dir: &Path) -> Vec<String> {
    let files: Vec<String> = fs::read_dir(lib_dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    resolve_library_token_in(package, &files)
}

/// Same as [`resolve_library_token`] over an explicit file listing.
pub fn resolve_library_token_in(package: &str, files: &[String]) -> Vec<String> {
    if HEADER_ONLY_PACKAGES.contains(&package) {
        return Vec::new();
    }
    if let Some((_, libs)) = LIBRARY_OVERRIDES.iter().find(|(p, _)| *p == package) {
        return libs.iter().map(|l| format!("-l{}", l)).collect();
    }

    let has = |name: &str| files.iter().any(|f| f == name);
    let probes = [
        (format!("lib{}dll.a", package), format!("-l{}dll", package)),
        (format!("lib{}.dll.a", package), format!("-l{}", package)),
        (format!("lib{}.a", package), format!("-l{}", package)),
        (format!("{}.lib", package), format!("-l{}", package)),
    ];
    if let Some((file, token)) = probes.iter().find(|(f, _)| has(f)) {
        tracing::trace!(target: "cmpile::link", package, file = %file, "probe hit");
        return vec![token.clone()];
    }

    let prefix = format!("lib{}", package);
    let mut loose: Vec<&String> = files
        .iter()
        .filter(|f| f.starts_with(&prefix) && f.ends_with(".a"))
        .collect();
    loose.sort();
    if let Some(name) = loose
        .first()
        .and_then(|f| f.strip_prefix("lib"))
        .and_then(|f| f.strip_suffix(".a"))
        .filter(|n| !n.is_empty())
    {
        tracing::trace!(target: "cmpile::link", package, name, "prefix fallback");
        return vec![format!("-l{}", name)];
    }

    tracing::debug!(target: "cmpile::link", package, "no library file found; using raw name");
    vec![format!("-l{}", package)]
}

/// Everything the linker receives besides the output switches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPlan {
    pub objects: Vec<PathBuf>,
    pub search_dirs: Vec<PathBuf>,
    pub tokens: Vec<String>,
    pub extra_flags: Vec<String>,
}

impl LinkPlan {
    pub fn new(objects: Vec<PathBuf>) -> Self {
        Self {
            objects,
            ..Self::default()
        }
    }

    pub fn add_search_dir(&mut self, dir: &Path) {
        if !self.search_dirs.iter().any(|d| d == dir) {
            self.search_dirs.push(dir.to_path_buf());
        }
    }

    pub fn add_token(&mut self, token: String) {
        if !self.tokens.contains(&token) {
            self.tokens.push(token);
        }
    }

    /// Package-manager dir and package tokens first; extension and user extras follow.
    pub fn assemble(
        objects: Vec<PathBuf>,
        pm_lib: Option<&Path>,
        packages: &BTreeSet<String>,
        extensions: &Contributions,
        opts: &BuildOptions,
    ) -> Self {
        let mut plan = Self::new(objects);
        if let Some(dir) = pm_lib.filter(|d| d.is_dir()) {
            plan.add_search_dir(dir);
        }
        for d in extensions.lib_dirs.iter().chain(&opts.extra_lib_dirs) {
            plan.add_search_dir(d);
        }
        for pkg in packages {
            let tokens = match pm_lib {
                Some(dir) => resolve_library_token(pkg, dir),
                None => resolve_library_token_in(pkg, &[]),
            };
            for t in tokens {
                plan.add_token(t);
            }
        }
        // Extension flags arrive deduplicated; user flags are passed through verbatim.
        plan.extra_flags = extensions.link_flags.clone();
        plan.extra_flags.extend(opts.extra_link_flags.iter().cloned());
        plan
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub output: PathBuf,
    /// Windows shared builds only.
    pub import_lib: Option<PathBuf>,
}

pub fn output_paths(project_root: &Path, out_dir: &Path, stem: &str, shared: bool) -> LinkTarget {
    let file = if shared {
        if cfg!(windows) {
            format!("{}.dll", stem)
        } else if cfg!(target_os = "macos") {
            format!("{}.dylib", stem)
        } else {
            format!("{}.so", stem)
        }
    } else if cfg!(windows) {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    };
    let import_lib = (shared && cfg!(windows)).then(|| out_dir.join(format!("lib{}.a", stem)));
    LinkTarget {
        output: project_root.join(file),
        import_lib,
    }
}

/// One link request; borrowed from the orchestrator for a single invocation.
pub struct LinkJob<'a> {
    pub linker: &'a Path,
    pub toolchain: &'a ToolchainContext,
    pub plan: &'a LinkPlan,
    pub target: &'a LinkTarget,
    pub shared: bool,
    pub no_console: bool,
}

pub fn link_args(job: &LinkJob<'_>) -> Vec<OsString> {
    let mut args: Vec<OsString> = job.plan.objects.iter().map(|o| o.into()).collect();
    args.push("-o".into());
    args.push(job.target.output.as_os_str().to_owned());
    if job.shared {
        args.push("-shared".into());
        if let Some(implib) = &job.target.import_lib {
            let mut a = OsString::from("-Wl,--out-implib,");
            a.push(implib);
            args.push(a);
        }
    }
    if job.no_console && cfg!(windows) {
        args.push("-mwindows".into());
    }
    for d in &job.plan.search_dirs {
        let mut a = OsString::from("-L");
        a.push(d);
        args.push(a);
    }
    args.extend(job.plan.tokens.iter().map(OsString::from));
    args.extend(job.plan.extra_flags.iter().map(OsString::from));
    if ToolchainContext::is_gcc_driver(job.linker) {
        args.push("-static-libgcc".into());
        args.push("-static-libstdc++".into());
    }
    args
}

pub fn link_command(job: &LinkJob<'_>) -> Command {
    let mut cmd = job.toolchain.command(job.linker);
    cmd.args(link_args(job));
    cmd
}

/// Run the linker once. Failure diagnostics are surfaced verbatim; success stderr becomes warnings.
pub fn link(job: &LinkJob<'_>, cancel: &CancelToken, reporter: Reporter<'_>) -> Result<PathBuf, BuildError> {
    let mut cmd = link_command(job);
    tracing::debug!(
        target: "cmpile::link",
        objects = job.plan.objects.len(),
        tokens = ?job.plan.tokens,
        "linking {}",
        job.target.output.display()
    );
    let out = match run_captured(&mut cmd, cancel) {
        Ok(out) => out,
        Err(e) => {
            if let Some(BuildError::Cancelled) = classify(&e) {
                return Err(BuildError::Cancelled);
            }
            tracing::debug!(target: "cmpile::link", "spawn failed: {:#}", e);
            return Err(BuildError::ToolMissing(job.linker.display().to_string()));
        }
    };
    if !out.success() {
        return Err(BuildError::Link(out.diagnostics().trim_end().to_string()));
    }
    if !out.stderr.trim().is_empty() {
        reporter.warn(out.stderr.trim_end());
    }
    Ok(job.target.output.clone())
}

/// Copy shared libraries from `dirs` into `dest`; returns how many were copied. Failures are skipped.
pub fn copy_runtime_artifacts(dirs: &[PathBuf], dest: &Path) -> usize {
    let mut copied = 0;
    for dir in dirs {
        let Ok(rd) = fs::read_dir(dir) else {
            continue;
        };
        for entry in rd.filter_map(|e| e.ok()) {
            let src = entry.path();
            if !src.is_file() || !is_shared_lib(&src) {
                continue;
            }
            let dst = dest.join(entry.file_name());
            match fs::copy(&src, &dst) {
                Ok(_) => copied += 1,
                Err(e) => tracing::debug!(
                    target: "cmpile::link",
                    src = %src.display(),
                    "runtime copy skipped: {e}"
                ),
            }
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::{
        LinkJob, LinkPlan, LinkTarget, copy_runtime_artifacts, link_args, output_paths,
        resolve_library_token, resolve_library_token_in,
    };
    use crate::config::BuildOptions;
    use crate::ext::Contributions;
    use crate::toolchain::ToolchainContext;
    use std::collections::BTreeSet;
    use std::ffi::OsString;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-link-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn static_archive_and_empty_dir_tokens() {
        let root = temp_dir("token");
        fs::create_dir_all(&root).expect("mkdir");
        assert_eq!(resolve_library_token("foo", &root), vec!["-lfoo"]);
        fs::write(root.join("libfoo.a"), "").expect("write archive");
        assert_eq!(resolve_library_token("foo", &root), vec!["-lfoo"]);
        assert_eq!(resolve_library_token("foo", &root.join("missing")), vec!["-lfoo"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn probe_order_and_fallbacks() {
        assert_eq!(
            resolve_library_token_in("zlib", &files(&["libzlibdll.a", "libzlib.a"])),
            vec!["-lzlibdll"]
        );
        assert_eq!(resolve_library_token_in("fmt", &files(&["fmt.lib"])), vec!["-lfmt"]);
        assert_eq!(
            resolve_library_token_in("spdlog", &files(&["libspdlogd.a", "README"])),
            vec!["-lspdlogd"]
        );
        assert!(resolve_library_token_in("glm", &files(&["libglm.a"])).is_empty());
        assert_eq!(
            resolve_library_token_in("sdl2", &[]),
            vec!["-lSDL2main", "-lSDL2"]
        );
        assert_eq!(resolve_library_token_in("qtbase", &[]).len(), 4);
    }

    #[test]
    fn plan_orders_package_entries_before_extras() {
        let root = temp_dir("plan");
        let pm_lib = root.join("pm-lib");
        fs::create_dir_all(&pm_lib).expect("mkdir");
        fs::write(pm_lib.join("libfmt.a"), "").expect("write");

        let ext = Contributions {
            include_dirs: vec![],
            lib_dirs: vec![PathBuf::from("/ext/lib")],
            link_flags: vec!["-lraylib".into(), "-lm".into()],
            runtime_dirs: vec![],
        };
        let mut opts = BuildOptions::new(["main.c"]);
        opts.extra_lib_dirs = vec![PathBuf::from("/user/lib")];
        opts.extra_link_flags = vec!["-lm".into(), "-lpthread".into()];
        let packages = BTreeSet::from(["fmt".to_string(), "glm".to_string()]);

        let plan = LinkPlan::assemble(
            vec![PathBuf::from("a.o")],
            Some(&pm_lib),
            &packages,
            &ext,
            &opts,
        );
        assert_eq!(
            plan.search_dirs,
            vec![pm_lib.clone(), PathBuf::from("/ext/lib"), PathBuf::from("/user/lib")]
        );
        assert_eq!(plan.tokens, vec!["-lfmt"]);
        assert_eq!(plan.extra_flags, vec!["-lraylib", "-lm", "-lm", "-lpthread"]);

        let missing = LinkPlan::assemble(vec![], Some(&root.join("nope")), &packages, &ext, &opts);
        assert_eq!(missing.search_dirs[0], PathBuf::from("/ext/lib"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn user_link_flags_keep_repeats_and_pairs() {
        let mut opts = BuildOptions::new(["main.c"]);
        opts.extra_link_flags = ["-framework", "Cocoa", "-framework", "OpenGL", "-la", "-lb", "-la"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let plan = LinkPlan::assemble(vec![], None, &BTreeSet::new(), &Contributions::default(), &opts);
        assert_eq!(plan.extra_flags, opts.extra_link_flags);
    }

    #[test]
    fn args_put_objects_first_and_runtime_flags_last_for_gcc() {
        let plan = LinkPlan {
            objects: vec![PathBuf::from("out/a.o"), PathBuf::from("out/b.o")],
            search_dirs: vec![PathBuf::from("/lib")],
            tokens: vec!["-lfoo".into()],
            extra_flags: vec!["-lm".into()],
        };
        let target = LinkTarget {
            output: PathBuf::from("app"),
            import_lib: None,
        };
        let tc = ToolchainContext::fixed("gcc", "g++");
        let job = LinkJob {
            linker: Path::new("g++"),
            toolchain: &tc,
            plan: &plan,
            target: &target,
            shared: false,
            no_console: false,
        };
        let args = link_args(&job);
        let want: Vec<OsString> = [
            "out/a.o", "out/b.o", "-o", "app", "-L/lib", "-lfoo", "-lm", "-static-libgcc",
            "-static-libstdc++",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        assert_eq!(args, want);

        let clang = LinkJob {
            linker: Path::new("clang++"),
            shared: true,
            ..job
        };
        let args = link_args(&clang);
        assert!(args.contains(&OsString::from("-shared")));
        assert!(!args.contains(&OsString::from("-static-libgcc")));
    }

    #[test]
    fn output_names_follow_platform() {
        let t = output_paths(Path::new("/p"), Path::new("/p/out"), "app", false);
        if cfg!(windows) {
            assert_eq!(t.output, PathBuf::from("/p/app.exe"));
        } else {
            assert_eq!(t.output, PathBuf::from("/p/app"));
            assert!(t.import_lib.is_none());
        }
        let s = output_paths(Path::new("/p"), Path::new("/p/out"), "app", true);
        assert!(s.output.extension().is_some());
    }

    #[test]
    fn runtime_copy_takes_only_shared_libraries() {
        let root = temp_dir("runtime");
        let bin = root.join("bin");
        let dest = root.join("dest");
        fs::create_dir_all(&bin).expect("mkdir bin");
        fs::create_dir_all(&dest).expect("mkdir dest");
        fs::write(bin.join("libfoo.so"), "x").expect("write so");
        fs::write(bin.join("foo.dll"), "x").expect("write dll");
        fs::write(bin.join("readme.txt"), "x").expect("write txt");

        let n = copy_runtime_artifacts(&[bin, root.join("absent")], &dest);
        assert_eq!(n, 2);
        assert!(dest.join("libfoo.so").is_file());
        assert!(!dest.join("readme.txt").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn fake_linker_success_and_failure() {
        use super::link;
        use crate::error::BuildError;
        use crate::process::CancelToken;
        use crate::report::{MemorySink, Reporter};
        use crate::toolchain::testing::fake_tool;

        let root = temp_dir("fake");
        let ok = fake_tool(
            &root.join("bin"),
            "okld",
            "while [ $# -gt 0 ]; do if [ \"$1\" = -o ]; then shift; echo linked > \"$1\"; fi; shift; done\necho 'note: something' >&2",
        );
        let bad = fake_tool(&root.join("bin"), "badld", "echo 'undefined reference to foo' >&2\nexit 1");
        let tc = ToolchainContext::fixed(&ok, &ok);
        let plan = LinkPlan::new(vec![root.join("a.o")]);
        let target = LinkTarget {
            output: root.join("app"),
            import_lib: None,
        };
        let sink = MemorySink::new();
        let job = LinkJob {
            linker: &ok,
            toolchain: &tc,
            plan: &plan,
            target: &target,
            shared: false,
            no_console: false,
        };
        let out = link(&job, &CancelToken::new(), Reporter::new(&sink)).expect("link ok");
        assert!(out.is_file());
        assert!(sink.contains("note: something"));

        let job = LinkJob { linker: &bad, ..job };
        match link(&job, &CancelToken::new(), Reporter::new(&sink)) {
            Err(BuildError::Link(diag)) => assert!(diag.contains("undefined reference to foo")),
            other => panic!("expected link error, got {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }
}
