// Purpose: Orchestrate one build: scan, resolve, install, compile, link, post-link, optional run.
// Inputs/Outputs: BuildOptions + Reporter -> BuildOutcome (terminal state, artifact path, child exit code).
// Invariants: Stages run strictly in order; the first BuildError aborts and nothing is retried.
// Gotchas: Local library roots are validated before any external process is spawned.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;

use crate::cache::remove_dir_forced;
use crate::compile::{self, CompileRequest};
use crate::config::{BuildOptions, Settings};
use crate::error::{BuildError, into_build_error};
use crate::ext::{
    Contributions, Extension, ExtensionProvider, FetchExtension, FetchSpec, InstallContext,
    LocalExtension, PackagedExtension, catalog,
};
use crate::generator::{self, GeneratorProject};
use crate::incremental::base_name_collisions;
use crate::link::{self, LinkJob, LinkPlan, output_paths};
use crate::pkg::{PackageManager, Vcpkg};
use crate::process::CancelToken;
use crate::report::Reporter;
use crate::resolve::{filter_satisfied_includes, resolve, skip_explicitly_linked, source_dirs};
use crate::scan::{self, DEFAULT_FETCH_VERSION, FetchDirective};
use crate::toolchain::ToolchainContext;

pub const OUT_DIR: &str = "out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Scanning,
    Resolving,
    Installing,
    Compiling,
    Linking,
    PostLink,
    Done,
    Aborted,
}

#[derive(Debug)]
pub struct BuildOutcome {
    pub success: bool,
    /// `Done` or `Aborted`.
    pub state: BuildState,
    /// Stage that was running when the build aborted.
    pub failed_stage: Option<BuildState>,
    pub output: Option<PathBuf>,
    /// Exit code of the produced program when it was run.
    pub exit_code: Option<i32>,
    pub error: Option<BuildError>,
}

impl BuildOutcome {
    /// Process exit status for a CLI wrapper: nonzero on any aborted build.
    pub fn status_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

struct Finished {
    output: PathBuf,
    exit_code: Option<i32>,
}

/// Fetch spec for a directive; a repo that matches a built-in preset keeps the preset's link metadata.
pub fn fetch_spec_for(directive: &FetchDirective) -> FetchSpec {
    let wanted = FetchSpec::from_repo(&directive.repo_url, &directive.version);
    match catalog::builtin()
        .into_iter()
        .find(|p| p.repo_url.eq_ignore_ascii_case(&wanted.repo_url))
    {
        Some(preset)
            if directive.version == DEFAULT_FETCH_VERSION || directive.version == preset.version =>
        {
            preset
        }
        Some(preset) => FetchSpec {
            version: directive.version.clone(),
            tag: None,
            ..preset
        },
        None => wanted,
    }
}

pub struct Builder {
    settings: Settings,
    toolchain: ToolchainContext,
    packages: Arc<dyn PackageManager>,
    extra: Contributions,
    cancel: CancelToken,
}

impl Builder {
    pub fn new(settings: Settings, toolchain: ToolchainContext, packages: Arc<dyn PackageManager>) -> Self {
        Self {
            settings,
            toolchain,
            packages,
            extra: Contributions::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Discovered toolchain and the vcpkg-backed package manager.
    pub fn from_settings(settings: Settings) -> Self {
        let toolchain = ToolchainContext::discover(&settings);
        let packages = Arc::new(Vcpkg::from_settings(&settings));
        Self::new(settings, toolchain, packages)
    }

    /// Extra include/lib/flag inputs (e.g. installed registry extensions) appended after directive ones.
    pub fn with_contributions(mut self, extra: Contributions) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn toolchain(&self) -> &ToolchainContext {
        &self.toolchain
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn build(&self, opts: &BuildOptions, reporter: Reporter<'_>) -> BuildOutcome {
        let mut state = BuildState::Scanning;
        match self.run_stages(opts, &mut state, reporter) {
            Ok(done) => BuildOutcome {
                success: true,
                state: BuildState::Done,
                failed_stage: None,
                output: Some(done.output),
                exit_code: done.exit_code,
                error: None,
            },
            Err(e) => {
                reporter.error(&e.to_string());
                tracing::debug!(
                    target: "cmpile::pipeline",
                    stage = ?state,
                    class = ?e.class(),
                    "build aborted"
                );
                BuildOutcome {
                    success: false,
                    state: BuildState::Aborted,
                    failed_stage: Some(state),
                    output: None,
                    exit_code: None,
                    error: Some(e),
                }
            }
        }
    }

    fn enter(&self, state: &mut BuildState, next: BuildState) -> Result<(), BuildError> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let prev = *state;
        tracing::debug!(target: "cmpile::pipeline", from = ?prev, to = ?next, "stage");
        *state = next;
        Ok(())
    }

    fn run_stages(
        &self,
        opts: &BuildOptions,
        state: &mut BuildState,
        reporter: Reporter<'_>,
    ) -> Result<Finished, BuildError> {
        let units = scan::expand_inputs(&opts.inputs).map_err(|e| {
            into_build_error(e, |msg| {
                reporter.error(&msg);
                BuildError::NoSources
            })
        })?;
        if units.is_empty() {
            return Err(BuildError::NoSources);
        }
        reporter.info(&format!("found {} source file(s)", units.len()));
        let scanned = scan::scan_all(&units, reporter);

        self.enter(state, BuildState::Resolving)?;
        let mut extensions = Vec::new();
        for local in &scanned.locals {
            if !local.root.is_dir() {
                return Err(BuildError::MissingLocalLibrary(local.root.clone()));
            }
            extensions.push(Extension::Local(LocalExtension::new(
                local.root.clone(),
                local.flags.clone(),
            )));
        }
        for directive in &scanned.fetches {
            let spec = fetch_spec_for(directive);
            extensions.push(Extension::Fetch(FetchExtension::new(spec, &self.settings)));
        }

        self.enter(state, BuildState::Installing)?;
        let ctx = InstallContext {
            settings: &self.settings,
            toolchain: &self.toolchain,
            cancel: &self.cancel,
        };
        let mut contrib = Contributions::default();
        for ext in &extensions {
            if !ext.is_installed() {
                ext.install(&ctx, reporter).map_err(|e| {
                    into_build_error(e, |cause| BuildError::FetchFailed {
                        repo: ext.name().to_string(),
                        cause,
                    })
                })?;
            }
            contrib.merge(ext.contributions());
        }
        contrib.merge(self.extra.clone());

        let mut search = contrib.include_dirs.clone();
        search.extend(opts.extra_includes.iter().cloned());
        search.extend(source_dirs(units.iter().map(|u| u.path.as_path())));
        let unresolved = filter_satisfied_includes(&scanned.includes, &search);
        let mut explicit = contrib.link_flags.clone();
        explicit.extend(opts.extra_link_flags.iter().cloned());
        let (packages, skipped) = skip_explicitly_linked(&resolve(&unresolved), &explicit);
        for p in &skipped {
            reporter.info(&format!("{} is linked explicitly; not installing it", p));
        }
        let packaged: Vec<PackagedExtension> = packages
            .iter()
            .map(|p| PackagedExtension {
                package: p.clone(),
                manager: Arc::clone(&self.packages),
            })
            .collect();
        if !packaged.is_empty() {
            let names = packages.iter().cloned().collect::<Vec<_>>().join(", ");
            reporter.info(&format!("required packages: {}", names));
        }
        for pkg in &packaged {
            if !pkg.is_installed() {
                pkg.install(&ctx, reporter).map_err(|e| {
                    into_build_error(e, |cause| BuildError::DependencyInstall {
                        package: pkg.package.clone(),
                        cause,
                    })
                })?;
            }
        }

        for (stem, paths) in base_name_collisions(&units) {
            let list = paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            reporter.warn(&format!(
                "sources share the base name `{}` and overwrite each other's objects: {}",
                stem, list
            ));
        }

        let project_root = units[0]
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let out_dir = project_root.join(OUT_DIR);
        if opts.clean
            && out_dir.exists()
            && let Err(e) = remove_dir_forced(&out_dir)
        {
            reporter.warn(&format!("could not clean {}: {:#}", out_dir.display(), e));
        }

        let pm_include = self.packages.include_dir();
        let pm_lib = self.packages.lib_dir();
        let mut include_dirs = contrib.include_dirs.clone();
        include_dirs.extend(opts.extra_includes.iter().cloned());
        let user_flags = opts.split_compiler_flags();
        let target = output_paths(&project_root, &out_dir, &units[0].stem(), opts.shared);

        self.enter(state, BuildState::Compiling)?;
        let output = if opts.use_generator {
            let plan = LinkPlan::assemble(Vec::new(), Some(&pm_lib), &packages, &contrib, opts);
            let mut project = GeneratorProject::new(&units, &project_root, opts.shared);
            project.include_dirs = Some(pm_include.clone())
                .filter(|p| p.is_dir())
                .into_iter()
                .chain(include_dirs)
                .collect();
            project.lib_dirs = plan.search_dirs;
            project.link_items = plan.tokens.into_iter().chain(plan.extra_flags).collect();
            project.compile_options = user_flags;
            generator::build(&out_dir, &project, &self.toolchain, &self.cancel, reporter)?;
            target.output.clone()
        } else {
            let flags = compile::compile_flags(Some(&pm_include), &include_dirs, &user_flags);
            let req = CompileRequest {
                toolchain: &self.toolchain,
                settings: &self.settings,
                out_dir: &out_dir,
                flags: &flags,
                clean: opts.clean,
                cancel: &self.cancel,
            };
            let outcomes = compile::compile_all(&units, &req, reporter);
            let failed = compile::failed_count(&outcomes);
            if failed > 0 {
                return Err(BuildError::Compilation { failed });
            }

            self.enter(state, BuildState::Linking)?;
            let plan = LinkPlan::assemble(
                compile::objects(&outcomes),
                Some(&pm_lib),
                &packages,
                &contrib,
                opts,
            );
            let job = LinkJob {
                linker: self.toolchain.linker_for(units.iter().map(|u| u.kind)),
                toolchain: &self.toolchain,
                plan: &plan,
                target: &target,
                shared: opts.shared,
                no_console: opts.no_console,
            };
            link::link(&job, &self.cancel, reporter)?
        };
        reporter.success(&format!("built {}", output.display()));

        self.enter(state, BuildState::PostLink)?;
        let mut runtime: Vec<PathBuf> = Vec::new();
        for dir in packaged
            .iter()
            .flat_map(|p| p.runtime_dirs())
            .chain(contrib.runtime_dirs.iter().cloned())
        {
            if !runtime.contains(&dir) {
                runtime.push(dir);
            }
        }
        let dest = output.parent().map(Path::to_path_buf).unwrap_or_default();
        let copied = link::copy_runtime_artifacts(&runtime, &dest);
        tracing::debug!(target: "cmpile::pipeline", copied, "runtime artifacts copied");

        let exit_code = if opts.run && !opts.shared {
            self.run_program(&output, reporter)
        } else {
            if opts.shared {
                reporter.info(&format!("shared library created at {}", output.display()));
            }
            None
        };
        *state = BuildState::Done;
        Ok(Finished { output, exit_code })
    }

    /// Run the produced program with the package-manager bin dir on its PATH, streaming stdout to the log.
    fn run_program(&self, program: &Path, reporter: Reporter<'_>) -> Option<i32> {
        reporter.info("running...");
        let bin = self.packages.bin_dir();
        let extra: Vec<PathBuf> = Some(bin).filter(|b| b.is_dir()).into_iter().collect();
        let mut cmd = std::process::Command::new(program);
        if let Some(path) = self.toolchain.child_path(&extra) {
            cmd.env("PATH", path);
        }
        if let Some(dir) = program.parent() {
            cmd.current_dir(dir);
        }
        let mut child = match cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                reporter.error(&format!("could not run {}: {}", program.display(), e));
                return None;
            }
        };
        let err_reader = child.stderr.take().map(|mut s| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = s.read_to_string(&mut buf);
                buf
            })
        });
        if let Some(out) = child.stdout.take() {
            for line in BufReader::new(out).lines().map_while(Result::ok) {
                if !line.trim().is_empty() {
                    reporter.info(line.trim_end());
                }
            }
        }
        let status = match child.wait() {
            Ok(s) => s,
            Err(e) => {
                reporter.error(&format!("execution error: {}", e));
                return None;
            }
        };
        let stderr = err_reader.and_then(|h| h.join().ok()).unwrap_or_default();
        let code = status.code();
        if !status.success() {
            match code {
                Some(c) => reporter.error(&format!("program exited with code {}", c)),
                None => reporter.error("program terminated by a signal"),
            }
            if !stderr.trim().is_empty() {
                reporter.error(stderr.trim_end());
            }
        }
        code
    }
}

#[cfg(test)]
mod tests {
    use super::{BuildState, Builder, fetch_spec_for};
    use crate::config::{BuildOptions, Settings};
    use crate::error::BuildError;
    use crate::pkg::testing::FakeManager;
    use crate::report::{MemorySink, NullSink, Reporter};
    use crate::scan::FetchDirective;
    use crate::toolchain::ToolchainContext;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-pipe-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn builder(home: &std::path::Path, pm: FakeManager, tc: ToolchainContext) -> Builder {
        let mut settings = Settings::rooted_at(home);
        settings.jobs = Some(2);
        Builder::new(settings, tc, Arc::new(pm))
    }

    #[test]
    fn directive_for_preset_repo_keeps_preset_metadata() {
        let d = FetchDirective {
            repo_url: "https://github.com/skypjack/entt".into(),
            version: "main".into(),
        };
        let spec = fetch_spec_for(&d);
        assert!(spec.header_only);
        assert_eq!(spec.reference(), "v3.16.0");

        let pinned = fetch_spec_for(&FetchDirective {
            repo_url: "https://github.com/skypjack/entt".into(),
            version: "3.15.0".into(),
        });
        assert_eq!(pinned.reference(), "3.15.0");

        let other = fetch_spec_for(&FetchDirective {
            repo_url: "https://github.com/fmtlib/fmt".into(),
            version: "main".into(),
        });
        assert_eq!(other.name, "fmt");
        assert!(!other.header_only);
    }

    #[test]
    fn empty_input_dir_aborts_while_scanning() {
        let root = temp_dir("empty");
        fs::create_dir_all(root.join("src")).expect("mkdir");
        let b = builder(&root.join("home"), FakeManager::default(), ToolchainContext::fixed("cc", "c++"));
        let out = b.build(&BuildOptions::new([root.join("src")]), Reporter::new(&NullSink));
        assert!(!out.success);
        assert_eq!(out.state, BuildState::Aborted);
        assert_eq!(out.failed_stage, Some(BuildState::Scanning));
        assert!(matches!(out.error, Some(BuildError::NoSources)));
        assert_eq!(out.status_code(), 1);

        let missing = b.build(&BuildOptions::new([root.join("nope.c")]), Reporter::new(&NullSink));
        assert!(matches!(missing.error, Some(BuildError::MissingInput(_))));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_local_library_aborts_before_any_process() {
        let root = temp_dir("local");
        let src = root.join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("main.c"), "// @local ../vendor/box2d -lbox2d\nint main(void){return 0;}\n")
            .expect("write");
        let sink = MemorySink::new();
        let b = builder(&root.join("home"), FakeManager::default(), ToolchainContext::fixed("/nonexistent/cc", "/nonexistent/c++"));
        let out = b.build(&BuildOptions::new([src.join("main.c")]), Reporter::new(&sink));
        assert_eq!(out.failed_stage, Some(BuildState::Resolving));
        assert!(matches!(out.error, Some(BuildError::MissingLocalLibrary(_))));
        assert!(!src.join("out").exists());
        assert!(sink.contains("declared local library path not found"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unavailable_package_manager_aborts_installing() {
        let root = temp_dir("nopm");
        let src = root.join("src");
        fs::create_dir_all(&src).expect("mkdir");
        fs::write(src.join("main.cpp"), "#include <fmt/core.h>\n#include <vector>\n").expect("write");
        let b = builder(&root.join("home"), FakeManager::default(), ToolchainContext::fixed("cc", "c++"));
        let out = b.build(&BuildOptions::new([src.join("main.cpp")]), Reporter::new(&NullSink));
        assert_eq!(out.failed_stage, Some(BuildState::Installing));
        assert!(matches!(out.error, Some(BuildError::PackageManagerUnavailable(ref p)) if p == "fmt"));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    mod fake_toolchain {
        use super::{builder, temp_dir};
        use crate::config::BuildOptions;
        use crate::error::BuildError;
        use crate::pipeline::BuildState;
        use crate::pkg::testing::FakeManager;
        use crate::report::{MemorySink, Reporter};
        use crate::toolchain::ToolchainContext;
        use crate::toolchain::testing::fake_tool;
        use std::fs;
        use std::path::{Path, PathBuf};

        const FAKE_CC: &str = r#"mode=link; out=""; dep=""; src=""; all="$*"
while [ $# -gt 0 ]; do
  case "$1" in
    -c) mode=compile; shift; src="$1" ;;
    -o) shift; out="$1" ;;
    -MF) shift; dep="$1" ;;
  esac
  shift
done
if [ "$mode" = compile ]; then
  case "$src" in *bad*) echo "$src:2: error: nope" >&2; exit 1 ;; esac
  echo obj > "$out"
  echo "$out: $src" > "$dep"
  exit 0
fi
echo "$all" > "$(dirname "$out")/link-args.txt"
printf '#!/bin/sh\necho hello from app\nexit 3\n' > "$out"
chmod +x "$out""#;

        fn toolchain(root: &Path) -> ToolchainContext {
            let cc = fake_tool(&root.join("bin"), "fakecc", FAKE_CC);
            ToolchainContext::fixed(&cc, &cc)
        }

        fn project(root: &Path, files: &[(&str, &str)]) -> Vec<PathBuf> {
            let src = root.join("proj");
            fs::create_dir_all(&src).expect("mkdir proj");
            files
                .iter()
                .map(|(name, body)| {
                    let p = src.join(name);
                    fs::write(&p, body).expect("write source");
                    p
                })
                .collect()
        }

        #[test]
        fn build_installs_packages_links_copies_runtime_and_runs() {
            let root = temp_dir("full");
            project(
                &root,
                &[
                    ("main.cpp", "#include <nlohmann/json.hpp>\n#include <fmt/core.h>\n#include \"util.h\"\nint main(){}\n"),
                    ("util.h", "#pragma once\n"),
                    ("util.c", "#include <stdio.h>\n"),
                ],
            );
            let pm_root = root.join("pm");
            fs::create_dir_all(pm_root.join("bin")).expect("mkdir pm bin");
            fs::write(pm_root.join("bin").join("libfmt.so"), "so").expect("write so");
            let pm = FakeManager {
                root: pm_root,
                available: true,
                ..FakeManager::default()
            };
            let b = builder(&root.join("home"), pm, toolchain(&root));
            let mut opts = BuildOptions::new([root.join("proj")]);
            opts.run = true;
            opts.compiler_flags = "-O2".into();
            let sink = MemorySink::new();
            let out = b.build(&opts, Reporter::new(&sink));

            assert!(out.success, "log: {:?}", sink.lines());
            assert_eq!(out.state, BuildState::Done);
            let exe = root.join("proj").join("main");
            assert_eq!(out.output.as_deref(), Some(exe.as_path()));
            assert_eq!(out.exit_code, Some(3));
            assert!(sink.contains("hello from app"));
            assert!(sink.contains("program exited with code 3"));
            assert!(sink.contains("required packages: fmt, nlohmann-json"));
            assert!(root.join("proj").join("libfmt.so").is_file());

            let args = fs::read_to_string(root.join("proj").join("link-args.txt")).expect("link args");
            assert!(args.contains("-lfmt"));
            assert!(!args.contains("nlohmann"));
            assert!(args.contains("main.o") && args.contains("util.o"));

            let _ = fs::remove_dir_all(root);
        }

        #[test]
        fn compile_failure_aborts_before_linking() {
            let root = temp_dir("fail");
            project(&root, &[("good.c", "int a;\n"), ("bad.c", "int b\n")]);
            let b = builder(&root.join("home"), FakeManager::default(), toolchain(&root));
            let sink = MemorySink::new();
            let out = b.build(&BuildOptions::new([root.join("proj")]), Reporter::new(&sink));
            assert_eq!(out.failed_stage, Some(BuildState::Compiling));
            assert!(matches!(out.error, Some(BuildError::Compilation { failed: 1 })));
            assert!(out.output.is_none());
            assert!(sink.contains("error: nope"));
            assert!(!root.join("proj").join("link-args.txt").exists());
            let _ = fs::remove_dir_all(root);
        }

        #[test]
        fn explicit_link_flag_skips_package_install() {
            let root = temp_dir("explicit");
            let inputs = project(&root, &[("main.cpp", "#include <fmt/core.h>\n")]);
            let b = builder(&root.join("home"), FakeManager::default(), toolchain(&root));
            let mut opts = BuildOptions::new(inputs);
            opts.extra_link_flags = vec!["-lfmt".into()];
            let sink = MemorySink::new();
            let out = b.build(&opts, Reporter::new(&sink));
            assert!(out.success, "log: {:?}", sink.lines());
            assert!(sink.contains("fmt is linked explicitly"));
            let _ = fs::remove_dir_all(root);
        }
    }
}
