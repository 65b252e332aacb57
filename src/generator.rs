// Purpose: Build-via-generator mode: emit a CMake project for the sources and let CMake drive the build.
// Inputs/Outputs: Sources plus resolved include/lib/link inputs -> out/CMakeLists.txt and the built artifact.
// Invariants: Carries the same inputs the direct compile/link path would use; the artifact lands where a direct link puts it.
// Gotchas: Multi-config generators append a config subdir, hence the *_OUTPUT_DIRECTORY_RELEASE properties.

use anyhow::Context;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::ensure_dir;
use crate::error::{BuildError, classify};
use crate::process::{CancelToken, run_checked};
use crate::report::Reporter;
use crate::scan::SourceUnit;
use crate::toolchain::ToolchainContext;

pub const BUILD_SUBDIR: &str = "cmake-build";

#[derive(Debug, Clone, Default)]
pub struct GeneratorProject {
    pub name: String,
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub lib_dirs: Vec<PathBuf>,
    /// `-l` tokens and raw linker flags, in link order.
    pub link_items: Vec<String>,
    pub compile_options: Vec<String>,
    pub shared: bool,
    /// Where the artifact should land.
    pub output_dir: PathBuf,
}

impl GeneratorProject {
    pub fn new(sources: &[SourceUnit], output_dir: &Path, shared: bool) -> Self {
        let stem = sources.first().map(SourceUnit::stem).unwrap_or_default();
        Self {
            name: target_name(&stem),
            sources: sources.iter().map(|u| u.path.clone()).collect(),
            shared,
            output_dir: output_dir.to_path_buf(),
            ..Self::default()
        }
    }
}

/// CMake target names allow `[A-Za-z0-9_.+-]`; anything else becomes `_`.
pub fn target_name(stem: &str) -> String {
    let name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '+' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "app".to_string()
    } else {
        name
    }
}

fn cmake_path(p: &Path) -> String {
    format!("\"{}\"", p.display().to_string().replace('\\', "/"))
}

fn cmake_arg(s: &str) -> String {
    if s.chars().any(|c| c.is_whitespace() || c == ';' || c == '"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s.to_string()
    }
}

fn write_list(out: &mut String, head: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}", head);
    for i in items {
        let _ = writeln!(out, "    {}", i);
    }
    let _ = writeln!(out, ")");
}

pub fn render_cmakelists(p: &GeneratorProject) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "cmake_minimum_required(VERSION 3.16)");
    let _ = writeln!(out, "project({} LANGUAGES C CXX)", p.name);
    let _ = writeln!(out);

    let sources: Vec<String> = p.sources.iter().map(|s| cmake_path(s)).collect();
    if p.shared {
        write_list(&mut out, &format!("add_library({} SHARED", p.name), &sources);
    } else {
        write_list(&mut out, &format!("add_executable({}", p.name), &sources);
    }

    let target = &p.name;
    let includes: Vec<String> = p.include_dirs.iter().map(|d| cmake_path(d)).collect();
    write_list(&mut out, &format!("target_include_directories({} PRIVATE", target), &includes);
    let libs: Vec<String> = p.lib_dirs.iter().map(|d| cmake_path(d)).collect();
    write_list(&mut out, &format!("target_link_directories({} PRIVATE", target), &libs);
    let items: Vec<String> = p.link_items.iter().map(|s| cmake_arg(s)).collect();
    write_list(&mut out, &format!("target_link_libraries({} PRIVATE", target), &items);
    let opts: Vec<String> = p.compile_options.iter().map(|s| cmake_arg(s)).collect();
    write_list(&mut out, &format!("target_compile_options({} PRIVATE", target), &opts);

    let dest = cmake_path(&p.output_dir);
    let _ = writeln!(out, "set_target_properties({} PROPERTIES", target);
    let _ = writeln!(out, "    PREFIX \"\"");
    for kind in ["RUNTIME", "LIBRARY"] {
        let _ = writeln!(out, "    {}_OUTPUT_DIRECTORY {}", kind, dest);
        let _ = writeln!(out, "    {}_OUTPUT_DIRECTORY_RELEASE {}", kind, dest);
    }
    let _ = writeln!(out, ")");
    out
}

pub fn write_project(out_dir: &Path, project: &GeneratorProject) -> anyhow::Result<PathBuf> {
    ensure_dir(out_dir)?;
    let path = out_dir.join("CMakeLists.txt");
    fs::write(&path, render_cmakelists(project))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Emit `out/CMakeLists.txt`, configure into `out/cmake-build`, then build the Release config.
pub fn build(
    out_dir: &Path,
    project: &GeneratorProject,
    toolchain: &ToolchainContext,
    cancel: &CancelToken,
    reporter: Reporter<'_>,
) -> Result<PathBuf, BuildError> {
    let Some(cmake) = toolchain.cmake.as_deref() else {
        return Err(BuildError::ToolMissing("cmake".into()));
    };
    let as_build_error = |e: anyhow::Error| match classify(&e) {
        Some(BuildError::Cancelled) => BuildError::Cancelled,
        _ => BuildError::Generator(format!("{:#}", e)),
    };

    let lists = write_project(out_dir, project).map_err(as_build_error)?;
    reporter.info(&format!("generated {}", lists.display()));
    let build_dir = out_dir.join(BUILD_SUBDIR);

    let mut configure = toolchain.command(cmake);
    configure
        .arg("-S")
        .arg(out_dir)
        .arg("-B")
        .arg(&build_dir)
        .arg(format!("-DCMAKE_C_COMPILER={}", toolchain.cc.display()))
        .arg(format!("-DCMAKE_CXX_COMPILER={}", toolchain.cxx.display()))
        .arg("-DCMAKE_BUILD_TYPE=Release");
    reporter.info("configuring with cmake");
    run_checked(&mut configure, cancel).map_err(as_build_error)?;

    let mut build = toolchain.command(cmake);
    build
        .arg("--build")
        .arg(&build_dir)
        .arg("--config")
        .arg("Release");
    reporter.info("building with cmake");
    let out = run_checked(&mut build, cancel).map_err(as_build_error)?;
    tracing::debug!(target: "cmpile::generator", bytes = out.stdout.len(), "cmake build finished");
    Ok(build_dir)
}
