// Purpose: Compilation stage: turn each source unit into an object file plus a dependency-rule file.
// Inputs/Outputs: Ordered SourceUnits + flags -> Vec<UnitOutcome> in the same order as the inputs.
// Invariants: results[i] always belongs to units[i]; a failed unit never cancels its siblings.
// Gotchas: Workers pull indices from a shared cursor, so completion order is arbitrary; slots restore order.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::cache::ensure_dir;
use crate::config::Settings;
use crate::error::{BuildError, classify};
use crate::incremental::{self, ArtifactPaths, artifact_paths};
use crate::process::{CancelToken, run_captured};
use crate::report::Reporter;
use crate::scan::SourceUnit;
use crate::toolchain::ToolchainContext;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Up to date; the existing object is reused.
    Skipped { object: PathBuf },
    Compiled { object: PathBuf, warnings: Option<String> },
    Failed { source: PathBuf, diagnostics: String },
}

impl UnitOutcome {
    pub fn object(&self) -> Option<&Path> {
        match self {
            UnitOutcome::Skipped { object } | UnitOutcome::Compiled { object, .. } => Some(object),
            UnitOutcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

/// Shared inputs for every unit of one compile stage.
pub struct CompileRequest<'a> {
    pub toolchain: &'a ToolchainContext,
    pub settings: &'a Settings,
    pub out_dir: &'a Path,
    pub flags: &'a [String],
    pub clean: bool,
    pub cancel: &'a CancelToken,
}

/// `-I` for the package-manager include dir (when present) and each extra dir, then user flags.
pub fn compile_flags(
    pm_include: Option<&Path>,
    include_dirs: &[PathBuf],
    user_flags: &[String],
) -> Vec<String> {
    let mut flags = Vec::new();
    let pm = pm_include.filter(|p| p.is_dir());
    for dir in pm.into_iter().chain(include_dirs.iter().map(PathBuf::as_path)) {
        let f = format!("-I{}", dir.display());
        if !flags.contains(&f) {
            flags.push(f);
        }
    }
    flags.extend(user_flags.iter().cloned());
    flags
}

pub fn compile_command(
    toolchain: &ToolchainContext,
    unit: &SourceUnit,
    paths: &ArtifactPaths,
    flags: &[String],
) -> Command {
    let mut cmd = toolchain.command(toolchain.compiler_for(unit.kind));
    cmd.arg("-c")
        .arg(&unit.path)
        .arg("-o")
        .arg(&paths.object)
        .arg("-MMD")
        .arg("-MF")
        .arg(&paths.depfile)
        .args(flags);
    cmd
}

pub fn compile_unit(unit: &SourceUnit, req: &CompileRequest<'_>, reporter: Reporter<'_>) -> UnitOutcome {
    let paths = artifact_paths(req.out_dir, unit);
    if !incremental::needs_rebuild(&unit.path, &paths.object, &paths.depfile, req.clean) {
        return UnitOutcome::Skipped {
            object: paths.object,
        };
    }
    let name = unit
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    reporter.info(&format!("compiling {}", name));

    let mut cmd = compile_command(req.toolchain, unit, &paths, req.flags);
    let out = match run_captured(&mut cmd, req.cancel) {
        Ok(out) => out,
        Err(e) => {
            let diagnostics = match classify(&e) {
                Some(BuildError::Cancelled) => BuildError::Cancelled.to_string(),
                _ => format!("{:#}", e),
            };
            reporter.error(&format!("{}: {}", name, diagnostics));
            return UnitOutcome::Failed {
                source: unit.path.clone(),
                diagnostics,
            };
        }
    };
    if !out.success() {
        let diagnostics = out.diagnostics().trim_end().to_string();
        reporter.error(&format!("{}:\n{}", name, diagnostics));
        return UnitOutcome::Failed {
            source: unit.path.clone(),
            diagnostics,
        };
    }
    let warnings = Some(out.stderr.trim_end().to_string()).filter(|w| !w.is_empty());
    if let Some(w) = &warnings {
        reporter.warn(w);
    }
    UnitOutcome::Compiled {
        object: paths.object,
        warnings,
    }
}

/// Compile every unit on a bounded pool; waits for all of them before returning.
pub fn compile_all(
    units: &[SourceUnit],
    req: &CompileRequest<'_>,
    reporter: Reporter<'_>,
) -> Vec<UnitOutcome> {
    if let Err(e) = ensure_dir(req.out_dir) {
        let diagnostics = format!("{:#}", e);
        return units
            .iter()
            .map(|u| UnitOutcome::Failed {
                source: u.path.clone(),
                diagnostics: diagnostics.clone(),
            })
            .collect();
    }

    let jobs = req.settings.job_count(units.len());
    tracing::debug!(target: "cmpile::compile", units = units.len(), jobs, "compile stage");
    let cursor = AtomicUsize::new(0);
    let next = &cursor;
    let mut slots: Vec<Option<UnitOutcome>> = vec![None; units.len()];

    thread::scope(|scope| {
        let handles: Vec<_> = (0..jobs)
            .map(|_| {
                scope.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(unit) = units.get(i) else {
                            break;
                        };
                        done.push((i, compile_unit(unit, req, reporter)));
                    }
                    done
                })
            })
            .collect();
        for h in handles {
            match h.join() {
                Ok(done) => {
                    for (i, outcome) in done {
                        slots[i] = Some(outcome);
                    }
                }
                Err(_) => tracing::error!(target: "cmpile::compile", "compile worker panicked"),
            }
        }
    });

    slots
        .into_iter()
        .zip(units)
        .map(|(slot, unit)| {
            slot.unwrap_or_else(|| UnitOutcome::Failed {
                source: unit.path.clone(),
                diagnostics: "compile worker panicked".to_string(),
            })
        })
        .collect()
}

pub fn failed_count(outcomes: &[UnitOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_failed()).count()
}

/// Object files in source order; failed units contribute nothing.
pub fn objects(outcomes: &[UnitOutcome]) -> Vec<PathBuf> {
    outcomes
        .iter()
        .filter_map(|o| o.object().map(Path::to_path_buf))
        .collect()
}
