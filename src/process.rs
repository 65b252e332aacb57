// Purpose: Run external tools (compilers, linker, cmake, package manager) with captured output.
// Inputs/Outputs: Takes a prepared Command plus a CancelToken; returns exit status and captured streams.
// Invariants: Never touches the parent process environment; per-child env goes on the Command.
// Gotchas: stdout/stderr are drained on helper threads so a chatty child cannot fill a pipe and stall.

use anyhow::Context;
use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::BuildError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// stderr if the tool wrote any, otherwise stdout; compilers are inconsistent about which they use.
    pub fn diagnostics(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

pub fn describe(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

/// Spawn `cmd`, wait for it, and kill it if `cancel` fires first.
pub fn run_captured(cmd: &mut Command, cancel: &CancelToken) -> anyhow::Result<Captured> {
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled.into());
    }
    let line = describe(cmd);
    tracing::trace!(target: "cmpile::process", "spawn: {line}");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to run {}", cmd.get_program().to_string_lossy()))?;

    let out_reader = child.stdout.take().map(|mut s| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            buf
        })
    });
    let err_reader = child.stderr.take().map(|mut s| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = s.read_to_end(&mut buf);
            buf
        })
    });

    let status = loop {
        if let Some(status) = child.try_wait().context("wait for child")? {
            break status;
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!(target: "cmpile::process", "killed: {line}");
            return Err(BuildError::Cancelled.into());
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = out_reader
        .and_then(|h| h.join().ok())
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    let stderr = err_reader
        .and_then(|h| h.join().ok())
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .unwrap_or_default();
    Ok(Captured {
        status,
        stdout,
        stderr,
    })
}

/// Like `run_captured`, but a nonzero exit becomes an error carrying the tool's diagnostics.
pub fn run_checked(cmd: &mut Command, cancel: &CancelToken) -> anyhow::Result<Captured> {
    let out = run_captured(cmd, cancel)?;
    if !out.success() {
        anyhow::bail!("command failed: {}\n{}", describe(cmd), out.diagnostics().trim_end());
    }
    Ok(out)
}
