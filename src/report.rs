// Purpose: Carry the user-facing build log stream and initialise diagnostic tracing.
// Inputs/Outputs: Stages write leveled messages to a LogSink; every message is mirrored as a tracing event.
// Invariants: Sinks are shared across compile workers, so implementations must be Send + Sync.
// Gotchas: Tracing is only installed when CMPILE_LOG or RUST_LOG is set; the log stream is always live.

use std::sync::{Mutex, Once};

static TRACING_INIT: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, msg: &str);
}

impl<F> LogSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn log(&self, level: Level, msg: &str) {
        self(level, msg)
    }
}

/// Thin wrapper stages use instead of talking to a sink directly.
#[derive(Clone, Copy)]
pub struct Reporter<'a> {
    sink: &'a dyn LogSink,
}

impl<'a> Reporter<'a> {
    pub fn new(sink: &'a dyn LogSink) -> Self {
        Self { sink }
    }

    pub fn emit(&self, level: Level, msg: &str) {
        match level {
            Level::Error => tracing::error!(target: "cmpile::build", "{msg}"),
            Level::Warn => tracing::warn!(target: "cmpile::build", "{msg}"),
            Level::Info | Level::Success => tracing::info!(target: "cmpile::build", "{msg}"),
        }
        self.sink.log(level, msg);
    }

    pub fn info(&self, msg: &str) {
        self.emit(Level::Info, msg);
    }

    pub fn success(&self, msg: &str) {
        self.emit(Level::Success, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.emit(Level::Warn, msg);
    }

    pub fn error(&self, msg: &str) {
        self.emit(Level::Error, msg);
    }
}

/// Sink that drops everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _level: Level, _msg: &str) {}
}

/// Sink that records every line; used by callers that want the log text after the fact.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|(_, l)| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: Level, msg: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, msg.to_string()));
        }
    }
}

/// Install the tracing subscriber once. `CMPILE_LOG` wins over `RUST_LOG`.
pub fn init_tracing(verbose: bool) {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt, prelude::*};

        let directive = std::env::var("CMPILE_LOG")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .or_else(|| verbose.then(|| "cmpile=debug".to_string()));
        let Some(directive) = directive else {
            return;
        };
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("cmpile=info"));
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_level(true),
            )
            .with(filter)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::{Level, MemorySink, Reporter};

    #[test]
    fn reporter_forwards_levels_to_sink() {
        let sink = MemorySink::new();
        let r = Reporter::new(&sink);
        r.info("scanning");
        r.error("link failed");
        let lines = sink.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Level::Info, "scanning".to_string()));
        assert_eq!(lines[1].0, Level::Error);
        assert!(sink.contains("link failed"));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |level: Level, msg: &str| {
            seen.lock().expect("lock").push((level, msg.to_string()));
        };
        Reporter::new(&sink).warn("heads up");
        assert_eq!(seen.lock().expect("lock")[0].1, "heads up");
    }
}
