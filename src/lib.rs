// Purpose: Crate-level module surface for the build orchestrator and its collaborators.
// Inputs/Outputs: Exposes stages to the binary, tests and embedding callers.
// Invariants: Stages only talk to each other through the types re-exported here.
// Gotchas: Keep module wiring consistent with src/main.rs.

pub mod cache;
pub mod cli;
pub mod compile;
pub mod config;
pub mod depfile;
pub mod error;
pub mod ext;
pub mod generator;
pub mod incremental;
pub mod link;
pub mod pipeline;
pub mod pkg;
pub mod process;
pub mod report;
pub mod resolve;
pub mod scan;
pub mod toolchain;

pub use config::{BuildOptions, Settings};
pub use error::{BuildError, ErrorClass};
pub use pipeline::{BuildOutcome, BuildState, Builder};
