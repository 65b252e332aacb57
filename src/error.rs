// Purpose: Build failure taxonomy and the bridge from stage-internal anyhow errors to it.
// Inputs/Outputs: anyhow::Error chains -> one terminal BuildError with an ErrorClass.
// Invariants: A typed BuildError inside a chain is recovered as-is; cancellation is never reclassified.
// Gotchas: Fallback messages use `{:#}` so the whole context chain reaches the log.

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Input,
    Environment,
    Dependency,
    Compilation,
    Link,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no valid source files found")]
    NoSources,

    #[error("file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("declared local library path not found: {}", .0.display())]
    MissingLocalLibrary(PathBuf),

    #[error("required tool `{0}` is not available")]
    ToolMissing(String),

    #[error("package manager is not available; cannot install {0}")]
    PackageManagerUnavailable(String),

    #[error("failed to install dependency {package}: {cause}")]
    DependencyInstall { package: String, cause: String },

    #[error("failed to fetch {repo}: {cause}")]
    FetchFailed { repo: String, cause: String },

    #[error("compilation failed for {failed} file(s)")]
    Compilation { failed: usize },

    #[error("linking failed:\n{0}")]
    Link(String),

    #[error("generator build failed: {0}")]
    Generator(String),

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BuildError::NoSources
            | BuildError::MissingInput(_)
            | BuildError::MissingLocalLibrary(_) => ErrorClass::Input,
            BuildError::ToolMissing(_)
            | BuildError::PackageManagerUnavailable(_)
            | BuildError::Cancelled => ErrorClass::Environment,
            BuildError::DependencyInstall { .. } | BuildError::FetchFailed { .. } => {
                ErrorClass::Dependency
            }
            BuildError::Compilation { .. } => ErrorClass::Compilation,
            BuildError::Link(_) | BuildError::Generator(_) => ErrorClass::Link,
        }
    }
}

/// Walk an anyhow chain looking for a typed build error raised deeper down.
pub fn classify(err: &anyhow::Error) -> Option<&BuildError> {
    err.chain().find_map(|e| e.downcast_ref::<BuildError>())
}

/// Recover the typed error from an anyhow chain, or build one from its rendered text.
pub fn into_build_error(err: anyhow::Error, fallback: impl FnOnce(String) -> BuildError) -> BuildError {
    match err.downcast::<BuildError>() {
        Ok(be) => be,
        Err(err) => match classify(&err) {
            Some(BuildError::Cancelled) => BuildError::Cancelled,
            _ => fallback(format!("{:#}", err)),
        },
    }
}
