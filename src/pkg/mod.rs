// Purpose: Package-manager collaborator boundary for prebuilt dependencies.
// Inputs/Outputs: Package identifiers in; install side effects plus include/lib/bin directories out.
// Invariants: A failed install never leaves the package reported as installed.
// Gotchas: Availability is checked per install so a missing manager only matters when packages are needed.

pub mod vcpkg;

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::PathBuf;

use crate::error::BuildError;
use crate::process::CancelToken;
use crate::report::Reporter;

pub use vcpkg::Vcpkg;

pub trait PackageManager: Debug + Send + Sync {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn is_package_installed(&self, package: &str) -> bool;
    fn install_package(
        &self,
        package: &str,
        cancel: &CancelToken,
        reporter: Reporter<'_>,
    ) -> anyhow::Result<()>;
    fn include_dir(&self) -> PathBuf;
    fn lib_dir(&self) -> PathBuf;
    fn bin_dir(&self) -> PathBuf;
}

/// Install every package not already present, stopping at the first failure.
pub fn install_required(
    pm: &dyn PackageManager,
    packages: &BTreeSet<String>,
    cancel: &CancelToken,
    reporter: Reporter<'_>,
) -> Result<(), BuildError> {
    for pkg in packages {
        if pm.is_package_installed(pkg) {
            reporter.info(&format!("package {} already installed", pkg));
            continue;
        }
        if !pm.is_available() {
            return Err(BuildError::PackageManagerUnavailable(pkg.clone()));
        }
        reporter.info(&format!("installing {} via {}", pkg, pm.name()));
        if let Err(e) = pm.install_package(pkg, cancel, reporter) {
            if let Some(BuildError::Cancelled) = crate::error::classify(&e) {
                return Err(BuildError::Cancelled);
            }
            return Err(BuildError::DependencyInstall {
                package: pkg.clone(),
                cause: format!("{:#}", e),
            });
        }
        reporter.success(&format!("installed {}", pkg));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::PackageManager;
    use crate::process::CancelToken;
    use crate::report::Reporter;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory manager for orchestration tests.
    #[derive(Debug, Default)]
    pub struct FakeManager {
        pub root: PathBuf,
        pub available: bool,
        pub installed: Mutex<BTreeSet<String>>,
        pub broken: BTreeSet<String>,
    }

    impl PackageManager for FakeManager {
        fn name(&self) -> &str {
            "fake"
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn is_package_installed(&self, package: &str) -> bool {
            self.installed.lock().expect("lock").contains(package)
        }
        fn install_package(
            &self,
            package: &str,
            _cancel: &CancelToken,
            _reporter: Reporter<'_>,
        ) -> anyhow::Result<()> {
            if self.broken.contains(package) {
                anyhow::bail!("no such port: {}", package);
            }
            self.installed.lock().expect("lock").insert(package.to_string());
            Ok(())
        }
        fn include_dir(&self) -> PathBuf {
            self.root.join("include")
        }
        fn lib_dir(&self) -> PathBuf {
            self.root.join("lib")
        }
        fn bin_dir(&self) -> PathBuf {
            self.root.join("bin")
        }
    }
}
