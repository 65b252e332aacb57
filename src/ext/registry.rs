// Purpose: Named set of known extensions: built-in presets plus manifest-backed user entries.
// Inputs/Outputs: Settings (+ manifest on disk) -> ordered Extension list; add/remove rewrite the manifest.
// Invariants: Registry order is catalog order, then manifest order; a later entry with the same name replaces
//             an earlier one in place.
// Gotchas: A corrupt manifest is reported and ignored so built-ins stay usable.

use anyhow::bail;

use super::catalog;
use super::fetch::{FetchExtension, FetchSpec, normalize_repo_url, repo_name};
use super::manifest::{self, CustomRecord, ManifestRecord};
use super::{Contributions, CustomExtension, Extension, ExtensionProvider, InstallContext};
use crate::config::Settings;
use crate::report::Reporter;

pub struct ExtensionRegistry {
    settings: Settings,
    catalog: Vec<FetchSpec>,
    records: Vec<ManifestRecord>,
    entries: Vec<Extension>,
}

fn record_name(r: &ManifestRecord) -> String {
    match r {
        ManifestRecord::Custom(c) => c.name.clone(),
        ManifestRecord::Fetch(f) => repo_name(&f.repo_url),
    }
}

impl ExtensionRegistry {
    pub fn load(settings: &Settings, reporter: Reporter<'_>) -> Self {
        Self::with_catalog(settings, catalog::builtin(), reporter)
    }

    pub fn with_catalog(settings: &Settings, catalog: Vec<FetchSpec>, reporter: Reporter<'_>) -> Self {
        let records = match manifest::load(&settings.manifest_path()) {
            Ok(r) => r,
            Err(e) => {
                reporter.warn(&format!("ignoring extension manifest: {:#}", e));
                Vec::new()
            }
        };
        let mut reg = Self {
            settings: settings.clone(),
            catalog,
            records,
            entries: Vec::new(),
        };
        reg.rebuild();
        reg
    }

    fn rebuild(&mut self) {
        let mut entries: Vec<Extension> = self
            .catalog
            .iter()
            .cloned()
            .map(|spec| Extension::Fetch(FetchExtension::new(spec, &self.settings)))
            .collect();
        for rec in &self.records {
            let ext = match rec {
                ManifestRecord::Custom(c) => Extension::Custom(CustomExtension {
                    name: c.name.clone(),
                    include_path: c.include_path.clone(),
                    lib_path: c.lib_path.clone(),
                    flags: c.flags.clone(),
                }),
                ManifestRecord::Fetch(f) => Extension::Fetch(FetchExtension::new(
                    FetchSpec::from_repo(&f.repo_url, &f.version),
                    &self.settings,
                )),
            };
            match entries.iter().position(|e| e.name() == ext.name()) {
                Some(i) => entries[i] = ext,
                None => entries.push(ext),
            }
        }
        self.entries = entries;
    }

    fn persist(&mut self) -> anyhow::Result<()> {
        manifest::save(&self.settings.manifest_path(), &self.records)?;
        self.rebuild();
        Ok(())
    }

    fn upsert(&mut self, rec: ManifestRecord) -> anyhow::Result<()> {
        let name = record_name(&rec);
        match self.records.iter().position(|r| record_name(r) == name) {
            Some(i) => self.records[i] = rec,
            None => self.records.push(rec),
        }
        self.persist()
    }

    pub fn list(&self) -> &[Extension] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&Extension> {
        self.entries.iter().find(|e| e.name() == name)
    }

    /// Closest known name, for "did you mean" hints.
    pub fn suggest(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .map(|e| (e.name(), strsim::jaro_winkler(name, e.name())))
            .filter(|(_, score)| *score >= 0.8)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(n, _)| n)
    }

    fn require(&self, name: &str) -> anyhow::Result<&Extension> {
        match self.get(name) {
            Some(e) => Ok(e),
            None => match self.suggest(name) {
                Some(s) => bail!("unknown extension `{}` (did you mean `{}`?)", name, s),
                None => bail!("unknown extension `{}`", name),
            },
        }
    }

    pub fn add_custom(&mut self, ext: CustomExtension) -> anyhow::Result<()> {
        if ext.name.trim().is_empty() {
            bail!("extension name must not be empty");
        }
        self.upsert(ManifestRecord::Custom(CustomRecord {
            name: ext.name,
            include_path: ext.include_path,
            lib_path: ext.lib_path,
            flags: ext.flags,
        }))
    }

    /// Registers a fetch extension and returns the name it is known by.
    pub fn add_fetch(&mut self, repo_url: &str, version: &str) -> anyhow::Result<String> {
        let url = normalize_repo_url(repo_url);
        if !url.starts_with("https://github.com/") {
            bail!("fetch extensions must be GitHub repositories: {}", repo_url);
        }
        let name = repo_name(&url);
        self.upsert(ManifestRecord::fetch(&url, version))?;
        Ok(name)
    }

    /// Drops a manifest entry (deleting fetched files); built-ins are only uninstalled.
    pub fn remove(&mut self, name: &str, reporter: Reporter<'_>) -> anyhow::Result<()> {
        let ext = self.require(name)?.clone();
        if matches!(ext, Extension::Fetch(_))
            && let Err(e) = ext.uninstall(reporter)
        {
            reporter.warn(&format!("could not delete files of {}: {:#}", name, e));
        }
        let before = self.records.len();
        self.records.retain(|r| record_name(r) != name);
        if self.records.len() != before {
            self.persist()?;
            reporter.info(&format!("removed {} from the extension list", name));
        }
        Ok(())
    }

    pub fn install(
        &self,
        name: &str,
        ctx: &InstallContext<'_>,
        reporter: Reporter<'_>,
    ) -> anyhow::Result<()> {
        self.require(name)?.install(ctx, reporter)
    }

    /// Installs every missing extension; one failure does not stop the rest.
    pub fn install_all(
        &self,
        ctx: &InstallContext<'_>,
        reporter: Reporter<'_>,
    ) -> Vec<(String, anyhow::Error)> {
        let mut failures = Vec::new();
        for ext in self.entries.iter().filter(|e| !e.is_installed()) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = ext.install(ctx, reporter) {
                reporter.error(&format!("{}: {:#}", ext.name(), e));
                failures.push((ext.name().to_string(), e));
            }
        }
        failures
    }

    pub fn installed_contributions(&self) -> Contributions {
        let mut c = Contributions::default();
        for ext in self.entries.iter().filter(|e| e.is_installed()) {
            c.merge(ext.contributions());
        }
        c
    }
}
