// Purpose: Persist user-added extensions across runs.
// Inputs/Outputs: JSON array at <home>/extensions/custom_extensions.json <-> Vec<ManifestRecord>.
// Invariants: The file is rewritten wholesale on every change, via a temp file and rename.
// Gotchas: Records are untagged; a fetch record is recognised by its `"type": "fetch"` field.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::ensure_dir;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchTag {
    #[serde(rename = "fetch")]
    Fetch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchRecord {
    #[serde(rename = "type")]
    pub kind: FetchTag,
    pub repo_url: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomRecord {
    pub name: String,
    pub include_path: PathBuf,
    pub lib_path: PathBuf,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ManifestRecord {
    Fetch(FetchRecord),
    Custom(CustomRecord),
}

impl ManifestRecord {
    pub fn fetch(repo_url: &str, version: &str) -> Self {
        ManifestRecord::Fetch(FetchRecord {
            kind: FetchTag::Fetch,
            repo_url: repo_url.to_string(),
            version: version.to_string(),
        })
    }
}

/// Missing file means an empty manifest.
pub fn load(path: &Path) -> anyhow::Result<Vec<ManifestRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}

pub fn save(path: &Path, records: &[ManifestRecord]) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }
    let text = serde_json::to_string_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
