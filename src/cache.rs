// Purpose: Locate on-disk roots for extensions and caches and guard them against concurrent installs.
// Inputs/Outputs: Resolves directories from Settings/OS conventions; provides hashing and lock helpers.
// Invariants: Callers hold CacheLock for the whole of any install that writes under the extensions root.
// Gotchas: Read-only files (git packs, extracted archives on Windows) must be made writable before removal.

use anyhow::Context;
use directories::ProjectDirs;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub fn default_home() -> anyhow::Result<PathBuf> {
    let pd = ProjectDirs::from("dev", "cmpile", "cmpile")
        .context("cannot determine OS data directory")?;
    Ok(pd.data_dir().to_path_buf())
}

pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
    let pd = ProjectDirs::from("dev", "cmpile", "cmpile")
        .context("cannot determine OS cache directory")?;
    Ok(pd.cache_dir().to_path_buf())
}

pub fn ensure_dir(p: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(p).with_context(|| format!("create {}", p.display()))?;
    Ok(())
}

pub fn url_hash(url: &str) -> String {
    let mut h = Sha256::new();
    h.update(url.as_bytes());
    hex::encode(h.finalize())
}

/// Map an arbitrary label onto a single safe path segment.
pub fn escape_segment(r: &str) -> String {
    r.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '!'
            }
        })
        .collect()
}

/// `remove_dir_all` that clears read-only bits and retries once.
pub fn remove_dir_forced(dir: &Path) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    if fs::remove_dir_all(dir).is_ok() {
        return Ok(());
    }
    clear_readonly(dir);
    fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))
}

fn clear_readonly(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for ent in entries.flatten() {
        let p = ent.path();
        if p.is_dir() {
            clear_readonly(&p);
        }
        if let Ok(meta) = fs::metadata(&p) {
            let mut perms = meta.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = fs::set_permissions(&p, perms);
            }
        }
    }
}

pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    // Blocks until no other process is installing into `root`.
    pub fn acquire(root: &Path) -> anyhow::Result<Self> {
        ensure_dir(root)?;
        let lock_path = root.join("cache.lock");
        let f = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open {}", lock_path.display()))?;
        f.lock_exclusive()
            .with_context(|| format!("lock {}", lock_path.display()))?;
        Ok(Self { _file: f })
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheLock, escape_segment, remove_dir_forced, url_hash};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    #[test]
    fn escape_segment_keeps_safe_chars_only() {
        assert_eq!(escape_segment("v1.2.3"), "v1.2.3");
        assert_eq!(escape_segment("feature/x y"), "feature!x!y");
    }

    #[test]
    fn url_hash_is_stable_hex() {
        let a = url_hash("https://github.com/fmtlib/fmt");
        assert_eq!(a, url_hash("https://github.com/fmtlib/fmt"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, url_hash("https://github.com/gabime/spdlog"));
    }

    #[test]
    fn remove_dir_forced_handles_readonly_files() {
        let root = temp_dir("rm-readonly");
        fs::create_dir_all(root.join("sub")).expect("mkdir");
        let f = root.join("sub").join("pack.idx");
        fs::write(&f, "x").expect("write");
        let mut perms = fs::metadata(&f).expect("meta").permissions();
        perms.set_readonly(true);
        fs::set_permissions(&f, perms).expect("chmod");

        remove_dir_forced(&root).expect("remove");
        assert!(!root.exists());
    }

    #[test]
    fn cache_lock_can_be_reacquired_after_drop() {
        let root = temp_dir("lock");
        {
            let _guard = CacheLock::acquire(&root).expect("lock #1");
        }
        let _guard = CacheLock::acquire(&root).expect("lock #2");
        assert!(root.join("cache.lock").exists());
        drop(_guard);
        let _ = fs::remove_dir_all(root);
    }
}
