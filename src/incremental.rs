// Purpose: Decide per translation unit whether its object file is stale, and name build artifacts.
// Inputs/Outputs: Source/object/depfile paths -> Staleness verdict; SourceUnit -> out/<stem>.{o,d}.
// Invariants: Never writes to disk; depfiles are consulted, never mutated.
// Gotchas: Comparisons use strict `>` on mtimes; a change inside one coarse timestamp tick is missed.
//          Artifact names use the base stem only, so same-named sources in different dirs collide.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::depfile;
use crate::scan::SourceUnit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub object: PathBuf,
    pub depfile: PathBuf,
}

pub fn artifact_paths(out_dir: &Path, unit: &SourceUnit) -> ArtifactPaths {
    let stem = unit.stem();
    ArtifactPaths {
        object: out_dir.join(format!("{}.o", stem)),
        depfile: out_dir.join(format!("{}.d", stem)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    CleanRequested,
    MissingObject,
    SourceNewer,
    DependencyNewer(PathBuf),
    DepfileUnreadable(String),
    UpToDate,
}

impl Staleness {
    pub fn needs_rebuild(&self) -> bool {
        !matches!(self, Staleness::UpToDate)
    }
}

fn mtime(p: &Path) -> Option<SystemTime> {
    fs::metadata(p).and_then(|m| m.modified()).ok()
}

pub fn check(source: &Path, object: &Path, depfile_path: &Path, clean: bool) -> Staleness {
    if clean {
        return Staleness::CleanRequested;
    }
    let Some(obj_time) = mtime(object) else {
        return Staleness::MissingObject;
    };
    match mtime(source) {
        Some(src_time) if src_time < obj_time => {}
        _ => return Staleness::SourceNewer,
    }
    let rule = match depfile::read(depfile_path) {
        Ok(Some(rule)) => rule,
        Ok(None) => return Staleness::UpToDate,
        Err(e) => return Staleness::DepfileUnreadable(format!("{:#}", e)),
    };
    for dep in rule.deps {
        // Deleted headers are ignored; the include that named them will fail at compile time anyway.
        if let Some(dep_time) = mtime(&dep)
            && dep_time > obj_time
        {
            return Staleness::DependencyNewer(dep);
        }
    }
    Staleness::UpToDate
}

pub fn needs_rebuild(source: &Path, object: &Path, depfile_path: &Path, clean: bool) -> bool {
    let verdict = check(source, object, depfile_path, clean);
    tracing::trace!(
        target: "cmpile::incremental",
        source = %source.display(),
        verdict = ?verdict,
        "staleness"
    );
    verdict.needs_rebuild()
}

/// Stems shared by more than one unit, with every path that maps onto them.
pub fn base_name_collisions(units: &[SourceUnit]) -> Vec<(String, Vec<PathBuf>)> {
    let mut by_stem: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for u in units {
        by_stem.entry(u.stem()).or_default().push(u.path.clone());
    }
    by_stem.into_iter().filter(|(_, v)| v.len() > 1).collect()
}

#[cfg(test)]
mod tests {
    use super::{Staleness, artifact_paths, base_name_collisions, check, needs_rebuild};
    use crate::scan::SourceUnit;
    use filetime::{FileTime, set_file_mtime};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-inc-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn write_at(p: &Path, body: &str, secs: i64) {
        fs::write(p, body).expect("write");
        set_file_mtime(p, FileTime::from_unix_time(secs, 0)).expect("set mtime");
    }

    struct Fixture {
        root: PathBuf,
        src: PathBuf,
        obj: PathBuf,
        dep: PathBuf,
    }

    fn fixture(prefix: &str) -> Fixture {
        let root = temp_dir(prefix);
        fs::create_dir_all(root.join("out")).expect("mkdir");
        Fixture {
            src: root.join("main.c"),
            obj: root.join("out").join("main.o"),
            dep: root.join("out").join("main.d"),
            root,
        }
    }

    #[test]
    fn missing_object_always_rebuilds() {
        let f = fixture("missing");
        write_at(&f.src, "int main(){}", 1_000);
        assert!(needs_rebuild(&f.src, &f.obj, &f.dep, false));
        assert_eq!(check(&f.src, &f.obj, &f.dep, false), Staleness::MissingObject);
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn clean_request_forces_rebuild() {
        let f = fixture("clean");
        write_at(&f.src, "", 1_000);
        write_at(&f.obj, "", 2_000);
        assert!(!needs_rebuild(&f.src, &f.obj, &f.dep, false));
        assert!(needs_rebuild(&f.src, &f.obj, &f.dep, true));
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn source_at_or_after_object_rebuilds() {
        let f = fixture("src-newer");
        write_at(&f.obj, "", 2_000);
        write_at(&f.src, "", 2_000);
        assert_eq!(check(&f.src, &f.obj, &f.dep, false), Staleness::SourceNewer);
        write_at(&f.src, "", 3_000);
        assert!(needs_rebuild(&f.src, &f.obj, &f.dep, false));
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn up_to_date_when_all_deps_are_not_newer() {
        let f = fixture("fresh");
        let h1 = f.root.join("a.h");
        let h2 = f.root.join("b.h");
        write_at(&f.src, "", 1_000);
        write_at(&h1, "", 1_500);
        write_at(&h2, "", 2_000);
        let body = format!(
            "{}: {} \\\n {} \\\n {} {}\n",
            f.obj.display(),
            f.src.display(),
            h1.display(),
            h2.display(),
            f.root.join("deleted.h").display()
        );
        fs::write(&f.dep, body).expect("write dep");
        write_at(&f.obj, "", 2_000);
        assert_eq!(check(&f.src, &f.obj, &f.dep, false), Staleness::UpToDate);
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn one_newer_dependency_is_enough() {
        let f = fixture("dep-newer");
        let mut deps = Vec::new();
        for i in 0..4 {
            let h = f.root.join(format!("h{}.h", i));
            write_at(&h, "", 1_000);
            deps.push(h);
        }
        write_at(&deps[2], "", 5_000);
        write_at(&f.src, "", 1_000);
        let list = deps.iter().map(|d| d.display().to_string()).collect::<Vec<_>>().join(" ");
        fs::write(&f.dep, format!("{}: {}\n", f.obj.display(), list)).expect("write dep");
        write_at(&f.obj, "", 2_000);
        assert_eq!(
            check(&f.src, &f.obj, &f.dep, false),
            Staleness::DependencyNewer(deps[2].clone())
        );
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn missing_or_ruleless_depfile_keeps_unit_fresh() {
        let f = fixture("depfile");
        write_at(&f.src, "", 1_000);
        write_at(&f.obj, "", 2_000);
        assert!(!needs_rebuild(&f.src, &f.obj, &f.dep, false));
        fs::write(&f.dep, "").expect("write dep");
        assert_eq!(check(&f.src, &f.obj, &f.dep, false), Staleness::UpToDate);
        fs::write(&f.dep, "garbage without colon").expect("write dep");
        assert_eq!(check(&f.src, &f.obj, &f.dep, false), Staleness::UpToDate);
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn unreadable_depfile_forces_rebuild() {
        let f = fixture("depdir");
        write_at(&f.src, "", 1_000);
        write_at(&f.obj, "", 2_000);
        fs::create_dir_all(&f.dep).expect("dep dir");
        assert!(matches!(
            check(&f.src, &f.obj, &f.dep, false),
            Staleness::DepfileUnreadable(_)
        ));
        let _ = fs::remove_dir_all(&f.root);
    }

    #[test]
    fn artifacts_use_base_stem_and_collisions_are_reported() {
        let units = vec![
            SourceUnit::new("/p/a/util.cpp"),
            SourceUnit::new("/p/b/util.c"),
            SourceUnit::new("/p/main.cpp"),
        ];
        let paths = artifact_paths(Path::new("/p/out"), &units[0]);
        assert_eq!(paths.object, Path::new("/p/out/util.o"));
        assert_eq!(paths.depfile, Path::new("/p/out/util.d"));
        let clashes = base_name_collisions(&units);
        assert_eq!(clashes.len(), 1);
        assert_eq!(clashes[0].0, "util");
        assert_eq!(clashes[0].1.len(), 2);
    }
}
