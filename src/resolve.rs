// Purpose: Map include signals to the external packages that provide them.
// Inputs/Outputs: Set of header names -> set of package identifiers; plus the two pre-resolution filters.
// Invariants: Output is a set; headers without a path separator and no table entry are dropped.
// Gotchas: The root-token heuristic misfires on project-local headers (`utils/helper.h` -> `utils`);
//          filter against known include dirs before resolving to keep those out.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const QT_PACKAGE: &str = "qtbase";

/// Exact header -> package table, consulted before any heuristic.
pub const HEADER_MAPPING: &[(&str, &str)] = &[
    ("nlohmann/json.hpp", "nlohmann-json"),
    ("fmt/core.h", "fmt"),
    ("fmt/format.h", "fmt"),
    ("spdlog/spdlog.h", "spdlog"),
    ("sqlite3.h", "sqlite3"),
    ("curl/curl.h", "curl"),
    ("gtest/gtest.h", "gtest"),
    ("GL/glew.h", "glew"),
    ("GLFW/glfw3.h", "glfw3"),
    ("glm/glm.hpp", "glm"),
    ("zlib.h", "zlib"),
    ("openssl/ssl.h", "openssl"),
    ("boost/asio.hpp", "boost-asio"),
    ("raylib.h", "raylib"),
    ("imgui.h", "imgui"),
    ("assimp/scene.h", "assimp"),
    ("eigen3/Eigen/Dense", "eigen3"),
    ("yaml-cpp/yaml.h", "yaml-cpp"),
    ("miniaudio/miniaudio.h", "miniaudio"),
    ("absent/absent.h", "absent"),
    ("vulkan/vulkan.h", "vulkan"),
    ("anyrpc/anyrpc.h", "anyrpc"),
    ("adios2/adios2.h", "adios2"),
    ("aom/aom.h", "aom"),
    ("aom/aom_codec.h", "aom"),
    ("openfbx/fbx.h", "openfbx"),
    ("ffmpeg/avformat.h", "ffmpeg"),
    ("ffmpeg/avcodec.h", "ffmpeg"),
    ("ffmpeg/avutil.h", "ffmpeg"),
    ("audiofile/audiofile.h", "audiofile"),
    ("utf8.h", "utf8"),
    ("SDL2/SDL.h", "sdl2"),
    ("QApplication", QT_PACKAGE),
    ("QDebug", QT_PACKAGE),
    ("QString", QT_PACKAGE),
];

pub fn lookup(header: &str) -> Option<&'static str> {
    HEADER_MAPPING
        .iter()
        .find(|(h, _)| *h == header)
        .map(|(_, p)| *p)
}

/// Best-effort package for one signal; `None` for headers that look like the standard library.
pub fn resolve_signal(signal: &str) -> Option<String> {
    if let Some(pkg) = lookup(signal) {
        return Some(pkg.to_string());
    }
    if !signal.contains('/') && !signal.contains('\\') {
        return None;
    }
    let root = signal.split(['/', '\\']).next().unwrap_or_default();
    if root.is_empty() || !root.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    if let Some(rest) = root.strip_prefix("Qt")
        && !rest.is_empty()
    {
        return Some(QT_PACKAGE.to_string());
    }
    Some(root.to_ascii_lowercase())
}

pub fn resolve<'a, I>(signals: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out = BTreeSet::new();
    for s in signals {
        match resolve_signal(s) {
            Some(pkg) => {
                tracing::trace!(target: "cmpile::resolve", signal = %s, package = %pkg, "resolved");
                out.insert(pkg);
            }
            None => tracing::trace!(target: "cmpile::resolve", signal = %s, "no package"),
        }
    }
    out
}

/// Drop signals already reachable through one of `include_dirs`, in the order given.
pub fn filter_satisfied_includes(
    signals: &BTreeSet<String>,
    include_dirs: &[PathBuf],
) -> BTreeSet<String> {
    signals
        .iter()
        .filter(|s| {
            let hit = include_dirs.iter().find(|d| d.join(s.as_str()).is_file());
            if let Some(dir) = hit {
                tracing::trace!(
                    target: "cmpile::resolve",
                    signal = %s,
                    dir = %dir.display(),
                    "satisfied locally"
                );
            }
            hit.is_none()
        })
        .cloned()
        .collect()
}

pub fn is_explicitly_linked(package: &str, flags: &[String]) -> bool {
    let want = format!("-l{}", package);
    flags.iter().any(|f| *f == want)
}

/// Split packages into (to install, already linked by an explicit `-l<name>`).
pub fn skip_explicitly_linked(
    packages: &BTreeSet<String>,
    flags: &[String],
) -> (BTreeSet<String>, Vec<String>) {
    let mut keep = BTreeSet::new();
    let mut skipped = Vec::new();
    for p in packages {
        if is_explicitly_linked(p, flags) {
            skipped.push(p.clone());
        } else {
            keep.insert(p.clone());
        }
    }
    (keep, skipped)
}

/// Directories a quoted include may be satisfied from without any package: each source's own dir.
pub fn source_dirs<'a, I>(sources: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = &'a Path>,
{
    let mut out: Vec<PathBuf> = Vec::new();
    for s in sources {
        if let Some(d) = s.parent()
            && !out.iter().any(|x| x == d)
        {
            out.push(d.to_path_buf());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        filter_satisfied_includes, resolve, resolve_signal, skip_explicitly_linked, source_dirs,
    };
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time drift")
            .as_nanos();
        std::env::temp_dir().join(format!("cmpile-res-{}-{}-{}", prefix, std::process::id(), nonce))
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn std_headers_contribute_nothing() {
        assert_eq!(resolve(&set(&["nlohmann/json.hpp", "vector"])), set(&["nlohmann-json"]));
    }

    #[test]
    fn qt_exact_and_root_token_converge() {
        assert_eq!(resolve(&set(&["QApplication", "QtWidgets/QPushButton"])), set(&["qtbase"]));
    }

    #[test]
    fn root_heuristic_lowercases_alnum_roots() {
        assert_eq!(resolve_signal("Box2D/box2d.h").as_deref(), Some("box2d"));
        assert_eq!(resolve_signal("my-lib/x.h"), None);
        assert_eq!(resolve_signal("Qt/x.h").as_deref(), Some("qt"));
        assert_eq!(resolve_signal("stdio.h"), None);
    }

    #[test]
    fn include_satisfied_by_extension_is_filtered() {
        let root = temp_dir("filter");
        let ext_a = root.join("a").join("include");
        let ext_b = root.join("b").join("include");
        fs::create_dir_all(ext_a.join("box2d")).expect("mkdir a");
        fs::create_dir_all(&ext_b).expect("mkdir b");
        fs::write(ext_a.join("box2d").join("box2d.h"), "").expect("write header");

        let signals = set(&["box2d/box2d.h", "fmt/core.h", "vector"]);
        let left = filter_satisfied_includes(&signals, &[ext_a, ext_b]);
        assert!(!left.contains("box2d/box2d.h"));
        assert!(left.contains("fmt/core.h"));
        assert_eq!(resolve(&left), set(&["fmt"]));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn explicit_link_flag_skips_install() {
        let flags = vec!["-lfmt".to_string(), "-O2".to_string()];
        let (keep, skipped) = skip_explicitly_linked(&set(&["fmt", "zlib"]), &flags);
        assert_eq!(keep, set(&["zlib"]));
        assert_eq!(skipped, vec!["fmt"]);
    }

    #[test]
    fn source_dirs_are_unique() {
        let dirs = source_dirs([Path::new("/p/a.c"), Path::new("/p/b.c"), Path::new("/q/c.c")]);
        assert_eq!(dirs, vec![PathBuf::from("/p"), PathBuf::from("/q")]);
    }
}
