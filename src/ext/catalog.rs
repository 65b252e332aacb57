// Purpose: Built-in fetch presets, available without any manifest entry.
// Inputs/Outputs: Preset name -> FetchSpec with pinned version and link metadata.
// Invariants: Preset keys are unique and lowercase.

use super::fetch::FetchSpec;

struct Preset {
    key: &'static str,
    repo: &'static str,
    version: &'static str,
    tag: Option<&'static str>,
    header_only: bool,
    windows_flags: &'static [&'static str],
    unix_flags: &'static [&'static str],
    link_priority: &'static [&'static str],
}

const PRESETS: &[Preset] = &[
    Preset {
        key: "raylib",
        repo: "https://github.com/raysan5/raylib",
        version: "5.5",
        tag: None,
        header_only: false,
        windows_flags: &["-lgdi32", "-lwinmm", "-lopengl32"],
        unix_flags: &["-lGL", "-lm", "-lpthread", "-ldl", "-lrt", "-lX11"],
        link_priority: &["raylib"],
    },
    Preset {
        key: "opencv",
        repo: "https://github.com/opencv/opencv",
        version: "4.13.0",
        tag: None,
        header_only: false,
        windows_flags: &["-lgdi32", "-lcomdlg32", "-lole32", "-luuid"],
        unix_flags: &[],
        link_priority: &["highgui", "imgcodecs", "videoio", "imgproc", "core"],
    },
    Preset {
        key: "miniaudio",
        repo: "https://github.com/mackron/miniaudio",
        version: "0.11.23",
        tag: None,
        header_only: true,
        windows_flags: &[],
        unix_flags: &["-lpthread", "-lm", "-ldl"],
        link_priority: &[],
    },
    Preset {
        key: "tinyxml",
        repo: "https://github.com/leethomason/tinyxml2",
        version: "11.0.0",
        tag: None,
        header_only: false,
        windows_flags: &[],
        unix_flags: &[],
        link_priority: &[],
    },
    Preset {
        key: "miniz",
        repo: "https://github.com/richgel999/miniz",
        version: "3.1.0",
        tag: None,
        header_only: false,
        windows_flags: &[],
        unix_flags: &[],
        link_priority: &[],
    },
    Preset {
        key: "entt",
        repo: "https://github.com/skypjack/entt",
        version: "3.16.0",
        tag: Some("v3.16.0"),
        header_only: true,
        windows_flags: &[],
        unix_flags: &[],
        link_priority: &[],
    },
];

fn to_spec(p: &Preset) -> FetchSpec {
    let flags = if cfg!(windows) {
        p.windows_flags
    } else {
        p.unix_flags
    };
    FetchSpec {
        name: p.key.to_string(),
        repo_url: p.repo.to_string(),
        version: p.version.to_string(),
        tag: p.tag.map(str::to_string),
        header_only: p.header_only,
        system_flags: flags.iter().map(|s| s.to_string()).collect(),
        link_priority: p.link_priority.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn builtin() -> Vec<FetchSpec> {
    PRESETS.iter().map(to_spec).collect()
}

pub fn lookup(name: &str) -> Option<FetchSpec> {
    PRESETS.iter().find(|p| p.key == name).map(to_spec)
}
