// Purpose: Parse compiler-emitted dependency-rule files (`target: dep dep ...`).
// Inputs/Outputs: Raw depfile text -> target string plus ordered dependency paths.
// Invariants: Backslash-newline continuations are collapsed before the rule is split.
// Gotchas: Text without a rule (empty, no separator, no target) parses to None, not an error.
//          A drive-letter colon (`C:\x.o`) is not the rule separator; `\ ` escapes a space in a path.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepRule {
    pub target: String,
    pub deps: Vec<PathBuf>,
}

pub fn parse(text: &str) -> Option<DepRule> {
    let joined = text.replace("\\\r\n", " ").replace("\\\n", " ");
    let sep = find_rule_separator(&joined)?;
    let target = joined[..sep].trim().to_string();
    if target.is_empty() {
        return None;
    }
    // Only the first rule matters; -MP style phony rules follow on later lines.
    let body = joined[sep + 1..].lines().next().unwrap_or_default();
    let deps = split_paths(body).into_iter().map(PathBuf::from).collect();
    Some(DepRule { target, deps })
}

/// `Ok(None)` when the file does not exist or holds no rule; `Err` only when reading fails.
pub fn read(path: &Path) -> anyhow::Result<Option<DepRule>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse(&text))
}

fn find_rule_separator(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b':' {
            continue;
        }
        let drive = i >= 1
            && bytes[i - 1].is_ascii_alphabetic()
            && (i == 1 || bytes[i - 2].is_ascii_whitespace())
            && matches!(bytes.get(i + 1), Some(b'\\') | Some(b'/'));
        if !drive {
            return Some(i);
        }
    }
    None
}

fn split_paths(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&' ') => {
                cur.push(' ');
                chars.next();
            }
            c if c.is_whitespace() => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            c => cur.push(c),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}
