//! Path canonicalisation with a process-wide cache.
//!
//! Canonical paths are plain strings: debug sessions routinely mix
//! separators and drive prefixes produced on another platform, which
//! `std::path` would refuse to interpret. Equality of canonical paths is
//! byte equality. Cache entries are never evicted; the filesystem layout is
//! assumed stable for the duration of a session.

use dashmap::DashMap;
use std::sync::LazyLock;

/// Separator used when joining canonicalised components
pub const SEPARATOR: char = std::path::MAIN_SEPARATOR;

static CACHE: LazyLock<DashMap<String, String>> = LazyLock::new(DashMap::new);

/// Strip the interpreter chunk-name prefix (`@` or `=`)
fn strip_chunk_prefix(raw: &str) -> &str {
    raw.strip_prefix(['@', '=']).unwrap_or(raw)
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Split a drive (`C:` + separator) or a leading-separator root
///
/// Returns `(root, remainder)` where `root` is `"C:"`, `"/"`-style or empty.
fn split_root(path: &str) -> (Option<String>, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && is_separator(bytes[2] as char)
    {
        return (Some(path[..2].to_string()), &path[3..]);
    }
    if let Some(first) = path.chars().next() {
        if is_separator(first) {
            let rest = path.trim_start_matches(is_separator);
            return (Some(String::new()), rest);
        }
    }
    (None, path)
}

/// Canonicalise a path: chunk-prefix strip, root split, `.`/`..` collapse,
/// separator unification. Idempotent; cached by input string.
#[must_use]
pub fn format(raw: &str) -> String {
    if let Some(cached) = CACHE.get(raw) {
        return cached.clone();
    }

    let stripped = strip_chunk_prefix(raw);
    let (root, remainder) = split_root(stripped);

    let mut components: Vec<&str> = Vec::new();
    for part in remainder.split(is_separator) {
        match part {
            "" | "." => {}
            ".." => {
                // Pop one prior component, but never pop past a ".."
                if matches!(components.last(), Some(&"..") | None) {
                    components.push("..");
                } else {
                    components.pop();
                }
            }
            other => components.push(other),
        }
    }

    let joined = components.join(&SEPARATOR.to_string());
    let formatted = match root {
        Some(drive) if drive.is_empty() => format!("{SEPARATOR}{joined}"),
        Some(drive) => format!("{drive}{SEPARATOR}{joined}"),
        None if joined.is_empty() => ".".to_string(),
        None => joined,
    };

    CACHE.insert(raw.to_string(), formatted.clone());
    formatted
}

/// Whether a raw path is absolute (rooted or drive-qualified)
#[must_use]
pub fn is_absolute(raw: &str) -> bool {
    let stripped = strip_chunk_prefix(raw);
    split_root(stripped).0.is_some()
}

/// Canonicalise, resolving relative paths against the working directory
#[must_use]
pub fn get_absolute(raw: &str) -> String {
    if is_absolute(raw) {
        return format(raw);
    }
    let cwd = std::env::current_dir()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();
    if cwd.is_empty() {
        format(raw)
    } else {
        format(&[cwd.as_str(), strip_chunk_prefix(raw)].join(&SEPARATOR.to_string()))
    }
}

/// Directory portion of a canonical path
#[must_use]
pub fn dirname(path: &str) -> String {
    let formatted = format(path);
    match formatted.rfind(is_separator) {
        // Keep the root separator itself
        Some(0) => SEPARATOR.to_string(),
        Some(idx) => {
            let head = &formatted[..idx];
            // "C:" alone needs its separator back
            if head.len() == 2 && head.as_bytes()[1] == b':' {
                format!("{head}{SEPARATOR}")
            } else {
                head.to_string()
            }
        }
        None => ".".to_string(),
    }
}

/// Loose path equality used by breakpoint matching
///
/// Two canonical paths match when they are byte-equal or when one is a
/// suffix of the other beginning at a separator, so a relative chunk name
/// still matches the absolute breakpoint path.
#[must_use]
pub fn compare(a: &str, b: &str) -> bool {
    let a = format(a);
    let b = format(b);
    if a == b {
        return true;
    }
    let suffix_at_separator = |longer: &str, shorter: &str| {
        longer.len() > shorter.len()
            && longer.ends_with(shorter)
            && longer[..longer.len() - shorter.len()]
                .chars()
                .next_back()
                .is_some_and(is_separator)
    };
    suffix_at_separator(&a, &b) || suffix_at_separator(&b, &a)
}
