//! Source-position substitution for error messages and tracebacks.
//!
//! Host error text carries `file:line:` positions in emitted coordinates.
//! Each line of the input is rewritten to the original-source position when
//! the named file has a source map entry for that line; everything else
//! passes through untouched, which makes the substitution idempotent.

use crate::source_map::SourceMapStore;
use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

static POSITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([^\S\n]*)(.+):(\d+):").unwrap());

/// Rewrite every `<indent>file:line:` position that has a source map
#[must_use]
pub fn remap_positions(text: &str, script_roots: &[String]) -> String {
    let replaced = POSITION_RE.replace_all(text, |caps: &regex::Captures<'_>| {
        let indent = &caps[1];
        let file = &caps[2];
        let line: u32 = caps[3].parse().unwrap_or(0);

        let mapped = SourceMapStore::get(file, script_roots).and_then(|map| {
            map.mapping_for_line(line)
                .and_then(|m| map.source_path(m).map(|s| (s.to_string(), m.source_line)))
        });

        match mapped {
            Some((source, source_line)) => format!("{indent}{source}:{source_line}:"),
            None => caps[0].to_string(),
        }
    });
    match replaced {
        Cow::Borrowed(_) => text.to_string(),
        Cow::Owned(s) => s,
    }
}
