//! Source-map parsing and the process-wide map store.
//!
//! Maps are looked up per emitted file: an inline base64 `sourceMappingURL`
//! comment in the file's last 4 KiB wins, then a `<file>.map` sidecar, then
//! the configured script roots. Parse failures and missing maps are
//! negative-cached for the session.

use crate::path;
use crate::vlq;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace, warn};

const INLINE_URL_PREFIX: &str = "//# sourceMappingURL=data:application/json;base64,";
const TAIL_SCAN_BYTES: usize = 4096;

/// Best original-source position for one emitted line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub source_index: usize,
    pub source_line: u32,
    pub source_column: u32,
}

/// A parsed source map for one emitted file
#[derive(Debug, Default)]
pub struct SourceMap {
    /// Absolute paths of the original sources
    pub sources: Vec<String>,
    /// Emitted line → retained mapping
    mappings: HashMap<u32, Mapping>,
    /// Emitted identifier → original identifier
    source_names: HashMap<String, String>,
    /// Original identifier → emitted identifier
    lua_names: HashMap<String, String>,
}

impl SourceMap {
    /// Retained mapping for an emitted line, if any
    #[must_use]
    pub fn mapping_for_line(&self, line: u32) -> Option<&Mapping> {
        self.mappings.get(&line)
    }

    /// Absolute path of the source a mapping points into
    #[must_use]
    pub fn source_path(&self, mapping: &Mapping) -> Option<&str> {
        self.sources.get(mapping.source_index).map(String::as_str)
    }

    /// Original identifier for an emitted one
    #[must_use]
    pub fn original_name(&self, emitted: &str) -> Option<&str> {
        self.source_names.get(emitted).map(String::as_str)
    }

    /// Emitted identifier for an original one
    #[must_use]
    pub fn emitted_name(&self, original: &str) -> Option<&str> {
        self.lua_names.get(original).map(String::as_str)
    }

    /// Whether the map carried a usable `names` array
    #[must_use]
    pub fn has_mapped_names(&self) -> bool {
        !self.source_names.is_empty()
    }

    /// Smallest emitted line whose mapping targets `(original_file, original_line)`
    #[must_use]
    pub fn find_emitted_line(&self, original_file: &str, original_line: u32) -> Option<u32> {
        let mut best: Option<u32> = None;
        for (&line, mapping) in &self.mappings {
            if mapping.source_line == original_line
                && self
                    .source_path(mapping)
                    .is_some_and(|src| path::compare(src, original_file))
            {
                best = Some(best.map_or(line, |b| b.min(line)));
            }
        }
        best
    }

    /// Whether any source of this map matches `file`
    #[must_use]
    pub fn has_source(&self, file: &str) -> bool {
        self.sources.iter().any(|s| path::compare(s, file))
    }

    /// Decode a source-map document
    ///
    /// `map_dir` anchors relative `sources` entries; `emitted_lines` is the
    /// emitted file's text, consulted only for identifier-name recording
    /// (pass an empty slice when the emitted file is unavailable).
    #[must_use]
    pub fn parse(text: &str, map_dir: &str, emitted_lines: &[&str]) -> Option<Self> {
        parse(text, map_dir, emitted_lines)
    }
}

#[derive(Deserialize)]
struct RawMap {
    sources: Vec<String>,
    mappings: String,
    #[serde(rename = "sourceRoot")]
    source_root: Option<String>,
    names: Option<Vec<String>>,
}

static SOURCES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""sources"\s*:\s*\[([^\]]*)\]"#).unwrap());
static NAMES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""names"\s*:\s*\[([^\]]*)\]"#).unwrap());
static MAPPINGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""mappings"\s*:\s*"([^"]*)""#).unwrap());
static SOURCE_ROOT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""sourceRoot"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap());
static STRING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).unwrap());
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

fn unescape(raw: &str) -> String {
    // The recognised fields only need the JSON escapes that occur in paths
    raw.replace("\\\\", "\u{0}")
        .replace("\\\"", "\"")
        .replace("\\/", "/")
        .replace('\u{0}', "\\")
}

fn string_array(body: &str) -> Vec<String> {
    STRING_RE
        .captures_iter(body)
        .map(|c| unescape(&c[1]))
        .collect()
}

/// Extract the four recognised fields, tolerating structurally invalid JSON
fn extract_fields(text: &str) -> Option<RawMap> {
    if let Ok(raw) = serde_json::from_str::<RawMap>(text) {
        return Some(raw);
    }
    trace!("source map is not strict JSON, falling back to field extraction");
    let sources = SOURCES_RE.captures(text).map(|c| string_array(&c[1]))?;
    let mappings = MAPPINGS_RE.captures(text).map(|c| c[1].to_string())?;
    let source_root = SOURCE_ROOT_RE.captures(text).map(|c| unescape(&c[1]));
    let names = NAMES_RE.captures(text).map(|c| string_array(&c[1]));
    Some(RawMap {
        sources,
        mappings,
        source_root,
        names,
    })
}

fn resolve_source(source: &str, source_root: &str, map_dir: &str) -> String {
    if path::is_absolute(source) {
        return path::format(source);
    }
    let sep = path::SEPARATOR.to_string();
    if path::is_absolute(source_root) {
        return path::format(&[source_root, source].join(&sep));
    }
    path::format(&[map_dir, source_root, source].join(&sep))
}

/// Decode a source-map document against the emitted file's line text
///
/// `emitted_lines` is only consulted for identifier-name recording; pass an
/// empty slice when the emitted file could not be read.
fn parse(text: &str, map_dir: &str, emitted_lines: &[&str]) -> Option<SourceMap> {
    let raw = extract_fields(text)?;
    let source_root = raw.source_root.unwrap_or_else(|| ".".to_string());

    let mut map = SourceMap {
        sources: raw
            .sources
            .iter()
            .map(|s| resolve_source(s, &source_root, map_dir))
            .collect(),
        ..SourceMap::default()
    };

    let names = raw.names.unwrap_or_default();

    // Decoder state persists across segments; emitted column resets per line
    let mut emitted_line: u32 = 1;
    let mut emitted_column: i64 = 1;
    let mut source_index: i64 = 0;
    let mut source_line: i64 = 1;
    let mut source_column: i64 = 1;
    let mut name_index: i64 = 0;

    for group in raw.mappings.split(';') {
        for segment in group.split(',') {
            if segment.is_empty() {
                continue;
            }
            let Some(values) = vlq::decode_segment(segment) else {
                warn!(segment, "undecodable mapping segment, skipping");
                continue;
            };
            if values.is_empty() {
                continue;
            }
            emitted_column += values[0];
            if values.len() < 4 {
                continue;
            }
            source_index += values[1];
            source_line += values[2];
            source_column += values[3];

            if source_index >= 0
                && (source_index as usize) < map.sources.len()
                && source_line >= 1
                && source_column >= 1
            {
                let candidate = Mapping {
                    source_index: source_index as usize,
                    source_line: source_line as u32,
                    source_column: source_column as u32,
                };
                // Retain the segment minimising (source_line, source_column)
                map.mappings
                    .entry(emitted_line)
                    .and_modify(|kept| {
                        if (candidate.source_line, candidate.source_column)
                            < (kept.source_line, kept.source_column)
                        {
                            *kept = candidate;
                        }
                    })
                    .or_insert(candidate);
            }

            if values.len() >= 5 {
                name_index += values[4];
                if name_index >= 0 {
                    if let Some(original) = names.get(name_index as usize) {
                        record_name(&mut map, emitted_lines, emitted_line, emitted_column, original);
                    }
                }
            }
        }
        emitted_line += 1;
        emitted_column = 1;
    }

    Some(map)
}

/// Scan the emitted line from the current column for the identifier the
/// named segment refers to, and record the bidirectional name mapping
fn record_name(
    map: &mut SourceMap,
    emitted_lines: &[&str],
    emitted_line: u32,
    emitted_column: i64,
    original: &str,
) {
    let Some(line_text) = emitted_lines.get(emitted_line as usize - 1) else {
        return;
    };
    let start = (emitted_column.max(1) as usize - 1).min(line_text.len());
    if !line_text.is_char_boundary(start) {
        return;
    }
    if let Some(found) = IDENT_RE.find_at(line_text, start) {
        let emitted_ident = found.as_str().to_string();
        if emitted_ident != original {
            map.source_names
                .entry(emitted_ident.clone())
                .or_insert_with(|| original.to_string());
            map.lua_names
                .entry(original.to_string())
                .or_insert(emitted_ident);
        }
    }
}

static MAP_CACHE: LazyLock<DashMap<String, Option<Arc<SourceMap>>>> = LazyLock::new(DashMap::new);

/// Process-wide source-map store
///
/// All lookups go through [`SourceMapStore::get`]; results (including
/// failures) are cached by canonical emitted path for the session.
pub struct SourceMapStore;

impl SourceMapStore {
    /// Fetch the source map for an emitted file, if one can be resolved
    #[must_use]
    pub fn get(file: &str, script_roots: &[String]) -> Option<Arc<SourceMap>> {
        let canonical = path::format(file);
        if let Some(cached) = MAP_CACHE.get(&canonical) {
            return cached.clone();
        }
        let resolved = Self::resolve(&canonical, script_roots);
        if resolved.is_none() {
            debug!(file = %canonical, "no source map resolved, negative caching");
        }
        MAP_CACHE.insert(canonical, resolved.clone());
        resolved
    }

    /// Drop every cached entry (test support)
    pub fn clear_cache() {
        MAP_CACHE.clear();
    }

    /// Find a cached map whose sources include `original_file`
    ///
    /// Used when a breakpoint names an original-source path: only maps the
    /// session has already loaded can claim it. Returns the emitted file the
    /// map belongs to alongside the map.
    #[must_use]
    pub fn find_map_for_source(original_file: &str) -> Option<(String, Arc<SourceMap>)> {
        MAP_CACHE.iter().find_map(|entry| {
            entry.value().as_ref().and_then(|map| {
                map.has_source(original_file)
                    .then(|| (entry.key().clone(), Arc::clone(map)))
            })
        })
    }

    fn resolve(canonical: &str, script_roots: &[String]) -> Option<Arc<SourceMap>> {
        let file_text = std::fs::read_to_string(canonical).ok();
        let emitted_lines: Vec<&str> = file_text
            .as_deref()
            .map(|t| t.lines().collect())
            .unwrap_or_default();
        let map_dir = path::dirname(canonical);

        // 1. Inline base64 comment in the file tail
        if let Some(text) = file_text.as_deref() {
            if let Some(map) = Self::inline_map(text, &map_dir, &emitted_lines) {
                return Some(Arc::new(map));
            }
        }

        // 2. Sidecar next to the emitted file
        let sep = path::SEPARATOR.to_string();
        let sidecar = format!("{canonical}.map");
        if let Ok(text) = std::fs::read_to_string(&sidecar) {
            debug!(sidecar = %sidecar, "loading sidecar source map");
            return parse(&text, &map_dir, &emitted_lines).map(Arc::new);
        }

        // 3. Same name under each configured script root
        let base_name = canonical
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or(canonical);
        for root in script_roots {
            let candidate = format!("{}{sep}{base_name}.map", path::format(root));
            if let Ok(text) = std::fs::read_to_string(&candidate) {
                debug!(candidate = %candidate, "loading source map from script root");
                return parse(&text, &path::format(root), &emitted_lines).map(Arc::new);
            }
        }

        None
    }

    fn inline_map(file_text: &str, map_dir: &str, emitted_lines: &[&str]) -> Option<SourceMap> {
        let tail_start = file_text.len().saturating_sub(TAIL_SCAN_BYTES);
        let tail_start = (tail_start..=file_text.len())
            .find(|&i| file_text.is_char_boundary(i))
            .unwrap_or(file_text.len());
        for line in file_text[tail_start..].lines() {
            if let Some(payload) = line.trim_start().strip_prefix(INLINE_URL_PREFIX) {
                let decoded = BASE64_STANDARD.decode(payload.trim_end()).ok()?;
                let text = String::from_utf8(decoded).ok()?;
                debug!("loading inline source map");
                return parse(&text, map_dir, emitted_lines);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vlq::encode_segment;
    use std::io::Write;

    /// Mappings string placing `emitted_line → (source 0, src_line, src_col)`
    fn single_mapping(emitted_line: u32, src_line: u32, src_col: u32) -> String {
        let mut out = ";".repeat(emitted_line as usize - 1);
        out.push_str(&encode_segment(&[
            0,
            0,
            i64::from(src_line) - 1,
            i64::from(src_col) - 1,
        ]));
        out
    }

    #[test]
    fn test_parse_minimal_map() {
        let mappings = single_mapping(17, 5, 3);
        let text = format!(
            r#"{{"version":3,"sources":["main.ts"],"mappings":"{mappings}"}}"#
        );
        let map = parse(&text, "/proj/out", &[]).unwrap();
        let mapping = map.mapping_for_line(17).unwrap();
        assert_eq!(mapping.source_line, 5);
        assert_eq!(mapping.source_column, 3);
        assert_eq!(map.source_path(mapping).unwrap(), path::format("/proj/out/main.ts"));
        assert!(map.mapping_for_line(16).is_none());
    }

    #[test]
    fn test_source_root_resolution() {
        let mappings = single_mapping(1, 1, 1);
        let text = format!(
            r#"{{"sources":["a.ts"],"sourceRoot":"../src","mappings":"{mappings}"}}"#
        );
        let map = parse(&text, "/proj/out", &[]).unwrap();
        assert_eq!(map.sources[0], path::format("/proj/src/a.ts"));
    }

    #[test]
    fn test_retention_rule_minimises_source_position() {
        // Two segments on the same emitted line: (line 9, col 1) then (line 4, col 7)
        let mut mappings = encode_segment(&[0, 0, 8, 0]);
        mappings.push(',');
        mappings.push_str(&encode_segment(&[4, 0, -5, 6]));
        let text = format!(r#"{{"sources":["m.ts"],"mappings":"{mappings}"}}"#);
        let map = parse(&text, "/o", &[]).unwrap();
        let kept = map.mapping_for_line(1).unwrap();
        assert_eq!((kept.source_line, kept.source_column), (4, 7));
    }

    #[test]
    fn test_regex_fallback_for_damaged_json() {
        let mappings = single_mapping(2, 3, 1);
        // Trailing comma and a bare word make this invalid JSON
        let text = format!(
            r#"{{"sources":["x.ts",],"mappings":"{mappings}", junk}}"#
        );
        let map = parse(&text, "/o", &[]).unwrap();
        assert_eq!(map.mapping_for_line(2).unwrap().source_line, 3);
    }

    #[test]
    fn test_name_mapping_scans_emitted_line() {
        // Named segment on line 1 column 7 over "local foo_0 = 1"
        let mut mappings = encode_segment(&[6, 0, 0, 0, 0]);
        mappings.push(';');
        let text = format!(
            r#"{{"sources":["m.ts"],"names":["foo"],"mappings":"{mappings}"}}"#
        );
        let emitted = ["local foo_0 = 1"];
        let map = parse(&text, "/o", &emitted).unwrap();
        assert!(map.has_mapped_names());
        assert_eq!(map.original_name("foo_0"), Some("foo"));
        assert_eq!(map.emitted_name("foo"), Some("foo_0"));
    }

    #[test]
    fn test_no_names_array_means_no_mapped_names() {
        let mappings = single_mapping(1, 1, 1);
        let text = format!(r#"{{"sources":["m.ts"],"mappings":"{mappings}"}}"#);
        let map = parse(&text, "/o", &["local x = 1"]).unwrap();
        assert!(!map.has_mapped_names());
    }

    #[test]
    fn test_find_emitted_line() {
        let mappings = single_mapping(17, 5, 3);
        let text = format!(r#"{{"sources":["main.ts"],"mappings":"{mappings}"}}"#);
        let map = parse(&text, "/proj/out", &[]).unwrap();
        assert_eq!(map.find_emitted_line("/proj/out/main.ts", 5), Some(17));
        assert_eq!(map.find_emitted_line("main.ts", 5), Some(17));
        assert_eq!(map.find_emitted_line("main.ts", 6), None);
        assert_eq!(map.find_emitted_line("other.ts", 5), None);
    }

    #[test]
    fn test_sidecar_resolution_and_negative_cache() {
        let dir = tempfile::tempdir().unwrap();
        let emitted = dir.path().join("out.lua");
        std::fs::write(&emitted, "print('a')\nprint('b')\n").unwrap();

        let emitted_str = emitted.to_string_lossy().into_owned();

        // No map yet: negative result is cached
        assert!(SourceMapStore::get(&emitted_str, &[]).is_none());

        let mappings = single_mapping(2, 9, 1);
        std::fs::write(
            dir.path().join("out.lua.map"),
            format!(r#"{{"sources":["src/orig.tl"],"mappings":"{mappings}"}}"#),
        )
        .unwrap();

        // Still negative because of the cache
        assert!(SourceMapStore::get(&emitted_str, &[]).is_none());

        SourceMapStore::clear_cache();
        let map = SourceMapStore::get(&emitted_str, &[]).unwrap();
        assert_eq!(map.mapping_for_line(2).unwrap().source_line, 9);
        SourceMapStore::clear_cache();
    }

    #[test]
    fn test_inline_map_resolution() {
        use base64::engine::general_purpose::STANDARD;

        let dir = tempfile::tempdir().unwrap();
        let emitted = dir.path().join("inline.lua");
        let mappings = single_mapping(1, 2, 1);
        let map_json = format!(r#"{{"sources":["inline.ts"],"mappings":"{mappings}"}}"#);
        let mut file = std::fs::File::create(&emitted).unwrap();
        writeln!(file, "print('hi')").unwrap();
        writeln!(
            file,
            "--[[ trailing junk ]]\n//# sourceMappingURL=data:application/json;base64,{}",
            STANDARD.encode(map_json)
        )
        .unwrap();
        drop(file);

        let emitted_str = emitted.to_string_lossy().into_owned();
        let map = SourceMapStore::get(&emitted_str, &[]).unwrap();
        assert_eq!(map.mapping_for_line(1).unwrap().source_line, 2);
        SourceMapStore::clear_cache();
    }

    #[test]
    fn test_script_root_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let roots = tempfile::tempdir().unwrap();
        let emitted = dir.path().join("rooted.lua");
        std::fs::write(&emitted, "print('x')\n").unwrap();

        let mappings = single_mapping(1, 3, 1);
        std::fs::write(
            roots.path().join("rooted.lua.map"),
            format!(r#"{{"sources":["rooted.ts"],"mappings":"{mappings}"}}"#),
        )
        .unwrap();

        let emitted_str = emitted.to_string_lossy().into_owned();
        let root_list = vec![roots.path().to_string_lossy().into_owned()];
        let map = SourceMapStore::get(&emitted_str, &root_list).unwrap();
        assert_eq!(map.mapping_for_line(1).unwrap().source_line, 3);
        // Sources resolve against the root directory
        assert!(map.sources[0].ends_with("rooted.ts"));
        SourceMapStore::clear_cache();
    }
}
