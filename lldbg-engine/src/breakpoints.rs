//! Breakpoint table, indexed by emitted line for per-line hook lookup.
//!
//! A breakpoint set on an original-source path (when a loaded map claims
//! that source) is re-bound to the emitted coordinates where the hook
//! actually fires; the user-facing pair is kept alongside so listings and
//! removals accept either spelling.

use lldbg_core::protocol::BreakpointInfo;
use lldbg_sourcemap::{path, SourceMap, SourceMapStore};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One breakpoint record
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// Emitted file (where the hook fires)
    pub file: String,
    /// Emitted line
    pub line: u32,
    pub enabled: bool,
    pub condition: Option<String>,
    /// User-facing coordinates when bound through a source map
    pub original_file: Option<String>,
    pub original_line: Option<u32>,
    pub map: Option<Arc<SourceMap>>,
}

impl Breakpoint {
    fn matches(&self, file: &str, line: u32) -> bool {
        (self.line == line && path::compare(&self.file, file))
            || (self.original_line == Some(line)
                && self
                    .original_file
                    .as_deref()
                    .is_some_and(|orig| path::compare(orig, file)))
    }

    /// Listing entry in user-facing coordinates
    #[must_use]
    pub fn info(&self) -> BreakpointInfo {
        BreakpointInfo {
            file: self
                .original_file
                .clone()
                .unwrap_or_else(|| self.file.clone()),
            line: self.original_line.unwrap_or(self.line),
            enabled: self.enabled,
            condition: self.condition.clone(),
        }
    }
}

/// The active breakpoint set, bucketed by emitted line
#[derive(Debug, Default)]
pub struct BreakpointTable {
    by_line: HashMap<u32, Vec<Breakpoint>>,
}

impl BreakpointTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint at `(file, line)`, binding through a source map when
    /// one claims `file` as an original source
    pub fn add(&mut self, file: &str, line: u32, condition: Option<String>, roots: &[String]) {
        let canonical = path::format(file);

        // Requested coordinates may denote an original source of a map the
        // session has loaded; bind at the emitted line the hook will report.
        let bound = SourceMapStore::get(&canonical, roots).map_or_else(
            || {
                SourceMapStore::find_map_for_source(&canonical).map(|(emitted_file, map)| {
                    // No entry for the line means passthrough to the same line
                    let emitted_line = map.find_emitted_line(&canonical, line).unwrap_or(line);
                    Breakpoint {
                        file: emitted_file,
                        line: emitted_line,
                        enabled: true,
                        condition: None,
                        original_file: Some(canonical.clone()),
                        original_line: Some(line),
                        map: Some(map),
                    }
                })
            },
            |map| {
                // `file` is itself an emitted file
                Some(Breakpoint {
                    file: canonical.clone(),
                    line,
                    enabled: true,
                    condition: None,
                    original_file: None,
                    original_line: None,
                    map: Some(map),
                })
            },
        );

        let mut breakpoint = bound.unwrap_or(Breakpoint {
            file: canonical,
            line,
            enabled: true,
            condition: None,
            original_file: None,
            original_line: None,
            map: None,
        });
        breakpoint.condition = condition;

        debug!(
            file = %breakpoint.file,
            line = breakpoint.line,
            "breakpoint added"
        );
        // Replace an existing breakpoint at the same coordinates
        let bucket = self.by_line.entry(breakpoint.line).or_default();
        bucket.retain(|bp| !bp.matches(&breakpoint.file, breakpoint.line));
        bucket.push(breakpoint);
    }

    /// Look up by emitted or original coordinates
    #[must_use]
    pub fn get(&self, file: &str, line: u32) -> Option<&Breakpoint> {
        let canonical = path::format(file);
        self.by_line
            .values()
            .flatten()
            .find(|bp| bp.matches(&canonical, line))
    }

    fn modify(&mut self, file: &str, line: u32, apply: impl FnOnce(&mut Breakpoint)) -> bool {
        let canonical = path::format(file);
        for bucket in self.by_line.values_mut() {
            if let Some(bp) = bucket.iter_mut().find(|bp| bp.matches(&canonical, line)) {
                apply(bp);
                return true;
            }
        }
        false
    }

    /// Remove by emitted or original coordinates
    pub fn remove(&mut self, file: &str, line: u32) -> bool {
        let canonical = path::format(file);
        let mut removed = false;
        self.by_line.retain(|_, bucket| {
            bucket.retain(|bp| {
                let matched = bp.matches(&canonical, line);
                removed |= matched;
                !matched
            });
            // Prune empty buckets so count() stays exact
            !bucket.is_empty()
        });
        removed
    }

    /// Flip the enabled flag; returns false when no breakpoint matched
    pub fn set_enabled(&mut self, file: &str, line: u32, enabled: bool) -> bool {
        self.modify(file, line, |bp| bp.enabled = enabled)
    }

    /// Flattened snapshot, no ordering guarantee
    #[must_use]
    pub fn get_all(&self) -> Vec<&Breakpoint> {
        self.by_line.values().flatten().collect()
    }

    /// Listing in user-facing coordinates
    #[must_use]
    pub fn infos(&self) -> Vec<BreakpointInfo> {
        self.by_line.values().flatten().map(Breakpoint::info).collect()
    }

    pub fn clear(&mut self) {
        self.by_line.clear();
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.by_line.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_line.is_empty()
    }

    /// Find an enabled breakpoint the hook position matches
    ///
    /// `source` is the canonical emitted source the hook reported. A match is
    /// either a breakpoint bound at this emitted line or, when the emitted
    /// file has a source map, a breakpoint stored in original coordinates
    /// that the mapped position reaches.
    #[must_use]
    pub fn match_at(
        &self,
        source: &str,
        line: u32,
        map: Option<&SourceMap>,
    ) -> Option<&Breakpoint> {
        if let Some(bucket) = self.by_line.get(&line) {
            if let Some(bp) = bucket
                .iter()
                .filter(|bp| bp.enabled)
                .find(|bp| path::compare(&bp.file, source))
            {
                return Some(bp);
            }
        }

        let mapping = map.and_then(|m| m.mapping_for_line(line))?;
        let mapped_source = map.and_then(|m| m.source_path(mapping))?;
        let bucket = self.by_line.get(&mapping.source_line)?;
        bucket
            .iter()
            .filter(|bp| bp.enabled)
            .find(|bp| path::compare(&bp.file, mapped_source))
    }
}
