//! Path canonicalisation and source-map translation.
//!
//! This crate owns everything that maps between emitted coordinates (what
//! the interpreter's line hook reports) and original-source coordinates
//! (what the user authored): the path normaliser with its process-wide
//! cache, the VLQ-Base64 mapping decoder, the source-map store with inline
//! and sidecar resolution, and the source-position substituter applied to
//! error messages and tracebacks.

pub mod path;
pub mod remap;
pub mod source_map;
pub mod vlq;

pub use path::{compare as path_compare, dirname, format, get_absolute, is_absolute, SEPARATOR};
pub use remap::remap_positions;
pub use source_map::{Mapping, SourceMap, SourceMapStore};
