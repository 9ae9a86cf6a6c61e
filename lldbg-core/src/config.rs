//! ABOUTME: Environment-driven configuration for the debugger runtime
//! ABOUTME: Reads the LOCAL_LUA_DEBUGGER_* variables into a DebugConfig

use serde::{Deserialize, Serialize};

/// Environment variable that requests an immediate break on entry
pub const ENV_BREAK_ON_ENTRY: &str = "LOCAL_LUA_DEBUGGER_VSCODE";

/// Environment variable naming the protocol output file (stdout when unset)
pub const ENV_OUTPUT_FILE: &str = "LOCAL_LUA_DEBUGGER_OUTPUT_FILE";

/// Environment variable carrying extra script roots, semicolon-separated
pub const ENV_SCRIPT_ROOTS: &str = "LOCAL_LUA_DEBUGGER_SCRIPT_ROOTS";

/// Debugger runtime configuration
///
/// All fields have launch-environment defaults; the adapter communicates its
/// wishes exclusively through environment variables, so `from_env` is the
/// production constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Break before the first script line runs
    pub break_on_entry: bool,

    /// Protocol output sink; standard output when `None`
    pub output_file: Option<String>,

    /// Additional directories searched for sidecar source maps
    pub script_roots: Vec<String>,
}

impl DebugConfig {
    /// Build a configuration from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        let break_on_entry = std::env::var(ENV_BREAK_ON_ENTRY)
            .map(|v| v == "1")
            .unwrap_or(false);

        let output_file = std::env::var(ENV_OUTPUT_FILE)
            .ok()
            .filter(|v| !v.is_empty());

        let script_roots = std::env::var(ENV_SCRIPT_ROOTS)
            .map(|v| Self::parse_script_roots(&v))
            .unwrap_or_default();

        Self {
            break_on_entry,
            output_file,
            script_roots,
        }
    }

    /// Split a semicolon-separated root list, dropping empty segments
    #[must_use]
    pub fn parse_script_roots(raw: &str) -> Vec<String> {
        raw.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DebugConfig::default();
        assert!(!config.break_on_entry);
        assert!(config.output_file.is_none());
        assert!(config.script_roots.is_empty());
    }

    #[test]
    fn test_parse_script_roots() {
        let roots = DebugConfig::parse_script_roots("/a/b;/c/d");
        assert_eq!(roots, vec!["/a/b".to_string(), "/c/d".to_string()]);

        // Empty segments are dropped
        let roots = DebugConfig::parse_script_roots(";/only;;");
        assert_eq!(roots, vec!["/only".to_string()]);

        assert!(DebugConfig::parse_script_roots("").is_empty());
    }
}
