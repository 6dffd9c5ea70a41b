//! Runtime tool path resolution
//!
//! Every external program the pipeline starts is resolved here.
//!
//! ## Pattern
//!
//! For each tool (e.g., `git`), we:
//! 1. Check for an environment variable `{TOOL}_BIN` (e.g., `GIT_BIN`)
//! 2. Fall back to PATH-based invocation if the envvar is not set
//!
//! This lets a site pin a specific binary (or a wrapper) without touching the
//! settings file, and lets tests point a tool at a stub.

use std::env;

/// Get the path to an external tool
///
/// Checks for an environment variable `{TOOL}_BIN` (uppercase tool name + "_BIN",
/// dashes become underscores). Falls back to the tool name itself if the
/// envvar is not set, which relies on PATH.
///
/// Absolute and relative paths (anything containing `/`) are returned as is.
///
/// # Examples
///
/// ```rust,ignore
/// // With PATCH_BIN="/usr/local/bin/gpatch"
/// assert_eq!(get_tool_path("patch"), "/usr/local/bin/gpatch");
///
/// // Without PATCH_BIN set
/// assert_eq!(get_tool_path("patch"), "patch");
/// ```
pub fn get_tool_path(tool: &str) -> String {
    if tool.contains('/') {
        return tool.to_string();
    }
    let env_var = format!("{}_BIN", tool.to_uppercase().replace('-', "_"));
    env::var(&env_var).unwrap_or_else(|_| tool.to_string())
}

/// Tools that must be on the VM before the pipeline starts
///
/// Returns the ones `which` cannot find.
pub fn missing_tools() -> Vec<&'static str> {
    tools::REQUIRED
        .iter()
        .copied()
        .filter(|tool| which::which(get_tool_path(tool)).is_err())
        .collect()
}

/// Common tool names
pub mod tools {
    pub const GIT: &str = "git";
    pub const PATCH: &str = "patch";
    pub const SUDO: &str = "sudo";
    pub const YUM: &str = "yum";
    pub const CRONTAB: &str = "crontab";
    pub const KILLALL: &str = "killall";
    pub const HOSTNAME: &str = "hostname";
    pub const CHMOD: &str = "chmod";
    pub const CP: &str = "cp";
    pub const MV: &str = "mv";
    pub const RM: &str = "rm";

    /// Checked by the preflight; `yum` is only needed for the opt-in setup
    pub const REQUIRED: [&str; 6] = [GIT, PATCH, SUDO, CRONTAB, KILLALL, HOSTNAME];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_get_tool_path_from_env() {
        env::set_var("TEST_TOOL_BIN", "/custom/path/to/test-tool");
        assert_eq!(get_tool_path("test-tool"), "/custom/path/to/test-tool");
        env::remove_var("TEST_TOOL_BIN");
    }

    #[test]
    fn test_get_tool_path_fallback() {
        env::remove_var("MISSING_TOOL_BIN");
        assert_eq!(get_tool_path("missing-tool"), "missing-tool");
    }

    #[test]
    fn test_explicit_path_is_kept() {
        assert_eq!(
            get_tool_path("/data/cfg/admin/InstallDev"),
            "/data/cfg/admin/InstallDev"
        );
    }
}
