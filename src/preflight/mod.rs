//! Preflight checks before a build.
//!
//! Validates that the host has the tools stages shell out to. This prevents
//! every module failing at its first command with the same cryptic error.
//!
//! # Example
//!
//! ```rust
//! use wander::preflight::{command_exists, check_required_tools};
//!
//! // Check a single command
//! if !command_exists("patch") {
//!     println!("patch not installed");
//! }
//!
//! // Check multiple tools
//! let tools = &[("patch", "patch"), ("make", "make")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::config::BuildConfig;
use anyhow::{bail, Result};
use std::path::Path;

/// Check if a command exists on the host system.
///
/// Absolute and relative paths are checked directly; bare names are looked
/// up in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).is_file();
    }
    which::which(cmd).is_ok()
}

/// Host tools the pipeline itself invokes.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("patch", "patch")];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the configured shell plus every tool in [`REQUIRED_TOOLS`].
pub fn check_host_tools(config: &BuildConfig) -> Result<()> {
    let mut tools: Vec<(&str, &str)> = vec![(config.shell.as_str(), "a POSIX shell")];
    tools.extend_from_slice(REQUIRED_TOOLS);
    check_required_tools(&tools)
}
