//! Infrastructure layer - external I/O adapters
//!
//! This module contains all code that interacts with external systems:
//! - Process execution (system, dry-run)
//! - Git operations
//! - Pull request patches (HTTP download + `patch`)
//! - The deployment installer

pub mod git;
pub mod installer;
pub mod patch;
pub mod runner;

// Re-export commonly used types
pub use git::GitClient;
pub use installer::{InstallRequest, InstallerClient};
pub use patch::{HttpPatchFetcher, PatchClient, PatchFetcher, PatchTarget};
pub use runner::{CommandRunner, CommandSpec, DryRunRunner, SystemRunner};
