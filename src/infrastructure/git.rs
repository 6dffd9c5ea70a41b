//! Git operations
//!
//! Builds the git commands that clone the deployment scripts and pin them to
//! a deployment tag.

use std::path::{Path, PathBuf};

use super::runner::CommandSpec;
use crate::tools::tools;

/// Client for git operations
pub struct GitClient {
    /// Working directory for git commands
    working_dir: Option<PathBuf>,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitClient {
    /// Create a new git client for current directory
    pub fn new() -> Self {
        Self { working_dir: None }
    }

    /// Create a git client for a specific checkout
    pub fn in_dir(path: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(path.into()),
        }
    }

    fn command(&self) -> CommandSpec {
        let cmd = CommandSpec::new(tools::GIT);
        match self.working_dir {
            Some(ref dir) => cmd.current_dir(dir),
            None => cmd,
        }
    }

    /// `git clone <url> <dest>`
    pub fn clone_repo(&self, url: &str, dest: &Path) -> CommandSpec {
        self.command().args(["clone", url]).path_arg(dest)
    }

    /// `git reset --hard <tag>`; the tag is a version pin, not necessarily a branch tip
    pub fn reset_hard(&self, tag: &str) -> CommandSpec {
        self.command().args(["reset", "--hard", tag])
    }
}
