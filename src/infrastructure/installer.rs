//! Service installer operations
//!
//! Builds the commands for the `InstallDev` script shipped with the
//! deployment scripts: image install plus the start/stop/status stages.

use std::path::{Path, PathBuf};

use super::runner::CommandSpec;

/// Parameters of an image install
#[derive(Debug, Clone)]
pub struct InstallRequest<'r> {
    pub tag: &'r str,
    pub arch: &'r str,
    pub repository: &'r str,
    pub auth_dir: &'r Path,
    pub components: &'r [String],
}

/// Client for the deployment installer
pub struct InstallerClient {
    installer: PathBuf,
    work_dir: PathBuf,
}

impl InstallerClient {
    /// Create an installer client; commands run from `work_dir`
    pub fn new(installer: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            installer: installer.into(),
            work_dir: work_dir.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.installer.display().to_string()).current_dir(&self.work_dir)
    }

    /// Build and install the requested components
    pub fn install(&self, request: &InstallRequest<'_>) -> CommandSpec {
        self.command()
            .args(["-R", &format!("cmsweb@{}", request.tag)])
            .args(["-s", "image"])
            .args(["-v", request.tag])
            .args(["-A", request.arch])
            .args(["-r", request.repository])
            .arg("-a")
            .path_arg(request.auth_dir)
            .args(["-p", &request.components.join(" ")])
    }

    pub fn start(&self) -> CommandSpec {
        self.stage("start")
    }

    pub fn stop(&self) -> CommandSpec {
        self.stage("stop")
    }

    pub fn status(&self) -> CommandSpec {
        self.stage("status")
    }

    /// `InstallDev -s <stage>` for every installed service
    fn stage(&self, stage: &str) -> CommandSpec {
        self.command().args(["-s", stage])
    }
}
