//! Site settings: every fixed path, endpoint and list the pipeline touches.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Paths, endpoints and fixed lists used by the deployment phases
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root of the VM deployment area (holds `cfg/`, `srv/`, `auth/`)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Deployment scripts repository
    #[serde(default = "default_deployment_repo_url")]
    pub deployment_repo_url: String,

    /// Pull request diff endpoint for the deployment scripts (`{id}` placeholder)
    #[serde(default = "default_deployment_patch_url")]
    pub deployment_patch_url: String,

    /// Pull request diff endpoint for the service sources (`{id}` placeholder)
    #[serde(default = "default_service_patch_url")]
    pub service_patch_url: String,

    /// Strip level for deployment patches
    #[serde(default = "default_deployment_patch_strip")]
    pub deployment_patch_strip: u32,

    /// Strip level for service patches
    #[serde(default = "default_service_patch_strip")]
    pub service_patch_strip: u32,

    /// Python package tree below each installed service
    #[serde(default = "default_site_packages")]
    pub site_packages: String,

    /// Target architecture handed to the installer
    #[serde(default = "default_arch")]
    pub arch: String,

    /// Authentication directory handed to the installer
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// OS packages installed by the initial setup
    #[serde(default = "default_os_packages")]
    pub os_packages: Vec<String>,

    /// Central certificate copied into every service
    #[serde(default = "default_cert_source")]
    pub cert_source: PathBuf,

    /// Central key copied into every service
    #[serde(default = "default_key_source")]
    pub key_source: PathBuf,

    /// Services whose certificate and key are replaced
    #[serde(default = "default_cert_services")]
    pub cert_services: Vec<String>,

    /// First characters of work dir entries the clean step keeps
    #[serde(default = "default_preserved_prefixes")]
    pub preserved_prefixes: Vec<String>,

    /// Work dir entries the clean step removes even when their prefix is preserved
    #[serde(default = "default_always_removed")]
    pub always_removed: Vec<String>,

    /// Services whose config gets the threaded host condition
    #[serde(default = "default_threaded_services")]
    pub threaded_services: Vec<String>,

    /// Host already present in the threaded condition
    #[serde(default = "default_threaded_anchor")]
    pub threaded_anchor: String,

    /// Process killed by the clean step
    #[serde(default = "default_killed_process")]
    pub killed_process: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_deployment_repo_url() -> String {
    "https://github.com/dmwm/deployment.git".to_string()
}

fn default_deployment_patch_url() -> String {
    "https://github.com/dmwm/deployment/pull/{id}.patch".to_string()
}

fn default_service_patch_url() -> String {
    "https://github.com/dmwm/WMCore/pull/{id}.patch".to_string()
}

fn default_deployment_patch_strip() -> u32 {
    1
}

fn default_service_patch_strip() -> u32 {
    3
}

fn default_site_packages() -> String {
    "lib/python2.7/site-packages".to_string()
}

fn default_arch() -> String {
    "slc7_amd64_gcc630".to_string()
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("/data/auth")
}

fn default_os_packages() -> Vec<String> {
    [
        "git",
        "zsh",
        "perl-Digest-MD5",
        "perl-Data-Dumper",
        "perl-Switch",
        "perl-Env",
        "libXcursor",
        "libXrandr",
        "libXinerama",
        "libXi",
        "libXft",
        "mesa-libGLU",
        "bzip2",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"))
}

fn default_cert_source() -> PathBuf {
    home_dir().join(".globus/usercert.pem")
}

fn default_key_source() -> PathBuf {
    home_dir().join(".globus/userkey.pem")
}

fn default_cert_services() -> Vec<String> {
    [
        "reqmgr2",
        "reqmgr2ms",
        "reqmon",
        "t0_reqmon",
        "workqueue",
        "acdcserver",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_preserved_prefixes() -> Vec<String> {
    ["a", "c", "e", "u"].iter().map(|s| s.to_string()).collect()
}

fn default_always_removed() -> Vec<String> {
    vec!["current".to_string(), "enabled".to_string()]
}

fn default_threaded_services() -> Vec<String> {
    ["reqmgr2", "reqmgr2ms", "reqmon", "workqueue"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_threaded_anchor() -> String {
    "vocms0117".to_string()
}

fn default_killed_process() -> String {
    "python".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            deployment_repo_url: default_deployment_repo_url(),
            deployment_patch_url: default_deployment_patch_url(),
            service_patch_url: default_service_patch_url(),
            deployment_patch_strip: default_deployment_patch_strip(),
            service_patch_strip: default_service_patch_strip(),
            site_packages: default_site_packages(),
            arch: default_arch(),
            auth_dir: default_auth_dir(),
            os_packages: default_os_packages(),
            cert_source: default_cert_source(),
            key_source: default_key_source(),
            cert_services: default_cert_services(),
            preserved_prefixes: default_preserved_prefixes(),
            always_removed: default_always_removed(),
            threaded_services: default_threaded_services(),
            threaded_anchor: default_threaded_anchor(),
            killed_process: default_killed_process(),
        }
    }
}

impl Settings {
    /// Settings rooted at a different work dir; the auth dir follows it
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self.auth_dir = self.work_dir.join("auth");
        self
    }

    /// Deployment scripts checkout
    pub fn cfg_dir(&self) -> PathBuf {
        self.work_dir.join("cfg")
    }

    /// Installer shipped with the deployment scripts
    pub fn installer_path(&self) -> PathBuf {
        self.cfg_dir().join("admin").join("InstallDev")
    }

    /// Currently deployed software area
    pub fn current_dir(&self) -> PathBuf {
        self.work_dir.join("srv").join("current")
    }

    /// Auth directory of one installed service
    pub fn service_auth_dir(&self, service: &str) -> PathBuf {
        self.current_dir().join("auth").join(service)
    }

    /// Python package tree of one installed service, the target of service patches
    pub fn service_package_dir(&self, service: &str) -> PathBuf {
        self.current_dir()
            .join("apps")
            .join(service)
            .join(&self.site_packages)
    }

    /// Config file directory of one service inside the checkout
    pub fn service_config_dir(&self, service: &str) -> PathBuf {
        self.cfg_dir().join(service)
    }

    /// Expand a `{id}` URL template
    pub fn patch_url(template: &str, id: &str) -> String {
        template.replace("{id}", id)
    }

    /// Checks that cannot be expressed through serde defaults
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.work_dir.is_absolute() {
            errors.push(format!(
                "work_dir must be absolute: {}",
                self.work_dir.display()
            ));
        }
        for (field, template) in [
            ("deployment_patch_url", &self.deployment_patch_url),
            ("service_patch_url", &self.service_patch_url),
        ] {
            if !template.contains("{id}") {
                errors.push(format!("{} has no {{id}} placeholder: {}", field, template));
            }
        }
        if self.preserved_prefixes.iter().any(|p| p.is_empty()) {
            errors.push("preserved_prefixes must not contain empty entries".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Relative display of a path under the work dir, for log lines
pub fn display_relative(settings: &Settings, path: &Path) -> String {
    path.strip_prefix(&settings.work_dir)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| path.display().to_string())
}
