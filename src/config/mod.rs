//! # Deployment Configuration
//!
//! Two layers:
//!
//! 1. **Run parameters** ([`DeployConfig`]): what the operator asked for on the
//!    command line. Built once by the argument parser and never mutated.
//! 2. **Site settings** ([`Settings`]): paths, endpoints and fixed lists. Built-in
//!    defaults, optionally overridden by a YAML file passed with `--config`.
//!
//! ## Example Settings File
//!
//! ```yaml
//! work_dir: /data
//! arch: slc7_amd64_gcc630
//! cert_services: [reqmgr2, reqmgr2ms, reqmon, t0_reqmon, workqueue, acdcserver]
//! ```

mod settings;

pub use settings::{display_relative, Settings};

use std::path::Path;

use crate::error::ConfigError;

/// Repository handed to the installer when `-r` is absent
pub const DEFAULT_REPOSITORY: &str = "comp=comp";

/// Components deployed when `-l` is absent, in install order
pub const DEFAULT_COMPONENTS: [&str; 9] = [
    "couchdb",
    "dbs",
    "frontend",
    "reqmgr2",
    "reqmgr2ms",
    "reqmon",
    "t0_reqmon",
    "workqueue",
    "acdcserver",
];

/// Parameters of one deployment run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    /// Central services host, first label only
    pub central_host: String,
    /// Deployment tag the scripts checkout is pinned to
    pub tag: String,
    /// Package repository identifier
    pub repository: String,
    /// Deployment scripts pull requests, applied in order
    pub deployment_patches: Vec<String>,
    /// Services receiving service patches
    pub service_names: Vec<String>,
    /// Service pull requests, applied to every service in `service_names`
    pub service_patches: Vec<String>,
    /// Components handed to the installer
    pub components: Vec<String>,
}

impl DeployConfig {
    /// Create a config with defaults for everything but the two mandatory fields
    pub fn new(central_host: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            central_host: central_host.into(),
            tag: tag.into(),
            repository: DEFAULT_REPOSITORY.to_string(),
            deployment_patches: Vec::new(),
            service_names: Vec::new(),
            service_patches: Vec::new(),
            components: DEFAULT_COMPONENTS.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Builder: set repository
    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    /// Builder: set deployment script patches
    pub fn with_deployment_patches(mut self, patches: Vec<String>) -> Self {
        self.deployment_patches = patches;
        self
    }

    /// Builder: set service names and the patches applied to each of them
    pub fn with_service_patches(mut self, services: Vec<String>, patches: Vec<String>) -> Self {
        self.service_names = services;
        self.service_patches = patches;
        self
    }

    /// Builder: set components
    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.components = components;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.central_host.is_empty() {
            errors.push("Central services host is required".to_string());
        }
        if self.tag.is_empty() {
            errors.push("Deployment tag is required".to_string());
        }
        if self.components.is_empty() {
            errors.push("At least one component is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load site settings, falling back to built-in defaults when no file is given
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match path {
        None => Settings::default(),
        Some(path) => {
            let content =
                std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })?;
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
        }
    };

    settings
        .validate()
        .map_err(|errors| ConfigError::InvalidValue {
            field: "settings".to_string(),
            value: errors.join("; "),
        })?;

    Ok(settings)
}
