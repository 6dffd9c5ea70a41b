//! CLI definitions for deploy-centralvm
//!
//! Short getopts-style flags parsed with clap. The built-in help flag is
//! disabled: `-h` prints the usage text below and wins over every other flag,
//! valid or not.

use clap::error::{ContextKind, ContextValue, ErrorKind};
use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::DeployConfig;
use crate::domain::plan::{split_list, truncate_host};
use crate::error::UsageError;

/// Usage text for `-h` and every argument error
pub const USAGE: &str = "\
Usage: deploy-centralvm -c <central_services_url> -d <deployment_tag> [-r <repository>] [-b <deployment_patches>] [-s <service_names>] [-p <service_patches>] [-l <components>]

  -c <central_services_url>    Central services hostname (only the first label is kept)
  -d <deployment_tag>          Deployment tag (e.g. HG1908a)
  -r <repository>              Comp repository to look for the RPMs (defaults to 'comp=comp')
  -b <deployment_patches>      List of PR numbers in double quotes and space separated (e.g., \"5906 5934 5922\")
  -s <service_names>           List of the services names to apply the patches to
  -p <service_patches>         List of PR numbers in double quotes and space separated (e.g., \"9082 9094\")
  -l <components>              List of components to be deployed (defaults to \"couchdb dbs frontend reqmgr2 reqmgr2ms reqmon t0_reqmon workqueue acdcserver\")
  -h                           Print this help and exit

  --yes                        Answer every confirmation with yes (the initial setup stays off)
  --init                       Run the initial OS setup without asking
  --fail-fast                  Abort when an external command fails
  --dry-run                    Log commands instead of running them
  --config <path>              YAML file overriding paths and endpoints (env: DEPLOY_CENTRALVM_CONFIG)
  -v, --verbose                Enable verbose logging

Example: deploy-centralvm -c cmsweb-testbed.cern.ch -d HG1908a -b \"5906 5934\" -s \"reqmgr2 reqmgr2ms\" -p \"10003 10004\"";

#[derive(Parser, Debug)]
#[command(
    name = "deploy-centralvm",
    version,
    about = "Interactive provisioning of a central services development VM",
    disable_help_flag = true,
    disable_version_flag = true,
    args_override_self = true
)]
pub struct Cli {
    /// Central services hostname
    #[arg(short = 'c', value_name = "central_services_url")]
    pub central_services: Option<String>,

    /// Deployment tag
    #[arg(short = 'd', value_name = "deployment_tag")]
    pub tag: Option<String>,

    /// Package repository
    #[arg(short = 'r', value_name = "repository")]
    pub repository: Option<String>,

    /// Deployment script pull requests, space separated
    #[arg(short = 'b', value_name = "deployment_patches")]
    pub deployment_patches: Option<String>,

    /// Services to patch, space separated
    #[arg(short = 's', value_name = "service_names")]
    pub service_names: Option<String>,

    /// Service pull requests, space separated
    #[arg(short = 'p', value_name = "service_patches")]
    pub service_patches: Option<String>,

    /// Components to deploy, space separated
    #[arg(short = 'l', value_name = "components")]
    pub components: Option<String>,

    /// Print usage
    #[arg(short = 'h', action = ArgAction::SetTrue)]
    pub help: bool,

    /// Answer every confirmation with yes
    #[arg(long)]
    pub yes: bool,

    /// Run the initial OS setup without asking
    #[arg(long)]
    pub init: bool,

    /// Abort when an external command fails
    #[arg(long)]
    pub fail_fast: bool,

    /// Log commands instead of running them
    #[arg(long)]
    pub dry_run: bool,

    /// Settings file
    #[arg(long, env = "DEPLOY_CENTRALVM_CONFIG", value_name = "path")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// How the run behaves, as opposed to what it deploys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub assume_yes: bool,
    pub init_setup: bool,
    pub fail_fast: bool,
    pub dry_run: bool,
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
}

/// What the command line asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Help,
    Run {
        config: DeployConfig,
        options: RunOptions,
    },
}

/// Parse the full argument list (program name first)
pub fn parse_args<I, T>(args: I) -> Result<Invocation, UsageError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();

    let cli = match Cli::try_parse_from(&args) {
        Ok(cli) => cli,
        Err(_) if requests_help(&args) => return Ok(Invocation::Help),
        Err(e) => return Err(usage_error(&e)),
    };

    if cli.help {
        return Ok(Invocation::Help);
    }
    cli.into_invocation()
}

impl Cli {
    fn into_invocation(self) -> Result<Invocation, UsageError> {
        let central_host = self
            .central_services
            .as_deref()
            .map(|host| truncate_host(host.trim()).to_string())
            .filter(|host| !host.is_empty())
            .ok_or(UsageError::MissingMandatory {
                flag: "-c",
                name: "central_services_url",
            })?;
        let tag = self
            .tag
            .as_deref()
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .ok_or(UsageError::MissingMandatory {
                flag: "-d",
                name: "deployment_tag",
            })?;

        let mut config = DeployConfig::new(central_host, tag);
        if let Some(repository) = self.repository {
            config = config.with_repository(repository.trim());
        }
        if let Some(patches) = self.deployment_patches {
            config = config.with_deployment_patches(split_list(&patches));
        }
        config = config.with_service_patches(
            self.service_names.as_deref().map(split_list).unwrap_or_default(),
            self.service_patches.as_deref().map(split_list).unwrap_or_default(),
        );
        if let Some(components) = self.components {
            let components = split_list(&components);
            if components.is_empty() {
                return Err(UsageError::Malformed {
                    message: "-l needs at least one component".to_string(),
                });
            }
            config = config.with_components(components);
        }

        Ok(Invocation::Run {
            config,
            options: RunOptions {
                assume_yes: self.yes,
                init_setup: self.init,
                fail_fast: self.fail_fast,
                dry_run: self.dry_run,
                config_path: self.config,
                verbose: self.verbose,
            },
        })
    }
}

/// Short flags whose value may follow in the same cluster (`-cfoo`)
const VALUE_FLAGS: &str = "cdrbspl";

/// Whether `-h` appears anywhere, alone or inside a cluster of short flags
///
/// A cluster is scanned up to the first flag taking a value; whatever follows
/// it is that flag's value.
fn requests_help(args: &[OsString]) -> bool {
    args.iter().skip(1).any(|arg| {
        let arg = arg.to_string_lossy();
        if arg == "--help" {
            return true;
        }
        match arg.strip_prefix('-') {
            Some(cluster) if !cluster.starts_with('-') => {
                for flag in cluster.chars() {
                    if flag == 'h' {
                        return true;
                    }
                    if VALUE_FLAGS.contains(flag) {
                        return false;
                    }
                }
                false
            }
            _ => false,
        }
    })
}

/// Translate a clap error into the getopts-style messages operators know
fn usage_error(err: &clap::Error) -> UsageError {
    let invalid = match err.get(ContextKind::InvalidArg) {
        Some(ContextValue::String(arg)) => arg.split_whitespace().next().map(str::to_string),
        _ => None,
    };

    match (err.kind(), invalid) {
        (ErrorKind::UnknownArgument, Some(arg)) if !arg.starts_with('-') => {
            UsageError::UnexpectedArgument { arg }
        }
        (ErrorKind::UnknownArgument, Some(flag)) => UsageError::InvalidOption { flag },
        (ErrorKind::InvalidValue, Some(flag)) | (ErrorKind::NoEquals, Some(flag)) => {
            UsageError::MissingValue { flag }
        }
        (kind, _) => UsageError::Malformed {
            message: kind.to_string(),
        },
    }
}
