//! Centralized error types for deploy-centralvm
//!
//! Uses thiserror for typed errors that can be matched on,
//! while still being compatible with anyhow for propagation.

use thiserror::Error;

use crate::domain::phase::Phase;

/// Top-level error type for a deployment run
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("{0}")]
    Usage(#[from] UsageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Aborted by operator at phase '{}'", .0.name())]
    Declined(Phase),
}

/// Command line errors; all of them end with the usage text and exit code 1
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("Invalid Option: {flag}")]
    InvalidOption { flag: String },

    #[error("Invalid Option: {flag} requires an argument")]
    MissingValue { flag: String },

    #[error("missing mandatory argument {flag} <{name}>")]
    MissingMandatory { flag: &'static str, name: &'static str },

    #[error("Unexpected argument: {arg}")]
    UnexpectedArgument { arg: String },

    #[error("{message}")]
    Malformed { message: String },
}

/// Settings file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse config {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

/// External process errors
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("{command} exited with {code}")]
    NonZeroExit { command: String, code: String },

    #[error("Patch download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Failed to rewrite {path}: {message}")]
    RewriteFailed { path: String, message: String },
}
