use anyhow::Result;
use std::ffi::OsString;
use std::process::ExitCode;
use tracing::{info, warn};

mod cli;
mod config;
mod domain;
mod error;
mod infrastructure;
mod services;
mod tools;
mod ui;

use cli::{Invocation, RunOptions, USAGE};
use config::DeployConfig;
use error::DeployError;
use infrastructure::{CommandRunner, DryRunRunner, HttpPatchFetcher, SystemRunner};
use services::{AssumeYes, Confirmer, ForcedInit, PipelineService, StdinConfirmer};

#[tokio::main]
async fn main() -> ExitCode {
    let (config, options) = match start(std::env::args_os()) {
        Ok(run) => run,
        Err(code) => return ExitCode::from(code),
    };

    // Initialize logging with LOGGING env var support
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if options.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false)
        .init();

    match run(&config, &options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(&e),
    }
}

async fn run(config: &DeployConfig, options: &RunOptions) -> Result<()> {
    let settings =
        config::load_settings(options.config_path.as_deref()).map_err(DeployError::from)?;

    let missing = tools::missing_tools();
    if !missing.is_empty() {
        warn!("Tools not found on PATH: {}", missing.join(", "));
    }

    let fetcher = HttpPatchFetcher::new().map_err(DeployError::from)?;
    let runner: Box<dyn CommandRunner> = if options.dry_run {
        Box::new(DryRunRunner::new())
    } else {
        Box::new(SystemRunner::new())
    };
    let confirmer: Box<dyn Confirmer> = match (options.assume_yes, options.init_setup) {
        (true, init) => Box::new(AssumeYes::new(init)),
        (false, true) => Box::new(ForcedInit::new(StdinConfirmer::new())),
        (false, false) => Box::new(StdinConfirmer::new()),
    };

    let reports = PipelineService::new(&settings, runner.as_ref(), &fetcher, confirmer.as_ref())
        .with_fail_fast(options.fail_fast)
        .with_dry_run(options.dry_run)
        .execute(config)
        .await?;

    let failed = reports.iter().filter(|r| r.has_failures()).count();
    if failed == 0 {
        ui::print_success(&format!("Deployment of {} finished", config.tag));
    } else {
        ui::print_warning(&format!(
            "Deployment of {} finished, {} phase(s) had failing commands",
            config.tag, failed
        ));
    }
    info!("Run complete");
    Ok(())
}

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;

/// Parse the command line; `Err` carries the exit code once help or the error is printed
fn start<I, T>(args: I) -> Result<(DeployConfig, RunOptions), u8>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    match cli::parse_args(args) {
        Ok(Invocation::Run { config, options }) => Ok((config, options)),
        Ok(Invocation::Help) => {
            println!("{}", USAGE);
            Err(EXIT_OK)
        }
        Err(e) => {
            let failure = Failure::from_error(&anyhow::Error::from(DeployError::from(e)));
            failure.print();
            Err(failure.exit_code())
        }
    }
}

/// How a failed run is shown to the operator
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    /// Bad command line: the message followed by the usage text
    Usage(String),
    Declined(String),
    Error(String),
}

impl Failure {
    fn from_error(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<DeployError>() {
            Some(DeployError::Usage(usage)) => {
                Failure::Usage(format!("\nERROR: {}\n\n{}", usage, USAGE))
            }
            Some(declined @ DeployError::Declined(_)) => Failure::Declined(declined.to_string()),
            _ => Failure::Error(format!("{:#}", err)),
        }
    }

    fn exit_code(&self) -> u8 {
        EXIT_FAILURE
    }

    fn print(&self) {
        match self {
            Failure::Usage(text) => eprintln!("{}", text),
            Failure::Declined(message) => ui::print_warning(message),
            Failure::Error(message) => ui::print_error(message),
        }
    }
}

fn report(err: &anyhow::Error) -> ExitCode {
    let failure = Failure::from_error(err);
    failure.print();
    ExitCode::from(failure.exit_code())
}
