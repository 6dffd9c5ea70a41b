//! Pipeline service - runs the VM deployment phases
//!
//! Phases run strictly in order. Every gated phase asks the operator first;
//! a "no" stops the run. Subprocess failures are recorded and reported but,
//! unless fail-fast is on, do not stop the run.

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use super::confirm::Confirmer;
use crate::config::{display_relative, DeployConfig, Settings};
use crate::domain::{CommandRecord, Gate, Phase, PhaseReport, PhaseStatus};
use crate::domain::plan::{
    archive_name, enable_threading, removable_entries, service_patch_plan, truncate_host,
};
use crate::error::{CommandError, DeployError};
use crate::infrastructure::{
    CommandRunner, CommandSpec, GitClient, InstallRequest, InstallerClient, PatchClient,
    PatchFetcher, PatchTarget,
};
use crate::tools::tools;
use crate::ui;

/// Certificate and key file names inside each service auth directory
const SERVICE_CERT: &str = "dmwm-service-cert.pem";
const SERVICE_KEY: &str = "dmwm-service-key.pem";

/// Mode while the certificates are being replaced, and the mode restored afterwards
const CERT_MODE_WRITABLE: &str = "600";
const CERT_MODE_RESTRICTED: &str = "400";

/// What a phase body did
enum PhaseBody {
    Ran,
    Skipped(String),
}

/// Runs the commands of one phase and keeps their exit status
struct PhaseLog<'r> {
    runner: &'r dyn CommandRunner,
    fail_fast: bool,
    records: Vec<CommandRecord>,
}

impl<'r> PhaseLog<'r> {
    fn new(runner: &'r dyn CommandRunner, fail_fast: bool) -> Self {
        Self {
            runner,
            fail_fast,
            records: Vec::new(),
        }
    }

    /// Run a command; `Ok(false)` when it failed and the run goes on
    async fn run(&mut self, spec: CommandSpec) -> Result<bool, CommandError> {
        let result = self.runner.run(&spec).await.map(|status| status.code);
        self.record(spec.to_string(), result)
    }

    fn record(
        &mut self,
        command: String,
        result: Result<Option<i32>, CommandError>,
    ) -> Result<bool, CommandError> {
        match result {
            Ok(code) if code == Some(0) => {
                self.records.push(CommandRecord::new(command, code));
                Ok(true)
            }
            Ok(code) => {
                self.records.push(CommandRecord::new(command.clone(), code));
                let code = code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                warn!("{} exited with {}", command, code);
                if self.fail_fast {
                    return Err(CommandError::NonZeroExit { command, code });
                }
                Ok(false)
            }
            Err(e) => {
                warn!("{}", e);
                self.records.push(CommandRecord::new(command, None));
                if self.fail_fast {
                    return Err(e);
                }
                Ok(false)
            }
        }
    }
}

/// Service for running the deployment pipeline
pub struct PipelineService<'a> {
    settings: &'a Settings,
    runner: &'a dyn CommandRunner,
    fetcher: &'a dyn PatchFetcher,
    confirmer: &'a dyn Confirmer,
    fail_fast: bool,
    dry_run: bool,
}

impl<'a> PipelineService<'a> {
    /// Create a new pipeline service
    pub fn new(
        settings: &'a Settings,
        runner: &'a dyn CommandRunner,
        fetcher: &'a dyn PatchFetcher,
        confirmer: &'a dyn Confirmer,
    ) -> Self {
        Self {
            settings,
            runner,
            fetcher,
            confirmer,
            fail_fast: false,
            dry_run: false,
        }
    }

    /// Builder: stop at the first failing command
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Builder: leave files on disk untouched (commands go to the runner as usual)
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Run every phase in order
    pub async fn execute(&self, config: &DeployConfig) -> Result<Vec<PhaseReport>> {
        config.validate().map_err(|errors| {
            anyhow::anyhow!("Invalid deployment configuration:\n  {}", errors.join("\n  "))
        })?;

        self.print_header(config);

        let mut reports = Vec::new();
        let total = Phase::ALL.len();

        for phase in Phase::ALL {
            ui::print_phase(phase.position(), total, phase.name(), phase.banner());

            match phase.gate() {
                Gate::OptIn => {
                    if !self.confirmer.opt_in(phase)? {
                        info!("Skipping {}", phase.name());
                        reports.push(PhaseReport::skipped(phase, "not requested"));
                        continue;
                    }
                }
                Gate::Proceed => {
                    if !self.confirmer.proceed(phase)? {
                        reports.push(PhaseReport::declined(phase));
                        self.print_summary(&reports);
                        return Err(DeployError::Declined(phase).into());
                    }
                }
                Gate::None => {}
            }

            let start = Instant::now();
            let mut log = PhaseLog::new(self.runner, self.fail_fast);
            let result = self.execute_phase(phase, config, &mut log).await;
            let duration = start.elapsed();

            match result {
                Ok(PhaseBody::Ran) => {
                    let report = PhaseReport::completed(phase, duration, log.records);
                    if report.has_failures() {
                        ui::print_warning(&format!(
                            "{} finished with failing commands; check the output above",
                            phase.name()
                        ));
                    } else {
                        info!(
                            "{} {} completed in {:.1}s",
                            "✅".green(),
                            phase.name(),
                            duration.as_secs_f64()
                        );
                    }
                    reports.push(report);
                }
                Ok(PhaseBody::Skipped(reason)) => {
                    info!("Skipping {}: {}", phase.name(), reason);
                    reports.push(PhaseReport::skipped(phase, reason));
                }
                Err(e) => {
                    info!("{} {} failed: {:#}", "❌".red(), phase.name(), e);
                    reports.push(PhaseReport::completed(phase, duration, log.records));
                    self.print_summary(&reports);
                    return Err(e);
                }
            }
        }

        self.print_summary(&reports);
        Ok(reports)
    }

    /// Execute a single phase body
    async fn execute_phase(
        &self,
        phase: Phase,
        config: &DeployConfig,
        log: &mut PhaseLog<'_>,
    ) -> Result<PhaseBody> {
        match phase {
            Phase::InitSetup => self.init_setup(log).await,
            Phase::CleanVm => self.clean_vm(config, log).await,
            Phase::CloneDep => self.clone_dep(config, log).await,
            Phase::EnableCherrypy => self.enable_cherrypy(config, log).await,
            Phase::PatchDep => self.patch_dep(config, log).await,
            Phase::ServiceDeployment => self.service_deployment(config, log).await,
            Phase::UpdateCert => self.update_cert(log).await,
            Phase::PatchService => self.patch_service(config, log).await,
            Phase::StartService => {
                log.run(self.installer().start()).await?;
                Ok(PhaseBody::Ran)
            }
            Phase::StatusService => {
                log.run(self.installer().status()).await?;
                Ok(PhaseBody::Ran)
            }
        }
    }

    fn installer(&self) -> InstallerClient {
        InstallerClient::new(self.settings.installer_path(), &self.settings.work_dir)
    }

    async fn init_setup(&self, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        log.run(
            CommandSpec::sudo(tools::YUM)
                .args(["-y", "install"])
                .args(self.settings.os_packages.iter()),
        )
        .await?;

        let scratch = tempfile::Builder::new()
            .prefix("deploy-centralvm-")
            .tempdir()
            .context("Failed to create bootstrap directory")?;
        let cfg = scratch.path().join("cfg");

        log.run(GitClient::new().clone_repo(&self.settings.deployment_repo_url, &cfg))
            .await?;
        log.run(
            CommandSpec::new(&cfg.join("Deploy").display().to_string())
                .args(["-t", "dummy", "-s", "post"])
                .path_arg(scratch.path())
                .arg("system/devvm")
                .current_dir(scratch.path()),
        )
        .await?;

        if let Err(e) = scratch.close() {
            warn!("Failed to remove bootstrap directory: {}", e);
        }
        Ok(PhaseBody::Ran)
    }

    async fn clean_vm(&self, config: &DeployConfig, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        let fqdn = match self
            .runner
            .capture(&CommandSpec::new(tools::HOSTNAME).arg("-f"))
            .await
        {
            Ok(fqdn) => fqdn,
            Err(e) => {
                warn!("Could not determine this host's name: {}", e);
                return Ok(PhaseBody::Skipped("host name unknown".to_string()));
            }
        };

        if truncate_host(&fqdn) != config.central_host {
            ui::print_warning(&format!(
                "This host ({}) is not {}; leaving it untouched",
                fqdn, config.central_host
            ));
            return Ok(PhaseBody::Skipped(format!("host {} does not match", fqdn)));
        }

        log.run(self.installer().stop()).await?;
        log.run(CommandSpec::new(tools::CRONTAB).arg("-r")).await?;
        log.run(CommandSpec::new(tools::KILLALL).arg(&self.settings.killed_process))
            .await?;

        let names = match self.work_dir_entries().await {
            Ok(names) => names,
            Err(e) => {
                warn!("{:#}", e);
                return Ok(PhaseBody::Ran);
            }
        };
        let removable: Vec<PathBuf> = removable_entries(&names, self.settings)
            .into_iter()
            .map(|name| self.settings.work_dir.join(name))
            .collect();

        if removable.is_empty() {
            info!("Nothing to remove in {}", self.settings.work_dir.display());
        } else {
            info!(
                "Removing {} entries from {}",
                removable.len(),
                self.settings.work_dir.display()
            );
            log.run(
                removable
                    .iter()
                    .fold(CommandSpec::sudo(tools::RM).arg("-rf"), |spec, path| {
                        spec.path_arg(path)
                    })
                    .current_dir(&self.settings.work_dir),
            )
            .await?;
        }

        Ok(PhaseBody::Ran)
    }

    async fn work_dir_entries(&self) -> Result<Vec<String>> {
        let dir = &self.settings.work_dir;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn clone_dep(&self, config: &DeployConfig, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        let cfg = self.settings.cfg_dir();

        if tokio::fs::try_exists(&cfg).await.unwrap_or(false) {
            let archive = self.settings.work_dir.join(archive_name(Utc::now()));
            info!("Archiving existing checkout as {}", archive.display());
            log.run(CommandSpec::new(tools::MV).path_arg(&cfg).path_arg(&archive))
                .await?;
        }

        log.run(GitClient::new().clone_repo(&self.settings.deployment_repo_url, &cfg))
            .await?;
        log.run(GitClient::in_dir(&cfg).reset_hard(&config.tag))
            .await?;

        Ok(PhaseBody::Ran)
    }

    async fn enable_cherrypy(
        &self,
        config: &DeployConfig,
        log: &mut PhaseLog<'_>,
    ) -> Result<PhaseBody> {
        let mut files = Vec::new();
        for service in &self.settings.threaded_services {
            match self.service_config_files(service).await {
                Ok(found) => files.extend(found),
                Err(e) => warn!("{:#}", e),
            }
        }

        if files.is_empty() {
            return Ok(PhaseBody::Skipped("no service config files found".to_string()));
        }

        for path in &files {
            match self.rewrite_config(path, &config.central_host).await {
                Ok(matched) => {
                    let shown = display_relative(self.settings, path);
                    for line in &matched {
                        println!("{}: {}", shown, line);
                    }
                }
                Err(e) => {
                    log.record(format!("rewrite {}", path.display()), Err(e))?;
                }
            }
        }

        Ok(PhaseBody::Ran)
    }

    /// Add `host` to the threaded hosts of one config file; returns the matching lines
    async fn rewrite_config(&self, path: &Path, host: &str) -> Result<Vec<String>, CommandError> {
        let failed = |message: String| CommandError::RewriteFailed {
            path: path.display().to_string(),
            message,
        };

        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let rewrite = enable_threading(&text, &self.settings.threaded_anchor, host)
            .map_err(|e| failed(e.to_string()))?;

        if rewrite.changed {
            if self.dry_run {
                info!("[dry-run] would update {}", path.display());
            } else {
                tokio::fs::write(path, &rewrite.content)
                    .await
                    .map_err(|e| failed(e.to_string()))?;
            }
        }

        Ok(rewrite.matched_lines)
    }

    /// `config*.py` files of one service inside the checkout, sorted
    async fn service_config_files(&self, service: &str) -> Result<Vec<PathBuf>> {
        let dir = self.settings.service_config_dir(service);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("No config directory for {} at {}", service, dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("config") && name.ends_with(".py") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn patch_dep(&self, config: &DeployConfig, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        if config.deployment_patches.is_empty() {
            return Ok(PhaseBody::Skipped("no deployment patches requested".to_string()));
        }

        let cfg = self.settings.cfg_dir();
        let target = PatchTarget {
            dir: &cfg,
            strip: self.settings.deployment_patch_strip,
            sudo: false,
        };
        for id in &config.deployment_patches {
            let url = Settings::patch_url(&self.settings.deployment_patch_url, id);
            self.apply_patch(&url, target, log).await?;
        }

        Ok(PhaseBody::Ran)
    }

    async fn patch_service(&self, config: &DeployConfig, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        let plan = service_patch_plan(config);
        if plan.is_empty() {
            return Ok(PhaseBody::Skipped(
                "service patches need both -s and -p".to_string(),
            ));
        }

        for item in &plan {
            let dir = self.settings.service_package_dir(&item.service);
            let url = Settings::patch_url(&self.settings.service_patch_url, &item.patch);
            let target = PatchTarget {
                dir: &dir,
                strip: self.settings.service_patch_strip,
                sudo: true,
            };
            self.apply_patch(&url, target, log).await?;
        }

        Ok(PhaseBody::Ran)
    }

    async fn apply_patch(
        &self,
        url: &str,
        target: PatchTarget<'_>,
        log: &mut PhaseLog<'_>,
    ) -> Result<(), CommandError> {
        match PatchClient::new(self.fetcher).prepare(url, target).await {
            Ok(spec) => log.run(spec).await.map(|_| ()),
            Err(e) => log.record(format!("download {}", url), Err(e)).map(|_| ()),
        }
    }

    async fn service_deployment(
        &self,
        config: &DeployConfig,
        log: &mut PhaseLog<'_>,
    ) -> Result<PhaseBody> {
        let request = InstallRequest {
            tag: &config.tag,
            arch: &self.settings.arch,
            repository: &config.repository,
            auth_dir: &self.settings.auth_dir,
            components: &config.components,
        };
        log.run(self.installer().install(&request)).await?;
        Ok(PhaseBody::Ran)
    }

    async fn update_cert(&self, log: &mut PhaseLog<'_>) -> Result<PhaseBody> {
        let targets: Vec<(PathBuf, PathBuf)> = self
            .settings
            .cert_services
            .iter()
            .map(|service| {
                let dir = self.settings.service_auth_dir(service);
                (dir.join(SERVICE_CERT), dir.join(SERVICE_KEY))
            })
            .collect();

        for (cert, key) in &targets {
            log.run(chmod(CERT_MODE_WRITABLE, cert, key)).await?;
        }
        for (cert, key) in &targets {
            log.run(
                CommandSpec::sudo(tools::CP)
                    .path_arg(&self.settings.cert_source)
                    .path_arg(cert),
            )
            .await?;
            log.run(
                CommandSpec::sudo(tools::CP)
                    .path_arg(&self.settings.key_source)
                    .path_arg(key),
            )
            .await?;
        }
        for (cert, key) in &targets {
            log.run(chmod(CERT_MODE_RESTRICTED, cert, key)).await?;
        }

        Ok(PhaseBody::Ran)
    }

    fn print_header(&self, config: &DeployConfig) {
        ui::print_header(&format!("Central VM deployment: {}", config.tag));
        info!("Central services: {}", config.central_host);
        info!("Repository: {}", config.repository);
        info!("Components: {}", config.components.join(" "));
        if !config.deployment_patches.is_empty() {
            info!("Deployment patches: {}", config.deployment_patches.join(" "));
        }
        if !config.service_names.is_empty() || !config.service_patches.is_empty() {
            info!(
                "Service patches: {} on {}",
                config.service_patches.join(" "),
                config.service_names.join(" ")
            );
        }
        info!("Work dir: {}", self.settings.work_dir.display());
        if self.dry_run {
            ui::print_info("Dry run: commands are logged, not executed");
        }
    }

    fn print_summary(&self, reports: &[PhaseReport]) {
        println!();
        println!(
            "{}",
            "════════════════════════════════════════════════════════════".bright_blue()
        );

        let failures: usize = reports.iter().map(|r| r.failed_commands().count()).sum();
        match reports.last().map(|r| &r.status) {
            Some(PhaseStatus::Declined) => println!(
                "{}",
                "🛑 Deployment aborted by operator".bright_red().bold()
            ),
            _ if failures > 0 => println!(
                "{}",
                format!("⚠️  Deployment finished with {} failing command(s)", failures)
                    .bright_yellow()
                    .bold()
            ),
            _ => println!("{}", "✅ Deployment finished".bright_green().bold()),
        }

        println!();
        for report in reports {
            let (status, detail) = match report.status {
                PhaseStatus::Completed if report.has_failures() => ("⚠️ ", String::new()),
                PhaseStatus::Completed => ("✅", String::new()),
                PhaseStatus::Skipped(ref reason) => ("⏭️ ", format!(" - {}", reason)),
                PhaseStatus::Declined => ("🛑", " - declined".to_string()),
            };
            println!(
                "   {} {} ({:.1}s){}",
                status,
                report.phase.name(),
                report.duration.as_secs_f64(),
                detail
            );
            for failed in report.failed_commands() {
                println!("        {} {}", "✗".red(), failed.command);
            }
        }
        println!();
    }
}

/// `sudo chmod <mode> <cert> <key>`
fn chmod(mode: &str, cert: &Path, key: &Path) -> CommandSpec {
    CommandSpec::sudo(tools::CHMOD)
        .arg(mode)
        .path_arg(cert)
        .path_arg(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployConfig;
    use crate::domain::plan::split_list;
    use crate::infrastructure::runner::CommandStatus;
    use crate::services::confirm::AssumeYes;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every command; optionally fails those whose rendering contains a marker
    struct RecordingRunner {
        fqdn: String,
        fail_marker: Option<String>,
        commands: Mutex<Vec<CommandSpec>>,
    }

    impl RecordingRunner {
        fn new(fqdn: &str) -> Self {
            Self {
                fqdn: fqdn.to_string(),
                fail_marker: None,
                commands: Mutex::new(Vec::new()),
            }
        }

        fn failing(mut self, marker: &str) -> Self {
            self.fail_marker = Some(marker.to_string());
            self
        }

        fn commands(&self) -> Vec<CommandSpec> {
            self.commands.lock().unwrap().clone()
        }

        /// Commands whose argument list contains `arg`
        fn with_arg(&self, arg: &str) -> Vec<CommandSpec> {
            self.commands()
                .into_iter()
                .filter(|c| c.args.iter().any(|a| a == arg))
                .collect()
        }

        fn with_program(&self, program: &str) -> Vec<CommandSpec> {
            self.commands()
                .into_iter()
                .filter(|c| c.program == program)
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandStatus, CommandError> {
            self.commands.lock().unwrap().push(spec.clone());
            let failed = self
                .fail_marker
                .as_ref()
                .map(|m| spec.to_string().contains(m.as_str()))
                .unwrap_or(false);
            Ok(CommandStatus {
                code: Some(if failed { 1 } else { 0 }),
            })
        }

        async fn capture(&self, _spec: &CommandSpec) -> Result<String, CommandError> {
            Ok(self.fqdn.clone())
        }
    }

    /// Returns the URL as the patch body
    struct EchoFetcher {
        urls: Mutex<Vec<String>>,
    }

    impl EchoFetcher {
        fn new() -> Self {
            Self {
                urls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PatchFetcher for EchoFetcher {
        async fn fetch(&self, url: &str) -> Result<String, CommandError> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(url.to_string())
        }
    }

    /// Proceeds everywhere except at one phase
    struct DeclineAt(Phase);

    impl Confirmer for DeclineAt {
        fn proceed(&self, phase: Phase) -> Result<bool> {
            Ok(phase != self.0)
        }

        fn opt_in(&self, _phase: Phase) -> Result<bool> {
            Ok(false)
        }
    }

    fn stdin_text(spec: &CommandSpec) -> String {
        spec.stdin
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default()
    }

    fn workspace() -> (tempfile::TempDir, Settings) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default().with_work_dir(dir.path());
        (dir, settings)
    }

    #[tokio::test]
    async fn test_deployment_patches_applied_in_order() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a")
            .with_deployment_patches(split_list("5906 5934"));

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();

        let applied = runner.with_arg("-p1");
        assert_eq!(applied.len(), 2);
        assert_eq!(
            stdin_text(&applied[0]),
            "https://github.com/dmwm/deployment/pull/5906.patch"
        );
        assert_eq!(
            stdin_text(&applied[1]),
            "https://github.com/dmwm/deployment/pull/5934.patch"
        );
        let cfg = settings.cfg_dir().display().to_string();
        assert!(applied.iter().all(|c| c.args[1] == cfg));
        assert!(applied.iter().all(|c| c.program != "sudo"));
    }

    #[tokio::test]
    async fn test_service_patches_cross_product() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a").with_service_patches(
            split_list("reqmgr2 reqmgr2ms"),
            split_list("10003 10004"),
        );

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();

        let applied = runner.with_arg("-p3");
        let observed: Vec<(String, String)> = applied
            .iter()
            .map(|c| (c.args[2].clone(), stdin_text(c)))
            .collect();
        let dir = |svc: &str| settings.service_package_dir(svc).display().to_string();
        let url = |id: &str| format!("https://github.com/dmwm/WMCore/pull/{}.patch", id);
        assert_eq!(
            observed,
            vec![
                (dir("reqmgr2"), url("10003")),
                (dir("reqmgr2"), url("10004")),
                (dir("reqmgr2ms"), url("10003")),
                (dir("reqmgr2ms"), url("10004")),
            ]
        );
        assert!(applied.iter().all(|c| c.program == "sudo"));
    }

    #[tokio::test]
    async fn test_declining_stops_the_run() {
        let gated = Phase::ALL.iter().copied().filter(|p| p.gate() == Gate::Proceed);
        for phase in gated {
            let (_dir, settings) = workspace();
            let runner = RecordingRunner::new("othervm.cern.ch");
            let fetcher = EchoFetcher::new();
            let confirmer = DeclineAt(phase);
            let config = DeployConfig::new("myvm", "HG1908a")
                .with_deployment_patches(split_list("5906"))
                .with_service_patches(split_list("reqmgr2"), split_list("10003"));

            let err = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
                .execute(&config)
                .await
                .unwrap_err();

            match err.downcast_ref::<DeployError>() {
                Some(DeployError::Declined(declined)) => assert_eq!(*declined, phase),
                other => panic!("{}: expected a decline, got {:?}", phase.name(), other),
            }
            assert!(
                runner.with_arg("start").is_empty(),
                "{}: services started after a decline",
                phase.name()
            );
        }
    }

    #[tokio::test]
    async fn test_declining_first_gate_runs_nothing() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = DeclineAt(Phase::CleanVm);

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&DeployConfig::new("myvm", "HG1908a").with_deployment_patches(split_list("5906")))
            .await
            .unwrap_err();

        assert!(runner.commands().is_empty());
        assert!(fetcher.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_run_order() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a");

        let reports = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();

        let phases: Vec<Phase> = reports.iter().map(|r| r.phase).collect();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert_eq!(reports[0].status, PhaseStatus::Skipped("not requested".to_string()));

        let commands = runner.commands();
        let clone = commands.iter().position(|c| c.args.first().map(String::as_str) == Some("clone"));
        let install = commands.iter().position(|c| c.args.iter().any(|a| a == "image"));
        let start = commands.iter().position(|c| c.args.iter().any(|a| a == "start"));
        let status = commands.iter().position(|c| c.args.iter().any(|a| a == "status"));
        assert!(clone < install && install < start && start < status);
        assert_eq!(commands.last().map(|c| c.args.clone()), Some(vec!["-s".to_string(), "status".to_string()]));
    }

    #[tokio::test]
    async fn test_clean_vm_only_on_matching_host() {
        let (dir, settings) = workspace();
        for name in ["cfg", "srv", "logs", ".cache", "auth"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a");

        let elsewhere = RecordingRunner::new("othervm.cern.ch");
        PipelineService::new(&settings, &elsewhere, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();
        assert!(elsewhere.with_program("crontab").is_empty());
        assert!(elsewhere.with_arg("-rf").is_empty());

        let here = RecordingRunner::new("myvm.cern.ch");
        PipelineService::new(&settings, &here, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();
        assert_eq!(here.with_program("crontab").len(), 1);
        assert_eq!(here.with_program("killall")[0].args, vec!["python"]);
        assert_eq!(here.with_arg("stop").len(), 1);

        let removed = here.with_arg("-rf");
        assert_eq!(removed.len(), 1);
        let path = |name: &str| dir.path().join(name).display().to_string();
        assert!(removed[0].args.contains(&path("srv")));
        assert!(removed[0].args.contains(&path("logs")));
        assert!(removed[0].args.contains(&path(".cache")));
        assert!(!removed[0].args.contains(&path("cfg")));
        assert!(!removed[0].args.contains(&path("auth")));
    }

    #[tokio::test]
    async fn test_existing_checkout_is_archived() {
        let (dir, settings) = workspace();
        std::fs::create_dir(dir.path().join("cfg")).unwrap();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap();

        let moved = runner.with_program("mv");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].args[0], settings.cfg_dir().display().to_string());
        assert!(moved[0].args[1].starts_with(&dir.path().join("cfg.").display().to_string()));
    }

    #[tokio::test]
    async fn test_enable_cherrypy_rewrites_configs() {
        let (dir, settings) = workspace();
        let svc_dir = dir.path().join("cfg").join("reqmgr2");
        std::fs::create_dir_all(&svc_dir).unwrap();
        std::fs::write(
            svc_dir.join("config.py"),
            "if HOST.startswith(\"vocms0117\"):\n    threaded = True\n",
        )
        .unwrap();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(svc_dir.join("config.py")).unwrap();
        assert!(text.contains("HOST.startswith(\"vocms0117\") or HOST.startswith(\"myvm\")"));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_configs_alone() {
        let (dir, settings) = workspace();
        let svc_dir = dir.path().join("cfg").join("workqueue");
        std::fs::create_dir_all(&svc_dir).unwrap();
        let original = "if HOST.startswith(\"vocms0117\"):\n";
        std::fs::write(svc_dir.join("config-global.py"), original).unwrap();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .with_dry_run(true)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(svc_dir.join("config-global.py")).unwrap();
        assert_eq!(text, original);
    }

    #[tokio::test]
    async fn test_unreadable_config_is_recorded() {
        let (dir, settings) = workspace();
        let broken = dir.path().join("cfg").join("reqmgr2");
        let healthy = dir.path().join("cfg").join("workqueue");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::create_dir_all(&healthy).unwrap();
        std::fs::write(broken.join("config.py"), b"\xff\xfe HOST.startswith(\"vocms0117\")").unwrap();
        std::fs::write(healthy.join("config.py"), "if HOST.startswith(\"vocms0117\"):\n").unwrap();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        let reports = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap();

        let cherrypy = reports
            .iter()
            .find(|r| r.phase == Phase::EnableCherrypy)
            .unwrap();
        let failed: Vec<_> = cherrypy.failed_commands().collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].command.starts_with("rewrite "));
        assert!(failed[0].command.ends_with("config.py"));

        let text = std::fs::read_to_string(healthy.join("config.py")).unwrap();
        assert!(text.contains("HOST.startswith(\"myvm\")"));
        assert_eq!(runner.with_arg("status").len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_config_stops_fail_fast_run() {
        let (dir, settings) = workspace();
        let broken = dir.path().join("cfg").join("reqmon");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("config.py"), b"\xff\xfe").unwrap();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        let err = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .with_fail_fast(true)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::RewriteFailed { .. })
        ));
        assert!(runner.with_arg("status").is_empty());
    }

    #[tokio::test]
    async fn test_update_cert_widens_copies_restores() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);

        PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&DeployConfig::new("myvm", "HG1908a"))
            .await
            .unwrap();

        let commands = runner.commands();
        let widen = runner.with_arg(CERT_MODE_WRITABLE);
        let restore = runner.with_arg(CERT_MODE_RESTRICTED);
        let copies: Vec<&CommandSpec> = commands
            .iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("cp"))
            .collect();
        assert_eq!(widen.len(), 6);
        assert_eq!(restore.len(), 6);
        assert_eq!(copies.len(), 12);

        let last_widen = commands.iter().rposition(|c| c.args.iter().any(|a| a == CERT_MODE_WRITABLE));
        let first_copy = commands.iter().position(|c| c.args.first().map(String::as_str) == Some("cp"));
        let first_restore = commands.iter().position(|c| c.args.iter().any(|a| a == CERT_MODE_RESTRICTED));
        assert!(last_widen < first_copy && first_copy < first_restore);
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_run_continues() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch").failing("patch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a")
            .with_deployment_patches(split_list("5906"));

        let reports = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .execute(&config)
            .await
            .unwrap();

        let patch_dep = reports.iter().find(|r| r.phase == Phase::PatchDep).unwrap();
        assert!(patch_dep.has_failures());
        assert_eq!(patch_dep.commands[0].code, Some(1));
        assert_eq!(reports.last().map(|r| r.phase), Some(Phase::StatusService));
    }

    #[tokio::test]
    async fn test_fail_fast_stops_at_first_failure() {
        let (_dir, settings) = workspace();
        let runner = RecordingRunner::new("othervm.cern.ch").failing("patch");
        let fetcher = EchoFetcher::new();
        let confirmer = AssumeYes::new(false);
        let config = DeployConfig::new("myvm", "HG1908a")
            .with_deployment_patches(split_list("5906 5934"));

        let err = PipelineService::new(&settings, &runner, &fetcher, &confirmer)
            .with_fail_fast(true)
            .execute(&config)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CommandError>(),
            Some(CommandError::NonZeroExit { .. })
        ));
        assert_eq!(runner.with_arg("-p1").len(), 1);
        assert!(runner.with_arg("image").is_empty());
    }

    #[tokio::test]
    async fn test_init_setup_is_opt_in() {
        let (_dir, settings) = workspace();
        let fetcher = EchoFetcher::new();
        let config = DeployConfig::new("myvm", "HG1908a");

        let skipped = RecordingRunner::new("othervm.cern.ch");
        PipelineService::new(&settings, &skipped, &fetcher, &AssumeYes::new(false))
            .execute(&config)
            .await
            .unwrap();
        assert!(skipped.with_arg("yum").is_empty());

        let opted = RecordingRunner::new("othervm.cern.ch");
        PipelineService::new(&settings, &opted, &fetcher, &AssumeYes::new(true))
            .execute(&config)
            .await
            .unwrap();
        let yum = opted.with_arg("yum");
        assert_eq!(yum.len(), 1);
        assert!(yum[0].args.iter().any(|a| a == "zsh"));
        assert!(opted.with_arg("system/devvm").len() == 1);
    }
}
