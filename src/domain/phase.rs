//! Pipeline phase types
//!
//! Defines the VM deployment workflow as a fixed sequence of gated phases.

use std::time::Duration;

/// Individual phases of a VM deployment, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Install OS packages and bootstrap the system area (opt-in)
    InitSetup,
    /// Stop services and wipe the work dir
    CleanVm,
    /// Fresh checkout of the deployment scripts at the requested tag
    CloneDep,
    /// Add this VM to the threaded (CherryPy) host condition
    EnableCherrypy,
    /// Apply pull requests to the deployment scripts
    PatchDep,
    /// Install the requested components
    ServiceDeployment,
    /// Replace the per-service certificates
    UpdateCert,
    /// Apply pull requests to the installed services
    PatchService,
    /// Start every installed service
    StartService,
    /// Report the state of every installed service
    StatusService,
}

/// How the operator is consulted before a phase runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Runs only on an explicit yes
    OptIn,
    /// Runs unless the operator says no; a no aborts the whole run
    Proceed,
    /// Runs without asking
    None,
}

impl Phase {
    /// Every phase in execution order
    pub const ALL: [Phase; 10] = [
        Phase::InitSetup,
        Phase::CleanVm,
        Phase::CloneDep,
        Phase::EnableCherrypy,
        Phase::PatchDep,
        Phase::ServiceDeployment,
        Phase::UpdateCert,
        Phase::PatchService,
        Phase::StartService,
        Phase::StatusService,
    ];

    /// Name used in logs, summaries and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitSetup => "initSetup",
            Self::CleanVm => "cleanVM",
            Self::CloneDep => "cloneDep",
            Self::EnableCherrypy => "enableCherrypy",
            Self::PatchDep => "patchDep",
            Self::ServiceDeployment => "serviceDeployment",
            Self::UpdateCert => "updateCert",
            Self::PatchService => "patchService",
            Self::StartService => "startService",
            Self::StatusService => "statusService",
        }
    }

    /// Banner printed when the phase starts
    pub fn banner(&self) -> &'static str {
        match self {
            Self::InitSetup => "Installing OS packages and bootstrapping the system area",
            Self::CleanVm => "Stopping services and cleaning up the VM",
            Self::CloneDep => "Cloning the deployment scripts",
            Self::EnableCherrypy => "Enabling CherryPy threading for this host",
            Self::PatchDep => "Applying deployment script patches",
            Self::ServiceDeployment => "Deploying services",
            Self::UpdateCert => "Replacing service certificates",
            Self::PatchService => "Applying service patches",
            Self::StartService => "Starting services",
            Self::StatusService => "Checking service status",
        }
    }

    /// Question asked at the gate
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::InitSetup => "Run the one-time OS setup (only needed on a fresh VM)? [y/N] ",
            Self::CleanVm => "Stop all services and wipe the work area? [Y/n] ",
            Self::CloneDep => "Archive the current checkout and clone the deployment scripts? [Y/n] ",
            Self::EnableCherrypy => "Add this host to the threaded configuration? [Y/n] ",
            Self::PatchDep => "Apply the deployment script patches? [Y/n] ",
            Self::ServiceDeployment => "Deploy the services? [Y/n] ",
            Self::UpdateCert => "Replace the service certificates? [Y/n] ",
            Self::PatchService => "Apply the service patches? [Y/n] ",
            Self::StartService | Self::StatusService => "",
        }
    }

    /// Gate in front of the phase
    pub fn gate(&self) -> Gate {
        match self {
            Self::InitSetup => Gate::OptIn,
            Self::StartService | Self::StatusService => Gate::None,
            _ => Gate::Proceed,
        }
    }

    /// 1-based position for "step N/10" banners
    pub fn position(&self) -> usize {
        Self::ALL
            .iter()
            .position(|p| p == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

/// Outcome of a single external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// Rendered command line
    pub command: String,
    /// Exit code; `None` when the process was killed by a signal or never started
    pub code: Option<i32>,
}

impl CommandRecord {
    pub fn new(command: impl Into<String>, code: Option<i32>) -> Self {
        Self {
            command: command.into(),
            code,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// What happened to a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Body ran (individual commands may still have failed)
    Completed,
    /// Body did not run
    Skipped(String),
    /// Operator said no; the run stops here
    Declined,
}

/// Result of one phase
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub duration: Duration,
    pub commands: Vec<CommandRecord>,
}

impl PhaseReport {
    pub fn completed(phase: Phase, duration: Duration, commands: Vec<CommandRecord>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Completed,
            duration,
            commands,
        }
    }

    pub fn skipped(phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped(reason.into()),
            duration: Duration::ZERO,
            commands: Vec::new(),
        }
    }

    pub fn declined(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Declined,
            duration: Duration::ZERO,
            commands: Vec::new(),
        }
    }

    /// Commands that did not exit cleanly
    pub fn failed_commands(&self) -> impl Iterator<Item = &CommandRecord> {
        self.commands.iter().filter(|c| !c.success())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_commands().next().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let names: Vec<_> = Phase::ALL.iter().map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "initSetup",
                "cleanVM",
                "cloneDep",
                "enableCherrypy",
                "patchDep",
                "serviceDeployment",
                "updateCert",
                "patchService",
                "startService",
                "statusService"
            ]
        );
    }

    #[test]
    fn test_gates() {
        assert_eq!(Phase::InitSetup.gate(), Gate::OptIn);
        assert_eq!(Phase::StartService.gate(), Gate::None);
        assert_eq!(Phase::StatusService.gate(), Gate::None);
        let proceed = Phase::ALL
            .iter()
            .filter(|p| p.gate() == Gate::Proceed)
            .count();
        assert_eq!(proceed, 7);
    }

    #[test]
    fn test_position() {
        assert_eq!(Phase::InitSetup.position(), 1);
        assert_eq!(Phase::StatusService.position(), 10);
    }

    #[test]
    fn test_report_failures() {
        let report = PhaseReport::completed(
            Phase::PatchDep,
            Duration::from_secs(1),
            vec![
                CommandRecord::new("patch -d /data/cfg -p1", Some(0)),
                CommandRecord::new("patch -d /data/cfg -p1", Some(1)),
            ],
        );
        assert!(report.has_failures());
        assert_eq!(report.failed_commands().count(), 1);
        assert!(!PhaseReport::skipped(Phase::PatchDep, "no patches").has_failures());
    }
}
