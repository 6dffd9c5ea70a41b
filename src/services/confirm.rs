//! Operator confirmation
//!
//! Gates are answered through [`Confirmer`], so unattended runs and tests can
//! swap the interactive prompt for a fixed answer.

use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};

use crate::domain::phase::Phase;
use crate::domain::plan::{declines, opts_in};

/// Answers phase gates
pub trait Confirmer: Send + Sync {
    /// Proceed gate: `false` stops the whole run
    fn proceed(&self, phase: Phase) -> Result<bool>;

    /// Opt-in gate: `true` runs the phase, `false` skips it
    fn opt_in(&self, phase: Phase) -> Result<bool>;
}

/// Asks on stdout and reads one line from stdin per gate
#[derive(Debug, Default)]
pub struct StdinConfirmer;

impl StdinConfirmer {
    pub fn new() -> Self {
        Self
    }

    fn ask(&self, phase: Phase) -> Result<String> {
        print!("{}", phase.prompt());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin()
            .lock()
            .read_line(&mut input)
            .with_context(|| format!("Failed to read answer for {}", phase.name()))?;
        Ok(input)
    }
}

impl Confirmer for StdinConfirmer {
    fn proceed(&self, phase: Phase) -> Result<bool> {
        Ok(!declines(&self.ask(phase)?))
    }

    fn opt_in(&self, phase: Phase) -> Result<bool> {
        Ok(opts_in(&self.ask(phase)?))
    }
}

/// Unattended answers: proceed everywhere, opt in only when asked to
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes {
    pub init_setup: bool,
}

impl AssumeYes {
    pub fn new(init_setup: bool) -> Self {
        Self { init_setup }
    }
}

impl Confirmer for AssumeYes {
    fn proceed(&self, _phase: Phase) -> Result<bool> {
        Ok(true)
    }

    fn opt_in(&self, _phase: Phase) -> Result<bool> {
        Ok(self.init_setup)
    }
}

/// Interactive gates, except the initial setup which is forced on
#[derive(Debug, Default)]
pub struct ForcedInit<C> {
    inner: C,
}

impl<C: Confirmer> ForcedInit<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: Confirmer> Confirmer for ForcedInit<C> {
    fn proceed(&self, phase: Phase) -> Result<bool> {
        self.inner.proceed(phase)
    }

    fn opt_in(&self, _phase: Phase) -> Result<bool> {
        Ok(true)
    }
}
