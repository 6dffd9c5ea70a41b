//! Domain layer - pure deployment logic
//!
//! This module contains the phase vocabulary and planning helpers, with no
//! external I/O. Types and functions here can be unit tested without mocking.

pub mod phase;
pub mod plan;

// Re-export commonly used types
pub use phase::{CommandRecord, Gate, Phase, PhaseReport, PhaseStatus};
