//! Services layer - orchestration logic
//!
//! This module coordinates between domain logic and infrastructure.
//! Services use infrastructure adapters to perform I/O operations.

pub mod confirm;
pub mod pipeline;

// Re-export commonly used types
pub use confirm::{AssumeYes, Confirmer, ForcedInit, StdinConfirmer};
pub use pipeline::PipelineService;
