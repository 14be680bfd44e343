//! Scan orchestration: the state machine and the collaborators it drives.

pub mod collaborators;
pub mod orchestrator;

pub use collaborators::*;
pub use orchestrator::*;
