//! Domain types used throughout the engine.
//!
//! This module defines:
//!
//! - points and traversal positions (`Point`, `IterationState`)
//! - run configuration and lifecycle (`ScanSettings`, `ScanState`, `RunOutcome`)
//! - fit and result outputs (`FitResult`, `ChannelResults`)

pub mod types;

pub use types::*;
