//! `rep-scan` library crate.
//!
//! A parameterized-sweep scan engine: it walks a point space for a number of
//! passes and repeats, aggregates per-point statistics per channel, fits the
//! results, and recovers mid-run from a lost physical resource.
//!
//! The binary (`scan`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the engine can be driven by real hardware instead of the simulator

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod iter;
pub mod math;
pub mod models;
pub mod plot;
pub mod recovery;
pub mod report;
pub mod scan;
pub mod space;
pub mod stats;
