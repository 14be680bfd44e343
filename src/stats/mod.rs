//! Per-point statistics aggregation.

pub mod running;

pub use running::*;
