//! Input/output helpers.
//!
//! - scan-definition JSON (`config`)
//! - results JSON read/write (`results`)
//! - per-point CSV export (`export`)

pub mod config;
pub mod export;
pub mod results;

pub use config::*;
pub use export::*;
pub use results::*;
