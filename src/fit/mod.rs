//! Curve fitting.
//!
//! Responsibilities:
//!
//! - built-in fit functions and their automatic guesses
//! - the pluggable numerical backend (grid search + weighted OLS by default)
//! - guess/scale/bound/hold resolution and validation

pub mod backend;
pub mod functions;
pub mod pipeline;
pub mod validate;

pub use backend::*;
pub use functions::*;
pub use pipeline::*;
pub use validate::*;
