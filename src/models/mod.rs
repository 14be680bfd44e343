//! Registered statistics consumers.
//!
//! One sweep can drive several independent channels; each registered model
//! decides what it does with its channel's data.

pub mod model;
pub mod registry;

pub use model::*;
pub use registry::*;
