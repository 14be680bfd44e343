//! Measurement sources that need no hardware.

pub mod simulate;

pub use simulate::*;
