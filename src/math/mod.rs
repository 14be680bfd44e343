//! Mathematical utilities: weighted least squares and point grids.

pub mod grid;
pub mod ols;

pub use grid::*;
pub use ols::*;
