//! Traversal strategies: finite flat, finite grid and unbounded continuous.

pub mod traversal;

pub use traversal::*;
