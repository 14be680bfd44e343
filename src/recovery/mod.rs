//! Mid-run recovery from a lost physical resource: detect, rewind, reacquire.

pub mod hook;
pub mod reacquire;

pub use hook::*;
pub use reacquire::*;
