pub mod classify;
pub mod combos;
pub mod detectors;
pub mod sanitize;

#[cfg(test)]
mod test_support;

pub use classify::*;
pub use combos::*;
pub use detectors::*;
pub use sanitize::*;
