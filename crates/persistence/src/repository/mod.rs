//! Repository implementations for database operations

pub mod combos;
pub mod markets;
pub mod runs;

pub use combos::*;
pub use markets::*;
pub use runs::*;
