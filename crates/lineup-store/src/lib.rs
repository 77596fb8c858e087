//! SQLite backend for the lineup sample store.
//!
//! One file holds the subject table and every enrolled face crop as raw
//! 8-bit grayscale pixels.

mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
