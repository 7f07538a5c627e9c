//! Store implementations
//!
//! [`InMemoryStore`] backs tests and one-shot runs; the SQLite store lives in
//! [`crate::database`] behind the `database` feature.

pub mod memory;

pub use memory::InMemoryStore;
