//! Infrastructure layer - State store adapters
//!
//! - `JsonFileStore`: one pretty-printed JSON file per document, atomic rewrite
//! - `MemoryStore`: process-local store for tests and ephemeral runs

pub mod json;
pub mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
