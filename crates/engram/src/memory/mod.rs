//! Memory data model and retrieval

pub mod retrieval;
pub mod tombstone;
pub mod types;
