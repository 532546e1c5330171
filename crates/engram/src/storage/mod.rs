//! Storage layer: LanceDB persistence, query filters, ephemeral cache

pub mod cache;
pub mod filter;
pub mod lance;

pub use cache::TtlCache;
pub use filter::RecordFilter;
pub use lance::LanceStore;
