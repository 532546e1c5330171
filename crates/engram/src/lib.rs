//! Engram - Tiered associative memory store
//!
//! This crate provides a daemon that accepts natural-language facts and
//! events, embeds and indexes them for semantic retrieval, classifies them
//! into retention tiers, and periodically evicts stale entries while
//! protecting pinned ones.

pub mod api;
pub mod config;
pub mod embedding;
pub mod error;
pub mod maintenance;
pub mod memory;
pub mod storage;
pub mod sync;
pub mod testing;

pub use error::EngramError;
