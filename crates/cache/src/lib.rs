//! Content-addressed file caching for the stoke build engine
//!
//! This crate provides the persistence layer the memoizer builds on:
//! - An opaque [`Hash`] value with pluggable hash functions ([`HashFn`])
//! - A persistent key → manifest + blobs store ([`FileCache`])
//! - Garbage collection, trimming and statistics over that store
//!
//! # Overview
//!
//! Each cache entry lives in its own subdirectory named after its key and
//! holds a `manifest` file (one logical file name per line) plus one regular
//! file per manifest member storing its content. Entries are written
//! atomically: an entry is staged in a temporary directory inside the cache
//! root and promoted with a single rename, so readers never observe a
//! partial entry.
//!
//! # Keys
//!
//! Keys are short printable ASCII identifiers, in practice the hexadecimal
//! form of an operation hash. The cache itself is agnostic to how keys are
//! derived.

mod error;

pub mod cache;
pub mod hash;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export main types
pub use cache::{CacheStats, FileCache, TrimStats};
pub use hash::{default_hash_fn, Hash, HashFn, Sha2, XxHash3};
