//! mailship-core: Core library for mailship
//!
//! Postfix logs one line per sub-process step, and a single message's
//! lines are interleaved with every other message in flight. This crate
//! correlates those lines by queue id into one aggregate document per mail
//! transaction and keeps the documents up to date in a document store as
//! the transaction progresses across batches.
//!
//! # Architecture
//!
//! ```text
//! maillog → LineSource → Normalizer → event queue
//!                                         ↓ flush
//!              store → Orphan Resolver → WorkingSet → Assembler
//!                                                        ↓
//!                                   store ← Persistence Writer
//! ```
//!
//! # Modules
//!
//! - `parser`: Syslog and Postfix message decoding
//! - `event`: Canonical events and the line normalizer
//! - `document`: Aggregate documents and the working set
//! - `assembler`: Per-sub-process folding rules
//! - `resolver`: Loading stored documents for in-flight queue ids
//! - `persist`: Bulk create/replace of the working set
//! - `controller`: Flush cycle state machine with retry and settle delays
//! - `reader`: Batched file reading with durable bookmarks
//! - `store`: Document store trait, Elasticsearch and in-memory backends
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//! - `retry`: Retry policies
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod assembler;
pub mod config;
pub mod controller;
pub mod document;
pub mod error;
pub mod event;
pub mod logging;
pub mod parser;
pub mod persist;
pub mod reader;
pub mod resolver;
pub mod retry;
pub mod store;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
