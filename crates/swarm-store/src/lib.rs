//! Durable-store primitives shared by every stateful subsystem: atomic
//! single-file JSON, append-only JSONL shards, and per-path write locks.

pub mod error;
pub mod json;
pub mod jsonl;
pub mod lock;

pub use error::*;
pub use json::*;
pub use jsonl::*;
pub use lock::*;
