//! Client for the external session gateway: the black box that actually
//! runs agent sessions. Spawn goes out as an RPC; completion comes back on
//! the orchestrator's webhooks.

pub mod client;
pub mod error;
pub mod types;

pub use client::*;
pub use error::*;
pub use types::*;
