//! # Service Layer
//!
//! Everything above the wire format:
//!
//! - [`registry`]: live connections and their write halves
//! - [`pool`]: the auto-scaling priority worker pools
//! - [`delivery`]: outgoing retry with backoff and offline resume queues
//! - [`transfer`]: chunked file transfer, both directions
//! - [`server`]: the server shell tying the above to TCP and TLS listeners
//! - [`client`]: a companion client speaking the same protocol

pub mod client;
pub mod delivery;
pub mod pool;
pub mod registry;
pub mod server;
pub mod transfer;
