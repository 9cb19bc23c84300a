//! # Tiered Link
//!
//! A connection-oriented server, and a companion client, exchanging typed messages over
//! plain TCP or TLS.
//!
//! ## Features
//! - Framed binary protocol with a CRC-16 trailer and version gating
//! - Three priority tiers for incoming and outgoing traffic, each served by an
//!   auto-scaling worker pool
//! - Outgoing retry with per-priority backoff; messages for offline clients are kept in
//!   memory and replayed when the client reconnects under its previous id
//! - Chunked file transfer with per-chunk and whole-file SHA-256 verification
//! - TOML/env configuration, `tracing` logging and runtime counters
//!
//! ## Example
//! ```no_run
//! use tiered_link::config::NetworkConfig;
//! use tiered_link::protocol::message::Priority;
//! use tiered_link::service::client::Client;
//! use tiered_link::service::server::Server;
//!
//! # async fn run() -> tiered_link::error::Result<()> {
//! let mut server = Server::new(NetworkConfig::default())?;
//! server.start(false).await?;
//!
//! let client = Client::connect("127.0.0.1:9000").await?;
//! client.send_message("hello", Priority::High).await?;
//! client.close().await;
//!
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::message::{ClientId, CommunicationData, Content, InfoType, Priority};
pub use service::client::Client;
pub use service::server::Server;
