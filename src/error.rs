//! # Error Types
//!
//! Error handling for the tiered link protocol.
//!
//! Every module reports failures through [`ProtocolError`]. The variants follow the
//! recovery classes the server applies to them:
//!
//! ## Error Categories
//! - **Protocol errors**: bad version, malformed header, checksum mismatch, oversized frame.
//!   The offending frame is dropped and the connection keeps running.
//! - **Transport errors**: socket resets, TLS failures. Fatal to that connection only.
//! - **Delivery errors**: destination offline or send timeout. Absorbed by the retry and
//!   resume machinery, never surfaced to the caller of `send`.
//! - **Integrity errors**: chunk or whole-file hash mismatch.
//! - **Session errors**: invalid operations inside a single file transfer.
//!
//! ## Example Usage
//! ```rust
//! use tiered_link::error::{ProtocolError, Result};
//! use tracing::{error, info};
//!
//! fn checked_len(declared: usize, max: usize) -> Result<usize> {
//!     if declared > max {
//!         return Err(ProtocolError::PacketTooLarge { size: declared, max });
//!     }
//!     Ok(declared)
//! }
//!
//! match checked_len(10, 4) {
//!     Ok(len) => info!(len, "Accepted"),
//!     Err(e) => error!(error = %e, recoverable = e.is_recoverable(), "Rejected"),
//! }
//! ```

use std::io;
use thiserror::Error;

use crate::protocol::message::ClientId;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Transfer session errors
    pub const ERR_MISSING_CHUNK: &str = "Missing chunk during reassembly";
    pub const ERR_CHUNK_COUNT: &str = "Completion chunk count differs from session";
    pub const ERR_FILE_HASH: &str = "Whole-file hash mismatch";

    /// Pool lifecycle errors
    pub const ERR_POOL_NOT_STOPPED: &str = "Pool can only be started from the stopped state";

    /// Server lifecycle errors
    pub const ERR_SERVER_RUNNING: &str = "Server is already running";
    pub const ERR_TLS_ADDRESS: &str = "TLS configured without a TLS listen address";
}

/// Primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Declared message length {declared} does not match {actual} trailing bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch: expected {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Client {0} is not connected")]
    ClientNotConnected(ClientId),

    #[error("Chunk {chunk_index} of transfer {file_id} failed hash verification")]
    ChunkHashMismatch { file_id: String, chunk_index: u32 },

    #[error("Integrity failure for transfer {file_id}: {reason}")]
    IntegrityFailure { file_id: String, reason: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Transfer {file_id} incomplete: {missing} chunk(s) never acknowledged")]
    TransferIncomplete { file_id: String, missing: usize },

    #[error("Unexpected message type")]
    UnexpectedMessage,

    #[error("Worker pool error: {0}")]
    PoolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Protocol-level errors only invalidate a single frame; the connection stays up.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::ChecksumMismatch { .. }
                | ProtocolError::PacketTooLarge { .. }
                | ProtocolError::DeserializeError(_)
        )
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(e: bincode::Error) -> Self {
        ProtocolError::SerializeError(e.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
