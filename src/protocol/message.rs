//! Message payload carried inside every protocol frame.
//!
//! [`CommunicationData`] is the unit the worker pools move around. Its [`Content`] is a sum
//! type, so exactly one kind of content is populated per message and file-transfer fields
//! only exist on the file variants.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::serialization::MultiFormat;

/// Numeric client identifier, assigned monotonically on accept.
pub type ClientId = u64;

/// Delivery tier controlling queue assignment, retry leniency and worker allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn name(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Field-less discriminant of [`Content`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoType {
    Heartbeat,
    Normal,
    FileChunk,
    FileComplete,
    Acknowledgement,
    ChunkAck,
    FileCompleteAck,
    Welcome,
    Reconnect,
}

impl InfoType {
    pub fn name(self) -> &'static str {
        match self {
            InfoType::Heartbeat => "HEARTBEAT",
            InfoType::Normal => "NORMAL",
            InfoType::FileChunk => "FILE_CHUNK",
            InfoType::FileComplete => "FILE_COMPLETE",
            InfoType::Acknowledgement => "ACK",
            InfoType::ChunkAck => "CHUNK_ACK",
            InfoType::FileCompleteAck => "FILE_COMPLETE_ACK",
            InfoType::Welcome => "WELCOME",
            InfoType::Reconnect => "RECONNECT",
        }
    }
}

impl fmt::Display for InfoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One chunk of a file in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_data: Vec<u8>,
    /// Lowercase hex SHA-256 of `chunk_data`
    pub chunk_hash: String,
}

/// Completion marker carrying the whole-file hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileComplete {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// Lowercase hex SHA-256 of the whole file
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Heartbeat,
    Normal {
        message: String,
    },
    FileChunk(FileChunk),
    FileComplete(FileComplete),
    Acknowledgement {
        message: String,
    },
    ChunkAck {
        file_id: String,
        chunk_index: u32,
    },
    FileCompleteAck {
        file_id: String,
        success: bool,
        detail: String,
    },
    /// Sent by the server right after accept, carrying the id assigned to the connection
    Welcome {
        client_id: ClientId,
    },
    /// Sent by a returning client to reclaim its previous id and pending messages
    Reconnect {
        client_id: ClientId,
    },
}

/// Payload of a protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationData {
    pub seq_num: u64,
    pub ack_num: u64,
    pub priority: Priority,
    pub content: Content,
}

impl MultiFormat for CommunicationData {}

impl CommunicationData {
    pub fn new(content: Content, priority: Priority) -> Self {
        Self {
            seq_num: 0,
            ack_num: 0,
            priority,
            content,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Content::Heartbeat, Priority::High)
    }

    pub fn normal<S: Into<String>>(message: S, priority: Priority) -> Self {
        Self::new(
            Content::Normal {
                message: message.into(),
            },
            priority,
        )
    }

    pub fn acknowledgement(ack_num: u64, priority: Priority) -> Self {
        let mut data = Self::new(
            Content::Acknowledgement {
                message: String::from("ACK"),
            },
            priority,
        );
        data.ack_num = ack_num;
        data
    }

    /// Chunk acknowledgements always travel at High so flow control never queues behind bulk data.
    pub fn chunk_ack<S: Into<String>>(file_id: S, chunk_index: u32) -> Self {
        let mut data = Self::new(
            Content::ChunkAck {
                file_id: file_id.into(),
                chunk_index,
            },
            Priority::High,
        );
        data.ack_num = u64::from(chunk_index);
        data
    }

    pub fn file_complete_ack<S: Into<String>>(file_id: S, success: bool, detail: String) -> Self {
        Self::new(
            Content::FileCompleteAck {
                file_id: file_id.into(),
                success,
                detail,
            },
            Priority::High,
        )
    }

    pub fn welcome(client_id: ClientId) -> Self {
        Self::new(Content::Welcome { client_id }, Priority::High)
    }

    pub fn reconnect(client_id: ClientId) -> Self {
        Self::new(Content::Reconnect { client_id }, Priority::High)
    }

    pub fn with_seq(mut self, seq_num: u64) -> Self {
        self.seq_num = seq_num;
        self
    }

    pub fn info_type(&self) -> InfoType {
        match self.content {
            Content::Heartbeat => InfoType::Heartbeat,
            Content::Normal { .. } => InfoType::Normal,
            Content::FileChunk(_) => InfoType::FileChunk,
            Content::FileComplete(_) => InfoType::FileComplete,
            Content::Acknowledgement { .. } => InfoType::Acknowledgement,
            Content::ChunkAck { .. } => InfoType::ChunkAck,
            Content::FileCompleteAck { .. } => InfoType::FileCompleteAck,
            Content::Welcome { .. } => InfoType::Welcome,
            Content::Reconnect { .. } => InfoType::Reconnect,
        }
    }

    /// File traffic is counted separately in the per-client byte counters.
    pub fn is_file_traffic(&self) -> bool {
        matches!(
            self.content,
            Content::FileChunk(_)
                | Content::FileComplete(_)
                | Content::ChunkAck { .. }
                | Content::FileCompleteAck { .. }
        )
    }

    /// Completion messages are sent at most once and never retried.
    pub fn is_completion(&self) -> bool {
        matches!(
            self.content,
            Content::FileComplete(_) | Content::FileCompleteAck { .. }
        )
    }
}
