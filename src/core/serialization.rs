//! # Serialization Formats
//!
//! Abstraction over the payload serialization used inside protocol frames.
//! Supports bincode (default), JSON (debugging/interop), and MessagePack (compact encoding).
//!
//! Framing never looks inside the payload: the [`PacketCodec`](crate::core::codec::PacketCodec)
//! only talks to a [`PayloadSerializer`], so swapping the format does not touch the header,
//! length or checksum logic.
//!
//! ## Performance Characteristics
//! - **Bincode**: fastest, binary
//! - **MessagePack**: compact, binary
//! - **JSON**: human-readable, text (chunk data is encoded as number arrays)

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::protocol::message::CommunicationData;

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Get the format identifier byte
    pub fn format_byte(self) -> u8 {
        match self {
            SerializationFormat::Bincode => 0x01,
            SerializationFormat::Json => 0x02,
            SerializationFormat::MessagePack => 0x03,
        }
    }

    /// Detect format from identifier byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(SerializationFormat::Bincode),
            0x02 => Some(SerializationFormat::Json),
            0x03 => Some(SerializationFormat::MessagePack),
            _ => None,
        }
    }

    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Pluggable payload serializer used by the packet codec.
pub trait PayloadSerializer: Send + Sync {
    /// Append the serialized form of `data` to `out`
    fn serialize_into(&self, data: &CommunicationData, out: &mut Vec<u8>) -> Result<()>;

    /// Parse a payload
    fn deserialize(&self, bytes: &[u8]) -> Result<CommunicationData>;

    /// Format identifier, for logging
    fn format(&self) -> SerializationFormat;
}

impl PayloadSerializer for SerializationFormat {
    fn serialize_into(&self, data: &CommunicationData, out: &mut Vec<u8>) -> Result<()> {
        match self {
            SerializationFormat::Bincode => bincode::serialize_into(out, data)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => serde_json::to_writer(out, data)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::encode::write(out, data)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<CommunicationData> {
        CommunicationData::deserialize_format(bytes, *self)
    }

    fn format(&self) -> SerializationFormat {
        *self
    }
}

/// Trait for types that support multiple serialization formats
pub trait MultiFormat: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to bytes using the specified format
    fn serialize_format(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        match format {
            SerializationFormat::Bincode => bincode::serialize(self)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => {
                serde_json::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Deserialize from bytes using the specified format
    fn deserialize_format(data: &[u8], format: SerializationFormat) -> Result<Self> {
        match format {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Priority;

    #[test]
    #[allow(clippy::expect_used)]
    fn test_format_byte_roundtrip() {
        for format in &[
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let byte = format.format_byte();
            let recovered = SerializationFormat::from_byte(byte).expect("valid format byte");
            assert_eq!(*format, recovered);
        }
        assert_eq!(SerializationFormat::from_byte(0x7F), None);
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_every_format_serializes_into_buffer() {
        let msg = CommunicationData::normal("hello", Priority::Low).with_seq(9);
        for format in [
            SerializationFormat::Bincode,
            SerializationFormat::Json,
            SerializationFormat::MessagePack,
        ] {
            let mut out = vec![0xAA];
            format.serialize_into(&msg, &mut out).expect("serialize");
            assert_eq!(out[0], 0xAA, "{} must append", format.name());
            let back = PayloadSerializer::deserialize(&format, &out[1..]).expect("deserialize");
            assert_eq!(back, msg);
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_format_sizes() {
        let msg = CommunicationData::normal("size check", Priority::High);

        let json_size = msg
            .serialize_format(SerializationFormat::Json)
            .expect("json")
            .len();
        let msgpack_size = msg
            .serialize_format(SerializationFormat::MessagePack)
            .expect("msgpack")
            .len();

        // MessagePack should be more compact than JSON
        assert!(msgpack_size < json_size);
    }

    #[test]
    fn test_garbage_is_deserialize_error() {
        let result = PayloadSerializer::deserialize(&SerializationFormat::Json, b"{not json");
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }
}
