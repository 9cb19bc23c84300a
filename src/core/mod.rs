//! # Core Protocol Components
//!
//! Frame layout, checksum, payload serialization and codecs.
//!
//! ## Wire Format
//! ```text
//! [Version(1)] [Reserved(3)] [Length(4, BE)] [Payload(N)] [CRC-16(2, LE)]
//! ```
//!
//! `Length` counts payload plus checksum. A frame that fails any check is dropped on its
//! own; the connection carrying it is not torn down.

pub mod checksum;
pub mod codec;
pub mod packet;
pub mod serialization;
