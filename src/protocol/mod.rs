//! # Protocol Layer
//!
//! Message payload types and the message-kind dispatch table used by the incoming
//! worker pools.

pub mod dispatcher;
pub mod message;
