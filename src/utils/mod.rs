//! # Utility Modules
//!
//! Supporting utilities used throughout the server.
//!
//! ## Components
//! - **Buffer Pool**: reusable encode buffers
//! - **Logging**: `tracing-subscriber` setup from configuration
//! - **Metrics**: per-server atomic counters
//! - **Timeout**: deadlines and cancellable delays

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod timeout;
