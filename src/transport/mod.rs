//! Transport wrappers. Plain TCP needs nothing beyond tokio; TLS lives in [`tls`].

pub mod tls;
