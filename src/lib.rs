//! # Burrow
//!
//! A reverse-tunnel multiplexer: many independent virtual circuits carried
//! over a single authenticated link between two peers.
//!
//! One peer (the client) dials out, the other (the server) accepts. Either
//! side can open logical streams over the established link; a routing
//! registry maps destination domains to the link that advertised them, so
//! a request for `svc.local:80` is dispatched into the right tunnel and
//! the caller receives a stream object indistinguishable from a direct
//! socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Endpoint                          │
//! │     (client dial loop / server accept loop, TLS)     │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel loop                        │
//! │   (stream IDs, demultiplexing, per-stream pipes)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Framed transport                    │
//! │        (length-prefixed packets, write lock)         │
//! ├─────────────────────────────────────────────────────┤
//! │                      Link                            │
//! │               (TCP or mutual TLS)                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The [`router::Router`] sits beside the stack: tunnel loops publish the
//! domains their peer advertised, and [`net::Network`] capabilities hand
//! out connections without callers knowing whether the dial went direct or
//! through a link.

pub mod config;
pub mod endpoint;
pub mod net;
pub mod router;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
