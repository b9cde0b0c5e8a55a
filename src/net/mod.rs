//! Dial targets and the polymorphic network capability.
//!
//! A [`Network`] knows how to dial a [`Location`]. The direct
//! implementation goes straight to the host OS; tunnel-bound
//! implementations (see [`crate::tunnel::TunNetwork`]) open a virtual
//! circuit over a live link instead. The router hands out capability
//! values, so callers never branch on which kind they got.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A dial target: network family plus host and port.
///
/// The network family (`"tcp"`, ...) is carried alongside the address but
/// does not take part in formatting; `Display` renders `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub network: String,
    pub host: String,
    pub port: u16,
}

impl Location {
    pub fn new(network: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            network: network.into(),
            host: host.into(),
            port,
        }
    }

    /// Shorthand for a TCP target.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new("tcp", host, port)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A connection-shaped object: a byte stream with address accessors.
///
/// Implemented by plain sockets and by tunnel streams alike, so the user
/// of a dialed connection cannot tell the two apart.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Connection")
            .field("local_addr", &self.local_addr().ok())
            .field("peer_addr", &self.peer_addr().ok())
            .finish()
    }
}

impl Connection for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Boxed connection returned from [`Network::dial`].
pub type BoxedConn = Box<dyn Connection>;

/// Uniform dial interface.
#[async_trait]
pub trait Network: Send + Sync {
    /// Open a connection to `loc`.
    async fn dial(&self, loc: &Location) -> io::Result<BoxedConn>;

    /// Owner identity for router bookkeeping; 0 is the direct network.
    fn id(&self) -> u64;
}

/// Dials the host OS network directly.
#[derive(Debug, Default)]
pub struct DirectNetwork;

#[async_trait]
impl Network for DirectNetwork {
    async fn dial(&self, loc: &Location) -> io::Result<BoxedConn> {
        debug!("direct dial {}@{}", loc.network, loc);
        let stream = TcpStream::connect((loc.host.as_str(), loc.port)).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }

    fn id(&self) -> u64 {
        0
    }
}

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity for router ownership. Never returns 0, which
/// is reserved for the direct network.
pub fn next_owner_id() -> u64 {
    NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let loc = Location::tcp("svc.local", 80);
        assert_eq!(loc.to_string(), "svc.local:80");
        assert_eq!(loc.network, "tcp");
    }

    #[test]
    fn test_owner_ids_unique() {
        let a = next_owner_id();
        let b = next_owner_id();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
