//! Tunnel layer: wire packets, the framed link, per-stream pipes and the
//! demultiplexing loop.

mod framed;
mod link;
mod packet;
mod pipe;
mod stream;

pub use framed::{PacketSink, PacketWriter};
pub use link::{Incoming, LinkRole, TunNetwork, TunnelLink};
pub use packet::{Packet, PacketCodec};
pub use pipe::{pipe, PipeClosed, PipeReader, PipeWriter};
pub use stream::TunnelStream;

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("link closed")]
    LinkClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            closed @ TunnelError::LinkClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, closed)
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Byte stream a link runs over (TCP or TLS).
pub trait LinkIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LinkIo for T {}

/// Boxed link transport.
pub type BoxedLinkIo = Box<dyn LinkIo>;

/// Maximum encoded frame size accepted on the wire (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum payload carried by one `Data` packet (64 KiB).
pub const MAX_DATA_LEN: usize = 64 * 1024;

/// Stream ID 0 is never allocated.
pub const RESERVED_STREAM_ID: u64 = 0;

/// Ceiling for the low-32-bit stream counter; past this the counter
/// resets to the link's ID base.
pub const STREAM_COUNTER_LIMIT: u64 = 0x0FFF_FFFF;

/// Capacity (in chunks) of each per-stream byte pipe.
pub const PIPE_CAPACITY: usize = 32;

/// Capacity of the endpoint's inbound stream delivery channel.
pub const INCOMING_CAPACITY: usize = 64;
