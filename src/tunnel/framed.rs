//! The shared write half of a link.
//!
//! Many stream writers share one underlying byte stream; a mutex
//! serializes whole frames so concurrent writers cannot interleave bytes
//! within a frame. A write error is terminal: the sink is poisoned and
//! every later send fails fast.

use super::packet::{Packet, PacketCodec};
use super::{BoxedLinkIo, TunnelError};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;

struct SinkInner {
    io: Mutex<WriteHalf<BoxedLinkIo>>,
    failed: AtomicBool,
}

/// Serialized packet writer over one link.
#[derive(Clone)]
pub struct PacketSink {
    inner: Arc<SinkInner>,
}

impl PacketSink {
    pub fn new(io: WriteHalf<BoxedLinkIo>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                io: Mutex::new(io),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Emit one frame atomically with respect to every other send.
    pub async fn send(&self, pkt: Packet) -> Result<(), TunnelError> {
        if self.is_failed() {
            return Err(TunnelError::LinkClosed);
        }

        let mut buf = BytesMut::new();
        PacketCodec.encode(pkt, &mut buf)?;

        let mut io = self.inner.io.lock().await;
        if self.is_failed() {
            return Err(TunnelError::LinkClosed);
        }
        if let Err(e) = io.write_all(&buf).await {
            self.fail();
            return Err(e.into());
        }
        if let Err(e) = io.flush().await {
            self.fail();
            return Err(e.into());
        }
        Ok(())
    }

    /// Poison the sink; subsequent sends fail with `LinkClosed`.
    pub fn fail(&self) {
        self.inner.failed.store(true, Ordering::Release);
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Poison the sink and shut the write half down.
    pub async fn shutdown(&self) {
        self.fail();
        let mut io = self.inner.io.lock().await;
        io.shutdown().await.ok();
    }
}

/// Write-only handle bound to one stream ID.
///
/// Cheap to clone: it shares the underlying stream and write lock with
/// the sink it was cloned from, and pre-tags every frame it emits.
#[derive(Clone)]
pub struct PacketWriter {
    sink: PacketSink,
    id: u64,
}

impl PacketWriter {
    pub fn new(sink: PacketSink, id: u64) -> Self {
        Self { sink, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_failed(&self) -> bool {
        self.sink.is_failed()
    }

    /// Frame `data` as a `Data` packet for this stream.
    pub async fn write_data(&self, data: Bytes) -> Result<(), TunnelError> {
        self.sink.send(Packet::Data { id: self.id, data }).await
    }

    /// Tell the peer this stream is closed.
    pub async fn write_close(&self) -> Result<(), TunnelError> {
        self.sink.send(Packet::Close { id: self.id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::packet::PacketCodec;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::Decoder;

    async fn read_packet(io: &mut (impl tokio::io::AsyncRead + Unpin), buf: &mut BytesMut) -> Packet {
        let mut codec = PacketCodec;
        loop {
            if let Some(pkt) = codec.decode(buf).unwrap() {
                return pkt;
            }
            if io.read_buf(buf).await.unwrap() == 0 {
                panic!("link closed before a packet arrived");
            }
        }
    }

    #[tokio::test]
    async fn test_writer_tags_frames() {
        let (near, mut far) = tokio::io::duplex(4096);
        let (_r, w) = tokio::io::split(Box::new(near) as BoxedLinkIo);
        let sink = PacketSink::new(w);
        let writer = PacketWriter::new(sink, 17);

        writer.write_data(Bytes::from_static(b"abc")).await.unwrap();
        writer.write_close().await.unwrap();

        let mut buf = BytesMut::new();
        assert_eq!(
            read_packet(&mut far, &mut buf).await,
            Packet::Data {
                id: 17,
                data: Bytes::from_static(b"abc")
            }
        );
        assert_eq!(read_packet(&mut far, &mut buf).await, Packet::Close { id: 17 });
    }

    #[tokio::test]
    async fn test_failed_sink_rejects_sends() {
        let (near, _far) = tokio::io::duplex(4096);
        let (_r, w) = tokio::io::split(Box::new(near) as BoxedLinkIo);
        let sink = PacketSink::new(w);

        sink.fail();
        let err = sink.send(Packet::Close { id: 1 }).await.unwrap_err();
        assert!(matches!(err, TunnelError::LinkClosed));
    }
}
