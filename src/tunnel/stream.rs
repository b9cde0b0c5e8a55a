//! The connection-shaped object handed to tunnel users.
//!
//! Reads come from the per-stream byte pipe the link demuxer feeds;
//! writes are framed as `Data` packets through a write handle bound to
//! this stream's ID. Shutting the stream down emits a `Close` packet so
//! the peer's read side observes end-of-stream.

use super::framed::PacketWriter;
use super::pipe::PipeReader;
use super::{TunnelError, MAX_DATA_LEN};
use crate::net::Connection;
use bytes::Bytes;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

type FrameFuture = Pin<Box<dyn Future<Output = Result<(), TunnelError>> + Send>>;

/// A virtual circuit multiplexed over a link.
///
/// Implements `AsyncRead` and `AsyncWrite`, so users treat it exactly
/// like a socket. Writes are accepted eagerly and flushed as frames;
/// an error from an accepted frame surfaces on the next write or flush.
pub struct TunnelStream {
    id: u64,
    reader: PipeReader,
    writer: PacketWriter,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    in_flight: Option<FrameFuture>,
    close_frame: Option<FrameFuture>,
    shutdown_done: bool,
}

impl TunnelStream {
    pub(crate) fn new(
        id: u64,
        reader: PipeReader,
        writer: PacketWriter,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            reader,
            writer,
            local_addr,
            peer_addr,
            in_flight: None,
            close_frame: None,
            shutdown_done: false,
        }
    }

    /// ID of this stream on its link.
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Drive the pending data frame, if any, to completion.
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(fut) = self.in_flight.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(result) => {
                    self.in_flight = None;
                    if let Err(e) = result {
                        return Poll::Ready(Err(e.into()));
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();

        match me.poll_in_flight(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if me.shutdown_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream shut down",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(MAX_DATA_LEN);
        let data = Bytes::copy_from_slice(&buf[..n]);
        let writer = me.writer.clone();
        me.in_flight = Some(Box::pin(async move { writer.write_data(data).await }));

        // Kick the frame off; completion is observed by later calls.
        if let Poll::Ready(Err(e)) = me.poll_in_flight(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_in_flight(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();

        match me.poll_in_flight(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                // Link already failed; nothing left to tell the peer.
                me.reader.close();
                me.shutdown_done = true;
                return Poll::Ready(Ok(()));
            }
            Poll::Pending => return Poll::Pending,
        }

        if me.shutdown_done {
            return Poll::Ready(Ok(()));
        }

        if me.close_frame.is_none() {
            me.reader.close();
            let writer = me.writer.clone();
            me.close_frame = Some(Box::pin(async move { writer.write_close().await }));
        }

        let Some(fut) = me.close_frame.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                me.close_frame = None;
                me.shutdown_done = true;
                if let Err(e) = result {
                    trace!("stream {} close frame not delivered: {}", me.id, e);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Connection for TunnelStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer_addr)
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        // A dropped stream still owes the peer a Close frame; send it from
        // a detached task when the runtime is available.
        if !self.shutdown_done && !self.writer.is_failed() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let writer = self.writer.clone();
                handle.spawn(async move {
                    let _ = writer.write_close().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::packet::{Packet, PacketCodec};
    use crate::tunnel::{pipe, BoxedLinkIo, PacketSink};
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Decoder;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    async fn read_packet(io: &mut (impl tokio::io::AsyncRead + Unpin)) -> Packet {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::new();
        loop {
            if let Some(pkt) = codec.decode(&mut buf).unwrap() {
                return pkt;
            }
            if io.read_buf(&mut buf).await.unwrap() == 0 {
                panic!("link closed before a packet arrived");
            }
        }
    }

    fn test_stream(id: u64) -> (TunnelStream, crate::tunnel::PipeWriter, tokio::io::DuplexStream)
    {
        let (near, far) = tokio::io::duplex(65536);
        let (_r, w) = tokio::io::split(Box::new(near) as BoxedLinkIo);
        let sink = PacketSink::new(w);
        let (pipe_tx, pipe_rx) = pipe(8);
        let stream = TunnelStream::new(
            id,
            pipe_rx,
            PacketWriter::new(sink, id),
            addr(1000),
            addr(2000),
        );
        (stream, pipe_tx, far)
    }

    #[tokio::test]
    async fn test_write_frames_data() {
        let (mut stream, _pipe_tx, mut far) = test_stream(5);

        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        assert_eq!(
            read_packet(&mut far).await,
            Packet::Data {
                id: 5,
                data: Bytes::from_static(b"hello")
            }
        );
    }

    #[tokio::test]
    async fn test_read_delegates_to_pipe() {
        let (mut stream, pipe_tx, _far) = test_stream(5);

        pipe_tx.send(Bytes::from_static(b"inbound")).await.unwrap();
        drop(pipe_tx);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "inbound");
    }

    #[tokio::test]
    async fn test_shutdown_emits_close() {
        let (mut stream, pipe_tx, mut far) = test_stream(9);

        stream.shutdown().await.unwrap();
        assert_eq!(read_packet(&mut far).await, Packet::Close { id: 9 });

        // Read side is closed as well
        assert!(pipe_tx.send(Bytes::from_static(b"late")).await.is_err());

        // Writing after shutdown fails
        assert!(stream.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_drop_emits_close() {
        let (stream, _pipe_tx, mut far) = test_stream(11);

        drop(stream);
        assert_eq!(read_packet(&mut far).await, Packet::Close { id: 11 });
    }

    #[tokio::test]
    async fn test_large_write_is_chunked() {
        let (mut stream, _pipe_tx, mut far) = test_stream(3);

        let big = vec![0x5Au8; MAX_DATA_LEN + 100];
        let reader = tokio::spawn(async move {
            let first = read_packet(&mut far).await;
            let second = read_packet(&mut far).await;
            (first, second)
        });

        stream.write_all(&big).await.unwrap();
        stream.flush().await.unwrap();

        let (first, second) = reader.await.unwrap();
        match (first, second) {
            (Packet::Data { data: a, .. }, Packet::Data { data: b, .. }) => {
                assert_eq!(a.len(), MAX_DATA_LEN);
                assert_eq!(b.len(), 100);
            }
            other => panic!("expected two data packets, got {:?}", other),
        }
    }
}
