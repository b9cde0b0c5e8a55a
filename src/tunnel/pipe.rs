//! Bounded in-process byte pipe.
//!
//! The write end is fed by the tunnel loop demultiplexer; the read end
//! backs a piped connection. A full pipe blocks the producer, pushing
//! back-pressure onto the link reader. Dropping the reader fails pending
//! and subsequent sends; dropping the writer lets the reader drain what
//! is buffered and then observe end-of-stream.

use bytes::{Buf, Bytes};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

/// The read end of the pipe is gone.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("pipe closed")]
pub struct PipeClosed;

/// Create a pipe buffering up to `capacity` chunks.
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            leftover: Bytes::new(),
        },
    )
}

/// Producer half of the pipe.
#[derive(Clone, Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
}

impl PipeWriter {
    /// Queue `data` for the reader, waiting for capacity.
    pub async fn send(&self, data: Bytes) -> Result<(), PipeClosed> {
        self.tx.send(data).await.map_err(|_| PipeClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the pipe; an `AsyncRead` over the queued chunks.
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

impl PipeReader {
    /// Stop accepting data; pending and subsequent sends fail. Already
    /// buffered chunks remain readable.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.leftover.is_empty() {
                let n = buf.remaining().min(me.leftover.len());
                buf.put_slice(&me.leftover[..n]);
                me.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }

            match me.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => me.leftover = chunk,
                // All writers gone: end of stream
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_then_read() {
        let (tx, mut rx) = pipe(4);
        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_partial_reads_across_chunks() {
        let (tx, mut rx) = pipe(4);
        tx.send(Bytes::from_static(b"abcdef")).await.unwrap();

        let mut buf = [0u8; 4];
        rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");

        let mut rest = [0u8; 2];
        rx.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn test_eof_after_writer_drop() {
        let (tx, mut rx) = pipe(4);
        drop(tx);

        let mut buf = [0u8; 8];
        assert_eq!(rx.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_fails_after_reader_close() {
        let (tx, mut rx) = pipe(4);
        rx.close();
        assert_eq!(tx.send(Bytes::from_static(b"x")).await, Err(PipeClosed));
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_send_fails_after_reader_drop() {
        let (tx, rx) = pipe(4);
        drop(rx);
        assert_eq!(tx.send(Bytes::from_static(b"x")).await, Err(PipeClosed));
    }

    #[tokio::test]
    async fn test_full_pipe_applies_backpressure() {
        let (tx, mut rx) = pipe(1);
        tx.send(Bytes::from_static(b"a")).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tx.send(Bytes::from_static(b"b")),
        )
        .await;
        assert!(pending.is_err(), "send into a full pipe should block");

        let mut buf = [0u8; 1];
        rx.read_exact(&mut buf).await.unwrap();
        tx.send(Bytes::from_static(b"b")).await.unwrap();
    }
}
