//! The per-link tunnel loop.
//!
//! Owns one established link: allocates stream IDs for locally originated
//! circuits, demultiplexes inbound packets into per-stream pipes,
//! publishes peer registrations in the router, and tears everything down
//! when the link dies.
//!
//! The two peers of a link draw stream IDs from disjoint halves of the ID
//! space: the accepting side allocates with the top bit set, the dialing
//! side with it clear, so locally and remotely initiated streams can
//! never collide.

use super::framed::{PacketSink, PacketWriter};
use super::packet::{Packet, PacketCodec};
use super::pipe::{pipe, PipeWriter};
use super::stream::TunnelStream;
use super::{
    BoxedLinkIo, TunnelError, PIPE_CAPACITY, RESERVED_STREAM_ID, STREAM_COUNTER_LIMIT,
};
use crate::net::{next_owner_id, BoxedConn, Location, Network};
use crate::router::{Router, RouterItem};
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Which side of the link this peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// This peer dialed the link.
    Dial,
    /// This peer accepted the link.
    Accept,
}

impl LinkRole {
    /// High half of the stream ID space for this role. The low 32 bits
    /// are the per-link counter; the top bit discriminates the peers.
    fn id_base(self) -> u64 {
        match self {
            LinkRole::Dial => 0,
            LinkRole::Accept => 1 << 63,
        }
    }
}

/// An inbound circuit delivered to the endpoint's stream channel.
pub struct Incoming {
    /// Destination the remote peer asked for.
    pub loc: Location,
    /// The stream, already wired into the link's demux table.
    pub conn: TunnelStream,
}

/// The tunnel loop for one established link.
pub struct TunnelLink {
    sink: PacketSink,
    demux: RwLock<HashMap<u64, PipeWriter>>,
    next_id: AtomicU64,
    id_base: u64,
    owner_id: u64,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    router: Arc<Router>,
    incoming: mpsc::Sender<Incoming>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl TunnelLink {
    /// Wire a link over `io` and spawn its read loop. The returned handle
    /// resolves when the loop has terminated and cleaned up.
    pub fn spawn(
        io: BoxedLinkIo,
        role: LinkRole,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        router: Arc<Router>,
        incoming: mpsc::Sender<Incoming>,
    ) -> (Arc<TunnelLink>, JoinHandle<()>) {
        let (read_half, write_half) = tokio::io::split(io);
        let id_base = role.id_base();
        let link = Arc::new(TunnelLink {
            sink: PacketSink::new(write_half),
            demux: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(id_base),
            id_base,
            owner_id: next_owner_id(),
            local_addr,
            peer_addr,
            router,
            incoming,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        let handle = tokio::spawn(Arc::clone(&link).run(read_half));
        (link, handle)
    }

    /// Identity of this loop for router ownership.
    pub fn owner_id(&self) -> u64 {
        self.owner_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live entries in the demux table.
    pub fn active_streams(&self) -> usize {
        self.demux.read().unwrap().len()
    }

    /// Ask the loop to stop. Pending streams observe end-of-stream.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Open a new circuit to `loc` over this link.
    pub async fn connect(&self, loc: Location) -> Result<TunnelStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::LinkClosed);
        }

        let id = self.allocate_id();
        let (pipe_tx, pipe_rx) = pipe(PIPE_CAPACITY);
        self.demux.write().unwrap().insert(id, pipe_tx);

        let pkt = Packet::Connect {
            id,
            loc: Some(loc.clone()),
        };
        if let Err(e) = self.sink.send(pkt).await {
            warn!("connect {} over {} failed: {}", loc, self.peer_addr, e);
            self.demux.write().unwrap().remove(&id);
            self.close();
            return Err(e);
        }

        trace!("stream {} opened to {}", id, loc);
        Ok(TunnelStream::new(
            id,
            pipe_rx,
            PacketWriter::new(self.sink.clone(), id),
            self.local_addr,
            self.peer_addr,
        ))
    }

    /// Advertise `domains` to the remote peer, which will route them back
    /// through this link.
    pub async fn register(&self, domains: Vec<String>) -> Result<(), TunnelError> {
        self.sink.send(Packet::Register { domains }).await
    }

    /// Next stream ID: low 32 bits count up from the role's base and wrap
    /// back to it past the counter limit; 0 stays reserved.
    fn allocate_id(&self) -> u64 {
        let mut id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        if id == RESERVED_STREAM_ID {
            id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
        if id & 0xFFFF_FFFF > STREAM_COUNTER_LIMIT {
            self.next_id.store(self.id_base, Ordering::Relaxed);
            id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        }
        id
    }

    /// Read loop: one packet per iteration until the link dies.
    async fn run(self: Arc<Self>, mut read_half: ReadHalf<BoxedLinkIo>) {
        let mut codec = PacketCodec;
        let mut buf = BytesMut::with_capacity(8192);

        loop {
            let pkt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = read_packet(&mut read_half, &mut codec, &mut buf) => match res {
                    Ok(Some(pkt)) => pkt,
                    Ok(None) => {
                        debug!("link {} closed by peer", self.peer_addr);
                        break;
                    }
                    Err(e) => {
                        debug!("link {} read failed: {}", self.peer_addr, e);
                        break;
                    }
                },
            };

            match pkt {
                Packet::Connect { id, loc } => self.handle_connect(id, loc).await,
                Packet::Data { id, data } => self.handle_data(id, data).await,
                Packet::Close { id } => self.handle_close(id),
                Packet::Register { domains } => {
                    if domains.is_empty() {
                        trace!("empty registration from {} dropped", self.peer_addr);
                        continue;
                    }
                    debug!("peer {} registered {:?}", self.peer_addr, domains);
                    self.router.add_item(RouterItem {
                        domains,
                        network: Arc::new(TunNetwork::new(&self)),
                        owner: self.owner_id,
                    });
                }
            }
        }

        self.terminate().await;
    }

    /// Inbound circuit request from the peer.
    async fn handle_connect(&self, id: u64, loc: Option<Location>) {
        // A connect without a destination is a protocol violation; drop
        // the frame and keep the link alive.
        let Some(loc) = loc else {
            trace!("connect {} without location dropped", id);
            return;
        };

        let (pipe_tx, pipe_rx) = pipe(PIPE_CAPACITY);
        self.demux.write().unwrap().insert(id, pipe_tx);

        let conn = TunnelStream::new(
            id,
            pipe_rx,
            PacketWriter::new(self.sink.clone(), id),
            self.local_addr,
            self.peer_addr,
        );

        trace!("stream {} accepted for {}", id, loc);
        // Bounded channel: a slow upstream consumer blocks the whole link
        // reader here, which is the intended back-pressure.
        if self.incoming.send(Incoming { loc, conn }).await.is_err() {
            debug!("stream {} dropped: no upstream consumer", id);
            self.demux.write().unwrap().remove(&id);
        }
    }

    /// Payload for an established stream.
    async fn handle_data(&self, id: u64, data: bytes::Bytes) {
        let entry = self.demux.read().unwrap().get(&id).cloned();
        let Some(tx) = entry else {
            trace!("data for unknown stream {} dropped", id);
            return;
        };

        // The demux lock is already released; this send may block on a
        // full pipe.
        if tx.send(data).await.is_err() {
            trace!("stream {} reader gone, pruning", id);
            self.demux.write().unwrap().remove(&id);
        }
    }

    /// Peer closed a stream: drop its pipe writer so the reader drains
    /// and then observes end-of-stream.
    fn handle_close(&self, id: u64) {
        if self.demux.write().unwrap().remove(&id).is_some() {
            trace!("stream {} closed by peer", id);
        }
    }

    /// Tear the loop down exactly once: purge router entries, poison the
    /// sink, and end every stream.
    async fn terminate(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.router.remove_owner(self.owner_id);
        self.sink.shutdown().await;

        let pipes: Vec<PipeWriter> = {
            let mut demux = self.demux.write().unwrap();
            demux.drain().map(|(_, tx)| tx).collect()
        };
        let streams = pipes.len();
        drop(pipes);

        debug!("link {} terminated, {} streams ended", self.peer_addr, streams);
    }
}

/// Read one packet, or `None` on a clean end-of-stream.
async fn read_packet(
    io: &mut ReadHalf<BoxedLinkIo>,
    codec: &mut PacketCodec,
    buf: &mut BytesMut,
) -> Result<Option<Packet>, TunnelError> {
    loop {
        if let Some(pkt) = codec.decode(buf)? {
            return Ok(Some(pkt));
        }
        if io.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(TunnelError::InvalidFrame(
                "stream ended mid-frame".into(),
            ));
        }
    }
}

/// Network capability bound to one tunnel loop.
///
/// Holds a weak handle so a dead loop cannot be kept alive by router
/// entries; dialing through a terminated loop fails like a broken socket.
pub struct TunNetwork {
    link: Weak<TunnelLink>,
    id: u64,
}

impl TunNetwork {
    pub fn new(link: &Arc<TunnelLink>) -> Self {
        Self {
            link: Arc::downgrade(link),
            id: link.owner_id,
        }
    }
}

#[async_trait]
impl Network for TunNetwork {
    async fn dial(&self, loc: &Location) -> io::Result<BoxedConn> {
        let link = self
            .link
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "tunnel loop gone"))?;
        let stream = link.connect(loc.clone()).await?;
        Ok(Box::new(stream))
    }

    fn id(&self) -> u64 {
        self.id
    }
}
