//! Endpoint orchestration: one peer role of the tunnel.
//!
//! A client endpoint dials the remote address in a loop, pacing retries
//! with [`ReconnectPolicy`]; a server endpoint binds a listener and spawns
//! a tunnel loop per accepted link. Either side owns the TLS envelope and
//! delivers inbound circuits on the stream channel handed to [`Endpoint::run`].

mod reconnect;
mod tls;

pub use reconnect::{ReconnectPolicy, STABILITY_THRESHOLD};

use crate::router::{Router, RouterItem};
use crate::tunnel::{BoxedLinkIo, Incoming, LinkRole, TunNetwork, TunnelLink};
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keep-alive probe period on link sockets.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Peer role of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Dial out and keep the link alive.
    Client,
    /// Accept links.
    Server,
}

/// One peer role: establishes links and wires them into tunnel loops.
pub struct Endpoint {
    mode: Mode,
    address: String,
    secpath: Option<PathBuf>,
    verify_server: bool,
    item_domains: Vec<String>,
    default_domains: Vec<String>,
    router: Arc<Router>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

impl Endpoint {
    pub fn new(mode: Mode, address: impl Into<String>) -> Self {
        Self {
            mode,
            address: address.into(),
            secpath: None,
            verify_server: true,
            item_domains: Vec::new(),
            default_domains: Vec::new(),
            router: Arc::new(Router::new()),
            policy: ReconnectPolicy::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Directory holding the TLS material; unset means plain TCP.
    pub fn with_secpath(mut self, secpath: impl Into<PathBuf>) -> Self {
        self.secpath = Some(secpath.into());
        self
    }

    /// Toggle server certificate verification on the dialing side.
    pub fn with_verify_server(mut self, verify: bool) -> Self {
        self.verify_server = verify;
        self
    }

    /// Domains this endpoint serves locally through the link it dials:
    /// inserted into the local router, bound to each new link.
    pub fn with_router_item(mut self, domains: Vec<String>) -> Self {
        self.item_domains = domains;
        self
    }

    /// Domains advertised to the remote peer on each new link, so the
    /// peer routes them back here.
    pub fn with_default_domains(mut self, domains: Vec<String>) -> Self {
        self.default_domains = domains;
        self
    }

    /// Share a router with other endpoints in the process.
    pub fn with_router(mut self, router: Arc<Router>) -> Self {
        self.router = router;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// Token that stops the endpoint when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run this endpoint, delivering inbound circuits to `incoming`.
    /// Returns when the shutdown token fires or startup fails.
    pub async fn run(self, incoming: mpsc::Sender<Incoming>) -> Result<()> {
        match self.mode {
            Mode::Client => self.run_client(incoming).await,
            Mode::Server => self.run_server(incoming).await,
        }
    }

    /// Dial-with-backoff loop.
    async fn run_client(mut self, incoming: mpsc::Sender<Incoming>) -> Result<()> {
        let connector = match &self.secpath {
            Some(path) => {
                let config = tls::client_config(path, self.verify_server)?;
                info!("tls client endpoint for {}", self.address);
                Some(TlsConnector::from(Arc::new(config)))
            }
            None => {
                info!("client endpoint for {}", self.address);
                None
            }
        };

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            let started = Instant::now();
            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                res = self.dial(&connector) => res,
            };

            match dialed {
                Err(e) => {
                    warn!("dial {} failed: {}", self.address, e);
                    let delay = self.policy.next_delay();
                    debug!("retrying in {:?}", delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok((io, local, peer)) => {
                    info!("link established to {}", peer);
                    let (link, mut handle) = TunnelLink::spawn(
                        io,
                        LinkRole::Dial,
                        local,
                        peer,
                        self.router(),
                        incoming.clone(),
                    );

                    if !self.item_domains.is_empty() {
                        self.router.add_item(RouterItem {
                            domains: self.item_domains.clone(),
                            network: Arc::new(TunNetwork::new(&link)),
                            owner: link.owner_id(),
                        });
                    }
                    if !self.default_domains.is_empty() {
                        if let Err(e) = link.register(self.default_domains.clone()).await {
                            warn!("registration on {} failed: {}", peer, e);
                        }
                    }

                    tokio::select! {
                        _ = &mut handle => {}
                        _ = self.shutdown.cancelled() => {
                            link.close();
                            let _ = handle.await;
                            return Ok(());
                        }
                    }

                    let lived = started.elapsed();
                    info!("link to {} disconnected after {:?}", self.address, lived);
                    if let Some(delay) = self.policy.after_session(lived) {
                        debug!("reconnecting in {:?}", delay);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    /// Dial the configured address, optionally wrapping in TLS.
    async fn dial(
        &self,
        connector: &Option<TlsConnector>,
    ) -> Result<(BoxedLinkIo, SocketAddr, SocketAddr)> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true).ok();
        if let Err(e) = set_keepalive(&stream) {
            debug!("keepalive on {}: {}", self.address, e);
        }
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;

        match connector {
            Some(connector) => {
                let host = self
                    .address
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(self.address.as_str());
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| Error::Config(format!("bad server name {}: {}", host, e)))?;
                let tls = connector.connect(server_name, stream).await?;
                let io: BoxedLinkIo = Box::new(tls);
                Ok((io, local, peer))
            }
            None => {
                let io: BoxedLinkIo = Box::new(stream);
                Ok((io, local, peer))
            }
        }
    }

    /// Accept loop: a fresh tunnel loop per link.
    async fn run_server(self, incoming: mpsc::Sender<Incoming>) -> Result<()> {
        let acceptor = match &self.secpath {
            Some(path) => {
                let config = tls::server_config(path)?;
                info!("tls server endpoint on {}", self.address);
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => {
                info!("server endpoint on {}", self.address);
                None
            }
        };

        let listener = TcpListener::bind(&self.address).await?;
        info!("listening on {}", listener.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                res = listener.accept() => res,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Accept errors are transient; keep listening.
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            debug!("peer {} connected", peer);
            stream.set_nodelay(true).ok();
            if let Err(e) = set_keepalive(&stream) {
                debug!("keepalive on {}: {}", peer, e);
            }
            let local = match stream.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("local address for {}: {}", peer, e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let router = self.router();
            let incoming = incoming.clone();
            tokio::spawn(async move {
                let io: BoxedLinkIo = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls) => Box::new(tls),
                        Err(e) => {
                            warn!("tls accept from {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => Box::new(stream),
                };
                let (_link, handle) =
                    TunnelLink::spawn(io, LinkRole::Accept, local, peer, router, incoming);
                let _ = handle.await;
                debug!("peer {} disconnected", peer);
            });
        }
    }
}

fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
