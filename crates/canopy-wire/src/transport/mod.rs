//! The transports we can talk to a peer with, behind one interface.
//!
//! A transport is a live session with one peer, already past the handshake. It answers typed
//! [PeerRequest]s and pushes whatever the peer tells us on its own (new tips, block
//! announcements) as [TransportEvent]s. Transports don't keep scores or retry anything, that's
//! [Connection](crate::connection::Connection)'s job.

pub mod electrum;
pub mod p2p;
pub mod socks;

use std::io;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::BlockHash;
use canopy_chain::Network;
use log::debug;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedSender;

use self::socks::Socks5Addr;
use self::socks::Socks5Error;
use self::socks::Socks5StreamBuilder;
use crate::address_man::PeerDescriptor;
use crate::address_man::Protocol;

/// Lowest P2P protocol version we accept, the first one with `sendheaders`
pub const MIN_PROTOCOL_VERSION: u32 = 70012;

#[derive(Debug, Error)]
/// Enum that deals with transport errors
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] Socks5Error),

    #[error("couldn't decode message: {0}")]
    Decode(#[from] encode::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("peer returned an error: {0}")]
    Remote(String),

    #[error("request not supported by this transport")]
    Unsupported,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Everything we may ask a peer. Identical requests are coalesced, so this is also the key of
/// a connection's in-flight map.
pub enum PeerRequest {
    /// Up to `count` headers following our chain. P2P peers start after the first `locator`
    /// hash they know, Electrum servers after `height`, the height of the first locator hash.
    HeadersAfter {
        locator: Vec<BlockHash>,
        height: u32,
        count: u32,
    },
    HeaderAtHeight(u32),
    Block(BlockHash),
    /// Fee rate for confirmation within this many blocks
    EstimateFee(u16),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerResponse {
    Headers(Vec<Header>),
    Header(Header),
    /// A serialized block, exactly as the peer sent it
    Block(Vec<u8>),
    /// Satoshis per kilo-vbyte
    FeeRate(u64),
    Pong,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Things a peer tells us without being asked
pub enum TransportEvent {
    /// Headers announced by a P2P peer, heights unknown
    Headers(Vec<Header>),
    /// A new tip announced by an Electrum server, along with its height
    NewTip { header: Header, height: u32 },
    BlockAnnounced(BlockHash),
    /// Something went wrong while reading from the peer, counts as an error for the connection
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// What a peer told us about itself during the handshake
pub struct PeerInfo {
    pub user_agent: String,
    /// P2P protocol version, or zero for Electrum servers
    pub protocol_version: u32,
    /// The height the peer claimed to be at when we connected
    pub start_height: u32,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn info(&self) -> &PeerInfo;

    /// The highest height this peer announced so far
    fn best_height(&self) -> u32 {
        self.info().start_height
    }

    fn supports(&self, request: &PeerRequest) -> bool;

    async fn request(&self, request: PeerRequest) -> Result<PeerResponse, TransportError>;

    /// Asks the peer to push new tips to us, as [TransportEvent]s
    async fn subscribe_headers(&self) -> Result<(), TransportError>;

    /// Stops the reader task and drops the socket. Pending requests fail with
    /// [TransportError::Closed].
    fn close(&self);
}

#[async_trait]
/// Opens transports. The pool only knows about this trait, so tests can swap in peers that
/// live in memory.
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerDescriptor,
        local_height: u32,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;

    /// Whether we seem to have a working internet connection (or proxy)
    async fn is_online(&self) -> bool;
}

/// Decides whether we want to keep a peer after seeing its handshake
pub trait VersionFilter: Send + Sync {
    fn accept(&self, protocol: Protocol, info: &PeerInfo) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
/// Rejects P2P peers without `sendheaders` support or without a user agent. Electrum servers
/// are always accepted.
pub struct DefaultVersionFilter;

impl VersionFilter for DefaultVersionFilter {
    fn accept(&self, protocol: Protocol, info: &PeerInfo) -> bool {
        match protocol {
            Protocol::Electrum => true,
            Protocol::P2p => {
                info.protocol_version >= MIN_PROTOCOL_VERSION && !info.user_agent.is_empty()
            }
        }
    }
}

/// Connects over plain TCP, optionally through a SOCKS5 proxy
pub struct TcpConnector {
    pub network: Network,
    pub proxy: Option<SocketAddr>,
    pub user_agent: String,
}

impl TcpConnector {
    pub fn new(network: Network, proxy: Option<SocketAddr>, user_agent: String) -> Self {
        TcpConnector {
            network,
            proxy,
            user_agent,
        }
    }

    async fn open_stream(&self, peer: &PeerDescriptor) -> Result<TcpStream, TransportError> {
        let Some(proxy) = self.proxy else {
            let stream = TcpStream::connect((peer.host.as_str(), peer.port)).await?;
            stream.set_nodelay(true)?;
            return Ok(stream);
        };

        let address = match peer.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Socks5Addr::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => Socks5Addr::Ipv6(ip),
            Err(_) => Socks5Addr::Domain(peer.host.as_bytes().into()),
        };

        let stream = TcpStream::connect(proxy).await?;
        Ok(Socks5StreamBuilder::connect(stream, address, peer.port).await?)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        peer: &PeerDescriptor,
        local_height: u32,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let stream = self.open_stream(peer).await?;
        debug!("tcp connection to {peer} open, starting handshake");

        match peer.protocol {
            Protocol::Electrum => {
                let transport =
                    electrum::ElectrumTransport::connect(stream, &self.user_agent, events).await?;
                Ok(Arc::new(transport))
            }
            Protocol::P2p => {
                let transport = p2p::P2pTransport::connect(
                    stream,
                    self.network.into(),
                    &self.user_agent,
                    local_height,
                    events,
                )
                .await?;
                Ok(Arc::new(transport))
            }
        }
    }

    async fn is_online(&self) -> bool {
        let probes = match self.proxy {
            Some(proxy) => vec![proxy],
            None => vec![
                SocketAddr::from(([1, 1, 1, 1], 53)),
                SocketAddr::from(([8, 8, 8, 8], 53)),
            ],
        };

        for probe in probes {
            let attempt = tokio::time::timeout(Duration::from_secs(5), TcpStream::connect(probe));
            if let Ok(Ok(_)) = attempt.await {
                return true;
            }
        }

        false
    }
}
