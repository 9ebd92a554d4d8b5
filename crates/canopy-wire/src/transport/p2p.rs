//! Bitcoin's P2P protocol, with the original unencrypted v1 framing.
//!
//! We are a very quiet peer: after the version handshake we ask for headers announcements,
//! answer pings, and only ever send `getheaders`, `getdata` and `ping`. Replies don't carry
//! request ids in this protocol, so `headers` replies resolve the oldest outstanding
//! `getheaders`, and anything the peer sends while we aren't waiting is an announcement.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::deserialize_partial;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::message_blockdata::GetHeadersMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::Address;
use bitcoin::p2p::Magic;
use bitcoin::p2p::ServiceFlags;
use bitcoin::BlockHash;
use log::debug;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::PeerInfo;
use super::PeerRequest;
use super::PeerResponse;
use super::PeerTransport;
use super::TransportError;
use super::TransportEvent;
use crate::address_man::Protocol;

/// Size of the v1 message header: magic, command, length and checksum
const MESSAGE_HEADER_SIZE: usize = 24;

/// Nothing we accept is bigger than a block
const MAX_MESSAGE_SIZE: u32 = 4_000_000;

/// Most headers a peer sends in one `headers` message
const MAX_HEADERS_RESULTS: u32 = 2000;

/// The protocol version we announce
const PROTOCOL_VERSION: u32 = 70016;

struct V1MessageHeader {
    magic: Magic,
    command: [u8; 12],
    length: u32,
    _checksum: u32,
}

impl Decodable for V1MessageHeader {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, bitcoin::consensus::encode::Error> {
        let magic = Magic::consensus_decode(reader)?;
        let command = <[u8; 12]>::consensus_decode(reader)?;
        let length = u32::consensus_decode(reader)?;
        let _checksum = u32::consensus_decode(reader)?;
        Ok(Self {
            magic,
            command,
            length,
            _checksum,
        })
    }
}

/// A message as it came from the wire. Blocks are kept as raw bytes, we hand them over exactly
/// as the peer sent them.
enum WireMessage {
    Standard(NetworkMessage),
    Block(Vec<u8>),
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: Magic,
) -> Result<WireMessage, TransportError> {
    let mut data = vec![0_u8; MESSAGE_HEADER_SIZE];
    reader.read_exact(&mut data).await?;

    let header: V1MessageHeader = deserialize_partial(&data)?.0;
    if header.magic != magic {
        return Err(TransportError::InvalidMessage(format!(
            "wrong network magic {:?}",
            header.magic
        )));
    }
    if header.length > MAX_MESSAGE_SIZE {
        return Err(TransportError::InvalidMessage(format!(
            "message of {} bytes is too big",
            header.length
        )));
    }

    data.resize(MESSAGE_HEADER_SIZE + header.length as usize, 0);
    reader.read_exact(&mut data[MESSAGE_HEADER_SIZE..]).await?;

    if header.command.starts_with(b"block\0") {
        return Ok(WireMessage::Block(data.split_off(MESSAGE_HEADER_SIZE)));
    }

    let message: RawNetworkMessage = deserialize(&data)?;
    Ok(WireMessage::Standard(message.payload().clone()))
}

async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    magic: Magic,
    message: NetworkMessage,
) -> Result<(), TransportError> {
    let data = serialize(&RawNetworkMessage::new(magic, message));
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Default)]
/// Requests waiting for a reply
struct Waiters {
    headers: VecDeque<oneshot::Sender<Vec<Header>>>,
    blocks: HashMap<BlockHash, Vec<oneshot::Sender<Vec<u8>>>>,
    pings: HashMap<u64, oneshot::Sender<()>>,
}

type SharedWaiters = Arc<spin::Mutex<Waiters>>;

pub struct P2pTransport {
    info: PeerInfo,
    magic: Magic,
    writer: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    waiters: SharedWaiters,
    best_height: Arc<AtomicU32>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl P2pTransport {
    /// Performs the version handshake, then starts the reader task
    pub async fn connect<S>(
        stream: S,
        network: bitcoin::Network,
        user_agent: &str,
        local_height: u32,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let magic = network.magic();
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer: Box<dyn AsyncWrite + Unpin + Send> = Box::new(writer);

        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let version = VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            timestamp: canopy_common::unix_now() as i64,
            receiver: Address::new(&unspecified, ServiceFlags::NONE),
            sender: Address::new(&unspecified, ServiceFlags::NONE),
            nonce: rand::random(),
            user_agent: user_agent.to_string(),
            start_height: local_height as i32,
            relay: false,
        };
        write_message(&mut writer, magic, NetworkMessage::Version(version)).await?;

        let mut info = None;
        let mut got_verack = false;
        while info.is_none() || !got_verack {
            match read_message(&mut reader, magic).await? {
                WireMessage::Standard(NetworkMessage::Version(version)) => {
                    info = Some(PeerInfo {
                        user_agent: version.user_agent,
                        protocol_version: version.version,
                        start_height: version.start_height.max(0) as u32,
                    });
                    write_message(&mut writer, magic, NetworkMessage::Verack).await?;
                }
                WireMessage::Standard(NetworkMessage::Verack) => got_verack = true,
                WireMessage::Standard(other) if info.is_none() => {
                    return Err(TransportError::Handshake(format!(
                        "expected version, got {}",
                        other.cmd()
                    )));
                }
                WireMessage::Standard(NetworkMessage::Ping(nonce)) => {
                    write_message(&mut writer, magic, NetworkMessage::Pong(nonce)).await?;
                }
                // sendcmpct, wtxidrelay and friends may come before verack
                _ => {}
            }
        }

        write_message(&mut writer, magic, NetworkMessage::SendHeaders).await?;

        let info = info.ok_or_else(|| TransportError::Handshake("no version".into()))?;
        let best_height = Arc::new(AtomicU32::new(info.start_height));
        let writer = Arc::new(tokio::sync::Mutex::new(writer));
        let waiters = SharedWaiters::default();

        let reader = tokio::spawn(read_loop(
            reader,
            magic,
            writer.clone(),
            waiters.clone(),
            events,
        ));

        Ok(P2pTransport {
            info,
            magic,
            writer,
            waiters,
            best_height,
            reader,
            closed: AtomicBool::new(false),
        })
    }

    async fn send(&self, message: NetworkMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        write_message(&mut *writer, self.magic, message).await
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    magic: Magic,
    writer: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>>,
    waiters: SharedWaiters,
    events: UnboundedSender<TransportEvent>,
) {
    loop {
        let message = match read_message(&mut reader, magic).await {
            Ok(message) => message,
            Err(e) => {
                debug!("p2p reader stopped: {e}");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        };

        match message {
            WireMessage::Block(bytes) => {
                // The hash of a block is the hash of its first 80 bytes
                let Some(header) = bytes.get(..80) else {
                    let _ = events.send(TransportEvent::Error("truncated block".into()));
                    continue;
                };
                let hash = canopy_chain::header::hash_header_bytes(header);
                let waiting = waiters.lock().blocks.remove(&hash).unwrap_or_default();
                if waiting.is_empty() {
                    debug!("got block {hash} we didn't ask for");
                }
                for waiter in waiting {
                    let _ = waiter.send(bytes.clone());
                }
            }
            WireMessage::Standard(NetworkMessage::Headers(headers)) => {
                let waiter = waiters.lock().headers.pop_front();
                let headers = match waiter {
                    Some(waiter) => match waiter.send(headers) {
                        Ok(()) => continue,
                        // The caller gave up, so this is news to nobody but the pool
                        Err(headers) => headers,
                    },
                    None => headers,
                };
                if !headers.is_empty() {
                    let _ = events.send(TransportEvent::Headers(headers));
                }
            }
            WireMessage::Standard(NetworkMessage::Inv(inventory)) => {
                for item in inventory {
                    if let Inventory::Block(hash) | Inventory::WitnessBlock(hash) = item {
                        let _ = events.send(TransportEvent::BlockAnnounced(hash));
                    }
                }
            }
            WireMessage::Standard(NetworkMessage::Ping(nonce)) => {
                let mut writer = writer.lock().await;
                if let Err(e) = write_message(&mut *writer, magic, NetworkMessage::Pong(nonce)).await
                {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break;
                }
            }
            WireMessage::Standard(NetworkMessage::Pong(nonce)) => {
                if let Some(waiter) = waiters.lock().pings.remove(&nonce) {
                    let _ = waiter.send(());
                }
            }
            WireMessage::Standard(NetworkMessage::NotFound(inventory)) => {
                let mut waiters = waiters.lock();
                for item in inventory {
                    if let Inventory::Block(hash) | Inventory::WitnessBlock(hash) = item {
                        // dropping the senders fails the requests
                        waiters.blocks.remove(&hash);
                    }
                }
            }
            WireMessage::Standard(other) => debug!("ignoring {} from peer", other.cmd()),
        }
    }

    let mut waiters = waiters.lock();
    waiters.headers.clear();
    waiters.blocks.clear();
    waiters.pings.clear();
}

#[async_trait]
impl PeerTransport for P2pTransport {
    fn protocol(&self) -> Protocol {
        Protocol::P2p
    }

    fn info(&self) -> &PeerInfo {
        &self.info
    }

    fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::Relaxed)
    }

    fn supports(&self, request: &PeerRequest) -> bool {
        matches!(
            request,
            PeerRequest::HeadersAfter { .. } | PeerRequest::Block(_) | PeerRequest::Ping
        )
    }

    async fn request(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        match request {
            PeerRequest::HeadersAfter {
                locator,
                height,
                count,
            } => {
                let first = locator.first().copied();
                let (tx, rx) = oneshot::channel();
                self.waiters.lock().headers.push_back(tx);
                let message = GetHeadersMessage::new(locator, BlockHash::all_zeros());
                self.send(NetworkMessage::GetHeaders(message)).await?;

                let mut headers = rx.await.map_err(|_| TransportError::Closed)?;
                headers.truncate(count.min(MAX_HEADERS_RESULTS) as usize);

                // Heights are only known if the peer started where we hoped
                let starts_at_locator = headers
                    .first()
                    .zip(first)
                    .is_some_and(|(header, first)| header.prev_blockhash == first);
                if starts_at_locator {
                    if let Some(last) = height.checked_add(headers.len() as u32) {
                        self.best_height.fetch_max(last, Ordering::Relaxed);
                    }
                }

                Ok(PeerResponse::Headers(headers))
            }
            PeerRequest::Block(hash) => {
                let (tx, rx) = oneshot::channel();
                self.waiters
                    .lock()
                    .blocks
                    .entry(hash)
                    .or_default()
                    .push(tx);
                self.send(NetworkMessage::GetData(vec![Inventory::WitnessBlock(hash)]))
                    .await?;

                let block = rx.await.map_err(|_| TransportError::Closed)?;
                Ok(PeerResponse::Block(block))
            }
            PeerRequest::Ping => {
                let nonce = rand::random();
                let (tx, rx) = oneshot::channel();
                self.waiters.lock().pings.insert(nonce, tx);
                self.send(NetworkMessage::Ping(nonce)).await?;

                rx.await.map_err(|_| TransportError::Closed)?;
                Ok(PeerResponse::Pong)
            }
            PeerRequest::HeaderAtHeight(_) | PeerRequest::EstimateFee(_) => {
                Err(TransportError::Unsupported)
            }
        }
    }

    async fn subscribe_headers(&self) -> Result<(), TransportError> {
        // We already sent `sendheaders` during the handshake
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        let mut waiters = self.waiters.lock();
        waiters.headers.clear();
        waiters.blocks.clear();
        waiters.pings.clear();
    }
}

impl Drop for P2pTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
