//! Electrum's protocol: JSON-RPC 2.0 objects, one per line, over a plain TCP stream.
//!
//! Replies are matched to requests by id. The only notification we care about is
//! `blockchain.headers.subscribe`, which the server pushes every time its tip moves.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use bitcoin::hex::FromHex;
use log::debug;
use serde_json::json;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::PeerInfo;
use super::PeerRequest;
use super::PeerResponse;
use super::PeerTransport;
use super::TransportError;
use super::TransportEvent;
use crate::address_man::Protocol;

/// The protocol version we ask for, the first one with `blockchain.block.headers`
const PROTOCOL_VERSION: &str = "1.4";

const HEADERS_SUBSCRIBE: &str = "blockchain.headers.subscribe";

/// Highest fee rate we believe a server about, in BTC per kvB
const MAX_FEE_RATE: f64 = 1.0;

type Waiter = oneshot::Sender<Result<Value, TransportError>>;
type Pending = Arc<spin::Mutex<HashMap<u64, Waiter>>>;

pub struct ElectrumTransport {
    info: PeerInfo,
    best_height: Arc<AtomicU32>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Unpin + Send>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    /// Only the reader task holds a strong sender, so the channel closes when it stops
    events: WeakUnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

/// Removes a request from the pending map if its caller gives up before the reply arrives
struct PendingGuard {
    id: u64,
    pending: Pending,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl ElectrumTransport {
    /// Starts the reader task and performs the `server.version` handshake
    pub async fn connect<S>(
        stream: S,
        user_agent: &str,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(spin::Mutex::new(HashMap::new()));
        let best_height = Arc::new(AtomicU32::new(0));

        let weak_events = events.downgrade();
        let reader = tokio::spawn(read_loop(
            BufReader::new(reader),
            pending.clone(),
            best_height.clone(),
            events,
        ));

        let mut transport = ElectrumTransport {
            info: PeerInfo::default(),
            best_height,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(0),
            reader,
            events: weak_events,
            closed: AtomicBool::new(false),
        };

        let version = match transport
            .call("server.version", json!([user_agent, PROTOCOL_VERSION]))
            .await
        {
            Ok(version) => version,
            Err(e) => {
                transport.close();
                return Err(TransportError::Handshake(e.to_string()));
            }
        };

        transport.info.user_agent = version
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(transport)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            id,
            pending: self.pending.clone(),
        };

        let mut line = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&line).await?;
            writer.flush().await?;
        }

        rx.await.map_err(|_| TransportError::Closed)?
    }
}

fn decode_headers(hex: &str) -> Result<Vec<Header>, TransportError> {
    let bytes = Vec::<u8>::from_hex(hex)
        .map_err(|e| TransportError::InvalidMessage(format!("invalid hex: {e}")))?;

    if bytes.len() % 80 != 0 {
        return Err(TransportError::InvalidMessage(format!(
            "{} bytes isn't a whole number of headers",
            bytes.len()
        )));
    }

    bytes
        .chunks(80)
        .map(|raw| Ok(deserialize::<Header>(raw)?))
        .collect()
}

fn decode_header(hex: &str) -> Result<Header, TransportError> {
    let mut headers = decode_headers(hex)?;
    match headers.len() {
        1 => Ok(headers.remove(0)),
        n => Err(TransportError::InvalidMessage(format!(
            "expected one header, got {n}"
        ))),
    }
}

/// Parses the `{height, hex}` object the server sends for its tip
fn decode_tip(value: &Value) -> Result<(Header, u32), TransportError> {
    let height = value
        .get("height")
        .and_then(Value::as_u64)
        .and_then(|height| u32::try_from(height).ok())
        .ok_or_else(|| TransportError::InvalidMessage("tip without a height".into()))?;
    let hex = value
        .get("hex")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::InvalidMessage("tip without a header".into()))?;

    Ok((decode_header(hex)?, height))
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: BufReader<R>,
    pending: Pending,
    best_height: Arc<AtomicU32>,
    events: UnboundedSender<TransportEvent>,
) {
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        };

        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(format!("invalid json: {e}")));
                continue;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let Some(waiter) = pending.lock().remove(&id) else {
                debug!("reply to unknown request {id}");
                continue;
            };

            let result = match message.get("error") {
                Some(error) if !error.is_null() => Err(TransportError::Remote(error.to_string())),
                _ => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = waiter.send(result);
            continue;
        }

        if message.get("method").and_then(Value::as_str) == Some(HEADERS_SUBSCRIBE) {
            let tip = message
                .get("params")
                .and_then(|params| params.get(0))
                .ok_or_else(|| TransportError::InvalidMessage("empty notification".into()))
                .and_then(decode_tip);

            match tip {
                Ok((header, height)) => {
                    best_height.fetch_max(height, Ordering::Relaxed);
                    let _ = events.send(TransportEvent::NewTip { header, height });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
            }
        }
    }

    // Whoever is still waiting will never get an answer
    for (_, waiter) in pending.lock().drain() {
        let _ = waiter.send(Err(TransportError::Closed));
    }
}

#[async_trait]
impl PeerTransport for ElectrumTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Electrum
    }

    fn info(&self) -> &PeerInfo {
        &self.info
    }

    fn best_height(&self) -> u32 {
        self.best_height.load(Ordering::Relaxed)
    }

    fn supports(&self, request: &PeerRequest) -> bool {
        !matches!(request, PeerRequest::Block(_))
    }

    async fn request(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        match request {
            PeerRequest::HeadersAfter { height, count, .. } => {
                let result = self
                    .call("blockchain.block.headers", json!([height + 1, count]))
                    .await?;
                let hex = result
                    .get("hex")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::InvalidMessage("no headers in reply".into()))?;

                Ok(PeerResponse::Headers(decode_headers(hex)?))
            }
            PeerRequest::HeaderAtHeight(height) => {
                let result = self.call("blockchain.block.header", json!([height])).await?;
                let hex = result
                    .as_str()
                    .ok_or_else(|| TransportError::InvalidMessage("header isn't a string".into()))?;

                Ok(PeerResponse::Header(decode_header(hex)?))
            }
            PeerRequest::EstimateFee(target) => {
                let result = self.call("blockchain.estimatefee", json!([target])).await?;
                let btc_per_kb = result
                    .as_f64()
                    .ok_or_else(|| TransportError::InvalidMessage("fee isn't a number".into()))?;

                // -1 means the server doesn't have enough data
                if btc_per_kb <= 0.0 {
                    return Err(TransportError::Remote("no fee estimate available".into()));
                }
                if !btc_per_kb.is_finite() || btc_per_kb > MAX_FEE_RATE {
                    return Err(TransportError::InvalidMessage(format!(
                        "absurd fee rate {btc_per_kb}"
                    )));
                }

                Ok(PeerResponse::FeeRate((btc_per_kb * 100_000_000.0).round() as u64))
            }
            PeerRequest::Ping => {
                self.call("server.ping", json!([])).await?;
                Ok(PeerResponse::Pong)
            }
            PeerRequest::Block(_) => Err(TransportError::Unsupported),
        }
    }

    async fn subscribe_headers(&self) -> Result<(), TransportError> {
        let tip = self.call(HEADERS_SUBSCRIBE, json!([])).await?;
        let (header, height) = decode_tip(&tip)?;

        self.best_height.fetch_max(height, Ordering::Relaxed);
        self.events
            .upgrade()
            .ok_or(TransportError::Closed)?
            .send(TransportEvent::NewTip { header, height })
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.abort();
        for (_, waiter) in self.pending.lock().drain() {
            let _ = waiter.send(Err(TransportError::Closed));
        }
    }
}

impl Drop for ElectrumTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
