use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io;

use bitcoin::BlockHash;
use canopy_chain::ChainError;
use canopy_common::impl_error_from;
use thiserror::Error;

use crate::address_man::AddrManError;
use crate::transport::TransportError;

#[derive(Debug)]
pub enum WireError {
    /// Something about the chain itself: bad proof-of-work, a checkpoint mismatch, a store
    /// that refused a write.
    Chain(ChainError),

    /// A single connection failed to answer
    Connection(ConnectionError),

    /// Opening or talking over a transport failed
    Transport(TransportError),

    /// Error while parsing or persisting peer addresses
    AddrMan(AddrManError),

    /// We don't have enough established connections for this request
    NoPeers,

    /// None of our connections can serve this kind of request
    NoServers,

    /// Peers answered, but they don't agree on the answer
    NoQuorumOnResponses,

    /// Fewer peers answered than we needed for a quorum
    MissingResponse { expected: usize, got: usize },

    /// We tried this many times with different peers, and every attempt failed
    RetryExhausted { attempts: usize },

    /// A peer sent us a block that isn't the one we asked for, or one whose transactions
    /// don't match its merkle root
    InvalidBlock(BlockHash),

    /// Peer timed out some request
    Timeout,

    /// The connection isn't established
    NotConnected,

    /// The handshake with a peer failed, or we didn't like what it told us
    Handshake(String),

    /// Generic io error
    Io(io::Error),

    /// JSON (de)serialization error
    Serde(serde_json::Error),

    /// Error while writing into a channel
    ChannelSend,

    /// Can't send back response for user request
    ResponseSendError,
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Chain(err) => write!(f, "Chain error: {err}"),
            WireError::Connection(err) => write!(f, "Connection error: {err}"),
            WireError::Transport(err) => write!(f, "Transport error: {err}"),
            WireError::AddrMan(err) => write!(f, "Address manager error: {err}"),
            WireError::NoPeers => write!(f, "Not enough peers to send this request"),
            WireError::NoServers => write!(f, "No connected peer can serve this request"),
            WireError::NoQuorumOnResponses => write!(f, "Peers don't agree on the response"),
            WireError::MissingResponse { expected, got } => {
                write!(f, "Expected {expected} responses, got {got}")
            }
            WireError::RetryExhausted { attempts } => {
                write!(f, "Giving up after {attempts} attempts")
            }
            WireError::InvalidBlock(hash) => write!(f, "Peer sent an invalid block {hash}"),
            WireError::Timeout => write!(f, "Peer timed out"),
            WireError::NotConnected => write!(f, "Not connected"),
            WireError::Handshake(reason) => write!(f, "Handshake failed: {reason}"),
            WireError::Io(err) => write!(f, "Generic IO error: {err:?}"),
            WireError::Serde(err) => write!(f, "Serde error: {err:?}"),
            WireError::ChannelSend => write!(f, "Error while writing into channel"),
            WireError::ResponseSendError => write!(f, "Can't send back response for user request"),
        }
    }
}

impl std::error::Error for WireError {}

impl_error_from!(WireError, ChainError, Chain);
impl_error_from!(WireError, AddrManError, AddrMan);
impl_error_from!(WireError, io::Error, Io);
impl_error_from!(WireError, serde_json::Error, Serde);

impl From<bitcoin::consensus::encode::Error> for WireError {
    fn from(e: bitcoin::consensus::encode::Error) -> Self {
        WireError::Chain(ChainError::ConsensusDecode(e))
    }
}

impl From<ConnectionError> for WireError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Timeout => WireError::Timeout,
            ConnectionError::Disconnected => WireError::NotConnected,
            ConnectionError::Handshake(reason) => WireError::Handshake(reason),
            other => WireError::Connection(other),
        }
    }
}

impl From<TransportError> for WireError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(io) => WireError::Io(io),
            other => WireError::Transport(other),
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WireError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        WireError::ResponseSendError
    }
}

/// Why a single request over a [Connection](crate::connection::Connection) failed.
///
/// This is `Clone` because concurrent identical requests share one in-flight future, and
/// every waiter gets its own copy of the result.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Disconnected,

    #[error("peer doesn't support this request")]
    Unsupported,

    #[error("peer returned an error: {0}")]
    Remote(String),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer sent a response of the wrong kind")]
    UnexpectedResponse,

    /// The peer is reachable, but we don't want it: it's too far behind us, or runs a version
    /// we don't accept
    #[error("peer rejected: {0}")]
    Rejected(String),
}

impl ConnectionError {
    /// Whether this failure says something bad about the peer, and should count against its
    /// score. Asking for something a peer can't do, or a connection we closed ourselves,
    /// isn't the peer's fault.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(
            self,
            ConnectionError::Unsupported | ConnectionError::Disconnected
        )
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unsupported => ConnectionError::Unsupported,
            TransportError::Remote(reason) => ConnectionError::Remote(reason),
            TransportError::Handshake(reason) => ConnectionError::Handshake(reason),
            TransportError::Closed => ConnectionError::Disconnected,
            other => ConnectionError::Transport(other.to_string()),
        }
    }
}
