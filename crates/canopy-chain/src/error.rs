use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::fmt::Formatter;

use bitcoin::BlockHash;
use canopy_common::impl_error_from;

/// Marker for errors coming from a storage backend
pub trait DatabaseError: Debug + Send + Sync + 'static {}

#[derive(Debug)]
pub enum ChainError {
    /// The store refused a write because it doesn't fit the chain it already has: the height is
    /// taken by another hash, the parent isn't the header we hold one height below, or the
    /// write would leave a gap. Also raised when a peer's answer contradicts our own window.
    HeadersInconsistency(String),

    /// The header's hash isn't below the target it commits to
    InvalidPow(BlockHash),

    /// The header commits to a target easier than the network allows
    PowLimitExceeded(BlockHash),

    /// A header at a checkpointed height doesn't match the checkpoint
    NetworkHeadersInconsistency {
        height: u32,
        expected: BlockHash,
        found: BlockHash,
    },

    /// A header inside a batch doesn't point to the one before it
    ChainBroken { height: u32 },

    /// Peers answered, but not enough of them agreed on one answer
    ConsensusNotReached,

    /// Agreement ratios must be in (0, 1]
    InvalidAgreement(f64),

    /// A raw header must be exactly 80 bytes, this one had the given length
    MalformedHeader(usize),

    ConsensusDecode(bitcoin::consensus::encode::Error),

    Database(Box<dyn DatabaseError>),

    /// We don't even have a genesis header yet
    ChainNotInitialized,

    BlockNotPresent,
}

impl ChainError {
    /// Errors that prove the peer that sent us the data is on another chain or lying, as
    /// opposed to a store that needs to be repaired.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidPow(_)
                | ChainError::PowLimitExceeded(_)
                | ChainError::NetworkHeadersInconsistency { .. }
                | ChainError::ChainBroken { .. }
                | ChainError::MalformedHeader(_)
                | ChainError::ConsensusDecode(_)
        )
    }
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::HeadersInconsistency(reason) => {
                write!(f, "Headers inconsistency: {reason}")
            }
            ChainError::InvalidPow(hash) => {
                write!(f, "Block {hash} doesn't have enough proof-of-work")
            }
            ChainError::PowLimitExceeded(hash) => {
                write!(f, "Block {hash} has a target above the network's limit")
            }
            ChainError::NetworkHeadersInconsistency {
                height,
                expected,
                found,
            } => write!(
                f,
                "Checkpoint mismatch at height {height}: expected {expected}, got {found}"
            ),
            ChainError::ChainBroken { height } => {
                write!(f, "Header at height {height} doesn't link to its parent")
            }
            ChainError::ConsensusNotReached => write!(f, "Peers didn't reach consensus"),
            ChainError::InvalidAgreement(ratio) => {
                write!(f, "Agreement must be in (0, 1], got {ratio}")
            }
            ChainError::MalformedHeader(len) => {
                write!(f, "Headers must be 80 bytes long, got {len}")
            }
            ChainError::ConsensusDecode(err) => write!(f, "Decoding error: {err}"),
            ChainError::Database(err) => write!(f, "Database error: {err:?}"),
            ChainError::ChainNotInitialized => write!(f, "Chain has no headers yet"),
            ChainError::BlockNotPresent => write!(f, "Block not present"),
        }
    }
}

impl<T: DatabaseError> From<T> for ChainError {
    fn from(value: T) -> Self {
        ChainError::Database(Box::new(value))
    }
}

impl_error_from!(
    ChainError,
    bitcoin::consensus::encode::Error,
    ConsensusDecode
);

#[cfg(feature = "kv-chainstore")]
impl DatabaseError for kv::Error {}

impl std::error::Error for ChainError {}
