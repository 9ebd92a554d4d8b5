//! The header record we keep for every accepted block.
//!
//! Peers hand us raw 80-byte headers. We never trust a hash a peer tells us, the block hash is
//! always recomputed from the raw bytes, and the height is assigned by us while linking the
//! header to our own chain.

use bitcoin::block::Header;
use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;

use crate::error::ChainError;

/// Size of a serialized block header
pub const HEADER_SIZE: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderRecord {
    /// Double-sha256 of `header_bytes`
    pub block_hash: BlockHash,
    /// How many blocks come before this one in our chain
    pub height: u32,
    /// The hash this header commits to as its parent, bytes [4:36] of the header
    pub prev_block_hash: BlockHash,
    /// The raw header, the source of truth for everything else in this struct
    pub header_bytes: [u8; HEADER_SIZE],
}

impl HeaderRecord {
    /// Builds a record out of a decoded header, at a height assigned by the caller.
    pub fn from_header(header: &Header, height: u32) -> Self {
        let mut header_bytes = [0_u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&serialize(header));

        HeaderRecord {
            block_hash: header.block_hash(),
            height,
            prev_block_hash: header.prev_blockhash,
            header_bytes,
        }
    }

    /// Builds a record out of raw bytes, recomputing the hash and reading the parent hash
    /// from the bytes themselves.
    pub fn from_bytes(bytes: &[u8], height: u32) -> Result<Self, ChainError> {
        let header_bytes: [u8; HEADER_SIZE] = bytes
            .try_into()
            .map_err(|_| ChainError::MalformedHeader(bytes.len()))?;

        let mut prev = [0_u8; 32];
        prev.copy_from_slice(&header_bytes[4..36]);

        Ok(HeaderRecord {
            block_hash: hash_header_bytes(&header_bytes),
            height,
            prev_block_hash: BlockHash::from_byte_array(prev),
            header_bytes,
        })
    }

    /// Decodes the raw bytes back into a full header
    pub fn header(&self) -> Result<Header, ChainError> {
        Ok(deserialize(&self.header_bytes)?)
    }

    /// Whether `self` can directly follow `parent` in a chain
    pub fn extends(&self, parent: &HeaderRecord) -> bool {
        self.prev_block_hash == parent.block_hash && self.height == parent.height + 1
    }
}

/// Computes the block hash of a raw header
pub fn hash_header_bytes(bytes: &[u8]) -> BlockHash {
    BlockHash::from_raw_hash(sha256d::Hash::hash(bytes))
}
