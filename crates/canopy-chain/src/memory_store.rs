//! In-memory stores. Nothing survives a restart, useful for tests and for short-lived nodes
//! that only care about the chain tip.

use std::collections::HashMap;

use bitcoin::BlockHash;
use spin::RwLock;

use crate::chainstore::check_batch_fits;
use crate::chainstore::BlocksRepository;
use crate::chainstore::HeadersRepository;
use crate::error::ChainError;
use crate::header::HeaderRecord;

/// Headers indexed by height, the vector's index is the header's height
#[derive(Debug, Default)]
pub struct MemoryHeadersStore {
    headers: RwLock<Vec<HeaderRecord>>,
}

impl MemoryHeadersStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HeadersRepository for MemoryHeadersStore {
    fn get_best_header(&self) -> Result<Option<HeaderRecord>, ChainError> {
        Ok(self.headers.read().last().copied())
    }

    fn get_headers_since_height(&self, height: u32) -> Result<Vec<HeaderRecord>, ChainError> {
        let headers = self.headers.read();
        Ok(headers.iter().skip(height as usize).copied().collect())
    }

    fn get_header_at_height(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError> {
        Ok(self.headers.read().get(height as usize).copied())
    }

    fn save_header(&self, header: &HeaderRecord) -> Result<(), ChainError> {
        self.save_headers(core::slice::from_ref(header))
    }

    fn save_headers(&self, batch: &[HeaderRecord]) -> Result<(), ChainError> {
        // Holding the write lock for the whole call makes the check and the write atomic
        let mut headers = self.headers.write();
        let skip = check_batch_fits(batch, headers.last(), |height| {
            Ok(headers.get(height as usize).copied())
        })?;

        headers.extend_from_slice(&batch[skip..]);
        Ok(())
    }

    fn remove_headers_after_height(&self, height: u32) -> Result<u32, ChainError> {
        let mut headers = self.headers.write();
        let keep = (height as usize + 1).min(headers.len());
        let removed = headers.len() - keep;
        headers.truncate(keep);

        Ok(removed as u32)
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlocksStore {
    blocks: RwLock<HashMap<BlockHash, (u32, Vec<u8>)>>,
}

impl MemoryBlocksStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlocksRepository for MemoryBlocksStore {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, ChainError> {
        Ok(self.blocks.read().get(hash).map(|(_, block)| block.clone()))
    }

    fn save_block(&self, hash: BlockHash, height: u32, block: Vec<u8>) -> Result<(), ChainError> {
        self.blocks.write().insert(hash, (height, block));
        Ok(())
    }

    fn prune_below(&self, height: u32) -> Result<usize, ChainError> {
        let mut blocks = self.blocks.write();
        let before = blocks.len();
        blocks.retain(|_, (block_height, _)| *block_height >= height);

        Ok(before - blocks.len())
    }
}
