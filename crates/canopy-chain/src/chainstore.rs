//! The interfaces between the sync engines and wherever headers and blocks are kept.
//!
//! The header store is append-only from the engine's point of view: it only grows at the tip,
//! and only shrinks by cutting everything above some height. Both stores must apply each call
//! entirely or not at all.

use bitcoin::BlockHash;

use crate::error::ChainError;
use crate::header::HeaderRecord;

pub trait HeadersRepository: Send + Sync {
    /// The highest header we have, or `None` for an empty store
    fn get_best_header(&self) -> Result<Option<HeaderRecord>, ChainError>;

    /// Every header from `height` (inclusive) to the tip, in ascending order
    fn get_headers_since_height(&self, height: u32) -> Result<Vec<HeaderRecord>, ChainError>;

    fn get_header_at_height(&self, height: u32) -> Result<Option<HeaderRecord>, ChainError>;

    /// Saves one header on top of the current tip.
    ///
    /// Fails with [ChainError::HeadersInconsistency] if the height is already taken by another
    /// hash, if `prev_block_hash` isn't the hash we have one height below, or if the header
    /// would leave a gap. Saving a header that is already stored is a no-op.
    fn save_header(&self, header: &HeaderRecord) -> Result<(), ChainError>;

    /// Saves a batch of consecutive headers, all or nothing, with the same rules as
    /// [HeadersRepository::save_header] applied to each of them in order.
    fn save_headers(&self, headers: &[HeaderRecord]) -> Result<(), ChainError>;

    /// Removes every header above `height`, returning how many were removed
    fn remove_headers_after_height(&self, height: u32) -> Result<u32, ChainError>;
}

pub trait BlocksRepository: Send + Sync {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Vec<u8>>, ChainError>;

    fn has_block(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        Ok(self.get_block(hash)?.is_some())
    }

    fn save_block(&self, hash: BlockHash, height: u32, block: Vec<u8>) -> Result<(), ChainError>;

    /// Drops every block below `height`, returning how many were dropped
    fn prune_below(&self, height: u32) -> Result<usize, ChainError>;
}

/// Checks whether `batch` can go on top of a store whose tip is `tip`, given the stored
/// header at the batch's first height (if any) and the one right below it.
///
/// Used by every [HeadersRepository] implementation so they all enforce the same rules.
/// Returns how many leading headers of the batch are already stored exactly as they are.
pub fn check_batch_fits(
    batch: &[HeaderRecord],
    tip: Option<&HeaderRecord>,
    stored_at: impl Fn(u32) -> Result<Option<HeaderRecord>, ChainError>,
) -> Result<usize, ChainError> {
    let Some(first) = batch.first() else {
        return Ok(0);
    };

    for pair in batch.windows(2) {
        if !pair[1].extends(&pair[0]) {
            return Err(ChainError::HeadersInconsistency(format!(
                "batch isn't contiguous at height {}",
                pair[1].height
            )));
        }
    }

    let tip_height = match tip {
        Some(tip) => tip.height,
        None => {
            if first.height != 0 {
                return Err(ChainError::HeadersInconsistency(
                    "the first header of an empty store must be at height 0".into(),
                ));
            }
            return Ok(0);
        }
    };

    if first.height > tip_height + 1 {
        return Err(ChainError::HeadersInconsistency(format!(
            "header at {} would leave a gap above our tip at {tip_height}",
            first.height
        )));
    }

    // Headers we already have must match exactly, the rest must start right above the tip
    let mut already_stored = 0;
    for header in batch.iter().take_while(|header| header.height <= tip_height) {
        match stored_at(header.height)? {
            Some(stored) if stored.block_hash == header.block_hash => already_stored += 1,
            Some(stored) => {
                return Err(ChainError::HeadersInconsistency(format!(
                    "height {} already holds {}, refusing {}",
                    header.height, stored.block_hash, header.block_hash
                )))
            }
            None => {
                return Err(ChainError::HeadersInconsistency(format!(
                    "missing header at height {} below our tip",
                    header.height
                )))
            }
        }
    }

    if let Some(new) = batch.get(already_stored) {
        if new.height == 0 {
            return Ok(already_stored);
        }
        let parent = stored_at(new.height - 1)?.ok_or_else(|| {
            ChainError::HeadersInconsistency(format!("missing parent of {}", new.height))
        })?;
        if new.prev_block_hash != parent.block_hash {
            return Err(ChainError::HeadersInconsistency(format!(
                "header {} at {} doesn't build on our {}",
                new.block_hash, new.height, parent.block_hash
            )));
        }
        if new.height != tip_height + 1 {
            return Err(ChainError::HeadersInconsistency(format!(
                "header at {} isn't on top of our tip at {tip_height}",
                new.height
            )));
        }
    }

    Ok(already_stored)
}
