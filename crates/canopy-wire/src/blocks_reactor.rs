//! Downloads the bodies of our most recent blocks.
//!
//! We only keep the last `keep_blocks` blocks around. Every time the header chain moves, the
//! missing ones are fetched from P2P peers, checked against the header we already trust, and
//! everything older is pruned.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::consensus::deserialize;
use bitcoin::Block;
use bitcoin::BlockHash;
use canopy_chain::BlocksRepository;
use canopy_chain::ChainError;
use canopy_chain::HeaderRecord;
use canopy_chain::HeadersRepository;
use canopy_common::try_and_log;
use canopy_common::Subscription;
use futures::stream;
use futures::StreamExt;
use log::debug;
use log::info;
use log::warn;
use tokio::sync::RwLock;

use crate::error::ConnectionError;
use crate::pool::ConnectionPool;
use crate::pool::DisconnectReason;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::SyncConfig;
use crate::WireError;

/// How far below the tip we look for a block someone asks for by hash
const RECENT_BLOCKS_LOOKUP: u32 = 144;

pub struct BlocksSyncEngine {
    config: SyncConfig,
    pool: Arc<ConnectionPool>,
    headers: Arc<dyn HeadersRepository>,
    blocks: Arc<dyn BlocksRepository>,
}

impl BlocksSyncEngine {
    pub fn new(
        config: SyncConfig,
        pool: Arc<ConnectionPool>,
        headers: Arc<dyn HeadersRepository>,
        blocks: Arc<dyn BlocksRepository>,
    ) -> Self {
        BlocksSyncEngine {
            config,
            pool,
            headers,
            blocks,
        }
    }

    /// Downloads the block for `header` and saves it. The block must hash to the header we
    /// have, and its transactions must match the merkle root, otherwise the peer that sent it
    /// is banned.
    pub async fn fetch_block(&self, header: &HeaderRecord) -> Result<Vec<u8>, WireError> {
        let (connection, response) = self
            .pool
            .call_one(PeerRequest::Block(header.block_hash))
            .await?;

        let PeerResponse::Block(bytes) = response else {
            self.pool
                .disconnect(connection, DisconnectReason::Misbehaving);
            return Err(ConnectionError::UnexpectedResponse.into());
        };

        let valid = deserialize::<Block>(&bytes).is_ok_and(|block| {
            block.block_hash() == header.block_hash && block.check_merkle_root()
        });
        if !valid {
            warn!(
                "{connection} sent an invalid block for {} at {}",
                header.block_hash, header.height
            );
            self.pool
                .disconnect(connection, DisconnectReason::Misbehaving);
            return Err(WireError::InvalidBlock(header.block_hash));
        }

        self.blocks
            .save_block(header.block_hash, header.height, bytes.clone())?;
        debug!("downloaded block {} at {}", header.block_hash, header.height);

        Ok(bytes)
    }

    /// Makes sure we have the last `keep_blocks` blocks up to `tip`, and drops anything older.
    /// Returns how many blocks were downloaded.
    pub async fn sync_to(&self, tip: &HeaderRecord) -> Result<usize, WireError> {
        let from = (tip.height + 1).saturating_sub(self.config.keep_blocks);

        let mut missing = Vec::new();
        for header in self.headers.get_headers_since_height(from)? {
            if header.height > tip.height {
                break;
            }
            if !self.blocks.has_block(&header.block_hash)? {
                missing.push(header);
            }
        }

        let wanted = missing.len();
        let downloaded = stream::iter(missing)
            .map(|header| async move { self.fetch_block(&header).await })
            .buffer_unordered(self.config.max_blocks_inflight.max(1))
            .filter(|result| {
                if let Err(e) = result {
                    debug!("block download failed: {e}");
                }
                futures::future::ready(result.is_ok())
            })
            .count()
            .await;

        let pruned = self.blocks.prune_below(from)?;
        if downloaded > 0 || pruned > 0 {
            info!(
                "downloaded {downloaded} of {wanted} blocks up to {}, pruned {pruned}",
                tip.height
            );
        }

        Ok(downloaded)
    }

    /// A block we have, or one of our recent blocks downloaded on demand
    pub async fn get_block(&self, hash: &BlockHash) -> Result<Vec<u8>, WireError> {
        if let Some(block) = self.blocks.get_block(hash)? {
            return Ok(block);
        }

        let tip = self
            .headers
            .get_best_header()?
            .ok_or(ChainError::ChainNotInitialized)?;
        let header = self
            .headers
            .get_headers_since_height(tip.height.saturating_sub(RECENT_BLOCKS_LOOKUP))?
            .into_iter()
            .find(|header| header.block_hash == *hash)
            .ok_or(ChainError::BlockNotPresent)?;

        self.fetch_block(&header).await
    }

    /// Follows new best headers until `kill_signal` is set
    pub async fn run(
        self: Arc<Self>,
        mut best_headers: Subscription<HeaderRecord>,
        kill_signal: Arc<RwLock<bool>>,
    ) {
        loop {
            if *kill_signal.read().await {
                break;
            }

            let tip = match tokio::time::timeout(Duration::from_secs(1), best_headers.recv()).await
            {
                Ok(Some(tip)) => tip,
                Ok(None) => break,
                Err(_) => continue,
            };

            // Only the newest tip matters
            let mut tip = tip;
            while let Some(newer) = best_headers.try_recv() {
                tip = newer;
            }

            try_and_log!(self.sync_to(&tip).await);
        }

        info!("blocks sync stopped");
    }
}
