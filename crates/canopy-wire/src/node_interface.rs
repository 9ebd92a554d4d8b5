//! node_interface, which holds [`NodeInterface`], the API a user-facing layer (an RPC server, a
//! wallet) uses to read what the node knows.
//!
//! While headers aren't synced, our chain may be far behind or on a stale branch, so chain
//! queries answer [`Availability::NotYetAvailable`] instead of returning data we can't stand
//! behind yet.

use std::sync::Arc;

use bitcoin::BlockHash;
use canopy_chain::HeaderRecord;
use canopy_chain::HeadersRepository;
use serde::Serialize;

use crate::address_man::Protocol;
use crate::blocks_reactor::BlocksSyncEngine;
use crate::fee_estimator::FeeEstimator;
use crate::headers_reactor::ChainSyncEngine;
use crate::headers_reactor::SyncState;
use crate::pool::ConnectionPool;
use crate::WireError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    Ready(T),
    /// We are still syncing, ask again later
    NotYetAvailable,
}

impl<T> Availability<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Availability::Ready(value) => Some(value),
            Availability::NotYetAvailable => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Availability::Ready(_))
    }
}

#[derive(Debug, Clone, Serialize)]
/// A connection, as shown to users
pub struct ConnectionInfo {
    pub id: u32,
    pub address: String,
    pub protocol: Protocol,
    pub best_height: u32,
    pub score: i32,
}

#[derive(Clone)]
pub struct NodeInterface {
    engine: Arc<ChainSyncEngine>,
    pool: Arc<ConnectionPool>,
    headers: Arc<dyn HeadersRepository>,
    blocks: Arc<BlocksSyncEngine>,
    fees: Arc<FeeEstimator>,
}

impl NodeInterface {
    pub fn new(
        engine: Arc<ChainSyncEngine>,
        pool: Arc<ConnectionPool>,
        headers: Arc<dyn HeadersRepository>,
        blocks: Arc<BlocksSyncEngine>,
        fees: Arc<FeeEstimator>,
    ) -> Self {
        NodeInterface {
            engine,
            pool,
            headers,
            blocks,
            fees,
        }
    }

    fn when_synced<T>(
        &self,
        query: impl FnOnce() -> Result<T, WireError>,
    ) -> Result<Availability<T>, WireError> {
        if !self.engine.is_synced() {
            return Ok(Availability::NotYetAvailable);
        }

        query().map(Availability::Ready)
    }

    pub fn get_best_header(&self) -> Result<Availability<Option<HeaderRecord>>, WireError> {
        self.when_synced(|| self.engine.best_header())
    }

    pub fn get_header_at_height(
        &self,
        height: u32,
    ) -> Result<Availability<Option<HeaderRecord>>, WireError> {
        self.when_synced(|| Ok(self.headers.get_header_at_height(height)?))
    }

    pub fn get_block_hash(&self, height: u32) -> Result<Availability<Option<BlockHash>>, WireError> {
        self.when_synced(|| {
            Ok(self
                .headers
                .get_header_at_height(height)?
                .map(|header| header.block_hash))
        })
    }

    /// A serialized block. Blocks we pruned or never had are downloaded, as long as they are
    /// recent.
    pub async fn get_block(&self, hash: &BlockHash) -> Result<Availability<Vec<u8>>, WireError> {
        if !self.engine.is_synced() {
            return Ok(Availability::NotYetAvailable);
        }

        Ok(Availability::Ready(self.blocks.get_block(hash).await?))
    }

    /// Fee rate in sat/kvB for confirmation within `target` blocks
    pub async fn estimate_fee(&self, target: u16) -> Result<u64, WireError> {
        self.fees.estimate_fee(target).await
    }

    pub fn connection_count(&self) -> usize {
        self.pool.established_count()
    }

    pub fn get_peer_info(&self) -> Vec<ConnectionInfo> {
        self.pool
            .established()
            .iter()
            .map(|connection| ConnectionInfo {
                id: connection.id(),
                address: connection.descriptor().to_string(),
                protocol: connection.descriptor().protocol,
                best_height: connection.best_height(),
                score: connection.score(),
            })
            .collect()
    }

    pub fn sync_state(&self) -> SyncState {
        self.engine.sync_state()
    }

    pub fn is_synced(&self) -> bool {
        self.engine.is_synced()
    }
}
