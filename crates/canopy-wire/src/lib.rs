// SPDX-License-Identifier: MIT

//! The networking half of canopy.
//!
//! A [pool::ConnectionPool] keeps a target number of connections to untrusted peers, either
//! Bitcoin P2P nodes or Electrum servers, scoring them and banning the ones that misbehave. The
//! [headers_reactor::ChainSyncEngine] uses the pool to keep our header chain aligned with the
//! network's best chain, checking proof-of-work, linkage and checkpoints on everything it
//! gets, and rolling back when it finds out it followed a chain that got reorganized. The
//! [blocks_reactor::BlocksSyncEngine] and [fee_estimator::FeeEstimator] are clients of both,
//! and [node_interface::NodeInterface] is what a user-facing layer talks to.

use std::net::SocketAddr;
use std::time::Duration;

use canopy_chain::Network;

use self::address_man::PeerDescriptor;
use self::address_man::Protocol;

pub mod address_man;
pub mod blocks_reactor;
pub mod connection;
pub mod error;
pub mod fee_estimator;
pub mod headers_reactor;
pub mod node_interface;
pub mod peer_sources;
pub mod pool;
pub mod transport;

#[cfg(test)]
mod tests;

pub use error::WireError;

#[derive(Debug, Clone)]
/// Everything the pool and the engines can be tuned with. Built once at startup and handed to
/// each component's constructor.
pub struct SyncConfig {
    /// The blockchain we are in, defaults to Bitcoin
    pub network: Network,
    /// Data directory, where we keep `peers.json`
    pub datadir: String,
    /// A SOCKS5 proxy every connection goes through. Defaults to None.
    pub proxy: Option<SocketAddr>,
    /// If not empty, we only connect to these peers
    pub connect: Vec<PeerDescriptor>,
    /// Which kinds of peers we use, defaults to both
    pub protocols: Vec<Protocol>,
    /// Whether to ask DNS seeds for P2P peers when we don't know enough of them
    pub dns_seeds: bool,
    /// User agent we announce to P2P peers and Electrum servers
    pub user_agent: String,

    /// How many established connections the pool tries to keep
    pub required_connections: usize,
    /// Score every new connection starts with. It goes up with good answers and down with
    /// errors, and a connection is evicted once it reaches zero.
    pub start_score: i32,
    /// Errors older than this don't count against a connection anymore
    pub expire_errors_after: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// How long a peer we just disconnected from stays out of the selectable pool
    pub ban_cooldown: Duration,
    /// How long a misbehaving peer is banned for
    pub ban_time: Duration,
    /// Interval between keep-alive rounds of the pool
    pub keepalive_interval: Duration,
    /// How long to wait before checking again, when we seem to be offline
    pub offline_backoff: Duration,
    /// P2P peers whose advertised height is this far below ours are rejected at handshake
    pub max_height_lag: u32,

    /// How many connections we need before we start syncing headers
    pub min_peers_agreement: usize,
    /// Share of answers that must agree for a quorum call to succeed
    pub quorum_ratio: f64,
    /// Interval between sync rounds when nothing is going on
    pub fetch_interval: Duration,
    /// How long to wait for peers when we don't have enough of them
    pub peers_retry_delay: Duration,
    /// How many of our latest headers we keep in memory to compare peer answers against
    pub window_size: usize,
    /// How many headers we ask for at once while catching up
    pub chunk_size: u32,
    /// How far back we roll the chain when we find out we're on a stale branch
    pub reorg_safety_margin: u32,
    /// How many rollbacks we try before giving up until the next successful sync
    pub max_recovery_attempts: u32,
    /// How many different peers a single request is tried with before giving up
    pub max_request_attempts: usize,

    /// How many of the latest blocks we keep around
    pub keep_blocks: u32,
    /// How many blocks we download at the same time
    pub max_blocks_inflight: usize,

    /// How many peers must agree on a fee estimate
    pub fee_consensus: usize,
    /// How far from the median (in percent) a fee estimate may be and still agree
    pub fee_distance_pct: u64,
    /// Fee estimates older than this are discarded
    pub fee_max_age: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            network: Network::Bitcoin,
            datadir: ".canopy".to_string(),
            proxy: None,
            connect: Vec::new(),
            protocols: vec![Protocol::Electrum, Protocol::P2p],
            dns_seeds: true,
            user_agent: format!("/canopy:{}/", env!("CARGO_PKG_VERSION")),

            required_connections: 8,
            start_score: 10,
            expire_errors_after: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ban_cooldown: Duration::from_secs(60),
            ban_time: Duration::from_secs(60 * 60 * 24),
            keepalive_interval: Duration::from_secs(3),
            offline_backoff: Duration::from_secs(10),
            max_height_lag: 6,

            min_peers_agreement: 2,
            quorum_ratio: 0.8,
            fetch_interval: Duration::from_secs(20),
            peers_retry_delay: Duration::from_secs(2),
            window_size: 6,
            chunk_size: canopy_chain::RETARGET_INTERVAL,
            reorg_safety_margin: 2 * canopy_chain::RETARGET_INTERVAL,
            max_recovery_attempts: 3,
            max_request_attempts: 5,

            keep_blocks: 6,
            max_blocks_inflight: 4,

            fee_consensus: 3,
            fee_distance_pct: 20,
            fee_max_age: Duration::from_secs(600),
        }
    }
}
