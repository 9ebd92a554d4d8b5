//! In-process peers for tests. A [MockNetwork] is a [Connector] whose peers live in memory and
//! serve a header chain mined on the spot on top of regtest's genesis.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::block::Version;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::transaction;
use bitcoin::Amount;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::CompactTarget;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxMerkleNode;
use bitcoin::TxOut;
use bitcoin::Witness;
use canopy_chain::verify_proof_of_work;
use canopy_chain::ChainParams;
use canopy_chain::HeaderRecord;
use canopy_chain::HeadersRepository;
use canopy_chain::MemoryHeadersStore;
use canopy_chain::Network;
use tokio::sync::mpsc::UnboundedSender;

use crate::address_man::PeerDescriptor;
use crate::address_man::Protocol;
use crate::headers_reactor::ChainSyncEngine;
use crate::pool::ConnectionPool;
use crate::transport::Connector;
use crate::transport::DefaultVersionFilter;
use crate::transport::PeerInfo;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::transport::PeerTransport;
use crate::transport::TransportError;
use crate::transport::TransportEvent;
use crate::SyncConfig;

/// Regtest's easiest target, about half of all hashes meet it
const REGTEST_BITS: u32 = 0x207fffff;

pub fn regtest_genesis() -> Header {
    ChainParams::from(Network::Regtest).genesis
}

fn coinbase(height: u32, salt: u32) -> Transaction {
    let mut script_sig = height.to_le_bytes().to_vec();
    script_sig.extend_from_slice(&salt.to_le_bytes());

    Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(50 * 100_000_000),
            script_pubkey: ScriptBuf::new(),
        }],
    }
}

/// Mines `count` blocks on top of `parent`, which sits at `parent_height`. Chains mined with a
/// different `salt` on the same parent never share a block.
pub fn mine_blocks(parent: &Header, parent_height: u32, count: u32, salt: u32) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut parent = *parent;

    for height in parent_height + 1..=parent_height + count {
        let txdata = vec![coinbase(height, salt)];
        let mut block = Block {
            header: Header {
                version: Version::ONE,
                prev_blockhash: parent.block_hash(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: parent.time + 600,
                bits: CompactTarget::from_consensus(REGTEST_BITS),
                nonce: 0,
            },
            txdata,
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();

        while verify_proof_of_work(&serialize(&block.header), &block.header.block_hash()).is_err()
        {
            block.header.nonce += 1;
        }

        parent = block.header;
        blocks.push(block);
    }

    blocks
}

/// Headers on top of `parent`, see [mine_blocks]
pub fn mine_chain(parent: &Header, parent_height: u32, count: u32, salt: u32) -> Vec<Header> {
    mine_blocks(parent, parent_height, count, salt)
        .into_iter()
        .map(|block| block.header)
        .collect()
}

/// A full chain, starting at regtest's genesis. `chain[height]` is the header at `height`.
pub fn regtest_chain(tip_height: u32) -> Vec<Header> {
    let genesis = regtest_genesis();
    let mut chain = vec![genesis];
    chain.extend(mine_chain(&genesis, 0, tip_height, 0));
    chain
}

/// A header on top of `parent` that does not have enough work
pub fn header_without_work(parent: &Header) -> Header {
    let mut header = Header {
        version: Version::ONE,
        prev_blockhash: parent.block_hash(),
        merkle_root: TxMerkleNode::all_zeros(),
        time: parent.time + 600,
        bits: CompactTarget::from_consensus(REGTEST_BITS),
        nonce: 0,
    };
    while verify_proof_of_work(&serialize(&header), &header.block_hash()).is_ok() {
        header.nonce += 1;
    }
    header
}

pub fn records(chain: &[Header]) -> Vec<HeaderRecord> {
    chain
        .iter()
        .enumerate()
        .map(|(height, header)| HeaderRecord::from_header(header, height as u32))
        .collect()
}

/// A peer that serves whatever chain we give it
pub struct MockPeer {
    host: String,
    port: u16,
    protocol: spin::Mutex<Protocol>,
    chain: spin::Mutex<Vec<Header>>,
    blocks: spin::Mutex<HashMap<BlockHash, Vec<u8>>>,
    fee_rate: AtomicU64,
    /// Requests never get an answer
    stalled: AtomicBool,
    /// Connections to this peer fail
    unreachable: AtomicBool,
    requests: AtomicUsize,
    events: spin::Mutex<Option<UnboundedSender<TransportEvent>>>,
}

impl MockPeer {
    fn new(host: String, chain: Vec<Header>) -> Self {
        MockPeer {
            host,
            port: 50001,
            protocol: spin::Mutex::new(Protocol::Electrum),
            chain: spin::Mutex::new(chain),
            blocks: spin::Mutex::new(HashMap::new()),
            fee_rate: AtomicU64::new(1_000),
            stalled: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            events: spin::Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.host.clone(), self.port, *self.protocol.lock())
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        *self.protocol.lock() = protocol;
    }

    pub fn set_chain(&self, chain: Vec<Header>) {
        *self.chain.lock() = chain;
    }

    pub fn set_blocks(&self, blocks: &[Block]) {
        let mut served = self.blocks.lock();
        for block in blocks {
            served.insert(block.block_hash(), serialize(block));
        }
    }

    /// Serves `bytes` when asked for `hash`, whatever they are
    pub fn set_raw_block(&self, hash: BlockHash, bytes: Vec<u8>) {
        self.blocks.lock().insert(hash, bytes);
    }

    pub fn set_fee_rate(&self, fee_rate: u64) {
        self.fee_rate.store(fee_rate, Ordering::Relaxed);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Relaxed);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub fn requests_served(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn tip_height(&self) -> u32 {
        self.chain.lock().len().saturating_sub(1) as u32
    }

    /// Pushes an event as if the peer sent it. False if nobody is connected.
    pub fn push_event(&self, event: TransportEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Drops our end of the event channel, as if the peer hung up
    pub fn hang_up(&self) {
        self.events.lock().take();
    }

    /// Electrum servers answer by height. P2P peers start after the first locator hash they
    /// know, or right after genesis if they know none of them.
    fn answer(&self, request: PeerRequest, protocol: Protocol) -> Result<PeerResponse, TransportError> {
        let chain = self.chain.lock();
        match request {
            PeerRequest::HeadersAfter {
                locator,
                height,
                count,
            } => {
                let start = match protocol {
                    Protocol::Electrum => height as usize + 1,
                    Protocol::P2p => locator
                        .iter()
                        .find_map(|hash| {
                            chain.iter().position(|header| header.block_hash() == *hash)
                        })
                        .unwrap_or(0)
                        + 1,
                };
                let start = start.min(chain.len());
                let end = (start + count as usize).min(chain.len());
                Ok(PeerResponse::Headers(chain[start..end].to_vec()))
            }
            PeerRequest::HeaderAtHeight(height) => chain
                .get(height as usize)
                .map(|header| PeerResponse::Header(*header))
                .ok_or_else(|| TransportError::Remote("height out of range".into())),
            PeerRequest::Block(hash) => self
                .blocks
                .lock()
                .get(&hash)
                .map(|block| PeerResponse::Block(block.clone()))
                .ok_or_else(|| TransportError::Remote("block not found".into())),
            PeerRequest::EstimateFee(_) => {
                Ok(PeerResponse::FeeRate(self.fee_rate.load(Ordering::Relaxed)))
            }
            PeerRequest::Ping => Ok(PeerResponse::Pong),
        }
    }
}

pub struct MockTransport {
    peer: Arc<MockPeer>,
    protocol: Protocol,
    info: PeerInfo,
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn info(&self) -> &PeerInfo {
        &self.info
    }

    fn best_height(&self) -> u32 {
        self.peer.tip_height()
    }

    fn supports(&self, request: &PeerRequest) -> bool {
        match self.protocol {
            Protocol::P2p => matches!(
                request,
                PeerRequest::HeadersAfter { .. } | PeerRequest::Block(_) | PeerRequest::Ping
            ),
            Protocol::Electrum => !matches!(request, PeerRequest::Block(_)),
        }
    }

    async fn request(&self, request: PeerRequest) -> Result<PeerResponse, TransportError> {
        if !self.supports(&request) {
            return Err(TransportError::Unsupported);
        }
        self.peer.requests.fetch_add(1, Ordering::Relaxed);

        if self.peer.stalled.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }

        // Some latency, so identical requests overlap
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.peer.answer(request, self.protocol)
    }

    async fn subscribe_headers(&self) -> Result<(), TransportError> {
        let (header, height) = {
            let chain = self.peer.chain.lock();
            let Some(tip) = chain.last() else {
                return Err(TransportError::Remote("no chain".into()));
            };
            (*tip, chain.len() as u32 - 1)
        };

        self.peer.push_event(TransportEvent::NewTip { header, height });
        Ok(())
    }

    fn close(&self) {}
}

/// A set of [MockPeer]s, reachable through the [Connector] interface
pub struct MockNetwork {
    peers: Vec<Arc<MockPeer>>,
    online: AtomicBool,
}

impl MockNetwork {
    /// `count` Electrum servers, all on the same chain
    pub fn with_chain(count: usize, chain: Vec<Header>) -> Self {
        let peers = (0..count)
            .map(|i| Arc::new(MockPeer::new(format!("10.0.0.{i}"), chain.clone())))
            .collect();

        MockNetwork {
            peers,
            online: AtomicBool::new(true),
        }
    }

    /// `count` Electrum servers that only know regtest's genesis
    pub fn new(count: usize) -> Self {
        Self::with_chain(count, vec![regtest_genesis()])
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.peers[index].clone()
    }

    pub fn peer_descriptor(&self, index: usize) -> PeerDescriptor {
        self.peers[index].descriptor()
    }

    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.peers.iter().map(|peer| peer.descriptor()).collect()
    }

    /// Every peer switches to `chain`
    pub fn set_chain(&self, chain: Vec<Header>) {
        for peer in &self.peers {
            peer.set_chain(chain.clone());
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// The peer behind a descriptor
    pub fn find(&self, descriptor: &PeerDescriptor) -> Option<Arc<MockPeer>> {
        self.peers
            .iter()
            .find(|peer| peer.host == descriptor.host && peer.port == descriptor.port)
            .cloned()
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(
        &self,
        peer: &PeerDescriptor,
        _local_height: u32,
        events: UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let refused = || TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        let mock = self.find(peer).ok_or_else(refused)?;
        if mock.unreachable.load(Ordering::Relaxed) {
            return Err(refused());
        }

        *mock.events.lock() = Some(events);
        let protocol = *mock.protocol.lock();
        let info = match protocol {
            Protocol::P2p => PeerInfo {
                user_agent: "/Satoshi:27.0.0/".into(),
                protocol_version: 70016,
                start_height: mock.tip_height(),
            },
            Protocol::Electrum => PeerInfo {
                user_agent: "ElectrumX 1.16.0".into(),
                protocol_version: 0,
                start_height: mock.tip_height(),
            },
        };

        Ok(Arc::new(MockTransport {
            peer: mock,
            protocol,
            info,
        }))
    }

    async fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }
}

/// A config for tests: short timeouts, regtest, and a rollback margin small enough to see
pub fn test_config() -> SyncConfig {
    SyncConfig {
        network: Network::Regtest,
        datadir: format!("./tmp-db/{}.canopy", rand::random::<u32>()),
        required_connections: 2,
        min_peers_agreement: 2,
        connect_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_millis(500),
        fetch_interval: Duration::from_millis(50),
        peers_retry_delay: Duration::from_millis(10),
        reorg_safety_margin: 10,
        ..SyncConfig::default()
    }
}

/// A pool connected to every peer of `network`
pub async fn connected_pool(network: &Arc<MockNetwork>, config: SyncConfig) -> Arc<ConnectionPool> {
    let peers = network.descriptors();
    let config = SyncConfig {
        required_connections: peers.len(),
        ..config
    };

    let pool = Arc::new(ConnectionPool::new(
        config,
        network.clone(),
        Arc::new(DefaultVersionFilter),
    ));
    pool.add_peers(&peers);
    pool.maintain_connections().await;
    assert_eq!(pool.established_count(), peers.len());

    pool
}

/// An initialized engine over an empty in-memory store
pub async fn engine_with(
    pool: Arc<ConnectionPool>,
    params: ChainParams,
) -> (Arc<ChainSyncEngine>, Arc<MemoryHeadersStore>) {
    let store = Arc::new(MemoryHeadersStore::new());
    let engine = Arc::new(ChainSyncEngine::new(
        pool.config().clone(),
        params,
        pool,
        store.clone(),
    ));
    engine.initialize().await.unwrap();

    (engine, store)
}

/// Checks that every stored header points to the one below it
pub fn assert_linked(store: &dyn HeadersRepository) {
    let headers = store.get_headers_since_height(0).unwrap();
    for pair in headers.windows(2) {
        assert_eq!(pair[1].height, pair[0].height + 1);
        assert_eq!(pair[1].prev_block_hash, pair[0].block_hash);
    }
}
