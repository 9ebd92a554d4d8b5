//! Keeps our header chain in line with the network's best chain.
//!
//! The [ChainSyncEngine] holds a small window with our latest headers. Sync rounds send one
//! peer a locator of our chain, the whole window followed by older headers with a growing step
//! down to genesis, and the peer answers with the headers after the newest one it shares with
//! us. On top of that, peers push new tips to us, and a tip that builds on ours is accepted
//! right away.
//!
//! Every header is checked for proof-of-work, linkage to its parent and checkpoints before it
//! is saved. A peer that sends a header failing any of these is banned. A branch competing with
//! ours is only taken once all its headers passed these checks, and it ends higher than our tip
//! with more work than the headers it replaces. A reply that builds on nothing we know is
//! dropped. If the store tells us our chain is inconsistent, we roll back a safety margin and
//! sync forward again.
//!
//! Chain state lives behind one async mutex, and every batch is applied against the state we
//! find once the reply arrives. The mutex is never held while we wait on a peer.

use std::collections::VecDeque;
use std::sync::Arc;

use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::consensus::serialize;
use bitcoin::BlockHash;
use bitcoin::Work;
use canopy_chain::verify_header;
use canopy_chain::ChainError;
use canopy_chain::ChainParams;
use canopy_chain::HeaderRecord;
use canopy_chain::HeadersRepository;
use canopy_common::EventBus;
use canopy_common::Subscription;
use log::debug;
use log::info;
use log::warn;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::connection::ConnectionId;
use crate::error::ConnectionError;
use crate::pool::ConnectionPool;
use crate::pool::DisconnectReason;
use crate::pool::PoolEvent;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::SyncConfig;
use crate::WireError;

/// Heights and hashes of our chain, newest first
type Locator = Vec<(u32, BlockHash)>;

/// How often a running sync loop checks whether it should stop
const KILL_SIGNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing happened yet
    Initial,
    /// We know we are behind, and we are downloading headers
    CatchingUp,
    /// The last peer we asked had nothing new for us
    Synced,
    /// We rolled back after finding our chain got reorganized, and we are syncing forward again
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Not enough connections to start a round
    PeersNotReady,
    /// We caught up, our tip is at this height
    Synced(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What happened to a batch of headers
pub enum BatchOutcome {
    /// This many headers were added on top of our chain. May be zero, if the batch only
    /// repeated headers we already have.
    Extended(u32),
    /// We already have every header in this batch, nothing to do
    Duplicate,
    /// The batch doesn't connect to our chain, or it's a branch without more work than ours
    Ignored,
    /// We switched to the branch in this batch, this many headers replaced ours
    Reorganized(u32),
    /// The store found our chain inconsistent. We rolled back and will sync forward again.
    Recovered,
}

#[derive(Debug)]
struct EngineState {
    /// Our latest headers, oldest first. Never empty after [ChainSyncEngine::initialize].
    window: VecDeque<HeaderRecord>,
    /// The connection that answered our latest sync request
    last_connection: Option<ConnectionId>,
    /// Rollbacks since we were last synced
    recovery_attempts: u32,
    /// The highest height any peer told us about
    network_height: u32,
}

pub struct ChainSyncEngine {
    config: SyncConfig,
    params: ChainParams,
    pool: Arc<ConnectionPool>,
    store: Arc<dyn HeadersRepository>,
    state: Mutex<EngineState>,
    /// Held for a whole sync round, so only one runs at a time
    round: Mutex<()>,
    sync_state: watch::Sender<SyncState>,
    best_headers: EventBus<HeaderRecord>,
    /// Wakes the main loop before its timer runs out
    wake: Notify,
}

impl ChainSyncEngine {
    pub fn new(
        config: SyncConfig,
        params: ChainParams,
        pool: Arc<ConnectionPool>,
        store: Arc<dyn HeadersRepository>,
    ) -> Self {
        let (sync_state, _) = watch::channel(SyncState::Initial);

        ChainSyncEngine {
            config,
            params,
            pool,
            store,
            state: Mutex::new(EngineState {
                window: VecDeque::new(),
                last_connection: None,
                recovery_attempts: 0,
                network_height: 0,
            }),
            round: Mutex::new(()),
            sync_state,
            best_headers: EventBus::new(),
            wake: Notify::new(),
        }
    }

    /// Makes sure the store has our network's genesis, then fills the window from it
    pub async fn initialize(&self) -> Result<(), WireError> {
        let genesis = HeaderRecord::from_header(&self.params.genesis, 0);
        match self.store.get_header_at_height(0)? {
            None => {
                info!("empty header store, starting from genesis");
                self.store.save_header(&genesis)?;
            }
            Some(stored) if stored.block_hash != genesis.block_hash => {
                return Err(ChainError::NetworkHeadersInconsistency {
                    height: 0,
                    expected: genesis.block_hash,
                    found: stored.block_hash,
                }
                .into());
            }
            Some(_) => {}
        }

        let mut state = self.state.lock().await;
        self.load_window(&mut state)?;
        if let Some(tip) = state.window.back() {
            info!("header chain loaded, tip {} at {}", tip.block_hash, tip.height);
        }

        Ok(())
    }

    fn load_window(&self, state: &mut EngineState) -> Result<(), WireError> {
        let tip = self
            .store
            .get_best_header()?
            .ok_or(ChainError::ChainNotInitialized)?;

        let since = tip
            .height
            .saturating_sub(self.config.window_size.saturating_sub(1) as u32);
        state.window = self.store.get_headers_since_height(since)?.into();
        self.pool.set_local_height(tip.height);

        Ok(())
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync_state.borrow()
    }

    /// A receiver that sees every change of [SyncState]
    pub fn watch_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync_state.subscribe()
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state() == SyncState::Synced
    }

    pub fn best_header(&self) -> Result<Option<HeaderRecord>, WireError> {
        Ok(self.store.get_best_header()?)
    }

    /// The highest height any peer announced
    pub async fn network_height(&self) -> u32 {
        self.state.lock().await.network_height
    }

    pub async fn last_connection(&self) -> Option<ConnectionId> {
        self.state.lock().await.last_connection
    }

    /// New best headers, only sent while we are synced
    pub fn subscribe_best_headers(&self) -> Subscription<HeaderRecord> {
        self.best_headers.subscribe()
    }

    pub fn unsubscribe_best_headers(&self, id: u64) -> bool {
        self.best_headers.unsubscribe(id)
    }

    /// Asks the main loop to run a round now
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn set_sync_state(&self, state: SyncState) {
        let previous = self.sync_state.send_replace(state);
        if previous != state {
            debug!("sync state {previous:?} -> {state:?}");
        }
    }

    /// Asks peers for headers until one of them has nothing new for us.
    ///
    /// Each request carries a locator of our chain, and the reply is applied to whatever our
    /// chain looks like once it arrives. The state lock is never held while we wait on a peer.
    pub async fn sync_round(&self) -> Result<RoundOutcome, WireError> {
        if self.pool.established_count() < self.config.min_peers_agreement {
            debug!(
                "waiting for peers, {} of {} connected",
                self.pool.established_count(),
                self.config.min_peers_agreement
            );
            return Ok(RoundOutcome::PeersNotReady);
        }

        let _round = self.round.lock().await;

        loop {
            let locator = {
                let mut state = self.state.lock().await;
                if state.window.is_empty() {
                    self.load_window(&mut state)?;
                }
                self.locator(&state)?
            };

            let request = headers_request(&locator, self.config.chunk_size);
            let (connection, response) = self.pool.call_one(request).await?;
            let headers = self.expect_headers(connection, response)?;

            let mut outcome = self.apply_reply(connection, &headers, &locator).await?;
            if outcome.is_none() {
                outcome = self.follow_fork(connection, &locator).await?;
            }

            match outcome {
                Some(BatchOutcome::Extended(new)) if new > 0 => {
                    if !self.is_synced() {
                        self.set_sync_state(SyncState::CatchingUp);
                    }
                    debug!("got {new} headers from {connection}");
                }
                Some(BatchOutcome::Reorganized(_) | BatchOutcome::Recovered) => {}
                _ => return self.finish_round(connection).await,
            }
        }
    }

    async fn finish_round(&self, connection: ConnectionId) -> Result<RoundOutcome, WireError> {
        let mut state = self.state.lock().await;
        let tip = *state
            .window
            .back()
            .ok_or(ChainError::ChainNotInitialized)?;
        state.recovery_attempts = 0;

        if !self.is_synced() {
            info!("headers synced, tip {} at {}", tip.block_hash, tip.height);
            self.set_sync_state(SyncState::Synced);
            self.best_headers.publish(tip);
        }
        if state.network_height > tip.height {
            debug!(
                "a peer claims height {}, but {connection} has nothing after {}",
                state.network_height, tip.height
            );
        }

        Ok(RoundOutcome::Synced(tip.height))
    }

    /// Heights and hashes of our chain, newest first: the whole window, then back to genesis
    /// with a step that doubles each time.
    fn locator(&self, state: &EngineState) -> Result<Locator, WireError> {
        let front = *state
            .window
            .front()
            .ok_or(ChainError::ChainNotInitialized)?;

        let mut locator: Locator = state
            .window
            .iter()
            .rev()
            .map(|record| (record.height, record.block_hash))
            .collect();

        let mut step: u32 = 1;
        let mut height = front.height;
        while height > 0 {
            height = height.saturating_sub(step);
            step = step.saturating_mul(2);

            let record = self.store.get_header_at_height(height)?.ok_or_else(|| {
                ChainError::HeadersInconsistency(format!("no header at height {height}"))
            })?;
            locator.push((record.height, record.block_hash));
        }

        Ok(locator)
    }

    fn expect_headers(
        &self,
        connection: ConnectionId,
        response: PeerResponse,
    ) -> Result<Vec<Header>, WireError> {
        match response {
            PeerResponse::Headers(headers) => Ok(headers),
            _ => {
                self.pool
                    .disconnect(connection, DisconnectReason::Misbehaving);
                Err(ConnectionError::UnexpectedResponse.into())
            }
        }
    }

    async fn apply_reply(
        &self,
        connection: ConnectionId,
        headers: &[Header],
        locator: &[(u32, BlockHash)],
    ) -> Result<Option<BatchOutcome>, WireError> {
        let mut state = self.state.lock().await;
        state.last_connection = Some(connection);
        self.process_headers(&mut state, connection, headers, locator)
    }

    /// Electrum servers answer by height, so a server on another branch replies with headers
    /// that build on nothing we sent. Walk our locator down until the server has the same
    /// header, and take its branch from there.
    async fn follow_fork(
        &self,
        connection: ConnectionId,
        locator: &[(u32, BlockHash)],
    ) -> Result<Option<BatchOutcome>, WireError> {
        let Some(peer) = self.pool.get_connection(connection) else {
            return Ok(None);
        };
        if !peer.supports(&PeerRequest::HeaderAtHeight(0)) {
            debug!("{connection} answered with headers that build on nothing we know");
            return Ok(None);
        }

        for (index, (height, hash)) in locator.iter().enumerate().skip(1) {
            let response = peer.request(PeerRequest::HeaderAtHeight(*height)).await?;
            let PeerResponse::Header(header) = response else {
                self.pool
                    .disconnect(connection, DisconnectReason::Misbehaving);
                return Err(ConnectionError::UnexpectedResponse.into());
            };
            if header.block_hash() != *hash {
                continue;
            }

            debug!("{connection} shares our chain up to {height}");
            let shared = &locator[index..];
            let response = peer
                .request(headers_request(shared, self.config.chunk_size))
                .await?;
            let headers = self.expect_headers(connection, response)?;
            return self.apply_reply(connection, &headers, shared).await;
        }

        Ok(None)
    }

    /// Headers a peer pushed to us without us asking. They are used if they build on our
    /// window, either as new tips or as a branch with more work than ours.
    pub async fn on_headers(
        &self,
        connection: ConnectionId,
        headers: &[Header],
    ) -> Result<BatchOutcome, WireError> {
        let mut state = self.state.lock().await;

        let outcome = match self.process_headers(&mut state, connection, headers, &[])? {
            Some(outcome) => outcome,
            None => {
                debug!("ignoring {} unrelated headers from {connection}", headers.len());
                BatchOutcome::Ignored
            }
        };

        // The peer may have more
        if matches!(outcome, BatchOutcome::Extended(1..) | BatchOutcome::Reorganized(_)) {
            self.wake();
        }

        Ok(outcome)
    }

    /// A peer told us about its new tip, along with its height
    pub async fn on_new_header(
        &self,
        connection: ConnectionId,
        header: &Header,
        height: u32,
    ) -> Result<(), WireError> {
        let record = HeaderRecord::from_bytes(&serialize(header), height)?;
        if let Err(e) = verify_header(&record.header_bytes, &self.params) {
            self.punish(connection, &e);
            return Err(e.into());
        }

        let mut state = self.state.lock().await;
        state.network_height = state.network_height.max(height);

        if !self.is_synced() {
            self.wake();
            return Ok(());
        }

        let tip = *state
            .window
            .back()
            .ok_or(ChainError::ChainNotInitialized)?;

        if height < tip.height {
            return Ok(());
        }

        if height == tip.height {
            if record.block_hash == tip.block_hash {
                return Ok(());
            }

            // Same height, different hash. The store refuses it, and we go looking for the
            // branch it belongs to.
            self.check_checkpoint(connection, &record)?;
            return match self.store.save_header(&record) {
                Err(ChainError::HeadersInconsistency(reason)) => {
                    info!(
                        "{connection} announced {} at {height}, we have {}: {reason}",
                        record.block_hash, tip.block_hash
                    );
                    self.roll_back(&mut state)
                }
                Err(e) => Err(e.into()),
                Ok(()) => self.load_window(&mut state),
            };
        }

        if height == tip.height + 1 && record.prev_block_hash == tip.block_hash {
            self.check_checkpoint(connection, &record)?;
            match self.store.save_header(&record) {
                Ok(()) => {}
                Err(ChainError::HeadersInconsistency(reason)) => {
                    warn!("store refused {}: {reason}", record.block_hash);
                    return self.roll_back(&mut state);
                }
                Err(e) => return Err(e.into()),
            }

            self.push_to_window(&mut state, &[record]);
            self.best_headers.publish(record);
            debug!("new tip {} at {height} from {connection}", record.block_hash);
            return Ok(());
        }

        // There's a gap, or the tip is on a branch we don't know
        self.wake();
        Ok(())
    }

    /// Forgets a connection that went away
    pub async fn on_disconnected(&self, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        if state.last_connection == Some(connection) {
            state.last_connection = None;
        }
    }

    /// Places a batch on our chain and applies it. The batch may build on our window or on a
    /// `locator` entry we sent. Returns `None` if it builds on neither.
    ///
    /// Headers we already have are skipped. Whatever is left either extends our tip, or is a
    /// competing branch that replaces ours only if it ends higher and has more work.
    fn process_headers(
        &self,
        state: &mut EngineState,
        connection: ConnectionId,
        headers: &[Header],
        locator: &[(u32, BlockHash)],
    ) -> Result<Option<BatchOutcome>, WireError> {
        let Some(first) = headers.first() else {
            return Ok(Some(BatchOutcome::Extended(0)));
        };
        let Some(anchor) = self.find_anchor(state, &first.prev_blockhash, locator)? else {
            return Ok(None);
        };
        let tip = *state
            .window
            .back()
            .ok_or(ChainError::ChainNotInitialized)?;

        let mut known = 0;
        while known < headers.len() && anchor.height + 1 + (known as u32) <= tip.height {
            let ours = self.header_at(state, anchor.height + 1 + known as u32)?;
            if ours.block_hash != headers[known].block_hash() {
                break;
            }
            known += 1;
        }

        if known == headers.len() {
            return Ok(Some(BatchOutcome::Duplicate));
        }

        let parent = self.header_at(state, anchor.height + known as u32)?;
        let records = match self.validate_new_headers(&parent, &headers[known..]) {
            Ok(records) => records,
            Err(e) => {
                self.punish(connection, &e);
                return Err(e.into());
            }
        };

        let outcome = match parent.height == tip.height {
            true => self.extend(state, connection, &records)?,
            false => self.switch_branch(state, connection, &parent, &records)?,
        };

        Ok(Some(outcome))
    }

    /// The header `hash` builds on, if it's in our window, or in `locator` and still ours
    fn find_anchor(
        &self,
        state: &EngineState,
        hash: &BlockHash,
        locator: &[(u32, BlockHash)],
    ) -> Result<Option<HeaderRecord>, WireError> {
        if let Some(record) = state.window.iter().find(|record| record.block_hash == *hash) {
            return Ok(Some(*record));
        }

        let Some((height, _)) = locator.iter().find(|(_, locator_hash)| locator_hash == hash)
        else {
            return Ok(None);
        };

        // Our chain may have moved since the request went out
        Ok(self
            .store
            .get_header_at_height(*height)?
            .filter(|record| record.block_hash == *hash))
    }

    fn header_at(&self, state: &EngineState, height: u32) -> Result<HeaderRecord, WireError> {
        if let Some(record) = state.window.iter().find(|record| record.height == height) {
            return Ok(*record);
        }

        let record = self.store.get_header_at_height(height)?.ok_or_else(|| {
            ChainError::HeadersInconsistency(format!("no header at height {height}"))
        })?;
        Ok(record)
    }

    fn extend(
        &self,
        state: &mut EngineState,
        connection: ConnectionId,
        records: &[HeaderRecord],
    ) -> Result<BatchOutcome, WireError> {
        match self.store.save_headers(records) {
            Ok(()) => {}
            Err(ChainError::HeadersInconsistency(reason)) => {
                warn!("store refused headers from {connection}: {reason}");
                self.roll_back(state)?;
                return Ok(BatchOutcome::Recovered);
            }
            Err(e) => return Err(e.into()),
        }

        self.push_to_window(state, records);
        if self.is_synced() {
            if let Some(last) = records.last() {
                self.best_headers.publish(*last);
            }
        }

        Ok(BatchOutcome::Extended(records.len() as u32))
    }

    /// Replaces our headers after `parent` with `branch`, if the branch ends higher than our
    /// tip and has more work than the headers it replaces. Forks deeper than
    /// `reorg_safety_margin` are never followed.
    fn switch_branch(
        &self,
        state: &mut EngineState,
        connection: ConnectionId,
        parent: &HeaderRecord,
        branch: &[HeaderRecord],
    ) -> Result<BatchOutcome, WireError> {
        let tip = *state
            .window
            .back()
            .ok_or(ChainError::ChainNotInitialized)?;
        let Some(branch_tip) = branch.last() else {
            return Ok(BatchOutcome::Duplicate);
        };

        let depth = tip.height - parent.height;
        if depth > self.config.reorg_safety_margin {
            warn!(
                "{connection} is on a branch forking {depth} headers below our tip, not following it"
            );
            return Ok(BatchOutcome::Ignored);
        }

        let ours = self.store.get_headers_since_height(parent.height + 1)?;
        let our_work = chain_work(&ours)?;
        let their_work = chain_work(branch)?;
        if branch_tip.height <= tip.height || their_work <= our_work {
            debug!(
                "{connection} is on a branch from {} to {} without more work than ours",
                parent.height + 1,
                branch_tip.height
            );
            return Ok(BatchOutcome::Ignored);
        }

        info!(
            "switching to a branch with more work from {connection}, forking after {}, new tip {} at {}",
            parent.height, branch_tip.block_hash, branch_tip.height
        );
        self.store.remove_headers_after_height(parent.height)?;
        if let Err(e) = self.store.save_headers(branch) {
            // The next round syncs forward from the fork point
            self.load_window(state)?;
            return Err(e.into());
        }

        self.load_window(state)?;
        if self.is_synced() {
            self.best_headers.publish(*branch_tip);
        }

        Ok(BatchOutcome::Reorganized(branch.len() as u32))
    }

    /// Checks new headers one by one, on top of `parent`: each must link to the one before it,
    /// have enough work, and match the checkpoint at its height, if any.
    fn validate_new_headers(
        &self,
        parent: &HeaderRecord,
        headers: &[Header],
    ) -> Result<Vec<HeaderRecord>, ChainError> {
        let mut records = Vec::with_capacity(headers.len());
        let mut parent = *parent;

        for header in headers {
            let height = parent.height + 1;
            let record = HeaderRecord::from_bytes(&serialize(header), height)?;

            if !record.extends(&parent) {
                return Err(ChainError::ChainBroken { height });
            }
            verify_header(&record.header_bytes, &self.params)?;
            if let Some(expected) = self.params.checkpoint_at(height) {
                if expected != record.block_hash {
                    return Err(ChainError::NetworkHeadersInconsistency {
                        height,
                        expected,
                        found: record.block_hash,
                    });
                }
            }

            records.push(record);
            parent = record;
        }

        Ok(records)
    }

    fn check_checkpoint(
        &self,
        connection: ConnectionId,
        record: &HeaderRecord,
    ) -> Result<(), WireError> {
        let Some(expected) = self.params.checkpoint_at(record.height) else {
            return Ok(());
        };

        if expected == record.block_hash {
            return Ok(());
        }

        let error = ChainError::NetworkHeadersInconsistency {
            height: record.height,
            expected,
            found: record.block_hash,
        };
        self.punish(connection, &error);
        Err(error.into())
    }

    fn punish(&self, connection: ConnectionId, error: &ChainError) {
        if !error.is_peer_fault() {
            return;
        }

        warn!("{connection} sent us invalid headers: {error}");
        self.pool
            .disconnect(connection, DisconnectReason::Misbehaving);
    }

    fn push_to_window(&self, state: &mut EngineState, records: &[HeaderRecord]) {
        state.window.extend(records.iter().copied());
        while state.window.len() > self.config.window_size.max(1) {
            state.window.pop_front();
        }

        if let Some(tip) = state.window.back() {
            state.network_height = state.network_height.max(tip.height);
            self.pool.set_local_height(tip.height);
        }
    }

    /// Rolls our chain back `reorg_safety_margin` headers and lets the next sync round rebuild
    /// it from the network. Gives up with [WireError::RetryExhausted] after
    /// `max_recovery_attempts` rollbacks without getting synced in between.
    pub async fn recover(&self) -> Result<(), WireError> {
        let mut state = self.state.lock().await;
        self.roll_back(&mut state)
    }

    fn roll_back(&self, state: &mut EngineState) -> Result<(), WireError> {
        state.recovery_attempts += 1;
        if state.recovery_attempts > self.config.max_recovery_attempts {
            let attempts = self.config.max_recovery_attempts as usize;
            warn!("still inconsistent after {attempts} rollbacks, giving up for now");
            state.recovery_attempts = 0;
            self.set_sync_state(SyncState::CatchingUp);
            return Err(WireError::RetryExhausted { attempts });
        }

        let tip = self
            .store
            .get_best_header()?
            .ok_or(ChainError::ChainNotInitialized)?;
        let rollback_to = tip.height.saturating_sub(self.config.reorg_safety_margin);
        let removed = self.store.remove_headers_after_height(rollback_to)?;
        warn!(
            "rolled back {removed} headers to height {rollback_to} (attempt {})",
            state.recovery_attempts
        );

        self.load_window(state)?;
        state.last_connection = None;
        self.set_sync_state(SyncState::Recovering);
        self.wake();

        Ok(())
    }

    fn spawn_event_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.pool.subscribe();
        let engine = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let result = match event {
                    PoolEvent::Headers(connection, headers) => engine
                        .on_headers(connection, &headers)
                        .await
                        .map(|_| ()),
                    PoolEvent::NewTip {
                        connection,
                        header,
                        height,
                    } => engine.on_new_header(connection, &header, height).await,
                    PoolEvent::Disconnected(connection) => {
                        engine.on_disconnected(connection).await;
                        Ok(())
                    }
                    PoolEvent::Connected(_) => {
                        if !engine.is_synced() {
                            engine.wake();
                        }
                        Ok(())
                    }
                    PoolEvent::BlockAnnounced(..) => Ok(()),
                };

                if let Err(e) = result {
                    debug!("error while handling peer event: {e}");
                }
            }
        })
    }

    /// Runs sync rounds until `kill_signal` is set. A round starts every `fetch_interval`,
    /// sooner if something tells us there's work to do, and every `peers_retry_delay` while we
    /// are short on peers.
    pub async fn run(self: Arc<Self>, kill_signal: Arc<RwLock<bool>>) {
        let events = self.spawn_event_handler();

        loop {
            if *kill_signal.read().await {
                break;
            }

            let round = tokio::select! {
                round = self.sync_round() => round,
                _ = killed(&kill_signal) => break,
            };

            let delay = match round {
                Ok(RoundOutcome::PeersNotReady) => self.config.peers_retry_delay,
                Ok(RoundOutcome::Synced(_)) => self.config.fetch_interval,
                Err(e) => {
                    warn!("sync round failed: {e}");
                    self.config.peers_retry_delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = self.wake.notified() => {},
                _ = killed(&kill_signal) => break,
            }
        }

        events.abort();
        info!("headers sync stopped");
    }
}

/// Resolves once `kill_signal` is set
async fn killed(kill_signal: &RwLock<bool>) {
    while !*kill_signal.read().await {
        tokio::time::sleep(KILL_SIGNAL_POLL).await;
    }
}

fn headers_request(locator: &[(u32, BlockHash)], count: u32) -> PeerRequest {
    PeerRequest::HeadersAfter {
        locator: locator.iter().map(|(_, hash)| *hash).collect(),
        height: locator.first().map(|(height, _)| *height).unwrap_or_default(),
        count,
    }
}

/// Total work of `records`, `None` if there are none
fn chain_work(records: &[HeaderRecord]) -> Result<Option<Work>, ChainError> {
    let mut total: Option<Work> = None;
    for record in records {
        let work = record.header()?.work();
        total = Some(match total {
            Some(total) => total + work,
            None => work,
        });
    }

    Ok(total)
}
