//! Keeps a set of live connections to untrusted peers and routes requests to them.
//!
//! The pool is the only owner of [Connection]s. A keep-alive task opens new connections when
//! we have fewer than we want and trims the worst one when we have too many, and a signal task
//! turns what connections tell us into [PoolEvent]s for whoever is subscribed. Connections that
//! run out of score or misbehave are disconnected here, and their peers are kept out of the
//! selectable set for a while.
//!
//! Requests go out either to a single random connection ([ConnectionPool::call_one]), retried
//! on a different connection if it fails, or to several distinct connections at once, in which
//! case the answers are put to a vote ([ConnectionPool::call]).

use std::collections::HashSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bitcoin::block::Header;
use bitcoin::BlockHash;
use canopy_chain::reach_quorum;
use canopy_common::try_and_log;
use canopy_common::unix_now;
use canopy_common::EventBus;
use canopy_common::Subscription;
use futures::future::join_all;
use log::debug;
use log::info;
use log::warn;
use rand::seq::IteratorRandom;
use rand::seq::SliceRandom;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::address_man::AddressMan;
use crate::address_man::PeerDescriptor;
use crate::address_man::PeerKey;
use crate::address_man::PeerState;
use crate::address_man::Protocol;
use crate::connection::Connection;
use crate::connection::ConnectionId;
use crate::connection::ConnectionSignal;
use crate::error::ConnectionError;
use crate::peer_sources::gather_peers;
use crate::peer_sources::PeerSource;
use crate::transport::Connector;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::transport::TransportEvent;
use crate::transport::VersionFilter;
use crate::SyncConfig;
use crate::WireError;

/// How often we save our peers to disk while running
const PEERS_DUMP_INTERVAL: Duration = Duration::from_secs(60 * 5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected(ConnectionId),
    Disconnected(ConnectionId),
    /// Headers a P2P peer pushed to us, heights unknown
    Headers(ConnectionId, Vec<Header>),
    /// A peer told us about its new tip
    NewTip {
        connection: ConnectionId,
        header: Header,
        height: u32,
    },
    BlockAnnounced(ConnectionId, BlockHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We don't need this peer right now, it may be selected again at any time
    Graceful,
    /// The peer went away or ran out of score, give it a short break
    Cooldown,
    /// The peer fed us invalid data, ban it for a long time
    Misbehaving,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What one keep-alive tick did
pub enum MaintenanceReport {
    /// We don't seem to have internet, nothing was touched
    Offline,
    Maintained { opened: usize, trimmed: usize },
}

pub struct ConnectionPool {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    filter: Arc<dyn VersionFilter>,
    address_man: spin::RwLock<AddressMan>,
    connections: spin::RwLock<Vec<Arc<Connection>>>,
    /// Peers we are opening a connection to right now
    connecting: spin::Mutex<HashSet<PeerKey>>,
    next_id: AtomicU32,
    /// Our best height, used to reject P2P peers that are too far behind
    local_height: AtomicU32,
    events: EventBus<PoolEvent>,
    signals: UnboundedSender<ConnectionSignal>,
    signals_rx: spin::Mutex<Option<UnboundedReceiver<ConnectionSignal>>>,
}

impl ConnectionPool {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        filter: Arc<dyn VersionFilter>,
    ) -> Self {
        let (signals, signals_rx) = unbounded_channel();
        let mut address_man = AddressMan::new();
        address_man.push_peers(&config.connect);

        ConnectionPool {
            config,
            connector,
            filter,
            address_man: spin::RwLock::new(address_man),
            connections: spin::RwLock::new(Vec::new()),
            connecting: spin::Mutex::new(HashSet::new()),
            next_id: AtomicU32::new(0),
            local_height: AtomicU32::new(0),
            events: EventBus::new(),
            signals,
            signals_rx: spin::Mutex::new(Some(signals_rx)),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Adds peers we may connect to. Ignored if we were told to only use a fixed set of peers.
    pub fn add_peers(&self, peers: &[PeerDescriptor]) -> usize {
        if !self.config.connect.is_empty() {
            return 0;
        }

        self.address_man.write().push_peers(peers)
    }

    /// Asks every source for peers and adds them. A failing source is logged and skipped.
    pub async fn load_peers(&self, sources: &[Box<dyn PeerSource>]) -> usize {
        let peers = gather_peers(sources).await;
        let added = self.add_peers(&peers);
        info!("loaded {added} new peers from {} sources", sources.len());

        added
    }

    pub fn known_peers(&self) -> usize {
        self.address_man.read().len()
    }

    pub fn peer_state(&self, peer: &PeerDescriptor) -> Option<PeerState> {
        self.address_man.read().state_of(peer)
    }

    pub fn dump_peers(&self) -> Result<(), WireError> {
        self.address_man.read().dump_peers(&self.config.datadir)?;
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription<PoolEvent> {
        self.events.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn set_local_height(&self, height: u32) {
        self.local_height.store(height, Ordering::Relaxed);
    }

    pub fn local_height(&self) -> u32 {
        self.local_height.load(Ordering::Relaxed)
    }

    pub fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|connection| connection.id() == id)
            .cloned()
    }

    /// Every connection that is up right now
    pub fn established(&self) -> Vec<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .filter(|connection| connection.is_connected())
            .cloned()
            .collect()
    }

    pub fn established_count(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|connection| connection.is_connected())
            .count()
    }

    /// One keep-alive tick: forget old errors, let expired bans go, then open or trim
    /// connections until we are at `required_connections`.
    pub async fn maintain_connections(&self) -> MaintenanceReport {
        if !self.connector.is_online().await {
            return MaintenanceReport::Offline;
        }

        let now = Instant::now();
        for connection in self.connections.read().iter() {
            connection.prune_errors(now);
        }
        let forgiven = self.address_man.write().expire_bans(unix_now());
        if forgiven > 0 {
            debug!("{forgiven} peers are selectable again");
        }

        self.connections
            .write()
            .retain(|connection| connection.is_connected());

        let established = self.established_count();
        let required = self.config.required_connections;
        let mut opened = 0;
        let mut trimmed = 0;

        if established < required {
            let (missing, exclude) = {
                let connecting = self.connecting.lock();
                let missing = required.saturating_sub(established + connecting.len());
                let mut exclude = connecting.clone();
                exclude.extend(
                    self.connections
                        .read()
                        .iter()
                        .map(|connection| connection.descriptor().key()),
                );
                (missing, exclude)
            };

            let peers = self.address_man.read().get_peers_to_connect(
                missing,
                &self.config.protocols,
                &exclude,
                unix_now(),
            );
            if peers.len() < missing {
                debug!("wanted {missing} peers to connect to, found {}", peers.len());
            }

            let attempts = peers.iter().map(|peer| self.open_connection(peer.clone()));
            opened = join_all(attempts)
                .await
                .into_iter()
                .filter(Result::is_ok)
                .count();
        }

        if self.established_count() > required {
            let worst = self
                .established()
                .into_iter()
                .min_by_key(|connection| connection.score());
            if let Some(worst) = worst {
                debug!(
                    "too many connections, dropping {} with score {}",
                    worst.descriptor(),
                    worst.score()
                );
                // Not a candidate again until the cooldown is over
                if self.disconnect(worst.id(), DisconnectReason::Cooldown) {
                    trimmed += 1;
                }
            }
        }

        MaintenanceReport::Maintained { opened, trimmed }
    }

    /// Opens a connection to `peer` and adds it to the pool. Peers we reject after the handshake
    /// are banned, peers we can't reach are retried later.
    pub async fn open_connection(&self, peer: PeerDescriptor) -> Result<ConnectionId, WireError> {
        if !self.connecting.lock().insert(peer.key()) {
            return Err(WireError::Connection(ConnectionError::Rejected(format!(
                "already connecting to {peer}"
            ))));
        }
        self.address_man
            .write()
            .update_state(&peer, PeerState::Connecting);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(
            id,
            peer.clone(),
            &self.config,
            self.signals.clone(),
        ));

        let result = connection
            .connect(
                self.connector.as_ref(),
                self.local_height(),
                self.filter.as_ref(),
            )
            .await;
        self.connecting.lock().remove(&peer.key());

        match result {
            Ok(()) => {}
            Err(ConnectionError::Rejected(reason)) => {
                info!("rejecting {peer}: {reason}");
                let until = unix_now() + self.config.ban_time.as_secs();
                self.address_man.write().ban_until(&peer, until);
                return Err(ConnectionError::Rejected(reason).into());
            }
            Err(e) => {
                self.address_man
                    .write()
                    .update_state(&peer, PeerState::Failed(unix_now()));
                return Err(e.into());
            }
        }

        self.connections.write().push(connection.clone());
        self.address_man
            .write()
            .update_state(&peer, PeerState::Connected);
        self.events.publish(PoolEvent::Connected(id));

        if peer.protocol == Protocol::Electrum {
            if let Err(e) = connection.subscribe_headers().await {
                warn!("couldn't subscribe to headers from {peer}: {e}");
                self.disconnect(id, DisconnectReason::Cooldown);
                return Err(e.into());
            }
        }

        Ok(id)
    }

    /// Picks `count` distinct established connections at random, among the ones `filter`
    /// accepts. Fails with [WireError::NoPeers] if there aren't enough of them.
    pub fn pick_connections(
        &self,
        count: usize,
        filter: impl Fn(&Connection) -> bool,
    ) -> Result<Vec<Arc<Connection>>, WireError> {
        let mut candidates = self
            .established()
            .into_iter()
            .filter(|connection| filter(connection.as_ref()))
            .collect::<Vec<_>>();

        if candidates.len() < count {
            return Err(WireError::NoPeers);
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(count);
        Ok(candidates)
    }

    /// Sends `request` to one random connection that supports it. If that fails, we try another
    /// connection we didn't try yet, up to `max_request_attempts` times.
    pub async fn call_one(
        &self,
        request: PeerRequest,
    ) -> Result<(ConnectionId, PeerResponse), WireError> {
        let mut tried = HashSet::new();
        let mut attempts = 0;

        while attempts < self.config.max_request_attempts {
            let established = self.established();
            let connection = established
                .iter()
                .filter(|connection| connection.supports(&request))
                .filter(|connection| !tried.contains(&connection.id()))
                .choose(&mut rand::thread_rng())
                .cloned();

            let Some(connection) = connection else {
                if attempts > 0 {
                    break;
                }
                if established.is_empty() {
                    return Err(WireError::NoPeers);
                }
                return Err(WireError::NoServers);
            };

            tried.insert(connection.id());
            attempts += 1;

            match connection.request(request.clone()).await {
                Ok(response) => return Ok((connection.id(), response)),
                Err(e) => debug!("{:?} to {} failed: {e}", request, connection.descriptor()),
            }
        }

        Err(WireError::RetryExhausted { attempts })
    }

    /// Sends `request` to `agreement` distinct connections at once and returns the answer enough
    /// of them agree on.
    ///
    /// With `fail_silent`, not having enough peers or answers gives `Ok(None)`. Peers that
    /// answered but disagree are always an error.
    pub async fn call(
        &self,
        request: PeerRequest,
        agreement: usize,
        fail_silent: bool,
    ) -> Result<Option<PeerResponse>, WireError> {
        match self.quorum_call(request, agreement).await {
            Ok(response) => Ok(Some(response)),
            Err(WireError::NoPeers | WireError::NoServers | WireError::MissingResponse { .. })
                if fail_silent =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn quorum_call(
        &self,
        request: PeerRequest,
        agreement: usize,
    ) -> Result<PeerResponse, WireError> {
        let established = self.established();
        if !established.is_empty()
            && !established
                .iter()
                .any(|connection| connection.supports(&request))
        {
            return Err(WireError::NoServers);
        }

        let connections = self.pick_connections(agreement, |connection| {
            connection.supports(&request)
        })?;

        let requests = connections
            .iter()
            .map(|connection| connection.request(request.clone()));
        let responses = join_all(requests)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect::<Vec<_>>();

        if responses.len() < agreement {
            return Err(WireError::MissingResponse {
                expected: agreement,
                got: responses.len(),
            });
        }

        reach_quorum(&responses, self.config.quorum_ratio)
            .map_err(|_| WireError::NoQuorumOnResponses)
    }

    /// Closes a connection and takes it out of the pool. Returns false if there's no such
    /// connection, so calling this twice is harmless.
    pub fn disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let connection = {
            let mut connections = self.connections.write();
            let Some(position) = connections
                .iter()
                .position(|connection| connection.id() == id)
            else {
                return false;
            };
            connections.remove(position)
        };

        connection.disconnect();

        let peer = connection.descriptor();
        let now = unix_now();
        match reason {
            DisconnectReason::Graceful => self
                .address_man
                .write()
                .update_state(peer, PeerState::Tried(now)),
            DisconnectReason::Cooldown => self
                .address_man
                .write()
                .ban_until(peer, now + self.config.ban_cooldown.as_secs()),
            DisconnectReason::Misbehaving => {
                warn!("banning {peer} for misbehaving");
                self.address_man
                    .write()
                    .ban_until(peer, now + self.config.ban_time.as_secs())
            }
        }

        self.events.publish(PoolEvent::Disconnected(id));
        true
    }

    pub fn disconnect_all(&self) {
        let ids = self
            .connections
            .read()
            .iter()
            .map(|connection| connection.id())
            .collect::<Vec<_>>();

        for id in ids {
            self.disconnect(id, DisconnectReason::Graceful);
        }
    }

    /// Reacts to something a connection told us
    pub fn handle_signal(&self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Transport(id, event) => {
                let event = match event {
                    TransportEvent::Headers(headers) => PoolEvent::Headers(id, headers),
                    TransportEvent::NewTip { header, height } => PoolEvent::NewTip {
                        connection: id,
                        header,
                        height,
                    },
                    TransportEvent::BlockAnnounced(hash) => PoolEvent::BlockAnnounced(id, hash),
                    // The connection already counted it
                    TransportEvent::Error(_) => return,
                };
                self.events.publish(event);
            }
            ConnectionSignal::ScoreExhausted(id) | ConnectionSignal::Closed(id) => {
                self.disconnect(id, DisconnectReason::Cooldown);
            }
        }
    }

    /// Starts the task that handles connection signals. Only the first call starts anything.
    pub fn spawn_signal_handler(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut signals = self.signals_rx.lock().take()?;
        let pool = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.handle_signal(signal);
            }
        }))
    }

    /// Runs the keep-alive loop until `kill_signal` is set, then saves our peers and closes
    /// every connection.
    pub async fn run(self: Arc<Self>, kill_signal: Arc<RwLock<bool>>) {
        let signal_handler = self.spawn_signal_handler();
        let mut last_dump = Instant::now();

        loop {
            if *kill_signal.read().await {
                break;
            }

            match self.maintain_connections().await {
                MaintenanceReport::Offline => {
                    warn!("we seem to be offline, waiting before trying again");
                    tokio::time::sleep(self.config.offline_backoff).await;
                    continue;
                }
                MaintenanceReport::Maintained { opened, trimmed } => {
                    if opened > 0 || trimmed > 0 {
                        debug!(
                            "opened {opened} and trimmed {trimmed} connections, {} established",
                            self.established_count()
                        );
                    }
                }
            }

            if last_dump.elapsed() > PEERS_DUMP_INTERVAL {
                try_and_log!(self.dump_peers());
                last_dump = Instant::now();
            }

            tokio::time::sleep(self.config.keepalive_interval).await;
        }

        info!("shutting down connection pool");
        if let Some(handler) = signal_handler {
            handler.abort();
        }
        try_and_log!(self.dump_peers());
        self.disconnect_all();
    }
}
