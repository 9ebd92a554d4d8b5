//! A live session with a single peer.
//!
//! A [Connection] owns the transport, keeps track of how well the peer is behaving and makes
//! sure no request outlives the session: every request has a timeout, identical requests share
//! one in-flight future, and disconnecting fails whatever is still pending. It never touches
//! chain state, everything the peer pushes to us is forwarded to the pool as a
//! [ConnectionSignal].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bitcoin::block::Header;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use log::debug;
use log::info;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::address_man::PeerDescriptor;
use crate::address_man::Protocol;
use crate::error::ConnectionError;
use crate::transport::Connector;
use crate::transport::PeerRequest;
use crate::transport::PeerResponse;
use crate::transport::PeerTransport;
use crate::transport::TransportEvent;
use crate::transport::VersionFilter;
use crate::SyncConfig;

pub type ConnectionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// Connecting failed, or the peer was rejected after the handshake
    Error,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a connection tells its pool
pub enum ConnectionSignal {
    Transport(ConnectionId, TransportEvent),
    /// The score reached zero, the pool should evict this connection
    ScoreExhausted(ConnectionId),
    /// The peer went away
    Closed(ConnectionId),
}

/// Timestamps of recent errors. Old errors stop counting once [ErrorLog::prune] drops them.
#[derive(Debug)]
pub struct ErrorLog {
    errors: VecDeque<Instant>,
    expire_after: Duration,
}

impl ErrorLog {
    pub fn new(expire_after: Duration) -> Self {
        ErrorLog {
            errors: VecDeque::new(),
            expire_after,
        }
    }

    pub fn record(&mut self, when: Instant) {
        self.errors.push_back(when);
    }

    /// Drops every error older than the expiry window, returning how many were dropped
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.errors.len();
        while let Some(oldest) = self.errors.front() {
            if now.saturating_duration_since(*oldest) <= self.expire_after {
                break;
            }
            self.errors.pop_front();
        }

        before - self.errors.len()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

type SharedRequest = Shared<BoxFuture<'static, Result<PeerResponse, ConnectionError>>>;

pub struct Connection {
    id: ConnectionId,
    descriptor: PeerDescriptor,
    start_score: i32,
    connect_timeout: Duration,
    request_timeout: Duration,
    max_height_lag: u32,

    state: spin::Mutex<ConnectionState>,
    transport: spin::RwLock<Option<Arc<dyn PeerTransport>>>,
    errors: spin::Mutex<ErrorLog>,
    successes: AtomicU32,
    /// Set once we asked the pool to evict us, so we only ask once
    evicting: AtomicBool,
    /// The latest tip this peer announced, with its height
    last_header: spin::Mutex<Option<(Header, u32)>>,
    inflight: spin::Mutex<HashMap<PeerRequest, SharedRequest>>,
    cancel: watch::Sender<bool>,
    signals: UnboundedSender<ConnectionSignal>,
    forwarder: spin::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        descriptor: PeerDescriptor,
        config: &SyncConfig,
        signals: UnboundedSender<ConnectionSignal>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);

        Connection {
            id,
            descriptor,
            start_score: config.start_score,
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            max_height_lag: config.max_height_lag,
            state: spin::Mutex::new(ConnectionState::Unconnected),
            transport: spin::RwLock::new(None),
            errors: spin::Mutex::new(ErrorLog::new(config.expire_errors_after)),
            successes: AtomicU32::new(0),
            evicting: AtomicBool::new(false),
            last_header: spin::Mutex::new(None),
            inflight: spin::Mutex::new(HashMap::new()),
            cancel,
            signals,
            forwarder: spin::Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_header(&self) -> Option<(Header, u32)> {
        *self.last_header.lock()
    }

    /// The height this peer claims to be at, zero if we aren't connected
    pub fn best_height(&self) -> u32 {
        let announced = self.last_header().map(|(_, height)| height).unwrap_or(0);
        let transport = self
            .transport
            .read()
            .as_ref()
            .map(|transport| transport.best_height())
            .unwrap_or(0);

        announced.max(transport)
    }

    /// Opens the transport and runs the handshake. P2P peers that are too far behind
    /// `local_height` or that `filter` doesn't like are rejected with
    /// [ConnectionError::Rejected], which the pool answers with a ban.
    pub async fn connect(
        self: &Arc<Self>,
        connector: &dyn Connector,
        local_height: u32,
        filter: &dyn VersionFilter,
    ) -> Result<(), ConnectionError> {
        *self.state.lock() = ConnectionState::Connecting;
        let (events_tx, mut events_rx) = unbounded_channel();

        let transport = match tokio::time::timeout(
            self.connect_timeout,
            connector.connect(&self.descriptor, local_height, events_tx),
        )
        .await
        {
            Ok(Ok(transport)) => transport,
            Ok(Err(e)) => return Err(self.fail_connect(e.into())),
            Err(_) => return Err(self.fail_connect(ConnectionError::Timeout)),
        };

        if let Err(reason) = self.check_peer(transport.as_ref(), local_height, filter) {
            transport.close();
            return Err(self.fail_connect(ConnectionError::Rejected(reason)));
        }

        info!(
            "connected to {} ({}) at height {}",
            self.descriptor,
            transport.info().user_agent,
            transport.best_height()
        );
        *self.transport.write() = Some(transport);

        // Someone may have called disconnect while we were connecting
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                drop(state);
                if let Some(transport) = self.transport.write().take() {
                    transport.close();
                }
                return Err(ConnectionError::Disconnected);
            }
            *state = ConnectionState::Connected;
        }

        let connection = self.clone();
        let mut cancel = self.cancel.subscribe();
        let forwarder = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events_rx.recv() => event,
                    _ = cancel.changed() => return,
                };

                let Some(event) = event else {
                    break;
                };

                match &event {
                    TransportEvent::NewTip { header, height } => {
                        *connection.last_header.lock() = Some((*header, *height));
                    }
                    TransportEvent::Error(reason) => {
                        debug!("error from {}: {reason}", connection.descriptor);
                        connection.add_error();
                    }
                    _ => {}
                }

                if connection
                    .signals
                    .send(ConnectionSignal::Transport(connection.id, event))
                    .is_err()
                {
                    return;
                }
            }

            // The transport stopped on its own
            let _ = connection
                .signals
                .send(ConnectionSignal::Closed(connection.id));
        });
        *self.forwarder.lock() = Some(forwarder);

        Ok(())
    }

    fn check_peer(
        &self,
        transport: &dyn PeerTransport,
        local_height: u32,
        filter: &dyn VersionFilter,
    ) -> Result<(), String> {
        if !filter.accept(transport.protocol(), transport.info()) {
            return Err(format!(
                "version {} {:?} not accepted",
                transport.info().protocol_version,
                transport.info().user_agent
            ));
        }

        if transport.protocol() == Protocol::P2p
            && transport.best_height().saturating_add(self.max_height_lag) < local_height
        {
            return Err(format!(
                "peer is at {}, we are at {local_height}",
                transport.best_height()
            ));
        }

        Ok(())
    }

    fn fail_connect(&self, error: ConnectionError) -> ConnectionError {
        debug!("couldn't connect to {}: {error}", self.descriptor);
        *self.state.lock() = ConnectionState::Error;
        self.add_error();
        error
    }

    /// Asks the peer to push its new tips to us
    pub async fn subscribe_headers(&self) -> Result<(), ConnectionError> {
        let transport = self.transport().ok_or(ConnectionError::Disconnected)?;
        let result = match tokio::time::timeout(self.request_timeout, transport.subscribe_headers())
            .await
        {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Timeout),
        };

        if let Err(e) = &result {
            if e.is_peer_fault() {
                self.add_error();
            }
        }
        result
    }

    pub fn supports(&self, request: &PeerRequest) -> bool {
        self.transport()
            .is_some_and(|transport| transport.supports(request))
    }

    fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.read().clone()
    }

    /// Sends `request` and waits for the answer. If the same request is already in flight, we
    /// wait for that one instead of sending it again.
    pub async fn request(&self, request: PeerRequest) -> Result<PeerResponse, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::Disconnected);
        }
        let transport = self.transport().ok_or(ConnectionError::Disconnected)?;
        if !transport.supports(&request) {
            return Err(ConnectionError::Unsupported);
        }

        let (future, originator) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&request) {
                Some(future) => (future.clone(), false),
                None => {
                    let future = Self::send_request(
                        transport,
                        request.clone(),
                        self.request_timeout,
                        self.cancel.subscribe(),
                    )
                    .boxed()
                    .shared();
                    inflight.insert(request.clone(), future.clone());
                    (future, true)
                }
            }
        };

        let result = future.clone().await;

        {
            let mut inflight = self.inflight.lock();
            if inflight
                .get(&request)
                .is_some_and(|current| current.ptr_eq(&future))
            {
                inflight.remove(&request);
            }
        }

        // Only whoever sent the request accounts for it, waiters would count it twice
        if originator {
            match &result {
                Ok(_) => self.add_success(),
                Err(e) if e.is_peer_fault() => self.add_error(),
                Err(_) => {}
            }
        }

        result
    }

    async fn send_request(
        transport: Arc<dyn PeerTransport>,
        request: PeerRequest,
        timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PeerResponse, ConnectionError> {
        if *cancel.borrow() {
            return Err(ConnectionError::Disconnected);
        }

        tokio::select! {
            result = tokio::time::timeout(timeout, transport.request(request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(ConnectionError::Timeout),
            },
            _ = cancel.changed() => Err(ConnectionError::Disconnected),
        }
    }

    /// Closes the connection. Every pending request fails with
    /// [ConnectionError::Disconnected]. Calling this more than once is fine, only the first
    /// call does anything, and it returns whether this call was the one that closed it.
    pub fn disconnect(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Disconnected;
        }

        self.cancel.send_replace(true);
        if let Some(transport) = self.transport.write().take() {
            transport.close();
        }
        self.inflight.lock().clear();
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }

        debug!("disconnected from {}", self.descriptor);
        true
    }

    pub fn add_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an error now. If that takes our score to zero, we ask the pool to evict us.
    pub fn add_error(&self) {
        self.errors.lock().record(Instant::now());

        if self.score() <= 0 && !self.evicting.swap(true, Ordering::AcqRel) {
            info!("{} ran out of score", self.descriptor);
            let _ = self.signals.send(ConnectionSignal::ScoreExhausted(self.id));
        }
    }

    /// Forgets errors older than the expiry window
    pub fn prune_errors(&self, now: Instant) -> usize {
        self.errors.lock().prune(now)
    }

    /// Starts at `start_score`, grows with each good answer (up to twice the starting
    /// score) and shrinks with each error that didn't expire yet.
    pub fn score(&self) -> i32 {
        let successes = self.successes.load(Ordering::Relaxed).min(self.start_score.max(0) as u32);
        let errors = self.errors.lock().len() as i32;

        self.start_score + successes as i32 - errors
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::utils::MockNetwork;
    use crate::transport::DefaultVersionFilter;

    fn test_config() -> SyncConfig {
        SyncConfig {
            start_score: 3,
            request_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            ..SyncConfig::default()
        }
    }

    async fn connected(network: &MockNetwork, index: usize) -> Arc<Connection> {
        let (signals, _) = unbounded_channel();
        let peer = network.peer_descriptor(index);
        let connection = Arc::new(Connection::new(index as u32, peer, &test_config(), signals));
        connection
            .connect(network, 0, &DefaultVersionFilter)
            .await
            .unwrap();
        connection
    }

    #[test]
    fn test_error_log_prune() {
        let start = Instant::now();
        let mut log = ErrorLog::new(Duration::from_secs(10));
        log.record(start);
        log.record(start + Duration::from_secs(5));

        assert_eq!(log.prune(start + Duration::from_secs(10)), 0);
        assert_eq!(log.prune(start + Duration::from_secs(11)), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.prune(start + Duration::from_secs(16)), 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_score_and_self_eviction() {
        let network = MockNetwork::new(1);
        let (signals, mut signals_rx) = unbounded_channel();
        let connection = Connection::new(1, network.peer_descriptor(0), &test_config(), signals);

        assert_eq!(connection.score(), 3);
        connection.add_success();
        assert_eq!(connection.score(), 4);

        for _ in 0..3 {
            connection.add_error();
        }
        assert_eq!(connection.score(), 1);
        assert!(signals_rx.try_recv().is_err());

        connection.add_error();
        connection.add_error();
        assert_eq!(
            signals_rx.try_recv(),
            Ok(ConnectionSignal::ScoreExhausted(1))
        );
        // Only once
        assert!(signals_rx.try_recv().is_err());

        // Errors heal with time
        let later = Instant::now() + Duration::from_secs(60 * 60);
        assert_eq!(connection.prune_errors(later), 5);
        assert_eq!(connection.score(), 4);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let network = MockNetwork::new(1);
        let connection = connected(&network, 0).await;
        assert!(connection.is_connected());

        assert!(connection.disconnect());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        assert!(!connection.disconnect());
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(matches!(
            connection.request(PeerRequest::Ping).await,
            Err(ConnectionError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let network = MockNetwork::new(1);
        network.peer(0).set_stalled(true);
        let connection = connected(&network, 0).await;

        let pending = {
            let connection = connection.clone();
            tokio::spawn(async move { connection.request(PeerRequest::Ping).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        connection.disconnect();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::Disconnected)));
    }

    #[tokio::test]
    async fn test_request_times_out_and_counts_as_error() {
        let network = MockNetwork::new(1);
        network.peer(0).set_stalled(true);
        let connection = connected(&network, 0).await;

        let result = connection.request(PeerRequest::Ping).await;
        assert!(matches!(result, Err(ConnectionError::Timeout)));
        assert_eq!(connection.score(), 2);
    }

    #[tokio::test]
    async fn test_identical_requests_are_coalesced() {
        let network = MockNetwork::new(1);
        let connection = connected(&network, 0).await;

        let (a, b, c) = tokio::join!(
            connection.request(PeerRequest::Ping),
            connection.request(PeerRequest::Ping),
            connection.request(PeerRequest::Ping),
        );
        assert_eq!(a.unwrap(), PeerResponse::Pong);
        assert_eq!(b.unwrap(), PeerResponse::Pong);
        assert_eq!(c.unwrap(), PeerResponse::Pong);

        assert_eq!(network.peer(0).requests_served(), 1);
        assert_eq!(connection.score(), 4);
    }

    #[tokio::test]
    async fn test_unsupported_requests_dont_hurt_the_peer() {
        let network = MockNetwork::new(1);
        network.peer(0).set_protocol(Protocol::P2p);
        let connection = connected(&network, 0).await;

        let result = connection.request(PeerRequest::EstimateFee(2)).await;
        assert!(matches!(result, Err(ConnectionError::Unsupported)));
        assert_eq!(connection.score(), 3);
    }

    #[tokio::test]
    async fn test_lagging_p2p_peer_is_rejected() {
        let network = MockNetwork::new(1);
        network.peer(0).set_protocol(Protocol::P2p);

        let (signals, _) = unbounded_channel();
        let connection = Arc::new(Connection::new(
            0,
            network.peer_descriptor(0),
            &test_config(),
            signals,
        ));
        let result = connection
            .connect(&network, 1_000, &DefaultVersionFilter)
            .await;

        assert!(matches!(result, Err(ConnectionError::Rejected(_))));
        assert_eq!(connection.state(), ConnectionState::Error);
    }
}
