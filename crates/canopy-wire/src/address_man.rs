//! Address manager is a module that keeps track of known peers and what we know about each one
//! of them. It is what keeps a single peer from being reselected right after it misbehaved, and
//! what the pool asks for fresh candidates when it needs more connections.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;

use canopy_chain::ChainParams;
use log::debug;
use log::info;
use rand::seq::IteratorRandom;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Peers we failed to connect to are retried after this many seconds
const RETRY_TIME: u64 = 60 * 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Which protocol a peer speaks
pub enum Protocol {
    /// The Bitcoin P2P protocol, v1 framing
    P2p,
    /// Electrum's line-delimited JSON-RPC
    Electrum,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::P2p => write!(f, "p2p"),
            Protocol::Electrum => write!(f, "electrum"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// The identity of a peer. Two descriptors with the same host and port are the same peer, no
/// matter which source told us about them.
pub struct PeerDescriptor {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

/// How peers are deduplicated
pub type PeerKey = (String, u16);

impl PeerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        PeerDescriptor {
            host: host.into(),
            port,
            protocol,
        }
    }

    pub fn key(&self) -> PeerKey {
        (self.host.clone(), self.port)
    }

    /// Parses `[p2p://|electrum://]host[:port]`. Without a scheme the peer is assumed to be a P2P
    /// node, and without a port we use the network's default port for that protocol.
    pub fn parse(s: &str, params: &ChainParams) -> Result<Self, AddrManError> {
        let (protocol, rest) = match s.split_once("://") {
            Some(("p2p", rest)) => (Protocol::P2p, rest),
            Some(("electrum" | "tcp", rest)) => (Protocol::Electrum, rest),
            Some((scheme, _)) => return Err(AddrManError::UnknownProtocol(scheme.to_string())),
            None => (Protocol::P2p, s),
        };

        let default_port = match protocol {
            Protocol::P2p => params.p2p_port,
            Protocol::Electrum => params.electrum_port,
        };

        // [::1]:8333 style ipv6 literals
        let (host, port) = if let Some(rest) = rest.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| AddrManError::InvalidAddress(s.to_string()))?;
            match after.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if after.is_empty() => (host, None),
                None => return Err(AddrManError::InvalidAddress(s.to_string())),
            }
        } else if rest.matches(':').count() > 1 {
            // bare ipv6 without a port
            (rest, None)
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(AddrManError::InvalidAddress(s.to_string()));
        }

        let port = match port {
            Some(port) => port
                .parse()
                .map_err(|_| AddrManError::InvalidPort(s.to_string()))?,
            None => default_port,
        };

        Ok(PeerDescriptor::new(host, port, protocol))
    }
}

impl Display for PeerDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            return write!(f, "{}://[{}]:{}", self.protocol, self.host, self.port);
        }
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// We never tried this peer, or we forgave whatever happened last time
    NeverTried,
    /// We had a working connection with this peer at the given time
    Tried(u64),
    /// There's a connection attempt going on right now
    Connecting,
    /// We are connected to this peer right now
    Connected,
    /// We tried connecting at the given time, but failed
    Failed(u64),
    /// This peer can't be selected until the given time. Used both for short cool-downs after a
    /// disconnection and for long bans after misbehavior.
    Banned(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A peer, and what we know about it
pub struct KnownPeer {
    pub descriptor: PeerDescriptor,
    pub state: PeerState,
    /// Last time we had a working connection with this peer, zero if never
    pub last_connected: u64,
}

impl From<PeerDescriptor> for KnownPeer {
    fn from(descriptor: PeerDescriptor) -> Self {
        KnownPeer {
            descriptor,
            state: PeerState::NeverTried,
            last_connected: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AddrManError {
    #[error("invalid peer address {0}")]
    InvalidAddress(String),

    #[error("invalid port in {0}")]
    InvalidPort(String),

    #[error("unknown protocol {0}")]
    UnknownProtocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peers file is corrupted: {0}")]
    Serde(#[from] serde_json::Error),
}

/// A module that keeps track of known peers and serves them to the pool
#[derive(Debug, Default)]
pub struct AddressMan {
    peers: HashMap<PeerKey, KnownPeer>,
}

impl AddressMan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds new peers to our list, ignoring the ones we already know. Returns how many were new.
    pub fn push_peers(&mut self, peers: &[PeerDescriptor]) -> usize {
        let known = peers
            .iter()
            .cloned()
            .map(KnownPeer::from)
            .collect::<Vec<_>>();

        self.push_known_peers(known)
    }

    /// Same as [AddressMan::push_peers], but keeps the state we had saved for each peer.
    /// Peers that were connected or connecting when we saved them start over as tried.
    pub fn push_known_peers(&mut self, peers: Vec<KnownPeer>) -> usize {
        let mut added = 0;
        for mut peer in peers {
            if let PeerState::Connected | PeerState::Connecting = peer.state {
                peer.state = PeerState::Tried(peer.last_connected);
            }

            if let std::collections::hash_map::Entry::Vacant(entry) =
                self.peers.entry(peer.descriptor.key())
            {
                entry.insert(peer);
                added += 1;
            }
        }

        added
    }

    /// Returns up to `count` random peers we may open a new connection to. Peers that are
    /// banned, connected, being connected to, listed in `exclude`, or speak a protocol not in
    /// `protocols` are never returned, and every returned peer is distinct.
    pub fn get_peers_to_connect(
        &self,
        count: usize,
        protocols: &[Protocol],
        exclude: &HashSet<PeerKey>,
        now: u64,
    ) -> Vec<PeerDescriptor> {
        self.peers
            .iter()
            .filter(|(key, _)| !exclude.contains(*key))
            .filter(|(_, peer)| protocols.contains(&peer.descriptor.protocol))
            .filter(|(_, peer)| match peer.state {
                PeerState::NeverTried | PeerState::Tried(_) => true,
                PeerState::Failed(when) => when + RETRY_TIME <= now,
                PeerState::Banned(until) => until <= now,
                PeerState::Connecting | PeerState::Connected => false,
            })
            .map(|(_, peer)| peer.descriptor.clone())
            .choose_multiple(&mut rand::thread_rng(), count)
    }

    pub fn update_state(&mut self, peer: &PeerDescriptor, state: PeerState) {
        let Some(known) = self.peers.get_mut(&peer.key()) else {
            return;
        };

        if let PeerState::Connected = state {
            known.last_connected = canopy_common::unix_now();
        }
        known.state = state;
    }

    /// Takes `peer` out of the selectable set until `until` (unix time, seconds)
    pub fn ban_until(&mut self, peer: &PeerDescriptor, until: u64) {
        debug!("peer {peer} won't be selected until {until}");
        if !self.peers.contains_key(&peer.key()) {
            self.peers.insert(peer.key(), KnownPeer::from(peer.clone()));
        }
        self.update_state(peer, PeerState::Banned(until));
    }

    pub fn state_of(&self, peer: &PeerDescriptor) -> Option<PeerState> {
        self.peers.get(&peer.key()).map(|known| known.state)
    }

    /// Moves peers between states, like if the ban time of a peer expired, or if we tried to
    /// connect to a peer in the past and it failed, but enough time went by that it may be
    /// online again. Returns how many peers went back to the selectable pool.
    pub fn expire_bans(&mut self, now: u64) -> usize {
        let mut expired = 0;
        for peer in self.peers.values_mut() {
            let forgive = match peer.state {
                PeerState::Banned(until) => until <= now,
                PeerState::Failed(when) => when + RETRY_TIME <= now,
                _ => false,
            };

            if forgive {
                peer.state = PeerState::NeverTried;
                expired += 1;
            }
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Writes every known peer to `datadir/peers.json`
    pub fn dump_peers(&self, datadir: &str) -> Result<(), AddrManError> {
        let peers = self.peers.values().cloned().collect::<Vec<_>>();
        let peers = serde_json::to_string(&peers)?;

        std::fs::create_dir_all(datadir)?;
        std::fs::write(format!("{datadir}/peers.json"), peers)?;
        info!("saved {} peers to {datadir}/peers.json", self.peers.len());

        Ok(())
    }

    /// Reads back what [AddressMan::dump_peers] wrote
    pub fn load_peers(datadir: &str) -> Result<Vec<KnownPeer>, AddrManError> {
        let peers = std::fs::read_to_string(format!("{datadir}/peers.json"))?;
        Ok(serde_json::from_str(&peers)?)
    }
}
