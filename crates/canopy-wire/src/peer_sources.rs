//! Where peers come from. The pool doesn't care how a peer was found, it only asks each
//! [PeerSource] for a list of descriptors and merges them, deduplicated by host and port.

use std::collections::HashSet;

use async_trait::async_trait;
use canopy_chain::ChainParams;
use canopy_chain::Network;
use log::info;
use log::warn;

use crate::address_man::AddressMan;
use crate::address_man::PeerDescriptor;
use crate::address_man::PeerState;
use crate::address_man::Protocol;
use crate::error::WireError;

#[async_trait]
pub trait PeerSource: Send + Sync {
    /// A short name, for logs
    fn name(&self) -> &'static str;

    async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError>;
}

/// Asks the network's DNS seeds for P2P nodes
pub struct DnsSeedSource {
    seeds: Vec<&'static str>,
    port: u16,
}

impl DnsSeedSource {
    pub fn new(params: &ChainParams) -> Self {
        DnsSeedSource {
            seeds: params.dns_seeds.clone(),
            port: params.p2p_port,
        }
    }
}

#[async_trait]
impl PeerSource for DnsSeedSource {
    fn name(&self) -> &'static str {
        "dns seeds"
    }

    async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError> {
        let mut peers = Vec::new();
        for seed in self.seeds.iter().copied() {
            // lookups block, keep them off the runtime's worker threads
            let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(seed))
                .await
                .map_err(|_| WireError::ChannelSend)?;

            match lookup {
                Ok(ips) => {
                    info!("got {} peers from {seed}", ips.len());
                    peers.extend(
                        ips.into_iter()
                            .map(|ip| PeerDescriptor::new(ip.to_string(), self.port, Protocol::P2p)),
                    );
                }
                Err(e) => warn!("couldn't query {seed}: {e}"),
            }
        }

        Ok(peers)
    }
}

/// Hardcoded peers shipped with the binary
pub struct FixedSeedSource {
    network: Network,
}

impl FixedSeedSource {
    pub fn new(network: Network) -> Self {
        FixedSeedSource { network }
    }

    fn get_net_seeds(network: Network) -> &'static str {
        match network {
            Network::Bitcoin => include_str!("seeds/mainnet_seeds.json"),
            Network::Testnet => include_str!("seeds/testnet_seeds.json"),
            Network::Signet => include_str!("seeds/signet_seeds.json"),
            Network::Regtest => include_str!("seeds/regtest_seeds.json"),
        }
    }
}

#[async_trait]
impl PeerSource for FixedSeedSource {
    fn name(&self) -> &'static str {
        "fixed seeds"
    }

    async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError> {
        Ok(serde_json::from_str(Self::get_net_seeds(self.network))?)
    }
}

/// Peers we saved in a previous run. Peers whose ban didn't expire yet are left out.
pub struct PeersFileSource {
    datadir: String,
}

impl PeersFileSource {
    pub fn new(datadir: impl Into<String>) -> Self {
        PeersFileSource {
            datadir: datadir.into(),
        }
    }
}

#[async_trait]
impl PeerSource for PeersFileSource {
    fn name(&self) -> &'static str {
        "peers file"
    }

    async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError> {
        if !std::path::Path::new(&format!("{}/peers.json", self.datadir)).exists() {
            return Ok(Vec::new());
        }

        let now = canopy_common::unix_now();
        let peers = AddressMan::load_peers(&self.datadir)?
            .into_iter()
            .filter(|peer| !matches!(peer.state, PeerState::Banned(until) if until > now))
            .map(|peer| peer.descriptor)
            .collect();

        Ok(peers)
    }
}

/// A fixed list, usually the ones passed with `--connect`
pub struct StaticSource(pub Vec<PeerDescriptor>);

#[async_trait]
impl PeerSource for StaticSource {
    fn name(&self) -> &'static str {
        "static list"
    }

    async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError> {
        Ok(self.0.clone())
    }
}

/// Asks every source for peers and merges the results. A source failing is logged, not fatal.
pub async fn gather_peers(sources: &[Box<dyn PeerSource>]) -> Vec<PeerDescriptor> {
    let mut seen = HashSet::new();
    let mut peers = Vec::new();

    for source in sources {
        match source.get_peers().await {
            Ok(found) => {
                info!("{} returned {} peers", source.name(), found.len());
                peers.extend(found.into_iter().filter(|peer| seen.insert(peer.key())));
            }
            Err(e) => warn!("couldn't get peers from {}: {e}", source.name()),
        }
    }

    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl PeerSource for FailingSource {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get_peers(&self) -> Result<Vec<PeerDescriptor>, WireError> {
            Err(WireError::NoPeers)
        }
    }

    #[tokio::test]
    async fn test_fixed_seeds_parse() {
        for network in [Network::Bitcoin, Network::Testnet, Network::Signet] {
            let peers = FixedSeedSource::new(network).get_peers().await.unwrap();
            assert!(!peers.is_empty());
        }

        let regtest = FixedSeedSource::new(Network::Regtest).get_peers().await.unwrap();
        assert!(regtest.is_empty());
    }

    #[tokio::test]
    async fn test_gather_dedups_and_survives_failures() {
        let a = PeerDescriptor::new("10.0.0.1", 8333, Protocol::P2p);
        let b = PeerDescriptor::new("10.0.0.2", 8333, Protocol::P2p);
        let a_again = PeerDescriptor::new("10.0.0.1", 8333, Protocol::Electrum);

        let sources: Vec<Box<dyn PeerSource>> = vec![
            Box::new(StaticSource(vec![a.clone(), b.clone()])),
            Box::new(FailingSource),
            Box::new(StaticSource(vec![a_again])),
        ];

        assert_eq!(gather_peers(&sources).await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_peers_file_skips_banned() {
        let datadir = std::env::temp_dir()
            .join(format!("canopy-source-{}", rand::random::<u64>()))
            .to_string_lossy()
            .into_owned();

        let source = PeersFileSource::new(datadir.clone());
        assert!(source.get_peers().await.unwrap().is_empty());

        let good = PeerDescriptor::new("10.0.0.1", 8333, Protocol::P2p);
        let banned = PeerDescriptor::new("10.0.0.2", 8333, Protocol::P2p);
        let mut addr_man = AddressMan::new();
        addr_man.push_peers(&[good.clone(), banned.clone()]);
        addr_man.ban_until(&banned, u64::MAX);
        addr_man.dump_peers(&datadir).unwrap();

        assert_eq!(source.get_peers().await.unwrap(), vec![good]);
    }
}
