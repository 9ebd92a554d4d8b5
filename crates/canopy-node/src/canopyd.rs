use std::fs;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use canopy_chain::BlocksRepository;
use canopy_chain::ChainParams;
use canopy_chain::HeadersRepository;
use canopy_chain::KvBlocksStore;
use canopy_chain::KvHeadersStore;
use canopy_chain::MemoryBlocksStore;
use canopy_chain::MemoryHeadersStore;
pub use canopy_chain::Network;
use canopy_wire::address_man::PeerDescriptor;
use canopy_wire::address_man::Protocol;
use canopy_wire::blocks_reactor::BlocksSyncEngine;
use canopy_wire::fee_estimator::FeeEstimator;
use canopy_wire::headers_reactor::ChainSyncEngine;
use canopy_wire::node_interface::NodeInterface;
use canopy_wire::peer_sources::DnsSeedSource;
use canopy_wire::peer_sources::FixedSeedSource;
use canopy_wire::peer_sources::PeerSource;
use canopy_wire::peer_sources::PeersFileSource;
use canopy_wire::pool::ConnectionPool;
use canopy_wire::transport::DefaultVersionFilter;
use canopy_wire::transport::TcpConnector;
use canopy_wire::SyncConfig;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config_file::ConfigFile;
use crate::error::CanopydError;

/// Port we assume for a proxy given without one, Tor's default
const DEFAULT_PROXY_PORT: u16 = 9050;

#[derive(Debug, Clone)]
/// General configuration for the canopy daemon, usually built from command line flags.
pub struct Config {
    /// The network we are running in
    pub network: Network,

    /// Where we keep our headers, blocks and known peers. Must exist and be writable.
    pub data_dir: String,

    /// A toml file with more settings, see [ConfigFile].
    ///
    /// Peer lists from both places are combined. Any other value set in the file's `[network]`
    /// section replaces the one given here.
    pub config_file: Option<String>,

    /// A socks5 proxy, `host[:port]`, all our connections go through it
    pub proxy: Option<String>,

    /// Only connect to these peers, `[p2p://|electrum://]host[:port]`
    pub connect: Vec<String>,

    /// Whether we ask the network's DNS seeds for peers
    pub dns_seeds: bool,

    /// Which protocols we may talk to peers with
    pub protocols: Vec<Protocol>,

    /// How many connections we keep open, the default is used if unset
    pub connections: Option<usize>,

    /// Keep headers and blocks in memory only, nothing is written to disk except our peers
    pub memory_store: bool,

    pub user_agent: String,
}

impl Config {
    pub fn new(network: Network, data_dir: String) -> Self {
        Config {
            network,
            data_dir,
            config_file: None,
            proxy: None,
            connect: Vec::new(),
            dns_seeds: true,
            protocols: vec![Protocol::Electrum, Protocol::P2p],
            connections: None,
            memory_store: false,
            user_agent: format!("/canopy:{}/", env!("CARGO_PKG_VERSION")),
        }
    }

    /// The [SyncConfig] our components are built with, after applying `file` on top of this
    pub fn sync_config(&self, file: &ConfigFile) -> Result<SyncConfig, CanopydError> {
        let params = ChainParams::from(self.network);
        let defaults = SyncConfig::default();

        let connect = self
            .connect
            .iter()
            .chain(file.network.connect.iter().flatten())
            .map(|peer| PeerDescriptor::parse(peer, &params))
            .collect::<Result<Vec<_>, _>>()?;

        let proxy = file
            .network
            .proxy
            .as_deref()
            .or(self.proxy.as_deref())
            .map(resolve_proxy)
            .transpose()?;

        let protocols = file
            .network
            .protocols
            .clone()
            .unwrap_or_else(|| self.protocols.clone());

        let required_connections = file
            .network
            .connections
            .or(self.connections)
            .unwrap_or(defaults.required_connections);

        Ok(SyncConfig {
            network: self.network,
            datadir: self.data_dir.clone(),
            proxy,
            dns_seeds: self.dns_seeds && connect.is_empty(),
            connect,
            protocols,
            user_agent: self.user_agent.clone(),
            required_connections,
            // We can't ask for more agreement than we have connections
            min_peers_agreement: defaults.min_peers_agreement.min(required_connections),
            ..defaults
        })
    }
}

/// Resolves a `host[:port]` proxy address
fn resolve_proxy(address: &str) -> Result<SocketAddr, CanopydError> {
    let with_port = match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{DEFAULT_PROXY_PORT}"),
    };

    with_port
        .to_socket_addrs()
        .map_err(|_| CanopydError::InvalidProxy(address.to_string()))?
        .next()
        .ok_or_else(|| CanopydError::InvalidProxy(address.to_string()))
}

/// Everything that exists while canopyd is running
struct Components {
    engine: Arc<ChainSyncEngine>,
    interface: NodeInterface,
}

pub struct Canopyd {
    /// The config used by this node, see [Config] for more details
    config: Config,

    /// Tells every task to wrap up what it's doing and return
    stop_signal: Arc<RwLock<bool>>,

    /// Tasks we started, joined on shutdown
    tasks: Mutex<Vec<JoinHandle<()>>>,

    components: OnceLock<Components>,
}

impl Canopyd {
    /// Asks every task to stop. Use [Canopyd::wait_shutdown] to know when they did, since our
    /// peers are only saved to disk after the pool stops.
    pub async fn stop(&self) {
        info!("Stopping node...");
        *self.stop_signal.write().await = true;

        if let Some(components) = self.components.get() {
            components.engine.wake();
        }
    }

    pub async fn should_stop(&self) -> bool {
        *self.stop_signal.read().await
    }

    pub fn get_stop_signal(&self) -> Arc<RwLock<bool>> {
        self.stop_signal.clone()
    }

    /// Waits until every task we started returns
    pub async fn wait_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("a task ended abnormally: {e}");
            }
        }
    }

    /// What a user-facing layer reads the node's state through, once we started
    pub fn interface(&self) -> Option<NodeInterface> {
        self.components
            .get()
            .map(|components| components.interface.clone())
    }

    /// Opens our stores, builds the pool and the sync engines and spawns their tasks. Returns
    /// as soon as everything is running.
    pub async fn start(&self) -> Result<(), CanopydError> {
        if self.components.get().is_some() {
            return Err(CanopydError::AlreadyRunning);
        }

        let data_dir = &self.config.data_dir;
        Self::validate_data_dir(data_dir)?;

        let file = match &self.config.config_file {
            Some(path) => Self::get_config_file(path),
            None => ConfigFile::default(),
        };
        let sync_config = self.config.sync_config(&file)?;
        let params = ChainParams::from(self.config.network);
        info!(
            "starting canopy on {}, keeping {} connections",
            self.config.network, sync_config.required_connections
        );

        let (headers, blocks) = self.load_stores(data_dir)?;

        let connector = Arc::new(TcpConnector::new(
            sync_config.network,
            sync_config.proxy,
            sync_config.user_agent.clone(),
        ));
        let pool = Arc::new(ConnectionPool::new(
            sync_config.clone(),
            connector,
            Arc::new(DefaultVersionFilter),
        ));

        if sync_config.connect.is_empty() {
            let mut sources: Vec<Box<dyn PeerSource>> = vec![
                Box::new(PeersFileSource::new(data_dir.clone())),
                Box::new(FixedSeedSource::new(self.config.network)),
            ];
            if sync_config.dns_seeds {
                sources.push(Box::new(DnsSeedSource::new(&params)));
            }
            pool.load_peers(&sources).await;
        } else {
            info!("only connecting to {} fixed peers", sync_config.connect.len());
        }

        let engine = Arc::new(ChainSyncEngine::new(
            sync_config.clone(),
            params,
            pool.clone(),
            headers.clone(),
        ));
        engine.initialize().await?;

        let blocks_engine = Arc::new(BlocksSyncEngine::new(
            sync_config.clone(),
            pool.clone(),
            headers.clone(),
            blocks,
        ));
        let fees = Arc::new(FeeEstimator::new(sync_config.clone(), pool.clone()));
        let interface = NodeInterface::new(
            engine.clone(),
            pool.clone(),
            headers,
            blocks_engine.clone(),
            fees,
        );

        let kill_signal = self.stop_signal.clone();
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(pool.run(kill_signal.clone())));
        if sync_config.protocols.contains(&Protocol::P2p) {
            let best_headers = engine.subscribe_best_headers();
            tasks.push(tokio::spawn(
                blocks_engine.run(best_headers, kill_signal.clone()),
            ));
        } else {
            debug!("no P2P peers allowed, not downloading blocks");
        }
        tasks.push(tokio::spawn(Self::log_sync_state(
            engine.clone(),
            kill_signal.clone(),
        )));
        tasks.push(tokio::spawn(engine.clone().run(kill_signal)));

        // Only fails if someone else got here first
        if self
            .components
            .set(Components { engine, interface })
            .is_err()
        {
            return Err(CanopydError::AlreadyRunning);
        }

        Ok(())
    }

    /// Reports every change of the engine's sync state
    async fn log_sync_state(engine: Arc<ChainSyncEngine>, kill_signal: Arc<RwLock<bool>>) {
        let mut state = engine.watch_sync_state();

        loop {
            if *kill_signal.read().await {
                break;
            }

            match tokio::time::timeout(std::time::Duration::from_secs(1), state.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => continue,
            }

            let current = *state.borrow_and_update();
            let tip = engine.best_header().ok().flatten();
            match tip {
                Some(tip) => info!("sync state is now {current:?}, tip at {}", tip.height),
                None => info!("sync state is now {current:?}"),
            }
        }
    }

    fn load_stores(
        &self,
        data_dir: &str,
    ) -> Result<(Arc<dyn HeadersRepository>, Arc<dyn BlocksRepository>), CanopydError> {
        if self.config.memory_store {
            info!("keeping headers and blocks in memory");
            let headers: Arc<dyn HeadersRepository> = Arc::new(MemoryHeadersStore::new());
            let blocks: Arc<dyn BlocksRepository> = Arc::new(MemoryBlocksStore::new());
            return Ok((headers, blocks));
        }

        info!("Loading header store");
        let headers: Arc<dyn HeadersRepository> =
            Arc::new(KvHeadersStore::<'static>::new(data_dir)?);
        let blocks: Arc<dyn BlocksRepository> = Arc::new(KvBlocksStore::<'static>::new(data_dir)?);

        Ok((headers, blocks))
    }

    fn validate_data_dir(path: &str) -> Result<(), CanopydError> {
        let p = Path::new(path);

        let md = fs::metadata(p).map_err(|_| CanopydError::InvalidDataDir(path.into()))?;
        if !md.is_dir() {
            return Err(CanopydError::InvalidDataDir(path.into()));
        }

        let probe = p.join(".perm_probe");
        if OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&probe)
            .is_err()
        {
            return Err(CanopydError::InvalidDataDir(path.into()));
        }
        let _ = fs::remove_file(probe);

        Ok(())
    }

    /// Loads a config file from disk, returns default if it cannot load it
    fn get_config_file(path: &str) -> ConfigFile {
        match ConfigFile::from_file(path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Could not load config file {path}, ignoring it");
                debug!("{e}");
                ConfigFile::default()
            }
        }
    }

    pub fn from_config(config: Config) -> Self {
        Self::from(config)
    }

    pub fn new(network: Network, data_dir: String) -> Self {
        Self::from_config(Config::new(network, data_dir))
    }
}

impl From<Config> for Canopyd {
    fn from(config: Config) -> Self {
        Self {
            config,
            stop_signal: Arc::new(RwLock::new(false)),
            tasks: Mutex::new(Vec::new()),
            components: OnceLock::new(),
        }
    }
}
