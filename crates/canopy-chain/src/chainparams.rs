//! Per-network constants: where the chain starts, how easy a block may be, which ports and DNS
//! seeds to use, and the checkpoints we hold every peer against.

use std::collections::BTreeMap;
use std::str::FromStr;

use bitcoin::block::Header;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::BlockHash;
use bitcoin::Target;
use canopy_common::bhash;

use crate::Network;

/// Size of a difficulty period. Electrum serves headers in chunks of this size.
pub const RETARGET_INTERVAL: u32 = 2016;

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// The network's first block header, also called genesis
    pub genesis: Header,
    /// This is the maximum possible target (i.e, minimum possible difficulty), and in mainnet
    /// it's defined as ~((uint256)0 >> 32).
    pub max_target: Target,
    /// Default port for Bitcoin P2P connections
    pub p2p_port: u16,
    /// Default port for plaintext Electrum connections
    pub electrum_port: u16,
    /// Headers at these heights must have exactly these hashes
    pub checkpoints: BTreeMap<u32, BlockHash>,
    pub dns_seeds: Vec<&'static str>,
}

impl ChainParams {
    fn max_target(net: Network) -> Target {
        match net {
            Network::Bitcoin => Target::MAX_ATTAINABLE_MAINNET,
            Network::Testnet => Target::MAX_ATTAINABLE_TESTNET,
            Network::Signet => Target::MAX_ATTAINABLE_SIGNET,
            Network::Regtest => Target::MAX_ATTAINABLE_REGTEST,
        }
    }

    /// The hash we expect at `height`, if it's a checkpoint
    pub fn checkpoint_at(&self, height: u32) -> Option<BlockHash> {
        self.checkpoints.get(&height).copied()
    }

    /// The highest checkpoint at or below `height`
    pub fn last_checkpoint_at_or_below(&self, height: u32) -> Option<(u32, BlockHash)> {
        self.checkpoints
            .range(..=height)
            .next_back()
            .map(|(height, hash)| (*height, *hash))
    }

    pub fn genesis_hash(&self) -> BlockHash {
        self.genesis.block_hash()
    }
}

fn get_checkpoints(net: Network) -> BTreeMap<u32, BlockHash> {
    let mut checkpoints = BTreeMap::new();
    // Taken from Bitcoin Core's historical checkpoint list
    match net {
        Network::Bitcoin => {
            checkpoints.insert(
                11111,
                bhash!("0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            );
            checkpoints.insert(
                33333,
                bhash!("000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            );
            checkpoints.insert(
                74000,
                bhash!("0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
            );
            checkpoints.insert(
                105000,
                bhash!("00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            );
            checkpoints.insert(
                134444,
                bhash!("00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            );
            checkpoints.insert(
                168000,
                bhash!("000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            );
            checkpoints.insert(
                193000,
                bhash!("000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
            );
            checkpoints.insert(
                210000,
                bhash!("000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            );
            checkpoints.insert(
                216116,
                bhash!("00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
            );
            checkpoints.insert(
                225430,
                bhash!("00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
            );
            checkpoints.insert(
                250000,
                bhash!("000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            );
            checkpoints.insert(
                279000,
                bhash!("0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
            );
            checkpoints.insert(
                295000,
                bhash!("00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
            );
        }
        Network::Testnet => {
            checkpoints.insert(
                546,
                bhash!("000000002a936ca763904c3c35fce2f3556c559c0214345d31b1bcebf76acb70"),
            );
        }
        Network::Signet | Network::Regtest => {}
    }
    checkpoints
}

fn get_chain_dns_seeds(network: Network) -> Vec<&'static str> {
    let mut seeds = Vec::new();
    match network {
        Network::Bitcoin => {
            seeds.push("seed.bitcoin.sipa.be."); // Pieter Wuille
            seeds.push("dnsseed.bluematt.me."); // Matt Corallo
            seeds.push("dnsseed.bitcoin.dashjr.org."); // Luke Dashjr
            seeds.push("seed.bitcoinstats.com."); // Christian Decker
            seeds.push("seed.bitcoin.jonasschnelli.ch."); // Jonas Schnelli
            seeds.push("seed.btc.petertodd.org."); // Peter Todd
            seeds.push("seed.bitcoin.sprovoost.nl."); // Sjors Provoost
            seeds.push("dnsseed.emzy.de."); // Stephan Oeste
            seeds.push("seed.bitcoin.wiz.biz."); // Jason Maurice
        }
        Network::Testnet => {
            seeds.push("testnet-seed.bitcoin.jonasschnelli.ch.");
            seeds.push("seed.tbtc.petertodd.org.");
            seeds.push("seed.testnet.bitcoin.sprovoost.nl.");
            seeds.push("testnet-seed.bluematt.me.");
        }
        Network::Signet => {
            seeds.push("seed.signet.bitcoin.sprovoost.nl.");
        }
        Network::Regtest => {}
    }
    seeds
}

impl From<Network> for ChainParams {
    fn from(net: Network) -> Self {
        let genesis = genesis_block(bitcoin::Network::from(net)).header;
        let (p2p_port, electrum_port) = match net {
            Network::Bitcoin => (8333, 50001),
            Network::Testnet => (18333, 60001),
            Network::Signet => (38333, 60601),
            Network::Regtest => (18444, 60401),
        };

        ChainParams {
            network: net,
            genesis,
            max_target: ChainParams::max_target(net),
            p2p_port,
            electrum_port,
            checkpoints: get_checkpoints(net),
            dns_seeds: get_chain_dns_seeds(net),
        }
    }
}
