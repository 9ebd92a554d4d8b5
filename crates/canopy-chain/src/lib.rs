// SPDX-License-Identifier: MIT

//! Everything canopy knows about the header chain itself, without any networking: what a header
//! record is, what each network's parameters and checkpoints are, how to check proof-of-work
//! and reconcile answers from several untrusted peers, and where accepted headers are kept.

pub mod chainparams;
pub mod chainstore;
pub mod consensus;
pub mod error;
pub mod header;
#[cfg(feature = "kv-chainstore")]
pub mod kv_chainstore;
pub mod memory_store;

use core::fmt;
use core::str::FromStr;

pub use chainparams::*;
pub use chainstore::*;
pub use consensus::*;
pub use error::*;
pub use header::HeaderRecord;
#[cfg(feature = "kv-chainstore")]
pub use kv_chainstore::KvBlocksStore;
#[cfg(feature = "kv-chainstore")]
pub use kv_chainstore::KvHeadersStore;
pub use memory_store::MemoryBlocksStore;
pub use memory_store::MemoryHeadersStore;

/// The networks we know how to follow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" | "testnet3" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network {other}")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        write!(f, "{name}")
    }
}
