use clap::Parser;
use clap::ValueEnum;

#[derive(Clone, Copy, Debug, ValueEnum, Default, PartialEq, Eq)]
pub enum Network {
    #[default]
    Bitcoin,
    Signet,
    Testnet,
    Regtest,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Bitcoin => write!(f, "bitcoin"),
            Network::Signet => write!(f, "signet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

impl From<Network> for canopy_node::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Bitcoin => canopy_node::Network::Bitcoin,
            Network::Signet => canopy_node::Network::Signet,
            Network::Testnet => canopy_node::Network::Testnet,
            Network::Regtest => canopy_node::Network::Regtest,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    pub config_file: Option<String>,

    /// Which network should we use
    #[arg(short, long, default_value_t = Network::Bitcoin)]
    pub network: Network,

    /// Turn debugging information on
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Where should we store data. Defaults to `$HOME/.canopy`, with a subdirectory for each
    /// network other than mainnet
    #[arg(long, value_name = "PATH")]
    pub data_dir: Option<String>,

    /// Write logs to `<data-dir>/debug.log` as well
    #[arg(long, default_value_t = false)]
    pub log_to_file: bool,

    /// A socks5 proxy we should use for every connection, `host[:port]`
    #[arg(long, value_name = "ADDRESS")]
    pub proxy: Option<String>,

    /// Only connect to these peers, `[p2p://|electrum://]host[:port]`. May be repeated
    #[arg(long, value_name = "PEER")]
    pub connect: Vec<String>,

    /// Don't ask DNS seeds for peers
    #[arg(long, default_value_t = false)]
    pub no_dns_seeds: bool,

    /// Only talk to Electrum servers
    #[arg(long, default_value_t = false, conflicts_with = "p2p_only")]
    pub electrum_only: bool,

    /// Only talk to Bitcoin P2P nodes
    #[arg(long, default_value_t = false)]
    pub p2p_only: bool,

    /// How many connections we keep open
    #[arg(long, value_name = "COUNT")]
    pub connections: Option<usize>,

    /// Keep headers and blocks in memory, nothing survives a restart
    #[arg(long, default_value_t = false)]
    pub memory_store: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::parse_from([
            "canopyd",
            "--network",
            "signet",
            "--connect",
            "electrum://10.0.0.1:50001",
            "--connect",
            "10.0.0.2",
            "--electrum-only",
            "--connections",
            "3",
        ]);

        assert_eq!(cli.network, Network::Signet);
        assert_eq!(cli.connect.len(), 2);
        assert!(cli.electrum_only);
        assert!(!cli.p2p_only);
        assert_eq!(cli.connections, Some(3));
        assert_eq!(cli.data_dir, None);
    }

    #[test]
    fn test_conflicting_protocols() {
        let result = Cli::try_parse_from(["canopyd", "--electrum-only", "--p2p-only"]);
        assert!(result.is_err());
    }
}
