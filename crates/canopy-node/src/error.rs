use canopy_chain::ChainError;
use canopy_common::impl_error_from;
use canopy_wire::address_man::AddrManError;
use canopy_wire::WireError;

#[derive(Debug)]
pub enum CanopydError {
    /// Generic IO operation error.
    Io(std::io::Error),

    /// TOML parsing error.
    TomlParsing(toml::de::Error),

    /// Key-value database error
    Db(kv::Error),

    /// Our header chain couldn't be loaded or checked.
    Chain(ChainError),

    /// The networking side failed to start.
    Wire(WireError),

    /// A peer given with `--connect` or in the config file couldn't be parsed.
    InvalidPeer(AddrManError),

    /// The proxy address couldn't be resolved.
    InvalidProxy(String),

    /// The data directory doesn't exist or isn't writable.
    InvalidDataDir(String),

    /// [crate::Canopyd::start] was called twice.
    AlreadyRunning,
}

impl std::fmt::Display for CanopydError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanopydError::Io(err) => write!(f, "Io error {err}"),
            CanopydError::TomlParsing(err) => write!(f, "Error deserializing toml file {err}"),
            CanopydError::Db(err) => write!(f, "Database error {err}"),
            CanopydError::Chain(err) => write!(f, "Error with our header chain: {err}"),
            CanopydError::Wire(err) => write!(f, "Networking error: {err}"),
            CanopydError::InvalidPeer(err) => write!(f, "Invalid peer: {err}"),
            CanopydError::InvalidProxy(addr) => write!(f, "Invalid proxy address {addr}"),
            CanopydError::InvalidDataDir(path) => {
                write!(f, "Data directory {path} doesn't exist or isn't writable")
            }
            CanopydError::AlreadyRunning => write!(f, "canopyd is already running"),
        }
    }
}

impl_error_from!(CanopydError, std::io::Error, Io);
impl_error_from!(CanopydError, toml::de::Error, TomlParsing);
impl_error_from!(CanopydError, kv::Error, Db);
impl_error_from!(CanopydError, ChainError, Chain);
impl_error_from!(CanopydError, WireError, Wire);
impl_error_from!(CanopydError, AddrManError, InvalidPeer);

impl std::error::Error for CanopydError {}
