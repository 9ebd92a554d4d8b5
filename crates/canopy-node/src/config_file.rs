use std::path::Path;

use canopy_wire::address_man::Protocol;
use serde::Deserialize;

use crate::error::CanopydError;

#[derive(Default, Debug, Deserialize, PartialEq)]
pub struct NetworkSection {
    /// Peers we should use, in the same format as `--connect`
    pub connect: Option<Vec<String>>,
    /// A socks5 proxy, `host[:port]`
    pub proxy: Option<String>,
    /// How many connections we keep open
    pub connections: Option<usize>,
    /// Which protocols we may talk to peers with
    pub protocols: Option<Vec<Protocol>>,
}

#[derive(Default, Debug, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub network: NetworkSection,
}

impl ConfigFile {
    pub fn from_file(filename: impl AsRef<Path>) -> Result<Self, CanopydError> {
        let file = std::fs::read_to_string(filename)?;
        Self::parse(&file)
    }

    pub fn parse(contents: &str) -> Result<Self, CanopydError> {
        Ok(toml::from_str(contents)?)
    }
}
