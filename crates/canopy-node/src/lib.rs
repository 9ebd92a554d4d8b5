// SPDX-License-Identifier: MIT

//! The canopy daemon as a library: [Canopyd] opens our stores, finds peers, and runs the
//! connection pool and the sync engines until it's told to stop.

mod canopyd;
mod config_file;
mod error;

pub use canopyd::Canopyd;
pub use canopyd::Config;
pub use canopyd::Network;
pub use config_file::ConfigFile;
pub use error::CanopydError;
