use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything which can be configured.  Every field has a default,
/// so an empty (or missing) configuration file is fine.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct Settings {
    /// Address to listen on.
    #[serde(default = "default_server_ip")]
    pub server_ip: Ipv4Addr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub server_port: u16,

    /// The nameserver which resolution starts from.
    #[serde(default = "default_root_server_ip")]
    pub root_server_ip: Ipv4Addr,

    /// The port every upstream nameserver is queried on.
    #[serde(default = "default_port")]
    pub root_server_port: u16,

    /// Size of the receive buffers, for client requests and for
    /// upstream replies.
    #[serde(default = "default_request_size")]
    pub request_size: usize,

    /// Where the cache is loaded from at startup and saved to at
    /// shutdown.
    #[serde(default = "default_cache_filepath")]
    pub cache_filepath: PathBuf,

    /// Seconds between sweeps of the cache for expired entries.
    #[serde(default = "default_clean_period")]
    pub clean_period: u64,
}

impl Settings {
    /// Read settings from a file, then override them with any
    /// `RESOLVED_*` environment variables.  The file format is
    /// inferred from the extension.
    ///
    /// # Errors
    ///
    /// If the file exists but cannot be parsed, or a value is of the
    /// wrong type.
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("RESOLVED"))
            .build()?
            .try_deserialize()
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_period)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_ip: default_server_ip(),
            server_port: default_port(),
            root_server_ip: default_root_server_ip(),
            root_server_port: default_port(),
            request_size: default_request_size(),
            cache_filepath: default_cache_filepath(),
            clean_period: default_clean_period(),
        }
    }
}

fn default_server_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_port() -> u16 {
    53
}

// a.root-servers.net
fn default_root_server_ip() -> Ipv4Addr {
    Ipv4Addr::new(198, 41, 0, 4)
}

fn default_request_size() -> usize {
    512
}

fn default_cache_filepath() -> PathBuf {
    PathBuf::from("cache.json")
}

fn default_clean_period() -> u64 {
    60
}
