//! Node configuration, loaded from a JSON file.
//!
//! ```json
//! {
//!   "log_path": "./askcoin.log",
//!   "db_path": "./db",
//!   "network": {
//!     "host": "203.0.113.7",
//!     "p2p": {
//!       "peer_file": "./peers.json",
//!       "port": 18050,
//!       "max_passive_conn": 16,
//!       "max_active_conn": 16
//!     },
//!     "websocket": { "port": 19050, "max_passive_conn": 1024 }
//!   }
//! }
//! ```
//!
//! The `websocket` section configures the client API surface, which lives
//! outside this process's chain core; it is parsed and validated here so a
//! deployment carries one complete config file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use lib_blockchain::GenesisConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub log_path: String,
    pub db_path: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub genesis: Option<GenesisSection>,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    /// Address announced to peers; must be reachable for the registration
    /// handshake's verify dial.
    pub host: String,
    pub p2p: P2pConfig,
    pub websocket: WebsocketConfig,
}

#[derive(Debug, Deserialize)]
pub struct P2pConfig {
    pub peer_file: String,
    pub port: u16,
    pub max_passive_conn: u32,
    pub max_active_conn: u32,
}

#[derive(Debug, Deserialize)]
pub struct WebsocketConfig {
    pub port: u16,
    pub max_passive_conn: u32,
}

/// Optional genesis override, used by private test networks.
#[derive(Debug, Deserialize)]
pub struct GenesisSection {
    pub root_pubkey: String,
    pub utc: u64,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(config)
    }

    pub fn genesis_config(&self) -> GenesisConfig {
        match &self.genesis {
            Some(section) => GenesisConfig::new(section.root_pubkey.clone(), section.utc),
            None => GenesisConfig::default(),
        }
    }
}

/// The peer file is a JSON array of `"host:port"` strings.
pub fn load_peer_file(path: &str) -> Result<Vec<(String, u16)>> {
    if !Path::new(path).exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path).with_context(|| format!("reading peer file {path}"))?;
    let entries: Vec<String> =
        serde_json::from_str(&raw).with_context(|| format!("parsing peer file {path}"))?;

    let mut peers = Vec::new();
    for entry in entries {
        let Some((host, port)) = entry.rsplit_once(':') else {
            continue;
        };
        let Ok(port) = port.parse() else { continue };
        peers.push((host.to_string(), port));
    }

    Ok(peers)
}

/// Rewrite the peer file with the node's current best-first address list.
pub fn save_peer_file(path: &str, peers: &[String]) -> Result<()> {
    let raw = serde_json::to_string_pretty(peers)?;
    fs::write(path, raw).with_context(|| format!("writing peer file {path}"))
}
