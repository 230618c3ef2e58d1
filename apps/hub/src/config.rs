//! Hub configuration.
//!
//! Stored as TOML at `$CSTATE_CONFIG`, or `~/.config/cstate/hub.toml` when
//! that is unset. A missing file means defaults. `CSTATE_PORT` overrides the
//! port from the file.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use cstate_hub::ServerConfig;

const CONFIG_ENV: &str = "CSTATE_CONFIG";
const PORT_ENV: &str = "CSTATE_PORT";

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// TCP port agents connect to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
}

fn default_port() -> u16 {
    ServerConfig::default().port
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
        }
    }
}

impl HubConfig {
    /// Loads the configuration file and applies environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        let mut config = Self::from_file(&path)?;
        if let Ok(port) = std::env::var(PORT_ENV) {
            config.apply_port_override(&port)?;
        }
        Ok(config)
    }

    /// Reads `path`; a missing file yields defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    fn apply_port_override(&mut self, raw: &str) -> anyhow::Result<()> {
        self.port = raw
            .trim()
            .parse()
            .with_context(|| format!("{PORT_ENV}={raw:?} is not a port"))?;
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.bind,
            port: self.port,
        }
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("cstate")
        .join("hub.toml")
}
