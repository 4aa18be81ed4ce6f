//! Configuration for the node and router servers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for one participant node server.
///
/// Usually loaded from a toml file with [`Self::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Participant name, e.g. `Alice_White`. Also names the store file.
    pub name: String,
    /// Port the node server listens on.
    pub port: u16,
    /// Directory holding the durable store file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl NodeConfig {
    /// Loads the config from a toml file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Path of this node's durable store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}_meetings.txt", self.name))
    }
}

/// Configuration for the central router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Port the router listens on for client submissions.
    #[serde(default = "default_router_port")]
    pub port: u16,
    /// Path to the node directory file, a toml table of `name = port`.
    pub directory: PathBuf,
}

impl RouterConfig {
    /// Loads the config from a toml file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_router_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_config_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("node.toml");
        tokio::fs::write(&path, "name = \"Alice_White\"\nport = 9091\n").await?;

        let config = NodeConfig::load(&path).await?;
        assert_eq!(config.name, "Alice_White");
        assert_eq!(config.port, 9091);
        assert_eq!(config.store_path(), PathBuf::from("data/Alice_White_meetings.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn router_config_defaults_port() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("router.toml");
        tokio::fs::write(&path, "directory = \"nodes.toml\"\n").await?;

        let config = RouterConfig::load(&path).await?;
        assert_eq!(config.port, 9090);
        assert_eq!(config.directory, PathBuf::from("nodes.toml"));
        Ok(())
    }
}
