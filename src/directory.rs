//! The node directory: maps participant names to delivery addresses.
//!
//! The directory is loaded once at startup and injected into the
//! [`crate::router::Router`]; it never changes behind the router's back
//! and is only refreshed through an explicit [`Directory::reload`].

use std::{
    collections::HashMap,
    fmt,
    path::Path,
};

use anyhow::{Context, Result};

use crate::proto::NodeId;

/// A resolved delivery address for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddr {
    /// Hostname derived from the node name, see [`Directory::hostname`].
    pub host: String,
    /// Port from the directory file.
    pub port: u16,
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Name to port mapping consulted by the router.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    nodes: HashMap<NodeId, u16>,
}

impl Directory {
    /// Loads the directory from a toml file of `name = port` pairs.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read directory file {}", path.display()))?;
        let nodes: HashMap<String, u16> = toml::from_str(&content)
            .with_context(|| format!("failed to parse directory file {}", path.display()))?;
        Ok(Self {
            nodes: nodes
                .into_iter()
                .map(|(name, port)| (NodeId::new(name), port))
                .collect(),
        })
    }

    /// Builds a directory from in-memory entries.
    pub fn from_entries(entries: impl IntoIterator<Item = (NodeId, u16)>) -> Self {
        Self {
            nodes: entries.into_iter().collect(),
        }
    }

    /// Replaces the mapping with a freshly loaded copy of `path`.
    ///
    /// On failure the current mapping stays in place.
    pub fn reload(&mut self, path: impl AsRef<Path>) -> Result<()> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Resolves a node to its delivery address, if the node is known.
    pub fn resolve(&self, node: &NodeId) -> Option<NodeAddr> {
        self.nodes.get(node).map(|&port| NodeAddr {
            host: Self::hostname(node),
            port,
        })
    }

    /// The fixed naming convention turning a node name into a hostname:
    /// lowercased, `_` replaced by `-`, with a `-server` suffix.
    pub fn hostname(node: &NodeId) -> String {
        format!("{}-server", node.as_str().to_lowercase().replace('_', "-"))
    }

    /// Number of known nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the directory has no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
