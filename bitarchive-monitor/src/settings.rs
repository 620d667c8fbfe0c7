use bitarchive_core::ArchiveSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MonitorError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    pub id: String,
    #[serde(default)]
    pub settings: ArchiveSettings,
}

/// Replica membership plus the waiting policy of the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Floor for how long to wait on a node; jobs may declare longer.
    pub default_batch_timeout_ms: u64,
    /// A node silent for longer than this is not sent batches.
    pub sign_of_life_delay_ms: u64,
    /// Where merged results go; defaults to the system temp dir.
    pub output_dir: Option<PathBuf>,
    pub replicas: BTreeMap<String, Vec<NodeSettings>>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            default_batch_timeout_ms: 30 * 60 * 1000,
            sign_of_life_delay_ms: 60 * 1000,
            output_dir: None,
            replicas: BTreeMap::new(),
        }
    }
}

impl ClusterSettings {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw)
            .map_err(|e| MonitorError::Settings(format!("'{}': {e}", path.display())))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_batch_timeout_ms)
    }

    pub fn sign_of_life_delay(&self) -> Duration {
        Duration::from_millis(self.sign_of_life_delay_ms)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn nodes(&self, replica: &str) -> Result<&[NodeSettings]> {
        self.replicas
            .get(replica)
            .map(Vec::as_slice)
            .ok_or_else(|| MonitorError::UnknownReplica(replica.to_string()))
    }

    pub fn node(&self, replica: &str, node: &str) -> Result<&NodeSettings> {
        self.nodes(replica)?
            .iter()
            .find(|n| n.id == node)
            .ok_or_else(|| MonitorError::UnknownNode {
                replica: replica.to_string(),
                node: node.to_string(),
            })
    }
}
