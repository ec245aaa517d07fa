//! Represents a storage node participating in the cluster.

use serde::{Deserialize, Serialize};

/// A node in the storage cluster and its tracked usage.
///
/// Nodes are declared in configuration; `used_size_bytes` is maintained in
/// memory by the cluster on every write, removal, and migration.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct StorageNode {
    /// Unique node name (e.g. "node-a").
    pub name: String,

    /// Node endpoint. For filesystem nodes this is the root directory.
    pub endpoint: String,

    #[serde(default)]
    pub access_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Whether the node accepts reads and writes.
    #[serde(default = "default_available")]
    pub available: bool,

    /// Bytes currently stored on the node.
    #[serde(default)]
    pub used_size_bytes: i64,

    /// Capacity of the node in bytes; 0 means unbounded.
    #[serde(default)]
    pub total_size_bytes: i64,

    /// Placement weight for hash-based selection.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_available() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

impl StorageNode {
    /// Usage as a percentage of capacity. Unbounded nodes report 0.
    pub fn usage_percent(&self) -> f64 {
        if self.total_size_bytes <= 0 {
            return 0.0;
        }
        self.used_size_bytes as f64 / self.total_size_bytes as f64 * 100.0
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("available", &self.available)
            .field("used_size_bytes", &self.used_size_bytes)
            .field("total_size_bytes", &self.total_size_bytes)
            .field("weight", &self.weight)
            .finish()
    }
}
