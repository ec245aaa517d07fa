//! Multi-node blob backend with replica placement and usage-driven migration.
//!
//! Every node is a full [`BlobBackend`] of its own. The cluster picks a
//! primary per write, copies the payload to further replicas, and keeps an
//! in-memory usage counter per node. A background monitor moves objects off
//! nodes whose usage crosses the migration threshold.

use super::{
    BackendError, BackendResult, BlobBackend, BlobReader, BlobRef, ByteStream, FsBackend,
    ObjectInfo, PresignSigner, PutOptions,
};
use crate::{config::ClusterSettings, models::StorageNode};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Node selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastUsed,
    /// Weighted rendezvous hashing on the object key.
    Hash,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastUsed => "least_used",
            Strategy::Hash => "hash",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(Strategy::RoundRobin),
            "least_used" | "least_conn" => Ok(Strategy::LeastUsed),
            "hash" => Ok(Strategy::Hash),
            other => Err(format!("unknown load balance strategy `{other}`")),
        }
    }
}

struct Registry {
    nodes: Vec<StorageNode>,
    /// Buckets scanned by migration and usage rescans.
    buckets: BTreeSet<String>,
}

pub struct StorageCluster {
    registry: RwLock<Registry>,
    backends: Vec<Arc<dyn BlobBackend>>,
    strategy: Strategy,
    replica_count: usize,
    migration_threshold: f64,
    rr_index: AtomicUsize,
}

impl StorageCluster {
    pub fn new(
        members: Vec<(StorageNode, Arc<dyn BlobBackend>)>,
        strategy: Strategy,
        replica_count: usize,
        migration_threshold: f64,
    ) -> Self {
        let (nodes, backends) = members.into_iter().unzip();
        Self {
            registry: RwLock::new(Registry {
                nodes,
                buckets: BTreeSet::new(),
            }),
            backends,
            strategy,
            replica_count: replica_count.max(1),
            migration_threshold,
            rr_index: AtomicUsize::new(0),
        }
    }

    /// Build a cluster of filesystem nodes, each rooted at its endpoint.
    pub fn from_settings(
        settings: &ClusterSettings,
        bucket: &str,
        signer: Arc<PresignSigner>,
    ) -> BackendResult<Self> {
        if settings.nodes.is_empty() {
            return Err(BackendError::NoAvailableNodes);
        }
        let members = settings
            .nodes
            .iter()
            .map(|node| {
                let backend: Arc<dyn BlobBackend> =
                    Arc::new(FsBackend::new(&node.endpoint, signer.clone()));
                (node.clone(), backend)
            })
            .collect();
        let cluster = Self::new(
            members,
            settings.strategy,
            settings.replica_count,
            settings.migration_threshold,
        );
        cluster.track_bucket(bucket);
        Ok(cluster)
    }

    pub fn track_bucket(&self, bucket: &str) {
        let mut registry = self.registry.write();
        if !registry.buckets.contains(bucket) {
            registry.buckets.insert(bucket.to_string());
        }
    }

    /// Snapshot of the node registry.
    pub fn nodes(&self) -> Vec<StorageNode> {
        self.registry.read().nodes.clone()
    }

    pub fn set_available(&self, name: &str, available: bool) -> bool {
        let mut registry = self.registry.write();
        match registry.nodes.iter_mut().find(|node| node.name == name) {
            Some(node) => {
                node.available = available;
                info!(node = name, available, "storage node availability changed");
                true
            }
            None => false,
        }
    }

    /// Choose the node that receives the primary copy of `placement_key`.
    pub fn select_node(&self, placement_key: &str) -> BackendResult<usize> {
        let registry = self.registry.read();
        let nodes = &registry.nodes;
        if !nodes.iter().any(|node| node.available) {
            return Err(BackendError::NoAvailableNodes);
        }

        let picked = match self.strategy {
            Strategy::RoundRobin => {
                let len = nodes.len();
                (0..len)
                    .map(|_| self.rr_index.fetch_add(1, Ordering::Relaxed) % len)
                    .find(|&idx| nodes[idx].available)
            }
            Strategy::LeastUsed => least_used(nodes),
            Strategy::Hash => nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.available)
                .map(|(idx, node)| (idx, rendezvous_score(node, placement_key)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(idx, _)| idx),
        };
        picked.ok_or(BackendError::NoAvailableNodes)
    }

    fn node_name(&self, idx: usize) -> String {
        self.registry.read().nodes[idx].name.clone()
    }

    fn available_indices(&self) -> Vec<usize> {
        self.registry
            .read()
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.available)
            .map(|(idx, _)| idx)
            .collect()
    }

    fn adjust_usage(&self, idx: usize, delta: i64) {
        let mut registry = self.registry.write();
        let node = &mut registry.nodes[idx];
        node.used_size_bytes = (node.used_size_bytes + delta).max(0);
    }

    /// Available nodes after `primary` in ring order.
    fn replica_targets(&self, primary: usize) -> Vec<usize> {
        let registry = self.registry.read();
        let len = registry.nodes.len();
        (1..len)
            .map(|offset| (primary + offset) % len)
            .filter(|&idx| registry.nodes[idx].available)
            .take(self.replica_count - 1)
            .collect()
    }

    /// Write to one node and account for any payload it replaces.
    async fn put_on(
        &self,
        idx: usize,
        bucket: &str,
        key: &str,
        body: ByteStream,
        expected_size: Option<u64>,
        opts: PutOptions,
    ) -> BackendResult<u64> {
        let backend = &self.backends[idx];
        let previous = backend.head(bucket, key).await?.map_or(0, |info| info.size);
        let written = backend.put(bucket, key, body, expected_size, opts).await?;
        self.adjust_usage(idx, written as i64 - previous as i64);
        Ok(written)
    }

    /// First available node holding `bucket/key`.
    async fn locate(&self, bucket: &str, key: &str) -> BackendResult<Option<(usize, ObjectInfo)>> {
        for idx in self.available_indices() {
            if let Some(info) = self.backends[idx].head(bucket, key).await? {
                return Ok(Some((idx, info)));
            }
        }
        Ok(None)
    }

    /// Move every object off nodes above the usage threshold. A node that
    /// received objects during the pass is not drained in the same pass.
    /// Returns the number of objects relocated.
    pub async fn check_and_migrate(&self) -> usize {
        let mut migrated = 0;
        let mut received = BTreeSet::new();
        let node_count = self.registry.read().nodes.len();

        for source in 0..node_count {
            if received.contains(&source) {
                continue;
            }
            let (name, available, usage) = {
                let registry = self.registry.read();
                let node = &registry.nodes[source];
                (node.name.clone(), node.available, node.usage_percent())
            };
            if !available || usage <= self.migration_threshold {
                continue;
            }
            info!(
                node = %name,
                usage = format!("{usage:.2}"),
                threshold = self.migration_threshold,
                "node usage exceeds threshold, starting migration"
            );

            let target = least_used(&self.registry.read().nodes);
            let Some(target) = target else {
                warn!(node = %name, "no migration target available");
                continue;
            };
            if target == source {
                continue;
            }

            migrated += self.migrate_node(source, target).await;
            received.insert(target);
        }

        migrated
    }

    async fn migrate_node(&self, source: usize, target: usize) -> usize {
        let buckets: Vec<String> = self.registry.read().buckets.iter().cloned().collect();
        let (source_name, target_name) = (self.node_name(source), self.node_name(target));
        let mut moved = 0;

        for bucket in buckets {
            let objects = match self.backends[source].list(&bucket).await {
                Ok(objects) => objects,
                Err(err) => {
                    warn!(node = %source_name, bucket = %bucket, error = %err, "failed to list objects for migration");
                    continue;
                }
            };

            for object in objects {
                match self.migrate_object(source, target, &bucket, &object).await {
                    Ok(()) => {
                        moved += 1;
                        debug!(
                            key = %object.key,
                            from = %source_name,
                            to = %target_name,
                            "migrated object"
                        );
                    }
                    Err(err) => warn!(
                        key = %object.key,
                        from = %source_name,
                        to = %target_name,
                        error = %err,
                        "failed to migrate object"
                    ),
                }
            }
        }

        info!(from = %source_name, to = %target_name, moved, "migration pass finished");
        moved
    }

    async fn migrate_object(
        &self,
        source: usize,
        target: usize,
        bucket: &str,
        object: &ObjectInfo,
    ) -> BackendResult<()> {
        let target_has_copy = self.backends[target]
            .head(bucket, &object.key)
            .await?
            .is_some();
        if !target_has_copy {
            let reader = self.backends[source].get(bucket, &object.key).await?;
            self.put_on(
                target,
                bucket,
                &object.key,
                reader.body,
                Some(reader.size),
                PutOptions::default(),
            )
            .await?;
        }
        self.backends[source].remove(bucket, &object.key).await?;
        self.adjust_usage(source, -(object.size as i64));
        Ok(())
    }

    /// Run [`check_and_migrate`](Self::check_and_migrate) every `interval`
    /// until `cancel` fires.
    pub fn start_migration_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!(?interval, "migration monitor started");
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("migration monitor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let moved = self.check_and_migrate().await;
                        if moved > 0 {
                            info!(moved, "migration check relocated objects");
                        }
                    }
                }
            }
        })
    }

    /// Recompute every available node's usage from its listings.
    pub async fn rescan_usage(&self) -> BackendResult<()> {
        let buckets: Vec<String> = self.registry.read().buckets.iter().cloned().collect();
        for idx in self.available_indices() {
            let mut used: u64 = 0;
            for bucket in &buckets {
                used += self.backends[idx]
                    .list(bucket)
                    .await?
                    .iter()
                    .map(|object| object.size)
                    .sum::<u64>();
            }
            let mut registry = self.registry.write();
            registry.nodes[idx].used_size_bytes = used as i64;
        }
        Ok(())
    }
}

fn least_used(nodes: &[StorageNode]) -> Option<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.available)
        .min_by_key(|(_, node)| node.used_size_bytes)
        .map(|(idx, _)| idx)
}

/// Weighted rendezvous score: `weight / -ln(u)` with `u` uniform in (0, 1)
/// derived from SHA-256(node name, key).
fn rendezvous_score(node: &StorageNode, key: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(node.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let bits = u64::from_be_bytes(head) >> 11;
    let unit = (bits as f64 + 0.5) / (1u64 << 53) as f64;
    f64::from(node.weight.max(1)) / -unit.ln()
}

#[async_trait]
impl BlobBackend for StorageCluster {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        expected_size: Option<u64>,
        opts: PutOptions,
    ) -> BackendResult<u64> {
        self.track_bucket(bucket);
        let primary = self.select_node(key)?;
        let written = self
            .put_on(primary, bucket, key, body, expected_size, opts.clone())
            .await?;

        for replica in self.replica_targets(primary) {
            let copied = async {
                let reader = self.backends[primary].get(bucket, key).await?;
                self.put_on(replica, bucket, key, reader.body, Some(reader.size), opts.clone())
                    .await
            }
            .await;
            if let Err(err) = copied {
                warn!(
                    node = %self.node_name(replica),
                    bucket,
                    key,
                    error = %err,
                    "failed to write replica"
                );
            }
        }

        Ok(written)
    }

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<BlobReader> {
        for idx in self.available_indices() {
            match self.backends[idx].get(bucket, key).await {
                Ok(reader) => return Ok(reader),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(BackendError::not_found(bucket, key))
    }

    async fn head(&self, bucket: &str, key: &str) -> BackendResult<Option<ObjectInfo>> {
        Ok(self.locate(bucket, key).await?.map(|(_, info)| info))
    }

    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()> {
        for idx in self.available_indices() {
            if let Some(info) = self.backends[idx].head(bucket, key).await? {
                self.backends[idx].remove(bucket, key).await?;
                self.adjust_usage(idx, -(info.size as i64));
            }
        }
        Ok(())
    }

    async fn compose(&self, dest: &BlobRef, sources: &[BlobRef]) -> BackendResult<u64> {
        let mut bodies = Vec::with_capacity(sources.len());
        let mut total: u64 = 0;
        for source in sources {
            let reader = self.get(&source.bucket, &source.key).await?;
            total += reader.size;
            bodies.push(reader.body);
        }
        let body: ByteStream = stream::iter(bodies).flatten().boxed();
        self.put(&dest.bucket, &dest.key, body, Some(total), PutOptions::default())
            .await
    }

    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_params: &BTreeMap<String, String>,
    ) -> BackendResult<String> {
        let (idx, _) = self
            .locate(bucket, key)
            .await?
            .ok_or_else(|| BackendError::not_found(bucket, key))?;
        self.backends[idx]
            .presign(bucket, key, ttl, response_params)
            .await
    }

    async fn list(&self, bucket: &str) -> BackendResult<Vec<ObjectInfo>> {
        let mut union = BTreeMap::new();
        for idx in self.available_indices() {
            for object in self.backends[idx].list(bucket).await? {
                union.entry(object.key.clone()).or_insert(object);
            }
        }
        Ok(union.into_values().collect())
    }
}
