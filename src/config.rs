use crate::{backend::cluster::Strategy, models::StorageNode};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "DEDUP_STORE_";

/// Placeholder secret used when none is configured.
pub const DEFAULT_PRESIGN_SECRET: &str = "change-me";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Bucket used for chunks, merged objects, and downloads.
    pub bucket: String,
    /// Base URL presigned links point at.
    pub public_endpoint: String,
    pub presign_secret: String,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
    pub merge_lock_ttl: Duration,
    pub worker: WorkerSettings,
    pub cluster: ClusterSettings,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("bucket", &self.bucket)
            .field("public_endpoint", &self.public_endpoint)
            .field("presign_secret", &"<redacted>")
            .field("cache_capacity", &self.cache_capacity)
            .field("cache_ttl", &self.cache_ttl)
            .field("merge_lock_ttl", &self.merge_lock_ttl)
            .field("worker", &self.worker)
            .field("cluster", &self.cluster)
            .finish()
    }
}

/// Download worker pool, retry, and fetch policy settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    /// Fetch starts per second; 0 or less disables limiting.
    pub rate: f64,
    pub burst: u32,
    pub retry_max: u32,
    pub retry_delays: Vec<Duration>,
    pub http_timeout: Duration,
    pub allow_private: bool,
    pub allowed_hosts: Vec<String>,
    /// Maximum accepted content length; 0 means unlimited.
    pub max_bytes: u64,
    pub poll_interval: Duration,
    /// How long a claimed delivery stays invisible before redelivery.
    pub lease: Duration,
    pub stale_task_after: Duration,
}

/// Multi-node storage settings. An empty node list selects the single
/// filesystem backend rooted at `storage_dir`.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub nodes: Vec<StorageNode>,
    pub replica_count: usize,
    pub strategy: Strategy,
    /// Usage percentage above which a node is drained.
    pub migration_threshold: f64,
    pub migration_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate: 2.0,
            burst: 4,
            retry_max: 5,
            retry_delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(120),
                Duration::from_secs(600),
                Duration::from_secs(1800),
            ],
            http_timeout: Duration::from_secs(30 * 60),
            allow_private: false,
            allowed_hosts: Vec::new(),
            max_bytes: 0,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(35 * 60),
            stale_task_after: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            replica_count: 2,
            strategy: Strategy::RoundRobin,
            migration_threshold: 80.0,
            migration_interval: Duration::from_secs(600),
        }
    }
}

/// Which services the binary runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// HTTP surface (health, presigned blob reads) and migration monitor.
    Serve,
    /// Download worker pool only.
    Worker,
    /// Everything in one process.
    #[default]
    All,
}

impl Mode {
    pub fn serves_http(self) -> bool {
        matches!(self, Mode::Serve | Mode::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Mode::Worker | Mode::All)
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Deduplicating object storage engine")]
pub struct Args {
    /// Host to bind to (overrides DEDUP_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DEDUP_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides DEDUP_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DEDUP_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Services to run
    #[arg(long, value_enum, default_value_t = Mode::All)]
    pub mode: Mode,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, mode, and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, Mode, bool)> {
        let args = Args::parse();
        let cfg = Self::from_lookup(&args, |key| env::var(key).ok())?;
        Ok((cfg, args.mode, args.migrate))
    }

    /// Build configuration from CLI args and an arbitrary variable source.
    /// Keys are looked up with the `DEDUP_STORE_` prefix.
    pub fn from_lookup<F>(args: &Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvSource { lookup };
        let worker_defaults = WorkerSettings::default();
        let cluster_defaults = ClusterSettings::default();

        let worker = WorkerSettings {
            concurrency: env.parse("WORKER_CONCURRENCY", worker_defaults.concurrency)?,
            rate: env.parse("DOWNLOAD_RATE", worker_defaults.rate)?,
            burst: env.parse("DOWNLOAD_BURST", worker_defaults.burst)?,
            retry_max: env.parse("DOWNLOAD_RETRY_MAX", worker_defaults.retry_max)?,
            retry_delays: env.durations("DOWNLOAD_RETRY_DELAYS", worker_defaults.retry_delays)?,
            http_timeout: env.duration("DOWNLOAD_HTTP_TIMEOUT", worker_defaults.http_timeout)?,
            allow_private: env.flag("DOWNLOAD_ALLOW_PRIVATE", worker_defaults.allow_private)?,
            allowed_hosts: env.list("DOWNLOAD_ALLOW_HOSTS"),
            max_bytes: env.parse("DOWNLOAD_MAX_BYTES", worker_defaults.max_bytes)?,
            poll_interval: env.duration("QUEUE_POLL_INTERVAL", worker_defaults.poll_interval)?,
            lease: env.duration("QUEUE_LEASE", worker_defaults.lease)?,
            stale_task_after: env.duration("STALE_TASK_AFTER", worker_defaults.stale_task_after)?,
        };

        let nodes = match env.get("STORAGE_NODES") {
            Some(raw) => serde_json::from_str::<Vec<StorageNode>>(&raw)
                .with_context(|| format!("parsing {ENV_PREFIX}STORAGE_NODES"))?,
            None => Vec::new(),
        };
        let cluster = ClusterSettings {
            nodes,
            replica_count: env.parse("REPLICA_COUNT", cluster_defaults.replica_count)?,
            strategy: env.parse("LOAD_BALANCE", cluster_defaults.strategy)?,
            migration_threshold: env
                .parse("MIGRATION_THRESHOLD", cluster_defaults.migration_threshold)?,
            migration_interval: env
                .duration("MIGRATION_INTERVAL", cluster_defaults.migration_interval)?,
        };

        let cfg = Self {
            host: args
                .host
                .clone()
                .unwrap_or_else(|| env.string("HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env.parse("PORT", 3000)?,
            },
            storage_dir: args
                .storage_dir
                .clone()
                .unwrap_or_else(|| env.string("STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.clone().unwrap_or_else(|| {
                env.string("DATABASE_URL", "sqlite://./data/meta/dedup_store.db")
            }),
            bucket: env.string("BUCKET", "netdisk"),
            public_endpoint: env.string("PUBLIC_ENDPOINT", "http://127.0.0.1:3000"),
            presign_secret: env.string("PRESIGN_SECRET", DEFAULT_PRESIGN_SECRET),
            cache_capacity: env.parse("CACHE_CAPACITY", 10_000)?,
            cache_ttl: env.duration("CACHE_TTL", Duration::from_secs(300))?,
            merge_lock_ttl: env.duration("MERGE_LOCK_TTL", Duration::from_secs(30))?,
            worker,
            cluster,
        };

        if cfg.worker.concurrency == 0 {
            bail!("{ENV_PREFIX}WORKER_CONCURRENCY must be at least 1");
        }
        Ok(cfg)
    }

    /// True while presigned URLs are signed with the placeholder secret.
    pub fn uses_default_secret(&self) -> bool {
        self.presign_secret == DEFAULT_PRESIGN_SECRET
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(value) => value
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("parsing {ENV_PREFIX}{key} value `{value}`")),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        let Some(value) = self.get(key) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => Ok(true),
            "0" | "false" | "no" | "n" | "off" => Ok(false),
            _ => bail!("parsing {ENV_PREFIX}{key} value `{value}`: expected a boolean"),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            Some(value) => parse_duration(&value)
                .with_context(|| format!("parsing {ENV_PREFIX}{key} value `{value}`")),
            None => Ok(default),
        }
    }

    fn durations(&self, key: &str, default: Vec<Duration>) -> Result<Vec<Duration>> {
        let parts = self.list(key);
        if parts.is_empty() {
            return Ok(default);
        }
        parts
            .iter()
            .map(|part| {
                parse_duration(part)
                    .with_context(|| format!("parsing {ENV_PREFIX}{key} entry `{part}`"))
            })
            .collect()
    }
}

/// Parse `500ms`, `10s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid duration `{raw}`"))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => bail!("unknown duration unit `{other}`"),
    };
    if !seconds.is_finite() || seconds < 0.0 {
        bail!("invalid duration `{raw}`");
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = AppConfig::from_lookup(&Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.bucket, "netdisk");
        assert_eq!(cfg.worker.concurrency, 4);
        assert_eq!(cfg.worker.retry_delays.len(), 5);
        assert_eq!(cfg.worker.retry_delays[2], Duration::from_secs(120));
        assert!(!cfg.worker.allow_private);
        assert!(cfg.cluster.nodes.is_empty());
        assert_eq!(cfg.cluster.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn debug_output_redacts_the_presign_secret() {
        let cfg = AppConfig::from_lookup(
            &Args::default(),
            lookup(&[("PRESIGN_SECRET", "hunter2-signing-key")]),
        )
        .unwrap();
        let printed = format!("{cfg:?}");
        assert!(!printed.contains("hunter2-signing-key"));
        assert!(printed.contains("<redacted>"));
        assert!(!cfg.uses_default_secret());

        let fallback = AppConfig::from_lookup(&Args::default(), lookup(&[])).unwrap();
        assert!(fallback.uses_default_secret());
    }

    #[test]
    fn cli_overrides_environment() {
        let args = Args {
            port: Some(9000),
            ..Args::default()
        };
        let cfg = AppConfig::from_lookup(&args, lookup(&[("PORT", "8000")])).unwrap();
        assert_eq!(cfg.port, 9000);
    }

    #[test]
    fn parses_worker_and_cluster_settings() {
        let cfg = AppConfig::from_lookup(
            &Args::default(),
            lookup(&[
                ("DOWNLOAD_RETRY_DELAYS", "1s, 500ms,2m"),
                ("DOWNLOAD_ALLOW_PRIVATE", "yes"),
                ("DOWNLOAD_ALLOW_HOSTS", "example.com, .cdn.example.org"),
                ("LOAD_BALANCE", "least_used"),
                (
                    "STORAGE_NODES",
                    r#"[{"name":"a","endpoint":"/tmp/a","total_size_bytes":100}]"#,
                ),
            ]),
        )
        .unwrap();
        assert_eq!(
            cfg.worker.retry_delays,
            vec![
                Duration::from_secs(1),
                Duration::from_millis(500),
                Duration::from_secs(120)
            ]
        );
        assert!(cfg.worker.allow_private);
        assert_eq!(cfg.worker.allowed_hosts, vec!["example.com", ".cdn.example.org"]);
        assert_eq!(cfg.cluster.strategy, Strategy::LeastUsed);
        assert_eq!(cfg.cluster.nodes.len(), 1);
        assert!(cfg.cluster.nodes[0].available);
        assert_eq!(cfg.cluster.nodes[0].weight, 1);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(AppConfig::from_lookup(&Args::default(), lookup(&[("PORT", "http")])).is_err());
        assert!(
            AppConfig::from_lookup(&Args::default(), lookup(&[("DOWNLOAD_HTTP_TIMEOUT", "5y")]))
                .is_err()
        );
        assert!(
            AppConfig::from_lookup(&Args::default(), lookup(&[("WORKER_CONCURRENCY", "0")]))
                .is_err()
        );
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("-1s").is_err());
    }
}
