use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use grader_config::{Config, QueueConfig, StorageConfig, BROKER_MEMORY};
use grader_job_queue::{Broker, MemoryBroker, QueueOptions, SpoolBroker, SpoolOptions};
use grader_workers::{default_concurrency, FileTracker, LifecycleTracker, PoolConfig};

use crate::artifacts::FsArtifactStore;
use crate::error::ServiceError;

/// Load configuration from `path` (if any) and the environment, then validate it.
pub fn load_validated_config(path: Option<&Path>) -> Result<Config, ServiceError> {
    let config = grader_config::load_config(path)?;
    grader_config::validate_config(&config)?;
    Ok(config)
}

/// Build the broker selected by `queue.broker`.
pub fn broker_from_config(cfg: &QueueConfig) -> Arc<dyn Broker> {
    if cfg.broker == BROKER_MEMORY {
        tracing::warn!("using the in-memory broker, jobs do not outlive this process");
        return Arc::new(MemoryBroker::new());
    }
    Arc::new(SpoolBroker::new(
        &cfg.spool_dir,
        SpoolOptions {
            visibility_timeout: cfg.visibility_timeout(),
            poll_interval: cfg.poll_interval(),
        },
    ))
}

pub fn queue_options_from_config(cfg: &QueueConfig) -> QueueOptions {
    QueueOptions {
        topic: cfg.topic.clone(),
        prefetch: cfg.prefetch,
        reconnect_initial: cfg.reconnect_initial(),
        reconnect_max: cfg.reconnect_max(),
        drain_timeout: cfg.drain_timeout(),
        ..QueueOptions::default()
    }
}

pub fn pool_config_from_config(cfg: &Config) -> PoolConfig {
    PoolConfig {
        retry_limit: cfg.workers.retry_limit,
        shutdown_timeout: cfg.workers.shutdown_timeout(),
        ..PoolConfig::default()
    }
}

/// `0` means twice the available parallelism.
pub fn resolve_concurrency(configured: usize) -> usize {
    if configured == 0 {
        default_concurrency()
    } else {
        configured
    }
}

pub async fn tracker_from_config(
    cfg: &StorageConfig,
) -> Result<Arc<dyn LifecycleTracker>, ServiceError> {
    Ok(Arc::new(FileTracker::open(&cfg.state_dir).await?))
}

pub async fn artifacts_from_config(cfg: &StorageConfig) -> Result<FsArtifactStore, ServiceError> {
    Ok(FsArtifactStore::open(&cfg.artifacts_dir).await?)
}

/// Parse host:port into a SocketAddr, with fallback to 127.0.0.1.
pub fn parse_bind_address(host: &str, port: u16) -> SocketAddr {
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, port))
        .or_else(|_| host.parse::<SocketAddr>())
        .or_else(|_| host.parse::<Ipv6Addr>().map(|ip| SocketAddr::new(IpAddr::V6(ip), port)))
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)))
}
