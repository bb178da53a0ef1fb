//! Store Backends
//!
//! The coordination layer talks to the replicated key-value store only
//! through the traits in this module. `etcd` drives a real etcd cluster,
//! `memory` is an in-process store for standalone nodes and tests.

pub mod etcd;
pub mod memory;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::{ClusterState, RegistryConfig, StoreBackendKind};
use crate::error::{Error, Result};

pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;

/// Opaque lease identifier issued by the store
pub type LeaseId = i64;

/// Auto-compaction retention in revisions
pub const AUTO_COMPACTION_RETENTION: &str = "10";
/// Backend database quota (8 GiB)
pub const QUOTA_BACKEND_BYTES: u64 = 8 * 1024 * 1024 * 1024;
/// Maximum operations in a single transaction
pub const MAX_TXN_OPS: u32 = 10240;
/// Maximum request size accepted by a server (8 MiB)
pub const MAX_REQUEST_BYTES: u64 = 8 * 1024 * 1024;
/// Committed entries between snapshots
pub const SNAPSHOT_COUNT: u64 = 5000;

/// Key with its store metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: LeaseId,
}

/// A member of the store's consensus group, as the store reports it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreMember {
    pub id: u64,
    /// Empty until the member has started
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

/// Status of the store instance answering a status request
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreStatus {
    pub member_id: u64,
    pub leader: u64,
    pub version: String,
    pub db_size: i64,
}

impl StoreStatus {
    pub fn is_leader(&self) -> bool {
        self.member_id != 0 && self.member_id == self.leader
    }
}

/// Kind of a raw change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
    /// Anything this crate does not understand
    Unknown(i32),
}

/// A single change reported by a store watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub key: String,
    pub value: String,
}

/// One response from a store watch
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    pub events: Vec<StoreEvent>,
    pub created: bool,
    pub canceled: bool,
    pub progress_notify: bool,
}

impl WatchBatch {
    pub fn events(events: Vec<StoreEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }
}

/// Live watch subscription; dropping it cancels the watch
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchBatch>> + Send>>;

/// Client connection settings
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub request_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub max_call_send_msg_size: usize,
}

impl ConnectSettings {
    pub fn from_config(config: &RegistryConfig, request_timeout: Duration) -> Self {
        Self {
            request_timeout,
            keep_alive_interval: Duration::from_secs(30),
            max_call_send_msg_size: config.cluster.max_call_send_msg_size,
        }
    }
}

/// Everything needed to launch a store instance for the host role
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    pub cluster_token: String,
    pub listen_client_urls: Vec<String>,
    pub advertise_client_urls: Vec<String>,
    pub listen_peer_urls: Vec<String>,
    pub advertise_peer_urls: Vec<String>,
    /// "name=peerUrl,..." for every member of the cluster being formed or joined
    pub initial_cluster: String,
    pub state: ClusterState,
    pub force_new_cluster: bool,
    pub auto_compaction_retention: String,
    pub quota_backend_bytes: u64,
    pub max_txn_ops: u32,
    pub max_request_bytes: u64,
    pub snapshot_count: u64,
    pub debug: bool,
}

impl LaunchSpec {
    pub fn new(config: &RegistryConfig, initial_cluster: String, state: ClusterState) -> Self {
        Self {
            name: config.name().to_string(),
            data_dir: config.node.data_dir.clone(),
            log_file: config.server_log_file(),
            cluster_token: config.cluster.name.clone(),
            listen_client_urls: config.cluster.listen_client_urls.clone(),
            advertise_client_urls: config.cluster.advertise_client_urls.clone(),
            listen_peer_urls: config.cluster.listen_peer_urls.clone(),
            advertise_peer_urls: config.cluster.initial_advertise_peer_urls.clone(),
            initial_cluster,
            state,
            force_new_cluster: config.cluster.force_new_cluster,
            auto_compaction_retention: AUTO_COMPACTION_RETENTION.to_string(),
            quota_backend_bytes: QUOTA_BACKEND_BYTES,
            max_txn_ops: MAX_TXN_OPS,
            max_request_bytes: MAX_REQUEST_BYTES,
            snapshot_count: SNAPSHOT_COUNT,
            debug: config.cluster.debug,
        }
    }

    /// Parse `initial_cluster` back into (name, peer URL) pairs
    pub fn initial_members(&self) -> Result<Vec<(String, String)>> {
        self.initial_cluster
            .split(',')
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .split_once('=')
                    .map(|(name, url)| (name.to_string(), url.to_string()))
                    .ok_or_else(|| {
                        Error::Config(format!("malformed initial cluster entry '{}'", entry))
                    })
            })
            .collect()
    }
}

/// Connection to the store
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Returns the number of deleted keys
    async fn delete(&self, key: &str) -> Result<i64>;

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseId>;

    /// Remaining TTL in seconds, -1 if the lease no longer exists
    async fn lease_time_to_live(&self, id: LeaseId) -> Result<i64>;

    /// Single renewal round-trip; returns the renewed TTL
    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<i64>;

    async fn lease_revoke(&self, id: LeaseId) -> Result<()>;

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream>;

    async fn member_list(&self) -> Result<Vec<StoreMember>>;

    /// Add a member with the given peer URLs; returns the updated member list
    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<StoreMember>>;

    /// Defragment the instance serving `endpoint`
    async fn defragment(&self, endpoint: &str) -> Result<()>;

    async fn status(&self) -> Result<StoreStatus>;

    /// Acquire the named lock bound to `lease`; returns the ownership key
    async fn lock(&self, name: &str, lease: LeaseId) -> Result<String>;

    async fn unlock(&self, key: &str) -> Result<()>;

    async fn close(&self);
}

/// A store instance launched by this node
#[async_trait]
pub trait HostedStore: Send + Sync {
    /// Resolves once the instance serves requests
    async fn ready(&self) -> Result<()>;

    /// Whether the instance bootstrapped a brand new cluster
    fn is_new_cluster(&self) -> bool;

    /// Resolves with the fatal error once the instance dies
    async fn failed(&self) -> Error;

    /// Status as answered by this instance itself
    async fn status(&self) -> Result<StoreStatus>;

    /// Graceful shutdown
    async fn close(&self) -> Result<()>;

    async fn hard_stop(&self);
}

/// Factory for clients and hosted instances
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn connect(
        &self,
        endpoints: &[String],
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn StoreClient>>;

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn HostedStore>>;
}

/// Build the backend selected by the configuration
pub fn backend_for(config: &RegistryConfig) -> Arc<dyn StoreBackend> {
    match config.store.backend {
        StoreBackendKind::Etcd => Arc::new(EtcdBackend::new(config.store.etcd_binary.clone())),
        StoreBackendKind::Memory => Arc::new(MemoryBackend::new()),
    }
}
