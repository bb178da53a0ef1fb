//! nmid-registry - Service Discovery Registry
//!
//! Registry nodes cooperate through a replicated, lease-aware key-value
//! store. This crate carries the cluster coordination layer that every
//! node runs underneath the registry itself.
//!
//! # Architecture
//!
//! A node is either a *host*, which launches and supervises a store
//! instance, or a *client*, which only connects to an existing cluster.
//! Both bootstrap through a retrying loop, then hold a liveness lease,
//! publish a heartbeat status blob and keep a persisted membership view
//! in sync with the store.
//!
//! # Features
//!
//! - Pluggable store backends: etcd (supervised child process) and memory
//! - Durable, deduplicated cluster membership with backup on rewrite
//! - Lease adoption across restarts with TTL floor and keep-alive
//! - Session-scoped distributed mutexes
//! - Bounded watch channels with cancellation
//! - Periodic defragmentation on host nodes
//! - Administrative HTTP API

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod store;

pub use cluster::Cluster;
pub use config::RegistryConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{Cluster, DistributedMutex, NodePhase, WatchEvent, WatchKind};
    pub use crate::config::{ClusterRole, RegistryConfig};
    pub use crate::error::{Error, Result};
    pub use crate::store::{backend_for, KeyValue, MemoryBackend, StoreBackend};
}
