//! Coordination against a real etcd binary
//!
//! Run with `--features integration`; needs `etcd` on PATH (or
//! `NMIDR_ETCD_BINARY`) and free ports 23790/23800.
#![cfg(feature = "integration")]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nmid_registry::cluster::{Cluster, NodePhase};
use nmid_registry::config::{ClusterRole, RegistryConfig, StoreBackendKind};
use nmid_registry::store::backend_for;

const CLIENT_URL: &str = "http://127.0.0.1:23790";
const PEER_URL: &str = "http://127.0.0.1:23800";

fn config(dir: &tempfile::TempDir, name: &str, role: ClusterRole, cluster_name: &str) -> Arc<RegistryConfig> {
    let mut config = RegistryConfig::default();
    config.node.name = name.to_string();
    config.node.home_dir = dir.path().to_path_buf();
    config.node.data_dir = dir.path().join("data");
    config.node.log_dir = dir.path().join("log");
    config.node.member_dir = dir.path().join("member");
    config.cluster.name = cluster_name.to_string();
    config.cluster.role = role;
    config.cluster.request_timeout = "3s".to_string();
    config.cluster.heartbeat_interval_ms = 500;
    config.cluster.listen_client_urls = vec![CLIENT_URL.to_string()];
    config.cluster.advertise_client_urls = vec![CLIENT_URL.to_string()];
    config.cluster.listen_peer_urls = vec![PEER_URL.to_string()];
    config.cluster.initial_advertise_peer_urls = vec![PEER_URL.to_string()];
    if role == ClusterRole::Client {
        config.cluster.endpoints = vec![CLIENT_URL.to_string()];
    }
    config.store.backend = StoreBackendKind::Etcd;
    if let Ok(binary) = std::env::var("NMIDR_ETCD_BINARY") {
        config.store.etcd_binary = PathBuf::from(binary);
    }
    config.store.startup_timeout_secs = 30;
    config.validate().unwrap();
    config.create_dirs().unwrap();
    Arc::new(config)
}

#[tokio::test]
async fn test_etcd_host_and_client() {
    let (dir_a, dir_b, dir_c) = (
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    );

    let host_config = config(&dir_a, "etcd-a", ClusterRole::Host, "c1");
    let a = Cluster::new(Arc::clone(&host_config), backend_for(&host_config)).unwrap();
    tokio::time::timeout(Duration::from_secs(60), a.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.phase(), NodePhase::Ready);
    assert!(a.is_leader().await);

    let client_config = config(&dir_b, "etcd-b", ClusterRole::Client, "c1");
    let b = Cluster::new(Arc::clone(&client_config), backend_for(&client_config)).unwrap();
    tokio::time::timeout(Duration::from_secs(30), b.run())
        .await
        .unwrap()
        .unwrap();

    a.put("/k", "v").await.unwrap();
    assert_eq!(b.get("/k").await.unwrap().as_deref(), Some("v"));

    let wrong_config = config(&dir_c, "etcd-c", ClusterRole::Client, "c2");
    let c = Cluster::new(Arc::clone(&wrong_config), backend_for(&wrong_config)).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(30), c.run())
        .await
        .unwrap()
        .err()
        .unwrap();
    assert!(err.is_fatal());

    c.close().await;
    b.close().await;
    a.close().await;
}
