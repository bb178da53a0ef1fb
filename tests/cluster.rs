//! End-to-end coordination scenarios on the in-process store backend

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use nmid_registry::cluster::{Cluster, NodePhase, WatchKind};
use nmid_registry::config::{ClusterRole, RegistryConfig, StoreBackendKind};
use nmid_registry::error::Error;
use nmid_registry::store::MemoryBackend;

const HOST_CLIENT_URL: &str = "http://127.0.0.1:12379";
const HOST_PEER_URL: &str = "http://127.0.0.1:12380";

fn base_config(dir: &TempDir, name: &str, cluster_name: &str) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.node.name = name.to_string();
    config.node.home_dir = dir.path().to_path_buf();
    config.node.data_dir = dir.path().join("data");
    config.node.log_dir = dir.path().join("log");
    config.node.member_dir = dir.path().join("member");
    config.cluster.name = cluster_name.to_string();
    config.cluster.request_timeout = "1s".to_string();
    config.cluster.heartbeat_interval_ms = 100;
    config.store.backend = StoreBackendKind::Memory;
    config.store.startup_timeout_secs = 5;
    config
}

fn host_config(dir: &TempDir, name: &str, cluster_name: &str, client_url: &str, peer_url: &str) -> Arc<RegistryConfig> {
    let mut config = base_config(dir, name, cluster_name);
    config.cluster.role = ClusterRole::Host;
    config.cluster.listen_client_urls = vec![client_url.to_string()];
    config.cluster.advertise_client_urls = vec![client_url.to_string()];
    config.cluster.listen_peer_urls = vec![peer_url.to_string()];
    config.cluster.initial_advertise_peer_urls = vec![peer_url.to_string()];
    config.validate().unwrap();
    Arc::new(config)
}

fn client_config(dir: &TempDir, name: &str, cluster_name: &str) -> Arc<RegistryConfig> {
    let mut config = base_config(dir, name, cluster_name);
    config.cluster.role = ClusterRole::Client;
    config.cluster.endpoints = vec![HOST_CLIENT_URL.to_string()];
    config.validate().unwrap();
    Arc::new(config)
}

async fn start_host(backend: &MemoryBackend, dir: &TempDir, cluster_name: &str) -> Arc<Cluster> {
    let config = host_config(dir, "node-a", cluster_name, HOST_CLIENT_URL, HOST_PEER_URL);
    let cluster = Cluster::new(config, Arc::new(backend.clone())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), cluster.run())
        .await
        .unwrap()
        .unwrap();
    cluster
}

async fn start_client(backend: &MemoryBackend, dir: &TempDir, name: &str, cluster_name: &str) -> Arc<Cluster> {
    let cluster = Cluster::new(client_config(dir, name, cluster_name), Arc::new(backend.clone())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), cluster.run())
        .await
        .unwrap()
        .unwrap();
    cluster
}

#[tokio::test]
async fn test_host_and_client_share_store() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let a = start_host(&backend, &dir_a, "c1").await;
    assert_eq!(a.phase(), NodePhase::Ready);
    assert!(a.is_leader().await);

    let b = start_client(&backend, &dir_b, "node-b", "c1").await;
    assert_eq!(b.phase(), NodePhase::Ready);
    assert!(b.is_leader().await);

    a.put("/k", "v").await.unwrap();
    assert_eq!(b.get("/k").await.unwrap().as_deref(), Some("v"));

    let raw = b.get_raw("/k").await.unwrap().unwrap();
    assert_eq!(raw.version, 1);
    assert_eq!(raw.lease, 0);
    assert!(b.get_raw("/missing").await.unwrap().is_none());

    b.close().await;
    a.close().await;
    assert_eq!(a.phase(), NodePhase::Closed);
}

#[tokio::test]
async fn test_client_with_other_cluster_name_is_fatal() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_host(&backend, &dir_a, "c1").await;

    let b = Cluster::new(client_config(&dir_b, "node-b", "c2"), Arc::new(backend.clone())).unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), b.run())
        .await
        .unwrap()
        .err()
        .unwrap();
    assert!(err.is_fatal());
    match err {
        Error::ClusterNameMismatch { local, stored } => {
            assert_eq!(local, "c2");
            assert_eq!(stored, "c1");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_ne!(b.phase(), NodePhase::Ready);

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_client_retries_until_host_appears() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let b = Cluster::new(client_config(&dir_b, "node-b", "c1"), Arc::new(backend.clone())).unwrap();
    let bootstrap = tokio::spawn({
        let b = Arc::clone(&b);
        async move { b.run().await }
    });

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!bootstrap.is_finished());
    assert_eq!(b.phase(), NodePhase::ClientConnecting);

    let a = start_host(&backend, &dir_a, "c1").await;
    tokio::time::timeout(Duration::from_secs(5), bootstrap)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(b.phase(), NodePhase::Ready);

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_status_blob_and_owned_keys_follow_lease() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_host(&backend, &dir_a, "c1").await;
    let b = start_client(&backend, &dir_b, "node-b", "c1").await;

    b.put_under_own_lease("/services/web/node-b", "10.0.0.2").await.unwrap();

    // first heartbeat publishes the status blobs
    tokio::time::sleep(Duration::from_millis(300)).await;
    let statuses = a.get_prefix("/status/members/").await.unwrap();
    let keys: Vec<&str> = statuses.iter().map(|kv| kv.key.as_str()).collect();
    assert_eq!(keys, vec!["/status/members/node-a", "/status/members/node-b"]);

    let lease_key = a.get_raw("/leases/node-b").await.unwrap().unwrap();
    assert!(!lease_key.value.is_empty());

    b.close().await;
    assert!(a.get("/services/web/node-b").await.unwrap().is_none());
    assert!(a.get("/status/members/node-b").await.unwrap().is_none());

    a.close().await;
}

#[tokio::test]
async fn test_watch_sees_changes_from_other_node() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_host(&backend, &dir_a, "c1").await;
    let b = start_client(&backend, &dir_b, "node-b", "c1").await;

    let ctx = CancellationToken::new();
    let mut events = b.watch("/services/", true, ctx.clone()).await.unwrap();

    a.put("/services/api", "10.0.0.1:80").await.unwrap();
    a.delete("/services/api").await.unwrap();

    let put = events.recv().await.unwrap();
    assert_eq!(put.kind, WatchKind::Put);
    assert_eq!(put.key, "/services/api");
    assert_eq!(put.value, "10.0.0.1:80");
    let delete = events.recv().await.unwrap();
    assert_eq!(delete.kind, WatchKind::Delete);
    assert!(delete.value.is_empty());

    ctx.cancel();
    assert!(events.recv().await.is_none());

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_mutex_excludes_across_nodes() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_host(&backend, &dir_a, "c1").await;
    let b = start_client(&backend, &dir_b, "node-b", "c1").await;

    let on_a = a.new_mutex("/locks/registry").await.unwrap();
    let on_b = b.new_mutex("/locks/registry").await.unwrap();

    on_a.lock().await.unwrap();
    let err = on_b.lock().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{}", err);

    on_a.unlock().await.unwrap();
    on_b.lock().await.unwrap();
    on_b.unlock().await.unwrap();

    b.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_host_joins_existing_cluster() {
    let backend = MemoryBackend::new();
    let (dir_a, dir_c) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let a = start_host(&backend, &dir_a, "c1").await;

    let mut config = (*host_config(
        &dir_c,
        "node-c",
        "c1",
        "http://127.0.0.1:22379",
        "http://127.0.0.1:22380",
    ))
    .clone();
    config.cluster.join_urls = vec![HOST_PEER_URL.to_string()];
    let c = Cluster::new(Arc::new(config), Arc::new(backend.clone())).unwrap();
    tokio::time::timeout(Duration::from_secs(5), c.run())
        .await
        .unwrap()
        .unwrap();

    assert!(a.is_leader().await);
    assert!(!c.is_leader().await);

    let members = c.members().cluster_members().await;
    let names: Vec<&str> = members.as_slice().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["node-a", "node-c"]);
    assert!(members.as_slice().iter().all(|m| m.id != 0));

    // membership survives on disk
    let persisted = std::fs::read_to_string(c.config().members_file()).unwrap();
    assert!(persisted.contains("http://127.0.0.1:22380"));

    c.close().await;
    a.close().await;
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let backend = MemoryBackend::new();
    let dir = tempfile::tempdir().unwrap();
    let a = start_host(&backend, &dir, "c1").await;

    a.close().await;
    a.close().await;
    assert_eq!(a.phase(), NodePhase::Closed);
    assert!(matches!(a.put("/k", "v").await, Err(Error::ShuttingDown)));
}
