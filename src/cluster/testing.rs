//! Single-node in-process fixture for unit tests

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::client::ClientProvider;
use super::members::Members;
use crate::config::{ClusterState, RegistryConfig};
use crate::store::{
    ConnectSettings, HostedStore, LaunchSpec, MemoryBackend, StoreBackend, StoreClient,
};

pub(crate) struct Harness {
    pub backend: MemoryBackend,
    pub host: Arc<dyn HostedStore>,
    pub config: RegistryConfig,
    pub members: Arc<Members>,
    pub clients: Arc<ClientProvider>,
    _dir: TempDir,
}

impl Harness {
    pub async fn client(&self) -> Arc<dyn StoreClient> {
        self.clients.get().await.unwrap()
    }
}

pub(crate) fn config(dir: &TempDir, name: &str) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.node.name = name.to_string();
    config.node.home_dir = dir.path().to_path_buf();
    config.node.data_dir = dir.path().join("data");
    config.node.log_dir = dir.path().join("log");
    config.node.member_dir = dir.path().join("member");
    config.cluster.request_timeout = "1s".to_string();
    config.cluster.heartbeat_interval_ms = 100;
    config
}

pub(crate) async fn harness(name: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir, name);

    let backend = MemoryBackend::new();
    let spec = LaunchSpec::new(
        &config,
        format!("{}={}", name, config.cluster.initial_advertise_peer_urls[0]),
        ClusterState::New,
    );
    let host = backend.launch(spec).await.unwrap();

    let members = Arc::new(Members::load(&config).unwrap());
    let clients = Arc::new(ClientProvider::new(
        Arc::new(backend.clone()),
        Arc::clone(&members),
        config.static_endpoints(),
        ConnectSettings::from_config(&config, Duration::from_secs(1)),
    ));

    Harness {
        backend,
        host,
        config,
        members,
        clients,
        _dir: dir,
    }
}
