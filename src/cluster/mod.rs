//! Cluster Coordination Layer
//!
//! Bootstraps the node into its role, then keeps its lease, status blob,
//! membership view and (host role) store instance healthy until close.
//!
//! Shared resources are each behind their own lock; when several are needed
//! they are taken in the order connection, lease, session.

mod client;
pub mod defrag;
pub mod heartbeat;
mod host;
pub mod lease;
pub mod members;
mod mutex;
mod session;
mod state;
mod watcher;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use client::ClientProvider;
pub use defrag::DefragScheduler;
pub use heartbeat::{Heartbeat, MemberStatus, StoreInstanceStatus};
pub use host::HostController;
pub use lease::LeaseManager;
pub use members::{Member, MemberList, Members};
pub use mutex::DistributedMutex;
pub use session::{Session, SessionProvider};
pub use state::{HostState, NodePhase};
pub use watcher::{WatchEvent, WatchKind, Watcher};

use client::with_timeout;
use crate::config::{ClusterState, RegistryConfig};
use crate::error::{Error, Result};
use crate::store::{ConnectSettings, KeyValue, LaunchSpec, StoreBackend, StoreClient};

/// Key holding the cluster name, written once by the node creating the cluster
pub const CLUSTER_NAME_KEY: &str = "/nm/cluster/name";

/// Coordination layer of one registry node
pub struct Cluster {
    config: Arc<RegistryConfig>,
    request_timeout: Duration,
    backend: Arc<dyn StoreBackend>,
    members: Arc<Members>,
    clients: Arc<ClientProvider>,
    host: Option<Arc<HostController>>,
    leases: Arc<LeaseManager>,
    sessions: Arc<SessionProvider>,
    watcher: Watcher,
    defrag: Option<Arc<DefragScheduler>>,
    heartbeat: Arc<Heartbeat>,
    phase: Arc<watch::Sender<NodePhase>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Build the coordination layer and load persisted membership
    pub fn new(config: Arc<RegistryConfig>, backend: Arc<dyn StoreBackend>) -> Result<Arc<Self>> {
        let request_timeout = config.request_timeout()?;
        let members = Arc::new(Members::load(&config)?);

        let clients = Arc::new(ClientProvider::new(
            Arc::clone(&backend),
            Arc::clone(&members),
            config.static_endpoints(),
            ConnectSettings::from_config(&config, request_timeout),
        ));
        let host = config
            .is_host()
            .then(|| Arc::new(HostController::new(Arc::clone(&backend), config.startup_timeout())));
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&clients),
            config.name(),
            config.cluster.min_lease_ttl_secs,
        ));
        let sessions = Arc::new(SessionProvider::new(Arc::clone(&clients), Arc::clone(&leases)));

        let shutdown = CancellationToken::new();
        let watcher = Watcher::new(Arc::clone(&clients), shutdown.child_token());
        let defrag = config.is_host().then(|| {
            Arc::new(DefragScheduler::new(
                Arc::clone(&clients),
                config.first_advertise_client_url().ok().map(String::from),
            ))
        });

        let (phase, _) = watch::channel(NodePhase::Unready);
        let phase = Arc::new(phase);
        let heartbeat = Arc::new(Heartbeat::new(
            Arc::clone(&config),
            Arc::clone(&clients),
            Arc::clone(&leases),
            Arc::clone(&members),
            host.clone(),
            defrag.clone(),
            Arc::clone(&phase),
        ));

        Ok(Arc::new(Self {
            config,
            request_timeout,
            backend,
            members,
            clients,
            host,
            leases,
            sessions,
            watcher,
            defrag,
            heartbeat,
            phase,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &Arc<RegistryConfig> {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn members(&self) -> &Arc<Members> {
        &self.members
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<NodePhase> {
        self.phase.subscribe()
    }

    /// Fires once `close` starts
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn set_phase(&self, next: NodePhase) {
        self.phase.send_if_modified(|current| {
            if *current == NodePhase::Closed || *current == next {
                return false;
            }
            tracing::info!("node phase {} -> {}", current, next);
            *current = next;
            true
        });
    }

    /// Bootstrap until the node is ready.
    ///
    /// Transient failures are retried every heartbeat interval; only a
    /// configuration-fatal error is returned. Returns `ShuttingDown` when
    /// `close` wins the race.
    pub async fn run(&self) -> Result<()> {
        let interval = self.config.heartbeat_interval();
        let mut attempt: u64 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(self.abort_bootstrap().await);
            }
            attempt += 1;

            match self.cluster_ready().await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!("cluster bootstrap failed permanently: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("cluster is not ready (attempt {}): {}", attempt, e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(self.abort_bootstrap().await),
                _ = tokio::time::sleep(interval) => {}
            }
        }

        if !self.start_background().await {
            return Err(self.abort_bootstrap().await);
        }
        tracing::info!("cluster is ready after {} attempt(s)", attempt);
        self.set_phase(NodePhase::Ready);
        Ok(())
    }

    /// Release what a bootstrap racing `close` acquired after close let go
    async fn abort_bootstrap(&self) -> Error {
        self.leases.close().await;
        self.clients.shutdown().await;
        if let Some(host) = &self.host {
            host.close().await;
        }
        tracing::info!("bootstrap aborted by shutdown");
        Error::ShuttingDown
    }

    async fn cluster_ready(&self) -> Result<()> {
        match &self.host {
            Some(host) => self.host_ready(host).await?,
            None => self.client_ready().await?,
        }
        self.leases.ensure_lease().await?;
        Ok(())
    }

    async fn host_ready(&self, host: &HostController) -> Result<()> {
        self.set_phase(NodePhase::HostStarting);
        let spec = self.launch_spec().await?;
        let instance = host.start(spec).await?;
        self.check_cluster_name(instance.is_new_cluster()).await
    }

    async fn client_ready(&self) -> Result<()> {
        self.set_phase(NodePhase::ClientConnecting);
        self.clients.get().await?;
        self.check_cluster_name(false).await
    }

    /// Launch configuration: the static initial cluster if configured,
    /// otherwise the membership registry, joining first when asked to
    async fn launch_spec(&self) -> Result<LaunchSpec> {
        if self.config.uses_initial_cluster() {
            return Ok(LaunchSpec::new(
                &self.config,
                self.config.initial_cluster_string(),
                self.config.cluster.state,
            ));
        }

        let has_data = std::fs::read_dir(&self.config.node.data_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        let joining = !self.config.cluster.join_urls.is_empty()
            && self.members.cluster_size().await == 1
            && !has_data;
        if joining {
            self.join_existing().await?;
        }

        let state = if joining || has_data || self.members.cluster_size().await > 1 {
            ClusterState::Existing
        } else {
            ClusterState::New
        };
        Ok(LaunchSpec::new(
            &self.config,
            self.members.initial_cluster_spec().await,
            state,
        ))
    }

    /// Register this node's peer URL with the cluster it is joining
    async fn join_existing(&self) -> Result<()> {
        let me = self.members.self_member().await;
        let endpoints = if self.config.cluster.endpoints.is_empty() {
            self.config.cluster.join_urls.clone()
        } else {
            self.config.cluster.endpoints.clone()
        };
        tracing::info!("joining cluster via {:?} as {}", endpoints, me.peer_url);

        let settings = self.clients.settings().clone();
        let client = with_timeout(
            self.request_timeout,
            "connect to join target",
            self.backend.connect(&endpoints, &settings),
        )
        .await?;

        let joined = self.add_self(&client, &me.peer_url).await;
        client.close().await;
        let list = joined?;
        self.members.refresh_from_authoritative(&list).await?;
        Ok(())
    }

    async fn add_self(
        &self,
        client: &Arc<dyn StoreClient>,
        peer_url: &str,
    ) -> Result<Vec<crate::store::StoreMember>> {
        let list = with_timeout(self.request_timeout, "member list", client.member_list()).await?;
        if list.iter().any(|m| m.peer_urls.iter().any(|u| u == peer_url)) {
            return Ok(list);
        }
        with_timeout(
            self.request_timeout,
            "member add",
            client.member_add(vec![peer_url.to_string()]),
        )
        .await
    }

    /// Validate, or for a brand new cluster register, the cluster name
    async fn check_cluster_name(&self, is_new_cluster: bool) -> Result<()> {
        let client = self.clients.get().await?;
        let local = &self.config.cluster.name;

        let stored = with_timeout(
            self.request_timeout,
            "get cluster name",
            client.get(CLUSTER_NAME_KEY),
        )
        .await?;
        match stored {
            Some(kv) if kv.value == *local => Ok(()),
            Some(kv) => Err(Error::ClusterNameMismatch {
                local: local.clone(),
                stored: kv.value,
            }),
            None if is_new_cluster => {
                with_timeout(
                    self.request_timeout,
                    "put cluster name",
                    client.put(CLUSTER_NAME_KEY, local, None),
                )
                .await
                .map_err(|e| {
                    Error::Store(format!("register cluster name {} failed: {}", local, e))
                })?;
                tracing::info!("registered cluster name {}", local);
                Ok(())
            }
            None => Err(Error::Unavailable("cluster name is not registered yet".into())),
        }
    }

    /// Spawn the background loops; false once `close` has begun
    async fn start_background(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        if self.shutdown.is_cancelled() {
            return false;
        }

        let leases = Arc::clone(&self.leases);
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { leases.run_keep_alive(token).await }));

        let heartbeat = Arc::clone(&self.heartbeat);
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move { heartbeat.run(token).await }));

        if let Some(defrag) = &self.defrag {
            let defrag = Arc::clone(defrag);
            let token = self.shutdown.clone();
            tasks.push(tokio::spawn(async move { defrag.run(token).await }));
        }

        if let Some(host) = &self.host {
            if let Ok(instance) = host.instance().await {
                let host = Arc::clone(host);
                let phase = Arc::clone(&self.phase);
                let token = self.shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    if host.supervise(instance, token).await.is_some() {
                        state::mark_health(&phase, false);
                    }
                }));
            }
        }
        true
    }

    /// Close the node: stop background tasks, then release the session,
    /// the lease, the connection and the store instance in that order.
    /// Calling it again is a no-op.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.watcher.close();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }

        self.sessions.close().await;
        self.leases.close().await;
        self.clients.shutdown().await;
        if let Some(host) = &self.host {
            host.close().await;
        }

        self.set_phase(NodePhase::Closed);
    }

    async fn client(&self) -> Result<Arc<dyn StoreClient>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.clients.get().await
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let client = self.client().await?;
        with_timeout(self.request_timeout, "put", client.put(key, value, None)).await
    }

    /// Put a key that disappears with this node's lease
    pub async fn put_under_own_lease(&self, key: &str, value: &str) -> Result<()> {
        let client = self.client().await?;
        let lease = self.leases.current().await?;
        with_timeout(self.request_timeout, "put", client.put(key, value, Some(lease))).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_raw(key).await?.map(|kv| kv.value))
    }

    /// Get a key with its store metadata
    pub async fn get_raw(&self, key: &str) -> Result<Option<KeyValue>> {
        let client = self.client().await?;
        with_timeout(self.request_timeout, "get", client.get(key)).await
    }

    pub async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let client = self.client().await?;
        with_timeout(self.request_timeout, "get prefix", client.get_prefix(prefix)).await
    }

    pub async fn delete(&self, key: &str) -> Result<i64> {
        let client = self.client().await?;
        with_timeout(self.request_timeout, "delete", client.delete(key)).await
    }

    /// Host role: whether this node's instance leads the store cluster.
    /// Client role: always true.
    pub async fn is_leader(&self) -> bool {
        let Some(host) = &self.host else {
            return true;
        };
        if self.shutdown.is_cancelled() {
            return false;
        }

        match host.status(self.request_timeout).await {
            Ok(status) => status.is_leader(),
            Err(e) => {
                tracing::debug!("leader check failed: {}", e);
                false
            }
        }
    }

    /// Watch a key or prefix until `ctx` is cancelled or the node closes
    pub async fn watch(
        &self,
        key: &str,
        prefix: bool,
        ctx: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.watcher.watch(key, prefix, ctx).await
    }

    /// Distributed mutex scoped to the current session
    pub async fn new_mutex(&self, name: &str) -> Result<DistributedMutex> {
        let session = self.sessions.get().await?;
        Ok(DistributedMutex::new(name, session, self.request_timeout))
    }

    /// Current status blob of this node
    pub async fn status(&self) -> MemberStatus {
        self.heartbeat.build_status().await
    }

    pub async fn host_state(&self) -> Option<HostState> {
        match &self.host {
            Some(host) => Some(host.state().await),
            None => None,
        }
    }
}
