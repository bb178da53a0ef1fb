//! etcd Backend
//!
//! Client calls go through `etcd-client`. The host role launches the
//! configured `etcd` binary as a supervised child process.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LockOptions, PutOptions, WatchOptions,
    WatchResponse,
};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};

use super::{
    ConnectSettings, EventKind, HostedStore, KeyValue, LaunchSpec, LeaseId, StoreBackend,
    StoreClient, StoreEvent, StoreMember, StoreStatus, WatchBatch, WatchStream,
};
use crate::config::ClusterState;
use crate::error::{Error, Result};

const READY_PROBE_INTERVAL: Duration = Duration::from_millis(500);
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend talking to real etcd
pub struct EtcdBackend {
    binary: PathBuf,
}

impl EtcdBackend {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }
}

fn store_status(resp: &etcd_client::StatusResponse) -> StoreStatus {
    StoreStatus {
        member_id: resp.header().map(|h| h.member_id()).unwrap_or(0),
        leader: resp.leader(),
        version: resp.version().to_string(),
        db_size: resp.db_size(),
    }
}

fn connect_options(settings: &ConnectSettings) -> ConnectOptions {
    ConnectOptions::new()
        .with_timeout(settings.request_timeout)
        .with_connect_timeout(settings.request_timeout)
        .with_keep_alive(settings.keep_alive_interval, settings.request_timeout)
}

#[async_trait]
impl StoreBackend for EtcdBackend {
    async fn connect(
        &self,
        endpoints: &[String],
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn StoreClient>> {
        let client = Client::connect(endpoints, Some(connect_options(settings))).await?;
        tracing::debug!("Connected to etcd at {:?}", endpoints);
        Ok(Arc::new(EtcdClient {
            client,
            settings: settings.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn HostedStore>> {
        std::fs::create_dir_all(&spec.data_dir)?;
        if let Some(parent) = spec.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let is_new = spec.force_new_cluster
            || (spec.state == ClusterState::New && !spec.data_dir.join("member").exists());

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_file)?;
        let log_err = log.try_clone()?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--name")
            .arg(&spec.name)
            .arg("--data-dir")
            .arg(&spec.data_dir)
            .arg("--listen-client-urls")
            .arg(spec.listen_client_urls.join(","))
            .arg("--advertise-client-urls")
            .arg(spec.advertise_client_urls.join(","))
            .arg("--listen-peer-urls")
            .arg(spec.listen_peer_urls.join(","))
            .arg("--initial-advertise-peer-urls")
            .arg(spec.advertise_peer_urls.join(","))
            .arg("--initial-cluster")
            .arg(&spec.initial_cluster)
            .arg("--initial-cluster-state")
            .arg(spec.state.to_string())
            .arg("--initial-cluster-token")
            .arg(&spec.cluster_token)
            .arg("--auto-compaction-mode")
            .arg("revision")
            .arg("--auto-compaction-retention")
            .arg(&spec.auto_compaction_retention)
            .arg("--quota-backend-bytes")
            .arg(spec.quota_backend_bytes.to_string())
            .arg("--max-txn-ops")
            .arg(spec.max_txn_ops.to_string())
            .arg("--max-request-bytes")
            .arg(spec.max_request_bytes.to_string())
            .arg("--snapshot-count")
            .arg(spec.snapshot_count.to_string())
            .arg("--log-level")
            .arg(if spec.debug { "debug" } else { "info" })
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if spec.force_new_cluster {
            command.arg("--force-new-cluster");
        }

        let mut child = command.spawn().map_err(|e| {
            Error::HostFailed(format!("failed to spawn {}: {}", self.binary.display(), e))
        })?;
        let pid = child.id();
        tracing::info!(
            "Launched etcd member {} (pid {:?}), state {}, new cluster: {}",
            spec.name,
            pid,
            spec.state,
            is_new
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let name = spec.name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let description = match status {
                Ok(status) => format!("etcd member {} exited: {}", name, status),
                Err(e) => format!("etcd member {} wait failed: {}", name, e),
            };
            tracing::info!("{}", description);
            let _ = exit_tx.send(Some(description));
        });

        let client_url = spec
            .advertise_client_urls
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("empty advertise client urls".into()))?;

        Ok(Arc::new(EtcdHost {
            pid,
            is_new,
            client_url,
            exit: exit_rx,
            kill: Mutex::new(Some(kill_tx)),
            stopping: AtomicBool::new(false),
        }))
    }
}

/// Connection to an etcd cluster
pub struct EtcdClient {
    client: Client,
    settings: ConnectSettings,
    closed: AtomicBool,
}

impl EtcdClient {
    /// etcd-client methods take `&mut self`; the handle is cheap to clone
    fn client(&self) -> Result<Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("client is closed".into()));
        }
        Ok(self.client.clone())
    }
}

fn key_value(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: String::from_utf8_lossy(kv.value()).into_owned(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: kv.lease(),
    }
}

fn store_member(member: &etcd_client::Member) -> StoreMember {
    StoreMember {
        id: member.id(),
        name: member.name().to_string(),
        peer_urls: member.peer_urls().to_vec(),
        client_urls: member.client_urls().to_vec(),
    }
}

fn watch_batch(resp: &WatchResponse) -> WatchBatch {
    let events = resp
        .events()
        .iter()
        .map(|event| {
            let kind = match event.event_type() {
                EventType::Put => EventKind::Put,
                EventType::Delete => EventKind::Delete,
            };
            let (key, value) = event
                .kv()
                .map(|kv| {
                    (
                        String::from_utf8_lossy(kv.key()).into_owned(),
                        String::from_utf8_lossy(kv.value()).into_owned(),
                    )
                })
                .unwrap_or_default();
            StoreEvent { kind, key, value }
        })
        .collect::<Vec<_>>();

    let progress_notify = events.is_empty()
        && !resp.created()
        && !resp.canceled()
        && resp.compact_revision() == 0;

    WatchBatch {
        events,
        created: resp.created(),
        canceled: resp.canceled(),
        progress_notify,
    }
}

#[async_trait]
impl StoreClient for EtcdClient {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client()?.put(key, value, options).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self.client()?.get(key, None).await?;
        Ok(resp.kvs().first().map(key_value))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let resp = self
            .client()?
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        Ok(resp.kvs().iter().map(key_value).collect())
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        Ok(self.client()?.delete(key, None).await?.deleted())
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseId> {
        Ok(self.client()?.lease_grant(ttl, None).await?.id())
    }

    async fn lease_time_to_live(&self, id: LeaseId) -> Result<i64> {
        Ok(self.client()?.lease_time_to_live(id, None).await?.ttl())
    }

    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<i64> {
        let (mut keeper, mut stream) = self.client()?.lease_keep_alive(id).await?;
        keeper.keep_alive().await?;
        match stream.message().await? {
            Some(resp) if resp.ttl() > 0 => Ok(resp.ttl()),
            _ => Err(Error::Store(format!("lease {:x} not found", id))),
        }
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        self.client()?.lease_revoke(id).await?;
        Ok(())
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream> {
        let options = prefix.then(|| WatchOptions::new().with_prefix());
        let (watcher, stream) = self.client()?.watch(key, options).await?;

        // the watcher travels with the stream; dropping both cancels the watch
        let batches = futures::stream::unfold(
            (watcher, stream),
            |(watcher, mut stream)| async move {
                match stream.message().await {
                    Ok(Some(resp)) => Some((Ok(watch_batch(&resp)), (watcher, stream))),
                    Ok(None) => None,
                    Err(e) => Some((Err(Error::from(e)), (watcher, stream))),
                }
            },
        );
        Ok(Box::pin(batches))
    }

    async fn member_list(&self) -> Result<Vec<StoreMember>> {
        let resp = self.client()?.member_list().await?;
        Ok(resp.members().iter().map(store_member).collect())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<StoreMember>> {
        let resp = self.client()?.member_add(peer_urls, None).await?;
        Ok(resp.member_list().iter().map(store_member).collect())
    }

    async fn defragment(&self, endpoint: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("client is closed".into()));
        }
        let mut dedicated =
            Client::connect([endpoint], Some(connect_options(&self.settings))).await?;
        dedicated.defragment().await?;
        Ok(())
    }

    async fn status(&self) -> Result<StoreStatus> {
        let resp = self.client()?.status().await?;
        Ok(store_status(&resp))
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<String> {
        let resp = self
            .client()?
            .lock(name, Some(LockOptions::new().with_lease(lease)))
            .await?;
        Ok(String::from_utf8_lossy(resp.key()).into_owned())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.client()?.unlock(key).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Supervised etcd child process
pub struct EtcdHost {
    pid: Option<u32>,
    is_new: bool,
    client_url: String,
    exit: watch::Receiver<Option<String>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    stopping: AtomicBool,
}

impl EtcdHost {
    fn exited(&self) -> Option<String> {
        self.exit.borrow().clone()
    }

    async fn wait_exit(&self) {
        let mut exit = self.exit.clone();
        let _ = exit.wait_for(|e| e.is_some()).await;
    }

    /// Status from a connection pinned to this instance's own client URL
    async fn probe(&self) -> Result<StoreStatus> {
        let options = ConnectOptions::new()
            .with_timeout(READY_PROBE_TIMEOUT)
            .with_connect_timeout(READY_PROBE_TIMEOUT);
        let mut client = Client::connect([self.client_url.as_str()], Some(options)).await?;
        let resp = client.status().await?;
        Ok(store_status(&resp))
    }
}

#[async_trait]
impl HostedStore for EtcdHost {
    async fn ready(&self) -> Result<()> {
        loop {
            if let Some(description) = self.exited() {
                return Err(Error::HostFailed(description));
            }
            match self.probe().await {
                Ok(_) => return Ok(()),
                Err(e) => tracing::debug!("etcd at {} not ready: {}", self.client_url, e),
            }
            tokio::time::sleep(READY_PROBE_INTERVAL).await;
        }
    }

    fn is_new_cluster(&self) -> bool {
        self.is_new
    }

    async fn failed(&self) -> Error {
        self.wait_exit().await;
        if self.stopping.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        Error::HostFailed(self.exited().unwrap_or_default())
    }

    async fn status(&self) -> Result<StoreStatus> {
        if let Some(description) = self.exited() {
            return Err(Error::HostFailed(description));
        }
        self.probe().await
    }

    async fn close(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        if self.exited().is_some() {
            return Ok(());
        }

        if let Some(pid) = self.pid {
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                .map_err(|e| Error::Internal(format!("failed to signal etcd: {}", e)))?;
        }
        if tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, self.wait_exit())
            .await
            .is_err()
        {
            tracing::warn!("etcd did not stop within {:?}", GRACEFUL_STOP_TIMEOUT);
            self.hard_stop().await;
        }
        Ok(())
    }

    async fn hard_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(kill) = self.kill.lock().await.take() {
            let _ = kill.send(());
        }
        self.wait_exit().await;
        tracing::info!("hard stopped etcd");
    }
}
