//! In-process store
//!
//! Every node that launches or connects through the same [`MemoryBackend`]
//! value shares one consensus group. Nothing is replicated or written to
//! disk; a relaunch with the same data directory inside one process resumes
//! the existing group.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    ConnectSettings, EventKind, HostedStore, KeyValue, LaunchSpec, LeaseId, StoreBackend,
    StoreClient, StoreEvent, StoreMember, StoreStatus, WatchBatch, WatchStream,
};
use crate::config::ClusterState;
use crate::error::{Error, Result};

/// Interval of the lease expiry sweep
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Shared registry of in-process store groups
#[derive(Clone, Default)]
pub struct MemoryBackend {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    by_url: HashMap<String, Arc<MemoryStore>>,
    by_data_dir: HashMap<PathBuf, Arc<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the running instance named `name` report a fatal error
    pub async fn inject_failure(&self, name: &str, reason: &str) -> bool {
        let stores: Vec<Arc<MemoryStore>> = {
            let registry = self.registry.lock().await;
            registry.by_data_dir.values().cloned().collect()
        };

        for store in stores {
            let state = store.state.lock().await;
            let fault = state
                .members
                .iter()
                .find(|m| m.running && m.info.name == name)
                .and_then(|m| m.fault.as_ref());
            if let Some(fault) = fault {
                let _ = fault.send(Some(reason.to_string()));
                return true;
            }
        }
        false
    }

    async fn unregister(&self, store: &Arc<MemoryStore>, urls: &[String]) {
        let mut registry = self.registry.lock().await;
        for url in urls {
            let key = url_key(url);
            if registry
                .by_url
                .get(&key)
                .is_some_and(|registered| Arc::ptr_eq(registered, store))
            {
                registry.by_url.remove(&key);
            }
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn connect(
        &self,
        endpoints: &[String],
        settings: &ConnectSettings,
    ) -> Result<Arc<dyn StoreClient>> {
        let registry = self.registry.lock().await;

        for endpoint in endpoints {
            let Some(store) = registry.by_url.get(&url_key(endpoint)) else {
                continue;
            };
            let state = store.state.lock().await;
            let member_id = state
                .member_by_url(endpoint)
                .filter(|m| m.running)
                .map(|m| m.info.id);
            if let Some(member_id) = member_id {
                tracing::debug!("Connected to in-process store via {}", endpoint);
                return Ok(Arc::new(MemoryClient {
                    store: Arc::clone(store),
                    member_id,
                    max_request_bytes: settings.max_call_send_msg_size,
                    closed: AtomicBool::new(false),
                }));
            }
        }

        Err(Error::Unavailable(format!(
            "no store instance reachable at {:?}",
            endpoints
        )))
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn HostedStore>> {
        let initial = spec.initial_members()?;
        let mut registry = self.registry.lock().await;

        let existing = if spec.force_new_cluster {
            None
        } else {
            registry.by_data_dir.get(&spec.data_dir).cloned().or_else(|| {
                initial
                    .iter()
                    .map(|(_, url)| url)
                    .chain(spec.advertise_peer_urls.iter())
                    .find_map(|url| registry.by_url.get(&url_key(url)).cloned())
            })
        };

        let (fault_tx, fault_rx) = watch::channel(None);
        let (store, member_id, is_new) = match existing {
            Some(store) => {
                let member_id = store.start_member(&spec, fault_tx).await?;
                (store, member_id, false)
            }
            None if spec.state == ClusterState::Existing && !spec.force_new_cluster => {
                return Err(Error::Unavailable(format!(
                    "no existing cluster reachable for initial cluster '{}'",
                    spec.initial_cluster
                )));
            }
            None => {
                let (store, member_id) = MemoryStore::create(&spec, &initial, fault_tx);
                (store, member_id, true)
            }
        };

        let urls: Vec<String> = spec
            .advertise_peer_urls
            .iter()
            .chain(spec.advertise_client_urls.iter())
            .chain(spec.listen_client_urls.iter())
            .cloned()
            .collect();
        for url in &urls {
            registry.by_url.insert(url_key(url), Arc::clone(&store));
        }
        registry
            .by_data_dir
            .insert(spec.data_dir.clone(), Arc::clone(&store));

        tracing::info!(
            "In-process store member {} ({:x}) started, new cluster: {}",
            spec.name,
            member_id,
            is_new
        );

        Ok(Arc::new(MemoryHost {
            backend: self.clone(),
            store,
            member_id,
            is_new,
            urls,
            fault: fault_rx,
            stopped: AtomicBool::new(false),
        }))
    }
}

/// One consensus group
struct MemoryStore {
    state: Mutex<StoreState>,
    changed: Notify,
}

struct StoreState {
    revision: i64,
    entries: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: LeaseId,
    members: Vec<MemberEntry>,
    next_member_id: u64,
    watchers: Vec<WatcherEntry>,
}

struct MemberEntry {
    info: StoreMember,
    running: bool,
    fault: Option<watch::Sender<Option<String>>>,
}

struct LeaseEntry {
    ttl: i64,
    /// None when the TTL is too long to represent
    expires_at: Option<Instant>,
    keys: BTreeSet<String>,
}

struct WatcherEntry {
    key: String,
    prefix: bool,
    tx: mpsc::UnboundedSender<Result<WatchBatch>>,
}

impl MemoryStore {
    fn create(
        spec: &LaunchSpec,
        initial: &[(String, String)],
        fault: watch::Sender<Option<String>>,
    ) -> (Arc<Self>, u64) {
        let mut state = StoreState {
            revision: 1,
            entries: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 0x694d_7c3a_0000_0000 + rand::random::<u16>() as i64,
            members: Vec::new(),
            next_member_id: 0x8e9e_05c5_0000_0000 + rand::random::<u16>() as u64,
            watchers: Vec::new(),
        };

        if !spec.force_new_cluster {
            for (name, peer_url) in initial {
                if spec.advertise_peer_urls.iter().any(|u| same_url(u, peer_url)) {
                    continue;
                }
                state.add_member(name.clone(), vec![peer_url.clone()]);
            }
        }
        let member_id = state.add_member(spec.name.clone(), spec.advertise_peer_urls.clone());
        state.start(member_id, spec, fault);
        // self first so it leads the new group
        state.members.rotate_right(1);

        let store = Arc::new(Self {
            state: Mutex::new(state),
            changed: Notify::new(),
        });
        spawn_reaper(Arc::downgrade(&store));
        (store, member_id)
    }

    async fn start_member(
        &self,
        spec: &LaunchSpec,
        fault: watch::Sender<Option<String>>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;

        let found = spec
            .advertise_peer_urls
            .iter()
            .find_map(|url| state.member_by_url(url))
            .map(|m| (m.info.id, m.running));
        let member_id = match found {
            Some((_, true)) => {
                return Err(Error::Store(format!("member {} already started", spec.name)));
            }
            Some((id, false)) => id,
            None => state.add_member(spec.name.clone(), spec.advertise_peer_urls.clone()),
        };

        state.start(member_id, spec, fault);
        Ok(member_id)
    }

    async fn stop_member(&self, member_id: u64) {
        let mut state = self.state.lock().await;
        if let Some(member) = state.members.iter_mut().find(|m| m.info.id == member_id) {
            member.running = false;
            member.fault = None;
        }
        if !state.members.iter().any(|m| m.running) {
            for watcher in state.watchers.drain(..) {
                let _ = watcher.tx.send(Ok(WatchBatch {
                    canceled: true,
                    ..Default::default()
                }));
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }
}

impl StoreState {
    fn add_member(&mut self, name: String, peer_urls: Vec<String>) -> u64 {
        let id = self.next_member_id;
        self.next_member_id += 1;
        self.members.push(MemberEntry {
            info: StoreMember {
                id,
                name,
                peer_urls,
                client_urls: Vec::new(),
            },
            running: false,
            fault: None,
        });
        id
    }

    fn start(&mut self, member_id: u64, spec: &LaunchSpec, fault: watch::Sender<Option<String>>) {
        if let Some(member) = self.members.iter_mut().find(|m| m.info.id == member_id) {
            member.info.name = spec.name.clone();
            member.info.client_urls = spec.advertise_client_urls.clone();
            member.running = true;
            member.fault = Some(fault);
        }
    }

    fn member_by_url(&self, url: &str) -> Option<&MemberEntry> {
        self.members.iter().find(|m| {
            m.info
                .peer_urls
                .iter()
                .chain(m.info.client_urls.iter())
                .any(|u| same_url(u, url))
        })
    }

    fn serving(&self, member_id: u64) -> bool {
        self.members
            .iter()
            .any(|m| m.running && m.info.id == member_id)
    }

    fn leader(&self) -> u64 {
        self.members
            .iter()
            .find(|m| m.running)
            .map(|m| m.info.id)
            .unwrap_or(0)
    }

    fn member_list(&self) -> Vec<StoreMember> {
        self.members.iter().map(|m| m.info.clone()).collect()
    }

    fn put(&mut self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(Error::Store(format!("lease {:x} not found", id)));
            }
        }

        self.revision += 1;
        let revision = self.revision;
        let previous = self.entries.get(key).cloned();
        if let Some(old_lease) = previous.as_ref().map(|kv| kv.lease).filter(|l| *l != 0) {
            if let Some(entry) = self.leases.get_mut(&old_lease) {
                entry.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(entry) = self.leases.get_mut(&id) {
                entry.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            create_revision: previous.as_ref().map_or(revision, |kv| kv.create_revision),
            mod_revision: revision,
            version: previous.as_ref().map_or(1, |kv| kv.version + 1),
            lease: lease.unwrap_or(0),
        };
        self.entries.insert(key.to_string(), kv);

        self.publish(vec![StoreEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
        }]);
        Ok(())
    }

    fn delete(&mut self, keys: &[String]) -> i64 {
        let mut events = Vec::new();
        for key in keys {
            if let Some(kv) = self.entries.remove(key) {
                if let Some(entry) = self.leases.get_mut(&kv.lease) {
                    entry.keys.remove(key);
                }
                events.push(StoreEvent {
                    kind: EventKind::Delete,
                    key: key.clone(),
                    value: String::new(),
                });
            }
        }

        let deleted = events.len() as i64;
        if deleted > 0 {
            self.revision += 1;
            self.publish(events);
        }
        deleted
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        match self.leases.remove(&id) {
            Some(entry) => {
                let keys: Vec<String> = entry.keys.into_iter().collect();
                self.delete(&keys);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            tracing::debug!("In-process lease {:x} expired", id);
            self.revoke(*id);
        }
        !expired.is_empty()
    }

    fn publish(&mut self, events: Vec<StoreEvent>) {
        self.watchers.retain(|watcher| {
            let matching: Vec<StoreEvent> = events
                .iter()
                .filter(|event| {
                    if watcher.prefix {
                        event.key.starts_with(&watcher.key)
                    } else {
                        event.key == watcher.key
                    }
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(WatchBatch::events(matching))).is_ok()
        });
    }

    fn db_size(&self) -> i64 {
        self.entries
            .values()
            .map(|kv| (kv.key.len() + kv.value.len()) as i64)
            .sum()
    }
}

fn spawn_reaper(store: Weak<MemoryStore>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            let Some(store) = store.upgrade() else {
                return;
            };
            let purged = store.state.lock().await.purge_expired(Instant::now());
            if purged {
                store.changed.notify_waiters();
            }
        }
    });
}

fn url_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn same_url(a: &str, b: &str) -> bool {
    url_key(a) == url_key(b)
}

/// Client bound to one member of an in-process group
pub struct MemoryClient {
    store: Arc<MemoryStore>,
    member_id: u64,
    max_request_bytes: usize,
    closed: AtomicBool,
}

impl MemoryClient {
    async fn open(&self) -> Result<tokio::sync::MutexGuard<'_, StoreState>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("client is closed".into()));
        }
        let mut state = self.store.state.lock().await;
        if !state.serving(self.member_id) {
            return Err(Error::Unavailable(format!(
                "store member {:x} is not serving",
                self.member_id
            )));
        }
        if state.purge_expired(Instant::now()) {
            self.store.changed.notify_waiters();
        }
        Ok(state)
    }
}

#[async_trait]
impl StoreClient for MemoryClient {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        if key.len() + value.len() > self.max_request_bytes {
            return Err(Error::Store(format!(
                "request for {} exceeds {} bytes",
                key, self.max_request_bytes
            )));
        }
        self.open().await?.put(key, value, lease)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        Ok(self.open().await?.entries.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.open().await?;
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<i64> {
        let deleted = self.open().await?.delete(&[key.to_string()]);
        self.store.changed.notify_waiters();
        Ok(deleted)
    }

    async fn lease_grant(&self, ttl: i64) -> Result<LeaseId> {
        if ttl <= 0 {
            return Err(Error::Store(format!("invalid lease TTL {}", ttl)));
        }
        let mut state = self.open().await?;
        let id = state.next_lease;
        state.next_lease += 1;
        let expires_at = Instant::now().checked_add(Duration::from_secs(ttl as u64));
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                expires_at,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_time_to_live(&self, id: LeaseId) -> Result<i64> {
        let state = self.open().await?;
        Ok(match state.leases.get(&id) {
            Some(lease) => match lease.expires_at {
                Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
                None => lease.ttl,
            },
            None => -1,
        })
    }

    async fn lease_keep_alive_once(&self, id: LeaseId) -> Result<i64> {
        let mut state = self.open().await?;
        let lease = state
            .leases
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("lease {:x} not found", id)))?;
        lease.expires_at = Instant::now().checked_add(Duration::from_secs(lease.ttl as u64));
        Ok(lease.ttl)
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        let revoked = self.open().await?.revoke(id);
        self.store.changed.notify_waiters();
        if revoked {
            Ok(())
        } else {
            Err(Error::Store(format!("lease {:x} not found", id)))
        }
    }

    async fn watch(&self, key: &str, prefix: bool) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(WatchBatch {
            created: true,
            ..Default::default()
        }));

        let mut state = self.open().await?;
        state.watchers.push(WatcherEntry {
            key: key.to_string(),
            prefix,
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn member_list(&self) -> Result<Vec<StoreMember>> {
        Ok(self.open().await?.member_list())
    }

    async fn member_add(&self, peer_urls: Vec<String>) -> Result<Vec<StoreMember>> {
        let mut state = self.open().await?;
        if let Some(url) = peer_urls.iter().find(|u| state.member_by_url(u).is_some()) {
            return Err(Error::Store(format!("peer URL {} already exists", url)));
        }
        state.add_member(String::new(), peer_urls);
        Ok(state.member_list())
    }

    async fn defragment(&self, endpoint: &str) -> Result<()> {
        let state = self.open().await?;
        match state.member_by_url(endpoint) {
            Some(member) if member.running => Ok(()),
            _ => Err(Error::Unavailable(format!(
                "no store instance serving {}",
                endpoint
            ))),
        }
    }

    async fn status(&self) -> Result<StoreStatus> {
        let state = self.open().await?;
        Ok(StoreStatus {
            member_id: self.member_id,
            leader: state.leader(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_size: state.db_size(),
        })
    }

    async fn lock(&self, name: &str, lease: LeaseId) -> Result<String> {
        let prefix = format!("{}/", name);
        let own_key = format!("{}{:x}", prefix, lease);

        loop {
            let mut state = self.open().await?;
            if !state.leases.contains_key(&lease) {
                return Err(Error::Store(format!("lease {:x} not found", lease)));
            }

            let holder = state
                .entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .min_by_key(|(_, kv)| kv.create_revision)
                .map(|(key, _)| key.clone());
            match holder {
                None => {
                    state.put(&own_key, "", Some(lease))?;
                    return Ok(own_key);
                }
                Some(key) if key == own_key => return Ok(own_key),
                Some(_) => {
                    // registered before the guard drops so no release is missed
                    let released = self.store.changed.notified();
                    drop(state);
                    released.await;
                }
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.open().await?.delete(&[key.to_string()]);
        self.store.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A member of an in-process group started by this node
pub struct MemoryHost {
    backend: MemoryBackend,
    store: Arc<MemoryStore>,
    member_id: u64,
    is_new: bool,
    urls: Vec<String>,
    fault: watch::Receiver<Option<String>>,
    stopped: AtomicBool,
}

impl MemoryHost {
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.stop_member(self.member_id).await;
        self.backend.unregister(&self.store, &self.urls).await;
    }
}

#[async_trait]
impl HostedStore for MemoryHost {
    async fn ready(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::HostFailed("instance stopped".into()));
        }
        Ok(())
    }

    fn is_new_cluster(&self) -> bool {
        self.is_new
    }

    async fn failed(&self) -> Error {
        let mut fault = self.fault.clone();
        let reason = match fault.wait_for(|f| f.is_some()).await.map(|r| r.clone()) {
            Ok(reason) => reason.unwrap_or_default(),
            // stopped without a fault
            Err(_) => std::future::pending().await,
        };
        Error::HostFailed(reason)
    }

    async fn status(&self) -> Result<StoreStatus> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::HostNotReady);
        }
        let state = self.store.state.lock().await;
        if !state.serving(self.member_id) {
            return Err(Error::Unavailable(format!(
                "store member {:x} is not serving",
                self.member_id
            )));
        }
        Ok(StoreStatus {
            member_id: self.member_id,
            leader: state.leader(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            db_size: state.db_size(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.stop().await;
        Ok(())
    }

    async fn hard_stop(&self) {
        self.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use futures::StreamExt;

    fn launch_spec(name: &str, port: u16, data_dir: &str) -> LaunchSpec {
        let mut config = RegistryConfig::default();
        config.node.name = name.to_string();
        config.node.data_dir = PathBuf::from(data_dir);
        config.cluster.listen_client_urls = vec![format!("http://127.0.0.1:{}", port)];
        config.cluster.advertise_client_urls = vec![format!("http://127.0.0.1:{}", port)];
        config.cluster.listen_peer_urls = vec![format!("http://127.0.0.1:{}", port + 1)];
        config.cluster.initial_advertise_peer_urls =
            vec![format!("http://127.0.0.1:{}", port + 1)];
        let initial = format!("{}=http://127.0.0.1:{}", name, port + 1);
        LaunchSpec::new(&config, initial, ClusterState::New)
    }

    fn settings() -> ConnectSettings {
        ConnectSettings {
            request_timeout: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(30),
            max_call_send_msg_size: 1024,
        }
    }

    async fn single_node() -> (MemoryBackend, Arc<dyn HostedStore>, Arc<dyn StoreClient>) {
        let backend = MemoryBackend::new();
        let host = backend.launch(launch_spec("n1", 12379, "/tmp/n1")).await.unwrap();
        let client = backend
            .connect(&["http://127.0.0.1:12379".to_string()], &settings())
            .await
            .unwrap();
        (backend, host, client)
    }

    #[tokio::test]
    async fn test_put_get_revisions() {
        let (_backend, host, client) = single_node().await;
        assert!(host.is_new_cluster());

        client.put("/a", "1", None).await.unwrap();
        client.put("/a", "2", None).await.unwrap();
        client.put("/b", "3", None).await.unwrap();

        let a = client.get("/a").await.unwrap().unwrap();
        assert_eq!(a.value, "2");
        assert_eq!(a.version, 2);
        assert!(a.mod_revision > a.create_revision);

        assert_eq!(client.get_prefix("/").await.unwrap().len(), 2);
        assert_eq!(client.delete("/a").await.unwrap(), 1);
        assert!(client.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let (_backend, _host, client) = single_node().await;
        let value = "x".repeat(2048);
        assert!(client.put("/big", &value, None).await.is_err());
    }

    #[tokio::test]
    async fn test_revoke_deletes_keys_and_notifies() {
        let (_backend, _host, client) = single_node().await;
        let mut stream = client.watch("/status/", true).await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().created);

        let lease = client.lease_grant(60).await.unwrap();
        client.put("/status/n1", "up", Some(lease)).await.unwrap();
        client.lease_revoke(lease).await.unwrap();

        let put = stream.next().await.unwrap().unwrap();
        assert_eq!(put.events[0].kind, EventKind::Put);
        let delete = stream.next().await.unwrap().unwrap();
        assert_eq!(delete.events[0].kind, EventKind::Delete);
        assert!(client.get("/status/n1").await.unwrap().is_none());
        assert_eq!(client.lease_time_to_live(lease).await.unwrap(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry() {
        let (_backend, _host, client) = single_node().await;
        let lease = client.lease_grant(2).await.unwrap();
        client.put("/k", "v", Some(lease)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.lease_keep_alive_once(lease).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(client.get("/k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(client.get("/k").await.unwrap().is_none());
        assert!(client.lease_keep_alive_once(lease).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let (_backend, _host, client) = single_node().await;
        let first = client.lease_grant(60).await.unwrap();
        let second = client.lease_grant(60).await.unwrap();

        let key = client.lock("/locks/a", first).await.unwrap();
        let contender = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.lock("/locks/a", second).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        client.unlock(&key).await.unwrap();
        let second_key = contender.await.unwrap().unwrap();
        assert_ne!(second_key, key);
    }

    #[tokio::test]
    async fn test_join_and_stop() {
        let (backend, host, client) = single_node().await;
        let members = client
            .member_add(vec!["http://127.0.0.1:22380".to_string()])
            .await
            .unwrap();
        assert_eq!(members.len(), 2);
        assert!(members[1].name.is_empty());

        let mut spec = launch_spec("n2", 22379, "/tmp/n2");
        spec.initial_cluster = "n1=http://127.0.0.1:12380,n2=http://127.0.0.1:22380".into();
        spec.state = ClusterState::Existing;
        let joined = backend.launch(spec).await.unwrap();
        assert!(!joined.is_new_cluster());

        let members = client.member_list().await.unwrap();
        assert_eq!(members[1].name, "n2");
        client.defragment("http://127.0.0.1:22379").await.unwrap();

        host.hard_stop().await;
        assert!(client.status().await.is_err());
        let other = backend
            .connect(&["http://127.0.0.1:22379".to_string()], &settings())
            .await
            .unwrap();
        let status = other.status().await.unwrap();
        assert!(status.is_leader());
    }

    #[tokio::test]
    async fn test_existing_state_without_cluster_fails() {
        let backend = MemoryBackend::new();
        let mut spec = launch_spec("n1", 32379, "/tmp/n3");
        spec.state = ClusterState::Existing;
        assert!(backend.launch(spec).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (backend, host, _client) = single_node().await;
        assert!(backend.inject_failure("n1", "disk full").await);
        let err = host.failed().await;
        assert!(matches!(err, Error::HostFailed(reason) if reason == "disk full"));
    }
}
