//! Cluster Membership Registry
//!
//! Local, persisted view of the store's peers. `cluster` holds the members
//! actually forming the store cluster, `known` is a superset that also
//! carries join targets which have not been confirmed yet.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::{ClusterRole, RegistryConfig};
use crate::error::{Error, Result};
use crate::store::StoreMember;

/// A peer of the store cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// 0 until the store assigns one
    #[serde(default)]
    pub id: u64,
    /// May be empty for a freshly added peer
    #[serde(default)]
    pub name: String,
    pub peer_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_url: Option<String>,
}

impl Member {
    pub fn new(name: impl Into<String>, peer_url: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            peer_url: peer_url.into(),
            client_url: None,
        }
    }

    fn from_store(member: &StoreMember) -> Self {
        Self {
            id: member.id,
            name: member.name.clone(),
            peer_url: member.peer_urls.first().cloned().unwrap_or_default(),
            client_url: member.client_urls.first().cloned(),
        }
    }
}

/// Members ordered by name, unique by peer URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberList(Vec<Member>);

impl MemberList {
    /// Merge by peer URL; known names, ids and client URLs are never dropped
    pub fn update(&mut self, incoming: impl IntoIterator<Item = Member>) {
        for member in incoming {
            if member.peer_url.is_empty() {
                continue;
            }

            match self.0.iter_mut().find(|m| m.peer_url == member.peer_url) {
                Some(existing) => {
                    if !member.name.is_empty() {
                        existing.name = member.name;
                    }
                    if member.id != 0 {
                        existing.id = member.id;
                    }
                    if member.client_url.is_some() {
                        existing.client_url = member.client_url;
                    }
                }
                None => self.0.push(member),
            }
        }

        self.0.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn by_name(&self, name: &str) -> Option<&Member> {
        if name.is_empty() {
            return None;
        }
        self.0.iter().find(|m| m.name == name)
    }

    pub fn peer_urls(&self) -> Vec<String> {
        self.0.iter().map(|m| m.peer_url.clone()).collect()
    }

    pub fn client_urls(&self) -> Vec<String> {
        self.0.iter().filter_map(|m| m.client_url.clone()).collect()
    }

    /// "name=peerUrl,..." over members that already have a name
    pub fn initial_cluster_spec(&self) -> String {
        self.0
            .iter()
            .filter(|m| !m.name.is_empty())
            .map(|m| format!("{}={}", m.name, m.peer_url))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Member] {
        &self.0
    }
}

impl FromIterator<Member> for MemberList {
    fn from_iter<I: IntoIterator<Item = Member>>(iter: I) -> Self {
        let mut list = MemberList::default();
        list.update(iter);
        list
    }
}

/// On-disk layout of the membership file
#[derive(Debug, Default, Serialize, Deserialize)]
struct MembersFile {
    #[serde(default)]
    cluster_members: MemberList,
    #[serde(default)]
    known_members: MemberList,
}

struct MembersState {
    cluster: MemberList,
    known: MemberList,
    last_data: Vec<u8>,
}

/// Membership registry shared by the coordination tasks
pub struct Members {
    name: String,
    role: ClusterRole,
    /// Peer and client URL this node advertises, host role only
    self_urls: Option<(String, Option<String>)>,
    data_file: PathBuf,
    backup_file: PathBuf,
    state: RwLock<MembersState>,
}

impl Members {
    /// Seed from the configuration, then merge whatever was persisted
    pub fn load(config: &RegistryConfig) -> Result<Self> {
        let self_urls = match config.cluster.role {
            ClusterRole::Host => config.first_advertise_peer_url().map(|peer| {
                (
                    peer.to_string(),
                    config.cluster.advertise_client_urls.first().cloned(),
                )
            }),
            ClusterRole::Client => None,
        };

        let mut cluster = MemberList::default();
        let mut known = MemberList::default();
        if let Some((peer_url, client_url)) = &self_urls {
            let mut me = Member::new(config.name(), peer_url.clone());
            me.client_url = client_url.clone();
            cluster.update([me.clone()]);
            known.update([me]);
        }
        known.update(
            config
                .cluster
                .join_urls
                .iter()
                .map(|url| Member::new("", url.clone())),
        );

        if let Some(file) = read_members_file(&config.members_file())? {
            cluster.update(file.cluster_members.0);
            known.update(file.known_members.0);
        }

        let mut state = MembersState {
            cluster,
            known,
            last_data: Vec::new(),
        };
        state.last_data = serialize(&state)?;

        Ok(Self {
            name: config.name().to_string(),
            role: config.cluster.role,
            self_urls,
            data_file: config.members_file(),
            backup_file: config.members_backup_file(),
            state: RwLock::new(state),
        })
    }

    /// This node's record
    pub async fn self_member(&self) -> Member {
        let state = self.state.read().await;
        self.resolve_self(&state)
    }

    fn resolve_self(&self, state: &MembersState) -> Member {
        if let Some(member) = state.cluster.by_name(&self.name) {
            return member.clone();
        }
        if let Some(member) = state.known.by_name(&self.name) {
            return member.clone();
        }

        let (peer_url, client_url) = self.self_urls.clone().unwrap_or_default();
        if self.role == ClusterRole::Host && peer_url.is_empty() {
            tracing::error!("host {} has no advertised peer url", self.name);
        }
        Member {
            id: 0,
            name: self.name.clone(),
            peer_url,
            client_url,
        }
    }

    pub async fn cluster_size(&self) -> usize {
        self.state.read().await.cluster.len()
    }

    pub async fn cluster_members(&self) -> MemberList {
        self.state.read().await.cluster.clone()
    }

    pub async fn known_members(&self) -> MemberList {
        self.state.read().await.known.clone()
    }

    /// Initial cluster string used to launch a store instance
    pub async fn initial_cluster_spec(&self) -> String {
        self.state.read().await.cluster.initial_cluster_spec()
    }

    pub async fn known_peer_urls(&self) -> Vec<String> {
        self.state.read().await.known.peer_urls()
    }

    /// Client URLs of every known member that has reported one
    pub async fn known_client_urls(&self) -> Vec<String> {
        self.state.read().await.known.client_urls()
    }

    /// Replace the cluster members with the store's authoritative list.
    ///
    /// Self is re-inserted without an id so the authoritative id wins.
    /// Returns whether the persisted form changed.
    pub async fn refresh_from_authoritative(&self, members: &[StoreMember]) -> Result<bool> {
        let mut state = self.state.write().await;

        let old_self = self.resolve_self(&state);
        let mut authoritative: MemberList = members.iter().map(Member::from_store).collect();
        if self.self_urls.is_some() {
            let me = Member {
                id: 0,
                ..old_self.clone()
            };
            authoritative.update([me]);
        }
        state.cluster = authoritative;

        let new_self = self.resolve_self(&state);
        if new_self.id != old_self.id {
            tracing::info!("self ID changed from {:x} to {:x}", old_self.id, new_self.id);
        }

        let cluster = state.cluster.clone();
        state.known.update(cluster.0);

        self.persist(&mut state)
    }

    /// Merge members into the known set, e.g. after a member add
    pub async fn add_known(&self, members: &[StoreMember]) -> Result<bool> {
        let mut state = self.state.write().await;
        state.known.update(members.iter().map(Member::from_store));
        self.persist(&mut state)
    }

    /// Write the membership file, rotating the previous one to the backup
    fn persist(&self, state: &mut MembersState) -> Result<bool> {
        let data = serialize(state)?;
        if data == state.last_data {
            return Ok(false);
        }

        if let Some(parent) = self.data_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.data_file.exists() {
            std::fs::rename(&self.data_file, &self.backup_file)?;
        }
        std::fs::write(&self.data_file, &data)?;
        state.last_data = data;

        tracing::info!("store cluster members: {:?}", state.cluster.peer_urls());
        tracing::info!("store known members  : {:?}", state.known.peer_urls());
        Ok(true)
    }
}

fn serialize(state: &MembersState) -> Result<Vec<u8>> {
    let file = MembersFile {
        cluster_members: state.cluster.clone(),
        known_members: state.known.clone(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

fn read_members_file(path: &Path) -> Result<Option<MembersFile>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| Error::MembersCorrupted {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn host_config(dir: &TempDir, name: &str) -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config.node.name = name.to_string();
        config.node.member_dir = dir.path().join("member");
        config.cluster.initial_advertise_peer_urls = vec!["http://10.0.0.1:2380".to_string()];
        config.cluster.advertise_client_urls = vec!["http://10.0.0.1:2379".to_string()];
        config
    }

    fn store_member(id: u64, name: &str, peer: &str) -> StoreMember {
        StoreMember {
            id,
            name: name.to_string(),
            peer_urls: vec![peer.to_string()],
            client_urls: Vec::new(),
        }
    }

    #[test]
    fn test_update_dedups_by_peer_url() {
        let mut list = MemberList::default();
        list.update([Member::new("b", "http://b:2380"), Member::new("a", "http://a:2380")]);
        list.update([Member::new("", "http://b:2380")]);
        list.update([Member {
            id: 9,
            ..Member::new("", "http://a:2380")
        }]);
        list.update([Member::new("a", "http://a:2380"), Member::new("", "")]);

        assert_eq!(list.len(), 2);
        assert_eq!(list.as_slice()[0].name, "a");
        assert_eq!(list.as_slice()[0].id, 9);
        assert_eq!(list.as_slice()[1].name, "b");
        assert_eq!(list.initial_cluster_spec(), "a=http://a:2380,b=http://b:2380");
    }

    #[test]
    fn test_initial_cluster_spec_skips_unnamed() {
        let list: MemberList = [Member::new("", "http://x:2380"), Member::new("n1", "http://y:2380")]
            .into_iter()
            .collect();
        assert_eq!(list.initial_cluster_spec(), "n1=http://y:2380");
    }

    #[tokio::test]
    async fn test_host_seeds_itself() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = host_config(&dir, "n1");
        config.cluster.join_urls = vec!["http://10.0.0.9:2380".to_string()];
        let members = Members::load(&config).unwrap();

        assert_eq!(members.cluster_size().await, 1);
        assert_eq!(members.known_peer_urls().await.len(), 2);
        let me = members.self_member().await;
        assert_eq!(me.peer_url, "http://10.0.0.1:2380");
        assert_eq!(me.client_url.as_deref(), Some("http://10.0.0.1:2379"));
    }

    #[tokio::test]
    async fn test_refresh_assigns_self_id() {
        let dir = tempfile::tempdir().unwrap();
        let members = Members::load(&host_config(&dir, "n1")).unwrap();

        let changed = members
            .refresh_from_authoritative(&[
                store_member(0xa1, "n1", "http://10.0.0.1:2380"),
                store_member(0xb2, "", "http://10.0.0.2:2380"),
            ])
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(members.self_member().await.id, 0xa1);
        assert_eq!(members.cluster_size().await, 2);

        let changed = members
            .refresh_from_authoritative(&[
                store_member(0xa1, "n1", "http://10.0.0.1:2380"),
                store_member(0xb2, "n2", "http://10.0.0.2:2380"),
            ])
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(
            members.initial_cluster_spec().await,
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380"
        );
    }

    #[tokio::test]
    async fn test_persist_rotates_and_skips_identical() {
        let dir = tempfile::tempdir().unwrap();
        let config = host_config(&dir, "n1");
        let members = Members::load(&config).unwrap();
        let list = [store_member(0xa1, "n1", "http://10.0.0.1:2380")];

        assert!(members.refresh_from_authoritative(&list).await.unwrap());
        assert!(config.members_file().exists());
        assert!(!config.members_backup_file().exists());

        assert!(!members.refresh_from_authoritative(&list).await.unwrap());
        assert!(!config.members_backup_file().exists());

        let grown = [
            store_member(0xa1, "n1", "http://10.0.0.1:2380"),
            store_member(0xb2, "n2", "http://10.0.0.2:2380"),
        ];
        assert!(members.refresh_from_authoritative(&grown).await.unwrap());
        assert!(config.members_backup_file().exists());

        let reloaded = Members::load(&config).unwrap();
        assert_eq!(reloaded.cluster_size().await, 2);
        assert_eq!(reloaded.self_member().await.id, 0xa1);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_corrupt_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = host_config(&dir, "n1");
        config.cluster.role = ClusterRole::Client;
        let members = Members::load(&config).unwrap();
        assert_eq!(members.cluster_size().await, 0);

        std::fs::create_dir_all(&config.node.member_dir).unwrap();
        std::fs::write(config.members_file(), b"{ not json").unwrap();
        let err = Members::load(&config).err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::MembersCorrupted { .. }));
    }
}
