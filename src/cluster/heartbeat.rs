//! Heartbeat and Membership Sync
//!
//! Every tick publishes this node's status blob under its lease and
//! refreshes the membership registry from the store's member list. The two
//! steps fail independently.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::client::{with_timeout, ClientProvider};
use super::defrag::DefragScheduler;
use super::host::HostController;
use super::lease::LeaseManager;
use super::members::Members;
use super::state::{mark_health, NodePhase};
use crate::config::RegistryConfig;
use crate::error::Result;

pub const STATUS_MEMBER_PREFIX: &str = "/status/members/";

pub fn status_key(name: &str) -> String {
    format!("{}{}", STATUS_MEMBER_PREFIX, name)
}

/// Status blob stored under `/status/members/<name>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub options: RegistryConfig,
    /// RFC3339
    pub last_heartbeat_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_defrag_time: Option<String>,
    /// Host role only
    #[serde(rename = "etcd", default, skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreInstanceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInstanceStatus {
    /// Member id in hex
    pub id: String,
    /// "leader" or "follower"
    pub state: String,
    pub start_time: String,
}

pub struct Heartbeat {
    config: Arc<RegistryConfig>,
    clients: Arc<ClientProvider>,
    leases: Arc<LeaseManager>,
    members: Arc<Members>,
    host: Option<Arc<HostController>>,
    defrag: Option<Arc<DefragScheduler>>,
    phase: Arc<watch::Sender<NodePhase>>,
}

impl Heartbeat {
    pub fn new(
        config: Arc<RegistryConfig>,
        clients: Arc<ClientProvider>,
        leases: Arc<LeaseManager>,
        members: Arc<Members>,
        host: Option<Arc<HostController>>,
        defrag: Option<Arc<DefragScheduler>>,
        phase: Arc<watch::Sender<NodePhase>>,
    ) -> Self {
        Self {
            config,
            clients,
            leases,
            members,
            host,
            defrag,
            phase,
        }
    }

    async fn store_status(&self, host: &HostController) -> Result<Option<StoreInstanceStatus>> {
        let Some(started_at) = host.started_at().await else {
            return Ok(None);
        };
        let status = host.status(self.clients.request_timeout()).await?;

        Ok(Some(StoreInstanceStatus {
            id: format!("{:x}", status.member_id),
            state: if status.is_leader() { "leader" } else { "follower" }.to_string(),
            start_time: started_at.to_rfc3339(),
        }))
    }

    pub async fn build_status(&self) -> MemberStatus {
        let store = match &self.host {
            Some(host) => self.store_status(host).await.unwrap_or_else(|e| {
                tracing::warn!("get store status failed: {}", e);
                None
            }),
            None => None,
        };
        let last_defrag_time = match &self.defrag {
            Some(defrag) => defrag.last_defrag_time().await.map(|t| t.to_rfc3339()),
            None => None,
        };

        MemberStatus {
            options: (*self.config).clone(),
            last_heartbeat_time: chrono::Utc::now().to_rfc3339(),
            last_defrag_time,
            store,
        }
    }

    /// Write the status blob under this node's lease
    pub async fn publish_status(&self) -> Result<()> {
        let status = self.build_status().await;
        let value = serde_json::to_string(&status)?;

        let client = self.clients.get().await?;
        let lease = self.leases.current().await?;
        let key = status_key(self.config.name());
        with_timeout(
            self.clients.request_timeout(),
            "put member status",
            client.put(&key, &value, Some(lease)),
        )
        .await
    }

    /// Feed the store's member list to the membership registry
    pub async fn sync_members(&self) -> Result<bool> {
        let client = self.clients.get().await?;
        let list = with_timeout(
            self.clients.request_timeout(),
            "member list",
            client.member_list(),
        )
        .await?;
        self.members.refresh_from_authoritative(&list).await
    }

    /// One heartbeat; returns whether both steps succeeded
    pub async fn tick(&self) -> bool {
        let published = self.publish_status().await;
        if let Err(e) = &published {
            tracing::error!("publish member status failed: {}", e);
        }

        let synced = self.sync_members().await;
        if let Err(e) = &synced {
            tracing::error!("sync cluster members failed: {}", e);
        }

        let healthy = published.is_ok() && synced.is_ok();
        mark_health(&self.phase, healthy);
        healthy
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.config.heartbeat_interval();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
            }
        }
    }
}
