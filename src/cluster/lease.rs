//! Lease Manager
//!
//! Each node owns one long-lived lease. Its id is stored in hex under
//! `/leases/<name>`, attached to the lease itself, so a restarted node can
//! adopt the lease it held before as long as enough TTL remains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::client::{with_timeout, ClientProvider};
use crate::error::{Error, Result};
use crate::store::LeaseId;

/// Largest TTL the store accepts, roughly 285 years
pub const LEASE_TTL: i64 = 9_000_000_000;

const LEASE_PREFIX: &str = "/leases/";

pub fn lease_key(name: &str) -> String {
    format!("{}{}", LEASE_PREFIX, name)
}

fn parse_lease(value: &str) -> Option<LeaseId> {
    LeaseId::from_str_radix(value.trim(), 16).ok()
}

/// Grants, adopts and renews this node's lease
pub struct LeaseManager {
    clients: Arc<ClientProvider>,
    key: String,
    min_ttl: i64,
    lease: RwLock<Option<LeaseId>>,
    /// Set once by `close`; no lease is granted or adopted afterwards
    closed: AtomicBool,
}

impl LeaseManager {
    pub fn new(clients: Arc<ClientProvider>, name: &str, min_ttl: i64) -> Self {
        Self {
            clients,
            key: lease_key(name),
            min_ttl,
            lease: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn request_timeout(&self) -> Duration {
        self.clients.request_timeout()
    }

    /// The active lease
    pub async fn current(&self) -> Result<LeaseId> {
        self.lease.read().await.ok_or(Error::LeaseNotReady)
    }

    /// Adopt the persisted lease if it still has enough TTL, grant otherwise
    pub async fn ensure_lease(&self) -> Result<LeaseId> {
        let client = self.clients.get().await?;
        let timeout = self.request_timeout();

        let persisted = with_timeout(timeout, "get lease key", client.get(&self.key)).await?;
        let Some(kv) = persisted else {
            return self.grant_new_lease().await;
        };
        let Some(id) = parse_lease(&kv.value) else {
            tracing::warn!("invalid lease id '{}' under {}", kv.value, self.key);
            return self.grant_new_lease().await;
        };

        match with_timeout(timeout, "lease time to live", client.lease_time_to_live(id)).await {
            Ok(ttl) if ttl >= self.min_ttl => {
                let mut lease = self.lease.write().await;
                if self.is_closed() {
                    return Err(Error::ShuttingDown);
                }
                *lease = Some(id);
                tracing::info!("lease is ready (use existed: {:x})", id);
                Ok(id)
            }
            Ok(ttl) => {
                tracing::info!("lease {:x} has {}s left, granting a new one", id, ttl);
                self.replace_lease(Some(id)).await
            }
            Err(e) => {
                tracing::warn!("query lease {:x} failed: {}", id, e);
                self.replace_lease(Some(id)).await
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Grant a lease and publish its id; the grant is revoked if the publish fails
    pub async fn grant_new_lease(&self) -> Result<LeaseId> {
        self.replace_lease(None).await
    }

    /// Grant and publish a new lease, then revoke the one it supersedes:
    /// the lease held in memory, else `stale` read back from the store.
    async fn replace_lease(&self, stale: Option<LeaseId>) -> Result<LeaseId> {
        let client = self.clients.get().await?;
        let timeout = self.request_timeout();
        let mut lease = self.lease.write().await;
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }

        let id = with_timeout(timeout, "lease grant", client.lease_grant(LEASE_TTL)).await?;

        let value = format!("{:x}", id);
        let published =
            with_timeout(timeout, "put lease key", client.put(&self.key, &value, Some(id))).await;
        if let Err(e) = published {
            if let Err(revoke) =
                with_timeout(timeout, "lease revoke", client.lease_revoke(id)).await
            {
                tracing::error!("revoke lease {:x} failed: {}", id, revoke);
            }
            return Err(Error::Store(format!("put lease to {} failed: {}", self.key, e)));
        }

        let previous = lease.replace(id).or(stale);
        tracing::info!("lease is ready (grant new one: {:x})", id);

        if let Some(old) = previous.filter(|old| *old != id) {
            match with_timeout(timeout, "lease revoke", client.lease_revoke(old)).await {
                Ok(()) => tracing::info!("revoked superseded lease {:x}", old),
                Err(e) => tracing::warn!("revoke superseded lease {:x} failed: {}", old, e),
            }
        }
        Ok(id)
    }

    /// One renewal; a missing or failing lease is replaced
    pub async fn keep_alive_once(&self) {
        if self.is_closed() {
            return;
        }
        let client = match self.clients.get().await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("get client failed: {}", e);
                return;
            }
        };

        let id = match self.current().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("get lease failed: {}", e);
                if let Err(e) = self.grant_new_lease().await {
                    tracing::error!("grant new lease failed: {}", e);
                }
                return;
            }
        };

        let renewed = with_timeout(
            self.request_timeout(),
            "lease keep alive",
            client.lease_keep_alive_once(id),
        )
        .await;
        match renewed {
            Ok(ttl) => tracing::trace!("lease {:x} renewed, ttl {}", id, ttl),
            Err(e) => {
                tracing::error!("keep alive for lease {:x} failed: {}", id, e);
                if let Err(e) = self.grant_new_lease().await {
                    tracing::error!("grant new lease failed: {}", e);
                }
            }
        }
    }

    /// Renew every request timeout until shutdown
    pub async fn run_keep_alive(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.request_timeout()) => self.keep_alive_once().await,
            }
        }
    }

    /// Stop granting leases and revoke the active one.
    ///
    /// A grant in flight finishes first, so its lease is the one revoked.
    pub async fn close(&self) {
        let held = {
            let mut lease = self.lease.write().await;
            self.closed.store(true, Ordering::SeqCst);
            lease.take()
        };
        let Some(id) = held else {
            return;
        };

        let revoked = match self.clients.get().await {
            Ok(client) => {
                with_timeout(self.request_timeout(), "lease revoke", client.lease_revoke(id)).await
            }
            Err(e) => Err(e),
        };
        match revoked {
            Ok(()) => tracing::info!("revoked lease {:x}", id),
            Err(e) => tracing::warn!("revoke lease {:x} on close failed: {}", id, e),
        }
    }
}
