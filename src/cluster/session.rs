//! Session Provider
//!
//! A session binds the node's current lease to the store connection. It
//! scopes distributed mutexes: when the lease expires the store releases
//! every lock taken through the session.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use super::client::ClientProvider;
use super::lease::LeaseManager;
use crate::error::Result;
use crate::store::{LeaseId, StoreClient};

/// Client handle bound to one lease
pub struct Session {
    lease: LeaseId,
    client: Arc<dyn StoreClient>,
}

impl Session {
    pub(crate) fn new(lease: LeaseId, client: Arc<dyn StoreClient>) -> Self {
        Self { lease, client }
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub(crate) fn client(&self) -> &Arc<dyn StoreClient> {
        &self.client
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &format_args!("{:x}", self.lease))
            .finish()
    }
}

/// Lazily created session, recreated when the lease changes
pub struct SessionProvider {
    clients: Arc<ClientProvider>,
    leases: Arc<LeaseManager>,
    session: RwLock<Option<Arc<Session>>>,
    create: Mutex<()>,
}

impl SessionProvider {
    pub fn new(clients: Arc<ClientProvider>, leases: Arc<LeaseManager>) -> Self {
        Self {
            clients,
            leases,
            session: RwLock::new(None),
            create: Mutex::new(()),
        }
    }

    fn cached(session: &Option<Arc<Session>>, lease: LeaseId) -> Option<Arc<Session>> {
        session
            .as_ref()
            .filter(|s| s.lease == lease)
            .map(Arc::clone)
    }

    /// Session for the current lease
    pub async fn get(&self) -> Result<Arc<Session>> {
        let client = self.clients.get().await?;
        let lease = self.leases.current().await?;

        if let Some(session) = Self::cached(&*self.session.read().await, lease) {
            return Ok(session);
        }

        let _guard = self.create.lock().await;
        if let Some(session) = Self::cached(&*self.session.read().await, lease) {
            return Ok(session);
        }

        let session = Arc::new(Session::new(lease, client));
        let previous = self.session.write().await.replace(Arc::clone(&session));
        match previous {
            Some(old) => tracing::info!("session moved from lease {:x} to {:x}", old.lease, lease),
            None => tracing::info!("session created on lease {:x}", lease),
        }
        Ok(session)
    }

    pub async fn close(&self) {
        if let Some(session) = self.session.write().await.take() {
            tracing::info!("session on lease {:x} closed", session.lease);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::harness;
    use crate::error::Error;

    #[tokio::test]
    async fn test_session_requires_lease() {
        let h = harness("n1").await;
        let leases = Arc::new(LeaseManager::new(Arc::clone(&h.clients), "n1", 5));
        let sessions = SessionProvider::new(Arc::clone(&h.clients), leases);
        assert!(matches!(sessions.get().await, Err(Error::LeaseNotReady)));
    }

    #[tokio::test]
    async fn test_concurrent_get_creates_one_session() {
        let h = harness("n1").await;
        let leases = Arc::new(LeaseManager::new(Arc::clone(&h.clients), "n1", 5));
        leases.ensure_lease().await.unwrap();
        let sessions = Arc::new(SessionProvider::new(Arc::clone(&h.clients), leases));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions = Arc::clone(&sessions);
                tokio::spawn(async move { sessions.get().await.unwrap() })
            })
            .collect();

        let first = sessions.get().await.unwrap();
        for handle in handles {
            assert!(Arc::ptr_eq(&first, &handle.await.unwrap()));
        }
    }

    #[tokio::test]
    async fn test_session_follows_lease() {
        let h = harness("n1").await;
        let leases = Arc::new(LeaseManager::new(Arc::clone(&h.clients), "n1", 5));
        leases.ensure_lease().await.unwrap();
        let sessions = SessionProvider::new(Arc::clone(&h.clients), Arc::clone(&leases));

        let before = sessions.get().await.unwrap();
        let regranted = leases.grant_new_lease().await.unwrap();
        let after = sessions.get().await.unwrap();
        assert_ne!(before.lease(), after.lease());
        assert_eq!(after.lease(), regranted);

        sessions.close().await;
        let reopened = sessions.get().await.unwrap();
        assert!(!Arc::ptr_eq(&after, &reopened));
    }
}
