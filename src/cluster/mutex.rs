//! Distributed Mutex
//!
//! Cluster-wide lock scoped to a session. A local guard keeps two tasks
//! sharing one handle from entering the critical section together.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use super::client::with_timeout;
use super::session::Session;
use crate::error::{Error, Result};

/// Handle on a named cluster lock
pub struct DistributedMutex {
    name: String,
    session: Arc<Session>,
    timeout: Duration,
    local: Arc<Mutex<()>>,
    /// Local guard and store ownership key while locked
    held: Mutex<Option<(OwnedMutexGuard<()>, String)>>,
}

impl DistributedMutex {
    pub fn new(name: impl Into<String>, session: Arc<Session>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            session,
            timeout,
            local: Arc::new(Mutex::new(())),
            held: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Acquire the lock, giving up after the request timeout
    pub async fn lock(&self) -> Result<()> {
        let guard = Arc::clone(&self.local).lock_owned().await;

        let locked = with_timeout(
            self.timeout,
            &format!("lock {}", self.name),
            self.session.client().lock(&self.name, self.session.lease()),
        )
        .await;

        match locked {
            Ok(key) => {
                tracing::debug!("locked {} as {}", self.name, key);
                *self.held.lock().await = Some((guard, key));
                Ok(())
            }
            // dropping the guard lets the next local caller try
            Err(e) => Err(e),
        }
    }

    /// Release the lock; the local guard is released even if the store call fails
    pub async fn unlock(&self) -> Result<()> {
        let held = self.held.lock().await.take();
        let Some((guard, key)) = held else {
            return Err(Error::NotLocked(self.name.clone()));
        };

        let result = with_timeout(
            self.timeout,
            &format!("unlock {}", self.name),
            self.session.client().unlock(&key),
        )
        .await;
        drop(guard);

        if let Err(e) = &result {
            tracing::error!("unlock {} failed: {}", self.name, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::harness;

    #[tokio::test]
    async fn test_lock_times_out_while_held_elsewhere() {
        let h = harness("n1").await;
        let client = h.client().await;
        let owner = Arc::new(Session::new(client.lease_grant(60).await.unwrap(), Arc::clone(&client)));
        let other = Arc::new(Session::new(client.lease_grant(60).await.unwrap(), Arc::clone(&client)));

        let first = DistributedMutex::new("/locks/registry", owner, Duration::from_millis(200));
        let second = DistributedMutex::new("/locks/registry", other, Duration::from_millis(200));

        first.lock().await.unwrap();
        let err = second.lock().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        first.unlock().await.unwrap();
        second.lock().await.unwrap();
        second.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_guard_serializes_shared_handle() {
        let h = harness("n1").await;
        let client = h.client().await;
        let session = Arc::new(Session::new(client.lease_grant(60).await.unwrap(), client));
        let mutex = Arc::new(DistributedMutex::new("/locks/a", session, Duration::from_secs(1)));

        mutex.lock().await.unwrap();
        let contender = {
            let mutex = Arc::clone(&mutex);
            tokio::spawn(async move { mutex.lock().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        mutex.unlock().await.unwrap();
        contender.await.unwrap().unwrap();
        mutex.unlock().await.unwrap();
    }

    #[tokio::test]
    async fn test_unlock_not_held() {
        let h = harness("n1").await;
        let client = h.client().await;
        let session = Arc::new(Session::new(client.lease_grant(60).await.unwrap(), client));
        let mutex = DistributedMutex::new("/locks/b", session, Duration::from_secs(1));
        assert!(matches!(mutex.unlock().await, Err(Error::NotLocked(_))));
    }

    #[tokio::test]
    async fn test_failed_unlock_releases_local_guard() {
        let h = harness("n1").await;
        let client = h.client().await;
        let session = Arc::new(Session::new(client.lease_grant(60).await.unwrap(), Arc::clone(&client)));
        let mutex = DistributedMutex::new("/locks/c", session, Duration::from_secs(1));

        mutex.lock().await.unwrap();
        client.close().await;
        assert!(mutex.unlock().await.is_err());

        // the local guard is free: this fails fast on the closed client instead of hanging
        let err = tokio::time::timeout(Duration::from_millis(500), mutex.lock())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
