//! Defragmentation Scheduler
//!
//! Host role only. Defragments the node's own store instance once per
//! normal interval, retrying sooner after a failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::client::{with_timeout, ClientProvider};
use crate::error::{Error, Result};

pub const DEFRAG_NORMAL_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFRAG_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Defragmentation budget as a multiple of the request timeout
const LONG_REQUEST_FACTOR: u32 = 3;

pub struct DefragScheduler {
    clients: Arc<ClientProvider>,
    endpoint: Option<String>,
    last_defrag: RwLock<Option<DateTime<Utc>>>,
}

impl DefragScheduler {
    pub fn new(clients: Arc<ClientProvider>, endpoint: Option<String>) -> Self {
        Self {
            clients,
            endpoint,
            last_defrag: RwLock::new(None),
        }
    }

    pub async fn last_defrag_time(&self) -> Option<DateTime<Utc>> {
        *self.last_defrag.read().await
    }

    async fn defragment(&self) -> Result<()> {
        let client = self.clients.get().await?;
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("no advertised client url to defragment".into()))?;

        with_timeout(
            self.clients.request_timeout() * LONG_REQUEST_FACTOR,
            "defragment",
            client.defragment(endpoint),
        )
        .await
    }

    /// Run one defragmentation; returns how long to wait before the next
    pub async fn run_once(&self) -> Duration {
        match self.defragment().await {
            Ok(()) => {
                *self.last_defrag.write().await = Some(Utc::now());
                tracing::info!("defrag successfully");
                DEFRAG_NORMAL_INTERVAL
            }
            Err(e) => {
                tracing::error!("defrag failed: {}", e);
                DEFRAG_RETRY_INTERVAL
            }
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut wait = DEFRAG_NORMAL_INTERVAL;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => wait = self.run_once().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::harness;

    #[tokio::test]
    async fn test_success_uses_normal_interval() {
        let h = harness("n1").await;
        let endpoint = h.config.first_advertise_client_url().unwrap().to_string();
        let defrag = DefragScheduler::new(Arc::clone(&h.clients), Some(endpoint));

        assert!(defrag.last_defrag_time().await.is_none());
        assert_eq!(defrag.run_once().await, DEFRAG_NORMAL_INTERVAL);
        assert!(defrag.last_defrag_time().await.is_some());
    }

    #[tokio::test]
    async fn test_failure_uses_retry_interval() {
        let h = harness("n1").await;
        let defrag = DefragScheduler::new(
            Arc::clone(&h.clients),
            Some("http://10.9.9.9:2379".to_string()),
        );
        assert_eq!(defrag.run_once().await, DEFRAG_RETRY_INTERVAL);
        assert!(defrag.last_defrag_time().await.is_none());

        let unresolved = DefragScheduler::new(Arc::clone(&h.clients), None);
        assert_eq!(unresolved.run_once().await, DEFRAG_RETRY_INTERVAL);
    }

    #[tokio::test]
    async fn test_stopped_instance_uses_retry_interval() {
        let h = harness("n1").await;
        let endpoint = h.config.first_advertise_client_url().unwrap().to_string();
        let defrag = DefragScheduler::new(Arc::clone(&h.clients), Some(endpoint));

        h.host.hard_stop().await;
        assert_eq!(defrag.run_once().await, DEFRAG_RETRY_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown() {
        let h = harness("n1").await;
        let defrag = DefragScheduler::new(Arc::clone(&h.clients), None);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        defrag.run(shutdown).await;
    }
}
