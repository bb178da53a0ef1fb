//! Store Client Provider
//!
//! One cached connection per node, created on first use.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::members::Members;
use crate::error::{Error, Result};
use crate::store::{ConnectSettings, StoreBackend, StoreClient};

/// Run a store round-trip under a deadline
pub(crate) async fn with_timeout<T, F>(deadline: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(what.to_string())),
    }
}

/// Lazily created, shared store connection
pub struct ClientProvider {
    backend: Arc<dyn StoreBackend>,
    members: Arc<Members>,
    static_endpoints: Vec<String>,
    settings: ConnectSettings,
    client: RwLock<Option<Arc<dyn StoreClient>>>,
    /// Serializes connection construction
    create: Mutex<()>,
    /// Set by `shutdown`; no connection is created afterwards
    closed: AtomicBool,
}

impl ClientProvider {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        members: Arc<Members>,
        static_endpoints: Vec<String>,
        settings: ConnectSettings,
    ) -> Self {
        Self {
            backend,
            members,
            static_endpoints,
            settings,
            client: RwLock::new(None),
            create: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    pub fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get the cached connection, creating it if needed
    pub async fn get(&self) -> Result<Arc<dyn StoreClient>> {
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let _guard = self.create.lock().await;
        if let Some(client) = self.client.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let endpoints = self.endpoints().await;
        if endpoints.is_empty() {
            return Err(Error::Unavailable("no store endpoints known".into()));
        }

        let client = with_timeout(
            self.settings.request_timeout,
            "connect to store",
            self.backend.connect(&endpoints, &self.settings),
        )
        .await?;

        let mut slot = self.client.write().await;
        if self.is_closed() {
            drop(slot);
            client.close().await;
            return Err(Error::ShuttingDown);
        }
        *slot = Some(Arc::clone(&client));
        tracing::info!("Created store client for {:?}", endpoints);
        Ok(client)
    }

    /// Static endpoints first (a host's own instance), then every known
    /// member client URL
    pub async fn endpoints(&self) -> Vec<String> {
        let mut endpoints = self.static_endpoints.clone();
        for url in self.members.known_client_urls().await {
            if !endpoints.contains(&url) {
                endpoints.push(url);
            }
        }
        endpoints
    }

    /// Drop the cached connection; the next `get` reconnects
    pub async fn close(&self) {
        let client = self.client.write().await.take();
        if let Some(client) = client {
            client.close().await;
            tracing::info!("Closed store client");
        }
    }

    /// Close for good: `get` fails with `ShuttingDown` from now on, including
    /// a connect that is already in flight
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close().await;
    }
}
