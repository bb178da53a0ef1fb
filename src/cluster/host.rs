//! Store Host Controller
//!
//! Supervised lifecycle of the store instance launched by a host node:
//! `Stopped -> Starting -> Ready -> Stopping -> Stopped`. Every transition
//! goes through the `transition` lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::client::with_timeout;
use super::state::HostState;
use crate::error::{Error, Result};
use crate::store::{HostedStore, LaunchSpec, StoreBackend, StoreStatus};

struct HostInner {
    state: HostState,
    instance: Option<Arc<dyn HostedStore>>,
    started_at: Option<DateTime<Utc>>,
}

/// Owner of the hosted store instance
pub struct HostController {
    backend: Arc<dyn StoreBackend>,
    startup_timeout: Duration,
    inner: RwLock<HostInner>,
    transition: Mutex<()>,
}

impl HostController {
    pub fn new(backend: Arc<dyn StoreBackend>, startup_timeout: Duration) -> Self {
        Self {
            backend,
            startup_timeout,
            inner: RwLock::new(HostInner {
                state: HostState::Stopped,
                instance: None,
                started_at: None,
            }),
            transition: Mutex::new(()),
        }
    }

    pub async fn state(&self) -> HostState {
        self.inner.read().await.state
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().await.started_at
    }

    /// The running instance
    pub async fn instance(&self) -> Result<Arc<dyn HostedStore>> {
        let inner = self.inner.read().await;
        match (&inner.state, &inner.instance) {
            (HostState::Ready, Some(instance)) => Ok(Arc::clone(instance)),
            _ => Err(Error::HostNotReady),
        }
    }

    /// Status answered by the hosted instance, never by another member
    pub async fn status(&self, deadline: Duration) -> Result<StoreStatus> {
        let instance = self.instance().await?;
        with_timeout(deadline, "store status", instance.status()).await
    }

    async fn set(&self, state: HostState, instance: Option<Arc<dyn HostedStore>>) {
        let mut inner = self.inner.write().await;
        inner.state = state;
        inner.started_at = match state {
            HostState::Ready => Some(Utc::now()),
            _ => None,
        };
        inner.instance = instance;
    }

    /// Launch the instance and wait for readiness.
    ///
    /// An instance that is not ready within the startup timeout is hard
    /// stopped. Returns the running instance if one already exists.
    pub async fn start(&self, spec: LaunchSpec) -> Result<Arc<dyn HostedStore>> {
        let _transition = self.transition.lock().await;
        if let Ok(instance) = self.instance().await {
            return Ok(instance);
        }

        self.set(HostState::Starting, None).await;
        let instance = match self.backend.launch(spec).await {
            Ok(instance) => instance,
            Err(e) => {
                self.set(HostState::Stopped, None).await;
                return Err(e);
            }
        };

        let ready = match timeout(self.startup_timeout, instance.ready()).await {
            Ok(ready) => ready,
            Err(_) => Err(Error::StartupTimeout(self.startup_timeout)),
        };
        if let Err(e) = ready {
            tracing::error!("store instance failed to start: {}", e);
            instance.hard_stop().await;
            self.set(HostState::Stopped, None).await;
            return Err(e);
        }

        self.set(HostState::Ready, Some(Arc::clone(&instance))).await;
        tracing::info!("server is ready");
        Ok(instance)
    }

    /// Wait until the instance reports a fatal error, then hard stop it.
    ///
    /// Returns `None` when `shutdown` fires first.
    pub async fn supervise(
        &self,
        instance: Arc<dyn HostedStore>,
        shutdown: CancellationToken,
    ) -> Option<Error> {
        tokio::select! {
            _ = shutdown.cancelled() => None,
            err = instance.failed() => {
                tracing::error!("store instance serve failed: {}", err);
                self.hard_stop().await;
                Some(err)
            }
        }
    }

    pub async fn hard_stop(&self) {
        let _transition = self.transition.lock().await;
        let instance = self.inner.read().await.instance.clone();
        if let Some(instance) = instance {
            self.set(HostState::Stopping, Some(Arc::clone(&instance))).await;
            instance.hard_stop().await;
        }
        self.set(HostState::Stopped, None).await;
    }

    /// Graceful shutdown, hard stop if that fails
    pub async fn close(&self) {
        let _transition = self.transition.lock().await;
        let instance = self.inner.read().await.instance.clone();
        let Some(instance) = instance else {
            return;
        };

        self.set(HostState::Stopping, Some(Arc::clone(&instance))).await;
        if let Err(e) = instance.close().await {
            tracing::warn!("graceful store shutdown failed: {}", e);
            instance.hard_stop().await;
        }
        self.set(HostState::Stopped, None).await;
        tracing::info!("store instance stopped");
    }
}
