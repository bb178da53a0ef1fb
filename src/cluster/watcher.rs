//! Watch Multiplexer
//!
//! Republishes store change notifications on a bounded channel, one pump
//! task per watch. The channel closes when the store cancels the watch,
//! the watcher is closed, or the caller's token is cancelled.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::client::ClientProvider;
use crate::error::Result;
use crate::store::{EventKind, WatchBatch};

/// Capacity of each watch channel
pub const WATCH_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatchKind {
    Put,
    Delete,
}

/// Change delivered to watch callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    /// Empty for deletions
    pub value: String,
}

pub struct Watcher {
    clients: Arc<ClientProvider>,
    done: CancellationToken,
}

impl Watcher {
    pub fn new(clients: Arc<ClientProvider>, done: CancellationToken) -> Self {
        Self { clients, done }
    }

    /// Watch a key, or every key under it when `prefix` is set.
    ///
    /// No request timeout applies; the watch lives until one of the
    /// termination conditions fires.
    pub async fn watch(
        &self,
        key: &str,
        prefix: bool,
        ctx: CancellationToken,
    ) -> Result<mpsc::Receiver<WatchEvent>> {
        let client = self.clients.get().await?;
        let stream = client.watch(key, prefix).await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(pump(key.to_string(), stream, tx, self.done.clone(), ctx));
        Ok(rx)
    }

    /// Stop every watch started by this watcher
    pub fn close(&self) {
        self.done.cancel();
    }
}

pub(crate) async fn pump<S>(
    key: String,
    mut stream: S,
    tx: mpsc::Sender<WatchEvent>,
    done: CancellationToken,
    ctx: CancellationToken,
) where
    S: Stream<Item = Result<WatchBatch>> + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = done.cancelled() => return,
            _ = ctx.cancelled() => return,
            next = stream.next() => next,
        };

        let batch = match next {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => {
                tracing::error!("watch key {} failed: {}", key, e);
                return;
            }
            None => {
                tracing::info!("watch key {} closed by store", key);
                return;
            }
        };
        if batch.canceled {
            tracing::info!("watch key {} canceled", key);
            return;
        }
        if batch.progress_notify {
            continue;
        }

        for event in batch.events {
            let kind = match event.kind {
                EventKind::Put => WatchKind::Put,
                EventKind::Delete => WatchKind::Delete,
                EventKind::Unknown(other) => {
                    tracing::error!("key {} received unknown event type {}", key, other);
                    continue;
                }
            };
            let event = WatchEvent {
                kind,
                key: event.key,
                value: event.value,
            };

            let sent = tokio::select! {
                _ = done.cancelled() => return,
                _ = ctx.cancelled() => return,
                sent = tx.send(event) => sent,
            };
            if sent.is_err() {
                // receiver dropped
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::harness;
    use crate::store::StoreEvent;
    use std::time::Duration;

    fn event(kind: EventKind, key: &str, value: &str) -> StoreEvent {
        StoreEvent {
            kind,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn stalled(batches: Vec<Result<WatchBatch>>) -> impl Stream<Item = Result<WatchBatch>> + Unpin {
        Box::pin(futures::stream::iter(batches).chain(futures::stream::pending()))
    }

    #[tokio::test]
    async fn test_order_and_filtering() {
        let batches = vec![
            Ok(WatchBatch {
                created: true,
                ..Default::default()
            }),
            Ok(WatchBatch::events(vec![
                event(EventKind::Put, "/svc/a", "1"),
                event(EventKind::Unknown(7), "/svc/a", "?"),
                event(EventKind::Put, "/svc/a", "2"),
            ])),
            Ok(WatchBatch {
                progress_notify: true,
                ..Default::default()
            }),
            Ok(WatchBatch::events(vec![event(EventKind::Delete, "/svc/a", "")])),
        ];
        let (tx, mut rx) = mpsc::channel(WATCH_BUFFER);
        let ctx = CancellationToken::new();
        tokio::spawn(pump(
            "/svc/".into(),
            stalled(batches),
            tx,
            CancellationToken::new(),
            ctx.clone(),
        ));

        let kinds: Vec<(WatchKind, String)> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| (e.kind, e.value))
        .collect();
        assert_eq!(
            kinds,
            vec![
                (WatchKind::Put, "1".to_string()),
                (WatchKind::Put, "2".to_string()),
                (WatchKind::Delete, String::new()),
            ]
        );

        ctx.cancel();
        let closed = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_cancel_closes_channel() {
        let batches = vec![
            Ok(WatchBatch::events(vec![event(EventKind::Put, "/k", "v")])),
            Ok(WatchBatch {
                canceled: true,
                ..Default::default()
            }),
        ];
        let (tx, mut rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(pump(
            "/k".into(),
            stalled(batches),
            tx,
            CancellationToken::new(),
            CancellationToken::new(),
        ));

        assert_eq!(rx.recv().await.unwrap().value, "v");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_done_unblocks_full_channel() {
        let many = (0..WATCH_BUFFER + 5)
            .map(|i| event(EventKind::Put, "/k", &i.to_string()))
            .collect();
        let (tx, mut rx) = mpsc::channel(WATCH_BUFFER);
        let done = CancellationToken::new();
        let task = tokio::spawn(pump(
            "/k".into(),
            stalled(vec![Ok(WatchBatch::events(many))]),
            tx,
            done.clone(),
            CancellationToken::new(),
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        done.cancel();
        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .unwrap()
            .unwrap();

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, WATCH_BUFFER);
    }

    #[tokio::test]
    async fn test_watch_memory_store_prefix() {
        let h = harness("n1").await;
        let done = CancellationToken::new();
        let watcher = Watcher::new(Arc::clone(&h.clients), done);
        let mut rx = watcher
            .watch("/services/", true, CancellationToken::new())
            .await
            .unwrap();

        let client = h.client().await;
        client.put("/services/a", "10.0.0.1", None).await.unwrap();
        client.put("/other", "x", None).await.unwrap();
        client.delete("/services/a").await.unwrap();

        let put = rx.recv().await.unwrap();
        assert_eq!((put.kind, put.key.as_str(), put.value.as_str()), (WatchKind::Put, "/services/a", "10.0.0.1"));
        assert_eq!(rx.recv().await.unwrap().kind, WatchKind::Delete);

        watcher.close();
        assert!(rx.recv().await.is_none());
    }
}
