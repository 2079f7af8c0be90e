//! Per-cluster cancellation signals.
//!
//! Each in-flight cluster run holds a [`CancelToken`] backed by a
//! `watch` channel; the [`CancelRegistry`] keeps the sending side keyed
//! by cluster id so `cancel(cluster_id)` can reach it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

/// Receiving side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled. Never resolves if the
    /// sending side is gone without signalling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn pair() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cancellation handles of in-flight cluster runs.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    handles: Arc<RwLock<HashMap<String, CancelHandle>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a cluster run. A cluster already registered shares the
    /// existing signal.
    pub async fn register(&self, cluster_id: &str) -> CancelToken {
        let mut handles = self.handles.write().await;
        let handle = handles
            .entry(cluster_id.to_string())
            .or_insert_with(|| CancelHandle::pair().0);
        debug!(%cluster_id, "cancellation registered");
        handle.token()
    }

    /// Signal cancellation. Returns `false` if nothing is in flight for
    /// the cluster.
    pub async fn cancel(&self, cluster_id: &str) -> bool {
        let handles = self.handles.read().await;
        match handles.get(cluster_id) {
            Some(handle) => {
                handle.cancel();
                info!(%cluster_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Drop the handle once no run holds a token for it.
    pub async fn release(&self, cluster_id: &str) {
        let mut handles = self.handles.write().await;
        if handles
            .get(cluster_id)
            .is_some_and(|h| h.tx.receiver_count() == 0)
        {
            handles.remove(cluster_id);
        }
    }

    pub async fn active(&self) -> Vec<String> {
        let handles = self.handles.read().await;
        let mut ids: Vec<String> = handles.keys().cloned().collect();
        ids.sort();
        ids
    }
}
