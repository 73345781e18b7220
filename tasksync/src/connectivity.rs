//! Reachability tracking.
//!
//! [`ConnectivityMonitor`] holds the current online flag and emits a
//! [`Reconnected`] event exactly once per offline→online transition. Something
//! outside has to feed it: the host platform's network callbacks through
//! [`ConnectivityMonitor::report`], or a polling task started with
//! [`spawn_probe`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::error::StoreError;

/// Emitted when connectivity comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnected;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
    edges: broadcast::Sender<Reconnected>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (edges, _) = broadcast::channel(16);
        Self {
            state: Arc::new(state),
            edges,
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the latest observation. Returns `true` if it was an
    /// offline→online edge, in which case [`Reconnected`] has been sent.
    pub fn report(&self, online: bool) -> bool {
        let was_online = self.state.send_replace(online);
        match (was_online, online) {
            (false, true) => {
                log::info!("Connectivity restored");
                let _ = self.edges.send(Reconnected);
                true
            }
            (true, false) => {
                log::info!("Connectivity lost");
                false
            }
            _ => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Reconnected> {
        self.edges.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Something that can tell whether the remote backend is reachable.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probes a URL with a GET. Any HTTP response counts as reachable; transport
/// errors and timeouts do not.
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connectivity(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Probe of {} failed: {e}", self.url);
                false
            }
        }
    }
}

/// Poll `probe` every `interval` and feed the results to `monitor` until
/// `shutdown` flips to `true` or its sender is dropped.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            monitor.report(probe.probe().await);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
