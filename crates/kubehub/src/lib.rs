//! kmirror kubehub: discovery, one-shot requests and self-healing watches
//! against a Kubernetes-style API server.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kmirror_core::Frame;
use kmirror_transport::Transport;
use tokio::sync::mpsc;

pub mod discover;
pub mod request;
pub mod watch;

pub use discover::{fallback_schemes, ConnectionOrigin, Discovered, DiscoveryCache, DiscoveryError, EndpointProbe, ProbeScope, DISCOVERY_PATH};
pub use request::{Request, RequestBody, RequestError, RequestExecutor, RequestHandle, Response, ResponseData, PROBLEM_STATUS};
pub use watch::{Endpoint, WatchConfig, WatchController, WatchError, WatchHandle, WatchPhase};

/// Entry point tying one transport to one memoized discovery.
#[derive(Clone)]
pub struct KubeHub {
    transport: Arc<dyn Transport>,
    discovery: Arc<DiscoveryCache>,
    executor: RequestExecutor,
    watch_config: WatchConfig,
}

impl KubeHub {
    pub fn new(transport: Arc<dyn Transport>, probe: EndpointProbe) -> Self {
        let discovery = Arc::new(DiscoveryCache::new(probe));
        let executor = RequestExecutor::new(transport.clone(), discovery.clone());
        Self { transport, discovery, executor, watch_config: WatchConfig::from_env() }
    }

    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    pub fn discovery(&self) -> &Arc<DiscoveryCache> { &self.discovery }

    pub fn executor(&self) -> &RequestExecutor { &self.executor }

    /// Memoized discovery; `force` re-probes every candidate.
    pub async fn discover(&self, force: bool) -> Result<Discovered, DiscoveryError> {
        if force {
            self.discovery.refresh().await
        } else {
            self.discovery.resolve().await
        }
    }

    pub async fn request(&self, request: Request) -> Result<Response, RequestError> {
        self.executor.execute(request).await
    }

    pub fn spawn_request(&self, request: Request) -> RequestHandle {
        self.executor.spawn(request)
    }

    /// Watch a collection path, delivering frame batches to `on_frames`.
    pub fn watch<F>(&self, path: &str, on_frames: F) -> WatchHandle
    where
        F: FnMut(Vec<Frame>) + Send + 'static,
    {
        WatchController::new(self.transport.clone(), Endpoint::Discover(self.discovery.clone()), path, self.watch_config)
            .spawn(on_frames)
    }

    /// Like [`watch`](Self::watch) but batches arrive on a channel.
    pub fn watch_stream(&self, path: &str) -> (mpsc::UnboundedReceiver<Vec<Frame>>, WatchHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.watch(path, move |batch| {
            let _ = tx.send(batch);
        });
        (rx, handle)
    }
}
