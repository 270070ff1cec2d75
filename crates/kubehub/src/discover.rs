//! API server discovery: probe candidate endpoints and memoize the winner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use kmirror_config::{parse_kubeconfig, ConfigOrigin, ConfigSource};
use kmirror_core::{ConnectionParams, Problem};
use kmirror_transport::Transport;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::request::{Request, RequestError, RequestExecutor};

/// Capability path every API server answers with `{"versions": [...]}`.
pub const DISCOVERY_PATH: &str = "/api";

/// How the winning endpoint was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionOrigin {
    /// Derived from a cluster config.
    Config(ConfigOrigin),
    /// A well-known fallback port, or explicitly supplied params.
    Open,
}

impl ConnectionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionOrigin::Config(o) => o.as_str(),
            ConnectionOrigin::Open => "open",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    pub params: ConnectionParams,
    pub origin: ConnectionOrigin,
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no running API server found{}", last_error_suffix(.last))]
    NotFound { last: Option<Box<RequestError>> },
    #[error("connecting to API server failed: {0}")]
    Connect(RequestError),
    #[error("discovery cancelled")]
    Cancelled,
}

fn last_error_suffix(last: &Option<Box<RequestError>>) -> String {
    last.as_ref().map(|e| format!(" (last error: {})", e)).unwrap_or_default()
}

impl DiscoveryError {
    /// Transport problem behind the failure.
    pub fn problem(&self) -> Problem {
        match self {
            DiscoveryError::NotFound { .. } => Problem::NotFound,
            DiscoveryError::Connect(e) => e.problem.clone().unwrap_or(Problem::ProtocolError),
            DiscoveryError::Cancelled => Problem::Cancelled,
        }
    }

    /// Shape the failure like a request failure for callers of the executor.
    pub(crate) fn into_request_error(self) -> RequestError {
        match self {
            DiscoveryError::Connect(e) => e,
            DiscoveryError::Cancelled => RequestError::problem(Problem::Cancelled),
            e @ DiscoveryError::NotFound { .. } => {
                let mut err = RequestError::problem(Problem::NotFound);
                err.message = e.to_string();
                err
            }
        }
    }
}

/// Which candidates a probe walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeScope {
    /// Config-derived candidates, then the fallback schemes.
    All,
    /// Config-derived candidates only.
    ConfigOnly,
}

/// Tries candidate endpoints in order until one answers like an API server.
pub struct EndpointProbe {
    executor: RequestExecutor,
    sources: Vec<Arc<dyn ConfigSource>>,
    context: Option<String>,
    fallbacks: Vec<ConnectionParams>,
}

impl EndpointProbe {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { executor: RequestExecutor::direct(transport), sources: Vec::new(), context: None, fallbacks: fallback_schemes() }
    }

    /// Add a config source. Sources are tried in the order added.
    pub fn with_config(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Use a context other than the config's current one.
    pub fn with_context(mut self, context: Option<String>) -> Self {
        self.context = context;
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<ConnectionParams>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub async fn probe(&self, scope: ProbeScope) -> Result<Discovered, DiscoveryError> {
        let t0 = std::time::Instant::now();
        let mut last = None;
        for source in &self.sources {
            let Some(params) = self.read_config(source.as_ref()).await else { continue };
            if let Some(found) = self.try_candidate(params, ConnectionOrigin::Config(source.origin()), &mut last).await? {
                info!(origin = found.origin.as_str(), took_ms = %t0.elapsed().as_millis(), "api server discovered");
                return Ok(found);
            }
        }
        if scope == ProbeScope::All {
            for params in &self.fallbacks {
                if let Some(found) = self.try_candidate(params.clone(), ConnectionOrigin::Open, &mut last).await? {
                    info!(origin = found.origin.as_str(), took_ms = %t0.elapsed().as_millis(), "api server discovered");
                    return Ok(found);
                }
            }
        }
        warn!(last = ?last.as_ref().map(|e| e.to_string()), "no running api server found");
        Err(DiscoveryError::NotFound { last: last.map(Box::new) })
    }

    /// Probe exactly one explicit candidate.
    pub async fn probe_params(&self, params: ConnectionParams) -> Result<Discovered, DiscoveryError> {
        let mut last = None;
        match self.try_candidate(params, ConnectionOrigin::Open, &mut last).await? {
            Some(found) => Ok(found),
            None => Err(DiscoveryError::NotFound { last: last.map(Box::new) }),
        }
    }

    async fn read_config(&self, source: &dyn ConfigSource) -> Option<ConnectionParams> {
        match source.read().await {
            Ok(Some(text)) => parse_kubeconfig(&text, self.context.as_deref()),
            Ok(None) => None,
            Err(e) => {
                warn!(origin = source.origin().as_str(), error = %e, "reading cluster config failed");
                None
            }
        }
    }

    /// `Ok(None)` advances to the next candidate; `Err` stops probing.
    async fn try_candidate(
        &self,
        params: ConnectionParams,
        origin: ConnectionOrigin,
        last: &mut Option<RequestError>,
    ) -> Result<Option<Discovered>, DiscoveryError> {
        counter!("discovery_probes_total", 1u64, "scheme" => params.scheme());
        debug!(url = %params.base_url(), origin = origin.as_str(), "trying api server");
        match self.executor.execute(Request::get(DISCOVERY_PATH).with_params(params.clone())).await {
            Ok(resp) => match api_versions(resp.data.as_json()) {
                Some(versions) => Ok(Some(Discovered { params, origin, versions })),
                None => {
                    debug!(url = %params.base_url(), status = resp.status, "not an api endpoint");
                    *last = Some(RequestError {
                        status: resp.status,
                        reason: resp.reason,
                        message: "not an API endpoint".into(),
                        problem: None,
                        data: Some(resp.data),
                    });
                    Ok(None)
                }
            },
            Err(e) if e.problem.is_none() || e.problem == Some(Problem::NotFound) => {
                debug!(url = %params.base_url(), error = %e, "api endpoint not found");
                *last = Some(e);
                Ok(None)
            }
            Err(e) => {
                debug!(url = %params.base_url(), error = %e, "connecting to api server failed");
                Err(DiscoveryError::Connect(e))
            }
        }
    }
}

/// Plain 8080, then TLS on 8443 and 6443. Fallbacks skip certificate checks.
pub fn fallback_schemes() -> Vec<ConnectionParams> {
    vec![ConnectionParams::plain(8080), ConnectionParams::tls(8443, false), ConnectionParams::tls(6443, false)]
}

fn api_versions(body: Option<&serde_json::Value>) -> Option<Vec<String>> {
    let versions = body?.get("versions")?.as_array()?;
    if versions.is_empty() {
        return None;
    }
    Some(versions.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
}

type ProbeFuture = Shared<BoxFuture<'static, Result<Discovered, DiscoveryError>>>;

enum Slot {
    Empty,
    Pending { generation: u64, fut: ProbeFuture, cancel: CancellationToken },
    Ready(Discovered),
}

/// Memoizes the discovered endpoint. Concurrent callers share one in-flight
/// probe; failures are not remembered.
pub struct DiscoveryCache {
    probe: Arc<EndpointProbe>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

impl DiscoveryCache {
    pub fn new(probe: EndpointProbe) -> Self {
        Self { probe: Arc::new(probe), slot: Mutex::new(Slot::Empty), generation: AtomicU64::new(0) }
    }

    /// Memoized result, probing if nothing is known yet.
    pub async fn resolve(&self) -> Result<Discovered, DiscoveryError> {
        let pending = {
            let mut slot = self.lock();
            let joined = match &*slot {
                Slot::Ready(d) => return Ok(d.clone()),
                Slot::Pending { generation, fut, .. } => Some((*generation, fut.clone())),
                Slot::Empty => None,
            };
            match joined {
                Some(p) => p,
                None => self.start(&mut slot, ProbeTarget::Scope(ProbeScope::All)),
            }
        };
        self.complete(pending).await
    }

    /// Forget the memoized result and probe all candidates again.
    pub async fn refresh(&self) -> Result<Discovered, DiscoveryError> {
        self.force(ProbeTarget::Scope(ProbeScope::All)).await
    }

    /// Re-probe config-derived candidates only, e.g. after the config changed.
    pub async fn refresh_config(&self) -> Result<Discovered, DiscoveryError> {
        self.force(ProbeTarget::Scope(ProbeScope::ConfigOnly)).await
    }

    /// Probe exactly `params` and memoize them on success.
    pub async fn resolve_with(&self, params: ConnectionParams) -> Result<Discovered, DiscoveryError> {
        self.force(ProbeTarget::Params(params)).await
    }

    pub fn cached(&self) -> Option<Discovered> {
        match &*self.lock() {
            Slot::Ready(d) => Some(d.clone()),
            _ => None,
        }
    }

    /// Abort an in-flight probe. Everyone waiting on it sees `Cancelled`.
    /// A forced re-probe does not do this: waiters move to the new probe.
    pub fn cancel_pending(&self) {
        let mut slot = self.lock();
        if let Slot::Pending { cancel, .. } = &*slot {
            debug!("cancelling pending discovery");
            cancel.cancel();
            *slot = Slot::Empty;
        }
    }

    /// Drop a memoized result without probing.
    pub fn invalidate(&self) {
        let mut slot = self.lock();
        if let Slot::Ready(_) = &*slot {
            *slot = Slot::Empty;
        }
    }

    async fn force(&self, target: ProbeTarget) -> Result<Discovered, DiscoveryError> {
        let pending = {
            let mut slot = self.lock();
            if let Slot::Pending { cancel, .. } = &*slot {
                cancel.cancel();
            }
            self.start(&mut slot, target)
        };
        self.complete(pending).await
    }

    fn start(&self, slot: &mut Slot, target: ProbeTarget) -> (u64, ProbeFuture) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let probe = self.probe.clone();
        let token = cancel.clone();
        let fut = async move {
            tokio::select! {
                _ = token.cancelled() => Err(DiscoveryError::Cancelled),
                res = async {
                    match target {
                        ProbeTarget::Scope(scope) => probe.probe(scope).await,
                        ProbeTarget::Params(params) => probe.probe_params(params).await,
                    }
                } => res,
            }
        }
        .boxed()
        .shared();
        *slot = Slot::Pending { generation, fut: fut.clone(), cancel };
        (generation, fut)
    }

    async fn complete(&self, (mut generation, mut fut): (u64, ProbeFuture)) -> Result<Discovered, DiscoveryError> {
        loop {
            let res = fut.await;
            let superseded = matches!(res, Err(DiscoveryError::Cancelled));
            let mut slot = self.lock();
            let next = match &*slot {
                // only the probe that is still current may settle the slot
                Slot::Pending { generation: g, .. } if *g == generation => None,
                // a forced probe replaced ours; wait for that one instead
                Slot::Pending { generation: g, fut: next, .. } if superseded => Some((*g, next.clone())),
                Slot::Ready(d) if superseded => return Ok(d.clone()),
                _ => return res,
            };
            match next {
                Some((g, f)) => {
                    generation = g;
                    fut = f;
                }
                None => {
                    *slot = match &res {
                        Ok(d) => Slot::Ready(d.clone()),
                        Err(_) => Slot::Empty,
                    };
                    return res;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum ProbeTarget {
    Scope(ProbeScope),
    Params(ConnectionParams),
}
