//! Long-running watch subscriptions.
//!
//! A [`WatchController`] keeps one watch alive against one collection path.
//! It resumes from the last seen `resourceVersion` after ordinary closes,
//! relists when the cursor is rejected, and emits synthetic deletes for
//! objects that disappeared while it had no live view.
//!
//! There is no end-of-list marker in a watch, so "loaded" is a heuristic:
//! the stream has been quiet for [`WatchConfig::settle`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use kmirror_core::{ConnectionParams, Frame, Problem};
use kmirror_transport::{Channel, ChannelEvent, OpenOptions, ResponseMeta, Transport};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::discover::{DiscoveryCache, DiscoveryError};
use crate::request::{error_message, ResponseData, PROBLEM_STATUS};

mod state;

pub use state::{LineDecoder, LineOutcome, WatchState};

/// Timing knobs. Read from the environment by [`WatchConfig::from_env`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// Quiet period after which a load counts as settled.
    pub settle: Duration,
    /// Delay before a non-immediate restart.
    pub retry: Duration,
    /// Watches closing sooner than this are treated as misbehaving.
    pub min_block: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { settle: Duration::from_millis(100), retry: Duration::from_secs(5), min_block: Duration::from_secs(1) }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let settle_ms = std::env::var("KMIRROR_WATCH_SETTLE_MS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(d.settle.as_millis() as u64);
        let retry_secs = std::env::var("KMIRROR_WATCH_RETRY_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(d.retry.as_secs());
        let min_secs = std::env::var("KMIRROR_WATCH_MIN_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(d.min_block.as_secs());
        Self {
            settle: Duration::from_millis(settle_ms),
            retry: Duration::from_secs(retry_secs),
            min_block: Duration::from_secs(min_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error("watching {path} failed: {problem}")]
    Transport { path: String, problem: Problem },
    #[error("watching {path} failed: {message}")]
    Status { path: String, status: u16, message: String },
    #[error("watching {path} failed: {message}")]
    Discovery { path: String, problem: Problem, message: String },
    #[error("watch cancelled: {0}")]
    Cancelled(Problem),
}

impl WatchError {
    /// HTTP status, or 999 for anything that isn't one.
    pub fn status(&self) -> u16 {
        match self {
            WatchError::Status { status, .. } => *status,
            _ => PROBLEM_STATUS,
        }
    }

    pub fn problem(&self) -> Option<Problem> {
        match self {
            WatchError::Transport { problem, .. } | WatchError::Discovery { problem, .. } | WatchError::Cancelled(problem) => {
                Some(problem.clone())
            }
            WatchError::Status { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Connecting,
    Streaming,
    Restarting,
    /// Terminal. Carries the error unless the watch was cancelled.
    Stopped(Option<WatchError>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LoadState {
    Pending,
    Loaded,
    Failed(WatchError),
}

enum Command {
    Cancel(Option<Problem>),
}

/// Where the watch gets its endpoint.
#[derive(Clone)]
pub enum Endpoint {
    Fixed(ConnectionParams),
    Discover(Arc<DiscoveryCache>),
}

/// Handle to a running watch. Cloneable; the watch stops once every handle
/// is dropped.
#[derive(Clone)]
pub struct WatchHandle {
    path: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    phase: watch::Receiver<WatchPhase>,
    load: watch::Receiver<LoadState>,
}

impl WatchHandle {
    pub fn path(&self) -> &str { &self.path }

    /// Resolves at the first settle; fails if the watch fails or is
    /// cancelled before that.
    pub async fn loaded(&self) -> Result<(), WatchError> {
        let mut rx = self.load.clone();
        let state = rx.wait_for(|s| *s != LoadState::Pending).await.map(|s| (*s).clone());
        match state {
            Ok(LoadState::Failed(e)) => Err(e),
            Ok(_) => Ok(()),
            Err(_) => Err(WatchError::Cancelled(Problem::Terminated)),
        }
    }

    pub fn phase(&self) -> WatchPhase { self.phase.borrow().clone() }

    /// Waits until the watch stops for good. `None` means it was cancelled.
    pub async fn stopped(&self) -> Option<WatchError> {
        let mut rx = self.phase.clone();
        let phase = rx.wait_for(|p| matches!(p, WatchPhase::Stopped(_))).await.map(|p| (*p).clone());
        match phase {
            Ok(WatchPhase::Stopped(err)) => err,
            _ => None,
        }
    }

    /// Stop the watch. `reason` defaults to `disconnected`. Idempotent.
    pub fn cancel(&self, reason: Option<Problem>) {
        let _ = self.commands.send(Command::Cancel(reason));
    }
}

/// One watch subscription against one collection path.
pub struct WatchController {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    path: String,
    config: WatchConfig,
}

impl WatchController {
    pub fn new(transport: Arc<dyn Transport>, endpoint: Endpoint, path: impl Into<String>, config: WatchConfig) -> Self {
        Self { transport, endpoint, path: path.into(), config }
    }

    /// Start watching. `on_frames` receives every batch of valid frames; an
    /// empty batch means "load settled, flush".
    pub fn spawn<F>(self, on_frames: F) -> WatchHandle
    where
        F: FnMut(Vec<Frame>) + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(WatchPhase::Idle);
        let (load_tx, load_rx) = watch::channel(LoadState::Pending);
        let path: Arc<str> = Arc::from(self.path.as_str());
        let task = Task {
            transport: self.transport,
            endpoint: self.endpoint,
            path: self.path,
            config: self.config,
            on_frames,
            state: WatchState::new(),
            channel: None,
            stream: Stream::default(),
            settle: None,
            retry: None,
            commands: cmd_rx,
            phase: phase_tx,
            load: load_tx,
            started: Instant::now(),
            done: false,
        };
        tokio::spawn(task.run());
        WatchHandle { path, commands: cmd_tx, phase: phase_rx, load: load_rx }
    }
}

/// Per-request bookkeeping, reset on every open.
struct Stream {
    opened: Instant,
    response: Option<ResponseMeta>,
    failed: bool,
    error_body: BytesMut,
    decoder: LineDecoder,
    /// Closed locally because the cursor was rejected.
    expired: bool,
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            opened: Instant::now(),
            response: None,
            failed: false,
            error_body: BytesMut::new(),
            decoder: LineDecoder::default(),
            expired: false,
        }
    }
}

type Timer = Option<Pin<Box<Sleep>>>;

struct Task<F> {
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    path: String,
    config: WatchConfig,
    on_frames: F,
    state: WatchState,
    channel: Option<Channel>,
    stream: Stream,
    settle: Timer,
    retry: Timer,
    commands: mpsc::UnboundedReceiver<Command>,
    phase: watch::Sender<WatchPhase>,
    load: watch::Sender<LoadState>,
    started: Instant,
    done: bool,
}

impl<F> Task<F>
where
    F: FnMut(Vec<Frame>) + Send + 'static,
{
    async fn run(mut self) {
        self.start().await;
        while !self.done {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Cancel(reason)) => self.stop(reason),
                    // every handle is gone
                    None => self.stop(None),
                },
                ev = next_event(&mut self.channel) => self.on_event(ev).await,
                _ = fire(&mut self.settle) => {
                    self.settle = None;
                    self.on_settle();
                }
                _ = fire(&mut self.retry) => {
                    self.retry = None;
                    self.start().await;
                }
            }
        }
        debug!(path = %self.path, "watch task finished");
    }

    async fn start(&mut self) {
        if self.done || self.channel.is_some() {
            return;
        }
        self.retry = None;
        self.phase.send_replace(WatchPhase::Connecting);
        let Some(params) = self.resolve_params().await else { return };

        let full = self.state.begin_request();
        let uri = watch_uri(&self.path, self.state.last_resource_version());
        counter!("watch_requests_total", 1u64, "mode" => if full { "full" } else { "resume" });
        debug!(path = %self.path, uri = %uri, full, "starting watch");

        let channel = self.transport.open(OpenOptions::new(&params, "GET", &uri));
        channel.done();
        self.channel = Some(channel);
        self.stream = Stream::default();
    }

    /// Endpoint for the next request. Commands stay observable while
    /// discovery is pending.
    async fn resolve_params(&mut self) -> Option<ConnectionParams> {
        let discovery = match &self.endpoint {
            Endpoint::Fixed(params) => return Some(params.clone()),
            Endpoint::Discover(cache) => cache.clone(),
        };
        let res = tokio::select! {
            biased;
            cmd = self.commands.recv() => {
                let reason = match cmd {
                    Some(Command::Cancel(reason)) => reason,
                    None => None,
                };
                self.stop(reason);
                return None;
            }
            res = discovery.resolve() => res,
        };
        match res {
            Ok(found) => Some(found.params),
            Err(DiscoveryError::Cancelled) => {
                debug!(path = %self.path, "discovery cancelled under watch");
                self.schedule_retry("discovery");
                None
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "watch discovery failed");
                self.terminate(WatchError::Discovery { path: self.path.clone(), problem: e.problem(), message: e.to_string() });
                None
            }
        }
    }

    async fn on_event(&mut self, ev: Option<ChannelEvent>) {
        match ev {
            Some(ChannelEvent::Control(meta)) => self.on_response(meta),
            Some(ChannelEvent::Message(data)) => self.on_message(data),
            Some(ChannelEvent::Close(opts)) => {
                self.channel = None;
                self.on_close(opts.problem).await;
            }
            None => {
                self.channel = None;
                self.on_close(Some(Problem::Disconnected)).await;
            }
        }
    }

    fn on_response(&mut self, meta: ResponseMeta) {
        if self.stream.response.is_some() {
            return;
        }
        self.stream.failed = meta.status > 299;
        if !self.stream.failed {
            self.arm_settle();
            self.phase.send_replace(WatchPhase::Streaming);
        }
        self.stream.response = Some(meta);
    }

    fn on_message(&mut self, data: Bytes) {
        if self.stream.failed {
            // keep the error body for the close diagnostics
            self.stream.error_body.extend_from_slice(&data);
            return;
        }
        let mut batch = Vec::new();
        let mut restart: Option<bool> = None;
        for line in self.stream.decoder.push(&data) {
            match self.state.apply_line(&line) {
                LineOutcome::Frame(frame) => batch.push(frame),
                LineOutcome::Dropped => {
                    counter!("watch_invalid_objects_total", 1u64);
                }
                LineOutcome::Ignored => {}
                LineOutcome::Desync(err) => {
                    warn!(path = %self.path, error = %err, "unparsable watch line");
                    restart = Some(false);
                    break;
                }
                LineOutcome::Expired => {
                    debug!(path = %self.path, "watch cursor expired, relisting");
                    restart = Some(true);
                    break;
                }
            }
        }
        if !batch.is_empty() {
            counter!("watch_frames_total", batch.len() as u64);
            (self.on_frames)(batch);
        }
        if self.stream.response.is_some() {
            self.arm_settle();
        }
        if let Some(expired) = restart {
            self.stream.expired = expired;
            if let Some(channel) = self.channel.as_mut() {
                channel.close(None);
            }
        }
    }

    async fn on_close(&mut self, problem: Option<Problem>) {
        self.settle = None;
        let stream = std::mem::take(&mut self.stream);
        if self.done || self.state.is_stopping() {
            return;
        }

        if stream.expired {
            counter!("watch_restarts_total", 1u64, "reason" => "expired");
            self.start().await;
            return;
        }

        if let Some(problem) = problem {
            if problem == Problem::Disconnected {
                debug!(path = %self.path, problem = %problem, "watch closed");
            } else {
                warn!(path = %self.path, problem = %problem, "watch failed");
            }
            self.fail_load(WatchError::Transport { path: self.path.clone(), problem });
            self.schedule_retry("problem");
            return;
        }

        if stream.failed {
            let meta = stream.response.unwrap_or_default();
            let data = ResponseData::decode(&meta, stream.error_body.freeze());
            let message = error_message(meta.status, &meta.reason, &data);
            let err = WatchError::Status { path: self.path.clone(), status: meta.status, message };
            if matches!(meta.status, 403 | 404 | 410) {
                debug!(path = %self.path, status = meta.status, error = %err, "watch failed, not retrying");
                self.terminate(err);
            } else {
                warn!(path = %self.path, status = meta.status, error = %err, "watch failed");
                self.fail_load(err);
                self.schedule_retry("status");
            }
            return;
        }

        if stream.opened.elapsed() < self.config.min_block {
            warn!(path = %self.path, took_ms = %stream.opened.elapsed().as_millis(), "watch didn't block");
            self.schedule_retry("unblocked");
            return;
        }

        counter!("watch_restarts_total", 1u64, "reason" => "resume");
        self.start().await;
    }

    fn on_settle(&mut self) {
        let (deletes, first) = self.state.settle();
        if !deletes.is_empty() {
            counter!("watch_synthetic_deletes_total", deletes.len() as u64);
            debug!(path = %self.path, count = deletes.len(), "objects vanished during reload");
            (self.on_frames)(deletes);
        }
        (self.on_frames)(Vec::new());
        if first {
            info!(path = %self.path, objects = self.state.objects().len(), took_ms = %self.started.elapsed().as_millis(), "watch loaded");
        }
        self.finish_load(LoadState::Loaded);
    }

    /// Single coalesced delayed restart.
    fn schedule_retry(&mut self, reason: &'static str) {
        counter!("watch_restarts_total", 1u64, "reason" => reason);
        if self.retry.is_none() {
            self.retry = Some(Box::pin(tokio::time::sleep(self.config.retry)));
        }
        self.phase.send_replace(WatchPhase::Restarting);
    }

    /// Settle the load promise once. Returns whether this call settled it.
    fn finish_load(&mut self, state: LoadState) -> bool {
        self.load.send_if_modified(|s| {
            if *s == LoadState::Pending {
                *s = state;
                true
            } else {
                false
            }
        })
    }

    /// Fail a pending load. The caller still gets its flush batch.
    fn fail_load(&mut self, err: WatchError) {
        if self.finish_load(LoadState::Failed(err)) {
            (self.on_frames)(Vec::new());
        }
    }

    fn terminate(&mut self, err: WatchError) {
        self.fail_load(err.clone());
        self.settle = None;
        self.retry = None;
        self.done = true;
        self.phase.send_replace(WatchPhase::Stopped(Some(err)));
    }

    fn stop(&mut self, reason: Option<Problem>) {
        if self.done {
            return;
        }
        let reason = reason.unwrap_or(Problem::Disconnected);
        debug!(path = %self.path, reason = %reason, "watch cancelled");
        self.state.stop();
        if let Some(mut channel) = self.channel.take() {
            channel.close(Some(reason.clone()));
        }
        self.settle = None;
        self.retry = None;
        self.finish_load(LoadState::Failed(WatchError::Cancelled(reason)));
        self.done = true;
        self.phase.send_replace(WatchPhase::Stopped(None));
    }

    fn arm_settle(&mut self) {
        let deadline = Instant::now() + self.config.settle;
        match self.settle.as_mut() {
            Some(timer) => timer.as_mut().reset(deadline),
            None => self.settle = Some(Box::pin(tokio::time::sleep_until(deadline))),
        }
    }
}

async fn next_event(channel: &mut Option<Channel>) -> Option<ChannelEvent> {
    match channel {
        Some(ch) => ch.recv().await,
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Timer) {
    match timer {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

/// `path?watch=true[&resourceVersion=..]`, respecting an existing query.
pub fn watch_uri(path: &str, resource_version: Option<&str>) -> String {
    let mut uri = String::with_capacity(path.len() + 48);
    uri.push_str(path);
    uri.push(if path.contains('?') { '&' } else { '?' });
    uri.push_str("watch=true");
    if let Some(rv) = resource_version {
        uri.push_str("&resourceVersion=");
        uri.push_str(&encode_component(rv));
    }
    uri
}

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
