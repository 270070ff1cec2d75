//! One-shot request/response exchanges over a transport channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kmirror_core::{ConnectionParams, Problem};
use kmirror_transport::{ChannelEvent, OpenOptions, ResponseMeta, Transport};
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discover::DiscoveryCache;

/// Status reported for exchanges that ended with a transport problem.
pub const PROBLEM_STATUS: u16 = 999;

const JSON_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Structured value, sent as JSON unless it already is a string.
    Json(Value),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub body: Option<RequestBody>,
    /// Explicit endpoint; `None` uses the discovered one.
    pub params: Option<ConnectionParams>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self { method: method.into(), path: path.into(), body: None, params: None }
    }

    pub fn get(path: impl Into<String>) -> Self { Self::new("GET", path) }
    pub fn post(path: impl Into<String>) -> Self { Self::new("POST", path) }
    pub fn put(path: impl Into<String>) -> Self { Self::new("PUT", path) }
    pub fn patch(path: impl Into<String>) -> Self { Self::new("PATCH", path) }
    pub fn delete(path: impl Into<String>) -> Self { Self::new("DELETE", path) }

    pub fn json(mut self, value: Value) -> Self {
        self.body = Some(RequestBody::Json(value));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(text.into()));
        self
    }

    pub fn with_params(mut self, params: ConnectionParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Encoded body plus the content type it implies, if any.
    fn encode_body(&self) -> (Option<Bytes>, Option<&'static str>) {
        match &self.body {
            None => (None, None),
            Some(RequestBody::Json(Value::String(s))) | Some(RequestBody::Text(s)) => (Some(Bytes::from(s.clone())), None),
            Some(RequestBody::Json(v)) => (Some(Bytes::from(v.to_string())), Some(JSON_TYPE)),
        }
    }
}

/// Decoded response body. JSON bodies that fail to parse stay text.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
}

impl ResponseData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseData::Json(v) => Some(v),
            ResponseData::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseData::Text(s) => Some(s),
            ResponseData::Json(_) => None,
        }
    }

    pub(crate) fn decode(meta: &ResponseMeta, body: Bytes) -> Self {
        let is_json = meta
            .header("Content-Type")
            .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with(JSON_TYPE))
            .unwrap_or(false);
        if is_json {
            if let Ok(v) = serde_json::from_slice(&body) {
                return ResponseData::Json(v);
            }
        }
        ResponseData::Text(String::from_utf8_lossy(&body).into_owned())
    }

    fn message(&self) -> Option<&str> {
        self.as_json().and_then(|v| v.get("message")).and_then(|m| m.as_str()).filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub data: ResponseData,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

/// A failed exchange: either an HTTP error status or a transport problem
/// (then `status` is [`PROBLEM_STATUS`]).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct RequestError {
    pub status: u16,
    pub reason: String,
    pub message: String,
    pub problem: Option<Problem>,
    pub data: Option<ResponseData>,
}

impl RequestError {
    pub fn problem(problem: Problem) -> Self {
        Self {
            status: PROBLEM_STATUS,
            reason: problem.to_string(),
            message: problem.to_string(),
            problem: Some(problem),
            data: None,
        }
    }

    fn status(meta: ResponseMeta, data: ResponseData) -> Self {
        let message = error_message(meta.status, &meta.reason, &data);
        Self { status: meta.status, reason: meta.reason, message, problem: None, data: Some(data) }
    }

    pub fn is_cancelled(&self) -> bool {
        self.problem == Some(Problem::Cancelled)
    }
}

/// Prefer the server's `{"message": ...}` over the status line.
pub(crate) fn error_message(status: u16, reason: &str, data: &ResponseData) -> String {
    if let Some(m) = data.message() {
        m.to_string()
    } else if !reason.is_empty() {
        reason.to_string()
    } else {
        status.to_string()
    }
}

/// Issues single request/response exchanges.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    discovery: Option<Arc<DiscoveryCache>>,
}

impl RequestExecutor {
    /// Executor that resolves endpoints through `discovery` when a request
    /// carries no explicit params.
    pub fn new(transport: Arc<dyn Transport>, discovery: Arc<DiscoveryCache>) -> Self {
        Self { transport, discovery: Some(discovery) }
    }

    /// Executor without discovery; every request must carry params.
    pub fn direct(transport: Arc<dyn Transport>) -> Self {
        Self { transport, discovery: None }
    }

    pub async fn execute(&self, request: Request) -> Result<Response, RequestError> {
        self.execute_until(request, &CancellationToken::new()).await
    }

    /// Like [`execute`](Self::execute) but stops when `cancel` fires: a
    /// pending discovery is cancelled, an open channel is closed with
    /// `cancelled`.
    pub async fn execute_until(&self, request: Request, cancel: &CancellationToken) -> Result<Response, RequestError> {
        let t0 = std::time::Instant::now();
        let params = match request.params.clone() {
            Some(p) => p,
            None => self.resolve(cancel).await?,
        };
        if cancel.is_cancelled() {
            return Err(RequestError::problem(Problem::Cancelled));
        }

        let mut options = OpenOptions::new(&params, &request.method, &request.path);
        let (body, content_type) = request.encode_body();
        if let Some(ct) = content_type {
            if options.header("Content-Type").is_none() {
                options.headers.insert("Content-Type".into(), ct.into());
            }
        }
        let mut channel = self.transport.open(options);
        if let Some(body) = body {
            channel.send(body);
        }
        channel.done();

        let mut meta: Option<ResponseMeta> = None;
        let mut buf = BytesMut::new();
        let problem = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled(), if channel.is_open() => {
                    channel.close(Some(Problem::Cancelled));
                    continue;
                }
                ev = channel.recv() => ev,
            };
            match event {
                Some(ChannelEvent::Control(m)) => {
                    if meta.is_none() {
                        meta = Some(m);
                    }
                }
                Some(ChannelEvent::Message(data)) => buf.extend_from_slice(&data),
                Some(ChannelEvent::Close(opts)) => break opts.problem,
                None => break Some(Problem::Disconnected),
            }
        };

        let result = finish(meta, buf.freeze(), problem);
        let status = match &result {
            Ok(r) => r.status,
            Err(e) => e.status,
        };
        histogram!("request_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(method = %request.method, path = %request.path, status, took_ms = %t0.elapsed().as_millis(), "request done");
        result
    }

    /// Run the request in the background.
    pub fn spawn(&self, request: Request) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let _ = tx.send(this.execute_until(request, &token).await);
        });
        RequestHandle { rx, cancel }
    }

    async fn resolve(&self, cancel: &CancellationToken) -> Result<ConnectionParams, RequestError> {
        let Some(discovery) = self.discovery.as_ref() else {
            return Err(RequestError::problem(Problem::NotFound));
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                discovery.cancel_pending();
                Err(RequestError::problem(Problem::Cancelled))
            }
            res = discovery.resolve() => res.map(|d| d.params).map_err(|e| e.into_request_error()),
        }
    }
}

fn finish(meta: Option<ResponseMeta>, body: Bytes, problem: Option<Problem>) -> Result<Response, RequestError> {
    if let Some(problem) = problem {
        counter!("request_problems_total", 1u64, "problem" => problem.to_string());
        return Err(RequestError::problem(problem));
    }
    // a clean close without a response head
    let Some(meta) = meta else {
        return Err(RequestError::problem(Problem::ProtocolError));
    };
    let data = ResponseData::decode(&meta, body);
    if meta.status > 299 {
        return Err(RequestError::status(meta, data));
    }
    Ok(Response { status: meta.status, reason: meta.reason, headers: meta.headers, data })
}

/// A request running in the background.
pub struct RequestHandle {
    rx: oneshot::Receiver<Result<Response, RequestError>>,
    cancel: CancellationToken,
}

impl RequestHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn response(self) -> Result<Response, RequestError> {
        self.rx.await.unwrap_or_else(|_| Err(RequestError::problem(Problem::Terminated)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmirror_transport::MemoryTransport;
    use serde_json::json;

    fn executor() -> (Arc<MemoryTransport>, RequestExecutor) {
        let t = Arc::new(MemoryTransport::new());
        (t.clone(), RequestExecutor::direct(t))
    }

    fn params() -> ConnectionParams {
        ConnectionParams::plain(8080)
    }

    #[tokio::test]
    async fn json_response_is_parsed() {
        let (t, exec) = executor();
        let server = tokio::spawn(async move {
            let peer = t.accept().await.expect("peer");
            assert_eq!(peer.options.method, "GET");
            assert_eq!(peer.path(), "/api/v1/pods");
            peer.reply_json(200, &json!({"items": []}));
        });
        let resp = exec.execute(Request::get("/api/v1/pods").with_params(params())).await.expect("ok");
        server.await.expect("server");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.data, ResponseData::Json(json!({"items": []})));
        assert_eq!(resp.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn structured_body_is_sent_as_json() {
        let (t, exec) = executor();
        let server = tokio::spawn(async move {
            let mut peer = t.accept().await.expect("peer");
            let body = peer.request_body().await.expect("body");
            assert_eq!(peer.options.header("content-type"), Some("application/json"));
            assert_eq!(serde_json::from_slice::<Value>(&body).expect("json"), json!({"a": 1}));
            peer.respond(201, "Created");
            peer.message("done");
            peer.close(None);
        });
        let resp = exec.execute(Request::post("/x").json(json!({"a": 1})).with_params(params())).await.expect("ok");
        server.await.expect("server");
        assert_eq!(resp.status, 201);
        assert_eq!(resp.data, ResponseData::Text("done".into()));
    }

    #[tokio::test]
    async fn string_body_is_sent_verbatim() {
        let (t, exec) = executor();
        let server = tokio::spawn(async move {
            let mut peer = t.accept().await.expect("peer");
            let body = peer.request_body().await.expect("body");
            assert_eq!(&body[..], b"raw");
            assert_eq!(peer.options.header("content-type"), None);
            peer.reply_json(200, &json!({}));
        });
        exec.execute(Request::put("/x").json(Value::String("raw".into())).with_params(params())).await.expect("ok");
        server.await.expect("server");
    }

    #[tokio::test]
    async fn error_status_prefers_server_message() {
        let (t, exec) = executor();
        tokio::spawn(async move {
            let peer = t.accept().await.expect("peer");
            peer.reply_json(404, &json!({"kind": "Status", "message": "pods \"x\" not found"}));
        });
        let err = exec.execute(Request::get("/x").with_params(params())).await.expect_err("404");
        assert_eq!(err.status, 404);
        assert_eq!(err.message, "pods \"x\" not found");
        assert_eq!(err.problem, None);
    }

    #[tokio::test]
    async fn error_status_falls_back_to_reason() {
        let (t, exec) = executor();
        tokio::spawn(async move {
            let peer = t.accept().await.expect("peer");
            peer.respond_with(ResponseMeta::new(500, "Internal Server Error").with_header("Content-Type", "application/json"));
            peer.message("{broken");
            peer.close(None);
        });
        let err = exec.execute(Request::get("/x").with_params(params())).await.expect_err("500");
        assert_eq!(err.message, "Internal Server Error");
        assert_eq!(err.data, Some(ResponseData::Text("{broken".into())));
    }

    #[tokio::test]
    async fn transport_problem_is_status_999() {
        let (t, exec) = executor();
        tokio::spawn(async move {
            let peer = t.accept().await.expect("peer");
            peer.close(Some(Problem::AccessDenied));
        });
        let err = exec.execute(Request::get("/x").with_params(params())).await.expect_err("problem");
        assert_eq!(err.status, PROBLEM_STATUS);
        assert_eq!(err.problem, Some(Problem::AccessDenied));
    }

    #[tokio::test]
    async fn cancel_closes_open_channel() {
        let (t, exec) = executor();
        let handle = exec.spawn(Request::get("/slow").with_params(params()));
        let mut peer = t.accept().await.expect("peer");
        assert_eq!(peer.request_body().await, Ok(Bytes::new()));
        handle.cancel();
        assert_eq!(peer.command().await, Some(kmirror_transport::ChannelCommand::Close(Some(Problem::Cancelled))));
        let err = handle.response().await.expect_err("cancelled");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn direct_executor_needs_params() {
        let (_t, exec) = executor();
        let err = exec.execute(Request::get("/x")).await.expect_err("no params");
        assert_eq!(err.problem, Some(Problem::NotFound));
    }
}
