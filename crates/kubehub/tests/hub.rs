use std::sync::Arc;

use kmirror_config::StaticConfig;
use kmirror_core::{ConnectionParams, Problem};
use kmirror_kubehub::{ConnectionOrigin, EndpointProbe, KubeHub, Request, WatchConfig, WatchError, DISCOVERY_PATH};
use kmirror_transport::MemoryTransport;
use serde_json::json;

fn hub(t: &Arc<MemoryTransport>, probe: EndpointProbe) -> KubeHub {
    KubeHub::new(t.clone(), probe).with_watch_config(WatchConfig::default())
}

#[tokio::test]
async fn requests_use_discovered_endpoint() {
    let t = Arc::new(MemoryTransport::new());
    let cfg = json!({
        "current-context": "x",
        "contexts": [{"name": "x", "context": {"user": "u", "cluster": "c"}}],
        "users": [{"name": "u", "user": {"token": "abc"}}],
        "clusters": [{"name": "c", "cluster": {"server": "http://kube:8001"}}],
    });
    let hub = hub(&t, EndpointProbe::new(t.clone()).with_config(Arc::new(StaticConfig::from_value(&cfg))));

    let server = {
        let t = t.clone();
        tokio::spawn(async move {
            let probe = t.accept().await.expect("probe");
            assert_eq!(probe.path(), DISCOVERY_PATH);
            probe.reply_json(200, &json!({"versions": ["v1"]}));

            let req = t.accept().await.expect("request");
            assert_eq!(req.path(), "/api/v1/namespaces");
            assert_eq!(req.options.address.as_deref(), Some("kube"));
            assert_eq!(req.options.header("authorization"), Some("Bearer abc"));
            req.reply_json(200, &json!({"kind": "NamespaceList", "items": []}));
        })
    };

    let resp = hub.request(Request::get("/api/v1/namespaces")).await.expect("response");
    server.await.expect("server");
    assert_eq!(resp.data.as_json().and_then(|v| v.get("kind")), Some(&json!("NamespaceList")));
    let found = hub.discovery().cached().expect("memoized");
    assert_eq!(found.origin, ConnectionOrigin::Config(kmirror_config::ConfigOrigin::SessionData));
}

#[tokio::test]
async fn cancelling_during_discovery_cancels_probe() {
    let t = Arc::new(MemoryTransport::new());
    let hub = hub(&t, EndpointProbe::new(t.clone()));
    let handle = hub.spawn_request(Request::get("/api/v1/pods"));
    let _probe = t.accept().await.expect("probe");
    handle.cancel();
    let err = handle.response().await.expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(hub.discovery().cached().is_none());
}

#[tokio::test]
async fn watch_stops_when_discovery_fails() {
    let t = Arc::new(MemoryTransport::new());
    let probe = EndpointProbe::new(t.clone()).with_fallbacks(vec![ConnectionParams::plain(8080)]);
    let hub = hub(&t, probe);
    let (_rx, handle) = hub.watch_stream("/api/v1/pods");

    t.accept().await.expect("probe").close(Some(Problem::NotFound));

    match handle.stopped().await {
        Some(WatchError::Discovery { path, problem, message }) => {
            assert_eq!(path, "/api/v1/pods");
            assert_eq!(problem, Problem::NotFound);
            assert!(message.starts_with("no running API server found"), "{}", message);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(handle.loaded().await.is_err());
}

#[tokio::test]
async fn watch_stream_delivers_batches() {
    let t = Arc::new(MemoryTransport::new());
    let probe = EndpointProbe::new(t.clone()).with_fallbacks(vec![ConnectionParams::plain(8080)]);
    let hub = hub(&t, probe);
    let (mut rx, handle) = hub.watch_stream("/api/v1/services");

    t.accept().await.expect("probe").reply_json(200, &json!({"versions": ["v1"]}));
    let peer = t.accept().await.expect("watch");
    assert_eq!(peer.path(), "/api/v1/services?watch=true");
    peer.respond(200, "OK");
    peer.message("{\"type\":\"ADDED\",\"object\":{\"kind\":\"Service\",\"metadata\":{\"uid\":\"s1\",\"resourceVersion\":\"1\"}}}\n");

    let batch = rx.recv().await.expect("batch");
    assert_eq!(batch[0].object.kind(), "Service");
    handle.loaded().await.expect("loaded");
    handle.cancel(None);
    assert_eq!(handle.stopped().await, None);
}

#[tokio::test]
async fn watch_reports_fatal_discovery_problem() {
    let t = Arc::new(MemoryTransport::new());
    let probe = EndpointProbe::new(t.clone()).with_fallbacks(vec![ConnectionParams::plain(8080)]);
    let hub = hub(&t, probe);
    let (_rx, handle) = hub.watch_stream("/api/v1/pods");

    t.accept().await.expect("probe").close(Some(Problem::ProtocolError));

    let err = handle.stopped().await.expect("terminal error");
    assert!(matches!(err, WatchError::Discovery { .. }));
    assert_eq!(err.problem(), Some(Problem::ProtocolError));
    assert_eq!(err.status(), 999);
}

#[tokio::test]
async fn cancelling_watch_during_discovery() {
    let t = Arc::new(MemoryTransport::new());
    let hub = hub(&t, EndpointProbe::new(t.clone()));
    let (mut rx, handle) = hub.watch_stream("/api/v1/pods");

    let _probe = t.accept().await.expect("probe");
    handle.cancel(Some(Problem::Terminated));

    assert_eq!(handle.stopped().await, None);
    assert_eq!(handle.loaded().await, Err(WatchError::Cancelled(Problem::Terminated)));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn forced_discovery_does_not_fail_pending_requests() {
    let t = Arc::new(MemoryTransport::new());
    let probe = EndpointProbe::new(t.clone()).with_fallbacks(vec![ConnectionParams::plain(8080)]);
    let hub = hub(&t, probe);
    let request = hub.spawn_request(Request::get("/api/v1/pods"));
    let _first = t.accept().await.expect("first probe");

    let forced = tokio::spawn({
        let hub = hub.clone();
        async move { hub.discover(true).await }
    });
    t.accept().await.expect("forced probe").reply_json(200, &json!({"versions": ["v1"]}));
    assert_eq!(forced.await.expect("join").expect("forced").versions, vec!["v1".to_string()]);

    let req = t.accept().await.expect("request");
    assert_eq!(req.path(), "/api/v1/pods");
    req.reply_json(200, &json!({"kind": "PodList", "items": []}));
    let resp = request.response().await.expect("response");
    assert_eq!(resp.status, 200);
}
