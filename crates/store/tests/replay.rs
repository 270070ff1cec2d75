#![forbid(unsafe_code)]

use kmirror_core::{Frame, FrameType, Object};
use kmirror_store::MirrorBuilder;

fn obj(uid: &str, name: &str, ns: Option<&str>, ts: &str) -> Object {
    let mut meta = serde_json::json!({
        "name": name,
        "uid": uid,
        "creationTimestamp": ts,
    });
    if let Some(ns) = ns { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    Object::try_from(serde_json::json!({ "kind": "Pod", "metadata": meta })).expect("valid object")
}

#[test]
fn replay_basic_sequence() {
    let mut mb = MirrorBuilder::new();

    let frames = vec![
        Frame::new(FrameType::Added, obj("1", "a", Some("ns"), "2020-01-01T00:00:00Z")),
        // duplicate add; builder just replaces
        Frame::new(FrameType::Added, obj("1", "a", Some("ns"), "2020-01-01T00:00:00Z")),
        Frame::new(FrameType::Added, obj("2", "b", None, "2020-01-01T00:00:01Z")),
        Frame::new(FrameType::Modified, obj("1", "a2", Some("ns"), "2020-01-01T00:00:00Z")),
        Frame::deleted(obj("2", "b", None, "2020-01-01T00:00:01Z")),
    ];

    // two batches, like ingest would
    mb.apply(frames[..2].to_vec());
    let snap1 = mb.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.items.len(), 1);
    assert_eq!(snap1.items[0].name, "a");
    assert_eq!(snap1.items[0].creation_ts, 1_577_836_800);

    mb.apply(frames[2..].to_vec());
    let snap2 = mb.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.items.len(), 1);
    assert_eq!(snap2.items[0].name, "a2");
    assert_eq!(snap2.items[0].namespace.as_deref(), Some("ns"));
}

#[test]
fn empty_batch_keeps_epoch() {
    let mut mb = MirrorBuilder::new();
    mb.apply(vec![Frame::new(FrameType::Added, obj("1", "a", None, "bogus"))]);
    mb.apply(Vec::new());
    let snap = mb.freeze();
    assert_eq!(snap.epoch, 1);
    assert_eq!(snap.items[0].creation_ts, 0);
}

#[test]
fn snapshot_sorted_by_namespace_then_name() {
    let mut mb = MirrorBuilder::new();
    mb.apply(vec![
        Frame::new(FrameType::Added, obj("3", "z", Some("b"), "")),
        Frame::new(FrameType::Added, obj("2", "y", Some("a"), "")),
        Frame::new(FrameType::Added, obj("1", "x", Some("b"), "")),
        Frame::new(FrameType::Added, obj("4", "w", None, "")),
    ]);
    let snap = mb.freeze();
    let names: Vec<&str> = snap.items.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["w", "y", "x", "z"]);
    assert_eq!(snap.get("2").map(|i| i.kind.as_str()), Some("Pod"));
}
