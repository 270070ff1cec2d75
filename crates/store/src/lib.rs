//! kmirror store: an in-RAM read model fed by watch frame batches.
//!
//! Writers send batches into [`spawn_ingest`]; readers load immutable
//! [`MirrorSnapshot`]s through a [`MirrorHandle`] without locking.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use kmirror_core::{Frame, FrameType, Object};
use metrics::gauge;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Light projection of a mirrored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorItem {
    pub uid: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub resource_version: Option<String>,
    /// Seconds since epoch; 0 when absent or unparsable.
    pub creation_ts: i64,
}

impl MirrorItem {
    pub fn from_object(o: &Object) -> Self {
        let creation_ts = o
            .as_value()
            .get("metadata")
            .and_then(|m| m.get("creationTimestamp"))
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        Self {
            uid: o.uid().to_string(),
            kind: o.kind().to_string(),
            namespace: o.namespace().map(str::to_string),
            name: o.name().unwrap_or_default().to_string(),
            resource_version: o.resource_version().map(str::to_string),
            creation_ts,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorSnapshot {
    pub epoch: u64,
    /// Sorted by namespace, then name.
    pub items: Vec<MirrorItem>,
}

impl MirrorSnapshot {
    pub fn get(&self, uid: &str) -> Option<&MirrorItem> {
        self.items.iter().find(|i| i.uid == uid)
    }
}

/// Coalesces frames per uid, keeping first-seen order and the latest frame.
#[derive(Default)]
pub struct Coalescer {
    map: FxHashMap<String, Frame>,
    order: VecDeque<String>,
}

impl Coalescer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, f: Frame) {
        let uid = f.object.uid().to_string();
        if !self.map.contains_key(&uid) {
            self.order.push_back(uid.clone());
        }
        self.map.insert(uid, f);
    }

    pub fn drain_ready(&mut self) -> Vec<Frame> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(f) = self.map.remove(&uid) {
                out.push(f);
            }
        }
        out
    }
}

/// Builds snapshots from frame batches.
#[derive(Default)]
pub struct MirrorBuilder {
    epoch: u64,
    items: FxHashMap<String, MirrorItem>,
}

impl MirrorBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Apply a batch by uid. An empty batch changes nothing.
    pub fn apply(&mut self, batch: Vec<Frame>) {
        if batch.is_empty() {
            return;
        }
        for f in batch {
            match f.frame_type {
                FrameType::Added | FrameType::Modified => {
                    let item = MirrorItem::from_object(&f.object);
                    self.items.insert(item.uid.clone(), item);
                }
                FrameType::Deleted => {
                    self.items.remove(f.object.uid());
                }
                FrameType::Error => {}
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Advance the epoch without changes, marking a settled load.
    pub fn bump_epoch(&mut self) {
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<MirrorSnapshot> {
        let mut items: Vec<MirrorItem> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.namespace.cmp(&b.namespace).then_with(|| a.name.cmp(&b.name)).then_with(|| a.uid.cmp(&b.uid)));
        Arc::new(MirrorSnapshot { epoch: self.epoch, items })
    }
}

/// Read side of an ingest loop.
#[derive(Clone)]
pub struct MirrorHandle {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl MirrorHandle {
    pub fn current(&self) -> Arc<MirrorSnapshot> { self.snap.load_full() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }
}

/// Spawn an ingest loop consuming frame batches. An empty batch publishes
/// right away, even with nothing pending; otherwise changes go out on the
/// next 8ms tick.
pub fn spawn_ingest() -> (mpsc::UnboundedSender<Vec<Frame>>, MirrorHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<Frame>>();
    let snap = Arc::new(ArcSwap::from_pointee(MirrorSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let snap_clone = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut builder = MirrorBuilder::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        let publish = |coalescer: &mut Coalescer, builder: &mut MirrorBuilder, flush: bool| {
            let batch = coalescer.drain_ready();
            if !batch.is_empty() {
                builder.apply(batch);
            } else if flush {
                builder.bump_epoch();
            } else {
                return;
            }
            let next = builder.freeze();
            let epoch = next.epoch;
            gauge!("mirror_objects", next.items.len() as f64);
            snap_clone.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(batch) if batch.is_empty() => publish(&mut coalescer, &mut builder, true),
                    Some(batch) => {
                        for f in batch {
                            coalescer.push(f);
                        }
                    }
                    None => {
                        debug!("frame channel closed; draining and exiting ingest loop");
                        publish(&mut coalescer, &mut builder, false);
                        break;
                    }
                },
                _ = ticker.tick() => publish(&mut coalescer, &mut builder, false),
            }
        }
        info!(objects = builder.len(), "ingest loop stopped");
    });

    (tx, MirrorHandle { snap, epoch_rx })
}
