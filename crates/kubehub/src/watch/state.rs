//! Per-subscription watch bookkeeping: cursor, mirrored objects, and the
//! snapshot used to find objects that vanished during a full reload.

use bytes::BytesMut;
use kmirror_core::{Frame, FrameType, Object};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::{debug, warn};

/// What a single stream line did to the state.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Valid frame, already applied.
    Frame(Frame),
    /// Invalid object, dropped without touching the state.
    Dropped,
    /// Nothing to do (blank line, unknown type, stale error).
    Ignored,
    /// The line is not a frame; the stream framing can't be trusted.
    Desync(String),
    /// The server rejected the cursor; it has been cleared.
    Expired,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type", default)]
    frame_type: Option<String>,
    #[serde(default)]
    object: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct WatchState {
    last_resource_version: Option<String>,
    objects: FxHashMap<String, Object>,
    previous: Option<FxHashMap<String, Object>>,
    loaded: bool,
    stopping: bool,
}

impl WatchState {
    pub fn new() -> Self { Self::default() }

    pub fn last_resource_version(&self) -> Option<&str> { self.last_resource_version.as_deref() }

    pub fn objects(&self) -> &FxHashMap<String, Object> { &self.objects }

    pub fn is_reloading(&self) -> bool { self.previous.is_some() }

    pub fn is_loaded(&self) -> bool { self.loaded }

    pub fn is_stopping(&self) -> bool { self.stopping }

    pub fn stop(&mut self) { self.stopping = true; }

    /// Prepare for a new request. Returns `true` for a full list, which
    /// moves the current objects into the reload snapshot.
    pub fn begin_request(&mut self) -> bool {
        if self.last_resource_version.is_some() {
            return false;
        }
        let current = std::mem::take(&mut self.objects);
        match self.previous.as_mut() {
            // the earlier reload never settled: the caller still knows about both
            Some(prev) => prev.extend(current),
            None => self.previous = Some(current),
        }
        true
    }

    /// Apply one complete stream line.
    pub fn apply_line(&mut self, line: &[u8]) -> LineOutcome {
        if line.iter().all(u8::is_ascii_whitespace) {
            return LineOutcome::Ignored;
        }
        let wire: WireFrame = match serde_json::from_slice(line) {
            Ok(f) => f,
            Err(e) => return LineOutcome::Desync(e.to_string()),
        };
        let Some(value) = wire.object else {
            warn!(frame_type = ?wire.frame_type, "watch frame without object");
            return LineOutcome::Ignored;
        };
        let frame_type = match wire.frame_type.as_deref().and_then(FrameType::from_wire) {
            Some(t) => t,
            None => {
                warn!(frame_type = ?wire.frame_type, "unknown watch frame type");
                return LineOutcome::Ignored;
            }
        };
        if frame_type == FrameType::Error {
            return match self.last_resource_version.take() {
                Some(rv) => {
                    debug!(resource_version = %rv, error = %value, "watch cursor rejected");
                    LineOutcome::Expired
                }
                None => LineOutcome::Ignored,
            };
        }
        let object = match Object::try_from(value) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "invalid kube object");
                return LineOutcome::Dropped;
            }
        };
        if let Some(rv) = object.resource_version() {
            self.last_resource_version = Some(rv.to_string());
        }
        let uid = object.uid().to_string();
        if frame_type == FrameType::Deleted {
            self.objects.remove(&uid);
            if let Some(prev) = self.previous.as_mut() {
                prev.remove(&uid);
            }
        } else {
            self.objects.insert(uid, object.clone());
        }
        LineOutcome::Frame(Frame::new(frame_type, object))
    }

    /// The stream went quiet. Returns synthetic deletes for objects that
    /// were present before the reload but not after it, and whether this
    /// is the first settle of the subscription.
    pub fn settle(&mut self) -> (Vec<Frame>, bool) {
        let mut gone: Vec<Object> = match self.previous.take() {
            Some(prev) => prev.into_iter().filter(|(uid, _)| !self.objects.contains_key(uid)).map(|(_, o)| o).collect(),
            None => Vec::new(),
        };
        gone.sort_by(|a, b| a.uid().cmp(b.uid()));
        let first = !self.loaded;
        self.loaded = true;
        (gone.into_iter().map(Frame::deleted).collect(), first)
    }
}

/// Splits a byte stream into lines, holding back the unfinished tail.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn push(&mut self, data: &[u8]) -> Vec<BytesMut> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(pos) = self.buf[self.scanned..].iter().position(|b| *b == b'\n').map(|p| p + self.scanned) {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            out.push(line);
            self.scanned = 0;
        }
        self.scanned = self.buf.len();
        out
    }

    /// Bytes of the unfinished trailing line.
    pub fn pending(&self) -> usize { self.buf.len() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(t: &str, uid: &str, rv: &str) -> Vec<u8> {
        json!({"type": t, "object": {"kind": "Pod", "metadata": {"uid": uid, "resourceVersion": rv, "name": uid}}})
            .to_string()
            .into_bytes()
    }

    fn uids(state: &WatchState) -> Vec<String> {
        let mut v: Vec<String> = state.objects().keys().cloned().collect();
        v.sort();
        v
    }

    #[test]
    fn objects_follow_latest_frame_per_uid() {
        let mut s = WatchState::new();
        assert!(s.begin_request());
        for (t, uid, rv) in [("ADDED", "a", "1"), ("ADDED", "b", "2"), ("MODIFIED", "a", "3"), ("DELETED", "b", "4"), ("ADDED", "c", "5")] {
            assert!(matches!(s.apply_line(&line(t, uid, rv)), LineOutcome::Frame(_)));
        }
        assert_eq!(uids(&s), vec!["a", "c"]);
        assert_eq!(s.last_resource_version(), Some("5"));
        assert_eq!(s.objects()["a"].resource_version(), Some("3"));
    }

    #[test]
    fn replaying_added_is_idempotent() {
        let mut s = WatchState::new();
        s.apply_line(&line("ADDED", "a", "1"));
        let before = s.objects().clone();
        s.apply_line(&line("ADDED", "a", "1"));
        assert_eq!(s.objects(), &before);
    }

    #[test]
    fn invalid_objects_do_not_move_cursor() {
        let mut s = WatchState::new();
        s.apply_line(&line("ADDED", "a", "7"));
        let no_kind = json!({"type": "ADDED", "object": {"metadata": {"uid": "x", "resourceVersion": "9"}}}).to_string();
        assert_eq!(s.apply_line(no_kind.as_bytes()), LineOutcome::Dropped);
        let no_uid = json!({"type": "ADDED", "object": {"kind": "Pod", "metadata": {"resourceVersion": "9"}}}).to_string();
        assert_eq!(s.apply_line(no_uid.as_bytes()), LineOutcome::Dropped);
        assert_eq!(s.last_resource_version(), Some("7"));
        assert_eq!(uids(&s), vec!["a"]);
    }

    #[test]
    fn error_frame_clears_cursor_only_when_in_use() {
        let mut s = WatchState::new();
        let err = json!({"type": "ERROR", "object": {"kind": "Status", "code": 410}}).to_string();
        assert_eq!(s.apply_line(err.as_bytes()), LineOutcome::Ignored);
        s.apply_line(&line("ADDED", "a", "3"));
        assert_eq!(s.apply_line(err.as_bytes()), LineOutcome::Expired);
        assert_eq!(s.last_resource_version(), None);
        assert!(s.begin_request());
    }

    #[test]
    fn garbage_and_blank_lines() {
        let mut s = WatchState::new();
        assert!(matches!(s.apply_line(b"{not json"), LineOutcome::Desync(_)));
        assert_eq!(s.apply_line(b"  \r"), LineOutcome::Ignored);
        assert_eq!(s.apply_line(br#"{"type": "ADDED"}"#), LineOutcome::Ignored);
        assert_eq!(s.apply_line(br#"{"type": "BOOKMARK", "object": {}}"#), LineOutcome::Ignored);
    }

    #[test]
    fn full_reload_emits_synthetic_deletes_once() {
        let mut s = WatchState::new();
        s.begin_request();
        for uid in ["a", "b", "c"] {
            s.apply_line(&line("ADDED", uid, "1"));
        }
        let (deletes, first) = s.settle();
        assert!(deletes.is_empty());
        assert!(first);

        // cursor lost, relist only sees "b"
        s.apply_line(json!({"type": "ERROR", "object": {}}).to_string().as_bytes());
        assert!(s.begin_request());
        assert!(s.is_reloading());
        s.apply_line(&line("ADDED", "b", "2"));
        let (deletes, first) = s.settle();
        assert!(!first);
        let gone: Vec<&str> = deletes.iter().map(|f| f.object.uid()).collect();
        assert_eq!(gone, vec!["a", "c"]);
        assert!(deletes.iter().all(|f| f.frame_type == FrameType::Deleted));
        assert!(!s.is_reloading());
        assert!(s.settle().0.is_empty());
    }

    #[test]
    fn resumed_unsettled_reload_keeps_snapshot() {
        let mut s = WatchState::new();
        s.begin_request();
        s.apply_line(&line("ADDED", "a", "1"));
        s.apply_line(&line("ADDED", "b", "2"));
        s.settle();

        // relist starts, sees "a", then the stream drops before settling
        s.apply_line(json!({"type": "ERROR", "object": {}}).to_string().as_bytes());
        assert!(s.begin_request());
        s.apply_line(&line("ADDED", "a", "3"));
        // resume with the cursor from the partial relist
        assert!(!s.begin_request());
        assert!(s.is_reloading());
        s.apply_line(&line("MODIFIED", "a", "4"));
        let (deletes, _) = s.settle();
        let gone: Vec<&str> = deletes.iter().map(|f| f.object.uid()).collect();
        assert_eq!(gone, vec!["b"]);
    }

    #[test]
    fn interrupted_reloads_merge_snapshots() {
        let mut s = WatchState::new();
        s.begin_request();
        s.apply_line(&line("ADDED", "a", "1"));
        s.settle();
        s.apply_line(json!({"type": "ERROR", "object": {}}).to_string().as_bytes());
        s.begin_request();
        // "n" shows up during the unsettled reload, then the cursor is lost again
        s.apply_line(&line("ADDED", "n", "2"));
        s.apply_line(json!({"type": "ERROR", "object": {}}).to_string().as_bytes());
        assert!(s.begin_request());
        let (deletes, _) = s.settle();
        let gone: Vec<&str> = deletes.iter().map(|f| f.object.uid()).collect();
        assert_eq!(gone, vec!["a", "n"]);
    }

    #[test]
    fn delete_during_reload_is_not_repeated() {
        let mut s = WatchState::new();
        s.begin_request();
        s.apply_line(&line("ADDED", "a", "1"));
        s.settle();
        s.apply_line(json!({"type": "ERROR", "object": {}}).to_string().as_bytes());
        s.begin_request();
        s.apply_line(&line("DELETED", "a", "2"));
        assert!(s.settle().0.is_empty());
    }

    #[test]
    fn decoder_holds_back_partial_line() {
        let mut d = LineDecoder::default();
        assert!(d.push(b"{\"a\":").is_empty());
        assert_eq!(d.pending(), 5);
        let lines = d.push(b"1}\n{\"b\":2}\n{\"c\"");
        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[0][..], b"{\"a\":1}");
        assert_eq!(&lines[1][..], b"{\"b\":2}");
        assert_eq!(d.pending(), 4);
    }

    #[test]
    fn decoder_joins_line_split_across_many_chunks() {
        let mut d = LineDecoder::default();
        let full = line("ADDED", "big", "1");
        for chunk in full.chunks(3) {
            assert!(d.push(chunk).is_empty());
        }
        assert_eq!(d.pending(), full.len());
        let lines = d.push(b"\n{\"tail\"");
        assert_eq!(lines.len(), 1);
        assert_eq!(&lines[0][..], &full[..]);
        assert_eq!(d.pending(), 7);
        let lines = d.push(b":1}\n");
        assert_eq!(&lines[0][..], b"{\"tail\":1}");
        assert_eq!(d.pending(), 0);
    }
}
