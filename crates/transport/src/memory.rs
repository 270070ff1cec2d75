//! In-memory transport: every opened channel is handed to whoever plays the
//! remote side via [`MemoryTransport::accept`].

use bytes::Bytes;
use kmirror_core::Problem;
use tokio::sync::{mpsc, Mutex};

use crate::{Channel, ChannelCommand, ChannelPeer, OpenOptions, ResponseMeta, Transport};

pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<MemoryPeer>,
    rx: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl Default for MemoryTransport {
    fn default() -> Self { Self::new() }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Wait for the next opened channel.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.rx.lock().await.recv().await
    }

    /// Next opened channel if one is already queued.
    pub fn try_accept(&self) -> Option<MemoryPeer> {
        self.rx.try_lock().ok().and_then(|mut rx| rx.try_recv().ok())
    }
}

impl Transport for MemoryTransport {
    fn open(&self, options: OpenOptions) -> Channel {
        let (channel, peer) = Channel::pair();
        let _ = self.tx.send(MemoryPeer { options, peer });
        channel
    }
}

/// Remote end of one in-memory channel.
pub struct MemoryPeer {
    pub options: OpenOptions,
    peer: ChannelPeer,
}

impl MemoryPeer {
    pub fn path(&self) -> &str { &self.options.path }

    pub fn respond(&self, status: u16, reason: &str) {
        self.peer.control(ResponseMeta::new(status, reason));
    }

    pub fn respond_with(&self, meta: ResponseMeta) {
        self.peer.control(meta);
    }

    pub fn message(&self, data: impl Into<Bytes>) {
        self.peer.message(data);
    }

    pub fn close(self, problem: Option<Problem>) {
        self.peer.close(problem);
    }

    /// Full JSON exchange: head, body, clean close.
    pub fn reply_json(self, status: u16, body: &serde_json::Value) {
        let reason = if status < 300 { "OK" } else { "Error" };
        self.peer.control(ResponseMeta::new(status, reason).with_header("Content-Type", "application/json"));
        self.peer.message(body.to_string());
        self.peer.close(None);
    }

    pub async fn request_body(&mut self) -> Result<Bytes, Option<Problem>> {
        self.peer.request_body().await
    }

    pub async fn command(&mut self) -> Option<ChannelCommand> {
        self.peer.command().await
    }

    /// True once the owner dropped the channel.
    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelEvent;
    use kmirror_core::ConnectionParams;

    #[tokio::test]
    async fn accept_sees_open_options() {
        let t = MemoryTransport::new();
        let mut ch = t.open(OpenOptions::new(&ConnectionParams::plain(8080), "GET", "/api"));
        let peer = t.accept().await.expect("peer");
        assert_eq!(peer.path(), "/api");
        assert_eq!(peer.options.port, 8080);
        peer.reply_json(200, &serde_json::json!({"versions": ["v1"]}));
        assert!(matches!(ch.recv().await, Some(ChannelEvent::Control(m)) if m.status == 200));
    }
}
