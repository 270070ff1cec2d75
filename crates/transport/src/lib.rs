//! kmirror transport: the channel contract the request/watch layers speak.
//!
//! A [`Channel`] carries exactly one HTTP-style exchange. The transport side
//! ([`ChannelPeer`]) emits one `Control` with the response head, zero or more
//! `Message` chunks and exactly one `Close`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use kmirror_core::{ConnectionParams, Problem, TlsConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{MemoryPeer, MemoryTransport};

/// Everything needed to open one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub address: Option<String>,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub headers: BTreeMap<String, String>,
    pub method: String,
    pub path: String,
}

impl OpenOptions {
    pub fn new(params: &ConnectionParams, method: &str, path: &str) -> Self {
        Self {
            address: params.address.clone(),
            port: params.port,
            tls: params.tls.clone(),
            headers: params.headers.clone(),
            method: method.to_string(),
            path: path.to_string(),
        }
    }

    /// Connection parameters this channel was opened with.
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            address: self.address.clone(),
            port: self.port,
            tls: self.tls.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

/// Response head delivered by a `Control` event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
}

impl ResponseMeta {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), headers: BTreeMap::new() }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOptions {
    pub problem: Option<Problem>,
}

impl CloseOptions {
    pub fn clean() -> Self { Self { problem: None } }

    pub fn problem(problem: Problem) -> Self { Self { problem: Some(problem) } }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Control(ResponseMeta),
    Message(Bytes),
    Close(CloseOptions),
}

/// Requests flowing from the channel owner to the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Send(Bytes),
    /// No more request body.
    Done,
    Close(Option<Problem>),
}

/// Opens channels. Opening never fails synchronously: connection failures
/// arrive as a `Close` carrying a problem.
pub trait Transport: Send + Sync {
    fn open(&self, options: OpenOptions) -> Channel;
}

enum ChannelState {
    Open,
    /// Closed locally; the matching `Close` event has not been handed out yet.
    Closing(CloseOptions),
    Closed,
}

/// Owner side of a channel.
pub struct Channel {
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: ChannelState,
}

impl Channel {
    /// Create both ends of a channel.
    pub fn pair() -> (Channel, ChannelPeer) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let channel = Channel { events: event_rx, commands: cmd_tx, state: ChannelState::Open };
        let peer = ChannelPeer { events: event_tx, commands: cmd_rx };
        (channel, peer)
    }

    /// Next event. Yields exactly one `Close`, then `None`.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        match std::mem::replace(&mut self.state, ChannelState::Closed) {
            ChannelState::Closed => return None,
            ChannelState::Closing(opts) => return Some(ChannelEvent::Close(opts)),
            ChannelState::Open => self.state = ChannelState::Open,
        }
        match self.events.recv().await {
            Some(ChannelEvent::Close(opts)) => {
                self.state = ChannelState::Closed;
                Some(ChannelEvent::Close(opts))
            }
            Some(ev) => Some(ev),
            None => {
                // peer vanished without saying goodbye
                self.state = ChannelState::Closed;
                Some(ChannelEvent::Close(CloseOptions::problem(Problem::Disconnected)))
            }
        }
    }

    pub fn send(&self, data: impl Into<Bytes>) {
        if self.is_open() {
            let _ = self.commands.send(ChannelCommand::Send(data.into()));
        }
    }

    pub fn done(&self) {
        if self.is_open() {
            let _ = self.commands.send(ChannelCommand::Done);
        }
    }

    /// Close locally. The next `recv` reports the close with `problem`.
    pub fn close(&mut self, problem: Option<Problem>) {
        if !self.is_open() {
            return;
        }
        let _ = self.commands.send(ChannelCommand::Close(problem.clone()));
        self.state = ChannelState::Closing(CloseOptions { problem });
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ChannelState::Open)
    }
}

/// Transport side of a channel.
pub struct ChannelPeer {
    events: mpsc::UnboundedSender<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
}

impl ChannelPeer {
    pub fn control(&self, meta: ResponseMeta) {
        let _ = self.events.send(ChannelEvent::Control(meta));
    }

    pub fn message(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(ChannelEvent::Message(data.into()));
    }

    pub fn close(self, problem: Option<Problem>) {
        let _ = self.events.send(ChannelEvent::Close(CloseOptions { problem }));
    }

    /// Next command from the owner; `None` once the owner dropped the channel.
    pub async fn command(&mut self) -> Option<ChannelCommand> {
        self.commands.recv().await
    }

    /// Collect the request body up to `Done`. A local close (or a dropped
    /// owner) before `Done` yields the close problem instead.
    pub async fn request_body(&mut self) -> Result<Bytes, Option<Problem>> {
        let mut body = BytesMut::new();
        loop {
            match self.commands.recv().await {
                Some(ChannelCommand::Send(data)) => body.extend_from_slice(&data),
                Some(ChannelCommand::Done) => return Ok(body.freeze()),
                Some(ChannelCommand::Close(problem)) => return Err(problem),
                None => return Err(Some(Problem::Disconnected)),
            }
        }
    }

    /// True once the owner side dropped its channel.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

fn lookup_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_then_single_close() {
        let (mut ch, peer) = Channel::pair();
        peer.control(ResponseMeta::new(200, "OK"));
        peer.message(Bytes::from_static(b"abc"));
        peer.close(None);
        assert!(matches!(ch.recv().await, Some(ChannelEvent::Control(m)) if m.status == 200));
        assert_eq!(ch.recv().await, Some(ChannelEvent::Message(Bytes::from_static(b"abc"))));
        assert_eq!(ch.recv().await, Some(ChannelEvent::Close(CloseOptions::clean())));
        assert_eq!(ch.recv().await, None);
    }

    #[tokio::test]
    async fn local_close_is_reported_once() {
        let (mut ch, mut peer) = Channel::pair();
        ch.close(Some(Problem::Cancelled));
        assert!(!ch.is_open());
        // a second close is a no-op
        ch.close(None);
        assert_eq!(ch.recv().await, Some(ChannelEvent::Close(CloseOptions::problem(Problem::Cancelled))));
        assert_eq!(ch.recv().await, None);
        assert_eq!(peer.command().await, Some(ChannelCommand::Close(Some(Problem::Cancelled))));
    }

    #[tokio::test]
    async fn dropped_peer_reads_as_disconnect() {
        let (mut ch, peer) = Channel::pair();
        drop(peer);
        assert_eq!(ch.recv().await, Some(ChannelEvent::Close(CloseOptions::problem(Problem::Disconnected))));
        assert_eq!(ch.recv().await, None);
    }

    #[tokio::test]
    async fn request_body_collects_until_done() {
        let (ch, mut peer) = Channel::pair();
        ch.send(Bytes::from_static(b"{\"a\":"));
        ch.send(Bytes::from_static(b"1}"));
        ch.done();
        assert_eq!(peer.request_body().await, Ok(Bytes::from_static(b"{\"a\":1}")));
    }

    #[test]
    fn header_lookup_ignores_case() {
        let meta = ResponseMeta::new(200, "OK").with_header("content-type", "application/json");
        assert_eq!(meta.header("Content-Type"), Some("application/json"));
        assert_eq!(meta.header("x-missing"), None);
    }
}
