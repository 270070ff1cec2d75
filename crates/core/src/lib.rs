//! kmirror core types: connection parameters, watched objects and frames.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Host used when connection parameters carry no explicit address.
pub const DEFAULT_ADDRESS: &str = "localhost";

/// Where a piece of TLS material comes from.
///
/// Config files carry either inline data (`*-data`, one layer of base64
/// over PEM text, already decoded here) or a file path. Never both.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertSource {
    Data(Vec<u8>),
    File(PathBuf),
}

impl fmt::Debug for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // PEM payloads may hold private keys; keep them out of logs
            CertSource::Data(d) => write!(f, "Data(<{} bytes>)", d.len()),
            CertSource::File(p) => f.debug_tuple("File").field(p).finish(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlsConfig {
    pub authority: Option<CertSource>,
    pub certificate: Option<CertSource>,
    pub key: Option<CertSource>,
    pub validate: bool,
}

/// Resolved endpoint for the API server. Immutable once resolved.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub address: Option<String>,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub headers: BTreeMap<String, String>,
}

impl ConnectionParams {
    /// Plain parameters for a port on the default address.
    pub fn plain(port: u16) -> Self {
        Self { address: None, port, tls: None, headers: BTreeMap::new() }
    }

    /// TLS parameters for a port on the default address.
    pub fn tls(port: u16, validate: bool) -> Self {
        Self { tls: Some(TlsConfig { validate, ..Default::default() }), ..Self::plain(port) }
    }

    pub fn host(&self) -> &str {
        self.address.as_deref().unwrap_or(DEFAULT_ADDRESS)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() { "https" } else { "http" }
    }

    /// `scheme://host:port`, bracketing IPv6 literals.
    pub fn base_url(&self) -> String {
        let host = self.host();
        if host.contains(':') && !host.starts_with('[') {
            format!("{}://[{}]:{}", self.scheme(), host, self.port)
        } else {
            format!("{}://{}:{}", self.scheme(), host, self.port)
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: BTreeMap<&str, &str> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("authorization") { (k.as_str(), "<redacted>") } else { (k.as_str(), v.as_str()) }
            })
            .collect();
        f.debug_struct("ConnectionParams")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("headers", &headers)
            .finish()
    }
}

/// Transport level problem codes carried by a channel close.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Problem {
    Disconnected,
    NotFound,
    Cancelled,
    Terminated,
    Timeout,
    ProtocolError,
    AccessDenied,
    InternalError,
    Other(String),
}

impl Problem {
    pub fn as_str(&self) -> &str {
        match self {
            Problem::Disconnected => "disconnected",
            Problem::NotFound => "not-found",
            Problem::Cancelled => "cancelled",
            Problem::Terminated => "terminated",
            Problem::Timeout => "timeout",
            Problem::ProtocolError => "protocol-error",
            Problem::AccessDenied => "access-denied",
            Problem::InternalError => "internal-error",
            Problem::Other(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Problem {
    fn from(s: &str) -> Self {
        match s {
            "disconnected" => Problem::Disconnected,
            "not-found" => Problem::NotFound,
            "cancelled" => Problem::Cancelled,
            "terminated" => Problem::Terminated,
            "timeout" => Problem::Timeout,
            "protocol-error" => Problem::ProtocolError,
            "access-denied" => Problem::AccessDenied,
            "internal-error" => Problem::InternalError,
            other => Problem::Other(other.to_string()),
        }
    }
}

impl From<String> for Problem {
    fn from(s: String) -> Self { Problem::from(s.as_str()) }
}

impl From<Problem> for String {
    fn from(p: Problem) -> Self { p.as_str().to_string() }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidObject {
    #[error("object is not a JSON object")]
    NotAnObject,
    #[error("object missing kind")]
    MissingKind,
    #[error("object missing metadata.uid")]
    MissingUid,
}

/// A watched document. Always carries `kind` and `metadata.uid`; everything
/// else is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct Object(serde_json::Value);

impl Object {
    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(|v| v.as_str()).unwrap_or_default()
    }

    pub fn uid(&self) -> &str {
        self.meta_str("uid").unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta_str("resourceVersion")
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    pub fn as_value(&self) -> &serde_json::Value { &self.0 }

    pub fn into_value(self) -> serde_json::Value { self.0 }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
    }
}

impl TryFrom<serde_json::Value> for Object {
    type Error = InvalidObject;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        if !value.is_object() {
            return Err(InvalidObject::NotAnObject);
        }
        let uid = value.get("metadata").and_then(|m| m.get("uid")).and_then(|v| v.as_str());
        if uid.map_or(true, str::is_empty) {
            return Err(InvalidObject::MissingUid);
        }
        let kind = value.get("kind").and_then(|v| v.as_str());
        if kind.map_or(true, str::is_empty) {
            return Err(InvalidObject::MissingKind);
        }
        Ok(Object(value))
    }
}

impl From<Object> for serde_json::Value {
    fn from(o: Object) -> Self { o.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl FrameType {
    /// Parse the wire `type` field. Unknown types yield `None`.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "ADDED" => Some(FrameType::Added),
            "MODIFIED" => Some(FrameType::Modified),
            "DELETED" => Some(FrameType::Deleted),
            "ERROR" => Some(FrameType::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::Added => "ADDED",
            FrameType::Modified => "MODIFIED",
            FrameType::Deleted => "DELETED",
            FrameType::Error => "ERROR",
        }
    }
}

/// One change notification as handed to watch callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub object: Object,
}

impl Frame {
    pub fn new(frame_type: FrameType, object: Object) -> Self { Self { frame_type, object } }

    pub fn deleted(object: Object) -> Self { Self::new(FrameType::Deleted, object) }
}

pub mod prelude {
    pub use super::{CertSource, ConnectionParams, Frame, FrameType, Object, Problem, TlsConfig};
}
