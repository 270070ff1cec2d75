//! kmirror config: turns a kubeconfig document into [`ConnectionParams`].
//!
//! Parsing is pure. Reading the document (kubectl, a file, session data)
//! lives in [`source`].

#![forbid(unsafe_code)]

use std::path::PathBuf;

use base64::Engine;
use kmirror_core::{CertSource, ConnectionParams, TlsConfig};
use serde::Deserialize;
use tracing::{debug, warn};

pub mod source;

pub use source::{default_source, ConfigOrigin, ConfigSource, FileConfig, KubectlConfig, StaticConfig};

/// Port used for plain `http` servers that name none.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
/// Port used for `https` servers that name none.
pub const DEFAULT_HTTPS_PORT: u16 = 6443;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("context not found: {0}")]
    UnknownContext(String),
    #[error("invalid server url: {0}")]
    ServerUrl(String),
    #[error("{field}: invalid base64 data")]
    CertData { field: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KubeConfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    contexts: Vec<NamedContext>,
    users: Vec<NamedUser>,
    clusters: Vec<NamedCluster>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ContextRef {
    user: Option<String>,
    cluster: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct UserEntry {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    #[serde(rename = "client-certificate")]
    client_certificate: Option<String>,
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: Option<String>,
    #[serde(rename = "client-key")]
    client_key: Option<String>,
    #[serde(rename = "client-key-data")]
    client_key_data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClusterEntry {
    server: Option<String>,
    #[serde(rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: bool,
}

/// Parse a kubeconfig JSON document. `None` means "no usable config" and is
/// not an error for callers: discovery simply moves on to its fallbacks.
pub fn parse_kubeconfig(text: &str, context: Option<&str>) -> Option<ConnectionParams> {
    match try_parse_kubeconfig(text, context) {
        Ok(params) => Some(params),
        Err(e) => {
            warn!(error = %e, "received invalid kube config");
            None
        }
    }
}

/// Like [`parse_kubeconfig`] but reports why the document is unusable.
pub fn try_parse_kubeconfig(text: &str, context: Option<&str>) -> Result<ConnectionParams, ConfigError> {
    let config: KubeConfig = serde_json::from_str(text)?;
    let wanted = context.map(str::to_string).or(config.current_context.clone());

    let found = wanted.as_deref().and_then(|name| config.contexts.iter().find(|c| c.name == name));
    let ctx = match (found, context) {
        // an explicitly requested context must exist
        (None, Some(name)) => return Err(ConfigError::UnknownContext(name.to_string())),
        (None, None) if wanted.is_some() => {
            debug!(context = ?wanted, "current-context not found, using defaults");
            None
        }
        (found, _) => found,
    };
    let user_name = ctx.and_then(|c| c.context.user.as_deref());
    let cluster_name = ctx.and_then(|c| c.context.cluster.as_deref());
    let user = user_name.and_then(|n| config.users.iter().find(|u| u.name == n)).map(|u| &u.user);
    let cluster = cluster_name.and_then(|n| config.clusters.iter().find(|c| c.name == n)).map(|c| &c.cluster);

    let params = connection_params(cluster, user)?;
    debug!(context = ?wanted, params = ?params, "parsed kube config");
    Ok(params)
}

fn connection_params(cluster: Option<&ClusterEntry>, user: Option<&UserEntry>) -> Result<ConnectionParams, ConfigError> {
    let mut params = ConnectionParams::plain(DEFAULT_HTTP_PORT);

    if let Some((cluster, server)) = cluster.and_then(|c| c.server.as_deref().map(|s| (c, s))) {
        let url = ServerUrl::parse(server)?;
        params.address = url.host;
        match (url.https, url.port) {
            (_, Some(port)) => params.port = port,
            (true, None) => params.port = DEFAULT_HTTPS_PORT,
            (false, None) => {}
        }
        if url.https {
            params.tls = Some(TlsConfig {
                authority: cert_option(
                    "certificate-authority",
                    cluster.certificate_authority_data.as_deref(),
                    cluster.certificate_authority.as_deref(),
                )?,
                certificate: None,
                key: None,
                validate: !cluster.insecure_skip_tls_verify,
            });
        }
    }

    if let Some(user) = user {
        // a bearer token takes precedence over basic credentials
        if let Some(token) = user.token.as_deref().filter(|t| !t.is_empty()) {
            params.headers.insert("Authorization".into(), format!("Bearer {}", token));
        } else if let Some(username) = user.username.as_deref() {
            let password = user.password.as_deref().unwrap_or("");
            params.headers.insert("Authorization".into(), format!("Basic {}", basic_token(username, password)));
        }
        if let Some(tls) = params.tls.as_mut() {
            tls.certificate = cert_option(
                "client-certificate",
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
            )?;
            tls.key = cert_option("client-key", user.client_key_data.as_deref(), user.client_key.as_deref())?;
        }
    }

    Ok(params)
}

/// `<option>-data` wins over the plain `<option>` path.
fn cert_option(field: &str, data: Option<&str>, file: Option<&str>) -> Result<Option<CertSource>, ConfigError> {
    if let Some(blob) = data {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .map_err(|_| ConfigError::CertData { field: format!("{}-data", field) })?;
        return Ok(Some(CertSource::Data(decoded)));
    }
    Ok(file.map(|f| CertSource::File(PathBuf::from(f))))
}

fn basic_token(user: &str, pass: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass))
}

/// The parts of a server URL that matter for connecting.
#[derive(Debug, PartialEq, Eq)]
struct ServerUrl {
    https: bool,
    host: Option<String>,
    port: Option<u16>,
}

impl ServerUrl {
    fn parse(server: &str) -> Result<Self, ConfigError> {
        let bad = || ConfigError::ServerUrl(server.to_string());
        let (scheme, rest) = server.split_once("://").ok_or_else(bad)?;
        let https = match scheme.to_ascii_lowercase().as_str() {
            "https" => true,
            "http" => false,
            _ => return Err(bad()),
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        // drop userinfo if present
        let authority = authority.rsplit_once('@').map(|(_, a)| a).unwrap_or(authority);

        let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
            let (h, after) = stripped.split_once(']').ok_or_else(bad)?;
            (h, after.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };
        let port = match port.filter(|p| !p.is_empty()) {
            Some(p) => match p.parse::<u16>().map_err(|_| bad())? {
                0 => None,
                n => Some(n),
            },
            None => None,
        };
        let host = if host.is_empty() { None } else { Some(host.to_string()) };
        Ok(ServerUrl { https, host, port })
    }
}
