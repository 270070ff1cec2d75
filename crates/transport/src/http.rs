//! HTTP(S) transport on top of reqwest (rustls).

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kmirror_core::{CertSource, Problem, TlsConfig};
use tracing::{debug, warn};

use crate::{Channel, ChannelCommand, ChannelPeer, OpenOptions, ResponseMeta, Transport};

#[derive(Debug, thiserror::Error)]
enum TlsSetupError {
    #[error("reading TLS material: {0}")]
    Io(#[from] std::io::Error),
    #[error("building client: {0}")]
    Client(#[from] reqwest::Error),
}

type ClientCache = Arc<Mutex<HashMap<Option<TlsConfig>, reqwest::Client>>>;

/// Opens one HTTP request per channel. Clients are reused per TLS configuration.
#[derive(Clone, Default)]
pub struct HttpTransport {
    clients: ClientCache,
}

impl HttpTransport {
    pub fn new() -> Self { Self::default() }
}

impl Transport for HttpTransport {
    fn open(&self, options: OpenOptions) -> Channel {
        let (channel, peer) = Channel::pair();
        tokio::spawn(run_exchange(self.clients.clone(), options, peer));
        channel
    }
}

async fn run_exchange(cache: ClientCache, options: OpenOptions, mut peer: ChannelPeer) {
    let t0 = Instant::now();
    let body = match peer.request_body().await {
        Ok(b) => b,
        // closed before the request went out; the owner already saw its own close
        Err(_) => return,
    };
    let client = match client_for(&cache, options.tls.as_ref()).await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, port = options.port, "http: client setup failed");
            peer.close(Some(Problem::ProtocolError));
            return;
        }
    };
    let method = match reqwest::Method::from_bytes(options.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => {
            warn!(method = %options.method, "http: invalid method");
            peer.close(Some(Problem::ProtocolError));
            return;
        }
    };
    let url = format!("{}{}", options.params().base_url(), options.path);
    let mut req = client.request(method, &url);
    for (name, value) in options.headers.iter() {
        req = req.header(name.as_str(), value.as_str());
    }
    if !body.is_empty() {
        req = req.body(body);
    }

    let mut resp = tokio::select! {
        _ = wait_close(&mut peer) => {
            debug!(url = %url, "http: cancelled before response");
            return;
        }
        res = req.send() => match res {
            Ok(r) => r,
            Err(e) => {
                let problem = classify(&e);
                debug!(url = %url, error = %e, problem = %problem, "http: request failed");
                peer.close(Some(problem));
                return;
            }
        }
    };

    let status = resp.status();
    let mut meta = ResponseMeta::new(status.as_u16(), status.canonical_reason().unwrap_or(""));
    for (name, value) in resp.headers().iter() {
        if let Ok(v) = value.to_str() {
            meta.headers.insert(name.as_str().to_string(), v.to_string());
        }
    }
    debug!(url = %url, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "http: response head");
    peer.control(meta);

    loop {
        tokio::select! {
            _ = wait_close(&mut peer) => return,
            chunk = resp.chunk() => match chunk {
                Ok(Some(bytes)) => peer.message(bytes),
                Ok(None) => {
                    peer.close(None);
                    return;
                }
                Err(e) => {
                    let problem = classify(&e);
                    debug!(url = %url, error = %e, problem = %problem, "http: body stream failed");
                    peer.close(Some(problem));
                    return;
                }
            }
        }
    }
}

/// Resolves once the owner closes or drops the channel.
async fn wait_close(peer: &mut ChannelPeer) {
    loop {
        match peer.command().await {
            Some(ChannelCommand::Close(_)) | None => return,
            Some(_) => {}
        }
    }
}

async fn client_for(cache: &ClientCache, tls: Option<&TlsConfig>) -> Result<reqwest::Client, TlsSetupError> {
    let key = tls.cloned();
    if let Some(c) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(&key) {
        return Ok(c.clone());
    }
    let client = build_client(tls).await?;
    cache.lock().unwrap_or_else(|e| e.into_inner()).insert(key, client.clone());
    Ok(client)
}

async fn build_client(tls: Option<&TlsConfig>) -> Result<reqwest::Client, TlsSetupError> {
    let mut builder = reqwest::Client::builder();
    if let Some(tls) = tls {
        if let Some(ca) = &tls.authority {
            let pem = load_pem(ca).await?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if let (Some(cert), Some(key)) = (&tls.certificate, &tls.key) {
            let mut pem = load_pem(cert).await?;
            pem.push(b'\n');
            pem.extend_from_slice(&load_pem(key).await?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }
        if !tls.validate {
            builder = builder.danger_accept_invalid_certs(true);
        }
    }
    Ok(builder.build()?)
}

async fn load_pem(src: &CertSource) -> std::io::Result<Vec<u8>> {
    match src {
        CertSource::Data(d) => Ok(d.clone()),
        CertSource::File(p) => tokio::fs::read(p).await,
    }
}

/// Map a reqwest failure onto a channel problem code.
fn classify(err: &reqwest::Error) -> Problem {
    if err.is_timeout() {
        return Problem::Timeout;
    }
    if err.is_connect() {
        let mut source = std::error::Error::source(err);
        while let Some(inner) = source {
            if let Some(io) = inner.downcast_ref::<std::io::Error>() {
                if matches!(io.kind(), ErrorKind::ConnectionRefused | ErrorKind::AddrNotAvailable | ErrorKind::NotFound) {
                    return Problem::NotFound;
                }
            }
            if inner.to_string().contains("dns error") {
                return Problem::NotFound;
            }
            source = inner.source();
        }
        // TLS handshake failures land here
        return Problem::ProtocolError;
    }
    if err.is_body() || err.is_decode() || err.is_request() {
        Problem::Disconnected
    } else {
        Problem::InternalError
    }
}
