use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kmirror_config::{default_source, ConfigSource, FileConfig};
use kmirror_core::{Frame, FrameType};
use kmirror_kubehub::{EndpointProbe, KubeHub, Request, ResponseData};
use kmirror_store::spawn_ingest;
use kmirror_transport::HttpTransport;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmirrorctl", version, about = "kmirror CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster config file (default: KMIRROR_KUBECONFIG, KUBECONFIG, ~/.kube/config, kubectl)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<std::path::PathBuf>,

    /// Config context (default: current-context)
    #[arg(long = "context", env = "KMIRROR_CONTEXT", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find a running API server
    Discover {
        /// Ignore the memoized endpoint and probe again
        #[arg(long = "force", action = ArgAction::SetTrue)]
        force: bool,
    },
    /// GET a path and print the response body
    Get {
        /// Request path, e.g. "/api/v1/namespaces"
        path: String,
    },
    /// Watch a collection path and print +/~/- events
    Watch {
        /// Collection path, e.g. "/api/v1/pods"
        path: String,
    },
    /// List a collection once it has loaded
    Ls {
        /// Collection path, e.g. "/api/v1/configmaps"
        path: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KMIRROR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMIRROR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KMIRROR_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_hub(cli: &Cli) -> KubeHub {
    let transport = Arc::new(HttpTransport::new());
    let source: Arc<dyn ConfigSource> = match &cli.kubeconfig {
        Some(path) => Arc::new(FileConfig::new(path.clone())),
        None => Arc::from(default_source()),
    };
    let probe = EndpointProbe::new(transport.clone()).with_config(source).with_context(cli.context.clone());
    KubeHub::new(transport, probe)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let hub = build_hub(&cli);

    match &cli.command {
        Commands::Discover { force } => {
            info!(force, "discover invoked");
            let found = hub.discover(*force).await.context("discover")?;
            match cli.output {
                Output::Human => {
                    println!("{} • {} • {}", found.params.base_url(), found.origin.as_str(), found.versions.join(","));
                }
                Output::Json => {
                    let out = serde_json::json!({
                        "url": found.params.base_url(),
                        "origin": found.origin.as_str(),
                        "versions": found.versions,
                    });
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::Get { path } => {
            info!(path = %path, "get invoked");
            let resp = hub.request(Request::get(path.as_str())).await.with_context(|| format!("GET {}", path))?;
            match (&resp.data, cli.output) {
                (ResponseData::Json(v), Output::Json) => println!("{}", serde_json::to_string_pretty(v)?),
                (ResponseData::Json(v), Output::Human) => println!("{}", v),
                (ResponseData::Text(t), _) => println!("{}", t),
            }
        }
        Commands::Watch { path } => {
            info!(path = %path, "watch invoked");
            let (mut rx, handle) = hub.watch_stream(path);
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(batch) => {
                            for f in &batch {
                                print_frame(f, cli.output)?;
                            }
                        }
                        None => {
                            warn!("watch channel closed; exiting watch loop");
                            break;
                        }
                    },
                    stopped = handle.stopped() => {
                        if let Some(err) = stopped {
                            error!(error = %err, "watch stopped");
                            handle.cancel(None);
                            return Err(err).context("watch");
                        }
                        break;
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            handle.cancel(None);
        }
        Commands::Ls { path } => {
            info!(path = %path, "ls invoked");
            let (ingest_tx, backend) = spawn_ingest();
            let handle = hub.watch(path, move |batch| {
                let _ = ingest_tx.send(batch);
            });

            let wait_secs = std::env::var("KMIRROR_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
            let deadline = Instant::now() + Duration::from_secs(wait_secs);
            match tokio::time::timeout(Duration::from_secs(wait_secs), handle.loaded()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    handle.cancel(None);
                    return Err(e).with_context(|| format!("listing {}", path));
                }
                Err(_) => warn!(wait_secs, "collection not loaded in time; printing partial snapshot"),
            }
            // the settle flush publishes right away; wait for it to land
            let mut rx = backend.subscribe_epoch();
            while *rx.borrow() == 0 {
                let now = Instant::now();
                if now >= deadline { break; }
                if tokio::time::timeout(deadline - now, rx.changed()).await.map_or(true, |r| r.is_err()) { break; }
            }
            let snap = backend.current();
            match cli.output {
                Output::Human => {
                    println!("{:<6} {:<11} {:<20} AGE", "KIND", "NAMESPACE", "NAME");
                    for item in snap.items.iter() {
                        let ns_col = item.namespace.clone().unwrap_or_else(|| "-".to_string());
                        println!("{:<6} {:<11} {:<20} {}", item.kind, ns_col, item.name, render_age(item.creation_ts));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&snap.items)?),
            }
            handle.cancel(None);
        }
    }

    Ok(())
}

fn print_frame(f: &Frame, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(f)?),
        Output::Human => {
            let key = match f.object.namespace() {
                Some(ns) => format!("{}/{}", ns, f.object.name().unwrap_or_default()),
                None => f.object.name().unwrap_or_default().to_string(),
            };
            let sigil = match f.frame_type {
                FrameType::Added => '+',
                FrameType::Modified => '~',
                FrameType::Deleted => '-',
                FrameType::Error => '!',
            };
            println!("{} {} {}", sigil, f.object.kind(), key);
        }
    }
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
