//! Where kubeconfig documents come from.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Kind of config a connection was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConfigOrigin {
    Kubectl,
    File,
    SessionData,
}

impl ConfigOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigOrigin::Kubectl => "kubectl",
            ConfigOrigin::File => "file",
            ConfigOrigin::SessionData => "sessionData",
        }
    }
}

/// Supplies a kubeconfig as JSON text. `Ok(None)` means no config is
/// available, which is not an error.
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    async fn read(&self) -> Result<Option<String>>;

    fn origin(&self) -> ConfigOrigin;
}

/// Asks `kubectl` for the merged, raw config.
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    program: PathBuf,
}

impl Default for KubectlConfig {
    fn default() -> Self { Self { program: PathBuf::from("kubectl") } }
}

impl KubectlConfig {
    pub fn new() -> Self { Self::default() }

    /// Use a specific kubectl binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self { Self { program: program.into() } }
}

#[async_trait::async_trait]
impl ConfigSource for KubectlConfig {
    async fn read(&self) -> Result<Option<String>> {
        let t0 = std::time::Instant::now();
        let out = match tokio::process::Command::new(&self.program)
            .args(["config", "view", "--output=json", "--raw"])
            .kill_on_drop(true)
            .output()
            .await
        {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(program = %self.program.display(), "kubectl not installed");
                return Ok(None);
            }
            Err(e) => return Err(e).context("running kubectl config view"),
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("kubectl config view failed ({}): {}", out.status, stderr.trim()));
        }
        let text = String::from_utf8(out.stdout).context("kubectl output is not utf-8")?;
        debug!(took_ms = %t0.elapsed().as_millis(), bytes = text.len(), "kubectl config view");
        Ok(Some(text))
    }

    fn origin(&self) -> ConfigOrigin { ConfigOrigin::Kubectl }
}

/// A kubeconfig file on disk, JSON or YAML.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }
}

#[async_trait::async_trait]
impl ConfigSource for FileConfig {
    async fn read(&self) -> Result<Option<String>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "kube config file missing");
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        if text.trim_start().starts_with('{') {
            return Ok(Some(text));
        }
        let doc: serde_json::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(serde_json::to_string(&doc)?))
    }

    fn origin(&self) -> ConfigOrigin { ConfigOrigin::File }
}

/// Config handed over in memory, e.g. from a login session.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    text: String,
}

impl StaticConfig {
    pub fn new(text: impl Into<String>) -> Self { Self { text: text.into() } }

    pub fn from_value(doc: &serde_json::Value) -> Self { Self::new(doc.to_string()) }
}

#[async_trait::async_trait]
impl ConfigSource for StaticConfig {
    async fn read(&self) -> Result<Option<String>> { Ok(Some(self.text.clone())) }

    fn origin(&self) -> ConfigOrigin { ConfigOrigin::SessionData }
}

/// Pick the config source for this environment: `KMIRROR_KUBECONFIG`, the
/// first `KUBECONFIG` entry, `~/.kube/config`, then kubectl.
pub fn default_source() -> Box<dyn ConfigSource> {
    if let Some(path) = std::env::var_os("KMIRROR_KUBECONFIG").filter(|p| !p.is_empty()) {
        info!(path = %Path::new(&path).display(), "using KMIRROR_KUBECONFIG");
        return Box::new(FileConfig::new(path));
    }
    if let Some(first) = std::env::var_os("KUBECONFIG").and_then(|v| std::env::split_paths(&v).find(|p| !p.as_os_str().is_empty())) {
        return Box::new(FileConfig::new(first));
    }
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".kube");
        p.push("config");
        if p.is_file() {
            return Box::new(FileConfig::new(p));
        }
    }
    Box::new(KubectlConfig::new())
}
