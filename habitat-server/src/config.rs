use habitat_core::{HabitatError, Result};
use habitat_meta::LogConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HabitatConfig {
    /// Root for HDB and certificates.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub app_path: Option<PathBuf>,
    #[serde(default)]
    pub web_bundle_path: Option<PathBuf>,
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_proxy_addr")]
    pub proxy_addr: SocketAddr,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default)]
    pub frontend_dir: Option<PathBuf>,
    #[serde(default)]
    pub root_user_certificate: Option<PathBuf>,
    #[serde(default)]
    pub hdb: HdbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdbConfig {
    #[serde(default = "default_commit_timeout_secs")]
    pub commit_timeout_secs: u64,
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    #[serde(default = "default_snapshot_retain")]
    pub snapshot_retain: usize,
    #[serde(default = "default_trailing_logs")]
    pub trailing_logs: u64,
}

impl Default for HdbConfig {
    fn default() -> Self {
        Self {
            commit_timeout_secs: default_commit_timeout_secs(),
            snapshot_threshold: default_snapshot_threshold(),
            snapshot_retain: default_snapshot_retain(),
            trailing_logs: default_trailing_logs(),
        }
    }
}

impl HdbConfig {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            commit_timeout: Duration::from_secs(self.commit_timeout_secs),
            snapshot_threshold: self.snapshot_threshold,
            snapshot_retain: self.snapshot_retain,
            trailing_logs: self.trailing_logs,
        }
    }
}

fn default_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".habitat"),
        None => PathBuf::from(".habitat"),
    }
}

fn default_node_name() -> String {
    "habitat".to_string()
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_proxy_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3001))
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_commit_timeout_secs() -> u64 {
    10
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_snapshot_retain() -> usize {
    1000
}

fn default_trailing_logs() -> u64 {
    10240
}

impl HabitatConfig {
    /// Loads `path` (when given and present) layered under `HABITAT_*`
    /// environment variables. Nested keys use `__`, e.g. `HABITAT_HDB__TRAILING_LOGS`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix("HABITAT").separator("__"))
            .build()
            .map_err(|e| HabitatError::Config(e.to_string()))?;

        let config: HabitatConfig = settings
            .try_deserialize()
            .map_err(|e| HabitatError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) | (None, Some(_)) => Err(HabitatError::Config(
                "tls_cert_path and tls_key_path must be set together".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub fn hdb_path(&self) -> PathBuf {
        self.path.join("hdb")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.path.join("certificates")
    }

    pub fn node_cert_path(&self) -> PathBuf {
        self.cert_dir().join("node.crt")
    }

    pub fn root_user_cert_path(&self) -> PathBuf {
        self.root_user_certificate
            .clone()
            .unwrap_or_else(|| self.cert_dir().join("root_user.crt"))
    }

    pub fn app_path(&self) -> PathBuf {
        self.app_path.clone().unwrap_or_else(|| self.path.join("apps"))
    }

    pub fn web_bundle_path(&self) -> PathBuf {
        self.web_bundle_path
            .clone()
            .unwrap_or_else(|| self.path.join("web"))
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Reads a PEM file if it exists; a missing file yields an empty string.
pub async fn read_certificate(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}
