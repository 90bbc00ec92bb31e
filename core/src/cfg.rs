use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::RetryPolicy;

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"pinger"`.
    pub application: &'static str,
}

/// Application configuration persisted to `config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    pub log_level: String,
    /// Base URL of the ping server; pings go to `{server_url}/ping`.
    pub server_url: String,
    /// Name of the recurring ping job.
    pub job_name: String,
    /// Time between cycle starts (seconds).
    pub interval_secs: u64,
    /// Smallest interval the scheduler accepts (seconds).
    pub min_interval_secs: u64,
    /// Delivery attempts per cycle.
    pub max_attempts: u32,
    /// Wait before the second attempt; doubles for each further attempt (ms).
    pub base_delay_ms: u64,
    /// Timeout applied by the HTTP sender to a single request (ms).
    pub request_timeout_ms: u64,
    /// Defer cycles while the ping server is unreachable.
    pub require_network: bool,
    /// Fixed device id; a generated one is persisted in KV when absent.
    pub device_id: Option<String>,
    /// Listen address of the status server, if enabled.
    pub status_addr: Option<String>,
    /// KV directory; defaults to `<config dir>/kv`.
    pub kv_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            server_url: "http://localhost:5000".to_string(),
            job_name: "periodic_ping_work".to_string(),
            interval_secs: 15 * 60,
            min_interval_secs: 1,
            max_attempts: 3,
            base_delay_ms: 1000,
            request_timeout_ms: 10_000,
            require_network: true,
            device_id: None,
            status_addr: Some("127.0.0.1:8787".to_string()),
            kv_dir: None,
        }
    }
}

impl Config {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.server_url.trim().is_empty() {
            bail!("server_url must not be empty");
        }
        if self.job_name.trim().is_empty() {
            bail!("job_name must not be empty");
        }
        Ok(())
    }

    /// Interval between cycle starts.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Smallest interval accepted by the scheduler.
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    /// Retry policy for one delivery cycle.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }

    /// KV directory, resolved against `config_dir` when not configured.
    pub fn kv_dir(&self, config_dir: &Path) -> PathBuf {
        self.kv_dir.clone().unwrap_or_else(|| config_dir.join("kv"))
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let dir = config_dir(app)?;
    load_or_init_in(&dir)
}

/// Load `config.toml` from `dir` or create a default one there.
pub fn load_or_init_in(dir: &Path) -> Result<Config> {
    fs::create_dir_all(dir).with_context(|| format!("create config dir {}", dir.display()))?;
    let path = dir.join("config.toml");
    let cfg = if path.exists() {
        let txt = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<Config>(&txt)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        cfg
    };
    cfg.validate().with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let s = toml::to_string_pretty(cfg)?;
    fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
