use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ping_core::cfg::{self, AppId, Config};
use ping_core::delivery::{DeliveryUnit, PingCycle};
use ping_core::ping::{DeviceIdProvider, FixedDeviceId, KvDeviceId};
use ping_core::scheduler::{JobSpec, Scheduler};
use ping_core::store::{self, DefaultKv};

use crate::http::{HttpSender, NetworkReachable};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Everything a command needs: resolved config, its directory and the KV.
pub struct Env {
    pub cfg: Config,
    pub config_dir: PathBuf,
    pub kv: DefaultKv,
}

impl Env {
    pub fn load(app: &AppId, config_dir: Option<&Path>, server_url: Option<String>) -> Result<Self> {
        let config_dir = match config_dir {
            Some(dir) => dir.to_path_buf(),
            None => cfg::config_dir(app)?,
        };
        let mut cfg = cfg::load_or_init_in(&config_dir)?;
        if let Some(url) = server_url {
            cfg.server_url = url;
            cfg.validate()?;
        }
        let kv = store::open_default(cfg.kv_dir(&config_dir))?;
        Ok(Self { cfg, config_dir, kv })
    }

    pub fn device_ids(&self) -> Arc<dyn DeviceIdProvider> {
        match self.cfg.device_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Arc::new(FixedDeviceId(id.to_string())),
            _ => Arc::new(KvDeviceId::new(self.kv.clone())),
        }
    }

    pub fn scheduler(&self) -> Result<Arc<Scheduler>> {
        let sender = HttpSender::new(
            &self.cfg.server_url,
            Duration::from_millis(self.cfg.request_timeout_ms),
        )?;
        let unit = DeliveryUnit::new(Arc::new(sender), self.cfg.retry_policy());
        let work = PingCycle::new(self.device_ids(), unit);
        Ok(Arc::new(Scheduler::new(Arc::new(work)).with_min_interval(self.cfg.min_interval())))
    }

    /// The recurring ping job described by the config.
    pub fn job_spec(&self) -> Result<JobSpec> {
        let spec = JobSpec::periodic(self.cfg.job_name.clone(), self.cfg.interval());
        if !self.cfg.require_network {
            return Ok(spec);
        }
        let net = NetworkReachable::for_server(&self.cfg.server_url, PROBE_TIMEOUT)
            .context("network constraint")?;
        Ok(spec.with_constraint(Arc::new(net)))
    }
}
