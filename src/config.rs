//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then a YAML file, then environment
//! overrides. CLI flags are applied on top by the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use composeapp_oci::{Credentials, Platform, PlatformMatcher, RegistryConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub const CONFIG_ENV: &str = "COMPOSEAPP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root of the content-addressed store and app layouts.
    pub store_root: PathBuf,
    /// Where each app's compose project is extracted.
    pub compose_root: PathBuf,
    /// Container daemon endpoint (`unix://` socket path).
    pub docker_host: String,
    /// Seconds.
    pub connect_timeout: u64,
    /// Seconds.
    pub read_timeout: u64,
    /// `[os/]arch[/variant]`; host platform when unset.
    pub platform: Option<String>,
    /// Percentage of filesystem fullness above which fetches are refused.
    pub usage_watermark: u8,
    /// Update store file; `<store_root>/updates.db` when unset.
    pub db_path: Option<PathBuf>,
    pub fetch_poll_interval_ms: u64,
    /// The daemon accepts digest-tagged loads and a host layers root.
    pub patched_daemon: bool,
    /// How long to wait for the update store lock.
    pub lock_timeout_secs: u64,
    /// Basic credentials per registry host; anonymous when absent.
    #[serde(skip_serializing)]
    pub registry_auth: BTreeMap<String, Credentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from("/var/sota/reset-apps"),
            compose_root: PathBuf::from("/var/sota/compose-apps"),
            docker_host: "unix:///var/run/docker.sock".to_string(),
            connect_timeout: 10,
            read_timeout: 60,
            platform: None,
            usage_watermark: 80,
            db_path: None,
            fetch_poll_interval_ms: 300,
            patched_daemon: true,
            lock_timeout_secs: 30,
            registry_auth: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Defaults overlaid with `path` (or `$COMPOSEAPP_CONFIG`) and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidInput(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw).map_err(|e| {
            Error::InvalidInput(format!("invalid config {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("COMPOSEAPP_STORE_ROOT") {
            self.store_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("COMPOSEAPP_COMPOSE_ROOT") {
            self.compose_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("DOCKER_HOST") {
            self.docker_host = v;
        }
        if let Some(v) = lookup("COMPOSEAPP_USAGE_WATERMARK") {
            self.usage_watermark = v.parse().map_err(|_| {
                Error::InvalidInput(format!("COMPOSEAPP_USAGE_WATERMARK is not a number: {v}"))
            })?;
        }
        if let Some(v) = lookup("COMPOSEAPP_PLATFORM") {
            self.platform = Some(v);
        }
        match (
            lookup("COMPOSEAPP_REGISTRY"),
            lookup("COMPOSEAPP_REGISTRY_USER"),
            lookup("COMPOSEAPP_REGISTRY_PASSWORD"),
        ) {
            (None, None, None) => {}
            (Some(host), Some(username), Some(password)) => {
                self.registry_auth
                    .insert(host, Credentials { username, password });
            }
            _ => {
                return Err(Error::InvalidInput(
                    "COMPOSEAPP_REGISTRY, COMPOSEAPP_REGISTRY_USER and COMPOSEAPP_REGISTRY_PASSWORD must be set together"
                        .to_string(),
                ))
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(20..=95).contains(&self.usage_watermark) {
            return Err(Error::InvalidInput(format!(
                "usage watermark {} is outside [20, 95]",
                self.usage_watermark
            )));
        }
        if self.fetch_poll_interval_ms == 0 {
            return Err(Error::InvalidInput(
                "fetch_poll_interval_ms must be positive".to_string(),
            ));
        }
        self.platform_matcher()?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.store_root.join("updates.db"))
    }

    pub fn platform_matcher(&self) -> Result<PlatformMatcher> {
        match &self.platform {
            Some(raw) => Ok(PlatformMatcher::new(Platform::parse(raw)?)),
            None => Ok(PlatformMatcher::host()),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            ..RegistryConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.fetch_poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Compose project directory of one app.
    pub fn app_compose_dir(&self, app_name: &str) -> PathBuf {
        self.compose_root.join(app_name)
    }
}
