//! Layered configuration: TOML file, environment overrides, startup
//! validation.
//!
//! Resolution order for the file itself: explicit `--config` path, then the
//! `LINKSHAPER_CONFIG` environment variable, then
//! `/etc/linkshaper/linkshaper.toml`, then compiled-in defaults. After the
//! file, every field can be overridden individually from the environment;
//! env always wins. The pipeline only ever sees the final resolved values.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::routeros::API_PORT;
use crate::snmp::{Oid, SNMP_PORT};

/// Standard system location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/linkshaper/linkshaper.toml";

/// Root configuration for one linkshaper invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShaperConfig {
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub shaping: ShapingConfig,
}

/// The DSL modem's SNMP agent and the two attainable-rate counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub address: IpAddr,
    pub port: u16,
    pub community: String,
    /// Downstream attainable rate (ADSL-LINE-MIB adslAtucCurrAttainableRate).
    pub oid_downstream: Oid,
    /// Upstream attainable rate (ADSL-LINE-MIB adslAturCurrAttainableRate).
    pub oid_upstream: Oid,
    pub timeout_sec: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            address: "192.168.1.1".parse().unwrap(),
            port: SNMP_PORT,
            community: "public".to_string(),
            oid_downstream: "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap(),
            oid_upstream: "1.3.6.1.2.1.10.94.1.1.3.1.8.1".parse().unwrap(),
            timeout_sec: 5,
        }
    }
}

impl ModemConfig {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

/// The RouterOS device carrying the two shaping queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "router_default_address")]
    pub address: IpAddr,
    #[serde(default = "router_default_port")]
    pub port: u16,
    #[serde(default = "router_default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "router_default_download_queue")]
    pub download_queue: String,
    #[serde(default = "router_default_upload_queue")]
    pub upload_queue: String,
    #[serde(default = "router_default_timeout_sec")]
    pub timeout_sec: u64,
}

fn router_default_address() -> IpAddr {
    "192.168.88.1".parse().unwrap()
}
fn router_default_port() -> u16 {
    API_PORT
}
fn router_default_username() -> String {
    "admin".to_string()
}
fn router_default_download_queue() -> String {
    "download".to_string()
}
fn router_default_upload_queue() -> String {
    "upload".to_string()
}
fn router_default_timeout_sec() -> u64 {
    5
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            address: router_default_address(),
            port: router_default_port(),
            username: router_default_username(),
            password: String::new(),
            download_queue: router_default_download_queue(),
            upload_queue: router_default_upload_queue(),
            timeout_sec: router_default_timeout_sec(),
        }
    }
}

impl RouterConfig {
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl Drop for RouterConfig {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Limit derivation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShapingConfig {
    /// Fraction of the attainable rate withheld as headroom, in `[0, 1)`.
    pub margin: f64,
}

impl Default for ShapingConfig {
    fn default() -> Self {
        Self { margin: 0.10 }
    }
}

impl ShaperConfig {
    /// Load configuration from a TOML file at `path`. No env processing.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Full resolution: pick a file, load it, apply environment overrides,
    /// validate. This is the only constructor the binary uses.
    pub fn resolve(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            // An explicitly requested file must exist.
            Self::load(path)?
        } else if let Ok(env_path) = std::env::var("LINKSHAPER_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LINKSHAPER_CONFIG set but file could not be loaded, using defaults"
                    );
                    Self::default()
                }
            }
        } else {
            let system_path = Path::new(DEFAULT_CONFIG_PATH);
            if system_path.exists() {
                Self::load(system_path)?
            } else {
                debug!("no config file found, using compiled-in defaults");
                Self::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply per-field environment overrides. Env beats file for every field.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        env_override(&mut self.modem.address, "LINKSHAPER_MODEM_ADDRESS")?;
        env_override(&mut self.modem.port, "LINKSHAPER_MODEM_PORT")?;
        env_override(&mut self.modem.community, "LINKSHAPER_SNMP_COMMUNITY")?;
        env_override(&mut self.modem.oid_downstream, "LINKSHAPER_OID_DOWNSTREAM")?;
        env_override(&mut self.modem.oid_upstream, "LINKSHAPER_OID_UPSTREAM")?;
        env_override(&mut self.modem.timeout_sec, "LINKSHAPER_SNMP_TIMEOUT_SEC")?;

        env_override(&mut self.router.address, "LINKSHAPER_ROUTER_ADDRESS")?;
        env_override(&mut self.router.port, "LINKSHAPER_ROUTER_PORT")?;
        env_override(&mut self.router.username, "LINKSHAPER_ROUTER_USERNAME")?;
        env_override(&mut self.router.password, "LINKSHAPER_ROUTER_PASSWORD")?;
        env_override(&mut self.router.download_queue, "LINKSHAPER_DOWNLOAD_QUEUE")?;
        env_override(&mut self.router.upload_queue, "LINKSHAPER_UPLOAD_QUEUE")?;
        env_override(&mut self.router.timeout_sec, "LINKSHAPER_ROUTER_TIMEOUT_SEC")?;

        env_override(&mut self.shaping.margin, "LINKSHAPER_MARGIN")?;
        Ok(())
    }

    /// Reject configurations the pipeline must never run with. Called once at
    /// startup; everything after this point may assume the values are sane.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.shaping.margin) {
            bail!(
                "shaping.margin must be in [0, 1), got {}",
                self.shaping.margin
            );
        }
        if self.modem.community.is_empty() {
            bail!("modem.community must not be empty");
        }
        if self.modem.timeout_sec == 0 || self.router.timeout_sec == 0 {
            bail!("timeouts must be at least 1 second");
        }
        if self.router.port == 0 || self.modem.port == 0 {
            bail!("ports must not be 0");
        }
        if self.router.username.is_empty() {
            bail!("router.username must not be empty");
        }
        if self.router.download_queue.is_empty() || self.router.upload_queue.is_empty() {
            bail!("queue names must not be empty");
        }
        Ok(())
    }
}

fn env_override<T>(target: &mut T, var: &str) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Ok(raw) = std::env::var(var) {
        *target = raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}={:?}: {}", var, raw, e))?;
        debug!(%var, "environment override applied");
    }
    Ok(())
}
