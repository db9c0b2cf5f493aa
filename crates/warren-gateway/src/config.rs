//! Gateway configuration.
//!
//! Configuration is parsed once at the boundary into this immutable
//! value and threaded by dependency injection; nothing reads the
//! process environment ad hoc.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use warren_core::{Error, OwnedId, Result};
use warren_keys::{AuthKey, KeyPairConfig};
use warren_replica::{ReusableConfig, DEFAULT_LOCK_TIMEOUT};

/// Immutable gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway domain name, e.g. `gw.example.org`
    pub domain: String,
    /// Public gateway address clients connect to
    pub address: String,
    /// The gateway's own authorization key, `app.keyid:secret`
    pub auth_key: String,
    /// The gateway's signing pair; generated fresh when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyPairConfig>,
    /// Root directory for registry and sub-domain data
    pub data_dir: PathBuf,
    /// Whether this gateway originates its tenant registry
    #[serde(default)]
    pub genesis: bool,
    /// Bound on live sub-domain clones held in memory
    #[serde(default = "default_cache_size")]
    pub subdomain_cache_size: usize,
    /// Bound in milliseconds on waiting for a sub-domain's advisory
    /// lock before a stale hold is forced open; `None` waits forever
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    /// SMTP settings for activation emails, consumed by the notifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpConfig>,
    /// Engine tuning shared with client clones
    #[serde(default)]
    pub transport: ReusableConfig,
}

/// SMTP settings for sending activation codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Mail server host
    pub host: String,
    /// Mail server port
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// From address on activation emails
    pub from: String,
    /// Authentication user, if the server requires it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Authentication password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_cache_size() -> usize {
    100
}

fn default_lock_timeout_ms() -> Option<u64> {
    Some(DEFAULT_LOCK_TIMEOUT.as_millis() as u64)
}

fn default_smtp_port() -> u16 {
    587
}

impl GatewayConfig {
    /// Parse a configuration document.
    pub fn from_toml(doc: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(doc).map_err(|e| Error::bad_request(format!("configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants not expressible in the type.
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(Error::bad_request("no domain specified for gateway"));
        }
        for part in self.domain.split('.') {
            OwnedId::check_component_id(part)?;
        }
        if self.address.is_empty() {
            return Err(Error::bad_request("no address specified for gateway"));
        }
        self.parsed_auth_key()?;
        Ok(())
    }

    /// The configured authorization key.
    pub fn parsed_auth_key(&self) -> Result<AuthKey> {
        self.auth_key.parse()
    }

    /// The advisory-lock wait bound.
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }
}
