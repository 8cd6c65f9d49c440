//! Service configuration.
//!
//! The on-disk format is TOML. Durations are plain numbers with the unit in
//! the field name. Every section is optional unless validation says
//! otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matcher::DEFAULT_RULE;

/// Top-level configuration of a portcullis service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Downstream proxy servers, by name
    #[serde(default)]
    pub downstreams: HashMap<String, ProxyConfig>,
    /// Upstream proxy clients, by name
    #[serde(default)]
    pub upstreams: HashMap<String, ProxyConfig>,
    /// Dispatch rules, by name; `default` is the fallback rule
    #[serde(default)]
    pub rules: HashMap<String, RuleConfig>,
    /// Logging options
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Everything else
    #[serde(default)]
    pub misc: MiscConfig,
}

/// One proxy endpoint, downstream or upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Protocol: `socks5`, `direct` or `http`
    pub protocol: String,
    /// Transport stack under the protocol
    #[serde(default)]
    pub transport: Option<TransportConfig>,
    /// Listen/connect address (`host:port`)
    #[serde(default)]
    pub address: Option<String>,
    /// Use the compact dialect without the hello/select phase
    #[serde(default)]
    pub simplified: bool,
    /// Require user/password authentication (server side)
    #[serde(default)]
    pub check_users: bool,
    /// Username presented to the upstream (client side)
    #[serde(default)]
    pub username: Option<String>,
    /// Password presented to the upstream (client side)
    #[serde(default)]
    pub password: Option<String>,
}

/// A transport stack descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    /// Outermost compression: `lz4`, `snappy` or `deflate`
    #[serde(default)]
    pub compression: Option<String>,
    /// TLS layer
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// KCP-style reliable-UDP inner layer
    #[serde(default)]
    pub kcp: Option<KcpConfig>,
    /// Dial through another proxy instead of a raw socket
    #[serde(default)]
    pub proxied: Option<Box<ProxyConfig>>,
    /// Keep a warm pool of pre-established connections per target
    #[serde(default)]
    pub pre_conn: Option<PreConnConfig>,
}

/// TLS layer options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain presented to the peer
    pub cert: String,
    /// PEM private key
    pub key: String,
    /// Require and verify a client certificate (server side)
    #[serde(default)]
    pub verify_client: bool,
    /// Explicit root CA set; empty means the system store
    #[serde(default)]
    pub cas: Vec<String>,
    /// Extra roots added on top of the system store
    #[serde(default)]
    pub extra_cas: Vec<String>,
    /// Roots used to verify client certificates
    #[serde(default)]
    pub client_cas: Vec<String>,
    /// Handshake timeout, default 60
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
}

/// KCP transport options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KcpConfig {
    /// `normal`, `fast` or `fast2`
    #[serde(default)]
    pub mode: String,
    /// `balance`, `send`, `receive` or `server`
    #[serde(default)]
    pub optimize: String,
    /// Enable forward error correction
    #[serde(default)]
    pub fec: bool,
    /// FEC shard ratio as `data,parity`, default `10,2`
    #[serde(default)]
    pub fec_dist: Option<String>,
    /// Keepalive probe interval; requires the timeout as well
    #[serde(default)]
    pub keep_alive_interval_ms: Option<u64>,
    /// Keepalive eviction timeout; requires the interval as well
    #[serde(default)]
    pub keep_alive_timeout_ms: Option<u64>,
}

/// Pre-connect pool options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreConnConfig {
    /// Pool capacity per target, default 5
    #[serde(default)]
    pub max_pool_size: Option<usize>,
    /// Lifetime of a pooled connection in seconds, default 600
    #[serde(default)]
    pub lifetime_secs: Option<u64>,
}

/// A dispatch rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    /// Upstreams this rule dispatches to; empty means reject
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// CIDR or bare-IP patterns
    #[serde(default)]
    pub ips: Vec<String>,
    /// Anchored regular expressions over domain names
    #[serde(default)]
    pub domains: Vec<String>,
}

/// Logging options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level: `debug`, `info`, `warn` or `error`
    #[serde(default)]
    pub level: Option<String>,
}

/// Miscellaneous settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MiscConfig {
    /// Upstream connect timeout in seconds, default 60
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl Config {
    /// Parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Search the default locations for a configuration file.
    pub fn find_default() -> Result<PathBuf> {
        let mut candidates = vec![PathBuf::from("portcullis.toml")];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(Path::new(&home).join(".portcullis.toml"));
        }
        if !cfg!(windows) {
            candidates.push(PathBuf::from("/usr/local/etc/portcullis.toml"));
            candidates.push(PathBuf::from("/etc/portcullis.toml"));
        }
        candidates
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| Error::config("no config file found in the default locations"))
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.downstreams.is_empty() {
            return Err(Error::config("no downstream server defined"));
        }
        if self.upstreams.is_empty() {
            return Err(Error::config("no upstream server defined"));
        }
        if let Some(rule) = self.rules.get(DEFAULT_RULE) {
            if !rule.ips.is_empty() || !rule.domains.is_empty() {
                return Err(Error::config(
                    "default rule should not have actual rules",
                ));
            }
        }
        for (name, rule) in &self.rules {
            for upstream in &rule.upstreams {
                if !self.upstreams.contains_key(upstream) {
                    return Err(Error::config(format!(
                        "undefined upstream '{upstream}' used in rule '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}
