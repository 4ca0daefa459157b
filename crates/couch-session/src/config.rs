//! Configuration for the session store.
//!
//! Maps to a TOML table or any other serde source:
//! ```toml
//! host = "10.0.0.1:8093;10.0.0.2:8093"   # or an array, or `hosts = [...]`
//! username = "sessions"
//! password = "secret"
//! bucket = "sessions"
//! prefix = "sess:"
//! ttl = 3600                             # seconds, 0 or absent = use cookie maxAge
//! connection_timeout = 2000              # milliseconds
//! operation_timeout = 2000
//! touch_policy = "anti-thrash"
//! ```
//!
//! Unknown keys are ignored so an application can keep extra settings in the
//! same table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ttl::TouchPolicy;

/// Default key prefix prepended to every session id.
pub const DEFAULT_PREFIX: &str = "sess:";

/// Default query service address.
pub const DEFAULT_HOST: &str = "127.0.0.1:8093";

/// Default bucket name.
pub const DEFAULT_BUCKET: &str = "default";

/// Default connection and operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a [`CouchbaseStore`](crate::CouchbaseStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoreConfigFile")]
pub struct StoreConfig {
    /// Query service addresses (`host` or `host:port`).
    pub host: Vec<String>,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Bucket holding the session documents.
    pub bucket: String,

    /// Prefix prepended to every session id to form the storage key.
    pub prefix: String,

    /// Store-wide TTL override in seconds. `None` and `Some(0)` both defer
    /// to the cookie's `maxAge`.
    pub ttl: Option<u64>,

    /// HTTP connect timeout in milliseconds.
    pub connection_timeout: u64,

    /// Per-operation timeout in milliseconds.
    pub operation_timeout: u64,

    /// How `touch` decides between a full rewrite and an expiry refresh.
    pub touch_policy: TouchPolicy,
}

/// On-disk shape of [`StoreConfig`].
///
/// `host` and `hosts` are read separately; `host` wins when both are set.
#[derive(Deserialize)]
#[serde(default)]
struct StoreConfigFile {
    #[serde(deserialize_with = "deserialize_hosts")]
    host: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_hosts")]
    hosts: Option<Vec<String>>,
    username: Option<String>,
    password: Option<String>,
    #[serde(alias = "namespace")]
    bucket: String,
    prefix: String,
    ttl: Option<u64>,
    #[serde(alias = "connectionTimeout")]
    connection_timeout: u64,
    #[serde(alias = "operationTimeout")]
    operation_timeout: u64,
    #[serde(alias = "touchPolicy")]
    touch_policy: TouchPolicy,
}

impl Default for StoreConfigFile {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self {
            host: None,
            hosts: None,
            username: defaults.username,
            password: defaults.password,
            bucket: defaults.bucket,
            prefix: defaults.prefix,
            ttl: defaults.ttl,
            connection_timeout: defaults.connection_timeout,
            operation_timeout: defaults.operation_timeout,
            touch_policy: defaults.touch_policy,
        }
    }
}

impl From<StoreConfigFile> for StoreConfig {
    fn from(file: StoreConfigFile) -> Self {
        let host = file
            .host
            .or(file.hosts)
            .unwrap_or_else(|| vec![DEFAULT_HOST.to_string()]);
        Self {
            host,
            username: file.username,
            password: file.password,
            bucket: file.bucket,
            prefix: file.prefix,
            ttl: file.ttl,
            connection_timeout: file.connection_timeout,
            operation_timeout: file.operation_timeout,
            touch_policy: file.touch_policy,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: vec![DEFAULT_HOST.to_string()],
            username: None,
            password: None,
            bucket: DEFAULT_BUCKET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            ttl: None,
            connection_timeout: DEFAULT_TIMEOUT_MS,
            operation_timeout: DEFAULT_TIMEOUT_MS,
            touch_policy: TouchPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the query service hosts.
    pub fn with_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.host = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Set username and password.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the bucket name.
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set a store-wide TTL in seconds.
    pub fn with_ttl(mut self, secs: u64) -> Self {
        self.ttl = Some(secs);
        self
    }

    /// Set the connect timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the touch policy.
    pub fn with_touch_policy(mut self, policy: TouchPolicy) -> Self {
        self.touch_policy = policy;
        self
    }

    /// Store-wide TTL, with `0` treated as unset.
    pub fn ttl_override(&self) -> Option<u64> {
        self.ttl.filter(|&secs| secs > 0)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout)
    }

    /// Check the configuration for programmer errors.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("at least one host is required".to_string()));
        }
        if let Some(host) = self.host.iter().find(|h| h.trim().is_empty()) {
            return Err(Error::Config(format!("invalid host entry '{}'", host)));
        }
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("bucket name must not be empty".to_string()));
        }
        if self.bucket.contains('`') {
            return Err(Error::Config(format!(
                "bucket name '{}' must not contain backticks",
                self.bucket
            )));
        }
        match (&self.username, &self.password) {
            (Some(_), None) => {
                return Err(Error::Config("username given without password".to_string()));
            }
            (None, Some(_)) => {
                return Err(Error::Config("password given without username".to_string()));
            }
            _ => {}
        }
        if self.connection_timeout == 0 || self.operation_timeout == 0 {
            return Err(Error::Config("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }
}

/// Accepts `"a;b"`, `"a"` or `["a", "b"]`.
fn deserialize_hosts<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Hosts {
        One(String),
        Many(Vec<String>),
    }

    let hosts = match Hosts::deserialize(deserializer)? {
        Hosts::One(s) => s.split(';').map(str::to_string).collect::<Vec<_>>(),
        Hosts::Many(v) => v,
    };
    Ok(Some(
        hosts
            .into_iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect(),
    ))
}
