use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{IkatsError, Result};

/// Connection settings for the IKATS backends.
///
/// Both backends hang off the same host and port; each has its own root path.
/// Every field has a default, so a config file only needs the overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    /// Root path of the Temporal Data Manager (datamodel) API
    pub tdm_path: String,
    /// Root path of the OpenTSDB API
    pub tsdb_path: String,
    /// Root path of the operator catalog API
    pub catalog_path: String,
    /// Default per-request timeout
    pub timeout_secs: u64,
    /// Pause before re-querying an empty points range
    pub read_retry_delay_ms: u64,
    /// Max TSUIDs per metadata lookup (URL length limit)
    pub metadata_chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            port: 80,
            tdm_path: "/datamodel-api".to_string(),
            tsdb_path: "/opentsdb".to_string(),
            catalog_path: "/pybase/ikats/algo/catalogue".to_string(),
            timeout_secs: 300,
            read_retry_delay_ms: 4000,
            metadata_chunk_size: 100,
        }
    }
}

impl SessionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port, ..Self::default() }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| IkatsError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.host)
            .map_err(|e| IkatsError::Config(format!("Malformed host name '{}': {}", self.host, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(IkatsError::Config(format!("Host must be http(s), got '{}'", self.host)));
        }
        if url.host_str().is_none() {
            return Err(IkatsError::Config(format!("Malformed host name '{}'", self.host)));
        }
        if self.port == 0 || self.port == u16::MAX {
            return Err(IkatsError::Config(format!("Port must be within ]0;65535[ (got {})", self.port)));
        }
        if self.metadata_chunk_size == 0 {
            return Err(IkatsError::Config("metadata_chunk_size must be positive".into()));
        }
        Ok(())
    }

    pub fn tdm_url(&self) -> Result<Url> {
        self.root_url(&self.tdm_path)
    }

    pub fn tsdb_url(&self) -> Result<Url> {
        self.root_url(&self.tsdb_path)
    }

    pub fn catalog_url(&self) -> Result<Url> {
        self.root_url(&self.catalog_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    fn root_url(&self, path: &str) -> Result<Url> {
        self.validate()?;
        let mut url = Url::parse(&self.host)?;
        url.set_port(Some(self.port))
            .map_err(|_| IkatsError::Config(format!("Can't set port on '{}'", self.host)))?;
        url.set_path(path);
        Ok(url)
    }
}
