// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with driver configuration

use crate::topic::TOPIC_PROCESS_ON_HOST_V2;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use serde::Deserialize;
use slog::Logger;
use std::time::Duration;

/// Configuration for the LBaaS driver process
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Configuration for the driver log
    pub log: ConfigLogging,
    /// How to reach the message bus
    pub rpc: RpcConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

fn default_topic_base() -> String {
    TOPIC_PROCESS_ON_HOST_V2.to_string()
}

fn default_exchange() -> String {
    "common".to_string()
}

fn default_worker_count() -> usize {
    16
}

#[derive(Clone, Debug, Deserialize)]
pub struct RpcConfig {
    /// URL of the message bus, e.g. `local://`
    pub transport_url: String,
    /// Topic the driver listens on, before any environment suffix
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Identity of this server on the bus
    pub host: String,
    /// Maximum number of calls serviced at once
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DriverConfig {
    /// Deployment environment tag appended to the topic
    #[serde(default)]
    pub environment: Option<String>,
    /// How long subnet lookups are cached.  Lookups are not cached when
    /// unset.
    #[serde(default)]
    pub subnet_cache_ttl_secs: Option<u64>,
}

impl DriverConfig {
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref().filter(|env| !env.is_empty())
    }

    pub fn subnet_cache_ttl(&self) -> Option<Duration> {
        self.subnet_cache_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config in {path}: {message}")]
    Invalid { path: Utf8PathBuf, message: String },
    #[error("Failed to create logger")]
    Logging(#[source] std::io::Error),
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate().map_err(|message| ConfigError::Invalid {
            path: path.into(),
            message,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.rpc.worker_count == 0 {
            return Err("rpc.worker_count must be at least 1".to_string());
        }
        if self.rpc.host.is_empty() {
            return Err("rpc.host must not be empty".to_string());
        }
        if self.rpc.topic_base.is_empty() {
            return Err("rpc.topic_base must not be empty".to_string());
        }
        if self.driver.subnet_cache_ttl_secs == Some(0) {
            return Err("driver.subnet_cache_ttl_secs must be at least 1 \
                        (omit it to disable caching)"
                .to_string());
        }
        Ok(())
    }

    /// Builds the process's root logger from the `[log]` section
    pub fn root_logger(&self) -> Result<Logger, ConfigError> {
        self.log.to_logger("f5-lbaas").map_err(ConfigError::Logging)
    }
}
