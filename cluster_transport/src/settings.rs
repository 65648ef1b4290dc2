// SPDX-License-Identifier: MIT OR Apache-2.0
//! Service settings and environment overrides.

use serde::{Deserialize, Serialize};

use crate::{
    codec::CompressionConfig,
    error::{Result, TransportError},
    tracer::TraceFilter,
};

/// Environment variable names for configuration.
pub const ENV_NODE_NAME: &str = "CLUSTER_TRANSPORT_NODE_NAME";
pub const ENV_TRACE_INCLUDE: &str = "CLUSTER_TRANSPORT_TRACE_INCLUDE";
pub const ENV_TRACE_EXCLUDE: &str = "CLUSTER_TRANSPORT_TRACE_EXCLUDE";
pub const ENV_COMPRESS: &str = "CLUSTER_TRANSPORT_COMPRESS";
pub const ENV_COMPRESSION_MIN_SIZE: &str = "CLUSTER_TRANSPORT_COMPRESSION_MIN_SIZE";
pub const ENV_MAX_MESSAGE_SIZE: &str = "CLUSTER_TRANSPORT_MAX_MESSAGE_SIZE";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "CLUSTER_TRANSPORT_CONNECT_TIMEOUT_MS";

/// Default maximum encoded message size (100 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

mod env_parse {
    use super::{Result, TransportError};

    pub fn parse_usize(key: &str) -> Option<Result<usize>> {
        std::env::var(key).ok().map(|val| {
            val.trim()
                .parse()
                .map_err(|e| TransportError::Config(format!("invalid {key}: {e}")))
        })
    }

    pub fn parse_u64(key: &str) -> Option<Result<u64>> {
        std::env::var(key).ok().map(|val| {
            val.trim()
                .parse()
                .map_err(|e| TransportError::Config(format!("invalid {key}: {e}")))
        })
    }

    /// Accepts "true", "1", "yes", "on" as true and "false", "0", "no",
    /// "off" as false (case-insensitive).
    pub fn parse_bool(key: &str) -> Option<Result<bool>> {
        std::env::var(key)
            .ok()
            .map(|val| match val.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(TransportError::Config(format!(
                    "invalid {key}: expected boolean (true/false/1/0/yes/no/on/off)"
                ))),
            })
    }

    /// Comma-separated list; entries are trimmed and empty ones dropped.
    pub fn parse_list(key: &str) -> Option<Vec<String>> {
        std::env::var(key).ok().map(|val| super::split_list(&val))
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn default_node_name() -> String {
    "node".to_string()
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Action patterns selecting which requests are traced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSettings {
    /// Patterns to trace. Empty traces everything.
    #[serde(default)]
    pub include: Vec<String>,
    /// Patterns never traced, even when included.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TraceSettings {
    #[must_use]
    pub fn filter(&self) -> TraceFilter {
        TraceFilter::new(self.include.iter().cloned(), self.exclude.iter().cloned())
    }
}

/// Settings for a [`TransportService`](crate::service::TransportService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Id this node announces to peers.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default)]
    pub trace: TraceSettings,

    /// Compress request bodies unless the request options say otherwise.
    #[serde(default)]
    pub compress: bool,

    #[serde(default)]
    pub compression: CompressionConfig,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            trace: TraceSettings::default(),
            compress: false,
            compression: CompressionConfig::default(),
            max_message_size: default_max_message_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TransportSettings {
    #[must_use]
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Loads settings from environment variables on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Ok(name) = std::env::var(ENV_NODE_NAME) {
            settings.node_name = name;
        }
        if let Some(include) = env_parse::parse_list(ENV_TRACE_INCLUDE) {
            settings.trace.include = include;
        }
        if let Some(exclude) = env_parse::parse_list(ENV_TRACE_EXCLUDE) {
            settings.trace.exclude = exclude;
        }
        if let Some(result) = env_parse::parse_bool(ENV_COMPRESS) {
            settings.compress = result?;
        }
        if let Some(result) = env_parse::parse_usize(ENV_COMPRESSION_MIN_SIZE) {
            settings.compression.min_size = result?;
        }
        if let Some(result) = env_parse::parse_usize(ENV_MAX_MESSAGE_SIZE) {
            settings.max_message_size = result?;
        }
        if let Some(result) = env_parse::parse_u64(ENV_CONNECT_TIMEOUT_MS) {
            settings.connect_timeout_ms = result?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// # Errors
    ///
    /// Returns `Config` for an empty node name or a zero message size.
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(TransportError::Config("node_name must not be empty".into()));
        }
        if self.max_message_size == 0 {
            return Err(TransportError::Config(
                "max_message_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_trace_include<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trace.include = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_trace_exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trace.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    #[must_use]
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    #[must_use]
    pub const fn with_connect_timeout_ms(mut self, millis: u64) -> Self {
        self.connect_timeout_ms = millis;
        self
    }

    #[must_use]
    pub fn trace_filter(&self) -> TraceFilter {
        self.trace.filter()
    }
}
