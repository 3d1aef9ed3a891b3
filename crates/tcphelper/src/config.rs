//! Helper configuration
//!
//! A [`HelperConfig`] can be built in code or loaded from a JSON file:
//!
//! ```json
//! { "timeout_ms": 5000, "chunk_size": 4096 }
//! ```
//!
//! Both fields are optional. Invalid values are rejected when the
//! configuration is built, never later when it is used.

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

/// Bytes per read or write call unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

const DEFAULT_CHUNK_SIZE_NONZERO: NonZeroUsize = match NonZeroUsize::new(DEFAULT_CHUNK_SIZE) {
    Some(n) => n,
    None => panic!("default chunk size is zero"),
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("timeout must be positive, use no timeout to wait forever")]
    ZeroTimeout,

    #[error("reading configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing configuration")]
    Parse(#[source] serde_json::Error),
}

/// Tunables for a [`Helper`](crate::Helper)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "ConfigFormat")]
pub struct HelperConfig {
    timeout: Option<Duration>,
    chunk_size: NonZeroUsize,
}

/// Deserializable model for the configuration file
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFormat {
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default = "default_chunk_size")]
    chunk_size: usize,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl TryFrom<ConfigFormat> for HelperConfig {
    type Error = ConfigError;

    fn try_from(value: ConfigFormat) -> Result<Self, Self::Error> {
        HelperConfig::default()
            .with_chunk_size(value.chunk_size)?
            .with_timeout(value.timeout_ms.map(Duration::from_millis))
    }
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            chunk_size: DEFAULT_CHUNK_SIZE_NONZERO,
        }
    }
}

impl HelperConfig {
    /// Set the number of bytes moved per read or write call
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self, ConfigError> {
        self.chunk_size = NonZeroUsize::new(chunk_size).ok_or(ConfigError::ZeroChunkSize)?;
        Ok(self)
    }

    /// Set how long a single read or write may stall, `None` waits forever
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Result<Self, ConfigError> {
        if timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout);
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    pub(crate) fn chunk_size_nonzero(&self) -> NonZeroUsize {
        self.chunk_size
    }

    /// Load the configuration from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }
}

impl FromStr for HelperConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(ConfigError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HelperConfig::default();
        assert_eq!(config.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            HelperConfig::default().with_chunk_size(0),
            Err(ConfigError::ZeroChunkSize)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert!(matches!(
            HelperConfig::default().with_timeout(Some(Duration::ZERO)),
            Err(ConfigError::ZeroTimeout)
        ));
        let config = HelperConfig::default().with_timeout(None).unwrap();
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_parse_json() {
        let config: HelperConfig = r#"{"timeout_ms": 250, "chunk_size": 4}"#.parse().unwrap();
        assert_eq!(config.chunk_size(), 4);
        assert_eq!(config.timeout(), Some(Duration::from_millis(250)));

        let config: HelperConfig = "{}".parse().unwrap();
        assert_eq!(config, HelperConfig::default());
    }

    #[test]
    fn test_parse_json_validates() {
        assert!(matches!(
            r#"{"chunk_size": 0}"#.parse::<HelperConfig>(),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            r#"{"chunk": 12}"#.parse::<HelperConfig>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = HelperConfig::from_path("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
