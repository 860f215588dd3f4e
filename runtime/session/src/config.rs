//! Channel configuration
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.
//!
//! ```toml
//! shm_pages = 64
//! config_timeout_ms = 5000   # 0 waits forever
//! close_timeout_ms = 500
//! ```

use std::time::Duration;

use ree_ipc::{SharedRegion, PROTOCOL_VERSION};
use serde::Deserialize;

use crate::error::{Result, SessionError};

/// Tunables for one channel
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Size of the shared region in pages, control block included
    pub shm_pages: usize,
    /// Bound on waiting for CONFIG_ACK; 0 means no bound
    pub config_timeout_ms: u64,
    /// Bound on waiting for TERM_ACK during close
    pub close_timeout_ms: u64,
    /// Version written into the region header
    pub protocol_version: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            shm_pages: 64,
            config_timeout_ms: 5000,
            close_timeout_ms: 500,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl ChannelConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    /// Returns `SessionError::Config` on malformed TOML or unknown keys
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn config_timeout(&self) -> Option<Duration> {
        match self.config_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Allocate a zeroed shared region of the configured size
    pub fn create_region(&self) -> Result<SharedRegion> {
        Ok(SharedRegion::new(self.shm_pages)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = ChannelConfig::from_toml_str("").unwrap();
        assert_eq!(config, ChannelConfig::default());
        assert_eq!(config.close_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_document() {
        let text = "shm_pages = 16\nconfig_timeout_ms = 0\n";
        let config = ChannelConfig::from_toml_str(text).unwrap();
        assert_eq!(config.shm_pages, 16);
        assert_eq!(config.config_timeout(), None);
        assert_eq!(config.close_timeout_ms, 500);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ChannelConfig::from_toml_str("shm_page = 16").unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_region_size_checked() {
        let config = ChannelConfig {
            shm_pages: 2,
            ..ChannelConfig::default()
        };
        assert!(matches!(config.create_region(), Err(SessionError::Ipc(_))));
    }
}
