//! Relay configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Size of the buffer one RTP packet is read into (typical network MTU)
pub const DEFAULT_RTP_BUFFER_SIZE: usize = 1400;

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Read buffer size of the forwarding loop, in bytes
    pub rtp_buffer_size: usize,
    /// Relay picture-loss / full-intra requests from subscribers as events
    pub forward_rtcp: bool,
    pub logging: LoggingConfig,
    pub webrtc: WebRtcConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rtp_buffer_size: DEFAULT_RTP_BUFFER_SIZE,
            forward_rtcp: true,
            logging: LoggingConfig::default(),
            webrtc: WebRtcConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`
    pub format: String,
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Settings of the webrtc-rs engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN/TURN URLs handed to every peer connection
    pub ice_servers: Vec<String>,
    pub ice_username: Option<String>,
    pub ice_credential: Option<String>,
    /// UDP port range for ICE (0 = let the OS choose)
    pub udp_port_min: u16,
    pub udp_port_max: u16,
}

impl WebRtcConfig {
    /// Whether an explicit UDP port range is configured
    #[must_use]
    pub const fn has_udp_port_range(&self) -> bool {
        self.udp_port_min > 0 && self.udp_port_max >= self.udp_port_min
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            ice_username: None,
            ice_credential: None,
            udp_port_min: 0,
            udp_port_max: 0,
        }
    }
}

impl RelayConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SYNCTV_RELAY_RTP_BUFFER_SIZE, SYNCTV_RELAY_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("SYNCTV_RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.rtp_buffer_size, 1400);
        assert!(config.forward_rtcp);
        assert_eq!(config.logging.level, "info");
        assert!(!config.webrtc.has_udp_port_range());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "rtp_buffer_size = 1500\nforward_rtcp = false\n\n\
             [webrtc]\nudp_port_min = 40000\nudp_port_max = 40100"
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.rtp_buffer_size, 1500);
        assert!(!config.forward_rtcp);
        assert!(config.webrtc.has_udp_port_range());
        // Untouched sections keep their defaults
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("SYNCTV_RELAY_WEBRTC__ICE_USERNAME", "relay-user");
        let config = RelayConfig::from_env().unwrap();
        std::env::remove_var("SYNCTV_RELAY_WEBRTC__ICE_USERNAME");

        assert_eq!(config.webrtc.ice_username.as_deref(), Some("relay-user"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = RelayConfig::load(Some("/nonexistent/relay.toml")).unwrap();
        assert_eq!(config.rtp_buffer_size, DEFAULT_RTP_BUFFER_SIZE);
    }

    #[test]
    fn test_invalid_value_is_config_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "rtp_buffer_size = \"lots\"").unwrap();

        let result = RelayConfig::from_file(file.path().to_str().unwrap());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_udp_port_range_requires_ordered_bounds() {
        let mut webrtc = WebRtcConfig {
            udp_port_min: 40100,
            udp_port_max: 40000,
            ..Default::default()
        };
        assert!(!webrtc.has_udp_port_range());

        webrtc.udp_port_max = 40100;
        assert!(webrtc.has_udp_port_range());
    }
}
