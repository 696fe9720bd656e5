use serde::{Deserialize, Serialize};

use crate::camera::{CameraKind, CameraPath};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Streaming defaults and limits
    pub stream: StreamConfig,
    /// ICE / peer connection settings
    pub webrtc: WebRtcSettings,
    /// Media storage used to sign file-backed camera paths
    pub storage: StorageConfig,
    /// Managed cameras
    pub cameras: Vec<CameraConfig>,
    /// Gateways owning remote capture devices
    pub gateways: Vec<GatewayConfig>,
}

impl AppConfig {
    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }

    pub fn gateway(&self, id: &str) -> Option<&GatewayConfig> {
        self.gateways.iter().find(|g| g.id == id)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err("camera id must not be empty".to_string());
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(format!("duplicate camera id '{}'", camera.id));
            }
            if let Some(gateway) = &camera.gateway {
                if self.gateway(gateway).is_none() {
                    return Err(format!(
                        "camera '{}' references unknown gateway '{}'",
                        camera.id, gateway
                    ));
                }
            }
        }
        if self.stream.max_sessions == 0 {
            return Err("stream.max_sessions must be at least 1".to_string());
        }
        if self.stream.negotiation_timeout_ms == 0 {
            return Err("stream.negotiation_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// Bind addresses
    pub bind_addresses: Vec<String>,
    /// Allow cross-origin requests (browser players on another origin)
    pub cors_enabled: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8000,
            bind_addresses: vec!["0.0.0.0".to_string()],
            cors_enabled: true,
        }
    }
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Deadline for a local offer/answer exchange (ms)
    pub negotiation_timeout_ms: u64,
    /// Deadline for closing a peer connection during teardown (ms)
    pub close_timeout_ms: u64,
    /// Maximum concurrent local sessions
    pub max_sessions: usize,
    /// Interval of the terminal-session sweep (seconds)
    pub reap_interval_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            max_sessions: 16,
            reap_interval_secs: 30,
        }
    }
}

/// ICE settings applied to every local session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebRtcSettings {
    /// STUN server URLs (e.g. "stun:stun.l.google.com:19302")
    pub stun_servers: Vec<String>,
    /// mDNS mode: "disabled", "query_only", "query_and_gather"
    pub mdns_mode: Option<String>,
    /// Upper bound for ICE gathering before the answer is returned (ms)
    pub ice_gathering_timeout_ms: u64,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            stun_servers: vec![],
            mdns_mode: None,
            ice_gathering_timeout_ms: 2000,
        }
    }
}

/// Media storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for file-backed camera keys
    pub media_root: String,
    /// Lifetime of signed media URLs (seconds)
    pub sign_expires_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: "/var/lib/camrtc/media".to_string(),
            sign_expires_secs: 3600,
        }
    }
}

/// Camera definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: CameraKind,
    pub path: CameraPath,
    /// Gateway id for cameras attached to a remote capture device
    #[serde(default)]
    pub gateway: Option<String>,
}

/// Gateway definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Base URL of the gateway API (e.g. "http://10.0.0.5:8001")
    pub api_url: String,
    /// Path of the remote stream endpoint
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Request timeout for remote stream calls (ms)
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stream_path() -> String {
    "/inference_pipelines/webrtc".to_string()
}

fn default_remote_timeout_ms() -> u64 {
    15_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str, gateway: Option<&str>) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            name: String::new(),
            kind: CameraKind::Usb,
            path: CameraPath::Index(0),
            gateway: gateway.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            [web]
            http_port = 9000

            [[cameras]]
            id = "front"
            kind = "rtsp"
            path = "rtsp://10.0.0.2/stream"

            [[cameras]]
            id = "desk"
            kind = "usb"
            path = 0
            gateway = "edge"

            [[gateways]]
            id = "edge"
            api_url = "http://10.0.0.5:8001"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.stream.negotiation_timeout_ms, 10_000);
        assert_eq!(config.cameras.len(), 2);
        assert_eq!(config.cameras[1].path, CameraPath::Index(0));
        assert_eq!(config.gateway("edge").unwrap().stream_path, default_stream_path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_gateway() {
        let config = AppConfig {
            cameras: vec![camera("a", Some("missing"))],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("unknown gateway"));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = AppConfig {
            cameras: vec![camera("a", None), camera("a", None)],
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("duplicate"));
    }
}
