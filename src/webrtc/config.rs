//! WebRTC configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_server::RTCIceServer;

use super::mdns;
use crate::config::WebRtcSettings;

/// Per-session WebRTC configuration
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// mDNS candidate handling
    pub mdns_mode: MulticastDnsMode,
    pub ice: IceConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates work directly on a LAN
            stun_servers: vec![],
            turn_servers: vec![],
            mdns_mode: mdns::mdns_mode(None),
            ice: IceConfig::default(),
        }
    }
}

impl WebRtcConfig {
    /// Build from the service settings
    pub fn from_settings(settings: &WebRtcSettings) -> Self {
        Self {
            stun_servers: settings.stun_servers.clone(),
            turn_servers: vec![],
            mdns_mode: mdns::mdns_mode(settings.mdns_mode.as_deref()),
            ice: IceConfig {
                gathering_timeout_ms: settings.ice_gathering_timeout_ms,
            },
        }
    }

    /// Add a TURN server supplied with a stream request
    pub fn with_turn(mut self, turn: Option<TurnServer>) -> Self {
        self.turn_servers.extend(turn);
        self
    }

    /// ICE servers for the peer connection
    ///
    /// TURN entries without credentials are skipped: the agent would reject
    /// the whole configuration otherwise.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();

        for stun_url in &self.stun_servers {
            servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            if turn.urls.is_empty() {
                continue;
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                warn!(
                    "Skipping TURN server without credentials: {}",
                    turn.urls.join(", ")
                );
                continue;
            }
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            });
        }

        servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (e.g. ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// ICE configuration
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// Upper bound for candidate gathering before the answer is returned (ms)
    pub gathering_timeout_ms: u64,
}

impl IceConfig {
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            gathering_timeout_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_has_no_ice_servers() {
        let config = WebRtcConfig {
            mdns_mode: MulticastDnsMode::Disabled,
            ..Default::default()
        };
        assert!(config.ice_servers().is_empty());
    }

    #[test]
    fn test_turn_without_credentials_is_skipped() {
        let settings = WebRtcSettings {
            stun_servers: vec!["stun:stun.example.com:3478".to_string()],
            ..Default::default()
        };
        let config = WebRtcConfig::from_settings(&settings)
            .with_turn(Some(TurnServer::new(
                "turn:turn.example.com:3478".to_string(),
                String::new(),
                String::new(),
            )));
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
    }

    #[test]
    fn test_turn_with_credentials() {
        let config = WebRtcConfig::default().with_turn(Some(TurnServer::new(
            "turn:turn.example.com:3478".to_string(),
            "user".to_string(),
            "secret".to_string(),
        )));
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "user");
        assert_eq!(servers[0].credential, "secret");
    }
}
