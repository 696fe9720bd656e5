//! WebRTC signaling types and messages

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::config::TurnServer;
use crate::error::{AppError, Result};

/// Highest accepted stream frame rate
pub const MAX_FPS: f64 = 120.0;

/// SDP offer or answer as exchanged with clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp: sdp.into(),
        }
    }

    /// Parse as an offer carrying at least one video section
    pub fn to_offer(&self) -> Result<RTCSessionDescription> {
        if self.sdp_type != "offer" {
            return Err(AppError::NegotiationError(format!(
                "expected an offer, got '{}'",
                self.sdp_type
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(AppError::NegotiationError("offer SDP is empty".to_string()));
        }

        let offer = RTCSessionDescription::offer(self.sdp.clone())
            .map_err(|e| AppError::NegotiationError(format!("invalid offer SDP: {}", e)))?;
        let parsed = offer
            .unmarshal()
            .map_err(|e| AppError::NegotiationError(format!("invalid offer SDP: {}", e)))?;
        let has_video = parsed
            .media_descriptions
            .iter()
            .any(|m| m.media_name.media == "video");
        if !has_video {
            return Err(AppError::NegotiationError(
                "offer has no video section".to_string(),
            ));
        }
        Ok(offer)
    }
}

/// TURN relay supplied by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// One URL or a list of URLs
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<TurnConfig> for TurnServer {
    fn from(turn: TurnConfig) -> Self {
        Self {
            urls: turn.urls,
            username: turn.username,
            credential: turn.credential,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

fn default_fps() -> f64 {
    30.0
}

fn default_processing_timeout() -> f64 {
    0.1
}

fn default_max_consecutive_timeouts() -> u32 {
    30
}

fn default_min_consecutive_on_time() -> u32 {
    5
}

/// Stream request for one camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub webrtc_offer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webrtc_turn_config: Option<TurnConfig>,
    /// Frames per second delivered to the peer
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Budget for producing one frame (seconds)
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout: f64,
    /// Consecutive late frames after which the stream is considered dead
    #[serde(default = "default_max_consecutive_timeouts")]
    pub max_consecutive_timeouts: u32,
    /// On-time frames needed before the stream is reported healthy
    #[serde(default = "default_min_consecutive_on_time")]
    pub min_consecutive_on_time: u32,
}

impl StreamRequest {
    pub fn new(offer: SessionDescription) -> Self {
        Self {
            webrtc_offer: offer,
            webrtc_turn_config: None,
            fps: default_fps(),
            processing_timeout: default_processing_timeout(),
            max_consecutive_timeouts: default_max_consecutive_timeouts(),
            min_consecutive_on_time: default_min_consecutive_on_time(),
        }
    }

    /// Check stream parameters; the offer is checked separately
    pub fn validate(&self) -> Result<()> {
        if !self.fps.is_finite() || self.fps <= 0.0 || self.fps > MAX_FPS {
            return Err(AppError::BadRequest(format!(
                "fps must be in (0, {}], got {}",
                MAX_FPS, self.fps
            )));
        }
        if !self.processing_timeout.is_finite() || self.processing_timeout <= 0.0 {
            return Err(AppError::BadRequest(format!(
                "processing_timeout must be positive, got {}",
                self.processing_timeout
            )));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(AppError::BadRequest(
                "max_consecutive_timeouts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    pub fn processing_budget(&self) -> Duration {
        Duration::from_secs_f64(self.processing_timeout)
    }

    pub fn turn_server(&self) -> Option<TurnServer> {
        self.webrtc_turn_config.clone().map(TurnServer::from)
    }
}

/// Stream response, local or relayed from a gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub sdp_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamResponse {
    pub fn success(answer: SessionDescription, session_id: Option<String>) -> Self {
        Self {
            status: "success".to_string(),
            sdp: Some(answer.sdp),
            sdp_type: Some(answer.sdp_type),
            error: None,
            session_id,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            sdp: None,
            sdp_type: None,
            error: Some(message.into()),
            session_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// Peer connection state as reported by the WebRTC stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn from_peer(state: RTCPeerConnectionState) -> Option<Self> {
        match state {
            RTCPeerConnectionState::New => Some(ConnectionState::New),
            RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
            RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
            RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
            RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle of one local stream session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (New, Negotiating)
                | (New, Closed)
                | (Negotiating, Connected)
                | (Negotiating, Closed)
                | (Connected, Failed)
                | (Connected, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let request: StreamRequest = serde_json::from_str(
            r#"{"webrtc_offer": {"type": "offer", "sdp": "v=0"}}"#,
        )
        .unwrap();
        assert_eq!(request.fps, 30.0);
        assert_eq!(request.processing_timeout, 0.1);
        assert_eq!(request.max_consecutive_timeouts, 30);
        assert_eq!(request.min_consecutive_on_time, 5);
        assert!(request.webrtc_turn_config.is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_request_validation() {
        let mut request = StreamRequest::new(SessionDescription::offer("v=0"));
        request.fps = 0.0;
        assert!(matches!(request.validate(), Err(AppError::BadRequest(_))));
        request.fps = 240.0;
        assert!(request.validate().is_err());
        request.fps = 15.0;
        request.processing_timeout = 0.0;
        assert!(request.validate().is_err());
        request.processing_timeout = 0.2;
        request.max_consecutive_timeouts = 0;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_turn_urls_accept_string_or_list() {
        let one: TurnConfig =
            serde_json::from_str(r#"{"urls": "turn:a:3478", "username": "u", "credential": "c"}"#)
                .unwrap();
        assert_eq!(one.urls, vec!["turn:a:3478"]);
        let many: TurnConfig =
            serde_json::from_str(r#"{"urls": ["turn:a:3478", "turns:a:5349"]}"#).unwrap();
        assert_eq!(many.urls.len(), 2);
        assert!(many.username.is_empty());
    }

    #[test]
    fn test_malformed_offer_rejected() {
        let answer = SessionDescription::answer("v=0");
        assert!(matches!(answer.to_offer(), Err(AppError::NegotiationError(_))));

        let garbage = SessionDescription::offer("this is not sdp");
        assert!(matches!(garbage.to_offer(), Err(AppError::NegotiationError(_))));

        let audio_only = SessionDescription::offer(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\nc=IN IP4 0.0.0.0\r\na=rtpmap:111 opus/48000/2\r\n",
        );
        assert!(matches!(audio_only.to_offer(), Err(AppError::NegotiationError(_))));
    }

    #[test]
    fn test_response_shape() {
        let ok = StreamResponse::success(SessionDescription::answer("v=0"), Some("s1".into()));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["type"], "answer");
        assert!(json.get("error").is_none());

        let err = serde_json::to_value(StreamResponse::error("boom")).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["error"], "boom");
        assert!(err.get("sdp").is_none());
    }

    #[test]
    fn test_session_transitions() {
        use SessionState::*;
        assert!(New.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Failed));
        assert!(Negotiating.can_transition_to(Closed));
        assert!(!Failed.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connected));
        assert!(!Negotiating.can_transition_to(Failed));
        assert!(Failed.is_terminal() && Closed.is_terminal());
    }
}
