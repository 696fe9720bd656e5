//! WebRTC streaming of local cameras
//!
//! Architecture:
//! ```text
//! StreamRequest (offer)
//!        |
//!        v
//! SessionRunner ---- worker thread (current-thread runtime) ----+
//!        |                                                      |
//!        v                                                      v
//! SessionConnection (RTCPeerConnection, H.264 sample track)  frame pump
//!        |                                                      |
//!        v                                                      v
//! answer SDP                                 FrameTrack -> OpenH264Encoder
//!                                                 |
//!                                          VideoSourceHandle
//! ```

pub mod config;
pub mod mdns;
pub mod pump;
pub mod runner;
pub mod session;
pub mod signaling;
pub mod track;

pub use config::{TurnServer, WebRtcConfig};
pub use pump::HealthSnapshot;
pub use runner::{EncoderFactory, SessionContext, SessionInfo, SessionRunner};
pub use session::{ConnectionObserver, SessionConnection};
pub use signaling::{
    ConnectionState, SessionDescription, SessionState, StreamRequest, StreamResponse, TurnConfig,
};
pub use track::{FrameTrack, TimeBase, TrackFrame, TrackFrameKind};
