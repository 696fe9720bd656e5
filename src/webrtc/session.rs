//! Peer connection of one local stream session
//!
//! Owns the `RTCPeerConnection`, the outbound H.264 track and the frame
//! producer (track + encoder). Connection state changes are forwarded to a
//! [`ConnectionObserver`]; the session runner decides what they mean.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::WebRtcConfig;
use super::mdns::{default_mdns_host_name, mdns_mode_label};
use super::pump::{run_pump, FrameProducer, HealthSnapshot, PumpExit, PumpSettings, SharedProducer, StreamHealth};
use super::signaling::{ConnectionState, SessionDescription, StreamRequest};
use crate::error::{AppError, Result};

/// Constrained baseline, packetization mode 1: what browsers decode everywhere
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const STREAM_ID: &str = "camrtc";

/// Receives peer connection state changes
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_state(&self, state: ConnectionState);
}

fn negotiation_error(what: &str) -> impl Fn(webrtc::Error) -> AppError + '_ {
    move |e| AppError::NegotiationError(format!("{}: {}", what, e))
}

/// One WebRTC peer connection streaming a camera
pub struct SessionConnection {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    producer: SharedProducer,
    health: Arc<StreamHealth>,
    settings: PumpSettings,
    gathering_timeout: Duration,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionConnection {
    /// Build the peer connection with a single outbound H.264 track
    ///
    /// Must run inside the runtime that will drive the connection. On error
    /// the producer is dropped, which releases its video source.
    pub async fn create(
        session_id: &str,
        request: &StreamRequest,
        producer: FrameProducer,
        config: &WebRtcConfig,
        observer: Arc<dyn ConnectionObserver>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation_error("Failed to register codecs"))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(negotiation_error("Failed to register interceptors"))?;

        let mut setting_engine = SettingEngine::default();
        let mode = config.mdns_mode;
        setting_engine.set_ice_multicast_dns_mode(mode);
        if mode == MulticastDnsMode::QueryAndGather {
            setting_engine.set_multicast_dns_host_name(default_mdns_host_name(session_id));
        }
        debug!("WebRTC mDNS mode: {} (session {})", mdns_mode_label(mode), session_id);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(negotiation_error("Failed to create peer connection"))?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_owned(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", &session_id[..8.min(session_id.len())]),
            STREAM_ID.to_owned(),
        ));

        let rtp_sender = pc
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(negotiation_error("Failed to add video track"))?;

        // Interceptors only see RTCP that is read; keyframe requests come in here
        let keyframe_flag = producer.keyframe_flag();
        let rtcp_cancel = cancel.clone();
        let rtcp_session = session_id.to_string();
        tokio::spawn(async move {
            loop {
                let packets = tokio::select! {
                    _ = rtcp_cancel.cancelled() => break,
                    read = rtp_sender.read_rtcp() => match read {
                        Ok((packets, _)) => packets,
                        Err(_) => break,
                    },
                };
                let wants_keyframe = packets.iter().any(|p| {
                    let any = p.as_any();
                    any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>()
                });
                if wants_keyframe {
                    debug!("Keyframe requested by peer (session {})", rtcp_session);
                    keyframe_flag.store(true, Ordering::Release);
                }
            }
        });

        let connection = Self {
            session_id: session_id.to_string(),
            pc,
            video_track,
            producer: Arc::new(Mutex::new(Some(producer))),
            health: Arc::new(StreamHealth::default()),
            settings: PumpSettings::from_request(request),
            gathering_timeout: config.ice.gathering_timeout(),
            cancel,
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        connection.register_observers(observer);

        info!(
            "Session {} peer connection created ({} ICE servers)",
            session_id,
            config.ice_servers().len()
        );
        Ok(connection)
    }

    fn register_observers(&self, observer: Arc<dyn ConnectionObserver>) {
        let session_id = self.session_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let observer = observer.clone();
                let session_id = session_id.clone();
                Box::pin(async move {
                    if let Some(state) = ConnectionState::from_peer(s) {
                        info!("Session {} peer connection {}", session_id, state);
                        observer.on_connection_state(state);
                    }
                })
            }));

        let session_id = self.session_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                debug!("Session {} ICE connection {}", session_id, s);
                Box::pin(async {})
            }));

        let session_id = self.session_id.clone();
        self.pc
            .on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
                debug!("Session {} ICE gathering {}", session_id, s);
                Box::pin(async {})
            }));
    }

    /// Apply the offer and produce an answer carrying gathered candidates
    pub async fn negotiate(&self, offer: RTCSessionDescription) -> Result<SessionDescription> {
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(negotiation_error("Failed to set remote description"))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation_error("Failed to create answer"))?;

        let mut gathering_complete = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation_error("Failed to set local description"))?;

        if tokio::time::timeout(self.gathering_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "Session {} ICE gathering incomplete after {:?}, answering with candidates so far",
                self.session_id, self.gathering_timeout
            );
        }

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::NegotiationError("no local description".to_string()))?;
        debug!("Session {} answer ready ({} bytes)", self.session_id, local.sdp.len());
        Ok(SessionDescription::answer(local.sdp))
    }

    /// Start streaming frames on `handle`; `on_dead` runs if the stream dies
    pub fn start_pump(&self, handle: &Handle, on_dead: Box<dyn FnOnce() + Send>) {
        let mut slot = self.pump.lock();
        if slot.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let pump = run_pump(
            self.session_id.clone(),
            self.producer.clone(),
            self.video_track.clone(),
            self.settings.clone(),
            self.health.clone(),
            self.cancel.clone(),
        );
        *slot = Some(handle.spawn(async move {
            if pump.await == PumpExit::Dead {
                on_dead();
            }
        }));
        info!("Session {} streaming started", self.session_id);
    }

    pub fn is_streaming(&self) -> bool {
        self.pump.lock().is_some() && !self.closed.load(Ordering::Acquire)
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Stop the pump, release the track and its source, close the peer.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        // An in-flight frame job holds the producer lock until its read ends
        let producer = self.producer.clone();
        let track_closed = tokio::task::spawn_blocking(move || {
            if let Some(mut producer) = producer.lock().take() {
                producer.close();
            }
        });

        if let Err(e) = self.pc.close().await {
            warn!("Session {} peer connection close failed: {}", self.session_id, e);
        }
        if let Err(e) = track_closed.await {
            warn!("Session {} track close failed: {}", self.session_id, e);
        }

        info!("Session {} connection closed", self.session_id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-process offering peer

    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::peer_connection::RTCPeerConnection;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
    use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

    /// A receive-only video offer as a browser would send it
    ///
    /// The peer is returned so it outlives the negotiation under test.
    pub async fn browser_offer() -> (RTCPeerConnection, String) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        (pc, offer.sdp)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::browser_offer;
    use super::*;
    use crate::camera::{Camera, CameraKind, CameraPath};
    use crate::video::source::testing::{source, FakeOpener};
    use crate::webrtc::pump::testing::StubEncoder;
    use crate::webrtc::track::FrameTrack;

    struct RecordingObserver(Mutex<Vec<ConnectionState>>);

    impl ConnectionObserver for RecordingObserver {
        fn on_connection_state(&self, state: ConnectionState) {
            self.0.lock().push(state);
        }
    }

    fn test_config() -> WebRtcConfig {
        WebRtcConfig {
            mdns_mode: MulticastDnsMode::Disabled,
            ..Default::default()
        }
    }

    fn producer(opener: Arc<FakeOpener>) -> FrameProducer {
        let camera = Camera::new("cam", CameraKind::Rtsp, CameraPath::Text("rtsp://x".into()));
        let handle = source(opener).open(&camera).unwrap();
        FrameProducer::new(FrameTrack::new("video0", handle, 30.0), Box::new(StubEncoder::new()))
    }

    #[tokio::test]
    async fn test_negotiate_produces_h264_answer() {
        let (_offerer, offer_sdp) = browser_offer().await;
        let request = StreamRequest::new(SessionDescription::offer(offer_sdp));
        let opener = Arc::new(FakeOpener::new(vec![]));
        let observer = Arc::new(RecordingObserver(Mutex::new(vec![])));

        let connection = SessionConnection::create(
            "0123456789abcdef",
            &request,
            producer(opener.clone()),
            &test_config(),
            observer,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let offer = request.webrtc_offer.to_offer().unwrap();
        let answer = connection.negotiate(offer).await.unwrap();
        assert_eq!(answer.sdp_type, "answer");
        assert!(answer.sdp.contains("m=video"));
        assert!(answer.sdp.contains("H264"));

        connection.close().await;
        connection.close().await;
        assert_eq!(opener.counters.releases(), 1);
        assert!(!connection.is_streaming());
    }

    #[tokio::test]
    async fn test_pump_not_started_after_close() {
        let (_offerer, offer_sdp) = browser_offer().await;
        let request = StreamRequest::new(SessionDescription::offer(offer_sdp));
        let connection = SessionConnection::create(
            "session-2",
            &request,
            producer(Arc::new(FakeOpener::new(vec![]))),
            &test_config(),
            Arc::new(RecordingObserver(Mutex::new(vec![]))),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        connection.close().await;
        connection.start_pump(&Handle::current(), Box::new(|| {}));
        assert!(!connection.is_streaming());
        assert_eq!(connection.health(), HealthSnapshot::default());
    }
}
