//! Stream dispatch: remote gateway pipeline or local session
//!
//! USB cameras attached to a gateway can only be read on that gateway, so
//! their streams are started there. Everything else is served locally.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::registry::SessionRegistry;
use super::remote::PipelineClient;
use crate::camera::{Camera, CameraKind, GatewayRef};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::webrtc::{SessionContext, SessionRunner, StreamRequest, StreamResponse};

/// How one stream request is served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStrategy {
    Remote(GatewayRef),
    Local,
}

impl StreamStrategy {
    pub fn select(camera: &Camera) -> Self {
        match (&camera.gateway, camera.kind) {
            (Some(gateway), CameraKind::Usb) => StreamStrategy::Remote(gateway.clone()),
            _ => StreamStrategy::Local,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStrategy::Remote(_) => "remote",
            StreamStrategy::Local => "local",
        }
    }
}

pub struct StreamDispatcher {
    ctx: SessionContext,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<dyn PipelineClient>,
    negotiation_timeout: Duration,
    events: Option<Arc<EventBus>>,
}

impl StreamDispatcher {
    pub fn new(
        ctx: SessionContext,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<dyn PipelineClient>,
        negotiation_timeout: Duration,
    ) -> Self {
        let events = ctx.events.clone();
        Self {
            ctx,
            registry,
            pipeline,
            negotiation_timeout,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Answer a stream request for `camera`
    pub async fn dispatch(&self, camera: Camera, request: StreamRequest) -> Result<StreamResponse> {
        let strategy = StreamStrategy::select(&camera);
        debug!("Camera {} served {}", camera.id, strategy.as_str());

        let response = match &strategy {
            StreamStrategy::Remote(gateway) => {
                self.pipeline
                    .create_webrtc_video_stream(gateway, &camera.path, &request)
                    .await?
            }
            StreamStrategy::Local => self.dispatch_local(camera.clone(), request).await?,
        };

        if let Some(events) = &self.events {
            events.publish(SystemEvent::StreamDispatched {
                camera_id: camera.id.clone(),
                strategy: strategy.as_str().to_string(),
                session_id: response.session_id.clone(),
            });
        }
        Ok(response)
    }

    async fn dispatch_local(&self, camera: Camera, request: StreamRequest) -> Result<StreamResponse> {
        // Held across negotiation so concurrent requests share the limit
        let slot = self.registry.reserve()?;

        let runner = Arc::new(SessionRunner::new(camera.id.clone(), self.ctx.clone()));
        let timeout = self.negotiation_timeout;
        let negotiated = tokio::task::spawn_blocking(move || {
            // A failed runner is dropped here, off the async workers
            runner
                .negotiate_blocking(&camera, &request, timeout)
                .map(|answer| (runner, answer))
        })
        .await
        .map_err(|e| AppError::Internal(format!("negotiation task failed: {}", e)))?;

        let (runner, answer) = negotiated?;
        let session_id = runner.session_id().to_string();
        self.registry.insert(runner, slot);
        info!("Local session {} registered", session_id);
        Ok(StreamResponse::success(answer, Some(session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraPath;
    use crate::stream::remote::testing::FakePipelineClient;
    use crate::video::source::testing::{source, FakeOpener};
    use crate::webrtc::pump::testing::StubEncoder;
    use crate::webrtc::session::testing::browser_offer;
    use crate::webrtc::{SessionDescription, WebRtcConfig};
    use crate::video::VideoEncoder;
    use webrtc::ice::mdns::MulticastDnsMode;

    fn gateway() -> GatewayRef {
        GatewayRef {
            id: "gw1".to_string(),
            api_url: "http://gateway:9001".to_string(),
            stream_path: "/inference_pipelines/webrtc".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn camera(kind: CameraKind, with_gateway: bool) -> Camera {
        let camera = Camera::new("cam", kind, CameraPath::Index(0));
        if with_gateway {
            camera.with_gateway(gateway())
        } else {
            camera
        }
    }

    fn dispatcher(
        opener: Arc<FakeOpener>,
        pipeline: Arc<FakePipelineClient>,
        max_sessions: usize,
    ) -> StreamDispatcher {
        let webrtc = WebRtcConfig {
            mdns_mode: MulticastDnsMode::Disabled,
            ..Default::default()
        };
        let ctx = SessionContext {
            encoder_factory: Arc::new(|| Box::new(StubEncoder::new()) as Box<dyn VideoEncoder>),
            ..SessionContext::new(source(opener), webrtc)
        };
        StreamDispatcher::new(
            ctx,
            Arc::new(SessionRegistry::new(max_sessions)),
            pipeline,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn test_strategy_selection() {
        let all = [
            CameraKind::File,
            CameraKind::Url,
            CameraKind::Rtsp,
            CameraKind::Usb,
            CameraKind::Onvif,
            CameraKind::Ahd,
        ];
        for kind in all {
            assert_eq!(StreamStrategy::select(&camera(kind, false)), StreamStrategy::Local);
            let expected = if kind == CameraKind::Usb {
                StreamStrategy::Remote(gateway())
            } else {
                StreamStrategy::Local
            };
            assert_eq!(StreamStrategy::select(&camera(kind, true)), expected);
        }
    }

    #[tokio::test]
    async fn test_remote_answer_returned_unmodified() {
        let opener = Arc::new(FakeOpener::new(vec![]));
        let pipeline = Arc::new(FakePipelineClient::answering("v=0 remote"));
        let dispatcher = dispatcher(opener.clone(), pipeline.clone(), 4);

        let request = StreamRequest::new(SessionDescription::offer("v=0"));
        let response = dispatcher
            .dispatch(camera(CameraKind::Usb, true), request)
            .await
            .unwrap();

        assert_eq!(response.sdp.as_deref(), Some("v=0 remote"));
        assert_eq!(pipeline.call_count(), 1);
        assert_eq!(pipeline.calls.lock()[0].0, "http://gateway:9001");
        assert_eq!(opener.counters.opens(), 0);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_allocates_nothing() {
        let opener = Arc::new(FakeOpener::new(vec![]));
        let pipeline = Arc::new(FakePipelineClient::failing("pipeline busy"));
        let dispatcher = dispatcher(opener.clone(), pipeline, 4);

        let request = StreamRequest::new(SessionDescription::offer("v=0"));
        let result = dispatcher.dispatch(camera(CameraKind::Usb, true), request).await;
        assert!(matches!(result, Err(AppError::RemoteStreamError { .. })));
        assert_eq!(opener.counters.opens(), 0);
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_session_registered() {
        let opener = Arc::new(FakeOpener::new(vec![]));
        let pipeline = Arc::new(FakePipelineClient::answering("unused"));
        let dispatcher = dispatcher(opener.clone(), pipeline.clone(), 1);
        let (_offerer, offer_sdp) = browser_offer().await;

        let request = StreamRequest::new(SessionDescription::offer(offer_sdp.clone()));
        let response = dispatcher
            .dispatch(camera(CameraKind::Rtsp, true), request)
            .await
            .unwrap();

        assert!(response.is_success());
        assert_eq!(response.sdp_type.as_deref(), Some("answer"));
        let session_id = response.session_id.unwrap();
        assert!(dispatcher.registry().get(&session_id).is_some());
        assert_eq!(pipeline.call_count(), 0);

        // The only slot is taken
        let again = StreamRequest::new(SessionDescription::offer(offer_sdp));
        let result = dispatcher.dispatch(camera(CameraKind::Rtsp, false), again).await;
        assert!(matches!(result, Err(AppError::ServiceUnavailable(_))));

        dispatcher.registry().close(&session_id).await.unwrap();
        assert_eq!(opener.counters.releases(), 1);
    }
}
