//! Client for inference gateways that own remote capture devices
//!
//! The gateway runs the whole pipeline; this side only relays the offer and
//! returns the gateway's answer untouched. No retries.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::camera::{CameraPath, GatewayRef};
use crate::error::{AppError, Result};
use crate::webrtc::{StreamRequest, StreamResponse};

/// Request body sent to a gateway
#[derive(Debug, Clone, Serialize)]
pub struct RemoteStreamRequest<'a> {
    /// Device on the gateway: index or path
    pub video_source: &'a CameraPath,
    pub webrtc_config: &'a StreamRequest,
}

/// Starts WebRTC streams on a gateway
#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn create_webrtc_video_stream(
        &self,
        gateway: &GatewayRef,
        video_source: &CameraPath,
        webrtc_config: &StreamRequest,
    ) -> Result<StreamResponse>;
}

/// HTTP pipeline client
pub struct HttpPipelineClient {
    client: reqwest::Client,
}

impl HttpPipelineClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PipelineClient for HttpPipelineClient {
    async fn create_webrtc_video_stream(
        &self,
        gateway: &GatewayRef,
        video_source: &CameraPath,
        webrtc_config: &StreamRequest,
    ) -> Result<StreamResponse> {
        let url = format!(
            "{}/{}",
            gateway.api_url.trim_end_matches('/'),
            gateway.stream_path.trim_start_matches('/')
        );
        debug!("Requesting remote stream from {} ({})", gateway.id, url);

        let body = RemoteStreamRequest {
            video_source,
            webrtc_config,
        };
        let response = self
            .client
            .post(&url)
            .timeout(gateway.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::remote(&gateway.id, format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let reply = response
            .json::<StreamResponse>()
            .await
            .map_err(|e| AppError::remote(&gateway.id, format!("invalid response ({}): {}", status, e)))?;

        check_reply(&gateway.id, reply).inspect(|_| {
            info!("Remote stream started on gateway {}", gateway.id);
        })
    }
}

/// Accept a gateway reply only if it carries an answer
fn check_reply(gateway_id: &str, reply: StreamResponse) -> Result<StreamResponse> {
    if !reply.is_success() {
        let reason = reply
            .error
            .unwrap_or_else(|| format!("gateway returned status '{}'", reply.status));
        return Err(AppError::remote(gateway_id, reason));
    }
    if reply.sdp.as_deref().map_or(true, str::is_empty) {
        return Err(AppError::remote(gateway_id, "gateway reply has no SDP answer"));
    }
    Ok(reply)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Pipeline client returning a canned reply and recording calls
    pub struct FakePipelineClient {
        pub reply: Mutex<Result<StreamResponse>>,
        pub calls: Mutex<Vec<(String, CameraPath)>>,
    }

    impl FakePipelineClient {
        pub fn answering(sdp: &str) -> Self {
            Self {
                reply: Mutex::new(Ok(StreamResponse {
                    status: "success".to_string(),
                    sdp: Some(sdp.to_string()),
                    sdp_type: Some("answer".to_string()),
                    error: None,
                    session_id: None,
                })),
                calls: Mutex::new(vec![]),
            }
        }

        pub fn failing(reason: &str) -> Self {
            Self {
                reply: Mutex::new(Err(AppError::remote("gw", reason))),
                calls: Mutex::new(vec![]),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl PipelineClient for FakePipelineClient {
        async fn create_webrtc_video_stream(
            &self,
            gateway: &GatewayRef,
            video_source: &CameraPath,
            _webrtc_config: &StreamRequest,
        ) -> Result<StreamResponse> {
            self.calls
                .lock()
                .push((gateway.api_url.clone(), video_source.clone()));
            match &*self.reply.lock() {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(AppError::remote(&gateway.id, e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::SessionDescription;

    #[test]
    fn test_request_body_shape() {
        let request = StreamRequest::new(SessionDescription::offer("v=0"));
        let path = CameraPath::Index(2);
        let body = serde_json::to_value(RemoteStreamRequest {
            video_source: &path,
            webrtc_config: &request,
        })
        .unwrap();
        assert_eq!(body["video_source"], 2);
        assert_eq!(body["webrtc_config"]["webrtc_offer"]["type"], "offer");
        assert_eq!(body["webrtc_config"]["fps"], 30.0);
    }

    #[test]
    fn test_error_reply_is_remote_error() {
        let reply = StreamResponse::error("pipeline busy");
        match check_reply("gw1", reply) {
            Err(AppError::RemoteStreamError { gateway, reason }) => {
                assert_eq!(gateway, "gw1");
                assert_eq!(reason, "pipeline busy");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_without_sdp_rejected() {
        let reply = StreamResponse {
            status: "success".to_string(),
            sdp: None,
            sdp_type: None,
            error: None,
            session_id: None,
        };
        assert!(check_reply("gw1", reply).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_gateway() {
        let client = HttpPipelineClient::new().unwrap();
        let gateway = GatewayRef {
            id: "gw1".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            stream_path: "/inference_pipelines/webrtc".to_string(),
            timeout: Duration::from_secs(2),
        };
        let request = StreamRequest::new(SessionDescription::offer("v=0"));
        let result = client
            .create_webrtc_video_stream(&gateway, &CameraPath::Index(0), &request)
            .await;
        assert!(matches!(result, Err(AppError::RemoteStreamError { .. })));
    }
}
