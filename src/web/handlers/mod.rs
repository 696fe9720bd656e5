use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::camera::{Camera, CameraKind, CameraPath};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::video::snapshot::{capture_snapshot, probe_video_info};
use crate::video::source::VideoInfo;
use crate::webrtc::{SessionInfo, StreamRequest, StreamResponse};

// ============================================================================
// Health
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.sessions().len(),
    })
}

// ============================================================================
// Cameras
// ============================================================================

/// Camera listing entry
#[derive(Debug, Serialize)]
pub struct CameraEntry {
    pub id: String,
    pub name: String,
    pub kind: CameraKind,
    pub path: CameraPath,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl From<Camera> for CameraEntry {
    fn from(camera: Camera) -> Self {
        Self {
            id: camera.id,
            name: camera.name,
            kind: camera.kind,
            path: camera.path,
            gateway: camera.gateway.map(|g| g.id),
        }
    }
}

pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<Vec<CameraEntry>> {
    Json(state.cameras.list().into_iter().map(CameraEntry::from).collect())
}

/// Start a WebRTC stream for a camera
///
/// Errors are answered with a `status: "error"` body, the same shape a
/// gateway uses for failed streams. That includes bodies that do not parse.
pub async fn camera_webrtc(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    payload: std::result::Result<Json<StreamRequest>, JsonRejection>,
) -> Result<Json<StreamResponse>> {
    let Json(request) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let camera = state.cameras.get(&camera_id)?;
    request.validate()?;
    info!(
        "WebRTC stream requested for camera {} ({}, fps {})",
        camera.id, camera.kind, request.fps
    );

    let response = state.dispatcher.dispatch(camera, request).await?;
    Ok(Json(response))
}

/// Single JPEG frame from a camera
pub async fn camera_snapshot(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Result<impl IntoResponse> {
    let camera = state.cameras.get(&camera_id)?;
    let source = state.video_source.clone();
    let jpeg = tokio::task::spawn_blocking(move || capture_snapshot(&source, &camera))
        .await
        .map_err(|e| AppError::Internal(format!("snapshot task failed: {}", e)))??;

    debug!("Snapshot for {}: {} bytes", camera_id, jpeg.len());
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
        ],
        jpeg,
    ))
}

pub async fn camera_info(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Result<Json<VideoInfo>> {
    let camera = state.cameras.get(&camera_id)?;
    let source = state.video_source.clone();
    let info = tokio::task::spawn_blocking(move || probe_video_info(&source, &camera))
        .await
        .map_err(|e| AppError::Internal(format!("probe task failed: {}", e)))??;
    Ok(Json(info))
}

// ============================================================================
// Sessions
// ============================================================================

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions().list())
}

/// Close session response
#[derive(Serialize)]
pub struct CloseSessionResponse {
    pub success: bool,
    pub session_id: String,
}

pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CloseSessionResponse>> {
    state.sessions().close(&session_id).await?;
    Ok(Json(CloseSessionResponse {
        success: true,
        session_id,
    }))
}

// ============================================================================
// WebRTC
// ============================================================================

/// ICE servers configuration for WebRTC
#[derive(Serialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServerInfo>,
    pub mdns_mode: String,
}

#[derive(Serialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE servers used by local sessions, for client-side configuration
pub async fn webrtc_ice_servers(State(state): State<Arc<AppState>>) -> Json<IceServersResponse> {
    use crate::webrtc::mdns::mdns_mode_label;
    use crate::webrtc::WebRtcConfig;

    let config = state.config.get();
    let webrtc = WebRtcConfig::from_settings(&config.webrtc);

    let ice_servers = webrtc
        .stun_servers
        .iter()
        .filter(|s| !s.is_empty())
        .map(|stun| IceServerInfo {
            urls: vec![stun.clone()],
            username: None,
            credential: None,
        })
        .collect();

    Json(IceServersResponse {
        ice_servers,
        mdns_mode: mdns_mode_label(webrtc.mdns_mode).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::ConfigCameraDirectory;
    use crate::config::{AppConfig, CameraConfig, ConfigStore, WebRtcSettings};
    use crate::events::EventBus;
    use crate::stream::remote::testing::FakePipelineClient;
    use crate::stream::{SessionRegistry, StreamDispatcher};
    use crate::video::source::testing::{source, FakeOpener, Step};
    use crate::webrtc::{SessionContext, SessionDescription, WebRtcConfig};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn state(opener: Arc<FakeOpener>) -> Arc<AppState> {
        let config = ConfigStore::in_memory(AppConfig {
            cameras: vec![CameraConfig {
                id: "lobby".into(),
                name: "Lobby".into(),
                kind: CameraKind::Rtsp,
                path: CameraPath::Text("rtsp://10.0.0.2/live".into()),
                gateway: None,
            }],
            webrtc: WebRtcSettings {
                stun_servers: vec!["stun:stun.example.org:3478".into()],
                mdns_mode: Some("disabled".into()),
                ..Default::default()
            },
            ..Default::default()
        });
        let events = Arc::new(EventBus::new());
        let video_source = source(opener);
        let ctx = SessionContext::new(video_source.clone(), WebRtcConfig::default())
            .with_events(events.clone());
        let dispatcher = Arc::new(StreamDispatcher::new(
            ctx,
            Arc::new(SessionRegistry::new(4)),
            Arc::new(FakePipelineClient::answering("unused")),
            Duration::from_secs(5),
        ));
        AppState::new(
            config.clone(),
            Arc::new(ConfigCameraDirectory::new(config)),
            video_source,
            dispatcher,
            events,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_list_cameras() {
        let state = state(Arc::new(FakeOpener::new(vec![])));
        let Json(cameras) = list_cameras(State(state)).await;
        assert_eq!(cameras.len(), 1);
        assert_eq!(cameras[0].id, "lobby");
        assert!(cameras[0].gateway.is_none());
    }

    #[tokio::test]
    async fn test_webrtc_unknown_camera() {
        let opener = Arc::new(FakeOpener::new(vec![]));
        let state = state(opener.clone());
        let request = StreamRequest::new(SessionDescription::offer("v=0"));
        let result = camera_webrtc(State(state), Path("nope".to_string()), Ok(Json(request))).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(opener.counters.opens(), 0);
    }

    #[tokio::test]
    async fn test_webrtc_rejects_bad_fps() {
        let opener = Arc::new(FakeOpener::new(vec![]));
        let state = state(opener.clone());
        let mut request = StreamRequest::new(SessionDescription::offer("v=0"));
        request.fps = 0.0;
        let result = camera_webrtc(State(state), Path("lobby".to_string()), Ok(Json(request))).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
        assert_eq!(opener.counters.opens(), 0);
    }

    #[tokio::test]
    async fn test_webrtc_malformed_body_is_error_response() {
        use axum::body::Body;
        use axum::extract::{FromRequest, Request};

        let opener = Arc::new(FakeOpener::new(vec![]));
        let state = state(opener.clone());
        let request = Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{\"webrtc_offer\": "))
            .unwrap();
        let payload = Json::<StreamRequest>::from_request(request, &()).await;
        assert!(payload.is_err());

        let err = camera_webrtc(State(state), Path("lobby".to_string()), payload)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(opener.counters.opens(), 0);

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn test_snapshot_is_jpeg() {
        let opener = Arc::new(FakeOpener::new(vec![Step::Frame]));
        let state = state(opener.clone());
        let response = camera_snapshot(State(state), Path("lobby".to_string()))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(opener.counters.releases(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_source_unavailable() {
        let state = state(Arc::new(FakeOpener::failing()));
        let result = camera_snapshot(State(state), Path("lobby".to_string())).await;
        match result {
            Err(e) => assert_eq!(e.kind(), "source_unavailable"),
            Ok(_) => panic!("snapshot from a failing source"),
        }
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let state = state(Arc::new(FakeOpener::new(vec![])));
        let result = close_session(State(state), Path("missing".to_string())).await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ice_servers_from_config() {
        let state = state(Arc::new(FakeOpener::new(vec![])));
        let Json(response) = webrtc_ice_servers(State(state)).await;
        assert_eq!(response.ice_servers.len(), 1);
        assert_eq!(response.ice_servers[0].urls[0], "stun:stun.example.org:3478");
        if std::env::var("CAMRTC_WEBRTC_MDNS_MODE").is_err() {
            assert_eq!(response.mdns_mode, "disabled");
        }
    }
}
