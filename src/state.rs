use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::camera::CameraDirectory;
use crate::config::ConfigStore;
use crate::events::EventBus;
use crate::stream::{SessionRegistry, StreamDispatcher};
use crate::video::VideoSource;

/// Application-wide state shared across handlers
///
/// Stream requests go through `dispatcher`; local sessions it starts are
/// tracked in its registry.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Camera lookup by id
    pub cameras: Arc<dyn CameraDirectory>,
    /// Capture handle factory, also used for snapshots and probes
    pub video_source: VideoSource,
    /// Remote/local stream dispatch
    pub dispatcher: Arc<StreamDispatcher>,
    /// Event bus for session notifications
    pub events: Arc<EventBus>,
    /// Cancelled once on shutdown
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        cameras: Arc<dyn CameraDirectory>,
        video_source: VideoSource,
        dispatcher: Arc<StreamDispatcher>,
        events: Arc<EventBus>,
        shutdown_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cameras,
            video_source,
            dispatcher,
            events,
            shutdown_token,
        })
    }

    /// Local session registry
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.dispatcher.registry()
    }

    /// Stop background tasks and close every local session
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.sessions().close_all().await;
    }
}
