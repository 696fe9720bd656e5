//! Session runner: one worker thread per local stream session
//!
//! Each session gets a dedicated thread running a current-thread tokio
//! runtime. The peer connection, its callbacks and the frame pump all live on
//! that runtime; request handlers talk to it through a single-resolution
//! channel and never block on frame I/O themselves.
//!
//! Teardown is one idempotent operation. The first caller (handler, registry,
//! failed-peer callback, dead stream, `Drop`) runs the cleanup; every caller
//! that is not the worker itself then joins the worker thread, at most once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::config::WebRtcConfig;
use super::pump::{FrameProducer, HealthSnapshot};
use super::session::{ConnectionObserver, SessionConnection};
use super::signaling::{ConnectionState, SessionDescription, SessionState, StreamRequest};
use super::track::FrameTrack;
use crate::camera::Camera;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::video::{OpenH264Encoder, VideoEncoder, VideoSource};

/// Builds one encoder per session
pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn VideoEncoder> + Send + Sync>;

/// Everything a runner needs from the service
#[derive(Clone)]
pub struct SessionContext {
    pub video_source: VideoSource,
    pub webrtc: WebRtcConfig,
    pub encoder_factory: EncoderFactory,
    /// Bound on closing the peer connection during teardown
    pub close_timeout: Duration,
    pub events: Option<Arc<EventBus>>,
}

impl SessionContext {
    pub fn new(video_source: VideoSource, webrtc: WebRtcConfig) -> Self {
        Self {
            video_source,
            webrtc,
            encoder_factory: Arc::new(|| Box::new(OpenH264Encoder::new()) as Box<dyn VideoEncoder>),
            close_timeout: Duration::from_secs(5),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

/// Session listing entry
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub camera_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub streaming: bool,
    pub health: HealthSnapshot,
}

struct Worker {
    handle: Handle,
    thread_id: ThreadId,
}

struct RunnerShared {
    session_id: String,
    camera_id: String,
    created_at: DateTime<Utc>,
    ctx: SessionContext,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    /// Stop flag observed by negotiation, pump and frame jobs
    cancel: CancellationToken,
    /// Ends the worker's runtime
    shutdown: CancellationToken,
    closing: AtomicBool,
    start_lock: Mutex<()>,
    worker: OnceLock<Worker>,
    thread: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<Arc<SessionConnection>>>,
    joins: AtomicUsize,
}

impl RunnerShared {
    /// Apply a state transition; illegal ones are ignored
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        let prev = *state;
        if !prev.can_transition_to(next) {
            debug!("Session {} ignoring transition {} -> {}", self.session_id, prev, next);
            return false;
        }
        *state = next;
        self.state_tx.send_replace(next);
        drop(state);

        info!("Session {} {} -> {}", self.session_id, prev, next);
        if let Some(events) = &self.ctx.events {
            events.publish(SystemEvent::SessionStateChanged {
                session_id: self.session_id.clone(),
                camera_id: self.camera_id.clone(),
                state: next,
            });
        }
        true
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn on_worker_thread(&self) -> bool {
        self.worker
            .get()
            .is_some_and(|w| w.thread_id == std::thread::current().id())
    }

    fn on_peer_state(self: &Arc<Self>, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if !self.transition(SessionState::Connected) {
                    return;
                }
                let connection = self.connection.lock().clone();
                if let (Some(connection), Some(worker)) = (connection, self.worker.get()) {
                    let weak = Arc::downgrade(self);
                    connection.start_pump(
                        &worker.handle,
                        Box::new(move || {
                            if let Some(shared) = weak.upgrade() {
                                shared.transition(SessionState::Failed);
                                shared.teardown();
                            }
                        }),
                    );
                }
            }
            ConnectionState::Failed => {
                self.transition(SessionState::Failed);
                self.teardown();
            }
            ConnectionState::Closed => self.teardown(),
            ConnectionState::Disconnected => {
                info!("Session {} peer disconnected, waiting for recovery", self.session_id);
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    /// Single idempotent teardown, callable from any thread
    fn teardown(self: &Arc<Self>) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.cleanup();
        }
        if !self.on_worker_thread() {
            self.join_worker();
        }
    }

    fn cleanup(&self) {
        self.cancel.cancel();
        self.transition(SessionState::Closed);

        let connection = self.connection.lock().take();
        let Some(worker) = self.worker.get() else {
            // A worker started after this point exits right away
            self.shutdown.cancel();
            debug!("Session {} closed before its worker started", self.session_id);
            return;
        };

        let (done_tx, done_rx) = sync_channel::<()>(1);
        let shutdown = self.shutdown.clone();
        let close_timeout = self.ctx.close_timeout;
        let session_id = self.session_id.clone();
        worker.handle.spawn(async move {
            if let Some(connection) = connection {
                if tokio::time::timeout(close_timeout, connection.close()).await.is_err() {
                    warn!("Session {} close timed out after {:?}", session_id, close_timeout);
                }
            }
            let _ = done_tx.send(());
            shutdown.cancel();
        });

        if !self.on_worker_thread() && done_rx.recv_timeout(close_timeout).is_err() {
            warn!("Session {} worker did not finish closing, stopping it", self.session_id);
            self.shutdown.cancel();
        }
    }

    fn join_worker(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            self.join_thread(thread);
        }
    }

    fn join_thread(&self, thread: JoinHandle<()>) {
        if thread.join().is_err() {
            error!("Session {} worker panicked", self.session_id);
        }
        self.joins.fetch_add(1, Ordering::AcqRel);
        debug!("Session {} worker joined", self.session_id);
    }

    async fn connect(
        self: Arc<Self>,
        request: StreamRequest,
        offer: RTCSessionDescription,
        producer: FrameProducer,
    ) -> Result<SessionDescription> {
        self.transition(SessionState::Negotiating);

        let observer = Arc::new(RunnerObserver {
            shared: Arc::downgrade(&self),
        });
        let webrtc = self
            .ctx
            .webrtc
            .clone()
            .with_turn(request.turn_server());
        let connection = Arc::new(
            SessionConnection::create(
                &self.session_id,
                &request,
                producer,
                &webrtc,
                observer,
                self.cancel.child_token(),
            )
            .await?,
        );

        *self.connection.lock() = Some(connection.clone());
        if self.closing.load(Ordering::Acquire) {
            // Teardown ran before the connection was published
            let published = self.connection.lock().take();
            if let Some(connection) = published {
                connection.close().await;
            }
            return Err(AppError::NegotiationError("session closed".to_string()));
        }

        connection.negotiate(offer).await
    }
}

struct RunnerObserver {
    shared: Weak<RunnerShared>,
}

impl ConnectionObserver for RunnerObserver {
    fn on_connection_state(&self, state: ConnectionState) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_peer_state(state);
        }
    }
}

/// Owner of one local stream session
pub struct SessionRunner {
    inner: Arc<RunnerShared>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionRunner {
    pub fn new(camera_id: impl Into<String>, ctx: SessionContext) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::New);
        let inner = Arc::new(RunnerShared {
            session_id: uuid::Uuid::new_v4().to_string(),
            camera_id: camera_id.into(),
            created_at: Utc::now(),
            ctx,
            state: Mutex::new(SessionState::New),
            state_tx,
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            closing: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            worker: OnceLock::new(),
            thread: Mutex::new(None),
            connection: Mutex::new(None),
            joins: AtomicUsize::new(0),
        });
        Self { inner, state_rx }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn camera_id(&self) -> &str {
        &self.inner.camera_id
    }

    /// Spawn the worker thread and its runtime. Idempotent.
    pub fn start(&self) -> Result<()> {
        let _guard = self.inner.start_lock.lock();
        if self.inner.worker.get().is_some() {
            return Ok(());
        }
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(AppError::ServiceUnavailable("session is closed".to_string()));
        }

        let (ready_tx, ready_rx) = sync_channel(1);
        let shutdown = self.inner.shutdown.clone();
        let close_timeout = self.inner.ctx.close_timeout;
        let name = format!("session-{}", &self.inner.session_id[..8]);

        let thread = std::thread::Builder::new().name(name).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(runtime.handle().clone()));
            runtime.block_on(shutdown.cancelled());
            // Frame jobs may still be inside a blocking read
            runtime.shutdown_timeout(close_timeout);
        })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| AppError::Internal("session worker exited during startup".to_string()))?
            .map_err(|e| AppError::Internal(format!("session runtime: {}", e)))?;

        let thread_id = thread.thread().id();
        *self.inner.thread.lock() = Some(thread);
        let _ = self.inner.worker.set(Worker { handle, thread_id });
        debug!("Session {} worker started", self.inner.session_id);
        Ok(())
    }

    /// Negotiate a local stream, blocking until the answer or the deadline
    ///
    /// The request and offer are validated before anything is opened, and
    /// the source is opened before the worker is spawned. Any failure leaves
    /// the session `Closed` with its resources released; after a timeout the
    /// release finishes in the background.
    pub fn negotiate_blocking(
        &self,
        camera: &Camera,
        request: &StreamRequest,
        timeout: Duration,
    ) -> Result<SessionDescription> {
        let deadline = Instant::now() + timeout;
        let result = self.negotiate_until(camera, request, deadline, timeout);

        match &result {
            Ok(_) => info!("Session {} answered for camera {}", self.inner.session_id, camera.id),
            Err(AppError::NegotiationTimeout(_)) => {
                warn!(
                    "Session {} negotiation timed out after {:?}",
                    self.inner.session_id, timeout
                );
                self.teardown_in_background();
            }
            Err(e) => {
                warn!("Session {} negotiation failed: {}", self.inner.session_id, e);
                self.teardown();
            }
        }
        result
    }

    fn negotiate_until(
        &self,
        camera: &Camera,
        request: &StreamRequest,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<SessionDescription> {
        request.validate()?;
        let offer = request.webrtc_offer.to_offer()?;
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(AppError::ServiceUnavailable("session is closed".to_string()));
        }

        let handle = self.inner.ctx.video_source.open_with_deadline(camera, deadline)?;
        let track = FrameTrack::new(
            format!("video-{}", &self.inner.session_id[..8]),
            handle,
            request.fps,
        );
        let producer = FrameProducer::new(track, (self.inner.ctx.encoder_factory)());

        self.start()?;
        let worker = self
            .inner
            .worker
            .get()
            .ok_or_else(|| AppError::Internal("session worker missing".to_string()))?;

        let (answer_tx, answer_rx) = sync_channel(1);
        let shared = self.inner.clone();
        let cancel = self.inner.cancel.clone();
        let request = request.clone();
        worker.handle.spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(AppError::NegotiationError("session cancelled".to_string())),
                result = shared.connect(request, offer, producer) => result,
            };
            let _ = answer_tx.send(result);
        });

        let remaining = deadline.saturating_duration_since(Instant::now());
        match answer_rx.recv_timeout(remaining) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(AppError::NegotiationTimeout(timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AppError::Internal(
                "session worker dropped the negotiation".to_string(),
            )),
        }
    }

    /// Close the session and join its worker. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    fn teardown_in_background(&self) {
        // Claim the teardown here so a drop of the runner finds it taken
        let first = !self.inner.closing.swap(true, Ordering::AcqRel);
        // The state is terminal by the time the caller sees the error
        self.inner.cancel.cancel();
        self.inner.transition(SessionState::Closed);

        let shared = self.inner.clone();
        let thread = self.inner.thread.lock().take();
        let spawned = std::thread::Builder::new()
            .name(format!("session-close-{}", &self.inner.session_id[..8]))
            .spawn(move || {
                if first {
                    shared.cleanup();
                }
                if let Some(thread) = thread {
                    shared.join_thread(thread);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to spawn close thread, closing inline: {}", e);
            if first {
                self.inner.cleanup();
            }
            self.inner.join_worker();
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn info(&self) -> SessionInfo {
        let connection = self.inner.connection.lock().clone();
        SessionInfo {
            session_id: self.inner.session_id.clone(),
            camera_id: self.inner.camera_id.clone(),
            state: self.state(),
            created_at: self.inner.created_at,
            streaming: connection.as_ref().is_some_and(|c| c.is_streaming()),
            health: connection.map(|c| c.health()).unwrap_or_default(),
        }
    }

    pub fn has_worker(&self) -> bool {
        self.inner.worker.get().is_some()
    }

    /// Number of times the worker thread was joined (0 or 1)
    pub fn worker_joins(&self) -> usize {
        self.inner.joins.load(Ordering::Acquire)
    }

    /// Feed a peer connection state as if the WebRTC stack reported it
    #[cfg(test)]
    pub(crate) fn inject_peer_state(&self, state: ConnectionState) {
        self.inner.on_peer_state(state);
    }

    #[cfg(test)]
    pub(crate) fn worker_handle(&self) -> Option<Handle> {
        self.inner.worker.get().map(|w| w.handle.clone())
    }
}

impl Drop for SessionRunner {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}
