//! Frame pump: paces frame production and hands encoded samples to the peer
//!
//! Each tick runs one `next_frame` + encode job on the blocking pool and
//! waits at most `processing_timeout` for it. A late job stays in flight and
//! is awaited again on the next tick, so there is never more than one read
//! against the source at a time.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::signaling::StreamRequest;
use super::track::{FrameTrack, TrackFrameKind};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::{EncodedFrame, VideoEncoder};
use crate::warn_throttled;

/// Pacing and liveness parameters of one stream
#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub frame_interval: Duration,
    pub processing_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    pub min_consecutive_on_time: u32,
}

impl PumpSettings {
    pub fn from_request(request: &StreamRequest) -> Self {
        Self {
            frame_interval: request.frame_interval(),
            processing_timeout: request.processing_budget(),
            max_consecutive_timeouts: request.max_consecutive_timeouts,
            min_consecutive_on_time: request.min_consecutive_on_time,
        }
    }
}

/// One produced frame
#[derive(Debug)]
pub struct ProducedFrame {
    pub encoded: EncodedFrame,
    pub kind: TrackFrameKind,
    pub pts: u64,
}

/// Track plus encoder, driven from the blocking pool
pub struct FrameProducer {
    track: FrameTrack,
    encoder: Box<dyn VideoEncoder>,
    keyframe_requested: Arc<AtomicBool>,
    last_kind: Option<TrackFrameKind>,
}

impl FrameProducer {
    pub fn new(track: FrameTrack, encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            track,
            encoder,
            keyframe_requested: Arc::new(AtomicBool::new(false)),
            last_kind: None,
        }
    }

    /// Flag polled before each encode; set it to force an IDR
    pub fn keyframe_flag(&self) -> Arc<AtomicBool> {
        self.keyframe_requested.clone()
    }

    pub fn produce(&mut self) -> Result<ProducedFrame> {
        let frame = self.track.next_frame()?;

        // Leaving the placeholder switches resolution; viewers need an IDR
        let left_placeholder = self.last_kind == Some(TrackFrameKind::Synthetic)
            && frame.kind != TrackFrameKind::Synthetic;
        if self.keyframe_requested.swap(false, Ordering::AcqRel) || left_placeholder {
            self.encoder.request_keyframe();
        }
        self.last_kind = Some(frame.kind);

        let encoded = self.encoder.encode(&frame.frame)?;
        Ok(ProducedFrame {
            encoded,
            kind: frame.kind,
            pts: frame.pts,
        })
    }

    pub fn track(&self) -> &FrameTrack {
        &self.track
    }

    pub fn close(&mut self) {
        self.track.close();
    }
}

/// Producer shared between the pump and teardown
pub type SharedProducer = Arc<Mutex<Option<FrameProducer>>>;

/// Destination of encoded samples
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()>;
}

#[async_trait]
impl SampleSink for TrackLocalStaticSample {
    async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.write_sample(&sample)
            .await
            .map_err(|e| AppError::Internal(format!("write_sample failed: {}", e)))
    }
}

/// Liveness counters of one stream
#[derive(Debug, Default)]
pub struct StreamHealth {
    frames_sent: AtomicU64,
    late_frames: AtomicU64,
    consecutive_timeouts: AtomicU32,
    consecutive_on_time: AtomicU32,
    healthy: AtomicBool,
    dead: AtomicBool,
}

impl StreamHealth {
    /// Count an on-time frame; true when this frame made the stream healthy
    pub fn record_on_time(&self, min_consecutive_on_time: u32) -> bool {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.consecutive_timeouts.store(0, Ordering::Relaxed);
        let on_time = self.consecutive_on_time.fetch_add(1, Ordering::Relaxed) + 1;
        on_time >= min_consecutive_on_time && !self.healthy.swap(true, Ordering::AcqRel)
    }

    /// Count a late frame; returns the current run of late frames
    pub fn record_timeout(&self) -> u32 {
        self.late_frames.fetch_add(1, Ordering::Relaxed);
        self.consecutive_on_time.store(0, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Release);
        self.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn mark_dead(&self) {
        self.healthy.store(false, Ordering::Release);
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            consecutive_timeouts: self.consecutive_timeouts.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Acquire),
            dead: self.dead.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub frames_sent: u64,
    pub late_frames: u64,
    pub consecutive_timeouts: u32,
    pub healthy: bool,
    pub dead: bool,
}

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Cancelled,
    TrackClosed,
    /// Too many consecutive late frames
    Dead,
}

fn produce_once(producer: &SharedProducer) -> Result<ProducedFrame> {
    let mut guard = producer.lock();
    let producer = guard.as_mut().ok_or(AppError::TrackClosed)?;
    producer.produce()
}

/// Run the pump until cancelled, the track closes or the stream dies
pub async fn run_pump(
    session_id: String,
    producer: SharedProducer,
    sink: Arc<dyn SampleSink>,
    settings: PumpSettings,
    health: Arc<StreamHealth>,
    cancel: CancellationToken,
) -> PumpExit {
    let throttler = LogThrottler::default();
    let mut ticker = tokio::time::interval(settings.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut in_flight: Option<JoinHandle<Result<ProducedFrame>>> = None;

    debug!(
        "Frame pump started for session {} ({:?} per frame)",
        session_id, settings.frame_interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            _ = ticker.tick() => {}
        }

        let job = in_flight.get_or_insert_with(|| {
            let producer = producer.clone();
            tokio::task::spawn_blocking(move || produce_once(&producer))
        });

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            outcome = tokio::time::timeout(settings.processing_timeout, job) => outcome,
        };

        match outcome {
            Err(_) => {
                let late = health.record_timeout();
                warn_throttled!(
                    throttler,
                    "late",
                    "Session {} frame took longer than {:?} ({} late in a row)",
                    session_id,
                    settings.processing_timeout,
                    late
                );
                if late >= settings.max_consecutive_timeouts {
                    error!(
                        "Session {} stream dead after {} consecutive late frames",
                        session_id, late
                    );
                    health.mark_dead();
                    return PumpExit::Dead;
                }
            }
            Ok(joined) => {
                in_flight = None;
                match joined {
                    Ok(Ok(frame)) => {
                        let write = tokio::time::timeout(
                            settings.processing_timeout,
                            sink.write_frame(frame.encoded.data, settings.frame_interval),
                        );
                        match write.await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!("Session {} sample dropped: {}", session_id, e),
                            Err(_) => debug!("Session {} sample write timed out", session_id),
                        }
                        if health.record_on_time(settings.min_consecutive_on_time) {
                            info!("Session {} stream healthy", session_id);
                        }
                    }
                    Ok(Err(AppError::TrackClosed)) => {
                        debug!("Frame pump for session {} stopped: track closed", session_id);
                        return PumpExit::TrackClosed;
                    }
                    Ok(Err(e)) => {
                        warn_throttled!(
                            throttler,
                            "produce",
                            "Session {} frame production failed: {}",
                            session_id,
                            e
                        );
                    }
                    Err(e) => {
                        error!("Session {} frame job aborted: {}", session_id, e);
                        health.mark_dead();
                        return PumpExit::Dead;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::video::VideoFrame;

    /// Encoder that emits a tiny access unit per frame, optionally stalling
    pub struct StubEncoder {
        pub delay: Duration,
    }

    impl StubEncoder {
        pub fn new() -> Self {
            Self {
                delay: Duration::ZERO,
            }
        }
    }

    impl VideoEncoder for StubEncoder {
        fn encode(&mut self, frame: &VideoFrame) -> Result<EncodedFrame> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            Ok(EncodedFrame {
                data: Bytes::from(vec![0, 0, 0, 1, frame.sequence as u8]),
                keyframe: false,
                resolution: frame.resolution,
            })
        }

        fn request_keyframe(&mut self) {}
    }
}
