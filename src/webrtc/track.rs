//! Frame track: paced frames from a video source
//!
//! The track never blocks the peer on a missing frame. A failed read yields
//! the last good frame; a source that never produced anything yields the
//! "waiting" placeholder. Every delivered frame advances the presentation
//! counter, so timestamps stay monotonic whatever the source does.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::video::placeholder::placeholder_frame;
use crate::video::source::SourceStats;
use crate::video::{SourceFrame, VideoFrame, VideoSourceHandle};

/// Rational time base of frame timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    /// One tick per frame at `fps`, exact to a thousandth of a frame
    pub fn per_frame(fps: f64) -> Self {
        let milli_fps = if fps.is_finite() {
            (fps * 1000.0).round().clamp(1.0, u32::MAX as f64) as u32
        } else {
            1000
        };
        let divisor = gcd(1000, milli_fps);
        Self {
            num: 1000 / divisor,
            den: milli_fps / divisor,
        }
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        Duration::from_secs_f64(ticks as f64 * self.num as f64 / self.den as f64)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Where a delivered frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackFrameKind {
    Live,
    Cached,
    Synthetic,
}

#[derive(Debug, Clone)]
pub struct TrackFrame {
    pub frame: VideoFrame,
    pub kind: TrackFrameKind,
    pub pts: u64,
    pub time_base: TimeBase,
}

/// Video track fed by one [`VideoSourceHandle`]
pub struct FrameTrack {
    track_id: String,
    source: VideoSourceHandle,
    counter: u64,
    time_base: TimeBase,
    active: bool,
    last_emitted: Option<VideoFrame>,
    synthetic: u64,
}

impl FrameTrack {
    pub fn new(track_id: impl Into<String>, source: VideoSourceHandle, fps: f64) -> Self {
        let track_id = track_id.into();
        let time_base = TimeBase::per_frame(fps);
        debug!("Frame track {} created (time base {}/{})", track_id, time_base.num, time_base.den);
        Self {
            track_id,
            source,
            counter: 0,
            time_base,
            active: true,
            last_emitted: None,
            synthetic: 0,
        }
    }

    /// Produce the next frame, blocking on one source read
    pub fn next_frame(&mut self) -> Result<TrackFrame> {
        if !self.active {
            return Err(AppError::TrackClosed);
        }

        let (frame, kind) = match self.source.get_frame() {
            SourceFrame::Live(frame) => (frame, TrackFrameKind::Live),
            SourceFrame::Cached(frame) => (frame, TrackFrameKind::Cached),
            SourceFrame::Empty => match &self.last_emitted {
                Some(frame) => (frame.clone(), TrackFrameKind::Cached),
                None => {
                    self.synthetic += 1;
                    (placeholder_frame(self.counter), TrackFrameKind::Synthetic)
                }
            },
        };

        if kind != TrackFrameKind::Synthetic {
            self.last_emitted = Some(frame.clone());
        }

        let pts = self.counter;
        self.counter += 1;

        Ok(TrackFrame {
            frame,
            kind,
            pts,
            time_base: self.time_base,
        })
    }

    /// Stop the track and release its source. Idempotent.
    pub fn close(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.source.close();
        info!(
            "Frame track {} closed after {} frames ({} synthetic)",
            self.track_id, self.counter, self.synthetic
        );
    }

    pub fn id(&self) -> &str {
        &self.track_id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn frames_emitted(&self) -> u64 {
        self.counter
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }
}

impl Drop for FrameTrack {
    fn drop(&mut self) {
        self.close();
    }
}
