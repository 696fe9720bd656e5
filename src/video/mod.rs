//! Video capture, conversion and encoding
//!
//! ```text
//! Camera --resolve--> SourceLocation --CaptureOpener--> CaptureBackend
//!                                                            |
//!                                          VideoSourceHandle (last good frame)
//!                                                            |
//!                              FrameTrack (webrtc) --> OpenH264Encoder --> RTP
//! ```

pub mod convert;
pub mod encoder;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_capture;
pub mod format;
pub mod frame;
pub mod opener;
pub mod placeholder;
pub mod snapshot;
pub mod source;
pub mod still_capture;
pub mod v4l_capture;

pub use encoder::{EncodedFrame, OpenH264Encoder, VideoEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use opener::SystemCaptureOpener;
pub use source::{
    CaptureBackend, CaptureOpener, SourceFrame, SourceLocation, VideoInfo, VideoSource,
    VideoSourceHandle,
};
