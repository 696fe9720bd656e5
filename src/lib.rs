//! camrtc - WebRTC streaming for managed cameras
//!
//! Cameras attached to a gateway are streamed by the gateway's pipeline;
//! every other camera is captured here and sent over a local peer
//! connection with one worker thread per session.

pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;
pub mod web;
pub mod webrtc;

pub use error::{AppError, Result};
