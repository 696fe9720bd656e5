//! Camera model and directory
//!
//! Cameras are read-only records resolved by id. A camera attached to a
//! gateway carries the gateway's API location so stream requests can be
//! forwarded without a second lookup.

pub mod signing;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::{AppConfig, ConfigStore};
use crate::error::{AppError, Result};

pub use signing::{LocalPathSigner, SignedUrlCache, UrlSigner};

/// Source kind of a camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Stored media file, addressed by storage key
    File,
    /// Network URL (http/https/hls)
    Url,
    Rtsp,
    /// Local or gateway-attached USB/V4L2 device
    Usb,
    Onvif,
    Ahd,
}

impl CameraKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraKind::File => "file",
            CameraKind::Url => "url",
            CameraKind::Rtsp => "rtsp",
            CameraKind::Usb => "usb",
            CameraKind::Onvif => "onvif",
            CameraKind::Ahd => "ahd",
        }
    }
}

impl fmt::Display for CameraKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera path: a device index or a textual location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CameraPath {
    Index(u32),
    Text(String),
}

impl CameraPath {
    pub fn is_empty(&self) -> bool {
        matches!(self, CameraPath::Text(s) if s.trim().is_empty())
    }
}

impl fmt::Display for CameraPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraPath::Index(i) => write!(f, "{}", i),
            CameraPath::Text(s) => f.write_str(s),
        }
    }
}

/// Gateway reference resolved for a camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRef {
    pub id: String,
    pub api_url: String,
    pub stream_path: String,
    pub timeout: Duration,
}

/// Camera record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
    pub kind: CameraKind,
    pub path: CameraPath,
    pub gateway: Option<GatewayRef>,
}

impl Camera {
    pub fn new(id: impl Into<String>, kind: CameraKind, path: CameraPath) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            path,
            gateway: None,
        }
    }

    pub fn with_gateway(mut self, gateway: GatewayRef) -> Self {
        self.gateway = Some(gateway);
        self
    }
}

/// Resolves cameras by id
pub trait CameraDirectory: Send + Sync {
    fn get(&self, id: &str) -> Result<Camera>;
    fn list(&self) -> Vec<Camera>;
}

/// Camera directory backed by the configuration store
pub struct ConfigCameraDirectory {
    store: ConfigStore,
}

impl ConfigCameraDirectory {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    fn resolve(config: &AppConfig, id: &str) -> Result<Camera> {
        let entry = config
            .camera(id)
            .ok_or_else(|| AppError::NotFound(format!("camera '{}'", id)))?;

        let gateway = match &entry.gateway {
            Some(gw_id) => {
                let gw = config.gateway(gw_id).ok_or_else(|| {
                    AppError::Config(format!("camera '{}' references unknown gateway '{}'", id, gw_id))
                })?;
                Some(GatewayRef {
                    id: gw.id.clone(),
                    api_url: gw.api_url.trim_end_matches('/').to_string(),
                    stream_path: gw.stream_path.clone(),
                    timeout: Duration::from_millis(gw.timeout_ms),
                })
            }
            None => None,
        };

        Ok(Camera {
            id: entry.id.clone(),
            name: if entry.name.is_empty() {
                entry.id.clone()
            } else {
                entry.name.clone()
            },
            kind: entry.kind,
            path: entry.path.clone(),
            gateway,
        })
    }
}

impl CameraDirectory for ConfigCameraDirectory {
    fn get(&self, id: &str) -> Result<Camera> {
        Self::resolve(&self.store.get(), id)
    }

    fn list(&self) -> Vec<Camera> {
        let config = self.store.get();
        config
            .cameras
            .iter()
            .filter_map(|c| Self::resolve(&config, &c.id).ok())
            .collect()
    }
}
