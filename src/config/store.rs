use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads, providing high performance
/// for frequent configuration access in hot paths.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the store, creating the file with defaults when it does not exist
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_to_file(path, &config).await?;
                tracing::info!("Created default configuration at {}", path.display());
                config
            }
            Err(e) => return Err(e.into()),
        };

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// In-memory store (no file), used by tests and embedding callers
    pub fn in_memory(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path: PathBuf::new(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    fn parse(raw: &str) -> Result<AppConfig> {
        let config: AppConfig = toml::from_str(raw).map_err(|e| AppError::Config(e.to_string()))?;
        config.validate().map_err(AppError::Config)?;
        Ok(config)
    }

    /// Write through a temporary file so readers never see a partial config
    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Ok(());
        }
        let raw = toml::to_string_pretty(config).map_err(|e| AppError::Config(e.to_string()))?;
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Path of the backing file (empty for in-memory stores)
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate().map_err(AppError::Config)?;
        Self::save_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; concurrent updates are last-write-wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Re-read the backing file
    pub async fn reload(&self) -> Result<()> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let config = Self::parse(&raw)?;
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}
