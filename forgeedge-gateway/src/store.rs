//! Configuration persistence and startup loading

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

use crate::config::{self, GatewayConfig, UNKNOWN_EDGE_ID};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("config store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable home of the last accepted configuration document
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Replace the stored document. A reader never observes a partial write.
    async fn persist(&self, raw: &[u8]) -> Result<(), StoreError>;

    /// The stored document, or `None` if nothing has been stored yet
    async fn load_persisted(&self) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Single JSON file, replaced through a sibling temp file and a rename
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn persist(&self, raw: &[u8]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let tmp = self.temp_path();
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, &self.path).await?;
        info!("Configuration persisted to {}", self.path.display());
        Ok(())
    }

    async fn load_persisted(&self) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// First non-empty line of the device serial file
pub async fn load_serial(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).await.ok()?;
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Configuration to run with at startup.
///
/// A missing, unreadable or invalid stored document falls back to the
/// built-in defaults (no devices). The gateway id is taken from the
/// document, then the serial, then `forgeedge-unknown`.
pub async fn load_startup_config(store: &dyn ConfigStore, serial: Option<&str>) -> GatewayConfig {
    let mut config = match store.load_persisted().await {
        Ok(Some(raw)) => match config::decode(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!("Stored configuration rejected, starting with defaults: {}", e);
                GatewayConfig::default()
            }
        },
        Ok(None) => {
            info!("No stored configuration, starting with defaults");
            GatewayConfig::default()
        }
        Err(e) => {
            warn!("Cannot read stored configuration, starting with defaults: {}", e);
            GatewayConfig::default()
        }
    };

    config.resolve_identity(serial.unwrap_or(UNKNOWN_EDGE_ID));
    config
}
