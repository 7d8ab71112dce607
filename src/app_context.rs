//! Application state shared by all services.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use crate::{
    config::{Config, ConfigManager},
    device::CryoConDevice,
};

/// Everything the services share.
///
/// The device sits behind a single async mutex: every operation on it holds
/// the lock for its whole duration, so grouped requests never interleave.
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub device: Arc<Mutex<CryoConDevice>>,
}

impl AppState {
    /// Builds the shared state. No connection is attempted.
    pub async fn new(config_manager: ConfigManager) -> anyhow::Result<Self> {
        let config = config_manager.clone_config().await;
        let device =
            CryoConDevice::from_config(&config).context("Failed to initialize the device")?;

        Ok(Self::with_device(config_manager, device))
    }

    pub fn with_device(config_manager: ConfigManager, device: CryoConDevice) -> Self {
        Self {
            config_manager: Arc::new(config_manager),
            device: Arc::new(Mutex::new(device)),
        }
    }

    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }
}
