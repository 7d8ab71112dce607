use std::sync::Arc;

use log::{info, warn};
use zbus::{fdo, interface, object_server::SignalEmitter};

use crate::{
    app_context::AppState,
    device::Reading,
    error::CryoError,
    event::{Event, EventBus},
};

/// `(name, label, unit, type, writable)` as listed by `Attributes`.
pub type AttributeInfo = (String, String, String, String, bool);

/// `(value, timestamp, quality)` as returned by `ReadAttribute`.
pub type ReadingInfo = (String, f64, String);

pub struct DBusInterface {
    state: Arc<AppState>,
    event_bus: EventBus,
    version: String,
}

impl DBusInterface {
    pub fn new(state: Arc<AppState>, version: String, event_bus: EventBus) -> Self {
        Self {
            state,
            event_bus,
            version,
        }
    }

    fn request_shutdown(&self) {
        info!("Shutdown requested over D-Bus");
        if let Err(e) = self.event_bus.publish(Event::SystemShutdown) {
            warn!("Failed to publish shutdown request: {e}");
        }
    }
}

#[interface(name = "io.github.cryocond1")]
impl DBusInterface {
    #[zbus(signal)]
    async fn stopped(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal, name = "StateChanged")]
    pub async fn device_state_changed(
        emitter: &SignalEmitter<'_>,
        state: &str,
        status: &str,
    ) -> zbus::Result<()>;

    async fn stop(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        emitter.stopped().await?;
        self.request_shutdown();

        Ok(())
    }

    async fn read_attribute(&self, name: &str) -> fdo::Result<ReadingInfo> {
        let reading = self.state.device.lock().await.read(name).await.map_err(to_fdo)?;
        Ok(reading_info(&reading))
    }

    /// Reads several attributes with at most one round trip.
    async fn read_attributes(&self, names: Vec<String>) -> fdo::Result<Vec<ReadingInfo>> {
        let mut device = self.state.device.lock().await;
        let attrs = names
            .iter()
            .map(|name| device.resolve(name))
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_fdo)?;

        device
            .read_many(&attrs)
            .await
            .map_err(to_fdo)?
            .into_iter()
            .map(|reading| reading.map(|r| reading_info(&r)).map_err(to_fdo))
            .collect()
    }

    async fn write_attribute(&self, name: &str, value: &str) -> fdo::Result<()> {
        self.state
            .device
            .lock()
            .await
            .write(name, value)
            .await
            .map_err(to_fdo)
    }

    async fn on(&self) -> fdo::Result<()> {
        self.state.device.lock().await.on().await.map_err(to_fdo)
    }

    async fn off(&self) -> fdo::Result<()> {
        self.state.device.lock().await.off().await.map_err(to_fdo)
    }

    async fn run(&self, command: &str) -> fdo::Result<String> {
        self.state.device.lock().await.run(command).await.map_err(to_fdo)
    }

    async fn set_channel_unit(&self, units: &str) -> fdo::Result<()> {
        self.state
            .device
            .lock()
            .await
            .set_channel_unit(units)
            .map_err(to_fdo)
    }

    async fn attributes(&self) -> Vec<AttributeInfo> {
        self.state
            .device
            .lock()
            .await
            .attributes()
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    d.label.clone(),
                    d.unit.to_string(),
                    d.data_type.to_string(),
                    d.writable,
                )
            })
            .collect()
    }

    #[zbus(property)]
    async fn state(&self) -> String {
        self.state.device.lock().await.state().await.0.to_string()
    }

    #[zbus(property)]
    async fn status(&self) -> String {
        self.state.device.lock().await.state().await.1
    }

    #[zbus(property)]
    async fn version(&self) -> String {
        self.version.clone()
    }
}

fn reading_info(reading: &Reading) -> ReadingInfo {
    (
        reading.value.to_string(),
        reading.unix_timestamp(),
        reading.quality.to_string(),
    )
}

fn to_fdo(e: CryoError) -> fdo::Error {
    match e {
        CryoError::UnknownAttribute(_)
        | CryoError::ReadOnly(_)
        | CryoError::InvalidValue { .. } => fdo::Error::InvalidArgs(e.to_string()),
        CryoError::NotImplemented(_) => fdo::Error::NotSupported(e.to_string()),
        e if e.is_connection_failure() => fdo::Error::IOError(e.to_string()),
        e => fdo::Error::Failed(e.to_string()),
    }
}
