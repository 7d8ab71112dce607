//! D-Bus service provider for dependency injection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use zbus::{Connection, object_server::InterfaceRef};

use crate::{
    app_context::AppState,
    event::{Event, EventBus},
    interface::DBusInterface,
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

pub const BUS_NAME: &str = "io.github.cryocond";
pub const OBJECT_PATH: &str = "/io/github/cryocond";

/// D-Bus service provider, the client-facing surface of the daemon.
///
/// Serves [`DBusInterface`] on the session bus and turns `StateChanged`
/// events into the matching D-Bus signal and property notifications.
///
/// # Priority and Criticality
///
/// - **Priority**: 8 (high)
/// - **Critical**: No. Polling keeps running when the bus is unavailable.
///
/// # Interface
///
/// - **Service Name**: `io.github.cryocond`
/// - **Object Path**: `/io/github/cryocond`
pub struct DBusServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
}

impl DBusServiceProvider {
    /// Connects to the session bus.
    pub async fn new(state: Arc<AppState>, event_bus: EventBus) -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to the session bus")?;
        Ok(Self {
            state,
            event_bus,
            connection,
        })
    }
}

#[async_trait]
impl ServiceProvider for DBusServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();
        let connection = self.connection.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_dbus_service(state, event_bus, connection, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "DBusService"
    }

    fn priority(&self) -> i32 {
        8
    }
}

async fn run_dbus_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut event_rx = event_bus.subscribe();
    let interface = DBusInterface::new(state, env!("CARGO_PKG_VERSION").to_string(), event_bus);
    connection.object_server().at(OBJECT_PATH, interface).await?;
    connection.request_name(BUS_NAME).await?;
    info!("Serving {BUS_NAME} at {OBJECT_PATH}");

    let iface_ref = connection
        .object_server()
        .interface::<_, DBusInterface>(OBJECT_PATH)
        .await?;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("D-Bus service cancelled");
                break;
            }
            event = event_rx.recv() => match event {
                Ok(Event::StateChanged { state, status }) => {
                    if let Err(e) = notify_state(&iface_ref, &state.to_string(), &status).await {
                        warn!("Failed to emit state change: {e}");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("D-Bus service skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Err(e) = connection.release_name(BUS_NAME).await {
        debug!("Failed to release {BUS_NAME}: {e}");
    }
    Ok(())
}

async fn notify_state(
    iface_ref: &InterfaceRef<DBusInterface>,
    state: &str,
    status: &str,
) -> zbus::Result<()> {
    let emitter = iface_ref.signal_emitter();
    DBusInterface::device_state_changed(emitter, state, status).await?;

    let iface = iface_ref.get().await;
    iface.state_changed(emitter).await?;
    iface.status_changed(emitter).await
}
