//! System coordinator for managing service lifecycle and dependency injection.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    app_context::AppState,
    config::ConfigManager,
    event::{Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, DBusServiceProvider, PollingServiceProvider,
        ServiceProvider,
    },
    task_manager::TaskManager,
};

/// Owns the shared state, the services and the event bus, and drives them
/// from startup to shutdown.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the main loop keeps going after an event.
enum Flow {
    Continue,
    Stop,
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
        }
    }

    /// Validates the configuration, builds the device and registers the
    /// services. No connection is opened unless the front panel has to be
    /// locked.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!(
            "Initializing SystemCoordinator with {}",
            config_manager.path().display()
        );

        let state = AppStateProvider::new(config_manager)
            .provide()
            .await
            .context("Failed to initialize application state")?;
        self.shared_state = Some(state.clone());

        state.device.lock().await.lock_front_panel().await;

        self.register_service_providers(state).await;

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    async fn register_service_providers(&mut self, state: Arc<AppState>) {
        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![Box::new(
            PollingServiceProvider::new(state.clone(), self.event_bus.clone()),
        )];

        match DBusServiceProvider::new(state, self.event_bus.clone()).await {
            Ok(provider) => providers.push(Box::new(provider)),
            Err(e) => warn!("Failed to create D-Bus service provider: {e:#}, skipping D-Bus service"),
        }

        self.add_providers(providers);
    }

    fn add_providers(&mut self, providers: Vec<Box<dyn ServiceProvider>>) {
        self.service_providers.extend(providers);
        self.service_providers
            .sort_by_key(|b| std::cmp::Reverse(b.priority()));

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );
    }

    /// Starts all registered services in priority order.
    ///
    /// Critical services must start successfully, while non-critical services
    /// can fail without stopping the system.
    pub async fn start_all_services(&mut self) -> Result<()> {
        info!(
            "Starting {} services in priority order...",
            self.service_providers.len()
        );

        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => {
                    info!(
                        "Service '{}' started successfully (priority: {}, critical: {})",
                        provider.name(),
                        provider.priority(),
                        is_critical
                    );
                }
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => {
                    warn!(
                        "Non-critical service '{}' failed to start: {}",
                        provider.name(),
                        e
                    );
                }
            }
        }

        info!("All critical services started successfully");
        Ok(())
    }

    /// Runs until Ctrl+C or a `SystemShutdown` event, then shuts down.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    break;
                }

                event = event_rx.recv() => {
                    if let Flow::Stop = self.handle_event(event)? {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Main event loop terminated");
        Ok(())
    }

    fn handle_event(&self, event: Result<Event, RecvError>) -> Result<Flow> {
        match event {
            Ok(Event::SystemShutdown) => {
                info!("Processing SystemShutdown event");
                return Ok(Flow::Stop);
            }
            Ok(Event::Polled { failed }) if failed.is_empty() => debug!("Poll completed"),
            Ok(Event::Polled { failed }) => {
                debug!("Poll completed, failed: {}", failed.join(", "));
            }
            Ok(Event::StateChanged { state, status }) => {
                info!("Device state {state}: {status}");
            }
            Err(RecvError::Closed) => bail!("Event bus channel closed unexpectedly"),
            Err(RecvError::Lagged(n)) => warn!("Event bus lagged by {n} messages"),
        }
        Ok(Flow::Continue)
    }

    /// Stops every service, then closes the instrument connection. Errors
    /// are logged only.
    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            log::error!("Error during task shutdown: {e:#}");
        }

        if let Some(state) = &self.shared_state {
            state.device.lock().await.close().await;
        }

        info!("Shutdown complete");
    }

    /// The bus shared with the services.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Registered services, highest priority first.
    ///
    /// Used only for testing purposes.
    #[cfg(test)]
    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}
