//! Periodic background refresh of every declared attribute.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState,
    event::{Event, EventBus},
    providers::traits::ServiceProvider,
    state::DevState,
    task_manager::TaskManager,
};

/// Background polling service provider.
///
/// Periodically refreshes every declared attribute in one grouped request,
/// publishes the outcome and reports state changes on the event bus.
///
/// # Priority and Criticality
///
/// - **Priority**: 10 (highest)
/// - **Critical**: Yes
///
/// A `poll_interval` of zero disables polling; the service then only waits
/// for cancellation and reads refresh the cache on demand.
pub struct PollingServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
}

impl PollingServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus) -> Self {
        Self { state, event_bus }
    }
}

#[async_trait]
impl ServiceProvider for PollingServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_polling_service(state, event_bus, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "PollingService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn run_polling_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    cancel_token: CancellationToken,
) -> Result<()> {
    let period = Duration::try_from_secs_f64(state.config().await.poll_interval)?;
    if period.is_zero() {
        info!("Background polling disabled");
        cancel_token.cancelled().await;
        return Ok(());
    }

    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_state = None;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Polling service cancelled");
                break;
            }
            _instant = interval.tick() => {
                poll_once(&state, &event_bus, &mut last_state).await;
            }
        }
    }
    Ok(())
}

async fn poll_once(
    state: &AppState,
    event_bus: &EventBus,
    last_state: &mut Option<(DevState, String)>,
) {
    let (failed, current) = {
        let mut device = state.device.lock().await;
        let failed = match device.poll_all().await {
            Ok(_) => Some(device.failed()),
            Err(e) => {
                warn!("Poll failed: {e}");
                device.derive_state(Some(Err(e))).await;
                None
            }
        };
        (failed, device.current_state())
    };

    if let Some(failed) = failed {
        if let Err(e) = event_bus.publish(Event::Polled { failed }) {
            debug!("No subscriber for poll result: {e}");
        }
    }

    if last_state.as_ref() != Some(&current) {
        info!("State {}: {}", current.0, current.1);
        let (state, status) = current.clone();
        if let Err(e) = event_bus.publish(Event::StateChanged { state, status }) {
            debug!("No subscriber for state change: {e}");
        }
        *last_state = Some(current);
    }
}
