//! Dependency injection providers for service management.
//!
//! The shared state is built by [`AppStateProvider`]; long-running services
//! implement [`ServiceProvider`] and are started by the coordinator in
//! priority order.

pub mod app_state;
pub mod dbus;
pub mod poller;
pub mod traits;

pub use app_state::AppStateProvider;
pub use dbus::DBusServiceProvider;
pub use poller::PollingServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};
