//! # cryocond
//!
//! A Linux device server for Cryo-con cryogenic temperature controllers.
//!
//! ## Features
//!
//! - **Batched polling**: every refresh is one `;`-joined request, led by
//!   the `control` query, whose replies replace a last-values cache
//! - **Typed attribute table**: channels, loops, identification and control
//!   resolved once from configuration
//! - **Derived state**: ON/OFF/FAULT plus a status line, throttled to one
//!   instrument query per second
//! - **Transports**: serial line or TCP, opened lazily and reopened after
//!   a failure
//! - **D-Bus Interface**: attribute reads and writes, control, raw commands
//!
//! ## Architecture
//!
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - Main lifecycle manager
//! - [`EventBus`](event::EventBus) - Inter-service communication
//! - [`AppState`](app_context::AppState) - Shared application state
//! - [`CryoConDevice`](device::CryoConDevice) - Poll coordinator and attribute access
//!
//! ## Example
//!
//! ```no_run
//! use cryocond::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod attributes;
pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod device;
pub mod drivers;
pub mod error;
pub mod event;
pub mod interface;
pub mod providers;
pub mod state;
pub mod task_manager;

#[cfg(test)]
mod testing;
