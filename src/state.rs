//! Device state and status derived from the instrument's control flag.

use std::{fmt, time::Duration};

use tokio::time::Instant;

use crate::error::CryoError;

/// Minimum time between two state refreshes that query the instrument.
pub const STATE_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Unknown,
    On,
    Off,
    Fault,
}

impl fmt::Display for DevState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DevState::Unknown => "UNKNOWN",
            DevState::On => "ON",
            DevState::Off => "OFF",
            DevState::Fault => "FAULT",
        })
    }
}

/// Last derived (state, status) pair and when it was computed.
#[derive(Debug, Clone)]
pub struct RunState {
    state: DevState,
    status: String,
    computed_at: Option<Instant>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            state: DevState::Unknown,
            status: "Waiting for first poll".to_string(),
            computed_at: None,
        }
    }
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives the pair from a control value or the error that replaced it.
    pub fn apply(&mut self, control: Result<bool, &CryoError>, now: Instant) -> (DevState, String) {
        (self.state, self.status) = match control {
            Ok(true) => (DevState::On, "Control is On".to_string()),
            Ok(false) => (DevState::Off, "Control is Off".to_string()),
            Err(e) => (DevState::Fault, format!("Error: {e}")),
        };
        self.computed_at = Some(now);
        self.current()
    }

    /// Whether enough time has passed to query the instrument again.
    pub fn is_due(&self, now: Instant) -> bool {
        self.computed_at
            .is_none_or(|at| now.saturating_duration_since(at) >= STATE_REFRESH)
    }

    /// Forces the next refresh to query the instrument.
    pub fn invalidate(&mut self) {
        self.computed_at = None;
    }

    pub fn current(&self) -> (DevState, String) {
        (self.state, self.status.clone())
    }
}
