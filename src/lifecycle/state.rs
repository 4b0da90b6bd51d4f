use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Recovering,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Recovering => "recovering",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub error: String,
    pub operation: String,
    pub timestamp: DateTime<Utc>,
}

/// Runtime view of the server. Rebuilt from `stopped` on every process start.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub server_state: ServerState,
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
    pub last_error: Option<LastError>,
    pub recovery_attempts: u32,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            server_state: ServerState::Stopped,
            is_running: false,
            start_time: None,
            consecutive_errors: 0,
            last_error: None,
            recovery_attempts: 0,
        }
    }
}

impl RuntimeState {
    pub fn uptime_seconds(&self) -> Option<i64> {
        self.start_time
            .filter(|_| self.is_running)
            .map(|t| (Utc::now() - t).num_seconds().max(0))
    }
}

/// Shared handle to the runtime state.
///
/// The lock is never held across an await point.
#[derive(Debug, Clone, Default)]
pub struct RuntimeHandle(Arc<Mutex<RuntimeState>>);

impl RuntimeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RuntimeState {
        self.0.lock().clone()
    }

    pub fn state(&self) -> ServerState {
        self.0.lock().server_state
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RuntimeState) -> R) -> R {
        f(&mut self.0.lock())
    }
}
