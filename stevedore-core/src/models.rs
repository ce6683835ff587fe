use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::document::ExecutionMode;

/// Minimal listing info for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub mode: ExecutionMode,
    pub state: ServiceState,
    /// Container name or process key the backend knows the service by.
    pub instance: String,
}

/// Runtime state enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceState {
    NotFound,
    Stopped,
    Running,
    Unknown,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Unknown => "unknown",
        }
    }
}

/// Detailed status for a service.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_ms: Option<u64>,
}

impl ServiceStatus {
    pub fn of(state: ServiceState) -> Self {
        Self {
            state,
            pid: None,
            uptime_ms: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

/// Result of a stop request. Stopping something that is not running is not an error.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
}

/// Output of a command executed inside a running instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    /// stdout followed by stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
