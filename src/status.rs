//! Instance status model shared by the supervisor and its observers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle state of a server proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusId {
    /// Instance created, process not spawned yet
    Starting,
    /// Process spawned, polling until the port answers
    WaitingForPort,
    /// Health check passed, traffic can be routed
    Started,
    /// Termination requested
    Stopping,
    /// Process exited
    Stopped,
    /// Spawn failure, process error or health check timeout
    Errored,
}

impl StatusId {
    /// No further transitions happen from a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusId::Stopped | StatusId::Errored)
    }

    /// Terminal or on its way there. `Stopping` counts as completed for
    /// presentation and for dedup, but the instance stays in the live table
    /// until the process is gone.
    pub fn is_completed(self) -> bool {
        self.is_terminal() || self == StatusId::Stopping
    }

    pub fn is_loading(self) -> bool {
        matches!(self, StatusId::Starting | StatusId::WaitingForPort)
    }

    pub fn is_running(self) -> bool {
        self == StatusId::Started
    }

    /// Edges of the instance state machine
    pub fn can_transition_to(self, next: StatusId) -> bool {
        use StatusId::*;
        match self {
            Starting => matches!(next, WaitingForPort | Stopping | Stopped | Errored),
            WaitingForPort => matches!(next, Started | Stopping | Stopped | Errored),
            Started => matches!(next, Stopping | Stopped | Errored),
            Stopping => matches!(next, Stopped | Errored),
            Stopped | Errored => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusId::Starting => "starting",
            StatusId::WaitingForPort => "waiting-for-port",
            StatusId::Started => "started",
            StatusId::Stopping => "stopping",
            StatusId::Stopped => "stopped",
            StatusId::Errored => "errored",
        }
    }
}

impl fmt::Display for StatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status snapshot as pushed to observers.
///
/// `time_ms` is strictly increasing per instance, so consumers can drop any
/// update whose timestamp is not newer than the last one they saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    pub status_id: StatusId,
    pub time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl InstanceStatus {
    pub fn new(instance_id: impl Into<String>, status_id: StatusId) -> Self {
        Self {
            instance_id: instance_id.into(),
            status_id,
            time_ms: now_ms(),
            status_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    /// Build the status that follows `self`, keeping the timestamp strictly
    /// ahead of the previous one even when the wall clock is not.
    pub fn successor(&self, status_id: StatusId, message: Option<String>) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            status_id,
            time_ms: now_ms().max(self.time_ms + 1),
            status_message: message,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status_id.is_terminal()
    }

    pub fn is_completed(&self) -> bool {
        self.status_id.is_completed()
    }

    pub fn is_loading(&self) -> bool {
        self.status_id.is_loading()
    }

    pub fn is_running(&self) -> bool {
        self.status_id.is_running()
    }
}

/// Milliseconds since the unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
