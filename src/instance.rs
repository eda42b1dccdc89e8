//! One supervised tool process and its status state machine
//!
//! An instance starts in `starting`, spawns its command, polls the port until
//! it answers and then serves until stopped or until the process exits.
//! Every transition is published to the instance's observers in order.

use crate::config::LifecycleTimings;
use crate::health;
use crate::registry::{LaunchCommand, LaunchContext};
use crate::runner::{self, ProcessExit, ProcessHandle, ProcessSpec, Signal};
use crate::status::{InstanceStatus, StatusId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serializable view of an instance
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub id: String,
    pub kind: String,
    pub context: LaunchContext,
    pub port: u16,
    /// Public instance path, with a trailing slash
    pub path: String,
    pub status: InstanceStatus,
}

/// Where the child process is in its life
enum ProcessSlot {
    /// Not spawned yet
    Pending,
    Running(ProcessHandle),
    /// Stop arrived before the spawn; never spawn
    Cancelled,
}

enum HealthOutcome {
    Ready,
    TimedOut,
    /// Status left the loading states or the instance was cancelled
    Aborted,
}

pub struct Instance {
    id: String,
    kind: String,
    context: LaunchContext,
    port: u16,
    public_path: String,
    launch: LaunchCommand,
    health_path: String,
    timings: LifecycleTimings,
    status_tx: watch::Sender<InstanceStatus>,
    observers: Mutex<Vec<mpsc::UnboundedSender<InstanceStatus>>>,
    process: Mutex<ProcessSlot>,
    /// Set when the instance is stopped because it failed, so the exit is
    /// reported as `errored` rather than `stopped`
    failure: Mutex<Option<String>>,
    cancel: CancellationToken,
}

/// Construction parameters, resolved by the manager
pub struct InstanceParams {
    pub id: String,
    pub kind: String,
    pub context: LaunchContext,
    pub public_path: String,
    pub launch: LaunchCommand,
    pub health_path: String,
    pub timings: LifecycleTimings,
    pub cancel: CancellationToken,
}

impl Instance {
    /// Create an instance in `starting`. Nothing is spawned until [`Instance::launch`].
    pub fn new(params: InstanceParams) -> Arc<Self> {
        let status = InstanceStatus::new(params.id.clone(), StatusId::Starting);
        let (status_tx, _) = watch::channel(status);

        Arc::new(Self {
            port: params.launch.port,
            id: params.id,
            kind: params.kind,
            context: params.context,
            public_path: params.public_path,
            launch: params.launch,
            health_path: params.health_path,
            timings: params.timings,
            status_tx,
            observers: Mutex::new(Vec::new()),
            process: Mutex::new(ProcessSlot::Pending),
            failure: Mutex::new(None),
            cancel: params.cancel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn context(&self) -> &LaunchContext {
        &self.context
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn public_path(&self) -> &str {
        &self.public_path
    }

    pub fn health_path(&self) -> &str {
        &self.health_path
    }

    pub fn status(&self) -> InstanceStatus {
        self.status_tx.borrow().clone()
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.process.lock() {
            ProcessSlot::Running(handle) => handle.pid(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id.clone(),
            kind: self.kind.clone(),
            context: self.context.clone(),
            port: self.port,
            path: self.public_path.clone(),
            status: self.status(),
        }
    }

    /// Stream of statuses: the current one, then every transition. The
    /// stream ends after a terminal status.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InstanceStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut observers = self.observers.lock();
        let current = self.status();
        let terminal = current.is_terminal();
        let _ = tx.send(current);
        if !terminal {
            observers.push(tx);
        }
        rx
    }

    /// Watch of the current status
    pub fn watch_status(&self) -> watch::Receiver<InstanceStatus> {
        self.status_tx.subscribe()
    }

    /// Apply a transition if the state machine allows it, and publish it.
    fn transition(&self, next: StatusId, message: Option<String>) -> bool {
        let mut observers = self.observers.lock();
        let current = self.status();
        if !current.status_id.can_transition_to(next) {
            debug!(
                instance_id = %self.id,
                from = %current.status_id,
                to = %next,
                "Ignoring status transition"
            );
            return false;
        }

        let status = current.successor(next, message);
        info!(
            instance_id = %self.id,
            kind = %self.kind,
            port = self.port,
            status = %status.status_id,
            message = status.status_message.as_deref().unwrap_or(""),
            "Instance status changed"
        );

        self.status_tx.send_replace(status.clone());
        observers.retain(|tx| tx.send(status.clone()).is_ok());
        if next.is_terminal() {
            observers.clear();
        }
        true
    }

    /// Spawn the process and drive the state machine in the background
    pub fn launch(self: &Arc<Self>) {
        let instance = self.clone();
        tokio::spawn(async move { instance.run().await });
    }

    async fn run(self: Arc<Self>) {
        let handle = {
            let mut slot = self.process.lock();
            if matches!(*slot, ProcessSlot::Cancelled) {
                drop(slot);
                self.transition(StatusId::Stopped, Some("stopped before start".to_string()));
                return;
            }

            let spec = ProcessSpec {
                command: &self.launch.command,
                env: &self.launch.env,
                working_dir: self.launch.working_dir.as_deref(),
                instance_id: &self.id,
                kind: &self.kind,
            };
            match runner::spawn(&spec) {
                Ok(handle) => {
                    *slot = ProcessSlot::Running(handle.clone());
                    handle
                }
                Err(e) => {
                    drop(slot);
                    error!(instance_id = %self.id, kind = %self.kind, error = %e, "Failed to spawn tool process");
                    self.transition(
                        StatusId::Errored,
                        Some(format!("failed to start process: {}", e)),
                    );
                    return;
                }
            }
        };

        let watcher = self.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await;
            watcher.finish(exit);
        });

        self.transition(StatusId::WaitingForPort, None);

        match self.poll_health().await {
            HealthOutcome::Ready => {
                self.transition(StatusId::Started, None);
            }
            HealthOutcome::TimedOut => {
                let message = format!(
                    "timed out after {:?} waiting for port {}",
                    self.timings.startup_timeout, self.port
                );
                warn!(instance_id = %self.id, kind = %self.kind, "{}", message);
                *self.failure.lock() = Some(message.clone());

                if !self.stop().await {
                    self.transition(StatusId::Errored, Some(message));
                }
            }
            HealthOutcome::Aborted => {
                debug!(instance_id = %self.id, "Health polling aborted");
            }
        }
    }

    async fn poll_health(&self) -> HealthOutcome {
        let timings = self.timings;
        let deadline = Instant::now() + timings.startup_timeout;
        let mut status_rx = self.status_tx.subscribe();

        debug!(
            instance_id = %self.id,
            port = self.port,
            path = %self.health_path,
            "Starting health check polling"
        );

        loop {
            if !self.status().is_loading() {
                return HealthOutcome::Aborted;
            }

            if health::check(self.port, &self.health_path, timings.validation, timings.probe_timeout).await {
                return HealthOutcome::Ready;
            }

            let now = Instant::now();
            if now >= deadline {
                return HealthOutcome::TimedOut;
            }

            let pause = timings.health_check_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.cancel.cancelled() => return HealthOutcome::Aborted,
                _ = status_rx.changed() => {}
            }
        }
    }

    /// Record the end of the process
    fn finish(&self, exit: ProcessExit) {
        let failure = self.failure.lock().take();
        let (status, message) = match (failure, exit) {
            (Some(reason), _) => (StatusId::Errored, reason),
            (None, ProcessExit::Failed(e)) => (StatusId::Errored, e),
            (None, exit) => (StatusId::Stopped, exit.to_string()),
        };
        self.transition(status, Some(message));
    }

    /// Stop the instance: SIGTERM, bounded wait, SIGKILL, bounded wait.
    ///
    /// Returns `true` once the process is confirmed gone, and immediately if
    /// the instance is already stopping or terminal.
    pub async fn stop(&self) -> bool {
        if self.status().is_completed() {
            return true;
        }
        if !self.transition(StatusId::Stopping, None) {
            return true;
        }
        self.cancel.cancel();

        let handle = {
            let mut slot = self.process.lock();
            if matches!(*slot, ProcessSlot::Pending) {
                *slot = ProcessSlot::Cancelled;
            }
            match &*slot {
                ProcessSlot::Running(handle) => Some(handle.clone()),
                _ => None,
            }
        };

        let wait = self.timings.stop_timeout;
        let Some(handle) = handle else {
            return self.wait_terminal(wait).await;
        };

        handle.signal(Signal::Terminate);
        if self.wait_terminal(wait).await {
            return true;
        }

        warn!(
            instance_id = %self.id,
            pid = handle.pid(),
            "Tool process ignored SIGTERM, escalating"
        );
        handle.signal(Signal::Kill);
        self.wait_terminal(wait).await
    }

    async fn wait_terminal(&self, timeout: Duration) -> bool {
        let mut rx = self.status_tx.subscribe();
        let confirmed =
            match tokio::time::timeout(timeout, rx.wait_for(InstanceStatus::is_terminal)).await {
                Ok(result) => result.is_ok(),
                Err(_) => false,
            };
        confirmed
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("port", &self.port)
            .field("status", &self.status().status_id)
            .finish()
    }
}
