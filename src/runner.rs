//! Process runner: spawns tool processes and reports how they end
//!
//! Each spawned child is owned by a monitor task. The returned
//! [`ProcessHandle`] is a cheap clone that can observe the exit and send
//! termination signals without touching the `Child` itself.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What to run for an instance
#[derive(Debug)]
pub struct ProcessSpec<'a> {
    /// Program followed by its arguments
    pub command: &'a [String],
    /// Variables added on top of the supervisor's own environment
    pub env: &'a HashMap<String, String>,
    pub working_dir: Option<&'a Path>,
    /// Instance id, attached to every log line of the child
    pub instance_id: &'a str,
    pub kind: &'a str,
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process terminated (normally or by a signal)
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The OS reported an error while waiting on the process
    Failed(String),
}

impl ProcessExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ProcessExit::Exited {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Exited { code: Some(code), .. } => write!(f, "exited with code {}", code),
            ProcessExit::Exited { signal: Some(signal), .. } => {
                write!(f, "terminated by signal {}", signal)
            }
            ProcessExit::Exited { .. } => f.write_str("exited"),
            ProcessExit::Failed(e) => write!(f, "process error: {}", e),
        }
    }
}

/// Termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM on unix, hard kill elsewhere
    Terminate,
    /// SIGKILL
    Kill,
}

/// Handle to a running child process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    signal_tx: mpsc::UnboundedSender<Signal>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit, if the process has ended
    pub fn exit(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Ask the monitor task to deliver a signal. No-op once the process is gone.
    pub fn signal(&self, signal: Signal) {
        if self.has_exited() {
            return;
        }
        let _ = self.signal_tx.send(signal);
    }

    /// Wait until the process ends
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone(),
            Err(_) => None,
        };
        exit.unwrap_or_else(|| ProcessExit::Failed("process monitor ended".to_string()))
    }
}

/// Spawn a process. Fails only if the OS refuses to start it.
pub fn spawn(spec: &ProcessSpec<'_>) -> io::Result<ProcessHandle> {
    let (program, args) = spec
        .command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    if let Some(dir) = spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.envs(spec.env);

    let mut child = cmd.spawn()?;
    let pid = child.id();
    info!(
        instance_id = spec.instance_id,
        kind = spec.kind,
        pid,
        program = %program,
        "Tool process spawned"
    );

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_output(stdout, spec.instance_id.to_string(), "stdout"));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_output(stderr, spec.instance_id.to_string(), "stderr"));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    tokio::spawn(monitor(child, signal_rx, exit_tx, spec.instance_id.to_string()));

    Ok(ProcessHandle {
        pid,
        exit_rx,
        signal_tx,
    })
}

async fn monitor(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    instance_id: String,
) {
    let exit = loop {
        tokio::select! {
            result = child.wait() => {
                break match result {
                    Ok(status) => ProcessExit::from_status(status),
                    Err(e) => ProcessExit::Failed(e.to_string()),
                };
            }
            Some(signal) = signals.recv() => {
                deliver(&mut child, signal, &instance_id);
            }
        }
    };

    debug!(instance_id = %instance_id, %exit, "Tool process ended");
    exit_tx.send_replace(Some(exit));
}

fn deliver(child: &mut Child, signal: Signal, instance_id: &str) {
    match signal {
        Signal::Terminate => {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    info!(instance_id, pid, "Sending SIGTERM to tool process");
                    // SAFETY: pid belongs to a child we still own and have not reaped.
                    unsafe {
                        libc::kill(pid as i32, libc::SIGTERM);
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = child.start_kill() {
                    warn!(instance_id, error = %e, "Failed to kill tool process");
                }
            }
        }
        Signal::Kill => {
            warn!(instance_id, pid = child.id(), "Sending SIGKILL to tool process");
            if let Err(e) = child.start_kill() {
                warn!(instance_id, error = %e, "Failed to kill tool process");
            }
        }
    }
}

async fn forward_output<R>(reader: R, instance_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "toolgate::tool", instance_id = %instance_id, stream, "{}", line);
    }
}
