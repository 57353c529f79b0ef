//! Spawning and supervising miner processes.

use async_trait::async_trait;
use futures::StreamExt;
use mining_core::{GpuSelection, MiningError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lines of output retained per process
pub const LOG_BUFFER_LINES: usize = 500;

const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Engine-native command line produced from a [`mining_core::MinerConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// GPU participation after the safety policy was applied
    pub gpu: GpuSelection,
    pub cpu_enabled: bool,
}

impl Invocation {
    /// True when neither CPU nor GPU would do any work
    pub fn is_idle(&self) -> bool {
        !self.cpu_enabled && !self.gpu.is_enabled()
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|arg| arg == flag || arg.starts_with(&format!("{}=", flag)))
    }

    /// Value following `flag`, either as `flag value` or `flag=value`
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("{}=", flag);
        self.args.iter().enumerate().find_map(|(i, arg)| {
            if arg == flag {
                self.args.get(i + 1).map(String::as_str)
            } else {
                arg.strip_prefix(&prefix)
            }
        })
    }
}

/// Opaque reference to a spawned process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub id: Uuid,
    pub name: String,
    pub pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(name: impl Into<String>, pid: Option<u32>) -> Self {
        ProcessHandle {
            id: Uuid::new_v4(),
            name: name.into(),
            pid,
        }
    }
}

/// Operating-system boundary for miner processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, name: &str, invocation: &Invocation) -> Result<ProcessHandle>;

    async fn terminate(&self, handle: &ProcessHandle) -> Result<()>;

    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    fn recent_logs(&self, handle: &ProcessHandle) -> Vec<String>;
}

/// Fixed-size ring of output lines
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        LogBuffer {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }
}

struct ManagedProcess {
    alive: Arc<AtomicBool>,
    logs: Arc<LogBuffer>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

/// [`ProcessLauncher`] backed by `tokio::process`
pub struct SystemLauncher {
    processes: RwLock<HashMap<Uuid, Arc<ManagedProcess>>>,
    stop_timeout: Duration,
}

impl SystemLauncher {
    pub fn new() -> Self {
        Self::with_stop_timeout(Duration::from_secs(10))
    }

    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        SystemLauncher {
            processes: RwLock::new(HashMap::new()),
            stop_timeout,
        }
    }

    fn process(&self, handle: &ProcessHandle) -> Option<Arc<ManagedProcess>> {
        self.processes.read().get(&handle.id).cloned()
    }
}

impl Default for SystemLauncher {
    fn default() -> Self {
        Self::new()
    }
}

async fn capture_lines<R>(name: String, reader: R, logs: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => logs.push(line),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                logs.push("[line truncated]".to_string());
            }
            Err(LinesCodecError::Io(e)) => {
                debug!("Output capture for {} ended: {}", name, e);
                break;
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn spawn(&self, name: &str, invocation: &Invocation) -> Result<ProcessHandle> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MiningError::StartFailed {
                name: name.to_string(),
                reason: format!("{}: {}", invocation.program.display(), e),
            })?;

        let handle = ProcessHandle::new(name, child.id());
        let logs = Arc::new(LogBuffer::new(LOG_BUFFER_LINES));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture_lines(name.to_string(), stdout, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_lines(name.to_string(), stderr, logs.clone()));
        }

        let alive = Arc::new(AtomicBool::new(true));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(false);

        let watcher_alive = alive.clone();
        let watcher_name = name.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to signal {}: {}", watcher_name, e);
                    }
                    child.wait().await
                }
            };
            watcher_alive.store(false, Ordering::SeqCst);
            match status {
                Ok(status) => info!("Miner process {} exited with {}", watcher_name, status),
                Err(e) => warn!("Failed to reap miner process {}: {}", watcher_name, e),
            }
            let _ = exit_tx.send(true);
        });

        self.processes.write().insert(
            handle.id,
            Arc::new(ManagedProcess {
                alive,
                logs,
                kill: Mutex::new(Some(kill_tx)),
                exited: exit_rx,
            }),
        );

        info!("Spawned {} (pid {:?})", name, handle.pid);
        Ok(handle)
    }

    /// Kill the process and stop tracking it, whether or not it exits in time.
    /// The reaper task keeps waiting on a straggler.
    async fn terminate(&self, handle: &ProcessHandle) -> Result<()> {
        let process = self
            .processes
            .write()
            .remove(&handle.id)
            .ok_or_else(|| MiningError::StopFailed {
                name: handle.name.clone(),
                reason: "unknown process".to_string(),
            })?;

        if let Some(kill) = process.kill.lock().take() {
            let _ = kill.send(());
        }

        let mut exited = process.exited.clone();
        let waited = tokio::time::timeout(self.stop_timeout, exited.wait_for(|done| *done)).await;
        match waited {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    "{} did not exit within {:?}, no longer tracked",
                    handle.name, self.stop_timeout
                );
                Err(MiningError::StopFailed {
                    name: handle.name.clone(),
                    reason: format!("process did not exit within {:?}", self.stop_timeout),
                })
            }
        }
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.process(handle)
            .map(|process| process.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn recent_logs(&self, handle: &ProcessHandle) -> Vec<String> {
        self.process(handle)
            .map(|process| process.logs.lines())
            .unwrap_or_default()
    }
}
