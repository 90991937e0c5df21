use crate::config::{BackendConfig, ProxyTarget};
use crate::error::Error;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Log target for lines captured from the backend's stdout/stderr
const BACKEND_LOG_TARGET: &str = "devgate::backend";

/// State of a backend process handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Process was spawned and has not been terminated by us
    Running,
    /// Process has been terminated (or found dead) and reaped
    Stopped,
}

/// Snapshot of the live backend, safe to hand out to other components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// OS process id
    pub pid: u32,
    /// Monotonic start counter; increments on every successful spawn
    pub generation: u64,
    /// Address the backend listens on
    pub target: ProxyTarget,
    /// Time since the process was spawned
    pub uptime: Duration,
}

/// Handle to one spawned backend process
pub struct BackendProcess {
    child: Child,
    pid: u32,
    command: String,
    target: ProxyTarget,
    generation: u64,
    started_at: Instant,
    state: BackendState,
}

impl BackendProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            generation: self.generation,
            target: self.target.clone(),
            uptime: self.started_at.elapsed(),
        }
    }

    /// Whether the OS process has exited (reaping it if so)
    pub fn has_exited(&mut self) -> bool {
        if self.state == BackendState::Stopped {
            return true;
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Terminate the process: SIGTERM, wait up to `grace_period`, then SIGKILL.
    ///
    /// Calling this on an already stopped handle is a no-op.
    pub async fn terminate(&mut self, grace_period: Duration) -> Result<(), Error> {
        if self.state == BackendState::Stopped {
            return Ok(());
        }

        let pid = self.pid;

        if let Ok(Some(status)) = self.child.try_wait() {
            info!(pid, ?status, "Backend process had already exited");
            self.state = BackendState::Stopped;
            return Ok(());
        }

        info!(pid, command = %self.command, "Sending SIGTERM to backend");

        // Send SIGTERM on Unix, or kill on other platforms
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        let wait_result = tokio::time::timeout(grace_period, self.child.wait()).await;

        let result = match wait_result {
            Ok(Ok(status)) => {
                info!(pid, ?status, "Backend process exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(pid, error = %e, "Error waiting for backend to exit");
                Ok(())
            }
            Err(_) => {
                warn!(
                    pid,
                    grace_period_ms = grace_period.as_millis() as u64,
                    "Grace period exceeded, sending SIGKILL"
                );
                self.child.kill().await.map_err(|e| Error::ProcessTermination {
                    pid,
                    reason: e.to_string(),
                })
            }
        };

        self.state = BackendState::Stopped;
        result
    }
}

/// Owns the backend process and serializes every change to it.
///
/// # Usage
///
/// `Supervisor` is shared behind an `Arc` between the coordinator and the
/// health monitor. The [`new`](Supervisor::new) constructor returns `Arc<Self>`
/// directly to enforce this pattern.
///
/// All mutation happens while holding one async mutex, so there is at most one
/// live backend and a restart is observed either before or after, never halfway.
pub struct Supervisor {
    config: BackendConfig,
    target: Arc<ProxyTarget>,
    document_root: PathBuf,
    current: Mutex<Option<BackendProcess>>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        let target = Arc::new(config.target());
        let document_root = config.document_root();
        Arc::new(Self {
            config,
            target,
            document_root,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Shared, immutable backend address
    pub fn target(&self) -> Arc<ProxyTarget> {
        Arc::clone(&self.target)
    }

    pub fn document_root(&self) -> &Path {
        &self.document_root
    }

    /// Number of successful spawns so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Refuse all further starts and restarts
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Snapshot of the live backend, if any
    pub async fn current(&self) -> Option<ProcessInfo> {
        let mut guard = self.current.lock().await;
        match guard.as_mut() {
            Some(process) => (!process.has_exited()).then(|| process.info()),
            None => None,
        }
    }

    /// Start the backend if it is not already running
    pub async fn start(&self) -> Result<ProcessInfo, Error> {
        let mut guard = self.current.lock().await;

        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        if let Some(process) = guard.as_mut() {
            if !process.has_exited() {
                debug!(pid = process.pid(), "Backend already running");
                return Ok(process.info());
            }
            // Reap the dead handle before replacing it
            let _ = process.terminate(Duration::ZERO).await;
        }

        let process = self.spawn().await?;
        let info = process.info();
        *guard = Some(process);
        Ok(info)
    }

    /// Stop the current backend (if any), then start a new one
    pub async fn restart(&self) -> Result<ProcessInfo, Error> {
        let mut guard = self.current.lock().await;

        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        if let Some(mut old) = guard.take() {
            let old_pid = old.pid();
            info!(pid = old_pid, generation = old.generation(), "Restarting backend");
            if let Err(e) = old.terminate(self.config.shutdown_grace_period()).await {
                error!(pid = old_pid, error = %e, "Failed to terminate previous backend");
            }
        }

        let process = self.spawn().await?;
        let info = process.info();
        *guard = Some(process);
        Ok(info)
    }

    /// Stop the backend, waiting up to `timeout` before forcing it.
    ///
    /// Stopping when nothing is running is a no-op.
    pub async fn stop(&self, timeout: Duration) -> Result<(), Error> {
        let mut guard = self.current.lock().await;
        let Some(mut process) = guard.take() else {
            return Ok(());
        };
        process.terminate(timeout).await
    }

    async fn spawn(&self) -> Result<BackendProcess, Error> {
        let command = &self.config.command;
        let args = self.config.render_args(&self.target, &self.document_root);

        info!(
            command = %command,
            args = ?args,
            backend = %self.target,
            document_root = %self.document_root.display(),
            "Starting backend"
        );

        let program = resolve_executable(command).ok_or_else(|| Error::Launch {
            command: command.clone(),
            reason: "executable not found".to_string(),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        cmd.current_dir(&self.document_root);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Launch {
            command: command.clone(),
            reason: match e.kind() {
                std::io::ErrorKind::NotFound => "executable not found".to_string(),
                _ => e.to_string(),
            },
        })?;

        let pid = child.id().unwrap_or(0);
        info!(pid, "Backend process spawned");

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, pid, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, pid, "stderr");
        }

        let warmup = self.config.warmup();
        debug!(pid, warmup_ms = warmup.as_millis() as u64, "Waiting for backend warm-up");
        tokio::time::sleep(warmup).await;

        if let Ok(Some(status)) = child.try_wait() {
            error!(pid, ?status, "Backend exited during warm-up");
            return Err(Error::ExitedImmediately {
                command: command.clone(),
                status: status.to_string(),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(pid, generation, backend = %self.target, "Backend started");

        Ok(BackendProcess {
            child,
            pid,
            command: command.clone(),
            target: (*self.target).clone(),
            generation,
            started_at: Instant::now(),
            state: BackendState::Running,
        })
    }
}

/// Relay a child output stream into the log, line by line
fn forward_output<R>(stream: R, pid: u32, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: BACKEND_LOG_TARGET, pid, stream = name, "{}", line);
        }
    });
}

/// Locate `command` either as a path or on `PATH`.
///
/// The result is absolute, so it stays valid when the child runs in another
/// working directory.
pub fn resolve_executable(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    let found = if candidate.components().count() > 1 {
        is_executable(candidate).then(|| candidate.to_path_buf())
    } else {
        let paths = std::env::var_os("PATH")?;
        std::env::split_paths(&paths)
            .map(|dir| dir.join(command))
            .find(|path| is_executable(path))
    }?;

    if found.is_absolute() {
        Some(found)
    } else {
        std::env::current_dir().ok().map(|cwd| cwd.join(found))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
