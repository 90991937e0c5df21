//! Liveness monitoring for the supervised backend
//!
//! Periodically probes the backend and asks the supervisor to restart it when
//! it stops answering.

use crate::config::{HealthConfig, ProxyTarget};
use crate::error::Error;
use crate::process::Supervisor;
use parking_lot::RwLock;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of a single liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend answered with an HTTP status line
    Alive(u16),
    /// Connection refused, reset, or timed out
    Unreachable(String),
    /// Anything else; transient, never triggers a restart
    Error(String),
}

/// Health bookkeeping, written only by the monitor
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    /// When the last probe finished
    pub last_check: Option<Instant>,
    /// Unreachable probes since the last successful one
    pub consecutive_failures: u32,
    /// Whether the monitor loop is active
    pub running: bool,
    /// Restarts triggered by this monitor
    pub restarts: u64,
}

pub type SharedHealthState = Arc<RwLock<HealthState>>;

/// Background task that keeps the backend alive
pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    target: Arc<ProxyTarget>,
    config: HealthConfig,
    state: SharedHealthState,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config: HealthConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let target = supervisor.target();
        Self {
            supervisor,
            target,
            config,
            state: Arc::new(RwLock::new(HealthState::default())),
            shutdown_rx,
        }
    }

    /// Shared handle for reading health state from other tasks
    pub fn state(&self) -> SharedHealthState {
        Arc::clone(&self.state)
    }

    /// Run until the shutdown channel fires
    pub async fn run(mut self) {
        self.state.write().running = true;
        info!(
            backend = %self.target,
            interval_ms = self.config.interval_ms,
            path = %self.config.path,
            "Health monitor started"
        );

        loop {
            if self.shutdown_requested() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if self.shutdown_requested() {
                break;
            }

            let outcome = tokio::select! {
                outcome = probe(&self.target, &self.config.path, self.config.timeout()) => outcome,
                result = self.shutdown_rx.changed() => {
                    if result.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            };

            self.handle_outcome(outcome).await;
        }

        self.state.write().running = false;
        info!("Health monitor stopped");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.supervisor.is_shutting_down()
    }

    async fn handle_outcome(&self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Alive(status) => {
                let mut state = self.state.write();
                if state.consecutive_failures > 0 {
                    info!(backend = %self.target, status, "Backend is answering again");
                }
                state.consecutive_failures = 0;
                state.last_check = Some(Instant::now());
                debug!(backend = %self.target, status, "Health probe succeeded");
            }
            ProbeOutcome::Unreachable(reason) => {
                {
                    let mut state = self.state.write();
                    state.consecutive_failures += 1;
                    state.last_check = Some(Instant::now());
                }

                // Never revive the backend once teardown has started
                if self.shutdown_requested() {
                    debug!(reason = %reason, "Backend unreachable during shutdown, not restarting");
                    return;
                }

                warn!(backend = %self.target, reason = %reason, "Backend seems to be down, restarting");
                match self.supervisor.restart().await {
                    Ok(info) => {
                        self.state.write().restarts += 1;
                        info!(pid = info.pid, generation = info.generation, "Backend restarted");
                    }
                    Err(Error::ShuttingDown) => {
                        debug!("Restart skipped, supervisor is shutting down");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to restart backend");
                    }
                }
            }
            ProbeOutcome::Error(reason) => {
                self.state.write().last_check = Some(Instant::now());
                warn!(backend = %self.target, reason = %reason, "Health probe error");
            }
        }
    }
}

/// Issue one `GET path` against the target and classify the result
pub async fn probe(target: &ProxyTarget, path: &str, timeout: Duration) -> ProbeOutcome {
    let authority = target.authority();

    let connect_result = tokio::time::timeout(timeout, TcpStream::connect(&authority)).await;
    let mut stream = match connect_result {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => return classify_io_error(e),
        Err(_) => return ProbeOutcome::Unreachable("connect timed out".to_string()),
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, authority
    );

    if let Err(e) = stream.write_all(request.as_bytes()).await {
        return classify_io_error(e);
    }

    let read_result = tokio::time::timeout(timeout, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        Ok(Ok(status_line)) if status_line.is_empty() => {
            ProbeOutcome::Unreachable("connection closed before response".to_string())
        }
        Ok(Ok(status_line)) => match parse_status_code(&status_line) {
            Some(code) => ProbeOutcome::Alive(code),
            None => ProbeOutcome::Error(format!(
                "unexpected status line: {:?}",
                status_line.trim_end()
            )),
        },
        Ok(Err(e)) => classify_io_error(e),
        Err(_) => ProbeOutcome::Unreachable("response timed out".to_string()),
    }
}

/// Extract the code from `HTTP/1.1 200 OK`
fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..600).contains(code))
}

fn classify_io_error(e: std::io::Error) -> ProbeOutcome {
    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut
        | ErrorKind::UnexpectedEof
        | ErrorKind::AddrNotAvailable => ProbeOutcome::Unreachable(e.to_string()),
        _ => ProbeOutcome::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accept connections forever, answering each with `reply`
    async fn canned_server(reply: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(reply.as_bytes()).await;
                });
            }
        });
        port
    }

    fn fast_health_config() -> HealthConfig {
        HealthConfig {
            interval_ms: 50,
            timeout_ms: 200,
            path: "/".to_string(),
        }
    }

    fn sleep_supervisor(port: u16) -> Arc<Supervisor> {
        let mut config = BackendConfig::new("sleep", port)
            .with_args(vec!["60".to_string()])
            .with_warmup(Duration::from_millis(20));
        config.shutdown_grace_period_secs = 1;
        Supervisor::new(config)
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 OK\r\n"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.0 404 Not Found\r\n"), Some(404));
        assert_eq!(parse_status_code("HTTP/1.1 999 Weird\r\n"), None);
        assert_eq!(parse_status_code("hello world\r\n"), None);
        assert_eq!(parse_status_code(""), None);
    }

    #[tokio::test]
    async fn test_probe_alive() {
        let port = canned_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let outcome = probe(&ProxyTarget::new("127.0.0.1", port), "/", Duration::from_secs(1)).await;
        assert_eq!(outcome, ProbeOutcome::Alive(200));
    }

    #[tokio::test]
    async fn test_probe_non_2xx_still_alive() {
        let port = canned_server("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let outcome = probe(&ProxyTarget::new("127.0.0.1", port), "/", Duration::from_secs(1)).await;
        assert_eq!(outcome, ProbeOutcome::Alive(404));
    }

    #[tokio::test]
    async fn test_probe_connection_refused() {
        let port = free_port().await;
        let outcome = probe(&ProxyTarget::new("127.0.0.1", port), "/", Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable(_)), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_probe_garbage_is_error() {
        let port = canned_server("hello there\r\n").await;
        let outcome = probe(&ProxyTarget::new("127.0.0.1", port), "/", Duration::from_secs(1)).await;
        assert!(matches!(outcome, ProbeOutcome::Error(_)), "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_probe_silent_backend_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let outcome = probe(
            &ProxyTarget::new("127.0.0.1", port),
            "/",
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(
            outcome,
            ProbeOutcome::Unreachable("response timed out".to_string())
        );
    }

    #[tokio::test]
    async fn test_monitor_restarts_unreachable_backend() {
        // `sleep` never listens, so every probe is refused
        let supervisor = sleep_supervisor(free_port().await);
        let first = supervisor.start().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), fast_health_config(), shutdown_rx);
        let state = monitor.state();
        let handle = tokio::spawn(monitor.run());

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.generation() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(supervisor.generation() >= 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let snapshot = state.read().clone();
        assert!(!snapshot.running);
        assert!(snapshot.restarts >= 1);
        assert!(snapshot.consecutive_failures >= 1);
        assert!(snapshot.last_check.is_some());

        let current = supervisor.current().await.unwrap();
        assert_ne!(current.pid, first.pid);

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_leaves_healthy_backend_alone() {
        let port = canned_server("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let supervisor = sleep_supervisor(port);
        supervisor.start().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), fast_health_config(), shutdown_rx);
        let state = monitor.state();
        let handle = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(state.read().running);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let snapshot = state.read().clone();
        assert_eq!(snapshot.restarts, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_check.is_some());
        assert_eq!(supervisor.generation(), 1);

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_never_restarts_after_shutdown() {
        let supervisor = sleep_supervisor(free_port().await);
        supervisor.start().await.unwrap();
        supervisor.begin_shutdown();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = HealthMonitor::new(Arc::clone(&supervisor), fast_health_config(), shutdown_rx);
        let state = monitor.state();

        tokio::time::timeout(Duration::from_secs(1), monitor.run())
            .await
            .unwrap();

        assert_eq!(state.read().restarts, 0);
        assert_eq!(supervisor.generation(), 1);

        supervisor.stop(Duration::from_secs(1)).await.unwrap();
    }
}
