//! Startup and teardown orchestration.
//!
//! ```text
//! Init ──validate──▶ StartingBackend ──backend up, proxy bound──▶ Running
//!                                                                   │
//!                                        signal / proxy failure ────┘
//!                                                                   ▼
//!                     Stopped ◀──backend stopped── ShuttingDown
//! ```
//!
//! Teardown order: latch the supervisor, stop the health monitor and the
//! accept loop, drain in-flight requests, then terminate the backend.

use crate::config::Config;
use crate::error::Error;
use crate::healthcheck::{HealthMonitor, HealthState, SharedHealthState};
use crate::process::{resolve_executable, Supervisor};
use crate::proxy::{InFlight, ProxyServer};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a port probe may take before the port is assumed free
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    StartingBackend,
    Running,
    ShuttingDown,
    Stopped,
}

/// Wires supervisor, health monitor and proxy together
pub struct Coordinator {
    config: Config,
    supervisor: Arc<Supervisor>,
    state: RwLock<LifecycleState>,
    shutdown_tx: watch::Sender<bool>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
    health: Mutex<Option<SharedHealthState>>,
    in_flight: Mutex<Option<InFlight>>,
    teardown: OnceCell<()>,
}

impl Coordinator {
    pub fn new(config: Config) -> Arc<Self> {
        let supervisor = Supervisor::new(config.backend.clone());
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            supervisor,
            state: RwLock::new(LifecycleState::Init),
            shutdown_tx,
            monitor_task: Mutex::new(None),
            health: Mutex::new(None),
            in_flight: Mutex::new(None),
            teardown: OnceCell::new(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.write();
        debug!(from = ?*state, to = ?next, "Lifecycle transition");
        *state = next;
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Snapshot of the health monitor's state, once it has been started
    pub fn health(&self) -> Option<HealthState> {
        self.health.lock().as_ref().map(|state| state.read().clone())
    }

    /// Ask the running coordinator to shut down; safe to call from any task
    pub fn trigger_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Trigger shutdown once `signal` fires.
    ///
    /// If the signal listener cannot be installed the error is logged and the
    /// coordinator keeps running.
    pub async fn shutdown_on_signal<F>(&self, signal: F)
    where
        F: Future<Output = std::io::Result<&'static str>>,
    {
        match signal.await {
            Ok(name) => {
                info!(signal = name, "Received shutdown signal");
                self.trigger_shutdown();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
    }

    /// Validate, start the backend, bind the proxy and launch the health monitor.
    ///
    /// On failure the coordinator is torn down before the error is returned.
    pub async fn start(&self) -> Result<ProxyServer, Error> {
        if self.state() != LifecycleState::Init {
            return Err(Error::AlreadyStarted);
        }

        match self.try_start().await {
            Ok(proxy) => Ok(proxy),
            Err(e) => {
                error!(error = %e, "Startup failed");
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<ProxyServer, Error> {
        self.validate_environment().await?;

        self.set_state(LifecycleState::StartingBackend);
        let info = self.supervisor.start().await?;
        info!(pid = info.pid, backend = %info.target, "Backend is up");

        let bind_addr = self.config.server.bind_addr().map_err(|e| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        warn_if_privileged(bind_addr.port());

        let proxy = ProxyServer::bind(
            bind_addr,
            self.supervisor.target(),
            self.config.server.request_timeout(),
            self.shutdown_tx.subscribe(),
        )
        .await?;
        *self.in_flight.lock() = Some(proxy.in_flight());

        let monitor = HealthMonitor::new(
            Arc::clone(&self.supervisor),
            self.config.health.clone(),
            self.shutdown_tx.subscribe(),
        );
        *self.health.lock() = Some(monitor.state());
        *self.monitor_task.lock() = Some(tokio::spawn(monitor.run()));

        self.set_state(LifecycleState::Running);
        info!(addr = %proxy.local_addr(), "Serving");
        Ok(proxy)
    }

    /// Executable present, document root usable, both ports free
    async fn validate_environment(&self) -> Result<(), Error> {
        let backend = &self.config.backend;

        if resolve_executable(&backend.command).is_none() {
            return Err(Error::Launch {
                command: backend.command.clone(),
                reason: "executable not found".to_string(),
            });
        }

        let root = self.supervisor.document_root();
        if !root.is_dir() {
            return Err(Error::DocumentRoot(root.to_path_buf()));
        }

        if port_in_use(&backend.host, backend.port).await {
            return Err(Error::PortUnavailable { port: backend.port });
        }

        if let Ok(addr) = self.config.server.bind_addr() {
            let probe_ip = if addr.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                addr.ip()
            };
            if port_in_use(&probe_ip.to_string(), addr.port()).await {
                return Err(Error::PortUnavailable { port: addr.port() });
            }
        }

        Ok(())
    }

    /// Serve until shutdown is triggered, then tear everything down
    pub async fn serve(&self, proxy: ProxyServer) -> Result<(), Error> {
        let result = proxy.run().await;
        if let Err(ref e) = result {
            error!(error = %e, "Proxy server failed");
        }
        self.shutdown().await;
        result
    }

    /// Start and serve; returns once shutdown has completed
    pub async fn run(&self) -> Result<(), Error> {
        let proxy = self.start().await?;
        self.serve(proxy).await
    }

    /// Ordered, best-effort teardown.
    ///
    /// Only the first call does the work; concurrent callers wait for it to
    /// finish and later callers return immediately.
    pub async fn shutdown(&self) {
        self.teardown.get_or_init(|| self.teardown_inner()).await;
    }

    async fn teardown_inner(&self) {
        self.set_state(LifecycleState::ShuttingDown);
        info!("Shutting down...");

        // Latch first so the monitor cannot revive the backend mid-teardown
        self.supervisor.begin_shutdown();
        self.shutdown_tx.send_replace(true);

        let monitor = self.monitor_task.lock().take();
        if let Some(mut handle) = monitor {
            let limit = self.config.backend.warmup()
                + self.config.backend.shutdown_grace_period()
                + Duration::from_secs(1);
            match tokio::time::timeout(limit, &mut handle).await {
                Ok(Ok(())) => debug!("Health monitor stopped"),
                Ok(Err(e)) => warn!(error = %e, "Health monitor task failed"),
                Err(_) => {
                    warn!("Health monitor did not stop in time, aborting it");
                    handle.abort();
                }
            }
        }

        let in_flight = self.in_flight.lock().clone();
        if let Some(in_flight) = in_flight {
            in_flight.drain(self.config.server.drain_timeout()).await;
        }

        match self
            .supervisor
            .stop(self.config.backend.shutdown_grace_period())
            .await
        {
            Ok(()) => info!("Backend stopped"),
            Err(e) => error!(error = %e, "Failed to stop backend"),
        }

        self.set_state(LifecycleState::Stopped);
        info!("Shutdown complete");
    }
}

/// Whether something is already accepting connections on `host:port`
pub async fn port_in_use(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(unix)]
fn warn_if_privileged(port: u16) {
    if port < 1024 && unsafe { libc::geteuid() } != 0 {
        warn!(
            port,
            "Port is privileged (below 1024); binding may require elevated privileges"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_privileged(_port: u16) {}

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere)
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

/// Proxy address as seen from the local machine
pub fn local_url(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        addr.ip()
    };
    format!("http://{}/", SocketAddr::new(ip, addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn sleep_backend_config() -> Config {
        let mut config = Config::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = free_port().await;
        config.server.drain_timeout_secs = 1;
        config.backend = BackendConfig::new("sleep", free_port().await)
            .with_args(vec!["60".to_string()])
            .with_warmup(Duration::from_millis(20));
        config.backend.shutdown_grace_period_secs = 1;
        config.health.interval_ms = 60_000;
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown_transitions() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        assert_eq!(coordinator.state(), LifecycleState::Init);
        assert!(coordinator.health().is_none());

        let proxy = coordinator.start().await.unwrap();
        assert_eq!(coordinator.state(), LifecycleState::Running);
        assert!(coordinator.supervisor().current().await.is_some());
        assert!(proxy.local_addr().port() > 0);

        // Give the monitor task a moment to mark itself running
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(coordinator.health().unwrap().running);

        coordinator.shutdown().await;
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert!(coordinator.supervisor().current().await.is_none());
        assert!(!coordinator.health().unwrap().running);

        // Second teardown is a no-op
        coordinator.shutdown().await;
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        let _proxy = coordinator.start().await.unwrap();

        assert!(matches!(coordinator.start().await, Err(Error::AlreadyStarted)));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_shutdown_ends_serve() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        let proxy = coordinator.start().await.unwrap();

        let serving = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.serve(proxy).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.trigger_shutdown();

        let result = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert!(coordinator.supervisor().current().await.is_none());
    }

    #[tokio::test]
    async fn test_signal_listener_failure_keeps_running() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        let _proxy = coordinator.start().await.unwrap();

        coordinator
            .shutdown_on_signal(async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal support"))
            })
            .await;

        assert_eq!(coordinator.state(), LifecycleState::Running);
        assert!(!*coordinator.shutdown_tx.borrow());
        assert!(coordinator.supervisor().current().await.is_some());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_received_signal_ends_serve() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        let proxy = coordinator.start().await.unwrap();

        coordinator.shutdown_on_signal(async { Ok("SIGTERM") }).await;

        let result = tokio::time::timeout(Duration::from_secs(5), coordinator.serve(proxy))
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_calls() {
        let coordinator = Coordinator::new(sleep_backend_config().await);
        let _proxy = coordinator.start().await.unwrap();

        tokio::join!(coordinator.shutdown(), coordinator.shutdown());
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_executable_is_fatal() {
        let mut config = sleep_backend_config().await;
        config.backend.command = "devgate-no-such-backend-binary".to_string();
        let coordinator = Coordinator::new(config);

        let err = coordinator.run().await.unwrap_err();
        assert!(err.is_launch_failure());
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert_eq!(coordinator.supervisor().generation(), 0);
    }

    #[tokio::test]
    async fn test_missing_document_root_is_fatal() {
        let mut config = sleep_backend_config().await;
        config.backend.document_root = Some("/definitely/not/a/real/root".into());
        let coordinator = Coordinator::new(config);

        let err = coordinator.start().await.err().unwrap();
        assert!(matches!(err, Error::DocumentRoot(_)));
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_backend_port_in_use_is_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = sleep_backend_config().await;
        config.backend.port = occupied.local_addr().unwrap().port();
        let coordinator = Coordinator::new(config);

        let err = coordinator.start().await.err().unwrap();
        assert!(matches!(err, Error::PortUnavailable { .. }));
        assert_eq!(coordinator.supervisor().generation(), 0);
    }

    #[tokio::test]
    async fn test_proxy_port_in_use_is_fatal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = sleep_backend_config().await;
        config.server.port = occupied.local_addr().unwrap().port();
        let coordinator = Coordinator::new(config);

        let err = coordinator.start().await.err().unwrap();
        assert!(matches!(err, Error::PortUnavailable { port } if port == config_port(&occupied)));
        assert_eq!(coordinator.state(), LifecycleState::Stopped);
        assert!(coordinator.supervisor().current().await.is_none());
    }

    fn config_port(listener: &TcpListener) -> u16 {
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_local_url() {
        assert_eq!(local_url("0.0.0.0:80".parse().unwrap()), "http://127.0.0.1:80/");
        assert_eq!(local_url("127.0.0.1:8080".parse().unwrap()), "http://127.0.0.1:8080/");
    }
}
