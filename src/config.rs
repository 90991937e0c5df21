use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder replaced by the backend host in argument templates
pub const HOST_PLACEHOLDER: &str = "{host}";
/// Placeholder replaced by the backend port in argument templates
pub const PORT_PLACEHOLDER: &str = "{port}";
/// Placeholder replaced by the document root in argument templates
pub const ROOT_PLACEHOLDER: &str = "{root}";

/// Global configuration for devgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public-facing proxy settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervised backend process settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Liveness probe settings
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public proxy port (default: 80)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum time for one backend exchange in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Time to wait for in-flight requests during shutdown in seconds (default: 5)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl ServerConfig {
    /// Socket address the proxy listens on
    pub fn bind_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let ip: IpAddr = self.bind.parse()?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

/// Backend process configuration
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Executable to launch (default: php)
    #[serde(default = "default_command")]
    pub command: String,

    /// Argument template; `{host}`, `{port}` and `{root}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Loopback host the backend listens on (default: 127.0.0.1)
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port the backend listens on (default: 8000)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Document root served by the backend, also its working directory.
    /// Defaults to the current directory.
    pub document_root: Option<PathBuf>,

    /// Extra environment variables for the backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Fixed wait after spawning before the backend is assumed ready (default: 2000ms)
    #[serde(default = "default_warmup")]
    pub warmup_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl BackendConfig {
    /// Create a backend config for `command` listening on `port`, with defaults elsewhere
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            port,
            ..Self::default()
        }
    }

    /// Set the argument template (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the document root (builder pattern)
    pub fn with_document_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.document_root = Some(root.into());
        self
    }

    /// Set the warm-up delay (builder pattern)
    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup_ms = warmup.as_millis() as u64;
        self
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Where the proxy and health monitor reach this backend
    pub fn target(&self) -> ProxyTarget {
        ProxyTarget::new(&self.host, self.port)
    }

    /// Absolute document root (current directory when unset).
    ///
    /// Relative roots are anchored at devgate's working directory, since the
    /// backend itself runs inside the root.
    pub fn document_root(&self) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        match &self.document_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => cwd.join(root),
            None => cwd,
        }
    }

    /// Expand the argument template for a concrete target and root
    pub fn render_args(&self, target: &ProxyTarget, root: &Path) -> Vec<String> {
        let port = target.port.to_string();
        let root = root.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(HOST_PLACEHOLDER, &target.host)
                    .replace(PORT_PLACEHOLDER, &port)
                    .replace(ROOT_PLACEHOLDER, &root)
            })
            .collect()
    }

    /// Validate the backend configuration, reporting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.command.trim().is_empty() {
            errors.push("backend: 'command' must not be empty".to_string());
        }

        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }

        if self.host.trim().is_empty() {
            errors.push("backend: 'host' must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            host: default_backend_host(),
            port: default_backend_port(),
            document_root: None,
            env: HashMap::new(),
            warmup_ms: default_warmup(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Liveness probe configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Interval between probes in milliseconds (default: 5000)
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// Timeout for a single probe in milliseconds (default: 1000)
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,

    /// Path requested by the probe (default: /)
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            timeout_ms: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

/// Immutable address of the backend, shared by the proxy and the health monitor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    pub host: String,
    pub port: u16,
}

impl ProxyTarget {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Default value functions
fn default_proxy_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_command() -> String {
    "php".to_string()
}

fn default_args() -> Vec<String> {
    vec![
        "-S".to_string(),
        format!("{}:{}", HOST_PLACEHOLDER, PORT_PLACEHOLDER),
        "-t".to_string(),
        ROOT_PLACEHOLDER.to_string(),
    ]
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8000
}

fn default_warmup() -> u64 {
    2000 // 2 seconds for the backend to start listening
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

fn default_health_interval() -> u64 {
    5000 // 5 seconds between probes
}

fn default_health_timeout() -> u64 {
    1000
}

fn default_health_path() -> String {
    "/".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(backend_errors) = self.backend.validate() {
            errors.extend(backend_errors);
        }

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }

        if let Err(e) = self.server.bind_addr() {
            errors.push(format!("server: invalid bind address '{}': {}", self.server.bind, e));
        }

        if self.server.port == self.backend.port {
            errors.push(format!(
                "server: proxy port {} collides with the backend port",
                self.server.port
            ));
        }

        if self.health.interval_ms == 0 {
            errors.push("health: 'interval_ms' must be greater than 0".to_string());
        }

        if !self.health.path.starts_with('/') {
            errors.push(format!(
                "health: 'path' must start with '/' (got '{}')",
                self.health.path
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
