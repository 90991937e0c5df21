use clap::Parser;
use devgate::config::Config;
use devgate::lifecycle::{local_url, wait_for_signal, Coordinator};
use devgate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Run a local backend server behind a supervising HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "devgate", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port the backend listens on
    #[arg(long)]
    backend_port: Option<u16>,

    /// Port the proxy listens on
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Backend executable
    #[arg(long)]
    backend_bin: Option<String>,

    /// Directory the backend serves
    #[arg(short = 't', long)]
    document_root: Option<PathBuf>,

    /// Address the proxy binds to
    #[arg(long)]
    bind: Option<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let config = Config::load(path).map_err(|e| {
                    error!(path = %path.display(), error = %e, "Failed to load configuration");
                    e
                })?;
                info!(path = %path.display(), "Configuration loaded");
                config
            }
            None => Config::default(),
        };

        if let Some(port) = self.backend_port {
            config.backend.port = port;
        }
        if let Some(port) = self.proxy_port {
            config.server.port = port;
        }
        if let Some(command) = self.backend_bin {
            config.backend.command = command;
        }
        if let Some(root) = self.document_root {
            config.backend.document_root = Some(root);
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=info".parse().expect("valid log directive")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    print_startup_banner(&config);

    let coordinator = Coordinator::new(config);

    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.shutdown_on_signal(wait_for_signal()).await });
    }

    let proxy = coordinator.start().await?;
    info!(url = %local_url(proxy.local_addr()), "Proxy ready");
    coordinator.serve(proxy).await?;

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting development proxy");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        drain_timeout_secs = config.server.drain_timeout_secs,
        "Proxy configuration"
    );
    info!(
        command = %config.backend.command,
        args = ?config.backend.args,
        backend = %config.backend.target(),
        document_root = %config.backend.document_root().display(),
        "Backend configuration"
    );
    info!(
        health_path = %config.health.path,
        interval_ms = config.health.interval_ms,
        timeout_ms = config.health.timeout_ms,
        "Health check settings"
    );
}
