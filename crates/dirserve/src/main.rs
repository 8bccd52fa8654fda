use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dirserve::Settings;

#[derive(Parser, Debug)]
#[command(name = "dirserve")]
#[command(about = "Serve local directories over HTTP with listings, archives and uploads")]
#[command(version)]
struct Cli {
    /// Address to listen on (default ":8080")
    #[arg(short, long, env = "ADDR")]
    addr: Option<String>,

    /// Port to listen on, overrides the port in --addr
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Accept file uploads into served directories
    #[arg(short, long, env = "UPLOADS")]
    uploads: bool,

    /// Disable all log output
    #[arg(short, long, env = "QUIET")]
    quiet: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Route to serve, ROUTE=PATH or PATH (repeatable)
    #[arg(short = 'r', long = "route")]
    route: Vec<String>,

    /// TLS certificate (PEM)
    #[arg(long, env = "SSL_CERTIFICATE")]
    ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "SSL_KEY")]
    ssl_key: Option<PathBuf>,

    /// Config file path (optional)
    #[arg(short, long, env = "DIRSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Routes to serve, ROUTE=PATH or PATH
    routes: Vec<String>,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            addr: self.addr.clone(),
            port: self.port,
            uploads: self.uploads.then_some(true),
            quiet: self.quiet.then_some(true),
            routes: self.route.iter().chain(&self.routes).cloned().collect(),
            root_route: None,
            ssl_cert: self.ssl_cert.clone(),
            ssl_key: self.ssl_key.clone(),
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        "dirserve=debug,tower_http=debug"
    } else {
        "dirserve=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => Settings::default(),
    };
    let settings = file_settings.overlay(cli.settings());

    if !settings.is_quiet() {
        init_logging(cli.verbose);
    }
    info!("dirserve {}", env!("CARGO_PKG_VERSION"));

    let config = settings
        .into_server_config()
        .context("invalid configuration")?;

    let app = dirserve::router(&config).layer(TraceLayer::new_for_http());
    let service = app.into_make_service_with_connect_info::<SocketAddr>();

    match &config.tls {
        Some(tls) => {
            let rustls = RustlsConfig::from_pem_file(&tls.certificate, &tls.key)
                .await
                .with_context(|| {
                    format!(
                        "loading TLS certificate {} and key {}",
                        tls.certificate.display(),
                        tls.key.display()
                    )
                })?;

            let handle = Handle::new();
            let shutdown = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!("dirserve (HTTPS) listening on {}", config.addr);
            axum_server::bind_rustls(config.addr, rustls)
                .handle(handle)
                .serve(service)
                .await?;
        }
        None => {
            let listener = TcpListener::bind(config.addr)
                .await
                .with_context(|| format!("binding {}", config.addr))?;
            info!("dirserve (HTTP) listening on {}", listener.local_addr()?);
            axum::serve(listener, service)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    Ok(())
}
