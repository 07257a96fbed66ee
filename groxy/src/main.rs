mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use groxy_core::discovery::{Discovery, Provider};
use groxy_core::middleware::Config as MiddlewareConfig;
use groxy_core::Server;

use config::file::FileProvider;

/// groxy: a transparent gRPC proxy that mocks, errors, or forwards calls
/// based on a hot-reloadable rule file.
#[derive(Parser, Debug)]
#[command(name = "groxy", version, about = "Transparent gRPC proxy")]
struct Cli {
    /// Address to listen on.
    #[arg(long = "addr", env = "GROXY_ADDR", default_value = ":8080")]
    addr: String,

    /// Path to the rule file.
    #[arg(long = "file.name", env = "GROXY_FILE_NAME", default_value = "groxy.yml")]
    file_name: String,

    /// How often to check the rule file for changes.
    #[arg(long = "file.check-interval", env = "GROXY_FILE_CHECK_INTERVAL", default_value = "3s")]
    file_check_interval: String,

    /// Minimum time between accepting two successive file changes.
    #[arg(long = "file.delay", env = "GROXY_FILE_DELAY", default_value = "500ms")]
    file_delay: String,

    /// Enable verbose, human-readable logging instead of JSON.
    #[arg(long, env = "GROXY_DEBUG")]
    debug: bool,

    /// `app` response header value.
    #[arg(long = "app-name", env = "GROXY_APP_NAME", default_value = "groxy")]
    app_name: String,

    /// `author` response header value.
    #[arg(long = "app-author", env = "GROXY_APP_AUTHOR", default_value = "groxy")]
    app_author: String,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            err.print().ok();
            std::process::exit(1);
        }
    };

    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        error!(error = %err, "groxy exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" }));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if debug {
        builder.pretty().init();
    } else {
        builder.json().init();
    }
}

async fn run(cli: Cli) -> Result<(), groxy_core::error::Error> {
    let addr = parse_addr(&cli.addr)?;
    let check_interval = parse_duration(&cli.file_check_interval, "file.check-interval")?;
    let delay = parse_duration(&cli.file_delay, "file.delay")?;

    let provider: Arc<dyn Provider> = Arc::new(FileProvider::new(&cli.file_name, check_interval, delay));
    let discovery = Arc::new(Discovery::new(vec![provider]).await?);

    let middleware = MiddlewareConfig {
        app: cli.app_name,
        author: cli.app_author,
        version: env!("CARGO_PKG_VERSION").to_string(),
        recoverer_message: "internal error, recovered from panic".to_string(),
        debug: cli.debug,
    };

    let server = Server::new(discovery.clone(), middleware).await;
    let shutdown = CancellationToken::new();

    let discovery_task = {
        let discovery = discovery.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { discovery.run(shutdown).await })
    };

    let signals = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        signals.cancel();
    });

    info!(%addr, file = %cli.file_name, "starting groxy");
    let result = server.serve(addr, shutdown.clone()).await;

    shutdown.cancel();
    let _ = discovery_task.await;
    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Accepts `:PORT`, `HOST:PORT`, or a bare port, matching the Go original's
/// `net.Listen`-style address convention where an empty host means "all
/// interfaces".
fn parse_addr(raw: &str) -> Result<SocketAddr, groxy_core::error::Error> {
    let candidate = if let Some(port) = raw.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .map_err(|e| groxy_core::error::Error::Config(format!("invalid --addr {raw:?}: {e}")))
}

fn parse_duration(raw: &str, flag: &str) -> Result<Duration, groxy_core::error::Error> {
    humantime::parse_duration(raw).map_err(|e| groxy_core::error::Error::Config(format!("invalid --{flag} {raw:?}: {e}")))
}
