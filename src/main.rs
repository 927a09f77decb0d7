use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use jabsocket::config::{Config, DEFAULT_CONFIG_PATH};
use jabsocket::xmpp_proxy::XmppProxy;

/// How long open connections get to close after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "jabsocket",
    author,
    version,
    about = "WebSocket to XMPP gateway: bridges browser WebSocket clients to XMPP servers over TCP"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "JABSOCKET_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Listen address, overriding the config file.
    #[arg(long, env = "JABSOCKET_LISTEN")]
    listen: Option<String>,

    /// Listen port, overriding the config file.
    #[arg(short, long, env = "JABSOCKET_PORT")]
    port: Option<u16>,

    /// Verbose logging to stderr; `--verbose=xmpp` also logs stanza contents.
    #[arg(short, long, num_args = 0..=1, default_missing_value = "default", require_equals = true)]
    verbose: Option<String>,

    /// Directory for the daily-rotating log file.
    #[arg(long, env = "JABSOCKET_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

/// Platform log directory, e.g. `~/.local/share/jabsocket/logs` on Linux.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jabsocket")
        .join("logs")
}

/// Install the tracing subscriber:
/// - Always write to a daily-rotating log file
/// - Also write to stderr, at the same filter unless `--verbose` raises it
fn init_tracing(cli: &Cli, config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_log_dir);
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let level = config.log_filter();
    let directives = match cli.verbose.as_deref() {
        Some("xmpp") => "jabsocket=debug,info".to_string(),
        Some(_) => "jabsocket=debug,jabsocket::stanza=info,info".to_string(),
        None => format!("jabsocket::stanza=info,{level}"),
    };
    let filter = || {
        if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new(&directives)
        }
    };

    // File layer: daily-rotating log file, non-blocking writes
    let file_appender = tracing_appender::rolling::daily(&log_dir, "jabsocket.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(filter());

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The background writer must outlive main.
    std::mem::forget(_guard);

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized");
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if let Some(listen) = &cli.listen {
        config.listen = listen.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

/// Resolve on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.check_config {
        println!("{}: configuration OK", cli.config.display());
        return Ok(());
    }

    init_tracing(&cli, &config);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        origins = config.origins.len(),
        upstream = config.upstream.as_deref().unwrap_or("<stream to>"),
        "Starting jabsocket"
    );

    let mut proxy = XmppProxy::new(Arc::new(config));
    let addr = proxy.start().await.context("failed to start gateway")?;
    tracing::info!(addr = %addr, "Accepting WebSocket connections");

    shutdown_signal()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");
    proxy.stop();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while proxy.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            active = proxy.active_connections(),
            "Connections still open after shutdown grace period"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["jabsocket"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.verbose, None);
        assert!(!cli.check_config);
    }

    #[test]
    fn test_cli_verbose_levels() {
        let cli = Cli::try_parse_from(["jabsocket", "-v"]).unwrap();
        assert_eq!(cli.verbose.as_deref(), Some("default"));

        let cli = Cli::try_parse_from(["jabsocket", "--verbose=xmpp", "-p", "8080"]).unwrap();
        assert_eq!(cli.verbose.as_deref(), Some("xmpp"));
        assert_eq!(cli.port, Some(8080));
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "listen = \"0.0.0.0\"\nport = 5280\n").unwrap();
        let path = file.path().to_str().unwrap();

        let cli = Cli::try_parse_from(["jabsocket", "-c", path, "--listen", "127.0.0.1", "--port", "9000"])
            .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.listen, "127.0.0.1");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn test_missing_config_file_has_context() {
        let cli = Cli::try_parse_from(["jabsocket", "-c", "/nonexistent/jabsocket.toml"]).unwrap();
        let err = load_config(&cli).unwrap_err();
        assert!(err.to_string().contains("failed to load configuration"));
    }
}
