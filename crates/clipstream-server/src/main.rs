use std::env;

use clipstream_server::Clipstream;
use clipstream_server::config::AppConfig;
use clipstream_server::config::loader::load_config;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How the configuration path was determined.
#[derive(Debug, Clone, Copy)]
enum ConfigSource {
    /// From --config CLI argument
    CliArgument,
    /// From CLIPSTREAM_CONFIG environment variable
    EnvironmentVariable,
    /// Default path (clipstream.toml)
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CliArgument => write!(f, "CLI argument (--config)"),
            Self::EnvironmentVariable => write!(f, "environment variable (CLIPSTREAM_CONFIG)"),
            Self::Default => write!(f, "default"),
        }
    }
}

#[tokio::main]
async fn main() {
    // .env is optional
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    clipstream_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        source = %source,
        "Configuration loaded"
    );

    clipstream_server::observability::apply_logging_level(&cfg.logging.level);

    if let Err(err) = run(cfg).await {
        tracing::error!(error = %err, "clipstream exited with error");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: AppConfig) -> anyhow::Result<()> {
    clipstream_server::metrics::init_metrics(cfg.metrics.listen_addr);

    let app = Clipstream::from_config(cfg).await?;
    tracing::info!(
        cache = app.cache().mode(),
        store = app.store().backend_name(),
        "Consistency layer initialized"
    );

    let tasks = app.start().await?;
    tracing::info!("clipstream running, press Ctrl+C to stop");

    shutdown_signal().await;
    tasks.shutdown().await;
    tracing::info!("clipstream stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

/// Resolve the configuration file path.
///
/// Priority order:
/// 1. CLI argument: --config <path>
/// 2. Environment variable: CLIPSTREAM_CONFIG
/// 3. Default: clipstream.toml
fn resolve_config_path() -> (String, ConfigSource) {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return (path, ConfigSource::CliArgument);
            }
        }
    }

    if let Ok(path) = env::var("CLIPSTREAM_CONFIG") {
        if !path.is_empty() {
            return (path, ConfigSource::EnvironmentVariable);
        }
    }

    ("clipstream.toml".to_string(), ConfigSource::Default)
}
