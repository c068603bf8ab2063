use clap::Parser;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

use litgate_internal::config_parser::Config;
use litgate_internal::endpoints;
use litgate_internal::gateway_util::AppStateData;
use litgate_internal::observability::{self, LogFormat};
use litgate_internal::redis_client::RedisClient;
use litgate_internal::LITGATE_VERSION;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `litgate.toml` config file at the specified path. Incompatible
    /// with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use default settings. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

// Logging isn't up yet when startup fails this early, so stderr is the only
// place left to report.
#[expect(clippy::print_stderr)]
fn report_startup_failure(message: &str) {
    eprintln!("{message}");
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logs immediately, so that we can use `tracing`.
    if let Err(e) = observability::setup_observability(args.log_format) {
        report_startup_failure(&format!("Failed to set up logs: {e}"));
        std::process::exit(1);
    }

    tracing::info!("Starting LitLabs Gateway {LITGATE_VERSION}");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = match &args.config_file {
        Some(path) => match Config::load_from_path(path) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                tracing::error!("Failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => {
            if !args.default_config {
                tracing::warn!(
                    "No config file provided, so default limits will be used. Use `--config-file path/to/litgate.toml` to specify a config file."
                );
            }
            Arc::new(Config::default())
        }
    };

    let state = match AppStateData::new(Arc::clone(&config)) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Failed to initialize gateway state: {e}");
            std::process::exit(1);
        }
    };

    state.start_background_tasks().await;

    // The registry store shares the usage store's Redis; without it the
    // gateway runs on config-seeded keys and built-in limits.
    if let Some(url) = &config.usage_limits.redis_url {
        let registry = RedisClient::new(
            url.as_str(),
            state.auth.clone(),
            Arc::clone(&state.usage_meter),
        )
        .await;

        match registry {
            Ok(client) => {
                if let Err(e) = client.start().await {
                    tracing::warn!("Live registry refresh unavailable: {e}");
                }
            }
            Err(e) => tracing::warn!("Live registry refresh unavailable: {e}"),
        }
    }

    let router = endpoints::build_router(state.clone()).layer(TraceLayer::new_for_http());

    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {bind_address}: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!("Listening on {bind_address}");

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {e}");
        std::process::exit(1);
    }

    state.shutdown().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
