//! VeilSearch binary — thin CLI shell over the [`veilsearch`] library crate.

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use veilsearch::api::*;
use veilsearch::engine::SearchEngine;
use veilsearch::types::EngineConfig;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Privacy-preserving search and indexing server for anonymized
/// content-addressed storage.
#[derive(Parser)]
#[command(name = "veilsearch", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the configuration file (default: ./veilsearch.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind to 0.0.0.0 instead of 127.0.0.1 (localhost)
    #[arg(long)]
    bind_all: bool,

    /// Minimum privacy level accepted for queries (overrides config)
    #[arg(long)]
    privacy_floor: Option<u8>,

    /// Disable the differential-privacy budget gate (overrides config)
    #[arg(long)]
    no_dp: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented default veilsearch.toml
    Init {
        /// Target path (default: ./veilsearch.toml)
        path: Option<PathBuf>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

const DEFAULT_CONFIG: &str = r#"# veilsearch configuration. Every key is optional.

[bloom]
# expected_items = 100000
# false_positive_rate = 0.01
# privacy_level = 3

[lsh]
# feature_count = 128
# bands = 20
# rows = 5
# similarity_threshold = 0.8

[manifest]
# cache_max_entries = 10000
# cache_ttl_secs = 3600
# hierarchy_enabled = true
# path_key = "<64 hex chars to pin the path key across restarts>"

[pipeline]
# default_privacy_level = 3
# dummy_query_count = 3
# query_timeout_secs = 30
# parallel_search = true

[sessions]
# max_active_sessions = 10000
# max_sessions_per_user = 8
# dp_enabled = true

[rate]
# per_minute = 60
# per_hour = 1000
# per_day = 10000
# burst = 10

[server]
# maintenance_interval_secs = 60
# background_tick_secs = 300
"#;

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("veilsearch=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        match command {
            Commands::Init { path } => {
                let target =
                    path.clone().unwrap_or_else(|| PathBuf::from("veilsearch.toml"));
                if target.exists() {
                    eprintln!("Error: {} already exists", target.display());
                    std::process::exit(1);
                }
                if let Err(e) = std::fs::write(&target, DEFAULT_CONFIG) {
                    eprintln!("Error: could not write {}: {e}", target.display());
                    std::process::exit(1);
                }
                println!("Wrote {}", target.display());
                return;
            }
            Commands::Completions { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut Cli::command(),
                    "veilsearch",
                    &mut std::io::stdout(),
                );
                return;
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------------

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from("veilsearch.toml"));
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        error!(error = e.as_str(), "Configuration error");
        std::process::exit(1);
    });
    if let Some(floor) = cli.privacy_floor {
        config.pipeline.require_privacy_level = floor.clamp(1, 5);
    }
    if cli.no_dp {
        config.sessions.dp_enabled = false;
    }
    let background_tick = config.server.background_tick_secs.max(1);

    // ---------------------------------------------------------------------------
    // Engine
    // ---------------------------------------------------------------------------

    let engine = Arc::new(SearchEngine::new(config).unwrap_or_else(|e| {
        error!(error = %e, "Could not construct the search engine");
        std::process::exit(1);
    }));
    info!("Search engine initialized");

    let ctx = AppContext { engine: Arc::clone(&engine), start_time: Instant::now() };

    let app = Router::new()
        .route("/health", get(api_health))
        .route("/api/search", get(api_search).post(api_search_post))
        .route("/api/index", post(api_index))
        .route("/api/stats", get(api_stats))
        .route("/api/maintenance", post(api_maintenance))
        .route("/api/sessions", delete(api_sessions_clear))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    // Bind address: 127.0.0.1 by default, --bind-all for 0.0.0.0
    let bind_addr = if cli.bind_all { "0.0.0.0" } else { "127.0.0.1" };

    let explicit_port: Option<u16> = std::env::var("PORT").ok().and_then(|p| p.parse().ok());

    let listener = if let Some(port) = explicit_port {
        tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await.unwrap_or_else(|e| {
            error!(port = port, error = %e, "Could not bind to port");
            eprintln!("  PORT={port} was set explicitly. Choose a different port.");
            std::process::exit(1);
        })
    } else {
        // Auto-scan: try 8732..=8741
        const BASE: u16 = 8732;
        const RANGE: u16 = 10;
        let mut found = None;
        for port in BASE..BASE + RANGE {
            match tokio::net::TcpListener::bind(format!("{bind_addr}:{port}")).await {
                Ok(l) => {
                    found = Some(l);
                    break;
                }
                Err(_) => continue,
            }
        }
        found.unwrap_or_else(|| {
            error!(range_start = BASE, range_end = BASE + RANGE - 1, "No free port found");
            eprintln!("  Try: PORT=<port> veilsearch");
            std::process::exit(1);
        })
    };

    let port = listener.local_addr().unwrap().port();

    // Background upkeep: session pruning plus index maintenance.
    let engine_bg = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(background_tick));
        loop {
            interval.tick().await;
            let report = engine_bg.perform_maintenance();
            if report.pruned_sessions > 0 || report.pruned_cache_entries > 0 {
                debug!(
                    sessions = report.pruned_sessions,
                    cache = report.pruned_cache_entries,
                    "background maintenance pruned state"
                );
            }
        }
    });

    info!(port = port, "http://localhost:{port}");
    // Machine-readable line for scripts (not through tracing)
    eprintln!("VEILSEARCH_PORT={port}");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.unwrap();
}
