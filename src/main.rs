//! Order book feed entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orderbook_feed::api::{create_router, AppState};
use orderbook_feed::config::Config;
use orderbook_feed::feed::{
    FeedSession, HttpAuthenticator, RestSnapshotSource, SessionConfig, SnapshotSource, WsConnector,
};
use orderbook_feed::metrics;
use orderbook_feed::orderbook::{OrderBookAggregator, SnapshotView};
use orderbook_feed::service::{BookQuery, MarketDataService};
use orderbook_feed::utils::{render_book, shutdown_signal};

/// Live level-2 order book aggregation.
#[derive(Parser, Debug)]
#[command(name = "orderbook-feed")]
#[command(about = "Aggregate a live level-2 order book feed and serve it over HTTP")]
#[command(version)]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track a symbol and serve its book over HTTP (default).
    Run {
        /// Symbol to track (overrides FEED_SYMBOL).
        #[arg(short, long)]
        symbol: Option<String>,

        /// HTTP server port (overrides PORT).
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the aggregated book to the terminal on an interval.
    Watch {
        /// Symbol to watch (overrides FEED_SYMBOL).
        #[arg(short, long)]
        symbol: Option<String>,

        /// Refresh interval in milliseconds.
        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,

        /// Levels shown per side.
        #[arg(short, long, default_value = "10")]
        levels: usize,
    },

    /// Check configuration validity.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::new("orderbook_feed=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match args.command {
        Some(Command::CheckConfig) => cmd_check_config(),
        Some(Command::Run { symbol, port }) => cmd_run(symbol, port).await,
        Some(Command::Watch {
            symbol,
            interval_ms,
            levels,
        }) => cmd_watch(symbol, interval_ms, levels).await,
        None => cmd_run(None, None).await,
    }
}

/// Load and validate configuration, applying CLI overrides.
fn load_config(symbol: Option<String>, port: Option<u16>) -> anyhow::Result<Config> {
    let mut config = Config::load()?;
    if let Some(symbol) = symbol {
        config.feed_symbol = symbol;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

/// Check configuration validity.
fn cmd_check_config() -> anyhow::Result<()> {
    println!("======================================================================");
    println!("ORDERBOOK FEED - CONFIGURATION CHECK");
    println!("======================================================================");

    print!("Loading configuration... ");
    let config = match Config::load() {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration load failed"));
        }
    };

    print!("Validating configuration... ");
    match config.validate() {
        Ok(()) => println!("OK"),
        Err(e) => {
            println!("FAILED");
            println!("  Error: {}", e);
            return Err(anyhow::anyhow!("Configuration validation failed"));
        }
    }

    println!("----------------------------------------------------------------------");
    println!("Configuration Summary:");
    println!("  Symbol: {}", config.feed_symbol);
    println!("  Auth URL: {}", config.auth_base_url);
    println!(
        "  REST Snapshot: {}",
        if config.use_rest_snapshot {
            config.rest_base_url.as_str()
        } else {
            "Disabled"
        }
    );
    println!("  Price Precision: {} dp", config.price_precision);
    println!("  Aggregation: {}", config.aggregation_policy);
    println!("  Heartbeat Timeout: {}ms", config.heartbeat_timeout_ms);
    println!(
        "  Reconnect: {}ms initial, {}s max, {} retries",
        config.reconnect_initial_delay_ms, config.reconnect_max_delay_s, config.max_retries
    );
    println!("  HTTP Port: {}", config.port);
    println!("======================================================================");
    println!("CONFIGURATION CHECK PASSED");
    println!("======================================================================");

    Ok(())
}

/// Track the configured symbol and serve it over HTTP.
async fn cmd_run(symbol: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let config = load_config(symbol, port)?;

    let prometheus = PrometheusBuilder::new().install_recorder()?;
    metrics::init_metrics();

    info!(symbol = %config.feed_symbol, "Configuration loaded successfully");
    info!(
        "Precision: {} dp, aggregation: {}",
        config.price_precision, config.aggregation_policy
    );

    let policy = config.policy().map_err(|e| anyhow::anyhow!(e))?;
    let service = MarketDataService::new(
        SessionConfig::from_config(&config),
        config.price_precision,
        policy,
        HttpAuthenticator::new(&config)?,
        WsConnector::new(),
    );

    if config.use_rest_snapshot {
        let source = RestSnapshotSource::new(&config)?;
        serve(service.with_snapshot_source(source), &config, prometheus).await
    } else {
        serve(service, &config, prometheus).await
    }
}

async fn serve<S>(
    service: MarketDataService<HttpAuthenticator, WsConnector, S>,
    config: &Config,
    prometheus: PrometheusHandle,
) -> anyhow::Result<()>
where
    S: SnapshotSource + Clone + 'static,
{
    let service = Arc::new(service);
    service.track(&config.feed_symbol);

    let query: Arc<dyn BookQuery> = service.clone();
    let app_state = AppState::new(query).with_metrics(prometheus);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let router = create_router(app_state);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    });
    let mut server_done = false;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut check = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            result = &mut server => {
                server_done = true;
                let result = result
                    .map_err(anyhow::Error::from)
                    .and_then(|served| served.map_err(anyhow::Error::from));
                if let Err(e) = result {
                    error!(error = %e, "HTTP server failed, shutting down");
                    service.shutdown().await;
                    return Err(e);
                }
                break;
            }
            _ = check.tick() => {
                let failure = service
                    .session(&config.feed_symbol)
                    .and_then(|s| s.stats.terminal_error);
                if let Some(failure) = failure {
                    error!(error = %failure, "Feed session failed, shutting down");
                    service.shutdown().await;
                    return Err(anyhow::anyhow!(failure));
                }
            }
        }
    }

    info!("Stopping feed sessions...");
    service.shutdown().await;
    if !server_done {
        server.await??;
    }
    Ok(())
}

/// Print the book on an interval until interrupted.
async fn cmd_watch(symbol: Option<String>, interval_ms: u64, levels: usize) -> anyhow::Result<()> {
    let config = load_config(symbol, None)?;
    let policy = config.policy().map_err(|e| anyhow::anyhow!(e))?;

    let aggregator = Arc::new(OrderBookAggregator::new(
        config.feed_symbol.clone(),
        config.price_precision,
        policy,
    ));
    let view = SnapshotView::new(Arc::clone(&aggregator));
    let session = FeedSession::new(
        SessionConfig::from_config(&config),
        HttpAuthenticator::new(&config)?,
        WsConnector::new(),
        aggregator,
    );

    let handle = if config.use_rest_snapshot {
        session
            .with_snapshot_source(RestSnapshotSource::new(&config)?)
            .spawn()
    } else {
        session.spawn()
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut refresh = tokio::time::interval(Duration::from_millis(interval_ms.max(50)));

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = refresh.tick() => {
                if handle.is_finished() {
                    warn!("Feed session ended");
                    break;
                }
                // Clear screen and home the cursor.
                print!("\x1B[2J\x1B[H{}", render_book(&view.snapshot(), handle.state(), levels));
            }
        }
    }

    handle.stop().await?;
    Ok(())
}
