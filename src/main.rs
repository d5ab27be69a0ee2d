use std::sync::Arc;

use clap::{Parser, ValueEnum};

use ladderbot::broker::{Broker, PaperBroker, RestBroker};
use ladderbot::db::PostgresStore;
use ladderbot::execution::{LiveTrader, LiveTraderConfig};
use ladderbot::models::Timeframe;
use ladderbot::persistence::RedisBarStore;
use ladderbot::risk::RiskSettings;
use ladderbot::strategy::ReclamationStrategy;
use ladderbot::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// In-process simulated broker
    Paper,
    /// REST order-routing gateway (GATEWAY_URL / GATEWAY_API_KEY)
    Gateway,
}

#[derive(Debug, Parser)]
#[command(name = "ladderbot", about = "Multi-timeframe live trading engine")]
struct Cli {
    /// Symbols to trade
    #[arg(short, long, value_delimiter = ',', default_value = "ES")]
    symbols: Vec<String>,

    /// Timeframes to poll and trade
    #[arg(short, long, value_delimiter = ',', default_value = "5m,1h,4h")]
    timeframes: Vec<Timeframe>,

    /// Execution backend
    #[arg(long, value_enum, default_value_t = Backend::Paper)]
    backend: Backend,

    /// Starting balance for the paper backend
    #[arg(long, default_value_t = 10000.0)]
    balance: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = load_risk_settings();

    tracing::info!("Ladderbot starting");
    tracing::info!("  Symbols: {:?}", cli.symbols);
    tracing::info!(
        "  Timeframes: {:?}",
        cli.timeframes.iter().map(|tf| tf.to_string()).collect::<Vec<_>>()
    );
    tracing::info!("  Backend: {:?}", cli.backend);
    tracing::info!(
        "  Risk: {}% per trade, max {} concurrent",
        settings.account_risk_percent,
        settings.max_concurrent_trades
    );

    let broker: Arc<dyn Broker> = match cli.backend {
        Backend::Paper => Arc::new(PaperBroker::new(cli.balance)),
        Backend::Gateway => {
            let url = std::env::var("GATEWAY_URL")
                .map_err(|_| "GATEWAY_URL not set for the gateway backend")?;
            let api_key = std::env::var("GATEWAY_API_KEY")
                .map_err(|_| "GATEWAY_API_KEY not set for the gateway backend")?;
            Arc::new(RestBroker::new(&url, &api_key).map_err(|e| e.to_string())?)
        }
    };

    let mut trader = LiveTrader::new(
        broker,
        Arc::new(ReclamationStrategy::default()),
        cli.symbols.clone(),
        cli.timeframes.clone(),
        settings,
        LiveTraderConfig::default(),
    );

    if let Some(store) = connect_bar_store().await {
        trader = trader.with_bar_store(store);
    }
    if let Some(store) = connect_position_store().await {
        trader = trader.with_position_store(store);
    }

    trader.on_position(Arc::new(|position| {
        if position.is_open() {
            tracing::info!(
                symbol = %position.symbol,
                timeframe = %position.timeframe,
                direction = %position.direction,
                entry = position.entry_price,
                "Position opened"
            );
        } else {
            tracing::info!(
                symbol = %position.symbol,
                pnl = position.profit_loss,
                reason = ?position.exit_reason,
                "Position closed"
            );
        }
    }));

    trader.start().await.map_err(|e| e.to_string())?;
    tracing::info!("All loops running. Press Ctrl+C to stop...");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl+C, shutting down...");

    for symbol in &cli.symbols {
        if let Some(metrics) = trader.performance_metrics(symbol) {
            tracing::info!(
                symbol = %symbol,
                balance = metrics.balance,
                trades = metrics.total_trades,
                win_rate = metrics.win_rate,
                max_drawdown_pct = metrics.max_drawdown_pct,
                "Session performance"
            );
        }
    }

    trader.shutdown().await;
    tracing::info!("Ladderbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ladderbot=info".into()),
        )
        .init();
}

/// Layered settings: optional ladderbot.toml, then LADDERBOT__-prefixed
/// environment overrides, then defaults for anything unset.
fn load_risk_settings() -> RiskSettings {
    let loaded = config::Config::builder()
        .add_source(config::File::with_name("ladderbot").required(false))
        .add_source(config::Environment::with_prefix("LADDERBOT").separator("__"))
        .build()
        .and_then(|c| c.try_deserialize::<RiskSettings>());

    match loaded {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load risk settings ({}), using defaults", e);
            RiskSettings::default()
        }
    }
}

async fn connect_bar_store() -> Option<RedisBarStore> {
    let redis_url = std::env::var("REDIS_URL").ok()?;
    match RedisBarStore::new(&redis_url).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!("Redis unavailable ({}), bars will not be persisted", e);
            None
        }
    }
}

async fn connect_position_store() -> Option<PostgresStore> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    match PostgresStore::new(&database_url).await {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!("Postgres unavailable ({}), positions will not be persisted", e);
            None
        }
    }
}
