//! End-to-end runs of the live orchestration stack against the paper
//! broker: bars flow into the cache, signals into the ledger, orders to
//! the broker, and reconciliation closes the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, Duration};

use ladderbot::broker::{Broker, OrderStatus, PaperBroker};
use ladderbot::execution::{LiveTrader, LiveTraderConfig};
use ladderbot::models::{
    Candle, Direction, EntrySignal, ExitReason, PositionStatus, Timeframe,
};
use ladderbot::risk::RiskSettings;
use ladderbot::strategy::Strategy;
use ladderbot::Result;

/// Emits exactly one long signal, then stays quiet. Keeps lifecycle
/// assertions deterministic.
struct OneShotLong {
    fired: AtomicBool,
}

impl OneShotLong {
    fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }
}

impl Strategy for OneShotLong {
    fn generate_signal(&self, candles: &[Candle]) -> Result<Option<EntrySignal>> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let last = candles.last().ok_or("no bars")?;
        Ok(Some(EntrySignal {
            entry_time: last.timestamp,
            timeframe: last.timeframe,
            direction: Direction::Long,
            entry_price: last.close,
            stop_price: last.close * 0.99,
            target_price: last.close * 1.05,
            target_timeframe: None,
            risk_factor: 1.0,
        }))
    }

    fn name(&self) -> &str {
        "OneShotLong"
    }

    fn min_candles_required(&self) -> usize {
        1
    }
}

fn fast_config() -> LiveTraderConfig {
    LiveTraderConfig {
        history_bars: 64,
        loop_tick: Duration::from_millis(20),
        poll_interval_scale: 0.002,
        error_backoff: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..LiveTraderConfig::default()
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, iterations: usize) -> bool {
    for _ in 0..iterations {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_signal_to_broker_position_lifecycle() {
    let broker = Arc::new(PaperBroker::new(50000.0));
    broker.set_mark_price("ES", 5000.0);

    let mut trader = LiveTrader::new(
        broker.clone(),
        Arc::new(OneShotLong::new()),
        vec!["ES".to_string()],
        vec![Timeframe::M5],
        RiskSettings::default(),
        fast_config(),
    );
    trader.start().await.unwrap();

    // A position opens and gets stamped with a filled broker order
    let stamped = wait_until(
        || {
            trader
                .positions("ES")
                .first()
                .map(|p| p.order_id.is_some())
                .unwrap_or(false)
        },
        250,
    )
    .await;
    assert!(stamped, "no position was opened and stamped in time");

    let position = trader.positions("ES")[0].clone();
    assert_eq!(position.direction, Direction::Long);
    assert_eq!(position.entry_price, 5000.0);
    // risk 1% of 50000 = 500, stop distance 50 -> size 10,
    // capped at 20% of balance / price = 2
    assert!((position.size - 2.0).abs() < 1e-9);
    assert!((position.risk_amount - 100.0).abs() < 1e-9);
    assert_eq!(position.order_status, Some(OrderStatus::Filled));

    // The broker agrees
    let broker_positions = broker.get_positions().await.unwrap();
    assert_eq!(broker_positions.len(), 1);
    assert!((broker_positions[0].quantity - 2.0).abs() < 1e-9);
    assert_eq!(
        broker_positions[0].order_id,
        position.order_id
    );

    // Price moves up; reconciliation and management track it
    broker.set_mark_price("ES", 5100.0);
    let marked_up = wait_until(
        || {
            trader
                .positions("ES")
                .first()
                .map(|p| p.profit_loss > 0.0 && p.current_price > 5050.0)
                .unwrap_or(false)
        },
        250,
    )
    .await;
    assert!(marked_up, "position never tracked the new mark");

    trader.shutdown().await;
}

#[tokio::test]
async fn test_stop_loss_triggers_corrective_broker_close() {
    let broker = Arc::new(PaperBroker::new(50000.0));
    broker.set_mark_price("ES", 5000.0);

    let mut trader = LiveTrader::new(
        broker.clone(),
        Arc::new(OneShotLong::new()),
        vec!["ES".to_string()],
        vec![Timeframe::M5],
        RiskSettings::default(),
        fast_config(),
    );
    trader.start().await.unwrap();

    let opened = wait_until(
        || {
            trader
                .positions("ES")
                .first()
                .map(|p| p.order_id.is_some())
                .unwrap_or(false)
        },
        250,
    )
    .await;
    assert!(opened, "no position was opened in time");

    // Gap through the stop: the ledger closes locally at the stop price,
    // then reconciliation must flatten the broker side too
    broker.set_mark_price("ES", 4000.0);

    let closed = wait_until(
        || {
            trader
                .positions("ES")
                .first()
                .map(|p| p.status == PositionStatus::Closed)
                .unwrap_or(false)
        },
        250,
    )
    .await;
    assert!(closed, "stop loss never closed the ledger position");

    let position = trader.positions("ES")[0].clone();
    assert_eq!(position.exit_reason, Some(ExitReason::StopLoss));
    assert!((position.exit_price.unwrap() - 4950.0).abs() < 1e-6);

    // Balance changed by exactly the realized loss: (4950 - 5000) * 2
    let metrics = trader.performance_metrics("ES").unwrap();
    assert!((metrics.balance - 49900.0).abs() < 1e-6);
    assert_eq!(metrics.total_trades, 1);
    assert_eq!(metrics.losing_trades, 1);

    // Corrective close reaches the broker
    let flattened = wait_until_async(|| async {
        broker.get_positions().await.map(|p| p.is_empty()).unwrap_or(false)
    })
    .await;
    assert!(flattened, "broker position was never flattened");

    trader.shutdown().await;
}

async fn wait_until_async<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition().await
}

#[tokio::test]
async fn test_rejected_symbols_never_reach_the_broker() {
    // Degenerate stop distance: every signal is rejected, so no orders
    struct DegenerateStops;
    impl Strategy for DegenerateStops {
        fn generate_signal(&self, candles: &[Candle]) -> Result<Option<EntrySignal>> {
            let last = candles.last().ok_or("no bars")?;
            Ok(Some(EntrySignal {
                entry_time: last.timestamp,
                timeframe: last.timeframe,
                direction: Direction::Long,
                entry_price: last.close,
                stop_price: last.close,
                target_price: last.close * 1.05,
                target_timeframe: None,
                risk_factor: 1.0,
            }))
        }
        fn name(&self) -> &str {
            "DegenerateStops"
        }
        fn min_candles_required(&self) -> usize {
            1
        }
    }

    let broker = Arc::new(PaperBroker::new(50000.0));
    broker.set_mark_price("ES", 5000.0);

    let mut trader = LiveTrader::new(
        broker.clone(),
        Arc::new(DegenerateStops),
        vec!["ES".to_string()],
        vec![Timeframe::M5],
        RiskSettings::default(),
        fast_config(),
    );
    trader.start().await.unwrap();

    sleep(Duration::from_millis(500)).await;
    assert!(trader.positions("ES").is_empty());

    let orders = broker.get_orders(None).await.unwrap();
    assert!(orders.is_empty());

    trader.shutdown().await;
}
