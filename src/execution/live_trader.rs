use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use uuid::Uuid;

use super::bar_cache::BarCache;
use super::trade_executor::{MarketView, PerformanceMetrics, SignalDecision, TradeExecutor};
use crate::broker::{Broker, Order, OrderRequest, OrderSide};
use crate::db::PostgresStore;
use crate::indicators::{calculate_atr, calculate_ema};
use crate::models::{Direction, EntrySignal, Position, Timeframe};
use crate::persistence::RedisBarStore;
use crate::risk::RiskSettings;
use crate::strategy::Strategy;

pub type SignalObserver = Arc<dyn Fn(&str, &EntrySignal) + Send + Sync>;
pub type OrderObserver = Arc<dyn Fn(&Order) + Send + Sync>;
pub type PositionObserver = Arc<dyn Fn(&Position) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct LiveTraderConfig {
    /// Bars fetched per market-data poll
    pub history_bars: usize,
    /// EMA period for progression targets
    pub ema_period: usize,
    /// ATR period for trailing stops
    pub atr_period: usize,
    /// Base scheduling tick for all three loops
    pub loop_tick: Duration,
    /// Multiplier on the per-timeframe poll cadence; below 1.0 speeds
    /// everything up (simulation and paper runs)
    pub poll_interval_scale: f64,
    /// Extra sleep after a failed loop iteration
    pub error_backoff: Duration,
    /// How long shutdown waits for each loop to come home
    pub shutdown_timeout: Duration,
}

impl Default for LiveTraderConfig {
    fn default() -> Self {
        Self {
            history_bars: 200,
            ema_period: 21,
            atr_period: 14,
            loop_tick: Duration::from_millis(250),
            poll_interval_scale: 1.0,
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// State shared by the three loops
struct Shared {
    broker: Arc<dyn Broker>,
    strategy: Arc<dyn Strategy>,
    config: LiveTraderConfig,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    cache: BarCache,
    executors: HashMap<String, Mutex<TradeExecutor>>,
    signal_senders: HashMap<String, UnboundedSender<EntrySignal>>,
    signal_observers: Mutex<Vec<SignalObserver>>,
    order_observers: Mutex<Vec<OrderObserver>>,
    position_observers: Mutex<Vec<PositionObserver>>,
    bar_store: Option<tokio::sync::Mutex<RedisBarStore>>,
    position_store: Option<PostgresStore>,
    shutdown: AtomicBool,
}

/// Live orchestrator: one market-data loop, one signal loop, one
/// execution loop over a shared bar cache and per-symbol ledgers.
///
/// Loops are started together and stopped together by a cooperative
/// shutdown flag with bounded joins. Errors inside an iteration are
/// logged and backed off; they never end a loop.
pub struct LiveTrader {
    settings: RiskSettings,
    broker: Arc<dyn Broker>,
    strategy: Arc<dyn Strategy>,
    config: LiveTraderConfig,
    symbols: Vec<String>,
    timeframes: Vec<Timeframe>,
    bar_store: Option<RedisBarStore>,
    position_store: Option<PostgresStore>,
    pending_observers: (Vec<SignalObserver>, Vec<OrderObserver>, Vec<PositionObserver>),
    shared: Option<Arc<Shared>>,
    handles: Vec<JoinHandle<()>>,
}

impl LiveTrader {
    pub fn new(
        broker: Arc<dyn Broker>,
        strategy: Arc<dyn Strategy>,
        symbols: Vec<String>,
        timeframes: Vec<Timeframe>,
        settings: RiskSettings,
        config: LiveTraderConfig,
    ) -> Self {
        Self {
            settings,
            broker,
            strategy,
            config,
            symbols,
            timeframes,
            bar_store: None,
            position_store: None,
            pending_observers: (Vec::new(), Vec::new(), Vec::new()),
            shared: None,
            handles: Vec::new(),
        }
    }

    /// Durable bar storage for the market-data loop's side effect
    pub fn with_bar_store(mut self, store: RedisBarStore) -> Self {
        self.bar_store = Some(store);
        self
    }

    /// Durable position storage written on open and close
    pub fn with_position_store(mut self, store: PostgresStore) -> Self {
        self.position_store = Some(store);
        self
    }

    pub fn on_signal(&mut self, observer: SignalObserver) {
        match &self.shared {
            Some(shared) => shared.signal_observers.lock().unwrap().push(observer),
            None => self.pending_observers.0.push(observer),
        }
    }

    pub fn on_order(&mut self, observer: OrderObserver) {
        match &self.shared {
            Some(shared) => shared.order_observers.lock().unwrap().push(observer),
            None => self.pending_observers.1.push(observer),
        }
    }

    pub fn on_position(&mut self, observer: PositionObserver) {
        match &self.shared {
            Some(shared) => shared.position_observers.lock().unwrap().push(observer),
            None => self.pending_observers.2.push(observer),
        }
    }

    /// Connect, derive the starting balance from the broker, and spawn
    /// the three loops.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.shared.is_some() {
            anyhow::bail!("LiveTrader already started");
        }

        self.broker
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("Broker connect failed: {}", e))?;

        let account = self
            .broker
            .get_account_info()
            .await
            .map_err(|e| anyhow::anyhow!("Account query failed: {}", e))?;

        tracing::info!(
            balance = account.balance,
            symbols = ?self.symbols,
            "Live trader starting"
        );

        let mut executors = HashMap::new();
        let mut signal_senders = HashMap::new();
        let mut signal_receivers = HashMap::new();
        for symbol in &self.symbols {
            executors.insert(
                symbol.clone(),
                Mutex::new(TradeExecutor::new(
                    symbol,
                    account.balance,
                    self.settings.clone(),
                )),
            );
            let (tx, rx): (UnboundedSender<EntrySignal>, UnboundedReceiver<EntrySignal>) =
                mpsc::unbounded_channel();
            signal_senders.insert(symbol.clone(), tx);
            signal_receivers.insert(symbol.clone(), rx);
        }

        let (signal_obs, order_obs, position_obs) = std::mem::take(&mut self.pending_observers);

        let shared = Arc::new(Shared {
            broker: self.broker.clone(),
            strategy: self.strategy.clone(),
            config: self.config.clone(),
            symbols: self.symbols.clone(),
            timeframes: self.timeframes.clone(),
            cache: BarCache::new(self.config.history_bars.max(64)),
            executors,
            signal_senders,
            signal_observers: Mutex::new(signal_obs),
            order_observers: Mutex::new(order_obs),
            position_observers: Mutex::new(position_obs),
            bar_store: self.bar_store.take().map(tokio::sync::Mutex::new),
            position_store: self.position_store.take(),
            shutdown: AtomicBool::new(false),
        });

        // Quote subscriptions are informational; failures are not fatal
        for symbol in &shared.symbols {
            let logged = symbol.clone();
            if let Err(e) = shared
                .broker
                .subscribe(
                    symbol,
                    Arc::new(move |quote| {
                        tracing::trace!(symbol = %logged, last = quote.last, "Quote");
                    }),
                )
                .await
            {
                tracing::warn!(symbol = %symbol, "Quote subscription failed: {}", e);
            }
        }

        self.handles.push(tokio::spawn(Self::market_data_loop(shared.clone())));
        self.handles.push(tokio::spawn(Self::signal_loop(shared.clone())));
        self.handles
            .push(tokio::spawn(Self::execution_loop(shared.clone(), signal_receivers)));

        self.shared = Some(shared);
        Ok(())
    }

    /// Cooperative shutdown: set the flag, wait (bounded) for each loop,
    /// abort stragglers, then disconnect.
    pub async fn shutdown(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.shutdown.store(true, Ordering::SeqCst);

        for mut handle in self.handles.drain(..) {
            if timeout(shared.config.shutdown_timeout, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Loop did not observe shutdown in time, aborting");
                handle.abort();
            }
        }

        for symbol in &shared.symbols {
            let _ = shared.broker.unsubscribe(symbol).await;
        }
        if let Err(e) = shared.broker.disconnect().await {
            tracing::warn!("Broker disconnect failed: {}", e);
        }

        tracing::info!("Live trader stopped");
    }

    /// Snapshot of all positions for one symbol
    pub fn positions(&self, symbol: &str) -> Vec<Position> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.executors.get(symbol))
            .map(|executor| {
                let executor = executor.lock().unwrap();
                let mut all: Vec<Position> =
                    executor.open_positions().into_iter().cloned().collect();
                all.extend(executor.closed_positions().into_iter().cloned());
                all
            })
            .unwrap_or_default()
    }

    pub fn performance_metrics(&self, symbol: &str) -> Option<PerformanceMetrics> {
        self.shared
            .as_ref()
            .and_then(|shared| shared.executors.get(symbol))
            .map(|executor| executor.lock().unwrap().performance_metrics())
    }

    // ------------------------------------------------------------------
    // Loop 1: market data
    // ------------------------------------------------------------------

    /// Fetch bars for every (symbol, timeframe) pair on a cadence
    /// proportional to the timeframe, overwrite the cache entry, and
    /// persist the fetch as a side effect.
    async fn market_data_loop(shared: Arc<Shared>) {
        tracing::info!("Market data loop starting");

        let mut next_fetch: HashMap<(String, Timeframe), tokio::time::Instant> = HashMap::new();
        let mut ticker = interval(shared.config.loop_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shared.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            for symbol in &shared.symbols {
                for &timeframe in &shared.timeframes {
                    let key = (symbol.clone(), timeframe);
                    let now = tokio::time::Instant::now();
                    if next_fetch.get(&key).is_some_and(|due| *due > now) {
                        continue;
                    }

                    match Self::fetch_pair(&shared, symbol, timeframe).await {
                        Ok(count) => {
                            tracing::debug!(symbol = %symbol, %timeframe, count, "Bars refreshed");
                            let cadence = timeframe
                                .poll_interval()
                                .mul_f64(shared.config.poll_interval_scale);
                            next_fetch.insert(key, now + cadence);
                        }
                        Err(e) => {
                            tracing::error!(
                                symbol = %symbol,
                                %timeframe,
                                "Bar fetch failed: {:#}",
                                e
                            );
                            next_fetch.insert(key, now + shared.config.error_backoff);
                        }
                    }
                }
            }
        }

        tracing::info!("Market data loop stopped");
    }

    async fn fetch_pair(
        shared: &Shared,
        symbol: &str,
        timeframe: Timeframe,
    ) -> anyhow::Result<usize> {
        let end = Utc::now();
        let start = end - timeframe.duration() * shared.config.history_bars as i32;

        let bars = shared
            .broker
            .get_historical_data(symbol, timeframe, start, end)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        let count = bars.len();

        // Lock is scoped to the cache write; the network call above and
        // the store write below run without it
        shared.cache.replace(symbol, timeframe, bars.clone());

        if let Some(store) = &shared.bar_store {
            if let Err(e) = store.lock().await.save_bars(symbol, timeframe, &bars).await {
                tracing::warn!(symbol = %symbol, %timeframe, "Bar persistence failed: {}", e);
            }
        }

        Ok(count)
    }

    // ------------------------------------------------------------------
    // Loop 2: signal generation
    // ------------------------------------------------------------------

    /// Evaluate the strategy over cached bars on a coarser cadence and
    /// hand fresh signals to the execution loop.
    async fn signal_loop(shared: Arc<Shared>) {
        tracing::info!("Signal loop starting");

        let mut next_eval: HashMap<(String, Timeframe), tokio::time::Instant> = HashMap::new();
        let mut last_seen: HashMap<(String, Timeframe), chrono::DateTime<Utc>> = HashMap::new();
        let mut ticker = interval(shared.config.loop_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shared.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            for symbol in &shared.symbols {
                for &timeframe in &shared.timeframes {
                    let key = (symbol.clone(), timeframe);
                    let now = tokio::time::Instant::now();
                    if next_eval.get(&key).is_some_and(|due| *due > now) {
                        continue;
                    }
                    let cadence = timeframe
                        .signal_interval()
                        .mul_f64(shared.config.poll_interval_scale);
                    next_eval.insert(key.clone(), now + cadence);

                    let bars = shared.cache.bars(symbol, timeframe);
                    if bars.len() < shared.strategy.min_candles_required() {
                        continue;
                    }

                    let signal = match shared.strategy.generate_signal(&bars) {
                        Ok(Some(signal)) => signal,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!(
                                symbol = %symbol,
                                %timeframe,
                                "Strategy evaluation failed: {}",
                                e
                            );
                            continue;
                        }
                    };

                    // Only signals newer than the last one seen for this
                    // pair are forwarded
                    if last_seen
                        .get(&key)
                        .is_some_and(|seen| signal.entry_time <= *seen)
                    {
                        continue;
                    }
                    last_seen.insert(key, signal.entry_time);

                    tracing::info!(
                        symbol = %symbol,
                        %timeframe,
                        direction = %signal.direction,
                        entry = signal.entry_price,
                        "Signal queued"
                    );

                    let observers = shared.signal_observers.lock().unwrap().clone();
                    for observer in observers {
                        observer(symbol, &signal);
                    }

                    if let Some(sender) = shared.signal_senders.get(symbol) {
                        let _ = sender.send(signal);
                    }
                }
            }
        }

        tracing::info!("Signal loop stopped");
    }

    // ------------------------------------------------------------------
    // Loop 3: execution and reconciliation
    // ------------------------------------------------------------------

    /// Drain pending signals into the ledgers, place orders for accepted
    /// ones, run the management pass, and reconcile against the broker.
    async fn execution_loop(
        shared: Arc<Shared>,
        mut receivers: HashMap<String, UnboundedReceiver<EntrySignal>>,
    ) {
        tracing::info!("Execution loop starting");

        let mut ticker = interval(shared.config.loop_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !shared.shutdown.load(Ordering::SeqCst) {
            ticker.tick().await;

            for symbol in &shared.symbols {
                let receiver = match receivers.get_mut(symbol) {
                    Some(receiver) => receiver,
                    None => continue,
                };

                if let Err(e) = Self::run_symbol_iteration(&shared, symbol, receiver).await {
                    tracing::error!(symbol = %symbol, "Execution iteration failed: {:#}", e);
                    sleep(shared.config.error_backoff).await;
                }
            }
        }

        tracing::info!("Execution loop stopped");
    }

    async fn run_symbol_iteration(
        shared: &Shared,
        symbol: &str,
        receiver: &mut UnboundedReceiver<EntrySignal>,
    ) -> anyhow::Result<()> {
        let executor = shared
            .executors
            .get(symbol)
            .ok_or_else(|| anyhow::anyhow!("No executor for {}", symbol))?;

        // Drain pending signals
        let mut requeue = Vec::new();
        while let Ok(signal) = receiver.try_recv() {
            // A signal is never processed before its timeframe has bars
            if !shared.cache.has_bars(symbol, signal.timeframe) {
                requeue.push(signal);
                continue;
            }

            let latest_bars = shared.cache.latest_by_timeframe(symbol);
            let decision = executor.lock().unwrap().process_signal(&signal, &latest_bars);

            if let SignalDecision::Accepted(id) = decision {
                Self::place_entry_order(shared, symbol, executor, id).await;
            }
        }
        for signal in requeue {
            if let Some(sender) = shared.signal_senders.get(symbol) {
                let _ = sender.send(signal);
            }
        }

        // Management pass over the latest cached market state
        let view = Self::build_market_view(shared, symbol);
        let newly_closed = {
            let mut executor = executor.lock().unwrap();
            let before: HashSet<Uuid> =
                executor.closed_positions().iter().map(|p| p.id).collect();
            executor.manage(&view);
            executor
                .closed_positions()
                .into_iter()
                .filter(|p| !before.contains(&p.id))
                .cloned()
                .collect::<Vec<Position>>()
        };

        for position in &newly_closed {
            let observers = shared.position_observers.lock().unwrap().clone();
            for observer in observers {
                observer(position);
            }
            Self::persist_position(shared, position).await;
        }

        // Reconcile local state against the broker's records
        let broker_positions = shared
            .broker
            .get_positions()
            .await
            .map_err(|e| anyhow::anyhow!("Position query failed: {}", e))?;
        Self::reconcile(shared, symbol, executor, &broker_positions).await;

        Ok(())
    }

    /// Place the market order for an accepted signal and stamp the
    /// position with the result. Placement failure leaves the local
    /// position for reconciliation to resolve; creation and placement
    /// are deliberately not atomic.
    async fn place_entry_order(
        shared: &Shared,
        symbol: &str,
        executor: &Mutex<TradeExecutor>,
        id: Uuid,
    ) {
        let position = match executor.lock().unwrap().position(id).cloned() {
            Some(position) => position,
            None => return,
        };

        let side = match position.direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };

        match shared
            .broker
            .place_order(OrderRequest::market(symbol, position.size, side))
            .await
        {
            Ok(order) => {
                if let Err(e) = executor.lock().unwrap().set_order(id, &order.id, order.status) {
                    tracing::error!(position = %id, "Order stamp failed: {:#}", e);
                }
                let observers = shared.order_observers.lock().unwrap().clone();
                for observer in observers {
                    observer(&order);
                }
            }
            Err(e) => {
                tracing::warn!(
                    position = %id,
                    symbol = %symbol,
                    "Order placement failed, local position awaits reconciliation: {}",
                    e
                );
            }
        }

        let snapshot = executor.lock().unwrap().position(id).cloned();
        if let Some(position) = snapshot {
            let observers = shared.position_observers.lock().unwrap().clone();
            for observer in observers {
                observer(&position);
            }
            Self::persist_position(shared, &position).await;
        }
    }

    /// Copy broker-confirmed fields onto matching open positions and
    /// issue corrective closes where the ledger already closed a
    /// position the broker still shows open.
    async fn reconcile(
        shared: &Shared,
        symbol: &str,
        executor: &Mutex<TradeExecutor>,
        broker_positions: &[crate::broker::BrokerPosition],
    ) {
        let (open, closed): (Vec<Position>, Vec<Position>) = {
            let executor = executor.lock().unwrap();
            (
                executor.open_positions().into_iter().cloned().collect(),
                executor.closed_positions().into_iter().cloned().collect(),
            )
        };

        let matched_order_ids: HashSet<&String> = open
            .iter()
            .chain(closed.iter())
            .filter_map(|p| p.order_id.as_ref())
            .collect();

        for position in &open {
            let Some(order_id) = &position.order_id else {
                continue;
            };
            if let Some(broker_position) = broker_positions
                .iter()
                .find(|bp| bp.symbol == symbol && bp.order_id.as_deref() == Some(order_id))
            {
                if let Err(e) = executor.lock().unwrap().apply_broker_state(
                    position.id,
                    broker_position.current_price,
                    broker_position.market_value,
                ) {
                    tracing::error!(position = %position.id, "Broker sync failed: {:#}", e);
                }
            }
        }

        for position in &closed {
            let Some(order_id) = &position.order_id else {
                continue;
            };
            let Some(broker_position) = broker_positions
                .iter()
                .find(|bp| bp.symbol == symbol && bp.order_id.as_deref() == Some(order_id))
            else {
                continue;
            };

            tracing::warn!(
                position = %position.id,
                order = %order_id,
                "Ledger closed but broker still open, issuing corrective close"
            );

            let side = match broker_position.side {
                OrderSide::Buy => OrderSide::Sell,
                OrderSide::Sell => OrderSide::Buy,
            };
            match shared
                .broker
                .place_order(OrderRequest::market(symbol, broker_position.quantity, side))
                .await
            {
                Ok(order) => {
                    let observers = shared.order_observers.lock().unwrap().clone();
                    for observer in observers {
                        observer(&order);
                    }
                }
                Err(e) => {
                    // Mismatch persists; surfaced for the operator, never
                    // silently dropped
                    tracing::error!(
                        position = %position.id,
                        order = %order_id,
                        "Corrective close failed, mismatch persists: {}",
                        e
                    );
                }
            }
        }

        for broker_position in broker_positions
            .iter()
            .filter(|bp| bp.symbol == symbol)
        {
            let known = broker_position
                .order_id
                .as_ref()
                .map(|id| matched_order_ids.contains(id))
                .unwrap_or(false);
            if !known {
                tracing::warn!(
                    symbol = %symbol,
                    quantity = broker_position.quantity,
                    "Broker reports a position with no local counterpart"
                );
            }
        }
    }

    fn build_market_view(shared: &Shared, symbol: &str) -> MarketView {
        let mut view = MarketView {
            bars: shared.cache.latest_by_timeframe(symbol),
            ema: HashMap::new(),
            atr: HashMap::new(),
        };

        for &timeframe in &shared.timeframes {
            let bars = shared.cache.bars(symbol, timeframe);
            if bars.is_empty() {
                continue;
            }
            let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
            if let Some(ema) = calculate_ema(&closes, shared.config.ema_period) {
                view.ema.insert(timeframe, ema);
            }
            if let Some(atr) = calculate_atr(&bars, shared.config.atr_period) {
                view.atr.insert(timeframe, atr);
            }
        }

        view
    }

    async fn persist_position(shared: &Shared, position: &Position) {
        if let Some(store) = &shared.position_store {
            if let Err(e) = store.save_position(position).await {
                tracing::warn!(position = %position.id, "Position persistence failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::models::Candle;
    use crate::Result;

    /// Emits one long signal per distinct latest-bar timestamp once bars
    /// exist; enough to drive the loops deterministically.
    struct AlwaysLong;

    impl Strategy for AlwaysLong {
        fn generate_signal(&self, candles: &[Candle]) -> Result<Option<EntrySignal>> {
            let last = candles.last().ok_or("no bars")?;
            Ok(Some(EntrySignal {
                entry_time: last.timestamp,
                timeframe: last.timeframe,
                direction: Direction::Long,
                entry_price: last.close,
                stop_price: last.close * 0.99,
                target_price: last.close * 1.02,
                target_timeframe: last.timeframe.next(),
                risk_factor: 1.0,
            }))
        }

        fn name(&self) -> &str {
            "AlwaysLong"
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

    #[tokio::test]
    async fn test_signal_flows_to_position_with_order() {
        let broker = Arc::new(PaperBroker::new(50000.0));
        broker.set_mark_price("ES", 5000.0);

        let mut trader = LiveTrader::new(
            broker.clone(),
            Arc::new(AlwaysLong),
            vec!["ES".to_string()],
            vec![Timeframe::M5],
            RiskSettings::default(),
            fast_config(),
        );

        trader.start().await.unwrap();

        // Let the loops fetch bars, emit a signal, and execute it
        let mut opened = false;
        for _ in 0..100 {
            sleep(Duration::from_millis(20)).await;
            let positions = trader.positions("ES");
            if let Some(position) = positions.first() {
                assert_eq!(position.direction, Direction::Long);
                if position.order_id.is_some() {
                    opened = true;
                    break;
                }
            }
        }
        trader.shutdown().await;

        assert!(opened, "expected a position stamped with a broker order");

        // The paper broker saw the matching order
        broker.connect().await.unwrap();
        let orders = broker.get_orders(None).await.unwrap();
        assert!(!orders.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt_and_idempotent() {
        let broker = Arc::new(PaperBroker::new(50000.0));
        let mut trader = LiveTrader::new(
            broker,
            Arc::new(AlwaysLong),
            vec!["ES".to_string()],
            vec![Timeframe::M5],
            RiskSettings::default(),
            fast_config(),
        );

        trader.start().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        trader.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(3));

        // Second shutdown is a no-op
        trader.shutdown().await;
    }

    #[tokio::test]
    async fn test_observers_fire() {
        use std::sync::atomic::AtomicUsize;

        let broker = Arc::new(PaperBroker::new(50000.0));
        broker.set_mark_price("ES", 5000.0);

        let mut trader = LiveTrader::new(
            broker,
            Arc::new(AlwaysLong),
            vec!["ES".to_string()],
            vec![Timeframe::M5],
            RiskSettings::default(),
            fast_config(),
        );

        let signals = Arc::new(AtomicUsize::new(0));
        let orders = Arc::new(AtomicUsize::new(0));
        let signals_clone = signals.clone();
        let orders_clone = orders.clone();
        trader.on_signal(Arc::new(move |_, _| {
            signals_clone.fetch_add(1, Ordering::SeqCst);
        }));
        trader.on_order(Arc::new(move |_| {
            orders_clone.fetch_add(1, Ordering::SeqCst);
        }));

        trader.start().await.unwrap();
        for _ in 0..100 {
            sleep(Duration::from_millis(20)).await;
            if orders.load(Ordering::SeqCst) > 0 {
                break;
            }
        }
        trader.shutdown().await;

        assert!(signals.load(Ordering::SeqCst) > 0);
        assert!(orders.load(Ordering::SeqCst) > 0);
    }
}
