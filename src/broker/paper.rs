use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    AccountInfo, Broker, BrokerError, BrokerPosition, BrokerResult, MarketData, MarketDataKind,
    Order, OrderBook, OrderRequest, OrderStatus, OrderType, OrderUpdate, Quote, QuoteCallback,
};
use crate::models::{Candle, Timeframe};

const DEFAULT_MARK_PRICE: f64 = 100.0;
const MAX_BARS_PER_REQUEST: usize = 500;

struct PaperState {
    balance: f64,
    marks: HashMap<String, f64>,
    orders: HashMap<String, Order>,
    positions: Vec<BrokerPosition>,
    subscribers: HashMap<String, QuoteCallback>,
    rng: StdRng,
}

/// In-process broker: immediate fills against a synthetic random-walk
/// market. Default backend for local runs and the test double for the
/// orchestration stack.
pub struct PaperBroker {
    connected: AtomicBool,
    next_order_id: AtomicU64,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(initial_balance: f64) -> Self {
        Self::with_seed(initial_balance, 42)
    }

    /// Seeded constructor so simulated bar series are reproducible
    pub fn with_seed(initial_balance: f64, seed: u64) -> Self {
        Self {
            connected: AtomicBool::new(false),
            next_order_id: AtomicU64::new(1),
            state: Mutex::new(PaperState {
                balance: initial_balance,
                marks: HashMap::new(),
                orders: HashMap::new(),
                positions: Vec::new(),
                subscribers: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Pin the simulated price for a symbol. Subsequent fills and bar
    /// fetches settle at this mark; subscribers get a quote.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            state.marks.insert(symbol.to_string(), price);
            state.subscribers.get(symbol).cloned()
        };

        if let Some(callback) = callback {
            callback(Quote {
                symbol: symbol.to_string(),
                bid: price * 0.9999,
                ask: price * 1.0001,
                last: price,
                timestamp: Utc::now(),
            });
        }
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn allocate_order_id(&self) -> String {
        format!("P-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Apply a filled order to the simulated position book. A fill in the
    /// opposite side of an existing position reduces it; crossing zero
    /// flips the side with the remainder.
    fn apply_fill(state: &mut PaperState, order: &Order, fill_price: f64) {
        if let Some(pos) = state
            .positions
            .iter_mut()
            .find(|p| p.symbol == order.symbol && p.side != order.side)
        {
            if order.quantity < pos.quantity {
                pos.quantity -= order.quantity;
                pos.market_value = pos.quantity * fill_price;
                return;
            }
            let leftover = order.quantity - pos.quantity;
            state
                .positions
                .retain(|p| !(p.symbol == order.symbol && p.side != order.side));
            if leftover <= f64::EPSILON {
                return;
            }
            state.positions.push(BrokerPosition {
                symbol: order.symbol.clone(),
                quantity: leftover,
                side: order.side,
                average_price: fill_price,
                current_price: fill_price,
                market_value: leftover * fill_price,
                order_id: Some(order.id.clone()),
            });
            return;
        }

        state.positions.push(BrokerPosition {
            symbol: order.symbol.clone(),
            quantity: order.quantity,
            side: order.side,
            average_price: fill_price,
            current_price: fill_price,
            market_value: order.quantity * fill_price,
            order_id: Some(order.id.clone()),
        });
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn connect(&self) -> BrokerResult<bool> {
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Paper broker connected");
        Ok(true)
    }

    async fn disconnect(&self) -> BrokerResult<bool> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(true)
    }

    async fn get_account_info(&self) -> BrokerResult<AccountInfo> {
        self.ensure_connected()?;
        let state = self.state.lock().unwrap();
        let margin_used: f64 = state.positions.iter().map(|p| p.market_value).sum();
        Ok(AccountInfo {
            balance: state.balance,
            available: state.balance - margin_used,
            margin_used,
        })
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        let marks = state.marks.clone();
        for pos in &mut state.positions {
            if let Some(&mark) = marks.get(&pos.symbol) {
                pos.current_price = mark;
                pos.market_value = pos.quantity * mark;
            }
        }
        Ok(state.positions.clone())
    }

    async fn get_orders(&self, status: Option<OrderStatus>) -> BrokerResult<Vec<Order>> {
        self.ensure_connected()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .values()
            .filter(|o| status.map_or(true, |s| o.status == s))
            .cloned()
            .collect())
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        self.ensure_connected()?;
        if request.quantity <= 0.0 {
            return Err(BrokerError::OrderRejected(
                "quantity must be positive".to_string(),
            ));
        }

        let id = self.allocate_order_id();
        let mut state = self.state.lock().unwrap();
        let mark = *state
            .marks
            .get(&request.symbol)
            .unwrap_or(&DEFAULT_MARK_PRICE);

        // Market orders fill at the mark immediately; everything else
        // rests as a working order.
        let (status, fill_price) = match request.order_type {
            OrderType::Market => (OrderStatus::Filled, Some(mark)),
            _ => (OrderStatus::Working, None),
        };

        let order = Order {
            id: id.clone(),
            symbol: request.symbol.clone(),
            quantity: request.quantity,
            side: request.side,
            order_type: request.order_type,
            status,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            fill_price,
            time_in_force: request.time_in_force,
            created_at: Utc::now(),
        };

        if let Some(price) = fill_price {
            Self::apply_fill(&mut state, &order, price);
        }
        state.orders.insert(id, order.clone());

        tracing::debug!(
            order_id = %order.id,
            symbol = %order.symbol,
            status = ?order.status,
            "Paper order placed"
        );

        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        match state.orders.get_mut(order_id) {
            Some(order) if order.status == OrderStatus::Working => {
                order.status = OrderStatus::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BrokerError::NotFound(order_id.to_string())),
        }
    }

    async fn modify_order(&self, order_id: &str, update: OrderUpdate) -> BrokerResult<Order> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))?;

        if order.status != OrderStatus::Working {
            return Err(BrokerError::OrderRejected(format!(
                "order {} is not working",
                order_id
            )));
        }

        if let Some(quantity) = update.quantity {
            order.quantity = quantity;
        }
        if let Some(limit) = update.limit_price {
            order.limit_price = Some(limit);
        }
        if let Some(stop) = update.stop_price {
            order.stop_price = Some(stop);
        }

        Ok(order.clone())
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<Order> {
        self.ensure_connected()?;
        let state = self.state.lock().unwrap();
        state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(order_id.to_string()))
    }

    async fn get_market_data(
        &self,
        symbol: &str,
        kind: MarketDataKind,
    ) -> BrokerResult<MarketData> {
        self.ensure_connected()?;
        let state = self.state.lock().unwrap();
        let mark = *state.marks.get(symbol).unwrap_or(&DEFAULT_MARK_PRICE);
        let data = match kind {
            MarketDataKind::Quote => MarketData::Quote(Quote {
                symbol: symbol.to_string(),
                bid: mark * 0.9999,
                ask: mark * 1.0001,
                last: mark,
                timestamp: Utc::now(),
            }),
            MarketDataKind::OrderBook => MarketData::OrderBook(OrderBook {
                symbol: symbol.to_string(),
                bids: vec![(mark * 0.9999, 10.0), (mark * 0.9995, 25.0)],
                asks: vec![(mark * 1.0001, 10.0), (mark * 1.0005, 25.0)],
                timestamp: Utc::now(),
            }),
        };
        Ok(data)
    }

    /// Random walk ending exactly at the current mark, so fills and the
    /// latest cached bar agree.
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        let mark = *state.marks.get(symbol).unwrap_or(&DEFAULT_MARK_PRICE);

        let span = end - start;
        let bar_duration = timeframe.duration();
        let count = (span.num_seconds() / bar_duration.num_seconds().max(1))
            .clamp(1, MAX_BARS_PER_REQUEST as i64) as usize;

        // Walk backwards from the mark so the final close is exact
        let mut closes = vec![mark];
        let mut price = mark;
        for _ in 1..count {
            let step: f64 = state.rng.gen_range(-0.004..0.004);
            price /= 1.0 + step;
            closes.push(price);
        }
        closes.reverse();

        let mut candles = Vec::with_capacity(count);
        let mut prev_close = closes[0];
        for (i, &close) in closes.iter().enumerate() {
            let timestamp = end - bar_duration * (count - 1 - i) as i32;
            let open = prev_close;
            let wiggle: f64 = state.rng.gen_range(0.0..0.002);
            candles.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp,
                open,
                high: open.max(close) * (1.0 + wiggle),
                low: open.min(close) * (1.0 - wiggle),
                close,
                volume: state.rng.gen_range(500.0..5000.0),
            });
            prev_close = close;
        }

        Ok(candles)
    }

    async fn subscribe(&self, symbol: &str, callback: QuoteCallback) -> BrokerResult<()> {
        self.ensure_connected()?;
        let mut state = self.state.lock().unwrap();
        state.subscribers.insert(symbol.to_string(), callback);
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> BrokerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.subscribers.remove(symbol);
        Ok(())
    }
}
