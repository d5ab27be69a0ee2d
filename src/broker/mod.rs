// Broker contract: the sole network-facing boundary of the engine.
// Vendor adapters implement `Broker`; the engine treats every call as a
// slow, fallible network operation.
pub mod paper;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Candle, Timeframe};

pub use paper::PaperBroker;
pub use rest::RestBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("network error: {0}")]
    Network(String),
    #[error("broker api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("not connected")]
    NotConnected,
    #[error("order rejected: {0}")]
    OrderRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Working,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Day,
    GoodTillCancelled,
    ImmediateOrCancel,
    FillOrKill,
}

/// Order placement request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Market order helper, the shape the execution loop places
    pub fn market(symbol: &str, quantity: f64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            quantity,
            side,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
        }
    }
}

/// Fields that can change on a working order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub quantity: Option<f64>,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
}

/// Broker-side order record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub time_in_force: TimeInForce,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub available: f64,
    pub margin_used: f64,
}

/// Position as the broker reports it; matched against ledger positions
/// by symbol and order id during reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: f64,
    pub side: OrderSide,
    pub average_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketDataKind {
    Quote,
    OrderBook,
}

#[derive(Debug, Clone)]
pub enum MarketData {
    Quote(Quote),
    OrderBook(OrderBook),
}

pub type QuoteCallback = Arc<dyn Fn(Quote) + Send + Sync>;

/// Capability interface every broker adapter satisfies.
///
/// Each operation may block on network I/O and fail; callers own retry and
/// backoff policy.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> BrokerResult<bool>;
    async fn disconnect(&self) -> BrokerResult<bool>;

    async fn get_account_info(&self) -> BrokerResult<AccountInfo>;
    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>>;
    async fn get_orders(&self, status: Option<OrderStatus>) -> BrokerResult<Vec<Order>>;

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order>;
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool>;
    async fn modify_order(&self, order_id: &str, update: OrderUpdate) -> BrokerResult<Order>;
    async fn get_order_status(&self, order_id: &str) -> BrokerResult<Order>;

    async fn get_market_data(&self, symbol: &str, kind: MarketDataKind)
        -> BrokerResult<MarketData>;
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>>;

    async fn subscribe(&self, symbol: &str, callback: QuoteCallback) -> BrokerResult<()>;
    async fn unsubscribe(&self, symbol: &str) -> BrokerResult<()>;
}
