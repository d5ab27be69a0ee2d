// Trade execution and live orchestration module
pub mod bar_cache;
pub mod live_trader;
pub mod monitor;
pub mod trade_executor;

pub use bar_cache::BarCache;
pub use live_trader::{LiveTrader, LiveTraderConfig};
pub use monitor::PerformanceMonitor;
pub use trade_executor::{
    max_drawdown_pct, MarketView, PerformanceMetrics, RejectReason, SignalDecision, TradeExecutor,
};
