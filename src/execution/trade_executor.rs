use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::monitor::PerformanceMonitor;
use crate::models::{
    Candle, Direction, EntrySignal, EquityPoint, ExitReason, Position, PositionStatus, TargetHit,
    Timeframe,
};
use crate::risk::{RiskSettings, StopPolicy};

/// Relative buffer when the stop trails the last confirmed target
const PREVIOUS_TARGET_BUFFER: f64 = 0.001;

/// Why a signal produced no position. Soft outcomes: callers must not
/// retry automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TradeLimitReached,
    TimeframeOccupied,
    DirectionConflict,
    DegenerateStopDistance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDecision {
    Accepted(Uuid),
    Rejected(RejectReason),
}

/// Latest market context for one symbol: one bar per active timeframe,
/// plus whatever indicator values could be derived from the cache.
#[derive(Debug, Clone, Default)]
pub struct MarketView {
    pub bars: HashMap<Timeframe, Candle>,
    pub ema: HashMap<Timeframe, f64>,
    pub atr: HashMap<Timeframe, f64>,
}

/// Aggregate performance derived on demand from closed trades and the
/// equity curve
#[derive(Debug, Clone)]
pub struct PerformanceMetrics {
    pub balance: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub max_drawdown_pct: f64,
}

/// What one management tick did to one position
#[derive(Debug, Default)]
struct TickOutcome {
    progressed: bool,
    closed_pnl: Option<f64>,
}

/// Position ledger for one symbol and one account.
///
/// Owns the open and closed position sets and the account balance. The
/// balance changes exactly once per close; every balance change appends
/// an equity point.
pub struct TradeExecutor {
    symbol: String,
    settings: RiskSettings,
    balance: f64,
    equity_curve: Vec<EquityPoint>,
    positions: Vec<Position>,
    monitor: PerformanceMonitor,
}

impl TradeExecutor {
    pub fn new(symbol: &str, initial_balance: f64, settings: RiskSettings) -> Self {
        Self {
            symbol: symbol.to_string(),
            settings,
            balance: initial_balance,
            equity_curve: vec![EquityPoint {
                time: Utc::now(),
                balance: initial_balance,
            }],
            positions: Vec::new(),
            monitor: PerformanceMonitor::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn open_positions(&self) -> Vec<&Position> {
        self.positions.iter().filter(|p| p.is_open()).collect()
    }

    pub fn closed_positions(&self) -> Vec<&Position> {
        self.positions.iter().filter(|p| !p.is_open()).collect()
    }

    pub fn position(&self, id: Uuid) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == id)
    }

    /// Evaluate an entry signal against the trade limits and, if it
    /// passes, open a risk-sized position. No broker interaction happens
    /// here; the orchestrator places the order afterwards.
    pub fn process_signal(
        &mut self,
        signal: &EntrySignal,
        latest_bars: &HashMap<Timeframe, Candle>,
    ) -> SignalDecision {
        self.monitor.incr("signals_processed");

        if let Some(reason) = self.check_limits(signal) {
            self.monitor.incr("signals_rejected");
            tracing::info!(
                symbol = %self.symbol,
                timeframe = %signal.timeframe,
                ?reason,
                "Signal rejected"
            );
            return SignalDecision::Rejected(reason);
        }

        let stop_distance = (signal.entry_price - signal.stop_price).abs();
        if stop_distance <= 0.0 || signal.entry_price <= 0.0 {
            self.monitor.incr("signals_rejected");
            return SignalDecision::Rejected(RejectReason::DegenerateStopDistance);
        }

        // Risk-based size, capped by maximum position value
        let mut risk_amount = self.balance * self.settings.risk_fraction(signal.risk_factor);
        let mut size = risk_amount / stop_distance;
        let max_size = self.settings.max_position_value(self.balance) / signal.entry_price;
        if size > max_size {
            size = max_size;
            risk_amount = size * stop_distance;
        }

        let current_price = latest_bars
            .get(&signal.timeframe)
            .map(|bar| bar.close)
            .unwrap_or(signal.entry_price);

        let position = Position {
            id: Uuid::new_v4(),
            symbol: self.symbol.clone(),
            timeframe: signal.timeframe,
            direction: signal.direction,
            entry_time: signal.entry_time,
            entry_price: signal.entry_price,
            size,
            initial_stop: signal.stop_price,
            stop: signal.stop_price,
            target: signal.target_price,
            target_timeframe: signal.target_timeframe,
            risk_amount,
            current_price,
            market_value: size * current_price,
            profit_loss: (current_price - signal.entry_price) * size * signal.direction.sign(),
            profit_loss_pct: 0.0,
            max_favorable_excursion: 0.0,
            max_adverse_excursion: 0.0,
            targets_hit: Vec::new(),
            status: PositionStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            order_id: None,
            order_status: None,
        };

        let id = position.id;
        tracing::info!(
            symbol = %self.symbol,
            timeframe = %signal.timeframe,
            direction = %signal.direction,
            size,
            risk_amount,
            "Opened position {}",
            id
        );

        self.positions.push(position);
        self.monitor.incr("positions_opened");
        SignalDecision::Accepted(id)
    }

    fn check_limits(&self, signal: &EntrySignal) -> Option<RejectReason> {
        let open: Vec<&Position> = self.positions.iter().filter(|p| p.is_open()).collect();

        if open.len() >= self.settings.max_concurrent_trades {
            return Some(RejectReason::TradeLimitReached);
        }
        if open.iter().any(|p| p.timeframe == signal.timeframe) {
            return Some(RejectReason::TimeframeOccupied);
        }
        if !self.settings.allow_mixed_directions
            && open.iter().any(|p| p.direction != signal.direction)
        {
            return Some(RejectReason::DirectionConflict);
        }
        None
    }

    /// One management tick over every open position, using each
    /// position's current-timeframe bar from the view.
    ///
    /// A failure managing one position is logged and does not stop the
    /// pass for the rest.
    pub fn manage(&mut self, view: &MarketView) {
        let started = Instant::now();
        let mut closes: Vec<(Uuid, f64)> = Vec::new();

        for position in self.positions.iter_mut().filter(|p| p.is_open()) {
            match Self::manage_position(position, view, &self.settings) {
                Ok(outcome) => {
                    if outcome.progressed {
                        self.monitor.incr("target_progressions");
                    }
                    if let Some(pnl) = outcome.closed_pnl {
                        closes.push((position.id, pnl));
                    }
                }
                Err(e) => {
                    tracing::error!(
                        symbol = %self.symbol,
                        position = %position.id,
                        "Management failed: {:#}",
                        e
                    );
                }
            }
        }

        for (id, pnl) in closes {
            self.settle_close(id, pnl);
        }

        self.monitor.record_duration("manage_pass", started.elapsed());
    }

    /// Apply a close's P&L to the balance exactly once and record it
    fn settle_close(&mut self, id: Uuid, pnl: f64) {
        self.balance += pnl;

        let (time, reason) = self
            .positions
            .iter()
            .find(|p| p.id == id)
            .map(|p| (p.exit_time.unwrap_or_else(Utc::now), p.exit_reason))
            .unwrap_or((Utc::now(), None));

        self.equity_curve.push(EquityPoint {
            time,
            balance: self.balance,
        });

        self.monitor.incr("positions_closed");
        match reason {
            Some(ExitReason::StopLoss) => self.monitor.incr("stop_losses"),
            Some(ExitReason::TargetHit) => self.monitor.incr("target_hits"),
            Some(ExitReason::ForceClosed) => self.monitor.incr("force_closes"),
            None => {}
        }

        tracing::info!(
            symbol = %self.symbol,
            position = %id,
            pnl,
            balance = self.balance,
            "Position closed"
        );
    }

    fn manage_position(
        position: &mut Position,
        view: &MarketView,
        settings: &RiskSettings,
    ) -> anyhow::Result<TickOutcome> {
        let mut outcome = TickOutcome::default();

        // No bar cached yet for this timeframe: skip this tick only
        let bar = match view.bars.get(&position.timeframe) {
            Some(bar) => bar.clone(),
            None => return Ok(outcome),
        };

        let sign = position.direction.sign();

        position.current_price = bar.close;
        position.market_value = position.size * bar.close;
        position.profit_loss = (bar.close - position.entry_price) * position.size * sign;
        let denominator = position.entry_price * position.size;
        if denominator != 0.0 {
            position.profit_loss_pct = position.profit_loss / denominator;
        }

        // Stop first: a bar that pierces both stop and target is treated
        // as stopped
        let stopped = match position.direction {
            Direction::Long => bar.low <= position.stop,
            Direction::Short => bar.high >= position.stop,
        };
        if stopped {
            let stop_price = position.stop;
            let pnl = Self::close(position, stop_price, bar.timestamp, ExitReason::StopLoss);
            outcome.closed_pnl = Some(pnl);
            return Ok(outcome);
        }

        let target_hit = match position.direction {
            Direction::Long => bar.high >= position.target,
            Direction::Short => bar.low <= position.target,
        };
        if target_hit {
            match position.target_timeframe {
                Some(next_tf) if settings.use_progressive_targeting => {
                    Self::progress(position, next_tf, &bar, view, settings);
                    outcome.progressed = true;
                }
                _ => {
                    let target_price = position.target;
                    let pnl =
                        Self::close(position, target_price, bar.timestamp, ExitReason::TargetHit);
                    outcome.closed_pnl = Some(pnl);
                    return Ok(outcome);
                }
            }
        }

        // Excursions relative to entry, from the tick's extremes
        let (favorable, adverse) = match position.direction {
            Direction::Long => (
                bar.high - position.entry_price,
                position.entry_price - bar.low,
            ),
            Direction::Short => (
                position.entry_price - bar.low,
                bar.high - position.entry_price,
            ),
        };
        position.max_favorable_excursion = position.max_favorable_excursion.max(favorable.max(0.0));
        position.max_adverse_excursion = position.max_adverse_excursion.max(adverse.max(0.0));

        if settings.use_trailing_stop && position.profit_loss > 0.0 {
            let candidate = Self::trailing_candidate(position, view, settings);
            Self::tighten_stop(position, candidate);
        }

        Ok(outcome)
    }

    /// Advance the position one rung up the ladder: record the confirmed
    /// target, move to the confirming timeframe, derive the next target,
    /// and update the stop per policy. The position stays open.
    fn progress(
        position: &mut Position,
        next_tf: Timeframe,
        bar: &Candle,
        view: &MarketView,
        settings: &RiskSettings,
    ) {
        let confirmed_price = position.target;
        let sign = position.direction.sign();

        position.targets_hit.push(TargetHit {
            timeframe: position.timeframe,
            price: confirmed_price,
            time: bar.timestamp,
        });

        position.timeframe = next_tf;
        position.target_timeframe = next_tf.next();

        // Next target from the confirming timeframe's EMA when it sits
        // beyond the current price in the position's favor; otherwise the
        // reward:risk default applied to the original entry risk.
        let initial_risk = (position.entry_price - position.initial_stop).abs();
        let fallback =
            position.entry_price + sign * settings.reward_risk_ratio * initial_risk;
        position.target = match view.ema.get(&next_tf) {
            Some(&ema) if (ema - position.current_price) * sign > 0.0 => ema,
            _ => fallback,
        };

        let stop_candidate = match settings.target_hit_stop_policy {
            StopPolicy::Breakeven => position.entry_price,
            StopPolicy::PreviousTarget => {
                confirmed_price * (1.0 - sign * PREVIOUS_TARGET_BUFFER)
            }
            StopPolicy::Trailing => Self::trailing_candidate(position, view, settings),
        };
        Self::tighten_stop(position, stop_candidate);

        tracing::info!(
            symbol = %position.symbol,
            position = %position.id,
            timeframe = %position.timeframe,
            target = position.target,
            stop = position.stop,
            "Target confirmed, progressed"
        );
    }

    /// Trailing stop from an ATR multiple when an ATR value exists for
    /// the position's timeframe, else a minimum-distance percentage from
    /// the current price.
    fn trailing_candidate(
        position: &Position,
        view: &MarketView,
        settings: &RiskSettings,
    ) -> f64 {
        let sign = position.direction.sign();
        match view.atr.get(&position.timeframe) {
            Some(&atr) => position.current_price - sign * atr * settings.trailing_stop_atr_multiple,
            None => {
                position.current_price
                    * (1.0 - sign * settings.trailing_stop_min_distance_percent / 100.0)
            }
        }
    }

    /// The stop only ever moves in the position's favor
    fn tighten_stop(position: &mut Position, candidate: f64) {
        match position.direction {
            Direction::Long => position.stop = position.stop.max(candidate),
            Direction::Short => position.stop = position.stop.min(candidate),
        }
    }

    fn close(
        position: &mut Position,
        exit_price: f64,
        time: DateTime<Utc>,
        reason: ExitReason,
    ) -> f64 {
        let sign = position.direction.sign();
        let pnl = (exit_price - position.entry_price) * position.size * sign;

        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(time);
        position.exit_reason = Some(reason);
        position.current_price = exit_price;
        position.market_value = position.size * exit_price;
        position.profit_loss = pnl;
        let denominator = position.entry_price * position.size;
        if denominator != 0.0 {
            position.profit_loss_pct = pnl / denominator;
        }

        pnl
    }

    /// External close (reconciliation or shutdown). Same settlement rules
    /// as a managed close.
    pub fn force_close(
        &mut self,
        id: Uuid,
        exit_price: f64,
        time: DateTime<Utc>,
    ) -> anyhow::Result<Position> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow::anyhow!("Position {} not found", id))?;

        if !position.is_open() {
            anyhow::bail!("Position {} already closed", id);
        }

        let pnl = Self::close(position, exit_price, time, ExitReason::ForceClosed);
        let snapshot = position.clone();
        self.settle_close(id, pnl);
        Ok(snapshot)
    }

    /// Stamp a position with the broker order it maps to
    pub fn set_order(
        &mut self,
        id: Uuid,
        order_id: &str,
        status: crate::broker::OrderStatus,
    ) -> anyhow::Result<()> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| anyhow::anyhow!("Position {} not found", id))?;
        position.order_id = Some(order_id.to_string());
        position.order_status = Some(status);
        Ok(())
    }

    /// Copy back broker-confirmed fields during reconciliation
    pub fn apply_broker_state(
        &mut self,
        id: Uuid,
        current_price: f64,
        market_value: f64,
    ) -> anyhow::Result<()> {
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.id == id && p.is_open())
            .ok_or_else(|| anyhow::anyhow!("Open position {} not found", id))?;

        let sign = position.direction.sign();
        position.current_price = current_price;
        position.market_value = market_value;
        position.profit_loss = (current_price - position.entry_price) * position.size * sign;
        let denominator = position.entry_price * position.size;
        if denominator != 0.0 {
            position.profit_loss_pct = position.profit_loss / denominator;
        }
        Ok(())
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let closed: Vec<&Position> = self.closed_positions();
        let total_trades = closed.len();

        let gross_profit: f64 = closed
            .iter()
            .filter(|p| p.profit_loss > 0.0)
            .map(|p| p.profit_loss)
            .sum();
        let gross_loss: f64 = closed
            .iter()
            .filter(|p| p.profit_loss <= 0.0)
            .map(|p| p.profit_loss.abs())
            .sum();

        let winning_trades = closed.iter().filter(|p| p.profit_loss > 0.0).count();
        let losing_trades = total_trades - winning_trades;

        let win_rate = if total_trades > 0 {
            (winning_trades as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        PerformanceMetrics {
            balance: self.balance,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            gross_profit,
            gross_loss,
            profit_factor,
            max_drawdown_pct: max_drawdown_pct(&self.equity_curve),
        }
    }
}

/// Running maximum peak-to-trough decline over an equity curve, as a
/// percentage of the peak.
pub fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0_f64;

    for point in curve {
        if point.balance > peak {
            peak = point.balance;
        }
        if peak > 0.0 {
            let drawdown = (peak - point.balance) / peak;
            max_dd = max_dd.max(drawdown);
        }
    }

    max_dd * 100.0
}
