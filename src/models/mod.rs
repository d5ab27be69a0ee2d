use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Bar granularities, ordered shortest to longest.
///
/// The ordering is the progression ladder: a position that confirms its
/// target on one timeframe advances to the next one up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    /// All timeframes, shortest to longest.
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    /// Next timeframe up the ladder, or None at the top.
    pub fn next(self) -> Option<Timeframe> {
        let idx = Self::ALL.iter().position(|tf| *tf == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    /// Bar duration.
    pub fn duration(self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
            Timeframe::W1 => Duration::weeks(1),
        }
    }

    /// How often the market-data loop refreshes bars for this timeframe.
    /// Shorter timeframes are polled more often.
    pub fn poll_interval(self) -> std::time::Duration {
        let secs = match self {
            Timeframe::M1 => 10,
            Timeframe::M5 => 30,
            Timeframe::M15 => 60,
            Timeframe::M30 => 120,
            Timeframe::H1 => 300,
            Timeframe::H4 => 900,
            Timeframe::D1 => 1800,
            Timeframe::W1 => 3600,
        };
        std::time::Duration::from_secs(secs)
    }

    /// How often the signal loop re-evaluates the strategy for this
    /// timeframe. Coarser than the data poll so signals see settled bars.
    pub fn signal_interval(self) -> std::time::Duration {
        self.poll_interval() * 3
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            "1w" => Ok(Timeframe::W1),
            other => Err(format!("Unknown timeframe: {}", other)),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for long, -1.0 for short. Turns direction-conditional price
    /// arithmetic into a multiply.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
        }
    }
}

/// OHLCV bar for one (symbol, timeframe) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// An intent to enter, produced by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySignal {
    pub entry_time: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Next timeframe up the ladder to confirm continuation against
    pub target_timeframe: Option<Timeframe>,
    /// Scales the per-trade account risk, clamped to [0, 1]
    pub risk_factor: f64,
}

/// One progression step: a target confirmed on some timeframe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetHit {
    pub timeframe: Timeframe,
    pub price: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TargetHit,
    ForceClosed,
}

/// The unit of risk currently held or closed.
///
/// Created by the ledger on signal acceptance, mutated only by its
/// management pass, frozen once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    /// Current timeframe; advances up the ladder under progression
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub size: f64,
    pub initial_stop: f64,
    pub stop: f64,
    pub target: f64,
    pub target_timeframe: Option<Timeframe>,
    /// Currency at stake at entry (size x stop distance)
    pub risk_amount: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub profit_loss: f64,
    pub profit_loss_pct: f64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
    pub targets_hit: Vec<TargetHit>,
    pub status: PositionStatus,
    pub exit_price: Option<f64>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    /// Broker order id once placement succeeded
    pub order_id: Option<String>,
    pub order_status: Option<crate::broker::OrderStatus>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// One point of the append-only equity curve
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: DateTime<Utc>,
    pub balance: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_ordering() {
        assert!(Timeframe::M1 < Timeframe::M5);
        assert!(Timeframe::H4 < Timeframe::D1);
        assert!(Timeframe::D1 < Timeframe::W1);
    }

    #[test]
    fn test_timeframe_next_walks_the_ladder() {
        assert_eq!(Timeframe::M1.next(), Some(Timeframe::M5));
        assert_eq!(Timeframe::M30.next(), Some(Timeframe::H1));
        assert_eq!(Timeframe::D1.next(), Some(Timeframe::W1));
        assert_eq!(Timeframe::W1.next(), None);
    }

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            let parsed: Timeframe = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
        assert!("3m".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_poll_interval_scales_with_granularity() {
        let mut prev = std::time::Duration::ZERO;
        for tf in Timeframe::ALL {
            assert!(tf.poll_interval() > prev);
            prev = tf.poll_interval();
        }
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Long.sign(), 1.0);
        assert_eq!(Direction::Short.sign(), -1.0);
    }
}
