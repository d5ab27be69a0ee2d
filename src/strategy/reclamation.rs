use super::Strategy;
use crate::indicators::calculate_ema;
use crate::models::{Candle, Direction, EntrySignal};
use crate::Result;

/// EMA extension/reclamation entries.
///
/// Arms when price extends beyond the EMA by a configured percentage,
/// fires when price crosses back over it: a downward extension reclaimed
/// upward is a long, an upward extension reclaimed downward is a short.
/// The stop goes behind the recent swing, the initial target at a fixed
/// multiple of the stop distance; the next timeframe up is the first
/// progression rung.
#[derive(Debug, Clone)]
pub struct ReclamationConfig {
    pub ema_period: usize,
    /// Minimum deviation from the EMA, in percent, to arm a setup
    pub extension_percent: f64,
    /// Bars searched for the extension
    pub lookback: usize,
    /// Bars searched for the swing stop
    pub stop_lookback: usize,
    /// Initial target as a multiple of the stop distance
    pub reward_ratio: f64,
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            ema_period: 21,
            extension_percent: 2.0,
            lookback: 10,
            stop_lookback: 5,
            reward_ratio: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReclamationStrategy {
    config: ReclamationConfig,
}

impl ReclamationStrategy {
    pub fn new(config: ReclamationConfig) -> Self {
        Self { config }
    }
}

impl Strategy for ReclamationStrategy {
    fn generate_signal(&self, candles: &[Candle]) -> Result<Option<EntrySignal>> {
        if candles.len() < self.min_candles_required() {
            return Err(format!(
                "Insufficient data: {} candles, need {}",
                candles.len(),
                self.min_candles_required()
            )
            .into());
        }

        let last = &candles[candles.len() - 1];
        let prev_close = candles[candles.len() - 2].close;

        // EMA of everything before the reclaiming bar, so the cross is
        // measured against where the average stood
        let closes: Vec<f64> = candles[..candles.len() - 1]
            .iter()
            .map(|c| c.close)
            .collect();
        let ema = calculate_ema(&closes, self.config.ema_period)
            .ok_or("Failed to compute EMA over lookback window")?;

        let window_start = candles.len().saturating_sub(self.config.lookback + 1);
        let window = &candles[window_start..candles.len() - 1];
        let extension = self.config.extension_percent / 100.0;

        let armed_long = window.iter().any(|c| c.close <= ema * (1.0 - extension));
        let armed_short = window.iter().any(|c| c.close >= ema * (1.0 + extension));

        let swing = &candles[candles.len().saturating_sub(self.config.stop_lookback)..];

        if armed_long && prev_close <= ema && last.close > ema {
            let stop = swing.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
            if stop >= last.close {
                return Ok(None);
            }
            return Ok(Some(self.build_signal(last, Direction::Long, stop)));
        }

        if armed_short && prev_close >= ema && last.close < ema {
            let stop = swing.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
            if stop <= last.close {
                return Ok(None);
            }
            return Ok(Some(self.build_signal(last, Direction::Short, stop)));
        }

        Ok(None)
    }

    fn name(&self) -> &str {
        "ReclamationStrategy"
    }

    fn min_candles_required(&self) -> usize {
        self.config.ema_period + self.config.lookback + 1
    }
}

impl ReclamationStrategy {
    fn build_signal(&self, last: &Candle, direction: Direction, stop: f64) -> EntrySignal {
        let entry = last.close;
        let risk = (entry - stop).abs();
        let target = entry + direction.sign() * self.config.reward_ratio * risk;

        tracing::debug!(
            symbol = %last.symbol,
            timeframe = %last.timeframe,
            %direction,
            entry,
            stop,
            target,
            "Reclamation signal"
        );

        EntrySignal {
            entry_time: last.timestamp,
            timeframe: last.timeframe,
            direction,
            entry_price: entry,
            stop_price: stop,
            target_price: target,
            target_timeframe: last.timeframe.next(),
            risk_factor: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::Utc;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                symbol: "ES".to_string(),
                timeframe: Timeframe::H1,
                timestamp: Utc::now()
                    - chrono::Duration::hours((closes.len() - i) as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1000.0,
            })
            .collect()
    }

    fn small_config() -> ReclamationConfig {
        ReclamationConfig {
            ema_period: 5,
            extension_percent: 2.0,
            lookback: 3,
            stop_lookback: 5,
            reward_ratio: 1.5,
        }
    }

    #[test]
    fn test_insufficient_data_is_an_error() {
        let strategy = ReclamationStrategy::default();
        let candles = candles_from_closes(&[100.0, 101.0]);
        assert!(strategy.generate_signal(&candles).is_err());
    }

    #[test]
    fn test_flat_market_produces_nothing() {
        let strategy = ReclamationStrategy::new(small_config());
        let candles = candles_from_closes(&[100.0; 12]);
        assert!(strategy.generate_signal(&candles).unwrap().is_none());
    }

    #[test]
    fn test_downward_extension_reclaimed_is_long() {
        let strategy = ReclamationStrategy::new(small_config());
        // Steady, then extends below the EMA, then reclaims it
        let closes = [
            100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 95.0, 95.0, 101.0,
        ];
        let candles = candles_from_closes(&closes);

        let signal = strategy.generate_signal(&candles).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, 101.0);
        // Stop behind the swing low (95 - 1 low wick)
        assert_eq!(signal.stop_price, 94.0);
        // 101 + 1.5 * 7
        assert!((signal.target_price - 111.5).abs() < 1e-9);
        assert_eq!(signal.timeframe, Timeframe::H1);
        assert_eq!(signal.target_timeframe, Some(Timeframe::H4));
    }

    #[test]
    fn test_upward_extension_reclaimed_is_short() {
        let strategy = ReclamationStrategy::new(small_config());
        let closes = [
            100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 105.0, 105.0, 94.0,
        ];
        let candles = candles_from_closes(&closes);

        let signal = strategy.generate_signal(&candles).unwrap().unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.entry_price, 94.0);
        // Stop above the swing high (105 + 1 high wick)
        assert_eq!(signal.stop_price, 106.0);
        assert!(signal.target_price < signal.entry_price);
    }

    #[test]
    fn test_no_signal_without_extension() {
        let strategy = ReclamationStrategy::new(small_config());
        // Dips only 1% below: never armed, so the re-cross is ignored
        let closes = [
            100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 99.0, 99.0, 101.0,
        ];
        let candles = candles_from_closes(&closes);
        assert!(strategy.generate_signal(&candles).unwrap().is_none());
    }
}
