use crate::models::{Candle, Timeframe};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Key for one market-data stream
pub type PairKey = (String, Timeframe);

/// Shared in-memory cache of recent bars, keyed by (symbol, timeframe).
///
/// Written by the market-data loop, read by the signal and execution
/// loops. The lock is held only around the entry read or write, never
/// across a network call.
#[derive(Clone)]
pub struct BarCache {
    data: Arc<RwLock<HashMap<PairKey, Vec<Candle>>>>,
    max_bars: usize,
}

impl BarCache {
    /// # Arguments
    /// * `max_bars` - rolling window size per (symbol, timeframe) pair
    pub fn new(max_bars: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_bars,
        }
    }

    /// Replace the cached bars for a pair with a freshly fetched series,
    /// keeping only the rolling window tail.
    pub fn replace(&self, symbol: &str, timeframe: Timeframe, mut bars: Vec<Candle>) {
        if bars.len() > self.max_bars {
            bars.drain(0..bars.len() - self.max_bars);
        }
        let mut data = self.data.write().unwrap();
        data.insert((symbol.to_string(), timeframe), bars);
    }

    /// All cached bars for a pair, oldest first
    pub fn bars(&self, symbol: &str, timeframe: Timeframe) -> Vec<Candle> {
        let data = self.data.read().unwrap();
        data.get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default()
    }

    /// Most recent bar for a pair
    pub fn latest(&self, symbol: &str, timeframe: Timeframe) -> Option<Candle> {
        let data = self.data.read().unwrap();
        data.get(&(symbol.to_string(), timeframe))
            .and_then(|bars| bars.last().cloned())
    }

    /// Whether at least one bar exists for a pair
    pub fn has_bars(&self, symbol: &str, timeframe: Timeframe) -> bool {
        let data = self.data.read().unwrap();
        data.get(&(symbol.to_string(), timeframe))
            .map(|bars| !bars.is_empty())
            .unwrap_or(false)
    }

    /// Latest bar per timeframe for one symbol
    pub fn latest_by_timeframe(&self, symbol: &str) -> HashMap<Timeframe, Candle> {
        let data = self.data.read().unwrap();
        let mut latest = HashMap::new();
        for ((sym, timeframe), bars) in data.iter() {
            if sym == symbol {
                if let Some(bar) = bars.last() {
                    latest.insert(*timeframe, bar.clone());
                }
            }
        }
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn create_test_bar(symbol: &str, timeframe: Timeframe, close: f64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            timeframe,
            timestamp: Utc::now(),
            open: close,
            high: close * 1.01,
            low: close * 0.99,
            close,
            volume: 1000.0,
        }
    }

    #[test]
    fn test_replace_and_latest() {
        let cache = BarCache::new(100);
        cache.replace(
            "ES",
            Timeframe::M5,
            vec![
                create_test_bar("ES", Timeframe::M5, 100.0),
                create_test_bar("ES", Timeframe::M5, 101.0),
            ],
        );

        assert!(cache.has_bars("ES", Timeframe::M5));
        assert_eq!(cache.latest("ES", Timeframe::M5).unwrap().close, 101.0);
        assert!(cache.latest("ES", Timeframe::H1).is_none());
    }

    #[test]
    fn test_replace_overwrites() {
        let cache = BarCache::new(100);
        cache.replace(
            "ES",
            Timeframe::M5,
            vec![create_test_bar("ES", Timeframe::M5, 100.0)],
        );
        cache.replace(
            "ES",
            Timeframe::M5,
            vec![create_test_bar("ES", Timeframe::M5, 102.0)],
        );

        let bars = cache.bars("ES", Timeframe::M5);
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 102.0);
    }

    #[test]
    fn test_rolling_window_trims_oldest() {
        let cache = BarCache::new(5);
        let bars: Vec<Candle> = (0..10)
            .map(|i| create_test_bar("ES", Timeframe::M5, 100.0 + i as f64))
            .collect();
        cache.replace("ES", Timeframe::M5, bars);

        let kept = cache.bars("ES", Timeframe::M5);
        assert_eq!(kept.len(), 5);
        assert_eq!(kept[0].close, 105.0);
        assert_eq!(kept[4].close, 109.0);
    }

    #[test]
    fn test_latest_by_timeframe() {
        let cache = BarCache::new(100);
        cache.replace(
            "ES",
            Timeframe::M5,
            vec![create_test_bar("ES", Timeframe::M5, 100.0)],
        );
        cache.replace(
            "ES",
            Timeframe::H1,
            vec![create_test_bar("ES", Timeframe::H1, 101.0)],
        );
        cache.replace(
            "NQ",
            Timeframe::M5,
            vec![create_test_bar("NQ", Timeframe::M5, 200.0)],
        );

        let latest = cache.latest_by_timeframe("ES");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&Timeframe::M5].close, 100.0);
        assert_eq!(latest[&Timeframe::H1].close, 101.0);
    }

    #[test]
    fn test_thread_safety() {
        use std::thread;

        let cache = BarCache::new(100);
        let cache_clone = cache.clone();

        let handle = thread::spawn(move || {
            for i in 0..50 {
                cache_clone.replace(
                    "ES",
                    Timeframe::M5,
                    vec![create_test_bar("ES", Timeframe::M5, 100.0 + i as f64)],
                );
            }
        });

        for _ in 0..50 {
            let _ = cache.latest("ES", Timeframe::M5);
        }

        handle.join().unwrap();
        assert!(cache.has_bars("ES", Timeframe::M5));
    }
}
