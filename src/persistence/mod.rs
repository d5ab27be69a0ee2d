use crate::models::{Candle, Timeframe};
use crate::Result;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Duration};

/// Bar payload as stored; symbol and timeframe live in the key
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredBar {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Redis persistence for fetched bars.
///
/// One sorted set per (symbol, timeframe), scored by bar timestamp, so
/// time-range loads and cleanup are range operations.
pub struct RedisBarStore {
    conn: ConnectionManager,
}

impl RedisBarStore {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Bounded connection attempt so startup cannot hang on Redis
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| "Redis connection timeout after 5 seconds")??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    fn key(symbol: &str, timeframe: Timeframe) -> String {
        format!("bars:{}:{}", symbol, timeframe)
    }

    /// Save bars, replacing any entry already stored at the same score
    pub async fn save_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Candle],
    ) -> Result<()> {
        let key = Self::key(symbol, timeframe);

        for bar in bars {
            let stored = StoredBar {
                timestamp: bar.timestamp,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            };

            let value = serde_json::to_string(&stored)?;
            let score = bar.timestamp.timestamp() as f64;

            self.conn.zadd::<_, _, _, ()>(&key, value, score).await?;
        }

        tracing::debug!(
            "Saved {} bars for {}:{} to Redis",
            bars.len(),
            symbol,
            timeframe
        );

        Ok(())
    }

    /// Load bars newer than `hours_back`, oldest first
    pub async fn load_bars(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        hours_back: u64,
    ) -> Result<Vec<Candle>> {
        let key = Self::key(symbol, timeframe);

        let cutoff = Utc::now() - chrono::Duration::hours(hours_back as i64);
        let min_score = cutoff.timestamp() as f64;

        let results: Vec<String> = self.conn.zrangebyscore(&key, min_score, "+inf").await?;

        let mut bars = Vec::with_capacity(results.len());
        for json_str in results {
            let stored: StoredBar = serde_json::from_str(&json_str)?;
            bars.push(Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp: stored.timestamp,
                open: stored.open,
                high: stored.high,
                low: stored.low,
                close: stored.close,
                volume: stored.volume,
            });
        }

        tracing::debug!(
            "Loaded {} bars for {}:{} from Redis",
            bars.len(),
            symbol,
            timeframe
        );

        Ok(bars)
    }

    /// Drop bars older than `keep_hours` to bound growth
    pub async fn cleanup_old(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        keep_hours: u64,
    ) -> Result<usize> {
        let key = Self::key(symbol, timeframe);

        let cutoff = Utc::now() - chrono::Duration::hours(keep_hours as i64);
        let max_score = cutoff.timestamp() as f64;

        let removed: usize = self
            .conn
            .zrembyscore(&key, "-inf", max_score)
            .await?;

        if removed > 0 {
            tracing::debug!(
                "Removed {} stale bars for {}:{} from Redis",
                removed,
                symbol,
                timeframe
            );
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_test_store() -> RedisBarStore {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBarStore::new(&redis_url)
            .await
            .expect("Failed to connect to test Redis")
    }

    fn test_bar(close: f64, minutes_ago: i64) -> Candle {
        Candle {
            symbol: "ES".to_string(),
            timeframe: Timeframe::M5,
            timestamp: Utc::now() - chrono::Duration::minutes(minutes_ago),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_save_and_load_bars() {
        let mut store = get_test_store().await;

        let bars = vec![test_bar(5000.0, 10), test_bar(5001.0, 5), test_bar(5002.0, 0)];
        store.save_bars("ES", Timeframe::M5, &bars).await.unwrap();

        let loaded = store.load_bars("ES", Timeframe::M5, 1).await.unwrap();
        assert!(loaded.len() >= 3);
        assert_eq!(loaded.last().unwrap().close, 5002.0);
        assert_eq!(loaded.last().unwrap().timeframe, Timeframe::M5);

        store.cleanup_old("ES", Timeframe::M5, 0).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    async fn test_cleanup_removes_stale_bars() {
        let mut store = get_test_store().await;

        let old_bar = test_bar(4900.0, 60 * 100);
        store
            .save_bars("ES_CLEANUP", Timeframe::M5, &[old_bar])
            .await
            .unwrap();

        let removed = store
            .cleanup_old("ES_CLEANUP", Timeframe::M5, 48)
            .await
            .unwrap();
        assert!(removed >= 1);
    }
}
