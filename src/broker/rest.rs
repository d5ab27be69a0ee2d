use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use super::{
    AccountInfo, Broker, BrokerError, BrokerPosition, BrokerResult, MarketData, MarketDataKind,
    Order, OrderBook, OrderRequest, OrderStatus, OrderUpdate, Quote, QuoteCallback,
};
use crate::models::{Candle, Timeframe};

const RATE_LIMIT_RPM: u32 = 120;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;
const QUOTE_POLL_SECS: u64 = 2;

type GatewayRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Bar as the gateway serves it; symbol and timeframe come from the request
#[derive(Debug, Deserialize)]
struct HistoryBar {
    time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// Vendor-neutral REST gateway adapter for the broker contract.
///
/// Talks JSON to an order-routing gateway; vendor wire protocols live
/// behind that gateway, not here. Cloneable: all clones share one HTTP
/// client and rate limiter.
#[derive(Clone)]
pub struct RestBroker {
    client: Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<GatewayRateLimiter>,
    pollers: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl RestBroker {
    pub fn new(base_url: &str, api_key: &str) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
            pollers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> BrokerResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BrokerError::Api {
            status: status.as_u16(),
            message,
        })
    }

    /// Rate-limited GET with retry and exponential backoff. Only used for
    /// idempotent reads; order placement never retries.
    async fn get_with_retry(&self, url: &str) -> BrokerResult<reqwest::Response> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self
                .client
                .get(url)
                .bearer_auth(&self.api_key)
                .send()
                .await
            {
                Ok(response) => return Self::check(response).await,
                Err(e) => {
                    last_error = Some(BrokerError::Network(e.to_string()));
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            "Gateway GET attempt {}/{} failed ({}), retrying in {}ms",
                            attempt,
                            MAX_RETRIES,
                            url,
                            backoff_ms
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BrokerError::Network("all retries failed".to_string())))
    }

    async fn send_json<T: serde::Serialize>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&T>,
    ) -> BrokerResult<reqwest::Response> {
        self.rate_limiter.until_ready().await;
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Self::check(response).await
    }
}

#[async_trait]
impl Broker for RestBroker {
    async fn connect(&self) -> BrokerResult<bool> {
        self.send_json::<()>(reqwest::Method::POST, &self.url("/session"), None)
            .await?;
        tracing::info!(gateway = %self.base_url, "Gateway session opened");
        Ok(true)
    }

    async fn disconnect(&self) -> BrokerResult<bool> {
        // Stop quote pollers before tearing the session down
        let handles: Vec<JoinHandle<()>> = {
            let mut pollers = self.pollers.lock().unwrap();
            pollers.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.abort();
        }

        self.send_json::<()>(reqwest::Method::DELETE, &self.url("/session"), None)
            .await?;
        Ok(true)
    }

    async fn get_account_info(&self) -> BrokerResult<AccountInfo> {
        let response = self.get_with_retry(&self.url("/account")).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn get_positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        let response = self.get_with_retry(&self.url("/positions")).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn get_orders(&self, status: Option<OrderStatus>) -> BrokerResult<Vec<Order>> {
        let url = match status {
            Some(status) => format!(
                "{}?status={}",
                self.url("/orders"),
                serde_json::to_string(&status)
                    .unwrap_or_default()
                    .trim_matches('"')
            ),
            None => self.url("/orders"),
        };
        let response = self.get_with_retry(&url).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        let response = self
            .send_json(reqwest::Method::POST, &self.url("/orders"), Some(&request))
            .await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
        let url = format!("{}/{}", self.url("/orders"), order_id);
        match self
            .send_json::<()>(reqwest::Method::DELETE, &url, None)
            .await
        {
            Ok(_) => Ok(true),
            Err(BrokerError::Api { status: 404, .. }) => {
                Err(BrokerError::NotFound(order_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn modify_order(&self, order_id: &str, update: OrderUpdate) -> BrokerResult<Order> {
        let url = format!("{}/{}", self.url("/orders"), order_id);
        let response = self
            .send_json(reqwest::Method::PATCH, &url, Some(&update))
            .await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<Order> {
        let url = format!("{}/{}", self.url("/orders"), order_id);
        match self.get_with_retry(&url).await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| BrokerError::Network(e.to_string())),
            Err(BrokerError::Api { status: 404, .. }) => {
                Err(BrokerError::NotFound(order_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_market_data(
        &self,
        symbol: &str,
        kind: MarketDataKind,
    ) -> BrokerResult<MarketData> {
        match kind {
            MarketDataKind::Quote => {
                let url = format!("{}/marketdata/{}/quote", self.base_url, symbol);
                let response = self.get_with_retry(&url).await?;
                let quote: Quote = response
                    .json()
                    .await
                    .map_err(|e| BrokerError::Network(e.to_string()))?;
                Ok(MarketData::Quote(quote))
            }
            MarketDataKind::OrderBook => {
                let url = format!("{}/marketdata/{}/book", self.base_url, symbol);
                let response = self.get_with_retry(&url).await?;
                let book: OrderBook = response
                    .json()
                    .await
                    .map_err(|e| BrokerError::Network(e.to_string()))?;
                Ok(MarketData::OrderBook(book))
            }
        }
    }

    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BrokerResult<Vec<Candle>> {
        let url = format!(
            "{}/history/{}?timeframe={}&start={}&end={}",
            self.base_url,
            symbol,
            timeframe,
            start.to_rfc3339(),
            end.to_rfc3339()
        );
        let response = self.get_with_retry(&url).await?;
        let bars: Vec<HistoryBar> = response
            .json()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        Ok(bars
            .into_iter()
            .map(|bar| Candle {
                symbol: symbol.to_string(),
                timeframe,
                timestamp: bar.time,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            })
            .collect())
    }

    /// The gateway is plain REST, so subscriptions poll the quote endpoint
    /// on a fixed cadence.
    async fn subscribe(&self, symbol: &str, callback: QuoteCallback) -> BrokerResult<()> {
        let this = self.clone();
        let symbol_owned = symbol.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match this
                    .get_market_data(&symbol_owned, MarketDataKind::Quote)
                    .await
                {
                    Ok(MarketData::Quote(quote)) => callback(quote),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(symbol = %symbol_owned, "Quote poll failed: {}", e);
                    }
                }
                sleep(Duration::from_secs(QUOTE_POLL_SECS)).await;
            }
        });

        let mut pollers = self.pollers.lock().unwrap();
        if let Some(previous) = pollers.insert(symbol.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbol: &str) -> BrokerResult<()> {
        let mut pollers = self.pollers.lock().unwrap();
        if let Some(handle) = pollers.remove(symbol) {
            handle.abort();
        }
        Ok(())
    }
}
