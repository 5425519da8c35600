use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};
use tradebot_core::{ExchangeError, Ticker, TickerSource};

const TICKERS_PATH: &str = "/v5/market/tickers";

/// Connection settings for the Bybit market endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BybitConfig {
    /// REST base URL (mainnet or testnet).
    pub base_url: String,
    /// Product category: `inverse`, `linear` or `spot`.
    pub category: String,
    pub symbol: String,
    pub timeout_secs: u64,
}

impl Default for BybitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bybit.com".to_string(),
            category: "inverse".to_string(),
            symbol: "BTCUSD".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Fetches the ticker of one symbol from Bybit's public API.
pub struct BybitTickerClient {
    client: Client,
    config: BybitConfig,
}

impl BybitTickerClient {
    pub fn new(config: BybitConfig) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), TICKERS_PATH)
    }
}

#[async_trait]
impl TickerSource for BybitTickerClient {
    async fn ticker(&self) -> Result<Ticker, ExchangeError> {
        let response = self
            .client
            .get(self.url())
            .query(&[
                ("category", self.config.category.as_str()),
                ("symbol", self.config.symbol.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        if !status.is_success() {
            warn!(%status, "Bybit ticker request failed");
            return Err(ExchangeError::Api {
                code: i64::from(status.as_u16()),
                message: text,
            });
        }

        let ticker = parse_ticker_response(&text, &self.config.symbol)?;
        debug!(symbol = %ticker.symbol, last = %ticker.last_price, "Fetched ticker");
        Ok(ticker)
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Bybit wraps responses in `{ retCode, retMsg, result, time }`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitResponse<T> {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<T>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Deserialize)]
struct TickerList {
    #[serde(default)]
    list: Vec<BybitTicker>,
}

/// Prices arrive as strings; some are empty for categories that lack them.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    symbol: String,
    last_price: String,
    #[serde(default, rename = "bid1Price")]
    bid_price: String,
    #[serde(default, rename = "ask1Price")]
    ask_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    index_price: String,
}

fn parse_price(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::Parse(format!("{field} = {value:?}: {e}")))
}

fn parse_optional_price(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    if value.is_empty() {
        Ok(Decimal::ZERO)
    } else {
        parse_price(field, value)
    }
}

/// Decode a `/v5/market/tickers` body into the first ticker of the list.
pub fn parse_ticker_response(body: &str, symbol: &str) -> Result<Ticker, ExchangeError> {
    let response: BybitResponse<TickerList> = serde_json::from_str(body)
        .map_err(|e| ExchangeError::Parse(format!("{e} | body: {body}")))?;

    if response.ret_code != 0 {
        return Err(ExchangeError::Api {
            code: response.ret_code,
            message: response.ret_msg,
        });
    }

    let raw = response
        .result
        .and_then(|r| r.list.into_iter().next())
        .ok_or_else(|| ExchangeError::EmptyTicker(symbol.to_string()))?;

    let timestamp = response
        .time
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    Ok(Ticker {
        last_price: parse_price("lastPrice", &raw.last_price)?,
        bid_price: parse_optional_price("bid1Price", &raw.bid_price)?,
        ask_price: parse_optional_price("ask1Price", &raw.ask_price)?,
        mark_price: parse_optional_price("markPrice", &raw.mark_price)?,
        index_price: parse_optional_price("indexPrice", &raw.index_price)?,
        symbol: raw.symbol,
        timestamp,
    })
}
