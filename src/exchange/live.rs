//! Live exchange gateway: HMAC-SHA256-signed REST calls over `reqwest`+`rustls`,
//! in the manner of this codebase's existing signed-request client code.

use super::{Balance, Exchange, ExchangeOrder, ExchangeTrade, RateLimiter, Ticker};
use crate::error::ExchangeError;
use crate::ledger::Side;
use crate::market::Candle;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LiveExchange {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    limiter: RateLimiter,
}

impl LiveExchange {
    pub fn new(base_url: impl Into<String>, api_key: String, api_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("building the HTTP client with a static config cannot fail");
        Self {
            client,
            base_url: base_url.into(),
            api_key,
            api_secret,
            limiter: RateLimiter::new(20, 10.0),
        }
    }

    fn wire_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// Signs `query` with HMAC-SHA256 and appends the signature, matching the
    /// canonical-query-string convention used by this family of exchanges.
    fn sign(&self, query: &str) -> Result<String, ExchangeError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| ExchangeError::Transient(format!("bad HMAC key: {e}")))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire().await;

        let timestamp = Utc::now().timestamp_millis();
        params.push(("timestamp".to_string(), timestamp.to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        let url = format!("{}{path}?{query}&signature={signature}", self.base_url);

        debug!(method = %method, path, "sending signed exchange request");
        let resp = self
            .client
            .request(method, &url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        self.interpret(resp).await
    }

    async fn public_request(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire().await;
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        self.interpret(resp).await
    }

    async fn interpret(&self, resp: reqwest::Response) -> Result<serde_json::Value, ExchangeError> {
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ExchangeError::Auth);
        }
        if status.as_u16() == 404 {
            return Err(ExchangeError::NotFound);
        }
        if status.is_server_error() {
            return Err(ExchangeError::Transient(format!("server error {status}")));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("bad response body: {e}")))?;

        if let Some(code) = body.get("code").and_then(|c| c.as_i64()) {
            if code == -2010 {
                return Err(ExchangeError::InsufficientFunds);
            }
            if code == -1021 {
                return Err(ExchangeError::Transient("request timestamp out of window".into()));
            }
            warn!(code, "exchange returned an error body");
            return Err(ExchangeError::Transient(format!("exchange error {code}")));
        }

        if !status.is_success() {
            return Err(ExchangeError::Transient(format!("unexpected status {status}")));
        }
        Ok(body)
    }
}

fn classify_transport_error(e: &reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Transient("request timed out".into())
    } else if e.is_connect() {
        ExchangeError::Transient(format!("connection failed: {e}"))
    } else {
        ExchangeError::Transient(e.to_string())
    }
}

fn parse_decimal(v: &serde_json::Value) -> Decimal {
    v.as_str()
        .and_then(|s| Decimal::from_str(s).ok())
        .or_else(|| v.as_f64().and_then(Decimal::from_f64_retain))
        .unwrap_or_default()
}

#[async_trait]
impl Exchange for LiveExchange {
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let body = self
            .public_request("/api/v3/ticker/bookTicker", &[("symbol".to_string(), Self::wire_symbol(symbol))])
            .await?;
        let bid = parse_decimal(&body["bidPrice"]);
        let ask = parse_decimal(&body["askPrice"]);
        let last = if bid.is_zero() && ask.is_zero() { Decimal::ZERO } else { (bid + ask) / Decimal::from(2) };
        Ok(Ticker { bid, ask, last })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), Self::wire_symbol(symbol)),
            ("interval".to_string(), timeframe.to_string()),
        ];
        if let Some(s) = start {
            params.push(("startTime".to_string(), s.timestamp_millis().to_string()));
        }
        if let Some(e) = end {
            params.push(("endTime".to_string(), e.timestamp_millis().to_string()));
        }
        params.push(("limit".to_string(), limit.unwrap_or(500).to_string()));

        let body = self.public_request("/api/v3/klines", &params).await?;
        let rows = body.as_array().ok_or_else(|| ExchangeError::Transient("klines: not an array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let r = row.as_array().ok_or_else(|| ExchangeError::Transient("klines: malformed row".into()))?;
            if r.len() < 5 {
                continue;
            }
            candles.push(Candle {
                open_time_ms: r[0].as_i64().unwrap_or(0),
                open: parse_decimal(&r[1]),
                high: parse_decimal(&r[2]),
                low: parse_decimal(&r[3]),
                close: parse_decimal(&r[4]),
                volume: r.get(5).map(parse_decimal).unwrap_or_default(),
            });
        }
        candles.sort_by_key(|c| c.open_time_ms);
        Ok(candles)
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let body = self.signed_request(reqwest::Method::GET, "/api/v3/account", vec![]).await?;
        let mut balances = HashMap::new();
        if let Some(rows) = body.get("balances").and_then(|b| b.as_array()) {
            for row in rows {
                let asset = row.get("asset").and_then(|a| a.as_str()).unwrap_or_default().to_string();
                let free = parse_decimal(&row["free"]);
                let locked = parse_decimal(&row["locked"]);
                balances.insert(asset, Balance { free, total: free + locked });
            }
        }
        Ok(balances)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        amount: Decimal,
        price: Decimal,
    ) -> Result<i64, ExchangeError> {
        let client_order_id = uuid::Uuid::new_v4().to_string();
        let params = vec![
            ("symbol".to_string(), Self::wire_symbol(symbol)),
            ("side".to_string(), if side == Side::Buy { "BUY".to_string() } else { "SELL".to_string() }),
            ("type".to_string(), "LIMIT".to_string()),
            ("timeInForce".to_string(), "GTC".to_string()),
            ("quantity".to_string(), amount.to_string()),
            ("price".to_string(), price.to_string()),
            ("newClientOrderId".to_string(), client_order_id),
        ];
        let body = self.signed_request(reqwest::Method::POST, "/api/v3/order", params).await?;
        body.get("orderId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ExchangeError::Transient("order response missing orderId".into()))
    }

    async fn cancel_order(&self, id: i64, symbol: &str) -> Result<(), ExchangeError> {
        let params = vec![
            ("symbol".to_string(), Self::wire_symbol(symbol)),
            ("orderId".to_string(), id.to_string()),
        ];
        match self.signed_request(reqwest::Method::DELETE, "/api/v3/order", params).await {
            Ok(_) => Ok(()),
            // Cancelling an id the exchange no longer recognizes is a success for callers.
            Err(ExchangeError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let params = vec![("symbol".to_string(), Self::wire_symbol(symbol))];
        let body = self.signed_request(reqwest::Method::GET, "/api/v3/openOrders", params).await?;
        let rows = body.as_array().ok_or_else(|| ExchangeError::Transient("openOrders: not an array".into()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExchangeOrder {
                id: row.get("orderId").and_then(|v| v.as_i64()).unwrap_or(0),
                symbol: symbol.to_string(),
                side: if row.get("side").and_then(|s| s.as_str()) == Some("BUY") { Side::Buy } else { Side::Sell },
                price: parse_decimal(&row["price"]),
                amount: parse_decimal(&row["origQty"]),
            });
        }
        Ok(out)
    }

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<ExchangeTrade>, ExchangeError> {
        let mut params = vec![("symbol".to_string(), Self::wire_symbol(symbol))];
        if let Some(s) = since {
            params.push(("startTime".to_string(), s.timestamp_millis().to_string()));
        }
        params.push(("limit".to_string(), limit.unwrap_or(500).to_string()));

        let body = self.signed_request(reqwest::Method::GET, "/api/v3/myTrades", params).await?;
        let rows = body.as_array().ok_or_else(|| ExchangeError::Transient("myTrades: not an array".into()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let ms = row.get("time").and_then(|v| v.as_i64()).unwrap_or(0);
            out.push(ExchangeTrade {
                order_id: row.get("orderId").and_then(|v| v.as_i64()).unwrap_or(0),
                symbol: symbol.to_string(),
                side: if row.get("isBuyer").and_then(|b| b.as_bool()) == Some(true) { Side::Buy } else { Side::Sell },
                price: parse_decimal(&row["price"]),
                amount: parse_decimal(&row["qty"]),
                fee: parse_decimal(&row["commission"]),
                timestamp: Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now),
            });
        }
        Ok(out)
    }
}
