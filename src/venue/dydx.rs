#![allow(dead_code)]
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::VenueCredentials;
use crate::types::{AccountSnapshot, Candle, Instrument, Side, Timeframe};
use super::{Fill, VenueClient, VenueError, VenueTrade};

const INDEXER_REST: &str = "https://indexer.v4testnet.dydx.exchange/v4";
const INDEXER_WS: &str = "wss://indexer.v4testnet.dydx.exchange/v4/ws";
const TRADE_API: &str = "https://api.v4testnet.dydx.exchange";

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const FILL_POLL_DEADLINE: Duration = Duration::from_secs(30);

type HmacSha256 = Hmac<Sha256>;

/// dYdX v4 testnet client: market data and account state come from the
/// public indexer; order submission goes through the authenticated trading
/// gateway with HMAC-signed requests.
pub struct DydxClient {
    http: reqwest::Client,
    indexer_url: String,
    ws_url: String,
    trade_url: String,
    credentials: VenueCredentials,
    limiter: DefaultDirectRateLimiter,
}

impl DydxClient {
    pub fn new(credentials: VenueCredentials) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client construction cannot fail with static options"),
            indexer_url: INDEXER_REST.to_string(),
            ws_url: INDEXER_WS.to_string(),
            trade_url: TRADE_API.to_string(),
            credentials,
            limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(4).expect("non-zero quota"),
            )),
        }
    }

    /// Market-data-only client; every indexer read is public.
    pub fn public_only() -> Self {
        Self::new(VenueCredentials::public_only())
    }

    pub fn with_endpoints(
        mut self,
        indexer_url: impl Into<String>,
        ws_url: impl Into<String>,
        trade_url: impl Into<String>,
    ) -> Self {
        self.indexer_url = indexer_url.into();
        self.ws_url = ws_url.into();
        self.trade_url = trade_url.into();
        self
    }

    /// The indexer speaks its own resolution vocabulary; the rest of the
    /// bot only ever sees the lowercase timeframes.
    fn resolution(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M1 => "1MIN",
            Timeframe::M5 => "5MINS",
            Timeframe::M15 => "15MINS",
            Timeframe::M30 => "30MINS",
            Timeframe::H1 => "1HOUR",
            Timeframe::H4 => "4HOURS",
            Timeframe::D1 => "1DAY",
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, VenueError> {
        self.limiter.until_ready().await;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(VenueError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| VenueError::Payload(e.to_string()))
    }

    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<String>,
    ) -> Result<T, VenueError> {
        let timestamp = Utc::now().to_rfc3339();
        let body = body.unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path, &body);

        let url = format!("{}{}", self.trade_url, path);
        let mut request = self
            .http
            .request(method, &url)
            .header("DYDX-API-KEY", &self.credentials.api_key)
            .header("DYDX-TIMESTAMP", &timestamp)
            .header("DYDX-SIGNATURE", signature);
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(VenueError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(|e| VenueError::Payload(e.to_string()))
    }

    async fn poll_fill(&self, client_id: &str) -> Result<Fill, VenueError> {
        let path = format!("/v4/orders/client/{}", client_id);
        let deadline = tokio::time::Instant::now() + FILL_POLL_DEADLINE;

        loop {
            let order: GatewayOrder = self
                .signed_request(reqwest::Method::GET, &path, None)
                .await?;

            match order.status.as_str() {
                "FILLED" => {
                    let price = parse_decimal(&order.price, "order price")?;
                    let size = parse_decimal(&order.size, "order size")?;
                    return Ok(Fill {
                        filled_price: price,
                        filled_size: size,
                    });
                }
                "CANCELED" | "REJECTED" | "EXPIRED" => {
                    return Err(VenueError::OrderRejected(format!(
                        "order {} ended {}",
                        client_id, order.status
                    )));
                }
                other => {
                    debug!(client_id, status = other, "awaiting fill");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(VenueError::Timeout(FILL_POLL_DEADLINE));
            }
            tokio::time::sleep(FILL_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl VenueClient for DydxClient {
    async fn get_candles(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<Vec<Candle>, VenueError> {
        let url = format!(
            "{}/candles/perpetualMarkets/{}?resolution={}&limit={}",
            self.indexer_url,
            instrument.as_str(),
            Self::resolution(timeframe),
            limit
        );

        let response: CandlesResponse = self.get_json(&url).await?;

        // The indexer returns newest first; the store wants ascending.
        let mut candles = response
            .candles
            .into_iter()
            .map(|c| c.into_candle(instrument.clone(), timeframe))
            .collect::<Result<Vec<_>, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn subscribe_trades(
        &self,
        instrument: &Instrument,
    ) -> Result<mpsc::Receiver<VenueTrade>, VenueError> {
        let (ws, _) = connect_async(&self.ws_url).await?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "channel": "v4_trades",
            "id": instrument.as_str(),
        });
        write.send(Message::Text(subscribe.to_string())).await?;
        info!(instrument = %instrument, "subscribed to trade feed");

        let (tx, rx) = mpsc::channel(1024);
        let instrument = instrument.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        for trade in parse_trade_message(&text) {
                            // A full queue means the consumer is behind;
                            // shedding the newest print degrades only the
                            // forming candle.
                            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(trade) {
                                debug!(instrument = %instrument, "trade queue full, dropping print");
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!(instrument = %instrument, "trade feed closed by venue");
                        break;
                    }
                    Err(e) => {
                        error!(instrument = %instrument, error = %e, "trade feed error");
                        break;
                    }
                    _ => {}
                }
                if tx.is_closed() {
                    break;
                }
            }
            // Dropping tx ends the receiver; the market-data task reconnects.
        });

        Ok(rx)
    }

    async fn get_account(&self) -> Result<AccountSnapshot, VenueError> {
        let url = format!(
            "{}/addresses/{}/subaccountNumber/{}",
            self.indexer_url, self.credentials.address, self.credentials.subaccount
        );

        let response: SubaccountResponse = self.get_json(&url).await?;
        Ok(AccountSnapshot {
            equity_usd: parse_decimal(&response.subaccount.equity, "equity")?,
            free_collateral_usd: parse_decimal(
                &response.subaccount.free_collateral,
                "freeCollateral",
            )?,
        })
    }

    async fn place_market_order(
        &self,
        instrument: &Instrument,
        side: Side,
        size_base: Decimal,
        client_id: &str,
    ) -> Result<Fill, VenueError> {
        let body = serde_json::json!({
            "clientId": client_id,
            "ticker": instrument.as_str(),
            "side": side.as_str(),
            "type": "MARKET",
            "size": size_base.to_string(),
            "subaccountNumber": self.credentials.subaccount,
            "reduceOnly": false,
        });

        let _ack: GatewayOrderAck = self
            .signed_request(reqwest::Method::POST, "/v4/orders", Some(body.to_string()))
            .await?;

        let fill = self.poll_fill(client_id).await?;
        info!(
            instrument = %instrument,
            %side,
            size = %fill.filled_size,
            price = %fill.filled_price,
            client_id,
            "market order filled"
        );
        Ok(fill)
    }

    async fn cancel_order(&self, client_id: &str) -> Result<(), VenueError> {
        let path = format!("/v4/orders/client/{}", client_id);
        match self
            .signed_request::<serde_json::Value>(reqwest::Method::DELETE, &path, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(client_id, error = %e, "best-effort cancel failed");
                Ok(())
            }
        }
    }
}

fn parse_decimal(raw: &str, field: &'static str) -> Result<Decimal, VenueError> {
    Decimal::from_str(raw)
        .map_err(|_| VenueError::Payload(format!("{} is not a decimal: {:?}", field, raw)))
}

fn parse_timestamp(raw: &str, field: &'static str) -> Result<DateTime<Utc>, VenueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| VenueError::Payload(format!("{} is not a timestamp: {:?}", field, raw)))
}

/// Extract trade prints from one websocket frame. The `subscribed` ack
/// carries a history of recent trades which is ignored; fresh prints arrive
/// as `channel_data`.
fn parse_trade_message(text: &str) -> Vec<VenueTrade> {
    let message: WsMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            debug!("unrecognised feed frame: {}", text);
            return Vec::new();
        }
    };

    if message.kind != "channel_data" {
        return Vec::new();
    }

    let Some(contents) = message.contents else {
        return Vec::new();
    };

    contents
        .trades
        .into_iter()
        .filter_map(|t| {
            let price = Decimal::from_str(&t.price).ok()?;
            let size = Decimal::from_str(&t.size).ok()?;
            let at = DateTime::parse_from_rfc3339(&t.created_at)
                .ok()?
                .with_timezone(&Utc);
            Some(VenueTrade { price, size, at })
        })
        .collect()
}

// Indexer wire types

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<IndexerCandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerCandle {
    started_at: String,
    open: String,
    high: String,
    low: String,
    close: String,
    base_token_volume: String,
}

impl IndexerCandle {
    fn into_candle(
        self,
        instrument: Instrument,
        timeframe: Timeframe,
    ) -> Result<Candle, VenueError> {
        Ok(Candle {
            instrument,
            timeframe,
            start_time: parse_timestamp(&self.started_at, "startedAt")?,
            open: parse_decimal(&self.open, "open")?,
            high: parse_decimal(&self.high, "high")?,
            low: parse_decimal(&self.low, "low")?,
            close: parse_decimal(&self.close, "close")?,
            volume: parse_decimal(&self.base_token_volume, "baseTokenVolume")?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubaccountResponse {
    subaccount: IndexerSubaccount,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexerSubaccount {
    equity: String,
    free_collateral: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
struct GatewayOrderAck {
    order: GatewayOrder,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayOrder {
    status: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(rename = "type")]
    kind: String,
    contents: Option<WsTradeContents>,
}

#[derive(Debug, Deserialize)]
struct WsTradeContents {
    #[serde(default)]
    trades: Vec<WsTrade>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsTrade {
    price: String,
    size: String,
    created_at: String,
}
