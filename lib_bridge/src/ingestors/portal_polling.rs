//! # Client Portal Polling Client
//!
//! Request/response transport against the gateway's REST portal. Connect
//! checks the brokerage session once, liveness is a `tickle`, and greeks
//! come from the market-data snapshot endpoint, which only fills fields in
//! after the first request for a contract. Lookups are therefore re-polled
//! until populated or the greeks timeout runs out.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

use super::{ConnectionCell, ConnectionState, TransportClient, TransportError};
use crate::configs::settings::TransportMode;
use crate::loggers::eventlog::EventLog;
use crate::markets::greeks::{Greeks, Position, SecurityType};
use crate::retrieve::ky_http::{ApiClient, ApiClientOptions, ApiResponse, HttpError};

/// Most conids the snapshot endpoint accepts per call.
const SNAPSHOT_BATCH: usize = 50;
/// 31 last price, 7308 delta, 7309 gamma, 7310 theta, 7311 vega.
const SNAPSHOT_FIELDS: &str = "31,7308,7309,7310,7311";

/// Configuration for the portal client.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    /// Account to read positions from. Resolved from `portfolio/accounts`
    /// on connect when unset.
    pub account_id: Option<String>,
    /// Transient-failure retries for data calls. Connect never retries.
    pub http_retries: u32,
    pub request_timeout: Duration,
    pub greeks_timeout: Duration,
    pub poll_interval: Duration,
    /// The local gateway serves a self-signed certificate.
    pub accept_invalid_certs: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost:5000/v1/api/".to_string(),
            account_id: None,
            http_retries: 2,
            request_timeout: Duration::from_secs(10),
            greeks_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(250),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    competing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortalPosition {
    conid: i64,
    #[serde(default)]
    contract_desc: String,
    position: f64,
    #[serde(default)]
    asset_class: String,
    #[serde(default)]
    multiplier: Option<f64>,
    #[serde(default)]
    mkt_price: Option<f64>,
    #[serde(default)]
    und_price: Option<f64>,
}

impl PortalPosition {
    fn into_position(self) -> Position {
        let sec_type = SecurityType::from_code(&self.asset_class);
        let multiplier = self
            .multiplier
            .filter(|m| *m > 0.0)
            .unwrap_or_else(|| sec_type.default_multiplier());
        let underlying_price = if sec_type.is_option() {
            self.und_price
        } else {
            self.und_price.or(self.mkt_price)
        };
        Position {
            con_id: self.conid,
            symbol: self.contract_desc,
            sec_type,
            quantity: self.position,
            multiplier,
            greeks: None,
            underlying_price,
        }
    }
}

/// Snapshot field values arrive as strings, sometimes prefixed with a
/// status letter (`"C4.10"` for a prior close).
fn parse_field(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// One snapshot entry, if all four greeks are populated.
fn parse_snapshot_entry(entry: &Value) -> Option<(i64, Greeks)> {
    let conid = match entry.get("conid")? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let field = |code: &str| entry.get(code).and_then(parse_field);
    let greeks = Greeks {
        delta: field("7308")?,
        gamma: field("7309")?,
        theta: field("7310")?,
        vega: field("7311")?,
    };
    Some((conid, greeks))
}

fn http_error(e: HttpError) -> TransportError {
    TransportError::Request(e.to_string())
}

fn into_body<T>(response: ApiResponse<T>, call: &str) -> Result<T, TransportError> {
    if !response.success {
        return Err(TransportError::Request(format!(
            "{call} returned HTTP {}: {}",
            response.status,
            response.error_body.unwrap_or_default()
        )));
    }
    response
        .data
        .ok_or_else(|| TransportError::Protocol(format!("{call} returned no body")))
}

/// `PORTAL` transport.
pub struct PortalClient {
    config: PortalConfig,
    /// Connect and liveness calls, no retry middleware.
    probe: ApiClient,
    api: ApiClient,
    events: EventLog,
    state: ConnectionCell,
    account: RwLock<Option<String>>,
}

impl PortalClient {
    pub fn new(config: PortalConfig, events: EventLog) -> Result<Self, TransportError> {
        let probe_options = ApiClientOptions {
            max_retries: 0,
            timeout: config.request_timeout,
            accept_invalid_certs: config.accept_invalid_certs,
        };
        let api_options = ApiClientOptions {
            max_retries: config.http_retries,
            ..probe_options.clone()
        };
        let probe = ApiClient::new(&config.base_url, &probe_options).map_err(http_error)?;
        let api = ApiClient::new(&config.base_url, &api_options).map_err(http_error)?;
        Ok(Self {
            config,
            probe,
            api,
            events,
            state: ConnectionCell::new(TransportMode::Portal),
            account: RwLock::new(None),
        })
    }

    async fn authenticate(&self) -> Result<String, TransportError> {
        let response = self.probe.post::<AuthStatus>("iserver/auth/status").await.map_err(http_error)?;
        let status = into_body(response, "auth status")?;
        if !status.authenticated {
            let reason = if status.competing {
                "brokerage session is held by a competing login"
            } else {
                "brokerage session is not authenticated"
            };
            return Err(TransportError::Connect(reason.to_string()));
        }

        if let Some(account) = &self.config.account_id {
            return Ok(account.clone());
        }
        let response = self.probe.get::<Vec<AccountEntry>>("portfolio/accounts").await.map_err(http_error)?;
        into_body(response, "accounts")?
            .into_iter()
            .find_map(|a| a.id.or(a.account_id))
            .ok_or_else(|| TransportError::Protocol("no account available".to_string()))
    }

    /// Records a lost session, logging only the first time.
    async fn lose_session(&self, reason: String) {
        if self.state.mark_disconnected(Some(reason.clone())).await {
            self.events.warning(reason);
        }
    }

    async fn poll_greeks(&self, conids: &[i64]) -> HashMap<i64, Greeks> {
        let deadline = Instant::now() + self.config.greeks_timeout;
        let batches = conids.chunks(SNAPSHOT_BATCH).map(|chunk| self.poll_batch(chunk, deadline));
        join_all(batches).await.into_iter().flatten().collect()
    }

    async fn poll_batch(&self, conids: &[i64], deadline: Instant) -> HashMap<i64, Greeks> {
        let ids: Vec<String> = conids.iter().map(|c| c.to_string()).collect();
        let query = format!(
            "iserver/marketdata/snapshot?conids={}&fields={}",
            ids.join(","),
            SNAPSHOT_FIELDS
        );

        let mut found = HashMap::new();
        loop {
            match timeout_at(deadline, self.api.get::<Vec<Value>>(&query)).await {
                Ok(Ok(response)) if response.success => {
                    for entry in response.data.unwrap_or_default() {
                        if let Some((conid, greeks)) = parse_snapshot_entry(&entry) {
                            found.insert(conid, greeks);
                        }
                    }
                }
                Ok(Ok(response)) => debug!(status = response.status, "snapshot batch rejected"),
                Ok(Err(e)) => debug!(error = %e, "snapshot batch failed"),
                Err(_) => break,
            }
            if found.len() >= conids.len() || Instant::now() + self.config.poll_interval >= deadline {
                break;
            }
            sleep(self.config.poll_interval).await;
        }
        found
    }

    async fn collect_positions(&self) -> Result<Vec<Position>, TransportError> {
        if !self.state.is_connected().await {
            return Err(TransportError::NotConnected);
        }
        let account = self.account.read().await.clone().ok_or(TransportError::NotConnected)?;

        let path = format!("portfolio/{account}/positions/0");
        let rows: Vec<PortalPosition> = into_body(self.api.get(&path).await.map_err(http_error)?, "positions")?;
        let mut positions: Vec<Position> = rows
            .into_iter()
            .filter(|p| p.position != 0.0)
            .map(PortalPosition::into_position)
            .collect();

        let conids: Vec<i64> = positions
            .iter()
            .filter(|p| p.sec_type.is_option())
            .map(|p| p.con_id)
            .collect();
        if conids.is_empty() {
            return Ok(positions);
        }

        let greeks = self.poll_greeks(&conids).await;
        for position in positions.iter_mut() {
            position.greeks = greeks.get(&position.con_id).copied();
        }
        Ok(positions)
    }
}

#[async_trait]
impl TransportClient for PortalClient {
    fn mode(&self) -> TransportMode {
        TransportMode::Portal
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn connect(&self) -> Result<(), TransportError> {
        match self.authenticate().await {
            Ok(account) => {
                *self.account.write().await = Some(account.clone());
                self.state.mark_connected().await;
                self.events.info(format!(
                    "portal session authenticated for account {account} at {}",
                    self.api.base_url()
                ));
                Ok(())
            }
            Err(e) => {
                self.state.mark_disconnected(Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) {
        *self.account.write().await = None;
        if self.state.mark_disconnected(None).await {
            self.events.info("portal session released");
        }
    }

    async fn is_connected(&self) -> bool {
        if !self.state.is_connected().await {
            return false;
        }
        match self.probe.post::<Value>("tickle").await {
            Ok(response) if response.success => {
                let authenticated = response
                    .data
                    .as_ref()
                    .and_then(|v| v.pointer("/iserver/authStatus/authenticated"))
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if !authenticated {
                    self.lose_session("portal session no longer authenticated".to_string()).await;
                }
                authenticated
            }
            Ok(response) => {
                self.lose_session(format!("tickle returned HTTP {}", response.status)).await;
                false
            }
            Err(e) => {
                self.lose_session(format!("tickle failed: {e}")).await;
                false
            }
        }
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.snapshot().await
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, TransportError> {
        match self.collect_positions().await {
            Err(TransportError::NotConnected) => Err(TransportError::NotConnected),
            Err(e) => {
                self.lose_session(format!("position fetch failed: {e}")).await;
                Err(e)
            }
            ok => ok,
        }
    }
}
