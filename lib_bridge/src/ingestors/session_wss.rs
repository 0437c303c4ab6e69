//! # Gateway Session Client
//!
//! Persistent WebSocket session to the local trading gateway. Requests are
//! JSON frames tagged with a numeric `id`; a background reader task routes
//! every reply frame back to the request that owns the id and flips the
//! connection state when the socket goes away.

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{ConnectionCell, ConnectionState, TransportClient, TransportError};
use crate::configs::settings::TransportMode;
use crate::loggers::eventlog::EventLog;
use crate::markets::greeks::{Greeks, Position, SecurityType};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Value>>>>;

/// Configuration for the gateway session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub gateway_url: String,
    pub connect_timeout: Duration,
    /// Bound on single-reply requests such as the positions query.
    pub request_timeout: Duration,
    /// How long an option's model greeks may take to populate.
    pub greeks_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://127.0.0.1:4001/v1/session".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            greeks_timeout: Duration::from_secs(3),
        }
    }
}

/// Position as the gateway reports it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePosition {
    con_id: i64,
    symbol: String,
    sec_type: String,
    position: f64,
    #[serde(default)]
    multiplier: Option<f64>,
    #[serde(default)]
    market_price: Option<f64>,
    #[serde(default)]
    underlying_price: Option<f64>,
}

impl WirePosition {
    fn into_position(self) -> Position {
        let sec_type = SecurityType::from_code(&self.sec_type);
        let multiplier = self
            .multiplier
            .filter(|m| *m > 0.0)
            .unwrap_or_else(|| sec_type.default_multiplier());
        let underlying_price = if sec_type.is_option() {
            self.underlying_price
        } else {
            self.underlying_price.or(self.market_price)
        };
        Position {
            con_id: self.con_id,
            symbol: self.symbol,
            sec_type,
            quantity: self.position,
            multiplier,
            greeks: None,
            underlying_price,
        }
    }
}

/// Reads a `{"greeks": {...}}` frame. `None` until all four values are
/// populated with finite numbers.
fn parse_greeks_frame(frame: &Value) -> Option<(Greeks, Option<f64>)> {
    let body = frame.get("greeks")?;
    let field = |key: &str| body.get(key).and_then(Value::as_f64).filter(|v| v.is_finite());
    let greeks = Greeks {
        delta: field("delta")?,
        gamma: field("gamma")?,
        vega: field("vega")?,
        theta: field("theta")?,
    };
    Some((greeks, field("undPrice")))
}

/// A live socket and its reply routing table.
struct Session {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl Session {
    fn close(self) {
        self.reader.abort();
        // The writer task sends the close frame and exits once the channel drops.
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// One in-flight request and the channel its reply frames arrive on.
struct Request {
    id: u64,
    replies: mpsc::UnboundedReceiver<Value>,
    pending: Pending,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Request {
    async fn finish(self) {
        self.pending.lock().await.remove(&self.id);
    }

    /// Ends a streaming request on both sides.
    async fn cancel(self) {
        let frame = json!({ "op": "cancel", "ref": self.id });
        let _ = self.outbound.send(Message::Text(frame.to_string().into()));
        self.finish().await;
    }
}

async fn write_frames(mut sink: SplitSink<WsStream, Message>, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "session write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn route_frame(pending: &Pending, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "dropping non-JSON frame");
            return;
        }
    };
    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        debug!("dropping frame without id");
        return;
    };
    let mut routes = pending.lock().await;
    if let Some(tx) = routes.get(&id) {
        if tx.send(frame).is_err() {
            routes.remove(&id);
        }
    } else {
        debug!(id, "dropping frame for finished request");
    }
}

async fn read_frames(mut stream: SplitStream<WsStream>, pending: Pending, state: Arc<ConnectionCell>, events: EventLog) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => route_frame(&pending, text.as_str()).await,
            Some(Ok(Message::Close(_))) => break "session closed by gateway".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("session read error: {e}"),
            None => break "session stream ended".to_string(),
        }
    };
    // Dropping the senders wakes every waiting request with `None`.
    pending.lock().await.clear();
    if state.mark_disconnected(Some(reason.clone())).await {
        events.warning(reason);
    }
}

/// `SOCKET` transport.
pub struct SessionClient {
    config: SessionConfig,
    events: EventLog,
    state: Arc<ConnectionCell>,
    session: Mutex<Option<Session>>,
    next_id: AtomicU64,
}

impl SessionClient {
    pub fn new(config: SessionConfig, events: EventLog) -> Self {
        Self {
            config,
            events,
            state: Arc::new(ConnectionCell::new(TransportMode::Socket)),
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    async fn open_request(&self, op: &str, con_id: Option<i64>) -> Result<Request, TransportError> {
        let slot = self.session.lock().await;
        let session = slot.as_ref().ok_or(TransportError::NotConnected)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = match con_id {
            Some(con_id) => json!({ "id": id, "op": op, "conId": con_id }),
            None => json!({ "id": id, "op": op }),
        };

        let (tx, replies) = mpsc::unbounded_channel();
        session.pending.lock().await.insert(id, tx);
        session
            .outbound
            .send(Message::Text(frame.to_string().into()))
            .map_err(|_| TransportError::NotConnected)?;

        Ok(Request {
            id,
            replies,
            pending: session.pending.clone(),
            outbound: session.outbound.clone(),
        })
    }

    async fn request_positions(&self) -> Result<Vec<WirePosition>, TransportError> {
        let mut request = self.open_request("positions", None).await?;
        let reply = timeout(self.config.request_timeout, request.replies.recv()).await;
        request.finish().await;

        let frame = match reply {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(TransportError::Request("session closed mid-request".to_string())),
            Err(_) => return Err(TransportError::Timeout(self.config.request_timeout)),
        };
        if let Some(err) = frame.get("error") {
            return Err(TransportError::Protocol(err.to_string()));
        }
        let raw = frame
            .get("positions")
            .cloned()
            .ok_or_else(|| TransportError::Protocol("positions reply without positions".to_string()))?;
        serde_json::from_value(raw).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Waits for the first fully populated greeks frame for `con_id`.
    async fn request_greeks(&self, con_id: i64) -> Option<(Greeks, Option<f64>)> {
        let mut request = match self.open_request("greeks", Some(con_id)).await {
            Ok(request) => request,
            Err(e) => {
                debug!(con_id, error = %e, "greeks request not sent");
                return None;
            }
        };

        let replies = &mut request.replies;
        let populated = timeout(self.config.greeks_timeout, async {
            while let Some(frame) = replies.recv().await {
                if let Some(found) = parse_greeks_frame(&frame) {
                    return Some(found);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        request.cancel().await;
        populated
    }

    async fn collect_positions(&self) -> Result<Vec<Position>, TransportError> {
        let mut positions: Vec<Position> = self
            .request_positions()
            .await?
            .into_iter()
            .filter(|p| p.position != 0.0)
            .map(WirePosition::into_position)
            .collect();

        let lookups: Vec<_> = positions
            .iter()
            .enumerate()
            .filter(|(_, p)| p.sec_type.is_option())
            .map(|(index, p)| {
                let con_id = p.con_id;
                async move { (index, self.request_greeks(con_id).await) }
            })
            .collect();

        for (index, found) in join_all(lookups).await {
            if let Some((greeks, underlying)) = found {
                let position = &mut positions[index];
                position.greeks = Some(greeks);
                if underlying.is_some() {
                    position.underlying_price = underlying;
                }
            }
        }
        Ok(positions)
    }
}

#[async_trait]
impl TransportClient for SessionClient {
    fn mode(&self) -> TransportMode {
        TransportMode::Socket
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        if let Some(stale) = slot.take() {
            stale.close();
        }

        info!(url = %self.config.gateway_url, "opening gateway session");
        let stream = match timeout(self.config.connect_timeout, connect_async(self.config.gateway_url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let err = TransportError::Connect(e.to_string());
                self.state.mark_disconnected(Some(err.to_string())).await;
                return Err(err);
            }
            Err(_) => {
                let err = TransportError::Timeout(self.config.connect_timeout);
                self.state.mark_disconnected(Some(err.to_string())).await;
                return Err(err);
            }
        };

        let (sink, stream) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_frames(sink, outbound_rx));
        let reader = tokio::spawn(read_frames(
            stream,
            pending.clone(),
            self.state.clone(),
            self.events.clone(),
        ));

        *slot = Some(Session {
            outbound,
            pending,
            reader,
        });
        self.state.mark_connected().await;
        self.events.info(format!("session opened to {}", self.config.gateway_url));
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close();
        }
        if self.state.mark_disconnected(None).await {
            self.events.info("session closed");
        }
    }

    async fn is_connected(&self) -> bool {
        self.state.is_connected().await
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.snapshot().await
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, TransportError> {
        match self.collect_positions().await {
            Ok(positions) => Ok(positions),
            Err(TransportError::NotConnected) => Err(TransportError::NotConnected),
            Err(e) => {
                if let Some(session) = self.session.lock().await.take() {
                    session.close();
                }
                if self.state.mark_disconnected(Some(e.to_string())).await {
                    self.events.warning(format!("position fetch failed, session dropped: {e}"));
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn text(value: Value) -> Message {
        Message::Text(value.to_string().into())
    }

    /// Fake gateway: two options (only conId 101 ever populates) and one stock.
    async fn spawn_gateway() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(raw) = msg else { continue };
                let req: Value = serde_json::from_str(raw.as_str()).unwrap();
                let id = req["id"].clone();
                match req["op"].as_str() {
                    Some("positions") => {
                        let positions = json!([
                            {"conId": 101, "symbol": "SPY C500", "secType": "OPT", "position": 2.0, "multiplier": 100.0},
                            {"conId": 102, "symbol": "SPY P480", "secType": "OPT", "position": -1.0},
                            {"conId": 7, "symbol": "SPY", "secType": "STK", "position": 50.0, "marketPrice": 512.3},
                            {"conId": 8, "symbol": "QQQ", "secType": "STK", "position": 0.0}
                        ]);
                        ws.send(text(json!({"id": id, "positions": positions}))).await.unwrap();
                    }
                    Some("greeks") if req["conId"] == 101 => {
                        let pending = json!({"delta": null, "gamma": null, "vega": null, "theta": null});
                        ws.send(text(json!({"id": id, "greeks": pending}))).await.unwrap();
                        let ready = json!({"delta": 0.5, "gamma": 0.02, "vega": 0.1, "theta": -0.05, "undPrice": 512.0});
                        ws.send(text(json!({"id": id, "greeks": ready}))).await.unwrap();
                    }
                    _ => {}
                }
            }
        });
        format!("ws://{addr}")
    }

    fn config(url: String) -> SessionConfig {
        SessionConfig {
            gateway_url: url,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            greeks_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn snapshot_tolerates_unpopulated_greeks() {
        let url = spawn_gateway().await;
        let client = SessionClient::new(config(url), EventLog::detached(TransportMode::Socket));
        client.connect().await.unwrap();
        assert!(client.is_connected().await);

        let positions = client.fetch_positions().await.unwrap();
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].greeks.map(|g| g.delta), Some(0.5));
        assert_eq!(positions[0].underlying_price, Some(512.0));
        assert_eq!(positions[1].greeks, None);
        assert_eq!(positions[1].multiplier, 100.0);
        assert_eq!(positions[2].underlying_price, Some(512.3));

        let snapshot = client.get_portfolio_greeks().await.unwrap();
        // 0.5 * 2 * 100 from the populated option, 50 from the stock
        assert!((snapshot.delta - 150.0).abs() < 1e-9);
        assert!((snapshot.theta + 10.0).abs() < 1e-9);
        assert_eq!(snapshot.underlying_price, None);

        client.disconnect().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn refused_connect_records_last_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SessionClient::new(config(format!("ws://{addr}")), EventLog::detached(TransportMode::Socket));
        assert!(matches!(client.connect().await, Err(TransportError::Connect(_))));
        let state = client.connection_state().await;
        assert!(!state.connected);
        assert!(state.last_error.is_some());
        assert_eq!(client.fetch_positions().await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn gateway_close_flips_connection_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let client = SessionClient::new(config(format!("ws://{addr}")), EventLog::detached(TransportMode::Socket));
        client.connect().await.unwrap();
        for _ in 0..50 {
            if !client.is_connected().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let state = client.connection_state().await;
        assert!(!state.connected);
        assert_eq!(state.last_error.as_deref(), Some("session closed by gateway"));
    }

    #[test]
    fn greeks_frame_requires_every_field() {
        let partial = json!({"greeks": {"delta": 0.4, "gamma": 0.01, "vega": null, "theta": -0.02}});
        assert_eq!(parse_greeks_frame(&partial), None);

        let full = json!({"greeks": {"delta": 0.4, "gamma": 0.01, "vega": 0.2, "theta": -0.02}});
        let (greeks, underlying) = parse_greeks_frame(&full).unwrap();
        assert_eq!(greeks.vega, 0.2);
        assert_eq!(underlying, None);
    }
}
