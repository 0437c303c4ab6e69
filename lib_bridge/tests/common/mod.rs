//! Shared fakes for the bridge scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lib_bridge::{
    Clock, ConnectionState, EventLog, Greeks, PortfolioSnapshot, Position, Row, RowStore, SecurityType, StoreError,
    Table, TransportClient, TransportError, TransportMode, PORTFOLIO_CONTRACT,
};

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// In-memory destination. `set_down(true)` makes every call fail;
/// `set_hung(true)` makes inserts never answer; `accept_only(n)` lets the
/// next `n` inserts through and fails the rest.
#[derive(Default)]
pub struct MemoryStore {
    down: AtomicBool,
    hung: AtomicBool,
    budget: Mutex<Option<usize>>,
    tables: Mutex<HashSet<Table>>,
    rows: Mutex<Vec<Row>>,
}

impl MemoryStore {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_hung(&self, hung: bool) {
        self.hung.store(hung, Ordering::SeqCst);
    }

    pub fn accept_only(&self, inserts: usize) {
        *self.budget.lock().unwrap() = Some(inserts);
    }

    pub fn has_table(&self, table: Table) -> bool {
        self.tables.lock().unwrap().contains(&table)
    }

    pub fn snapshots(&self) -> Vec<PortfolioSnapshot> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|row| match row {
                Row::Snapshot(s) => Some(s.clone()),
                Row::Log(_) => None,
            })
            .collect()
    }

    pub fn log_messages(&self) -> Vec<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter_map(|row| match row {
                Row::Log(entry) => Some(entry.message.clone()),
                Row::Snapshot(_) => None,
            })
            .collect()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn table_exists(&self, table: Table) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.has_table(table))
    }

    async fn create_table(&self, table: Table) -> Result<(), StoreError> {
        self.check()?;
        self.tables.lock().unwrap().insert(table);
        Ok(())
    }

    async fn insert(&self, row: &Row) -> Result<(), StoreError> {
        self.check()?;
        if self.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => return Err(StoreError::Query("server closed the connection".to_string())),
            Some(left) => *left -= 1,
            None => {}
        }
        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

/// Transport serving a fixed position list. Connects always succeed and
/// are timestamped with the shared clock.
pub struct FakeTransport {
    events: EventLog,
    clock: Arc<dyn Clock>,
    positions: Vec<Position>,
    connected: Mutex<bool>,
    attempts: Mutex<Vec<DateTime<Utc>>>,
    fetches: AtomicUsize,
    liveness_checks: AtomicUsize,
}

impl FakeTransport {
    pub fn new(events: EventLog, positions: Vec<Position>) -> Self {
        Self {
            clock: events.clock(),
            events,
            positions,
            connected: Mutex::new(false),
            attempts: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            liveness_checks: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn liveness_checks(&self) -> usize {
        self.liveness_checks.load(Ordering::SeqCst)
    }

    /// Simulates the upstream dropping the session.
    pub fn drop_session(&self) {
        *self.connected.lock().unwrap() = false;
    }

    pub fn connect_attempts(&self) -> Vec<DateTime<Utc>> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportClient for FakeTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Socket
    }

    fn events(&self) -> &EventLog {
        &self.events
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.attempts.lock().unwrap().push(self.clock.now());
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    async fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    async fn is_connected(&self) -> bool {
        self.liveness_checks.fetch_add(1, Ordering::SeqCst);
        *self.connected.lock().unwrap()
    }

    async fn connection_state(&self) -> ConnectionState {
        ConnectionState {
            mode: TransportMode::Socket,
            connected: *self.connected.lock().unwrap(),
            last_error: None,
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.positions.clone())
    }
}

fn option(con_id: i64, symbol: &str, quantity: f64, greeks: Greeks) -> Position {
    Position {
        con_id,
        symbol: symbol.to_string(),
        sec_type: SecurityType::Option,
        quantity,
        multiplier: 100.0,
        greeks: Some(greeks),
        underlying_price: Some(500.0),
    }
}

/// Two SPY options and a share position.
pub fn book() -> Vec<Position> {
    vec![
        option(
            1,
            "SPY 240621C00500000",
            2.0,
            Greeks { delta: 0.5, gamma: 0.02, vega: 0.1, theta: -0.05 },
        ),
        option(
            2,
            "SPY 240621P00490000",
            -3.0,
            Greeks { delta: -0.3, gamma: 0.01, vega: 0.2, theta: -0.04 },
        ),
        Position {
            con_id: 3,
            symbol: "SPY".to_string(),
            sec_type: SecurityType::Stock,
            quantity: 100.0,
            multiplier: 1.0,
            greeks: None,
            underlying_price: Some(500.0),
        },
    ]
}

pub fn snapshot_at(timestamp: DateTime<Utc>, delta: f64) -> Row {
    Row::Snapshot(PortfolioSnapshot {
        timestamp,
        contract: PORTFOLIO_CONTRACT.to_string(),
        delta,
        gamma: 1.0,
        vega: -40.0,
        theta: 2.0,
        underlying_price: Some(500.0),
    })
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
