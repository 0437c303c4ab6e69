//! # Destination Store Seam
//!
//! Two append-mostly tables and the narrow async interface the bridge uses
//! to reach them. Only the circuit breaker calls `insert`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::loggers::logentry::LogEntry;
use crate::markets::greeks::PortfolioSnapshot;

/// Custom error types for destination store operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("Failed to connect to store: {0}")]
    Connection(String),
    #[error("Query execution failed: {0}")]
    Query(String),
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Destination tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    PortfolioGreeks,
    ApiLog,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::PortfolioGreeks, Table::ApiLog];

    pub fn name(&self) -> &'static str {
        match self {
            Table::PortfolioGreeks => "portfolio_greeks",
            Table::ApiLog => "api_log",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A row bound for one of the destination tables.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Snapshot(PortfolioSnapshot),
    Log(LogEntry),
}

impl Row {
    /// The table this row belongs to.
    pub fn table(&self) -> Table {
        match self {
            Row::Snapshot(_) => Table::PortfolioGreeks,
            Row::Log(_) => Table::ApiLog,
        }
    }

    /// Rows with non-finite numbers or an empty contract/message cannot be
    /// stored and indicate a programming error upstream.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Row::Snapshot(s) => s.is_well_formed() && !s.contract.is_empty(),
            Row::Log(e) => !e.message.is_empty(),
        }
    }

    /// Serialized row body, without the table tag.
    pub fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Row::Snapshot(s) => serde_json::to_value(s),
            Row::Log(e) => serde_json::to_value(e),
        }
    }

    /// Rebuilds a row from a table tag and its serialized body.
    pub fn from_payload(table: Table, payload: serde_json::Value) -> Result<Row, serde_json::Error> {
        match table {
            Table::PortfolioGreeks => serde_json::from_value(payload).map(Row::Snapshot),
            Table::ApiLog => serde_json::from_value(payload).map(Row::Log),
        }
    }
}

/// The destination store as seen by the bridge.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn table_exists(&self, table: Table) -> Result<bool, StoreError>;

    async fn create_table(&self, table: Table) -> Result<(), StoreError>;

    /// Appends one row; returns only once the store acknowledged it.
    async fn insert(&self, row: &Row) -> Result<(), StoreError>;
}
