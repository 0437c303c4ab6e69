use std::sync::Arc;
use thiserror::Error;

use super::circuit_breaker::{CircuitBreaker, WriteOutcome};
use super::offline_buffer::BufferError;
use crate::connections::store::{Row, Table};

/// The only failures a gateway caller can see. Store outages are absorbed
/// by the breaker and never show up here.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Offline buffer unusable: {0}")]
    Buffer(#[from] BufferError),
}

/// # Persistence Gateway
///
/// Single entrypoint for destination writes. Every row goes through the
/// circuit breaker; there is no direct path to the store.
#[derive(Clone)]
pub struct PersistenceGateway {
    breaker: Arc<CircuitBreaker>,
}

impl PersistenceGateway {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Writes `row` to `table`, directly or via the offline buffer.
    ///
    /// Rejects rows addressed to the wrong table and rows that could never
    /// be stored (non-finite numbers, empty contract or message).
    pub async fn write(&self, table: Table, row: Row) -> Result<WriteOutcome, GatewayError> {
        if row.table() != table {
            return Err(GatewayError::InvariantViolation(format!(
                "{} row addressed to {}",
                row.table(),
                table
            )));
        }
        if !row.is_well_formed() {
            return Err(GatewayError::InvariantViolation(format!("malformed {table} row: {row:?}")));
        }
        Ok(self.breaker.write(row).await?)
    }
}
