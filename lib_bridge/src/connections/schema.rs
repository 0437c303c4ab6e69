//! Destination schema: DDL for both tables and the idempotent ensure step.

use std::sync::Arc;
use tracing::info;

use super::store::{RowStore, StoreError, Table};

/// DDL for one destination table. `IF NOT EXISTS` covers a concurrent
/// creator racing the existence check.
pub fn ddl_for(table: Table) -> &'static str {
    match table {
        Table::PortfolioGreeks => {
            "CREATE TABLE IF NOT EXISTS portfolio_greeks (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                contract TEXT NOT NULL DEFAULT 'PORTFOLIO',
                delta DOUBLE PRECISION NOT NULL,
                gamma DOUBLE PRECISION NOT NULL,
                vega DOUBLE PRECISION NOT NULL,
                theta DOUBLE PRECISION NOT NULL,
                underlying_price DOUBLE PRECISION
            );
            CREATE INDEX IF NOT EXISTS idx_portfolio_greeks_ts ON portfolio_greeks (timestamp DESC);"
        }
        Table::ApiLog => {
            "CREATE TABLE IF NOT EXISTS api_log (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                mode TEXT NOT NULL,
                message TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('info', 'warning', 'error'))
            );
            CREATE INDEX IF NOT EXISTS idx_api_log_ts ON api_log (timestamp DESC);"
        }
    }
}

/// Ensures both destination tables exist. Safe to run on every start.
pub struct SchemaManager {
    store: Arc<dyn RowStore>,
}

impl SchemaManager {
    pub fn new(store: Arc<dyn RowStore>) -> Self {
        Self { store }
    }

    /// Checks each table and creates only the missing ones.
    ///
    /// Returns the tables that were created on this call; an empty list
    /// means the schema was already in place.
    pub async fn ensure(&self) -> Result<Vec<Table>, StoreError> {
        let mut created = Vec::new();
        for table in Table::ALL {
            if self.store.table_exists(table).await? {
                continue;
            }
            self.store.create_table(table).await?;
            info!(table = %table, "created destination table");
            created.push(table);
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::store::Row;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct SchemaOnlyStore {
        tables: Mutex<HashSet<Table>>,
        creates: Mutex<u32>,
        unreachable: bool,
    }

    #[async_trait]
    impl RowStore for SchemaOnlyStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn table_exists(&self, table: Table) -> Result<bool, StoreError> {
            if self.unreachable {
                return Err(StoreError::Connection("refused".to_string()));
            }
            Ok(self.tables.lock().unwrap().contains(&table))
        }

        async fn create_table(&self, table: Table) -> Result<(), StoreError> {
            *self.creates.lock().unwrap() += 1;
            self.tables.lock().unwrap().insert(table);
            Ok(())
        }

        async fn insert(&self, _row: &Row) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn ensure_creates_missing_tables_once() {
        let store = Arc::new(SchemaOnlyStore::default());
        let manager = SchemaManager::new(store.clone());

        assert_eq!(manager.ensure().await.unwrap(), vec![Table::PortfolioGreeks, Table::ApiLog]);
        assert_eq!(manager.ensure().await.unwrap(), vec![]);
        assert_eq!(*store.creates.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn ensure_only_fills_gaps() {
        let store = Arc::new(SchemaOnlyStore::default());
        store.tables.lock().unwrap().insert(Table::ApiLog);
        let created = SchemaManager::new(store.clone()).ensure().await.unwrap();
        assert_eq!(created, vec![Table::PortfolioGreeks]);
    }

    #[tokio::test]
    async fn unreachable_store_is_reported() {
        let store = Arc::new(SchemaOnlyStore {
            unreachable: true,
            ..Default::default()
        });
        assert!(SchemaManager::new(store).ensure().await.is_err());
    }

    #[test]
    fn ddl_declares_spec_columns() {
        let greeks = ddl_for(Table::PortfolioGreeks);
        for column in ["timestamp", "contract", "delta", "gamma", "vega", "theta", "underlying_price"] {
            assert!(greeks.contains(column), "missing {column}");
        }
        assert!(ddl_for(Table::ApiLog).contains("status IN ('info', 'warning', 'error')"));
    }
}
