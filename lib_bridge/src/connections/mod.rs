//! # Connections Module
//!
//! The destination store: the `RowStore` seam every writer goes through,
//! the idempotent schema manager, and the PostgreSQL implementation.

/// Tables, rows, and the `RowStore` trait.
pub mod store;
/// Ensures the destination tables exist before any write path runs.
pub mod schema;
/// PostgreSQL connection pool and row writer.
#[cfg(feature = "connections")]
pub mod db_postgres;
