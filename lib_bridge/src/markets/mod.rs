//! # Markets
//!
//! Domain values for portfolio risk and the pure logic over them.

/// Positions, per-unit greeks, and the portfolio snapshot record.
pub mod greeks;
/// Reduces a position list to one `PortfolioSnapshot`.
pub mod aggregator;
/// The daily maintenance window on the upstream source.
pub mod blackout;
