//! # Greeks Aggregator
//!
//! Pure reduction of a position list to one `PortfolioSnapshot`. No I/O.

use chrono::{DateTime, Utc};

use super::greeks::{Greeks, PortfolioSnapshot, Position, PORTFOLIO_CONTRACT};

/// Result of one aggregation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub snapshot: PortfolioSnapshot,
    /// Symbols of option positions whose greeks were missing and therefore
    /// contributed zero.
    pub missing_greeks: Vec<String>,
}

impl Aggregation {
    pub fn is_degraded(&self) -> bool {
        !self.missing_greeks.is_empty()
    }
}

/// Sums each position's scaled contribution into a portfolio snapshot.
///
/// Scaling by quantity and multiplier happens per position, before the sum.
/// `underlying_price` is carried only when every position reports one; the
/// first position's value is used.
pub fn aggregate(positions: &[Position], timestamp: DateTime<Utc>) -> Aggregation {
    let mut total = Greeks::default();
    let mut missing_greeks = Vec::new();

    for position in positions {
        match position.contribution() {
            Some(c) => total += c,
            None => missing_greeks.push(position.symbol.clone()),
        }
    }

    let underlying_price = if positions.iter().all(|p| p.underlying_price.is_some()) {
        positions.first().and_then(|p| p.underlying_price)
    } else {
        None
    };

    Aggregation {
        snapshot: PortfolioSnapshot {
            timestamp,
            contract: PORTFOLIO_CONTRACT.to_string(),
            delta: total.delta,
            gamma: total.gamma,
            vega: total.vega,
            theta: total.theta,
            underlying_price,
        },
        missing_greeks,
    }
}
