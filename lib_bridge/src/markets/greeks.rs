//! # Positions and Greeks
//!
//! Held positions as the transports report them, per-unit greeks, and the
//! portfolio record written once per cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Contract literal identifying a whole-portfolio aggregate row.
pub const PORTFOLIO_CONTRACT: &str = "PORTFOLIO";

/// Asset class of a held position, as reported by the upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    Option,
    FutureOption,
    Stock,
    Future,
    Other,
}

impl SecurityType {
    /// Maps upstream asset-class codes (`OPT`, `FOP`, `STK`, `FUT`).
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "OPT" => SecurityType::Option,
            "FOP" => SecurityType::FutureOption,
            "STK" => SecurityType::Stock,
            "FUT" => SecurityType::Future,
            _ => SecurityType::Other,
        }
    }

    /// Whether greeks have to be requested from the source's option model.
    pub fn is_option(&self) -> bool {
        matches!(self, SecurityType::Option | SecurityType::FutureOption)
    }

    /// Multiplier used when the source omits one (or reports zero).
    pub fn default_multiplier(&self) -> f64 {
        match self {
            SecurityType::Option => 100.0,
            _ => 1.0,
        }
    }
}

/// Delta, gamma, vega, theta. Per unit on a `Position`, position-scaled
/// once aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
}

impl Greeks {
    pub fn scaled(&self, factor: f64) -> Greeks {
        Greeks {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            vega: self.vega * factor,
            theta: self.theta * factor,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.delta.is_finite() && self.gamma.is_finite() && self.vega.is_finite() && self.theta.is_finite()
    }
}

impl AddAssign for Greeks {
    fn add_assign(&mut self, rhs: Greeks) {
        self.delta += rhs.delta;
        self.gamma += rhs.gamma;
        self.vega += rhs.vega;
        self.theta += rhs.theta;
    }
}

/// One held position as read from a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Upstream contract id, used to key greeks lookups.
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: SecurityType,
    /// Signed: negative for short positions.
    pub quantity: f64,
    pub multiplier: f64,
    /// Per-unit model greeks. `None` for an option means the model did not
    /// populate in time; ignored for non-options.
    pub greeks: Option<Greeks>,
    pub underlying_price: Option<f64>,
}

impl Position {
    /// This position's scaled contribution to the portfolio totals.
    ///
    /// Options: per-unit greeks × quantity × multiplier, `None` if greeks are
    /// missing. Stocks and futures: delta = signed quantity. Anything else
    /// contributes nothing.
    pub fn contribution(&self) -> Option<Greeks> {
        match self.sec_type {
            SecurityType::Option | SecurityType::FutureOption => {
                self.greeks.map(|g| g.scaled(self.quantity * self.multiplier))
            }
            SecurityType::Stock | SecurityType::Future => Some(Greeks {
                delta: self.quantity,
                ..Greeks::default()
            }),
            SecurityType::Other => Some(Greeks::default()),
        }
    }
}

/// # Portfolio Snapshot
///
/// One whole-portfolio greeks record per snapshot cycle. Immutable once
/// built; `underlying_price` stays `None` rather than defaulting to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub timestamp: DateTime<Utc>,
    pub contract: String,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub underlying_price: Option<f64>,
}

impl PortfolioSnapshot {
    pub fn greeks(&self) -> Greeks {
        Greeks {
            delta: self.delta,
            gamma: self.gamma,
            vega: self.vega,
            theta: self.theta,
        }
    }

    /// All numeric fields are finite; non-finite values are a malformed row.
    pub fn is_well_formed(&self) -> bool {
        self.greeks().is_finite() && self.underlying_price.map_or(true, f64::is_finite)
    }
}
