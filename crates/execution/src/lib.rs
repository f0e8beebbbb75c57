//! Order execution surface.
//!
//! The orchestrator only ever talks to the [`Execution`] trait; the
//! in-crate [`paper::PaperExecutor`] fills against a cost model so the
//! whole controller can run without touching an exchange.

pub mod model;
pub mod paper;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use market::types::{Money, Price, Qty};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub qty: Qty,
    pub price: Price,
    pub fee: Money,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub qty: Qty,
    pub entry_price: Price,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn notional(&self) -> Money {
        self.qty * self.entry_price
    }

    /// Unrealized PnL at `mark`, before exit costs
    pub fn unrealized(&self, mark: Price) -> Money {
        let diff = match self.side {
            Side::Long => mark.0 - self.entry_price.0,
            Side::Short => self.entry_price.0 - mark.0,
        };
        Money(diff * self.qty.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Cash plus unrealized PnL
    pub equity: Money,
    /// Highest equity seen, for drawdown tracking
    pub peak_equity: Money,
    pub used_margin: Money,
    pub available: Money,
}

/// What the orchestrator needs from an execution venue. Implementations
/// must be internally synchronized; the trait is called from several
/// workers at once.
pub trait Execution: Send + Sync {
    fn open(&self, symbol: &str, side: Side, qty: Qty, price: Price) -> Result<Fill>;

    /// Closes the position in `symbol` if one is open.
    fn close(&self, symbol: &str, price: Price) -> Result<Option<Fill>>;

    fn position(&self, symbol: &str) -> Option<Position>;

    fn account(&self) -> AccountSnapshot;

    /// Price update hook for mark-to-market. No-op by default.
    fn mark(&self, _symbol: &str, _price: Price) {}
}
