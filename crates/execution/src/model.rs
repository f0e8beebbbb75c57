use market::types::{Money, Price, Qty};
use serde::{Deserialize, Serialize};

use crate::Side;

/// Fill cost model: taker fee plus half-spread plus slippage, all in
/// basis points of the mid price.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionModel {
    pub fee_bps: f64,
    pub spread_bps: f64,
    pub slippage_bps: f64,
}

impl Default for ExecutionModel {
    fn default() -> Self {
        Self {
            fee_bps: 5.0,
            spread_bps: 2.0,
            slippage_bps: 1.0,
        }
    }
}

impl ExecutionModel {
    fn bps_to_ratio(bps: f64) -> f64 {
        (bps.max(0.0)) / 10_000.0
    }

    /// Price a taker actually gets: buys fill above mid, sells below.
    pub fn fill_price(self, side: Side, is_entry: bool, mid: Price) -> Price {
        let half_spread = Self::bps_to_ratio(self.spread_bps) / 2.0;
        let slippage = Self::bps_to_ratio(self.slippage_bps);
        let adverse = half_spread + slippage;
        let buying = match (side, is_entry) {
            (Side::Long, true) | (Side::Short, false) => true,
            (Side::Long, false) | (Side::Short, true) => false,
        };
        if buying {
            Price(mid.0 * (1.0 + adverse))
        } else {
            Price(mid.0 * (1.0 - adverse))
        }
    }

    pub fn fee(self, qty: Qty, fill: Price) -> Money {
        Money(qty.0 * fill.0 * Self::bps_to_ratio(self.fee_bps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ExecutionModel {
        ExecutionModel {
            fee_bps: 10.0,
            spread_bps: 8.0,
            slippage_bps: 2.0,
        }
    }

    #[test]
    fn entries_and_exits_fill_on_the_adverse_side_of_mid() {
        let mid = Price(100.0);
        let m = model();
        assert!(m.fill_price(Side::Long, true, mid).0 > mid.0);
        assert!(m.fill_price(Side::Long, false, mid).0 < mid.0);
        assert!(m.fill_price(Side::Short, true, mid).0 < mid.0);
        assert!(m.fill_price(Side::Short, false, mid).0 > mid.0);
    }

    #[test]
    fn fee_scales_with_notional() {
        let m = model();
        let fee = m.fee(Qty(2.0), Price(100.0));
        assert!((fee.0 - 0.2).abs() < 1e-12);
    }
}
