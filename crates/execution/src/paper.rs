//! In-memory executor with leverage and margin accounting.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use chrono::Utc;

use market::types::{Money, Price, Qty};

use crate::model::ExecutionModel;
use crate::{AccountSnapshot, Execution, Fill, Position, Side};

#[derive(Debug)]
struct Book {
    cash: Money,
    peak_equity: Money,
    positions: HashMap<String, Position>,
    marks: HashMap<String, Price>,
}

impl Book {
    fn mark_for(&self, p: &Position) -> Price {
        self.marks.get(&p.symbol).copied().unwrap_or(p.entry_price)
    }

    fn equity(&self) -> Money {
        let unrealized: f64 = self
            .positions
            .values()
            .map(|p| p.unrealized(self.mark_for(p)).0)
            .sum();
        Money(self.cash.0 + unrealized)
    }

    fn used_margin(&self, leverage: f64) -> Money {
        let notional: f64 = self.positions.values().map(|p| p.notional().0).sum();
        Money(notional / leverage)
    }
}

pub struct PaperExecutor {
    model: ExecutionModel,
    leverage: f64,
    book: Mutex<Book>,
}

impl PaperExecutor {
    pub fn new(starting_cash: Money, leverage: f64, model: ExecutionModel) -> Self {
        Self {
            model,
            leverage: leverage.max(1.0),
            book: Mutex::new(Book {
                cash: starting_cash,
                peak_equity: starting_cash,
                positions: HashMap::new(),
                marks: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Book> {
        // lock poisoning only happens after a panic elsewhere; recover
        // the data rather than cascading
        match self.book.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }
}

impl Execution for PaperExecutor {
    fn open(&self, symbol: &str, side: Side, qty: Qty, price: Price) -> Result<Fill> {
        if qty.0 <= 0.0 || price.0 <= 0.0 {
            bail!("rejected order for {symbol}: non-positive qty or price");
        }

        let mut book = self.lock();
        if book.positions.contains_key(symbol) {
            bail!("position already open in {symbol}");
        }

        let fill_price = self.model.fill_price(side, true, price);
        let fee = self.model.fee(qty, fill_price);
        let margin = Money((qty * fill_price).0 / self.leverage);

        let available = book.equity().0 - book.used_margin(self.leverage).0;
        if margin.0 + fee.0 > available {
            bail!(
                "insufficient margin for {symbol}: need {:.2}, have {:.2}",
                margin.0 + fee.0,
                available
            );
        }

        let at = Utc::now();
        book.cash = book.cash - fee;
        book.marks.insert(symbol.to_string(), price);
        book.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                side,
                qty,
                entry_price: fill_price,
                opened_at: at,
            },
        );

        Ok(Fill {
            symbol: symbol.to_string(),
            side,
            qty,
            price: fill_price,
            fee,
            at,
        })
    }

    fn close(&self, symbol: &str, price: Price) -> Result<Option<Fill>> {
        let mut book = self.lock();
        let Some(pos) = book.positions.remove(symbol) else {
            return Ok(None);
        };

        let fill_price = self.model.fill_price(pos.side, false, price);
        let fee = self.model.fee(pos.qty, fill_price);
        let pnl = pos.unrealized(fill_price);

        book.cash = Money(book.cash.0 + pnl.0 - fee.0);
        book.marks.insert(symbol.to_string(), price);
        let equity = book.equity();
        if equity.0 > book.peak_equity.0 {
            book.peak_equity = equity;
        }

        Ok(Some(Fill {
            symbol: symbol.to_string(),
            side: pos.side.opposite(),
            qty: pos.qty,
            price: fill_price,
            fee,
            at: Utc::now(),
        }))
    }

    fn position(&self, symbol: &str) -> Option<Position> {
        self.lock().positions.get(symbol).cloned()
    }

    fn account(&self) -> AccountSnapshot {
        let mut book = self.lock();
        let equity = book.equity();
        if equity.0 > book.peak_equity.0 {
            book.peak_equity = equity;
        }
        let used_margin = book.used_margin(self.leverage);
        AccountSnapshot {
            equity,
            peak_equity: book.peak_equity,
            used_margin,
            available: Money(equity.0 - used_margin.0),
        }
    }

    fn mark(&self, symbol: &str, price: Price) {
        if price.0 > 0.0 {
            self.lock().marks.insert(symbol.to_string(), price);
        }
    }
}
