use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{Side, Symbol};

/// Quantity reserved by an order that has been allowed but not yet filled.
#[derive(Debug, Clone, PartialEq)]
pub struct Commitment {
    pub symbol: Symbol,
    pub side: Side,
    pub remaining: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolExposure {
    pub symbol: Symbol,
    /// Signed filled position, positive long.
    pub position: Decimal,
    /// Signed quantity reserved by open orders.
    pub committed: Decimal,
}

impl SymbolExposure {
    pub fn projected(&self) -> Decimal {
        self.position + self.committed
    }
}

/// Net positions plus open commitments. Not synchronised; the risk gate
/// owns it behind a single lock.
#[derive(Debug, Default)]
pub struct ExposureBook {
    positions: HashMap<Symbol, Decimal>,
    commitments: HashMap<String, Commitment>,
}

impl ExposureBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, symbol: &Symbol) -> Decimal {
        self.positions.get(symbol).copied().unwrap_or_default()
    }

    pub fn set_position(&mut self, symbol: Symbol, quantity: Decimal) {
        if quantity.is_zero() {
            self.positions.remove(&symbol);
        } else {
            self.positions.insert(symbol, quantity);
        }
    }

    /// Signed sum of remaining commitments for `symbol`.
    pub fn committed(&self, symbol: &Symbol) -> Decimal {
        self.commitments
            .values()
            .filter(|c| &c.symbol == symbol)
            .map(|c| c.side.sign() * c.remaining)
            .sum()
    }

    pub fn exposure(&self, symbol: &Symbol) -> SymbolExposure {
        SymbolExposure {
            symbol: symbol.clone(),
            position: self.position(symbol),
            committed: self.committed(symbol),
        }
    }

    pub fn has_commitment(&self, client_id: &str) -> bool {
        self.commitments.contains_key(client_id)
    }

    pub fn reserve(&mut self, client_id: String, commitment: Commitment) {
        self.commitments.insert(client_id, commitment);
    }

    /// Moves `quantity` from the order's commitment into the position.
    /// Fills for unknown orders still move the position.
    pub fn apply_fill(&mut self, client_id: &str, symbol: &Symbol, side: Side, quantity: Decimal) {
        if let Some(c) = self.commitments.get_mut(client_id) {
            c.remaining -= quantity;
            if c.remaining <= Decimal::ZERO {
                self.commitments.remove(client_id);
            }
        }
        let next = self.position(symbol) + side.sign() * quantity;
        self.set_position(symbol.clone(), next);
    }

    pub fn release(&mut self, client_id: &str) -> Option<Commitment> {
        self.commitments.remove(client_id)
    }

    pub fn open_commitments(&self) -> usize {
        self.commitments.len()
    }

    pub fn snapshot(&self) -> Vec<SymbolExposure> {
        let mut symbols: Vec<&Symbol> = self
            .positions
            .keys()
            .chain(self.commitments.values().map(|c| &c.symbol))
            .collect();
        symbols.sort();
        symbols.dedup();
        symbols.into_iter().map(|s| self.exposure(s)).collect()
    }
}
