use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::model::{OrderBookLevel, OrderBookSnapshot, Symbol};

/// Local copies of one symbol's order book on every exchange reporting it.
/// Applies snapshots and deltas to maintain integrity.
#[derive(Debug)]
pub struct BookStore {
    symbol: Symbol,
    books: HashMap<String, LocalBook>,
}

#[derive(Debug)]
struct LocalBook {
    bids: BTreeMap<Decimal, Decimal>, // Price -> Quantity (ASC, iterated in reverse)
    asks: BTreeMap<Decimal, Decimal>, // Price -> Quantity (ASC)
    last_update_id: u64,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl BookStore {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            books: HashMap::new(),
        }
    }

    /// Fold an update into the exchange's book. Returns false when the update
    /// was ignored (wrong symbol, or a delta older than the book).
    pub fn apply(&mut self, update: &OrderBookSnapshot) -> bool {
        if update.symbol != self.symbol {
            return false;
        }

        if update.is_snapshot {
            // Reset and fill
            let book = self.books.entry(update.exchange.clone()).or_insert_with(|| LocalBook {
                bids: BTreeMap::new(),
                asks: BTreeMap::new(),
                last_update_id: 0,
                timestamp: update.timestamp,
            });
            book.bids.clear();
            book.asks.clear();
            for level in &update.bids {
                if !level.quantity.is_zero() {
                    book.bids.insert(level.price, level.quantity);
                }
            }
            for level in &update.asks {
                if !level.quantity.is_zero() {
                    book.asks.insert(level.price, level.quantity);
                }
            }
            book.last_update_id = update.sequence;
            book.timestamp = update.timestamp;
            return true;
        }

        // Deltas only make sense on top of a snapshot.
        let Some(book) = self.books.get_mut(&update.exchange) else {
            debug!(exchange = %update.exchange, symbol = %self.symbol, "Delta before snapshot, ignoring");
            return false;
        };
        if update.sequence <= book.last_update_id {
            debug!(
                exchange = %update.exchange,
                symbol = %self.symbol,
                sequence = update.sequence,
                last = book.last_update_id,
                "Out-of-sequence delta, ignoring"
            );
            return false;
        }
        book.last_update_id = update.sequence;
        book.timestamp = update.timestamp;

        for level in &update.bids {
            if level.quantity.is_zero() {
                book.bids.remove(&level.price);
            } else {
                book.bids.insert(level.price, level.quantity);
            }
        }
        for level in &update.asks {
            if level.quantity.is_zero() {
                book.asks.remove(&level.price);
            } else {
                book.asks.insert(level.price, level.quantity);
            }
        }
        true
    }

    pub fn snapshot(&self, exchange: &str, depth: usize) -> Option<OrderBookSnapshot> {
        let book = self.books.get(exchange)?;
        let bids = book
            .bids
            .iter()
            .rev()
            .take(depth)
            .map(|(p, q)| OrderBookLevel {
                price: *p,
                quantity: *q,
            })
            .collect();
        let asks = book
            .asks
            .iter()
            .take(depth)
            .map(|(p, q)| OrderBookLevel {
                price: *p,
                quantity: *q,
            })
            .collect();

        Some(OrderBookSnapshot {
            exchange: exchange.to_string(),
            symbol: self.symbol.clone(),
            bids,
            asks,
            sequence: book.last_update_id,
            is_snapshot: true,
            timestamp: book.timestamp,
        })
    }

    /// Every exchange's book, keyed by exchange. No cross-venue merge.
    pub fn snapshots(&self, depth: usize) -> BTreeMap<String, OrderBookSnapshot> {
        self.books
            .keys()
            .filter_map(|exchange| Some((exchange.clone(), self.snapshot(exchange, depth)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn level(price: Decimal, quantity: Decimal) -> OrderBookLevel {
        OrderBookLevel { price, quantity }
    }

    fn update(
        exchange: &str,
        sequence: u64,
        is_snapshot: bool,
        bids: Vec<OrderBookLevel>,
        asks: Vec<OrderBookLevel>,
    ) -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: exchange.into(),
            symbol: Symbol::new("BTCUSDT"),
            bids,
            asks,
            sequence,
            is_snapshot,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_then_delta() {
        let mut store = BookStore::new(Symbol::new("BTCUSDT"));
        assert!(store.apply(&update(
            "bybit",
            10,
            true,
            vec![level(dec!(100), dec!(1)), level(dec!(99), dec!(2))],
            vec![level(dec!(101), dec!(1)), level(dec!(102), dec!(3))],
        )));
        assert!(store.apply(&update(
            "bybit",
            11,
            false,
            vec![level(dec!(100), dec!(0)), level(dec!(99.5), dec!(4))],
            vec![level(dec!(100.5), dec!(1))],
        )));

        let book = store.snapshot("bybit", 10).unwrap();
        assert_eq!(book.sequence, 11);
        assert_eq!(book.bids[0], level(dec!(99.5), dec!(4)));
        assert_eq!(book.bids[1], level(dec!(99), dec!(2)));
        assert_eq!(book.asks[0], level(dec!(100.5), dec!(1)));
        assert_eq!(book.asks.len(), 3);
    }

    #[test]
    fn test_stale_delta_ignored() {
        let mut store = BookStore::new(Symbol::new("BTCUSDT"));
        store.apply(&update("bybit", 10, true, vec![level(dec!(100), dec!(1))], vec![]));
        assert!(!store.apply(&update("bybit", 9, false, vec![level(dec!(100), dec!(0))], vec![])));
        assert_eq!(store.snapshot("bybit", 5).unwrap().bids.len(), 1);
    }

    #[test]
    fn test_delta_without_snapshot_ignored() {
        let mut store = BookStore::new(Symbol::new("BTCUSDT"));
        assert!(!store.apply(&update("okx", 1, false, vec![level(dec!(1), dec!(1))], vec![])));
        assert!(store.is_empty());
    }

    #[test]
    fn test_books_kept_per_exchange() {
        let mut store = BookStore::new(Symbol::new("BTCUSDT"));
        store.apply(&update("binance", 1, true, vec![level(dec!(100), dec!(1))], vec![]));
        store.apply(&update("bybit", 1, true, vec![level(dec!(101), dec!(1))], vec![]));
        let all = store.snapshots(1);
        assert_eq!(all.len(), 2);
        assert_eq!(all["binance"].bids[0].price, dec!(100));
        assert_eq!(all["bybit"].bids[0].price, dec!(101));
    }

    #[test]
    fn test_other_symbol_rejected() {
        let mut store = BookStore::new(Symbol::new("ETHUSDT"));
        assert!(!store.apply(&update("binance", 1, true, vec![], vec![])));
    }
}
