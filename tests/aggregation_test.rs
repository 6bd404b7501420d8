//! Market Data Aggregation Tests
//!
//! Best-of-market selection across venues, tie-breaking and subscription
//! lifecycle of the aggregator, driven through paper venues.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use nexus_trader::exchange::{ExchangeAdapter, ExchangeRegistry, PaperAdapter};
use nexus_trader::market_data::{AggregatorConfig, MarketDataAggregator};
use nexus_trader::model::Symbol;

use common::{eventually, ticker};

async fn paper_venues(names: &[&str]) -> (Arc<ExchangeRegistry>, Vec<Arc<PaperAdapter>>) {
    let registry = Arc::new(ExchangeRegistry::new());
    let mut venues = Vec::new();
    for name in names {
        let venue = Arc::new(PaperAdapter::new(*name));
        venue.connect().await.unwrap();
        registry.register(name, venue.clone()).unwrap();
        venues.push(venue);
    }
    (registry, venues)
}

fn btc() -> Symbol {
    Symbol::new("BTCUSDT")
}

#[tokio::test]
async fn test_best_bid_is_max_and_best_ask_is_min() {
    let names = ["alpha", "bravo", "charlie", "delta", "echo"];
    let (registry, venues) = paper_venues(&names).await;
    let aggregator = MarketDataAggregator::new(registry, AggregatorConfig::default());
    let mut sub = aggregator.subscribe(&btc()).await.unwrap();

    let mut rng = rand::thread_rng();
    for round in 0..20 {
        let mut quotes = Vec::new();
        for venue in &venues {
            let bid = Decimal::new(rng.gen_range(99_000..101_000), 2);
            let ask = bid + Decimal::new(rng.gen_range(1..500), 2);
            let qty = Decimal::new(rng.gen_range(1..1_000), 3);
            venue.push_ticker(ticker(bid, qty, ask, qty));
            quotes.push((bid, ask));
        }
        let max_bid = quotes.iter().map(|(b, _)| *b).max().unwrap();
        let min_ask = quotes.iter().map(|(_, a)| *a).min().unwrap();

        // Drain until the view reflects every venue's latest ticker.
        let view = loop {
            let view = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .expect("view published")
                .expect("subscription open");
            let current = names.iter().zip(&quotes).all(|(name, quote)| {
                view.tickers.get(*name).map(|t| (t.bid_price, t.ask_price)) == Some(*quote)
            });
            if current {
                break view;
            }
        };

        assert_eq!(view.best_bid.as_ref().unwrap().price, max_bid, "round {}", round);
        assert_eq!(view.best_ask.as_ref().unwrap().price, min_ask, "round {}", round);
        assert!(!view.stale);
    }

    aggregator.unsubscribe(sub).await;
    println!("✅ Aggregated view always carries max bid and min ask");
}

#[tokio::test]
async fn test_equal_bids_prefer_larger_quantity() {
    let (registry, venues) = paper_venues(&["exchange_a", "exchange_b"]).await;
    let aggregator = MarketDataAggregator::new(registry, AggregatorConfig::default());
    let sub = aggregator.subscribe(&btc()).await.unwrap();

    venues[0].push_ticker(ticker(dec!(100), dec!(1), dec!(101), dec!(1)));
    venues[1].push_ticker(ticker(dec!(100), dec!(2), dec!(101), dec!(1)));

    assert!(
        eventually(Duration::from_secs(2), || {
            aggregator.view(&btc()).map(|v| v.tickers.len()) == Some(2)
        })
        .await
    );
    let view = aggregator.view(&btc()).unwrap();
    let bid = view.best_bid.unwrap();
    assert_eq!(bid.exchange, "exchange_b");
    assert_eq!(bid.quantity, dec!(2));
    // Full tie on the ask side falls back to the exchange name.
    assert_eq!(view.best_ask.unwrap().exchange, "exchange_a");

    aggregator.unsubscribe(sub).await;
    println!("✅ Tie broken by larger quantity");
}

#[tokio::test]
async fn test_last_unsubscribe_stops_streams() {
    let (registry, venues) = paper_venues(&["alpha", "bravo"]).await;
    let aggregator = MarketDataAggregator::new(registry, AggregatorConfig::default());

    let first = aggregator.subscribe(&btc()).await.unwrap();
    let second = aggregator.subscribe(&btc()).await.unwrap();
    let tasks = aggregator.active_task_count();
    assert!(tasks > 0);
    assert_eq!(aggregator.subscriber_count(&btc()), 2);

    aggregator.unsubscribe(first).await;
    assert_eq!(aggregator.active_task_count(), tasks, "one subscriber still listening");

    aggregator.unsubscribe(second).await;
    assert_eq!(aggregator.active_task_count(), 0);
    assert!(aggregator.symbols().is_empty());
    assert!(aggregator.view(&btc()).is_none());
    assert!(
        eventually(Duration::from_secs(1), || {
            venues.iter().all(|v| v.subscription_count() == 0)
        })
        .await,
        "venue streams released"
    );
    println!("✅ Aggregation tasks stop with the last subscriber");
}

#[tokio::test]
async fn test_dropped_subscription_leaks_no_tasks() {
    let (registry, venues) = paper_venues(&["alpha", "bravo"]).await;
    let aggregator = MarketDataAggregator::new(registry, AggregatorConfig::default());

    let sub = aggregator.subscribe(&btc()).await.unwrap();
    assert!(aggregator.active_task_count() > 0);
    drop(sub);
    venues[0].push_ticker(ticker(dec!(100), dec!(1), dec!(101), dec!(1)));

    assert!(
        eventually(Duration::from_secs(1), || aggregator.active_task_count() == 0).await,
        "tasks stop once the only subscription is dropped"
    );
    assert!(aggregator.symbols().is_empty());
    assert!(
        eventually(Duration::from_secs(1), || {
            venues.iter().all(|v| v.subscription_count() == 0)
        })
        .await
    );

    // The symbol can be aggregated again afterwards.
    let again = aggregator.subscribe(&btc()).await.unwrap();
    assert!(aggregator.active_task_count() > 0);
    aggregator.unsubscribe(again).await;
    assert_eq!(aggregator.active_task_count(), 0);
    println!("✅ Dropped subscription releases aggregation tasks");
}
