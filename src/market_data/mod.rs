pub mod aggregator;
pub mod book_store;
pub mod heartbeat;
pub mod view;

pub use aggregator::{
    AggregatorConfig, AggregatorError, MarketDataAggregator, SymbolLease, ViewSubscription,
};
pub use heartbeat::HeartbeatMonitor;
pub use view::{AggregatedView, BestQuote};
