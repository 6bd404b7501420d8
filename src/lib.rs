pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod engine;
pub mod events;
pub mod exchange;
pub mod market_data;
pub mod metrics;
pub mod model;
pub mod order_fsm;
pub mod rate_limiter;
pub mod risk;
pub mod staleness;
pub mod status;
pub mod strategy;
