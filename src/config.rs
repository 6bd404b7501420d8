use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub use config::ConfigError;

use crate::model::Symbol;
use crate::risk::RiskLimits;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    /// Keyed by adapter name; the key doubles as the registry name.
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

/// Scheduler and aggregation tuning. All durations are milliseconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent_bots: usize,
    pub execution_interval_ms: u64,
    pub order_timeout_ms: u64,
    /// Total attempts per order, including the first.
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub performance_update_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_consecutive_failures: u32,
    pub freshness_window_ms: u64,
    pub subscriber_capacity: usize,
    pub connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_bots: 4,
            execution_interval_ms: 1_000,
            order_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_base_delay_ms: 100,
            performance_update_interval_ms: 60_000,
            health_check_interval_ms: 10_000,
            max_consecutive_failures: 5,
            freshness_window_ms: 5_000,
            subscriber_capacity: 256,
            connect_timeout_ms: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn execution_interval(&self) -> Duration {
        Duration::from_millis(self.execution_interval_ms)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn performance_update_interval(&self) -> Duration {
        Duration::from_millis(self.performance_update_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_bots == 0 {
            return Err(ConfigError::Message(
                "engine.max_concurrent_bots must be at least 1".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Message(
                "engine.retry_attempts counts the first attempt and must be at least 1".into(),
            ));
        }
        if self.execution_interval_ms == 0 || self.order_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "engine intervals and timeouts must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Bybit,
    Paper,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExchangeConfig {
    /// Adapter implementation; defaults to the map key when it names one.
    pub kind: Option<ExchangeKind>,

    pub api_key: Option<String>,
    #[serde(alias = "secret_key")]
    pub api_secret: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub testnet: bool,

    pub rest_url: Option<String>,
    pub ws_url: Option<String>,

    /// REST requests per second.
    pub rate_limit: Option<u32>,
    pub burst: Option<u32>,
    pub recv_window_ms: Option<u64>,
    pub stream_capacity: Option<usize>,
    /// Bybit product category (`linear`, `spot`).
    pub category: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ExchangeConfig {
    pub fn resolve_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.kind.or_else(|| match name.to_lowercase().as_str() {
            "binance" => Some(ExchangeKind::Binance),
            "bybit" => Some(ExchangeKind::Bybit),
            "paper" => Some(ExchangeKind::Paper),
            _ => None,
        })
    }

    /// Configured key, falling back to `<NAME>_API_KEY` in the environment.
    pub fn api_key_for(&self, name: &str) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| env::var(format!("{}_API_KEY", name.to_uppercase())).ok())
    }

    pub fn api_secret_for(&self, name: &str) -> Option<String> {
        self.api_secret
            .clone()
            .or_else(|| env::var(format!("{}_SECRET_KEY", name.to_uppercase())).ok())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    pub id: String,
    pub strategy: String,
    pub symbols: Vec<Symbol>,
    /// First entry is the default venue for intents without one.
    #[serde(default)]
    pub exchanges: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Opaque strategy parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl BotConfig {
    pub fn new(id: impl Into<String>, strategy: impl Into<String>, symbols: Vec<Symbol>) -> Self {
        Self {
            id: id.into(),
            strategy: strategy.into(),
            symbols,
            exchanges: Vec::new(),
            enabled: true,
            params: serde_json::Value::Null,
        }
    }

    pub fn on_exchanges(mut self, exchanges: &[&str]) -> Self {
        self.exchanges = exchanges.iter().map(|e| e.to_lowercase()).collect();
        self
    }
}

impl Settings {
    /// Layered load: `config/default`, `config/local`, then `NEXUS__*`
    /// environment overrides (e.g. `NEXUS__ENGINE__MAX_CONCURRENT_BOTS`).
    pub fn new() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let config_dir = env::var("NEXUS_CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let settings: Settings = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            .add_source(
                Environment::with_prefix("NEXUS")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.engine.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.engine.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_when_empty() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.engine.max_concurrent_bots, 4);
        assert_eq!(settings.engine.retry_attempts, 3);
        assert!(settings.exchanges.is_empty());
        assert!(settings.bots.is_empty());
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
            [engine]
            max_concurrent_bots = 2
            order_timeout_ms = 750

            [risk]
            max_position_size = 2.5
            max_order_notional = 10000

            [exchanges.binance]
            api_key = "key"
            secret_key = "secret"
            testnet = true
            rate_limit = 20

            [exchanges.sim]
            kind = "paper"

            [[bots]]
            id = "grid-1"
            strategy = "observe"
            symbols = ["btc/usdt", "ETH-USDT"]
            exchanges = ["binance"]
        "#;
        let settings = Settings::from_toml_str(raw).unwrap();
        assert_eq!(settings.engine.max_concurrent_bots, 2);
        assert_eq!(settings.engine.order_timeout(), Duration::from_millis(750));
        assert_eq!(settings.engine.retry_attempts, 3);
        assert_eq!(settings.risk.max_position_size, dec!(2.5));

        let binance = &settings.exchanges["binance"];
        assert_eq!(binance.api_key.as_deref(), Some("key"));
        assert_eq!(binance.api_secret.as_deref(), Some("secret"));
        assert_eq!(binance.rate_limit, Some(20));
        assert!(binance.enabled);
        assert_eq!(binance.resolve_kind("binance"), Some(ExchangeKind::Binance));
        assert_eq!(
            settings.exchanges["sim"].resolve_kind("sim"),
            Some(ExchangeKind::Paper)
        );

        let bot = &settings.bots[0];
        assert_eq!(bot.symbols, vec![Symbol::new("BTCUSDT"), Symbol::new("ETHUSDT")]);
        assert!(bot.enabled);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = Settings::from_toml_str("[engine]\nmax_concurrent_bots = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_concurrent_bots"));
    }

    #[test]
    fn test_unknown_kind_is_unresolved() {
        let cfg = ExchangeConfig::default();
        assert_eq!(cfg.resolve_kind("kraken"), None);
        assert_eq!(cfg.resolve_kind("Bybit"), Some(ExchangeKind::Bybit));
    }
}
